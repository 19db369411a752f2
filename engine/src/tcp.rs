use core::fmt::{self, Debug, Display};
use core::net::Ipv4Addr;

use bilge::prelude::*;

/// The TCP control-bits byte.
#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
pub struct Control {
	/// No more data from sender.
	fin: bool,
	/// Synchronize sequence numbers.
	syn: bool,
	/// Reset the connection.
	rst: bool,
	/// Push function.
	psh: bool,
	/// Acknowledgment field is significant.
	ack: bool,
	/// Urgent pointer field is significant.
	urg: bool,
	reserved: u2,
}

/// The control bits the engine acts on.
///
/// PSH and URG are accepted on the wire but carry no meaning here.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Ctl {
	pub ack: bool,
	pub syn: bool,
	pub fin: bool,
	pub rst: bool,
}

impl Ctl {
	/// Dispatch key for the state machine: `ack | syn << 1 | fin << 2 | rst << 3`.
	pub fn bits(self) -> u8 {
		self.ack as u8 | (self.syn as u8) << 1 | (self.fin as u8) << 2 | (self.rst as u8) << 3
	}
}

impl From<Control> for Ctl {
	fn from(c: Control) -> Self {
		Self { ack: c.ack(), syn: c.syn(), fin: c.fin(), rst: c.rst() }
	}
}

/// Per-segment metadata extracted while the checksum is verified.
#[derive(Clone, Copy, Default, Debug)]
pub struct SegmentMeta {
	/// Sequence number of the first payload octet.
	pub seq: u32,
	/// Acknowledgment number; meaningful when `ctl.ack` is set.
	pub ack: u32,
	/// The peer's receive window.
	pub win: u16,
	/// Payload bytes in the segment (header already subtracted).
	pub len: u16,
	pub ctl: Ctl,
}

/// Connection identifier, stored in network byte order as received.
///
/// The low byte of each field is the first byte off the wire; conversion to
/// host order happens only at the application boundary.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FourTuple {
	pub src_ip: u32,
	pub dst_ip: u32,
	pub src_port: u16,
	pub dst_port: u16,
}

impl FourTuple {
	/// The tuple of the reply direction.
	pub fn swapped(self) -> Self {
		Self {
			src_ip: self.dst_ip,
			dst_ip: self.src_ip,
			src_port: self.dst_port,
			dst_port: self.src_port,
		}
	}

	pub fn src_addr(self) -> Ipv4Addr {
		Ipv4Addr::from(self.src_ip.swap_bytes())
	}

	pub fn dst_addr(self) -> Ipv4Addr {
		Ipv4Addr::from(self.dst_ip.swap_bytes())
	}
}

impl Display for FourTuple {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}:{} -> {}:{}",
			self.src_addr(),
			self.src_port.swap_bytes(),
			self.dst_addr(),
			self.dst_port.swap_bytes()
		)
	}
}

impl Debug for FourTuple {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		<Self as Display>::fmt(self, f)
	}
}

/// Connection states of RFC 793.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum TcpState {
	/// No connection state at all.
	#[default]
	Closed,
	/// Waiting for a connection request from any remote peer.
	Listen,
	/// Waiting for a matching connection request after having sent one.
	SynSent,
	/// Waiting for the acknowledgment of a connection request that was both
	/// received and answered.
	SynReceived,
	/// An open connection; the normal data-transfer state.
	Established,
	/// Waiting for a termination request from the peer, or for the
	/// acknowledgment of the one already sent.
	FinWait1,
	/// Waiting for a termination request from the peer.
	FinWait2,
	/// Waiting for a termination request from the local user.
	CloseWait,
	/// Waiting for the peer's acknowledgment of a termination request after
	/// both sides requested termination.
	Closing,
	/// Waiting for the acknowledgment of the termination request sent last.
	LastAck,
	/// Waiting out delayed segments of the closed connection.
	TimeWait,
}

impl TcpState {
	/// States in which an arriving ACK advances the connection. The
	/// remaining states answer a bare ACK with a reset.
	pub fn synchronized(self) -> bool {
		matches!(
			self,
			TcpState::Established | TcpState::SynReceived | TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
		)
	}
}

/// One segment's worth of work for the state machine.
#[derive(Clone, Copy, Debug)]
pub struct WorkItem {
	pub session: u16,
	/// Source address in host order, for application notifications.
	pub src_ip: Ipv4Addr,
	/// Destination port in host order.
	pub dst_port: u16,
	pub meta: SegmentMeta,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn control_bits() {
		let c = Control::from(0b0001_0010);
		assert!(c.syn() && c.ack());
		assert!(!c.fin() && !c.rst());

		let ctl = Ctl::from(c);
		assert_eq!(ctl.bits(), 0b0011);

		let fin_ack = Ctl { ack: true, fin: true, ..Default::default() };
		assert_eq!(fin_ack.bits(), 0b0101);
	}

	#[test]
	fn tuple_order() {
		// 10.0.0.1:4660 -> 10.0.0.2:80, as the bytes arrive.
		let tuple = FourTuple {
			src_ip: u32::from_le_bytes([10, 0, 0, 1]),
			dst_ip: u32::from_le_bytes([10, 0, 0, 2]),
			src_port: u16::from_le_bytes([0x12, 0x34]),
			dst_port: u16::from_le_bytes([0, 80]),
		};

		assert_eq!(tuple.src_addr(), Ipv4Addr::new(10, 0, 0, 1));
		assert_eq!(tuple.to_string(), "10.0.0.1:4660 -> 10.0.0.2:80");

		let reply = tuple.swapped();
		assert_eq!(reply.src_port, tuple.dst_port);
		assert_eq!(reply.dst_ip, tuple.src_ip);
	}
}
