//! Messages exchanged with the services the engine queries per segment: the
//! state table, the RX/TX-SAR records, the session lookup, the timers and
//! the memory fabric. The services themselves live outside this crate; each
//! request on a queue is answered by exactly one response, in order.

use core::net::Ipv4Addr;

use crate::tcp::{FourTuple, TcpState};

/// State-table access.
///
/// A read takes the per-session lock; the engine releases it with the next
/// write to the same session, even when the state did not change.
#[derive(Clone, Copy, Debug)]
pub struct StateQuery {
	pub session: u16,
	/// `None` reads and locks, `Some` writes and releases.
	pub write: Option<TcpState>,
}

impl StateQuery {
	pub fn read(session: u16) -> Self {
		Self { session, write: None }
	}

	pub fn write(session: u16, state: TcpState) -> Self {
		Self { session, write: Some(state) }
	}
}

/// RX-SAR table access.
#[derive(Clone, Copy, Debug)]
pub struct RxSarUpdate {
	pub session: u16,
	pub recvd: u32,
	pub write: bool,
	/// Also seed the application read pointer (connection setup).
	pub init: bool,
}

impl RxSarUpdate {
	pub fn read(session: u16) -> Self {
		Self { session, recvd: 0, write: false, init: false }
	}

	pub fn write(session: u16, recvd: u32) -> Self {
		Self { session, recvd, write: true, init: false }
	}

	pub fn init(session: u16, recvd: u32) -> Self {
		Self { session, recvd, write: true, init: true }
	}
}

/// Receive-side view of a session's RX-SAR record.
#[derive(Clone, Copy, Default, Debug)]
pub struct RxSarEntry {
	/// Next byte expected from the peer.
	pub recvd: u32,
	/// Low half of the application read pointer; bounds the free space left
	/// in the session's receive ring.
	pub appd: u16,
}

/// TX-SAR table access from the receive path.
#[derive(Clone, Copy, Debug)]
pub struct TxSarUpdate {
	pub session: u16,
	pub ack: u32,
	pub win: u16,
	pub cong_window: u16,
	pub count: u8,
	pub fast_retransmitted: bool,
	pub write: bool,
}

impl TxSarUpdate {
	pub fn read(session: u16) -> Self {
		Self { session, ack: 0, win: 0, cong_window: 0, count: 0, fast_retransmitted: false, write: false }
	}

	pub fn write(session: u16, ack: u32, win: u16, cong_window: u16, count: u8, fast_retransmitted: bool) -> Self {
		Self { session, ack, win, cong_window, count, fast_retransmitted, write: true }
	}
}

/// What the TX-SAR table reports back.
#[derive(Clone, Copy, Default, Debug)]
pub struct TxSarReply {
	/// Highest acknowledgment seen from the peer so far.
	pub prev_ack: u32,
	/// Next byte the transmit path will send.
	pub next_byte: u32,
	pub cong_window: u16,
	pub slowstart_threshold: u16,
	/// Duplicate-ACK counter.
	pub count: u8,
	pub fast_retransmitted: bool,
}

/// Session-table lookup for a connection tuple.
#[derive(Clone, Copy, Debug)]
pub struct SessionLookupQuery {
	pub tuple: FourTuple,
	/// A new entry may be created only for a pure SYN.
	pub allow_creation: bool,
}

/// Lookup result; `session` is meaningful only on a hit.
#[derive(Clone, Copy, Default, Debug)]
pub struct SessionLookupReply {
	pub hit: bool,
	pub session: u16,
}

/// Retransmit-timer clear issued for every acknowledgment.
#[derive(Clone, Copy, Debug)]
pub struct RetransmitTimerUpdate {
	pub session: u16,
	/// Everything outstanding is acknowledged; stop instead of rearming.
	pub stop: bool,
}

/// Outcome of an active open, reported once per connection attempt.
#[derive(Clone, Copy, Debug)]
pub struct OpenStatus {
	pub session: u16,
	pub success: bool,
}

/// Write command for the memory fabric.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct MemCommand {
	pub address: u32,
	pub bytes: u16,
}

impl MemCommand {
	/// Each session owns a 64 KiB ring in the receive buffer; the segment's
	/// sequence number is its offset within the ring.
	pub fn new(session: u16, seq: u32, bytes: u16) -> Self {
		Self { address: ((session & 0x3FFF) as u32) << 16 | seq & 0xFFFF, bytes }
	}
}

/// Completion report of one physical memory write.
#[derive(Clone, Copy, Debug)]
pub struct MemStatus {
	pub okay: bool,
}

/// What the application is told about a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppNotification {
	pub session: u16,
	/// New payload bytes available, or zero for a pure close/reset.
	pub length: u16,
	pub src_ip: Ipv4Addr,
	pub dst_port: u16,
	/// The peer closed or reset the connection.
	pub closed: bool,
}

impl AppNotification {
	pub fn data(session: u16, length: u16, src_ip: Ipv4Addr, dst_port: u16, closed: bool) -> Self {
		Self { session, length, src_ip, dst_port, closed }
	}

	pub fn close(session: u16, src_ip: Ipv4Addr, dst_port: u16) -> Self {
		Self { session, length: 0, src_ip, dst_port, closed: true }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_addressing() {
		let cmd = MemCommand::new(3, 0x0001_2000, 50);
		assert_eq!(cmd.address, 0x0003_2000);
		assert_eq!(cmd.bytes, 50);

		// Only the low 14 bits of the session reach the address.
		let cmd = MemCommand::new(0xC005, 0xFFFF_FFF0, 8);
		assert_eq!(cmd.address, 0x0005_FFF0);
	}
}
