use crossbeam_channel::{Receiver, Sender};
use runtime::Stage;

use crate::tcp::FourTuple;

/// Who a reset is aimed at.
///
/// Before a session exists (closed port, failed lookup) there is no id to
/// name, so the reply tuple travels with the event instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RstTarget {
	Session(u16),
	Tuple(FourTuple),
}

/// Outbound events handed to the event engine on the transmit side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
	/// Acknowledge received data; may be coalesced with later ACKs.
	Ack { session: u16 },
	/// Acknowledge immediately, without delayed-ACK coalescing.
	AckNoDelay { session: u16 },
	/// Answer a connection request.
	SynAck { session: u16, retransmit: bool },
	/// Start closing our half of the connection.
	Fin { session: u16 },
	/// Trigger a retransmit of unacknowledged data.
	Retransmit { session: u16 },
	/// Reset the connection, with the sequence number the reset claims.
	Rst { target: RstTarget, seq: u32 },
}

/// Multiplexes the metadata handler's events and the state machine's events
/// onto the single outbound stream. The metadata handler wins ties so that
/// pre-session resets are not starved by a busy connection.
pub struct EventMerger {
	first: Receiver<Event>,
	second: Receiver<Event>,
	output: Sender<Event>,
}

impl EventMerger {
	pub fn new(first: Receiver<Event>, second: Receiver<Event>, output: Sender<Event>) -> Self {
		Self { first, second, output }
	}
}

impl Stage for EventMerger {
	fn step(&mut self) -> bool {
		if self.output.is_full() {
			return false;
		}

		let Ok(event) = self.first.try_recv().or_else(|_| self.second.try_recv()) else {
			return false;
		};

		self.output.try_send(event).is_ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crossbeam_channel::bounded;

	#[test]
	fn first_input_wins() {
		let (first_tx, first) = bounded(4);
		let (second_tx, second) = bounded(4);
		let (out_tx, out) = bounded(4);
		let mut merger = EventMerger::new(first, second, out_tx);

		second_tx.send(Event::Ack { session: 1 }).unwrap();
		first_tx.send(Event::Fin { session: 2 }).unwrap();

		while merger.step() {}

		assert_eq!(out.try_recv().unwrap(), Event::Fin { session: 2 });
		assert_eq!(out.try_recv().unwrap(), Event::Ack { session: 1 });
		assert!(out.try_recv().is_err());
	}
}
