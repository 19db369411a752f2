use crossbeam_channel::{Receiver, Sender};
use log::debug;
use runtime::Stage;

use crate::word::Word;

enum Verdict {
	Pending,
	Forward,
	Drop,
}

/// Drops the payload of segments whose checksum did not hold.
///
/// One flag arrives per payload-carrying segment; control segments send no
/// flag and no payload, so they pass through here without a trace.
pub struct InvalidDropper {
	input: Receiver<Word>,
	valid: Receiver<bool>,
	output: Sender<Word>,
	state: Verdict,
}

impl InvalidDropper {
	pub fn new(input: Receiver<Word>, valid: Receiver<bool>, output: Sender<Word>) -> Self {
		Self { input, valid, output, state: Verdict::Pending }
	}
}

impl Stage for InvalidDropper {
	fn step(&mut self) -> bool {
		match self.state {
			Verdict::Pending => {
				let Ok(ok) = self.valid.try_recv() else { return false };
				self.state = if ok { Verdict::Forward } else { Verdict::Drop };
			}
			Verdict::Forward => {
				if self.output.is_full() {
					return false;
				}
				let Ok(word) = self.input.try_recv() else { return false };
				if word.last {
					self.state = Verdict::Pending;
				}
				self.output.try_send(word).ok();
			}
			Verdict::Drop => {
				let Ok(word) = self.input.try_recv() else { return false };
				if word.last {
					self.state = Verdict::Pending;
				}
			}
		}

		true
	}
}

enum Gate {
	First,
	Second,
	Forward,
	Drop,
}

/// Applies the two per-segment drop decisions to the payload stream.
///
/// The metadata handler rules first (closed port, no session); only if it
/// passes is the state machine's verdict consulted. A segment that the first
/// flag condemns never produced a second flag, so the streams stay paired.
pub struct PayloadDropper {
	input: Receiver<Word>,
	meta_drop: Receiver<bool>,
	fsm_drop: Receiver<bool>,
	output: Sender<Word>,
	state: Gate,
}

impl PayloadDropper {
	pub fn new(input: Receiver<Word>, meta_drop: Receiver<bool>, fsm_drop: Receiver<bool>, output: Sender<Word>) -> Self {
		Self { input, meta_drop, fsm_drop, output, state: Gate::First }
	}
}

impl Stage for PayloadDropper {
	fn step(&mut self) -> bool {
		match self.state {
			Gate::First => {
				let Ok(drop) = self.meta_drop.try_recv() else { return false };
				self.state = if drop { Gate::Drop } else { Gate::Second };
			}
			Gate::Second => {
				let Ok(drop) = self.fsm_drop.try_recv() else { return false };
				if drop {
					debug!("discarding payload on state-machine verdict");
				}
				self.state = if drop { Gate::Drop } else { Gate::Forward };
			}
			Gate::Forward => {
				if self.output.is_full() {
					return false;
				}
				let Ok(word) = self.input.try_recv() else { return false };
				if word.last {
					self.state = Gate::First;
				}
				self.output.try_send(word).ok();
			}
			Gate::Drop => {
				let Ok(word) = self.input.try_recv() else { return false };
				if word.last {
					self.state = Gate::First;
				}
			}
		}

		true
	}
}
