use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender};
use log::warn;
use runtime::Stage;

use crate::tables::{AppNotification, MemCommand, MemStatus};
use crate::word::{keep_to_len, len_to_keep, Word};

/// Notifications the delayer will hold while their writes are in flight.
const PENDING_DEPTH: usize = 32;

enum WriteState {
	Idle,
	First,
	EvalSecond,
	Aligned,
	Realign,
	Residue,
}

/// Translates one logical write command into the physical command/data
/// streams of the memory fabric.
///
/// A write that runs past the end of the session's 64 KiB ring is split in
/// two; the second half restarts at offset zero. When the ring boundary does
/// not fall on a beat boundary, the second half's data is rebuilt from the
/// tail of one beat and the head of the next. One `double` flag per logical
/// command tells the notification delayer how many completions to expect.
pub struct MemWriter {
	commands: Receiver<MemCommand>,
	input: Receiver<Word>,
	cmd_out: Sender<MemCommand>,
	output: Sender<Word>,
	double: Sender<bool>,

	state: WriteState,
	cmd: MemCommand,
	/// Bytes left in the segment currently streaming out.
	remaining: u16,
	/// Bytes of the straddling beat that belong to the first segment; the
	/// realignment shift.
	consumed: u8,
	/// Bytes of the straddling beat already holding second-segment data.
	residue: u8,
	split: bool,
	push: Word,
}

impl MemWriter {
	pub fn new(
		commands: Receiver<MemCommand>,
		input: Receiver<Word>,
		cmd_out: Sender<MemCommand>,
		output: Sender<Word>,
		double: Sender<bool>,
	) -> Self {
		Self {
			commands,
			input,
			cmd_out,
			output,
			double,
			state: WriteState::Idle,
			cmd: MemCommand::default(),
			remaining: 0,
			consumed: 0,
			residue: 0,
			split: false,
			push: Word::default(),
		}
	}
}

impl Stage for MemWriter {
	fn step(&mut self) -> bool {
		match self.state {
			WriteState::Idle => {
				if self.cmd_out.is_full() || self.double.is_full() {
					return false;
				}
				let Ok(cmd) = self.commands.try_recv() else { return false };

				self.cmd = cmd;
				let low = cmd.address & 0xFFFF;
				let mut first = cmd;

				if low + cmd.bytes as u32 > 0x10000 {
					// The write crosses the end of the ring.
					self.remaining = (0x10000 - low) as u16;
					self.cmd.bytes -= self.remaining;
					first.bytes = self.remaining;
					self.split = true;
				} else {
					self.remaining = cmd.bytes;
					self.split = false;
				}

				self.cmd_out.try_send(first).ok();
				self.double.try_send(self.split).ok();
				self.state = WriteState::First;
				true
			}
			WriteState::First => {
				if self.output.is_full() {
					return false;
				}
				let Ok(word) = self.input.try_recv() else { return false };

				let mut out = word;
				if self.remaining > 8 {
					self.remaining -= 8;
				} else if self.split {
					// This beat straddles the ring boundary.
					if self.cmd.address & 7 != 0 {
						out.keep = len_to_keep(self.remaining as u8);
					}
					out.last = true;
					self.residue = keep_to_len(word.keep).wrapping_sub(self.remaining as u8);
					self.consumed = self.remaining as u8;
					self.push = word;
					self.state = WriteState::EvalSecond;
				} else {
					self.state = WriteState::Idle;
				}

				self.output.try_send(out).ok();
				true
			}
			WriteState::EvalSecond => {
				if self.cmd_out.is_full() {
					return false;
				}

				self.state = if self.cmd.address & 7 == 0 {
					WriteState::Aligned
				} else if self.cmd.bytes > self.residue as u16 {
					WriteState::Realign
				} else {
					WriteState::Residue
				};

				self.cmd.address &= !0xFFFF;
				self.remaining = self.cmd.bytes;
				self.cmd_out.try_send(MemCommand { address: self.cmd.address, bytes: self.remaining }).ok();
				self.split = false;
				true
			}
			WriteState::Aligned => {
				if self.output.is_full() {
					return false;
				}
				let Ok(word) = self.input.try_recv() else { return false };

				if word.last {
					self.state = WriteState::Idle;
				}
				self.output.try_send(word).ok();
				true
			}
			WriteState::Realign => {
				if self.output.is_full() {
					return false;
				}
				let Ok(next) = self.input.try_recv() else { return false };

				let shift = self.consumed as u32 * 8;
				let mut out = Word::new(self.push.data >> shift | next.data << (64 - shift), 0xFF, false);

				if next.last {
					if self.remaining - self.residue as u16 > self.consumed as u16 {
						// More second-segment bytes remain in `next` than
						// this beat can carry.
						self.remaining -= 8;
						self.state = WriteState::Residue;
					} else {
						out.keep = len_to_keep(self.remaining as u8);
						out.last = true;
						self.state = WriteState::Idle;
					}
				} else {
					self.remaining -= 8;
				}

				self.push = next;
				self.output.try_send(out).ok();
				true
			}
			WriteState::Residue => {
				if self.output.is_full() {
					return false;
				}

				let shift = self.consumed as u32 * 8;
				let out = Word::new(self.push.data >> shift, len_to_keep(self.remaining as u8), true);
				self.output.try_send(out).ok();
				self.state = WriteState::Idle;
				true
			}
		}
	}
}

/// Holds "new data" notifications back until the memory fabric confirms the
/// write, both halves of it when the command was split.
///
/// Zero-length notifications (close, reset) have no write to wait for and
/// bypass the buffer entirely.
pub struct NotificationDelayer {
	status: Receiver<MemStatus>,
	input: Receiver<AppNotification>,
	double: Receiver<bool>,
	output: Sender<AppNotification>,

	buffer: VecDeque<AppNotification>,
	/// A notification whose first completion arrived, waiting on the second.
	pending: Option<(AppNotification, bool)>,
}

impl NotificationDelayer {
	pub fn new(
		status: Receiver<MemStatus>,
		input: Receiver<AppNotification>,
		double: Receiver<bool>,
		output: Sender<AppNotification>,
	) -> Self {
		Self { status, input, double, output, buffer: VecDeque::new(), pending: None }
	}

	fn release(&mut self, notification: AppNotification, okay: bool) {
		if okay {
			self.output.try_send(notification).ok();
		} else {
			// The ACK already left; the peer will only learn of the loss
			// through the receive gap.
			warn!("session {}: memory write failed, notification withheld", notification.session);
		}
	}
}

impl Stage for NotificationDelayer {
	fn step(&mut self) -> bool {
		if self.output.is_full() {
			return false;
		}

		if let Some((notification, first_okay)) = self.pending.take() {
			let Ok(second) = self.status.try_recv() else {
				self.pending = Some((notification, first_okay));
				return false;
			};
			self.release(notification, first_okay && second.okay);
			return true;
		}

		if !self.buffer.is_empty() && !self.status.is_empty() && !self.double.is_empty() {
			let (Ok(status), Some(notification), Ok(split)) =
				(self.status.try_recv(), self.buffer.pop_front(), self.double.try_recv())
			else {
				return false;
			};

			if split {
				self.pending = Some((notification, status.okay));
			} else {
				self.release(notification, status.okay);
			}
			return true;
		}

		if self.buffer.len() < PENDING_DEPTH {
			let Ok(notification) = self.input.try_recv() else { return false };
			if notification.length != 0 {
				self.buffer.push_back(notification);
			} else {
				self.output.try_send(notification).ok();
			}
			return true;
		}

		false
	}
}
