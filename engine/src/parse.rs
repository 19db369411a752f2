use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use runtime::Stage;

use crate::checksum::Checksum;
use crate::tcp::{Control, FourTuple, SegmentMeta};
use crate::word::Word;

/// Parses the TCP header and verifies the checksum, on the same pass over
/// the pseudo-headered stream.
///
/// The first four beats hold the pseudo-header and the fixed TCP header;
/// they feed the metadata registers and are stripped. `dataOffset` says how
/// many 32-bit words of options follow; an odd count re-aligns the payload
/// through the shift register. Every beat, stripped or not, enters the
/// checksum.
///
/// The verdict only exists at end of packet, so the payload runs ahead into
/// a deep buffer and a valid flag follows it for the dropper — but only for
/// segments that have payload. Metadata, tuple and port request leave only
/// when the checksum held.
pub struct ChecksumAndParse {
	input: Receiver<Word>,
	output: Sender<Word>,
	valid: Sender<bool>,
	meta_out: Sender<SegmentMeta>,
	tuple_out: Sender<FourTuple>,
	port_out: Sender<u16>,

	count: u16,
	/// 32-bit words of TCP header still to strip.
	offset: u8,
	meta: SegmentMeta,
	tuple: FourTuple,
	/// Destination port in host order, for the port table.
	port: u16,
	shift: bool,
	flush: bool,
	finalize: bool,
	sum: Checksum,
	half: Word,
}

impl ChecksumAndParse {
	pub fn new(
		input: Receiver<Word>,
		output: Sender<Word>,
		valid: Sender<bool>,
		meta_out: Sender<SegmentMeta>,
		tuple_out: Sender<FourTuple>,
		port_out: Sender<u16>,
	) -> Self {
		Self {
			input,
			output,
			valid,
			meta_out,
			tuple_out,
			port_out,
			count: 0,
			offset: 0,
			meta: SegmentMeta::default(),
			tuple: FourTuple::default(),
			port: 0,
			shift: false,
			flush: false,
			finalize: false,
			sum: Checksum::default(),
			half: Word::default(),
		}
	}

	fn verdict(&mut self) -> bool {
		if self.valid.is_full() || self.meta_out.is_full() || self.tuple_out.is_full() || self.port_out.is_full() {
			return false;
		}

		self.finalize = false;

		if core::mem::take(&mut self.sum).is_valid() {
			debug!("{}: seq {} len {}", self.tuple, self.meta.seq, self.meta.len);
			self.meta_out.try_send(self.meta).ok();
			self.port_out.try_send(self.port).ok();
			self.tuple_out.try_send(self.tuple).ok();
			if self.meta.len != 0 {
				self.valid.try_send(true).ok();
			}
		} else if self.meta.len != 0 {
			warn!("{}: bad checksum, dropping payload", self.tuple);
			self.valid.try_send(false).ok();
		} else {
			warn!("{}: bad checksum on empty segment", self.tuple);
		}

		true
	}
}

impl Stage for ChecksumAndParse {
	fn step(&mut self) -> bool {
		if self.output.is_full() {
			return false;
		}

		if self.flush {
			if self.meta.len != 0 {
				self.output.try_send(Word { last: true, ..self.half }).ok();
			}
			self.flush = false;
			return true;
		}

		if self.finalize {
			return self.verdict();
		}

		let Ok(cur) = self.input.try_recv() else { return false };
		let mut sent_last = cur.last;

		match self.count {
			0 => {
				// Pseudo-header addresses, stored as they arrive.
				self.shift = false;
				self.tuple.src_ip = cur.data as u32;
				self.tuple.dst_ip = (cur.data >> 32) as u32;
			}
			1 => {
				self.meta.len = cur.be16(2);
				self.tuple.src_port = (cur.data >> 32) as u16;
				self.tuple.dst_port = (cur.data >> 48) as u16;
				self.port = cur.be16(6);
			}
			2 => {
				self.meta.seq = cur.be32(0);
				self.meta.ack = cur.be32(4);
			}
			3 => {
				self.offset = cur.byte(0) >> 4;
				self.meta.len = self.meta.len.wrapping_sub(4 * self.offset as u16);
				self.meta.ctl = Control::from(cur.byte(1)).into();
				self.meta.win = cur.be16(2);
			}
			_ => {
				if self.offset > 6 {
					// A full beat of options.
					self.offset -= 2;
				} else if self.offset == 6 {
					// Options end mid-beat; stash the payload half.
					self.offset = 5;
					self.shift = true;
					self.half = Word::new(cur.data >> 32, cur.keep >> 4, false);
					sent_last = cur.keep & 0x10 == 0;
				} else if !self.shift {
					self.output.try_send(cur).ok();
				} else {
					let out = Word {
						data: self.half.data | cur.data << 32,
						keep: self.half.keep | cur.keep << 4,
						last: cur.keep & 0x10 == 0,
					};
					sent_last = out.last;
					self.output.try_send(out).ok();
					self.half = Word::new(cur.data >> 32, cur.keep >> 4, false);
				}
			}
		}

		self.sum.push(&cur);
		self.count += 1;

		if cur.last {
			self.count = 0;
			self.flush = !sent_last;
			self.finalize = true;
		}

		true
	}
}
