use bilge::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use log::warn;
use runtime::Stage;

use crate::word::Word;

/// IPv4 version/IHL prefix byte.
#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
struct Prefix {
	ihl: u4,
	ver: Version,
}

#[bitsize(4)]
#[derive(FromBits)]
enum Version {
	V4 = 4,
	#[fallback]
	Unknown,
}

/// Strips the IPv4 header off each datagram.
///
/// The TCP length (total length minus header length) leaves on a side
/// channel; the source and destination addresses are kept as the first beat
/// of the output so the next stage can build the pseudo-header. A zero
/// spacer beat follows the addresses so that once the 12-byte pseudo-header
/// replaces it downstream, the TCP segment stays word-aligned.
///
/// A 20-byte header is an odd number of 32-bit words, so the segment leaves
/// four bytes earlier in the beat than it arrived; options are discarded and
/// flip that alignment back when their length is another odd word count.
pub struct LengthExtract {
	input: Receiver<Word>,
	output: Sender<Word>,
	tcp_len: Sender<u16>,

	/// 32-bit words of IP header not yet consumed.
	header_words: u8,
	len: u16,
	count: u8,
	insert: bool,
	flush: bool,
	shift: bool,
	prev: Word,
}

impl LengthExtract {
	pub fn new(input: Receiver<Word>, output: Sender<Word>, tcp_len: Sender<u16>) -> Self {
		Self {
			input,
			output,
			tcp_len,
			header_words: 0,
			len: 0,
			count: 0,
			insert: false,
			flush: false,
			shift: false,
			prev: Word::default(),
		}
	}
}

impl Stage for LengthExtract {
	fn step(&mut self) -> bool {
		if self.output.is_full() {
			return false;
		}

		if self.insert {
			self.insert = false;
			self.output.try_send(Word::new(0, 0xFF, false)).ok();
			return true;
		}

		if self.flush {
			self.flush = false;
			self.output.try_send(self.prev.tail()).ok();
			return true;
		}

		if self.count == 1 && self.tcp_len.is_full() {
			return false;
		}

		let Ok(cur) = self.input.try_recv() else { return false };
		let mut sent_last = cur.last;

		match self.count {
			0 => {
				let prefix = Prefix::from(cur.byte(0));
				if matches!(prefix.ver(), Version::Unknown) {
					warn!("datagram does not look like IPv4, parsing anyway");
				}
				self.header_words = prefix.ihl().value();
				self.len = cur.be16(2).wrapping_sub(4 * self.header_words as u16);
				self.header_words = self.header_words.wrapping_sub(2);
				self.count += 1;
			}
			1 => {
				// Covers ttl/protocol/checksum and the source address.
				self.tcp_len.try_send(self.len).ok();
				self.header_words = self.header_words.wrapping_sub(2);
				self.count += 1;
			}
			2 => {
				// Source and destination address, re-joined into one beat.
				let out = self.prev.shifted(cur);
				sent_last = out.last;
				self.output.try_send(out).ok();
				self.header_words = self.header_words.wrapping_sub(1);
				self.insert = true;
				self.count += 1;
			}
			3 => match self.header_words {
				0 => {
					// Header length was odd: the segment runs through the
					// shift register from here on.
					let out = self.prev.shifted(cur);
					sent_last = out.last;
					self.output.try_send(out).ok();
					self.shift = true;
					self.count += 1;
				}
				1 => {
					// Options ended on the beat boundary; pass through.
					self.output.try_send(cur).ok();
					self.shift = false;
					self.header_words = 0;
					self.count += 1;
				}
				_ => self.header_words -= 2,
			},
			_ => {
				let out = if self.shift { self.prev.shifted(cur) } else { cur };
				sent_last = out.last;
				self.output.try_send(out).ok();
			}
		}

		self.prev = cur;
		if cur.last {
			self.count = 0;
			self.flush = !sent_last;
		}

		true
	}
}

/// Prepends the 12-byte TCP pseudo-header to the address-prefixed stream.
///
/// The first beat in (the addresses) already is the first 8 pseudo-header
/// bytes; the spacer beat is replaced by `[0, protocol, length]` plus the
/// start of the TCP header, and everything after runs through the shift
/// register four bytes later than it arrived.
pub struct PseudoHeaderInsert {
	input: Receiver<Word>,
	tcp_len: Receiver<u16>,
	output: Sender<Word>,

	count: u8,
	flush: bool,
	prev: Word,
}

impl PseudoHeaderInsert {
	pub fn new(input: Receiver<Word>, tcp_len: Receiver<u16>, output: Sender<Word>) -> Self {
		Self { input, tcp_len, output, count: 0, flush: false, prev: Word::default() }
	}
}

impl Stage for PseudoHeaderInsert {
	fn step(&mut self) -> bool {
		if self.output.is_full() {
			return false;
		}

		if self.flush {
			self.flush = false;
			self.output.try_send(self.prev.tail()).ok();
			return true;
		}

		if self.count == 2 && self.tcp_len.is_empty() {
			return false;
		}

		let Ok(cur) = self.input.try_recv() else { return false };
		let mut sent_last = cur.last;

		match self.count {
			0 => self.count += 1, // the addresses settle into the shift register
			1 => {
				// `cur` is the spacer; emit the addresses untouched.
				self.output.try_send(self.prev).ok();
				sent_last = self.prev.last;
				self.count += 1;
			}
			2 => {
				let len = self.tcp_len.try_recv().unwrap_or_default();
				// [zero, protocol 6, length] and the first four TCP bytes.
				let data = 0x0600 | ((len >> 8) as u64) << 16 | ((len & 0xFF) as u64) << 24 | (cur.data & 0xFFFF_FFFF) << 32;
				self.output.try_send(Word::new(data, 0xFF, false)).ok();
				sent_last = false;
				self.count += 1;
			}
			_ => {
				let out = self.prev.shifted(cur);
				sent_last = out.last;
				self.output.try_send(out).ok();
			}
		}

		self.prev = cur;
		if cur.last {
			self.count = 0;
			self.flush = !sent_last;
		}

		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::word::{pack, unpack};
	use crossbeam_channel::bounded;

	/// A minimal IPv4 header around a TCP payload blob.
	fn datagram(options: &[u8], segment: &[u8]) -> Vec<u8> {
		assert_eq!(options.len() % 4, 0);
		let ihl = 5 + options.len() / 4;
		let total = 20 + options.len() + segment.len();

		let mut bytes = vec![0x40 | ihl as u8, 0, (total >> 8) as u8, total as u8];
		bytes.extend([0x12, 0x34, 0x40, 0x00]); // identification, flags
		bytes.extend([64, 6, 0, 0]); // ttl, protocol, header checksum
		bytes.extend([10, 0, 0, 1]);
		bytes.extend([10, 0, 0, 2]);
		bytes.extend(options);
		bytes.extend(segment);
		bytes
	}

	fn run(bytes: &[u8]) -> (Vec<Word>, u16) {
		let (in_tx, in_rx) = bounded(64);
		let (out_tx, out_rx) = bounded(64);
		let (len_tx, len_rx) = bounded(4);
		let mut stage = LengthExtract::new(in_rx, out_tx, len_tx);

		for word in pack(bytes) {
			in_tx.send(word).unwrap();
		}
		while stage.step() {}

		(out_rx.try_iter().collect(), len_rx.try_recv().unwrap())
	}

	#[test]
	fn strips_plain_header() {
		let segment: Vec<u8> = (0..23).collect();
		let (words, len) = run(&datagram(&[], &segment));

		assert_eq!(len, 23);
		let bytes = unpack(&words);
		assert_eq!(&bytes[..8], &[10, 0, 0, 1, 10, 0, 0, 2]);
		assert_eq!(&bytes[8..16], &[0; 8]); // spacer
		assert_eq!(&bytes[16..], &segment[..]);
		assert!(words.last().unwrap().last);
	}

	#[test]
	fn strips_options() {
		for opt_len in [4usize, 8, 12] {
			let options: Vec<u8> = (0..opt_len as u8).map(|i| i | 0x80).collect();
			let segment: Vec<u8> = (0..37).collect();
			let (words, len) = run(&datagram(&options, &segment));

			assert_eq!(len, 37, "options {opt_len}");
			let bytes = unpack(&words);
			assert_eq!(&bytes[16..], &segment[..], "options {opt_len}");
		}
	}

	#[test]
	fn flushes_low_half_tail() {
		// 20 header + 20 payload bytes: the last input beat is full, so the
		// shifted stream overruns it and the tail comes from the register.
		let segment: Vec<u8> = (0..20).collect();
		let (words, _) = run(&datagram(&[], &segment));

		let tail = *words.last().unwrap();
		assert!(tail.last);
		assert_eq!(tail.keep, 0x0F);
		assert_eq!(unpack(&words)[16..], segment[..]);
	}

	#[test]
	fn pseudo_header_round_trip() {
		// The two front stages wired together must produce exactly the
		// RFC 793 pseudo-header followed by the verbatim TCP segment.
		let segment: Vec<u8> = (0..41).map(|i| i * 3).collect();
		let packet = datagram(&[], &segment);

		let (in_tx, in_rx) = bounded(64);
		let (mid_tx, mid_rx) = bounded(64);
		let (len_tx, len_rx) = bounded(4);
		let (out_tx, out_rx) = bounded(64);

		let mut extract = LengthExtract::new(in_rx, mid_tx, len_tx);
		let mut insert = PseudoHeaderInsert::new(mid_rx, len_rx, out_tx);

		for word in pack(&packet) {
			in_tx.send(word).unwrap();
		}
		runtime::settle(&mut [&mut extract, &mut insert]);

		let bytes = unpack(&out_rx.try_iter().collect::<Vec<_>>());
		let mut expect = vec![10, 0, 0, 1, 10, 0, 0, 2, 0, 6, 0, 41];
		expect.extend(&segment);
		assert_eq!(bytes, expect);
	}
}
