//! In-memory doubles of the services the engine talks to, plus a packet
//! builder, so scenarios can run from raw datagram bytes to application
//! notifications.

use core::net::Ipv4Addr;
use std::collections::VecDeque;

use engine::{
	pack, AppNotification, Engine, Event, FourTuple, MemCommand, MemStatus, OpenStatus, RetransmitTimerUpdate, RxSarEntry,
	Services, SessionLookupReply, TcpState, TxSarReply,
};
use hashbrown::{HashMap, HashSet};
use slab::Slab;

pub const CLIENT: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 168, 1, 10), 43210);
pub const SERVER: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 168, 1, 1), 80);

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const ACK: u8 = 0x10;

fn checksum(bytes: &[u8]) -> u16 {
	let mut sum: u32 = 0;
	for pair in bytes.chunks(2) {
		sum += (pair[0] as u32) << 8 | *pair.get(1).unwrap_or(&0) as u32;
	}
	while sum >> 16 != 0 {
		sum = (sum & 0xFFFF) + (sum >> 16);
	}
	!(sum as u16)
}

/// An IPv4 datagram carrying one TCP segment from `src` to `dst`, with a
/// correct TCP checksum unless `corrupt` asks otherwise.
pub fn segment(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), flags: u8, seq: u32, ack: u32, payload: &[u8], corrupt: bool) -> Vec<u8> {
	let mut tcp = Vec::with_capacity(20 + payload.len());
	tcp.extend(src.1.to_be_bytes());
	tcp.extend(dst.1.to_be_bytes());
	tcp.extend(seq.to_be_bytes());
	tcp.extend(ack.to_be_bytes());
	tcp.extend([5 << 4, flags]);
	tcp.extend(8192u16.to_be_bytes());
	tcp.extend([0, 0, 0, 0]); // checksum, urgent
	tcp.extend(payload);

	let mut pseudo = Vec::with_capacity(12 + tcp.len());
	pseudo.extend(src.0.octets());
	pseudo.extend(dst.0.octets());
	pseudo.extend([0, 6]);
	pseudo.extend((tcp.len() as u16).to_be_bytes());
	pseudo.extend(&tcp);

	let csum = checksum(&pseudo);
	tcp[16] = (csum >> 8) as u8;
	tcp[17] = csum as u8;
	if corrupt {
		tcp[18] ^= 0x55;
	}

	let total = 20 + tcp.len();
	let mut ip = Vec::with_capacity(total);
	ip.extend([0x45, 0, (total >> 8) as u8, total as u8]);
	ip.extend([0x00, 0x01, 0x40, 0x00]); // identification, flags
	ip.extend([64, 6, 0, 0]); // ttl, protocol, header checksum
	ip.extend(src.0.octets());
	ip.extend(dst.0.octets());
	ip.extend(&tcp);
	ip
}

/// The connection tuple as the engine stores it (wire byte order).
pub fn wire_tuple(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> FourTuple {
	FourTuple {
		src_ip: u32::from(src.0).swap_bytes(),
		dst_ip: u32::from(dst.0).swap_bytes(),
		src_port: src.1.swap_bytes(),
		dst_port: dst.1.swap_bytes(),
	}
}

/// The engine plus doubles of everything around it.
pub struct Bench {
	pub engine: Engine,
	pub services: Services,

	pub open_ports: HashSet<u16>,
	sessions: HashMap<FourTuple, u16>,
	ids: Slab<FourTuple>,
	states: HashMap<u16, TcpState>,
	rx_sar: HashMap<u16, RxSarEntry>,
	tx_sar: HashMap<u16, TxSarReply>,

	mem_queue: VecDeque<MemCommand>,
	inflight: Option<(MemCommand, u16)>,
	pub memory: HashMap<u32, u8>,
	pub fail_writes: bool,

	pub state_reads: u64,
	pub state_writes: u64,
	pub events: Vec<Event>,
	pub notifications: Vec<AppNotification>,
	pub opens: Vec<OpenStatus>,
	pub retransmit_clears: Vec<RetransmitTimerUpdate>,
	pub probe_clears: Vec<u16>,
	pub close_timers: Vec<u16>,
}

impl Bench {
	pub fn new() -> Self {
		runtime::init(log::LevelFilter::Debug);
		let (engine, services) = Engine::new();
		Self {
			engine,
			services,
			open_ports: HashSet::new(),
			sessions: HashMap::new(),
			ids: Slab::new(),
			states: HashMap::new(),
			rx_sar: HashMap::new(),
			tx_sar: HashMap::new(),
			mem_queue: VecDeque::new(),
			inflight: None,
			memory: HashMap::new(),
			fail_writes: false,
			state_reads: 0,
			state_writes: 0,
			events: vec![],
			notifications: vec![],
			opens: vec![],
			retransmit_clears: vec![],
			probe_clears: vec![],
			close_timers: vec![],
		}
	}

	pub fn open_port(&mut self, port: u16) {
		self.open_ports.insert(port);
	}

	pub fn session_id(&self, src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> Option<u16> {
		self.sessions.get(&wire_tuple(src, dst)).copied()
	}

	pub fn state(&self, session: u16) -> TcpState {
		self.states.get(&session).copied().unwrap_or_default()
	}

	pub fn rx_sar(&self, session: u16) -> RxSarEntry {
		self.rx_sar.get(&session).copied().unwrap_or_default()
	}

	pub fn set_rx_sar(&mut self, session: u16, recvd: u32, appd: u16) {
		self.rx_sar.insert(session, RxSarEntry { recvd, appd });
	}

	pub fn tx_sar(&self, session: u16) -> TxSarReply {
		self.tx_sar.get(&session).copied().unwrap_or_default()
	}

	pub fn set_tx_sar(&mut self, session: u16, entry: TxSarReply) {
		self.tx_sar.insert(session, entry);
	}

	/// One byte of the receive buffer, addressed the way mem commands are.
	pub fn buffer_byte(&self, session: u16, offset: u16) -> Option<u8> {
		self.memory.get(&((session as u32) << 16 | offset as u32)).copied()
	}

	/// Feed a datagram and run the system until nothing moves any more.
	pub fn inject(&mut self, bytes: &[u8]) {
		for word in pack(bytes) {
			let mut word = Some(word);
			let mut spins = 0u32;
			while let Some(w) = word.take() {
				if let Err(err) = self.services.ingress.try_send(w) {
					word = Some(err.into_inner());
					self.engine.settle();
					self.service();
					spins += 1;
					assert!(spins < 10_000, "pipeline wedged while feeding ingress");
				}
			}
		}
		self.run();
	}

	pub fn run(&mut self) {
		loop {
			let moved = runtime::Stage::step(&mut self.engine);
			let serviced = self.service();
			if !moved && !serviced {
				break;
			}
		}
	}

	/// Answer every outstanding request once. Returns whether anything was
	/// consumed, produced or drained.
	fn service(&mut self) -> bool {
		let mut busy = false;

		while let Ok(port) = self.services.port_req.try_recv() {
			busy = true;
			self.services.port_rsp.try_send(self.open_ports.contains(&port)).unwrap();
		}

		while let Ok(query) = self.services.lookup_req.try_recv() {
			busy = true;
			let reply = match self.sessions.get(&query.tuple) {
				Some(&id) => SessionLookupReply { hit: true, session: id },
				None if query.allow_creation => {
					let id = self.ids.insert(query.tuple) as u16;
					self.sessions.insert(query.tuple, id);
					SessionLookupReply { hit: true, session: id }
				}
				None => SessionLookupReply { hit: false, session: 0 },
			};
			self.services.lookup_rsp.try_send(reply).unwrap();
		}

		while let Ok(query) = self.services.state_req.try_recv() {
			busy = true;
			match query.write {
				Some(state) => {
					self.state_writes += 1;
					self.states.insert(query.session, state);
				}
				None => {
					self.state_reads += 1;
					let state = self.states.get(&query.session).copied().unwrap_or_default();
					self.services.state_rsp.try_send(state).unwrap();
				}
			}
		}

		while let Ok(update) = self.services.rx_sar_req.try_recv() {
			busy = true;
			if update.write {
				let entry = self.rx_sar.entry(update.session).or_default();
				if !update.init {
					let advance = update.recvd.wrapping_sub(entry.recvd);
					assert!(advance < 1 << 31, "receive pointer moved backwards");
				}
				entry.recvd = update.recvd;
				if update.init {
					entry.appd = update.recvd as u16;
				}
			} else {
				let entry = self.rx_sar.get(&update.session).copied().unwrap_or_default();
				self.services.rx_sar_rsp.try_send(entry).unwrap();
			}
		}

		while let Ok(update) = self.services.tx_sar_req.try_recv() {
			busy = true;
			if update.write {
				let entry = self.tx_sar.entry(update.session).or_default();
				entry.prev_ack = update.ack;
				entry.cong_window = update.cong_window;
				entry.count = update.count;
				entry.fast_retransmitted = update.fast_retransmitted;
			} else {
				let entry = self.tx_sar.get(&update.session).copied().unwrap_or_default();
				self.services.tx_sar_rsp.try_send(entry).unwrap();
			}
		}

		while let Ok(cmd) = self.services.mem_cmd.try_recv() {
			busy = true;
			self.mem_queue.push_back(cmd);
		}

		while let Ok(word) = self.services.mem_data.try_recv() {
			busy = true;
			let (cmd, mut done) = match self.inflight.take() {
				Some(inflight) => inflight,
				None => (self.mem_queue.pop_front().expect("data beat without a write command"), 0),
			};

			for i in 0..word.len() as u16 {
				self.memory.insert(cmd.address + (done + i) as u32, word.byte(i as usize));
			}
			done += word.len() as u16;

			if word.last {
				assert_eq!(done, cmd.bytes, "memory burst length must match its command");
				self.services.mem_status.try_send(MemStatus { okay: !self.fail_writes }).unwrap();
			} else {
				self.inflight = Some((cmd, done));
			}
		}

		busy |= drain(&self.services.clear_retransmit, &mut self.retransmit_clears);
		busy |= drain(&self.services.clear_probe, &mut self.probe_clears);
		busy |= drain(&self.services.set_close, &mut self.close_timers);
		busy |= drain(&self.services.open_status, &mut self.opens);
		busy |= drain(&self.services.events, &mut self.events);
		busy |= drain(&self.services.notifications, &mut self.notifications);

		busy
	}
}

fn drain<T>(rx: &crossbeam_channel::Receiver<T>, into: &mut Vec<T>) -> bool {
	let before = into.len();
	into.extend(rx.try_iter());
	into.len() != before
}
