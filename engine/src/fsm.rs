use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use runtime::Stage;

use crate::event::{Event, RstTarget};
use crate::tables::{
	AppNotification, MemCommand, OpenStatus, RetransmitTimerUpdate, RxSarEntry, RxSarUpdate, StateQuery, TxSarReply, TxSarUpdate,
};
use crate::tcp::{TcpState, WorkItem};

/// Maximum segment size assumed by the window arithmetic.
pub const MSS: u16 = 1460;

/// Congestion window seeded when a connection is initialised (RFC 6928).
pub const INIT_CONG_WINDOW: u16 = 10 * MSS;

/// Congestion-avoidance increment per acknowledgment, a fixed stand-in for
/// MSS*MSS/cwnd, and the ceiling the window may grow to.
const CONG_AVOID_STEP: u16 = 365;
const CONG_WINDOW_MAX: u16 = 0xF7FF;

/// The connection state machine.
///
/// Alternates between two phases per segment: load, which takes one work
/// item and fires the state, RX-SAR and (for acknowledgments) TX-SAR reads,
/// and transition, which waits for every requested response and dispatches
/// on the segment's control bits.
///
/// The state read locks the session's entry; every path through a transition
/// writes the state back, changed or not, to release it. The stage never
/// fails: segments it cannot decode still get their write-back and nothing
/// else.
pub struct TcpFsm {
	work: Receiver<WorkItem>,
	state_rsp: Receiver<TcpState>,
	rx_sar_rsp: Receiver<RxSarEntry>,
	tx_sar_rsp: Receiver<TxSarReply>,
	state_req: Sender<StateQuery>,
	rx_sar_req: Sender<RxSarUpdate>,
	tx_sar_req: Sender<TxSarUpdate>,
	clear_retransmit: Sender<RetransmitTimerUpdate>,
	clear_probe: Sender<u16>,
	set_close: Sender<u16>,
	open_status: Sender<OpenStatus>,
	events: Sender<Event>,
	drops: Sender<bool>,
	mem_cmd: Sender<MemCommand>,
	notifications: Sender<AppNotification>,

	loaded: Option<WorkItem>,
	tx_pending: bool,
}

impl TcpFsm {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		work: Receiver<WorkItem>,
		state_rsp: Receiver<TcpState>,
		rx_sar_rsp: Receiver<RxSarEntry>,
		tx_sar_rsp: Receiver<TxSarReply>,
		state_req: Sender<StateQuery>,
		rx_sar_req: Sender<RxSarUpdate>,
		tx_sar_req: Sender<TxSarUpdate>,
		clear_retransmit: Sender<RetransmitTimerUpdate>,
		clear_probe: Sender<u16>,
		set_close: Sender<u16>,
		open_status: Sender<OpenStatus>,
		events: Sender<Event>,
		drops: Sender<bool>,
		mem_cmd: Sender<MemCommand>,
		notifications: Sender<AppNotification>,
	) -> Self {
		Self {
			work,
			state_rsp,
			rx_sar_rsp,
			tx_sar_rsp,
			state_req,
			rx_sar_req,
			tx_sar_req,
			clear_retransmit,
			clear_probe,
			set_close,
			open_status,
			events,
			drops,
			mem_cmd,
			notifications,
			loaded: None,
			tx_pending: false,
		}
	}

	/// Room for the worst case of one transition: at most one message per
	/// output queue.
	fn outputs_blocked(&self) -> bool {
		self.state_req.is_full()
			|| self.rx_sar_req.is_full()
			|| self.tx_sar_req.is_full()
			|| self.clear_retransmit.is_full()
			|| self.clear_probe.is_full()
			|| self.set_close.is_full()
			|| self.open_status.is_full()
			|| self.events.is_full()
			|| self.drops.is_full()
			|| self.mem_cmd.is_full()
			|| self.notifications.is_full()
	}

	fn on_ack(&mut self, item: &WorkItem, state: TcpState, rx: RxSarEntry, mut tx: TxSarReply) {
		let meta = &item.meta;
		let sid = item.session;

		self.clear_retransmit
			.try_send(RetransmitTimerUpdate { session: sid, stop: meta.ack == tx.next_byte })
			.ok();

		if !state.synchronized() {
			// RFC 793 fig. 11.
			self.events
				.try_send(Event::Rst { target: RstTarget::Session(sid), seq: meta.seq.wrapping_add(meta.len as u32) })
				.ok();
			if meta.len != 0 {
				self.drops.try_send(true).ok();
			}
			self.state_req.try_send(StateQuery::write(sid, state)).ok();
			return;
		}

		if meta.ack == tx.prev_ack && tx.prev_ack != tx.next_byte {
			// Nothing new acknowledged; a bare duplicate bumps the
			// three-bit counter.
			if meta.len == 0 {
				tx.count = (tx.count + 1) & 0x7;
			}
		} else {
			self.clear_probe.try_send(sid).ok();
			// Slow start until the threshold, then linear growth.
			if tx.cong_window <= tx.slowstart_threshold.wrapping_sub(MSS) {
				tx.cong_window = tx.cong_window.wrapping_add(MSS);
			} else if tx.cong_window <= CONG_WINDOW_MAX {
				tx.cong_window += CONG_AVOID_STEP;
			}
			tx.count = 0;
			tx.fast_retransmitted = false;
		}

		// prevAck <= ack <= nextByte, allowing for sequence wraparound.
		let acceptable = (tx.prev_ack <= meta.ack && meta.ack <= tx.next_byte)
			|| ((tx.prev_ack <= meta.ack || meta.ack <= tx.next_byte) && tx.next_byte < tx.prev_ack);
		if acceptable {
			self.tx_sar_req
				.try_send(TxSarUpdate::write(
					sid,
					meta.ack,
					meta.win,
					tx.cong_window,
					tx.count,
					tx.count == 3 || tx.fast_retransmitted,
				))
				.ok();
		}

		if meta.len != 0 {
			// The application pointer must not be overtaken.
			let free = rx.appd.wrapping_sub(rx.recvd as u16).wrapping_sub(1);
			if meta.seq == rx.recvd && free > meta.len {
				self.rx_sar_req.try_send(RxSarUpdate::write(sid, meta.seq.wrapping_add(meta.len as u32))).ok();
				self.mem_cmd.try_send(MemCommand::new(sid, meta.seq, meta.len)).ok();
				self.notifications
					.try_send(AppNotification::data(sid, meta.len, item.src_ip, item.dst_port, false))
					.ok();
				self.drops.try_send(false).ok();
			} else {
				debug!("session {sid}: seq {} (expected {}), free {free}: dropping", meta.seq, rx.recvd);
				self.drops.try_send(true).ok();
			}
		}

		if tx.count == 3 && !tx.fast_retransmitted {
			debug!("session {sid}: third duplicate, fast retransmit");
			self.events.try_send(Event::Retransmit { session: sid }).ok();
		} else if meta.len != 0 {
			self.events.try_send(Event::Ack { session: sid }).ok();
		}

		let next = if meta.ack == tx.next_byte {
			match state {
				TcpState::SynReceived => TcpState::Established,
				TcpState::Closing => {
					self.set_close.try_send(sid).ok();
					TcpState::TimeWait
				}
				TcpState::LastAck => TcpState::Closed,
				other => other,
			}
		} else {
			state
		};

		if next != state {
			debug!("session {sid}: {state:?} -> {next:?}");
		}
		self.state_req.try_send(StateQuery::write(sid, next)).ok();
	}

	fn on_syn(&mut self, item: &WorkItem, state: TcpState, rx: RxSarEntry) {
		let meta = &item.meta;
		let sid = item.session;

		match state {
			TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
				// Passive open: seed both records, the phantom byte already
				// counted, and answer with SYN+ACK.
				self.rx_sar_req.try_send(RxSarUpdate::init(sid, meta.seq.wrapping_add(1))).ok();
				self.tx_sar_req.try_send(TxSarUpdate::write(sid, 0, meta.win, INIT_CONG_WINDOW, 0, false)).ok();
				self.events.try_send(Event::SynAck { session: sid, retransmit: false }).ok();
				debug!("session {sid}: {state:?} -> SynReceived (SYN seq {})", meta.seq);
				self.state_req.try_send(StateQuery::write(sid, TcpState::SynReceived)).ok();
			}
			TcpState::SynReceived => {
				if meta.seq.wrapping_add(1) == rx.recvd {
					// The same SYN again; answer it again rather than wait
					// for the retransmit timer.
					self.events.try_send(Event::SynAck { session: sid, retransmit: true }).ok();
					self.state_req.try_send(StateQuery::write(sid, state)).ok();
				} else {
					// RFC 793 fig. 9: an old duplicate gets a reset.
					self.events
						.try_send(Event::Rst { target: RstTarget::Session(sid), seq: meta.seq.wrapping_add(1) })
						.ok();
					self.state_req.try_send(StateQuery::write(sid, TcpState::Closed)).ok();
				}
			}
			_ => {
				// SYN inside a synchronized connection, RFC 793 fig. 10.
				self.events.try_send(Event::AckNoDelay { session: sid }).ok();
				self.state_req.try_send(StateQuery::write(sid, state)).ok();
			}
		}

		// A SYN never delivers payload; pair the dropper's flag regardless.
		if meta.len != 0 {
			self.drops.try_send(true).ok();
		}
	}

	fn on_syn_ack(&mut self, item: &WorkItem, state: TcpState, tx: TxSarReply) {
		let meta = &item.meta;
		let sid = item.session;

		self.clear_retransmit
			.try_send(RetransmitTimerUpdate { session: sid, stop: meta.ack == tx.next_byte })
			.ok();

		if state == TcpState::SynSent && meta.ack == tx.next_byte {
			// Our SYN is acknowledged; the active open succeeded.
			self.rx_sar_req.try_send(RxSarUpdate::init(sid, meta.seq.wrapping_add(1))).ok();
			self.tx_sar_req.try_send(TxSarUpdate::write(sid, meta.ack, meta.win, tx.cong_window, 0, false)).ok();
			self.events.try_send(Event::AckNoDelay { session: sid }).ok();
			debug!("session {sid}: SynSent -> Established");
			self.state_req.try_send(StateQuery::write(sid, TcpState::Established)).ok();
			self.open_status.try_send(OpenStatus { session: sid, success: true }).ok();
		} else if state == TcpState::SynSent {
			// Wrong acknowledgment for our SYN.
			self.events
				.try_send(Event::Rst {
					target: RstTarget::Session(sid),
					seq: meta.seq.wrapping_add(meta.len as u32).wrapping_add(1),
				})
				.ok();
			self.state_req.try_send(StateQuery::write(sid, TcpState::Closed)).ok();
		} else {
			self.events.try_send(Event::AckNoDelay { session: sid }).ok();
			self.state_req.try_send(StateQuery::write(sid, state)).ok();
		}

		if meta.len != 0 {
			self.drops.try_send(true).ok();
		}
	}

	fn on_fin(&mut self, item: &WorkItem, state: TcpState, rx: RxSarEntry, tx: TxSarReply) {
		let meta = &item.meta;
		let sid = item.session;

		self.clear_retransmit
			.try_send(RetransmitTimerUpdate { session: sid, stop: meta.ack == tx.next_byte })
			.ok();

		let closing_state = matches!(state, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2);
		if closing_state && rx.recvd == meta.seq {
			self.tx_sar_req
				.try_send(TxSarUpdate::write(sid, meta.ack, meta.win, tx.cong_window, tx.count, tx.fast_retransmitted))
				.ok();
			// Advance past the payload and the phantom byte the FIN occupies.
			self.rx_sar_req
				.try_send(RxSarUpdate::write(sid, meta.seq.wrapping_add(meta.len as u32).wrapping_add(1)))
				.ok();
			self.clear_probe.try_send(sid).ok();

			if meta.len != 0 {
				self.mem_cmd.try_send(MemCommand::new(sid, meta.seq, meta.len)).ok();
				self.notifications
					.try_send(AppNotification::data(sid, meta.len, item.src_ip, item.dst_port, true))
					.ok();
				self.drops.try_send(false).ok();
			} else if state == TcpState::Established {
				self.notifications.try_send(AppNotification::close(sid, item.src_ip, item.dst_port)).ok();
			}

			if state == TcpState::Established {
				debug!("session {sid}: Established -> LastAck (peer closed)");
				self.events.try_send(Event::Fin { session: sid }).ok();
				self.state_req.try_send(StateQuery::write(sid, TcpState::LastAck)).ok();
			} else {
				// Our own FIN may or may not be acknowledged yet.
				let next = if meta.ack == tx.next_byte {
					self.set_close.try_send(sid).ok();
					TcpState::TimeWait
				} else {
					TcpState::Closing
				};
				debug!("session {sid}: {state:?} -> {next:?}");
				self.events.try_send(Event::Ack { session: sid }).ok();
				self.state_req.try_send(StateQuery::write(sid, next)).ok();
			}
		} else {
			// Out-of-order FIN: just acknowledge what we have.
			self.events.try_send(Event::Ack { session: sid }).ok();
			self.state_req.try_send(StateQuery::write(sid, state)).ok();
			if meta.len != 0 {
				self.drops.try_send(true).ok();
			}
		}
	}

	fn on_other(&mut self, item: &WorkItem, state: TcpState, rx: RxSarEntry, tx: TxSarReply) {
		let meta = &item.meta;
		let sid = item.session;

		if meta.ctl.rst {
			if state == TcpState::SynSent {
				if meta.ack == tx.next_byte {
					// The peer refused our SYN.
					self.open_status.try_send(OpenStatus { session: sid, success: false }).ok();
					self.state_req.try_send(StateQuery::write(sid, TcpState::Closed)).ok();
					self.clear_retransmit.try_send(RetransmitTimerUpdate { session: sid, stop: true }).ok();
				} else {
					self.state_req.try_send(StateQuery::write(sid, state)).ok();
				}
			} else if meta.seq == rx.recvd {
				warn!("session {sid}: reset by peer");
				self.notifications.try_send(AppNotification::close(sid, item.src_ip, item.dst_port)).ok();
				self.state_req.try_send(StateQuery::write(sid, TcpState::Closed)).ok();
				self.clear_retransmit.try_send(RetransmitTimerUpdate { session: sid, stop: true }).ok();
			} else {
				// Reset outside the window; ignore it.
				self.state_req.try_send(StateQuery::write(sid, state)).ok();
			}
		} else {
			// Nothing we decode; release the state-table lock and move on.
			self.state_req.try_send(StateQuery::write(sid, state)).ok();
		}

		if meta.len != 0 {
			self.drops.try_send(true).ok();
		}
	}
}

impl Stage for TcpFsm {
	fn step(&mut self) -> bool {
		let Some(item) = self.loaded else {
			if self.state_req.is_full() || self.rx_sar_req.is_full() || self.tx_sar_req.is_full() {
				return false;
			}
			let Ok(item) = self.work.try_recv() else { return false };

			self.state_req.try_send(StateQuery::read(item.session)).ok();
			// The receive record is read even when the segment ends up not
			// needing it; the transmit record only for acknowledgments.
			self.rx_sar_req.try_send(RxSarUpdate::read(item.session)).ok();
			if item.meta.ctl.ack {
				self.tx_sar_req.try_send(TxSarUpdate::read(item.session)).ok();
				self.tx_pending = true;
			}

			self.loaded = Some(item);
			return true;
		};

		if self.state_rsp.is_empty() || self.rx_sar_rsp.is_empty() || (self.tx_pending && self.tx_sar_rsp.is_empty()) {
			return false;
		}
		if self.outputs_blocked() {
			return false;
		}

		let state = self.state_rsp.try_recv().unwrap_or_default();
		let rx = self.rx_sar_rsp.try_recv().unwrap_or_default();
		let tx = if self.tx_pending {
			self.tx_sar_rsp.try_recv().unwrap_or_default()
		} else {
			TxSarReply::default()
		};
		self.tx_pending = false;
		self.loaded = None;

		match item.meta.ctl.bits() {
			0b0001 => self.on_ack(&item, state, rx, tx),
			0b0010 => self.on_syn(&item, state, rx),
			0b0011 => self.on_syn_ack(&item, state, tx),
			0b0101 => self.on_fin(&item, state, rx, tx),
			_ => self.on_other(&item, state, rx, tx),
		}

		true
	}
}
