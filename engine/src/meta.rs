use core::net::Ipv4Addr;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use runtime::Stage;

use crate::event::{Event, RstTarget};
use crate::tables::{SessionLookupQuery, SessionLookupReply};
use crate::tcp::{FourTuple, SegmentMeta, WorkItem};

/// Pairs each segment's metadata with the port-table answer and the session
/// lookup, and decides who handles it.
///
/// Segments to closed ports are answered with a reset built from the swapped
/// tuple, since no session exists to name. Open ports go through the session
/// table; only a hit reaches the state machine. Either way, a payload-
/// carrying segment gets exactly one drop flag out of this stage.
pub struct MetadataHandler {
	meta_in: Receiver<SegmentMeta>,
	ports: Receiver<bool>,
	tuples: Receiver<FourTuple>,
	lookup_rsp: Receiver<SessionLookupReply>,
	lookup_req: Sender<SessionLookupQuery>,
	events: Sender<Event>,
	drops: Sender<bool>,
	work: Sender<WorkItem>,

	meta: SegmentMeta,
	src_ip: Ipv4Addr,
	dst_port: u16,
	waiting: bool,
}

impl MetadataHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		meta_in: Receiver<SegmentMeta>,
		ports: Receiver<bool>,
		tuples: Receiver<FourTuple>,
		lookup_rsp: Receiver<SessionLookupReply>,
		lookup_req: Sender<SessionLookupQuery>,
		events: Sender<Event>,
		drops: Sender<bool>,
		work: Sender<WorkItem>,
	) -> Self {
		Self {
			meta_in,
			ports,
			tuples,
			lookup_rsp,
			lookup_req,
			events,
			drops,
			work,
			meta: SegmentMeta::default(),
			src_ip: Ipv4Addr::UNSPECIFIED,
			dst_port: 0,
			waiting: false,
		}
	}
}

impl Stage for MetadataHandler {
	fn step(&mut self) -> bool {
		if !self.waiting {
			if self.meta_in.is_empty() || self.ports.is_empty() || self.tuples.is_empty() {
				return false;
			}
			if self.events.is_full() || self.drops.is_full() || self.lookup_req.is_full() {
				return false;
			}

			let Ok(meta) = self.meta_in.try_recv() else { return false };
			let Ok(open) = self.ports.try_recv() else { return false };
			let Ok(tuple) = self.tuples.try_recv() else { return false };

			self.src_ip = tuple.src_addr();
			self.dst_port = tuple.dst_port.swap_bytes();

			if !open {
				// A reset answers its own reset with silence.
				if !meta.ctl.rst {
					let phantom = (meta.ctl.syn || meta.ctl.fin) as u32;
					let seq = meta.seq.wrapping_add(meta.len as u32).wrapping_add(phantom);
					warn!("{tuple}: port closed, resetting");
					self.events.try_send(Event::Rst { target: RstTarget::Tuple(tuple.swapped()), seq }).ok();
				}
				if meta.len != 0 {
					self.drops.try_send(true).ok();
				}
			} else {
				let allow = meta.ctl.syn && !meta.ctl.rst && !meta.ctl.fin;
				self.lookup_req.try_send(SessionLookupQuery { tuple, allow_creation: allow }).ok();
				self.meta = meta;
				self.waiting = true;
			}

			return true;
		}

		if self.work.is_full() || self.drops.is_full() {
			return false;
		}
		let Ok(reply) = self.lookup_rsp.try_recv() else { return false };

		if reply.hit {
			self.work
				.try_send(WorkItem {
					session: reply.session,
					src_ip: self.src_ip,
					dst_port: self.dst_port,
					meta: self.meta,
				})
				.ok();
		} else {
			debug!("{}:{}: no session, ignoring segment", self.src_ip, self.dst_port);
		}
		if self.meta.len != 0 {
			self.drops.try_send(!reply.hit).ok();
		}
		self.waiting = false;

		true
	}
}
