use crossbeam_channel::{bounded, Receiver, Sender};
use runtime::Stage;

use crate::dropper::{InvalidDropper, PayloadDropper};
use crate::event::{Event, EventMerger};
use crate::fsm::TcpFsm;
use crate::ip::{LengthExtract, PseudoHeaderInsert};
use crate::mem::{MemWriter, NotificationDelayer};
use crate::meta::MetadataHandler;
use crate::parse::ChecksumAndParse;
use crate::tables::{
	AppNotification, MemCommand, MemStatus, OpenStatus, RetransmitTimerUpdate, RxSarEntry, RxSarUpdate, SessionLookupQuery,
	SessionLookupReply, StateQuery, TxSarReply, TxSarUpdate,
};
use crate::tcp::TcpState;
use crate::word::Word;

/// Plain data queues between stages.
const DATA_DEPTH: usize = 8;
/// The checksum verdict only exists at end of packet, so the payload buffer
/// ahead of the invalid dropper must hold a whole segment.
const CHECKSUM_DEPTH: usize = 256;
/// Per-segment side channels (metadata, tuple, length, valid).
const META_DEPTH: usize = 2;
/// Payload queue into the memory writer.
const MEM_DATA_DEPTH: usize = 16;
/// Logical write commands and split flags ahead of the memory writer.
const MEM_CMD_DEPTH: usize = 8;
/// Notifications between the state machine and the delayer.
const NOTIFY_DEPTH: usize = 8;
/// Request/response queues toward the external services.
const SERVICE_DEPTH: usize = 4;

/// The receive engine: all nine stages and the event merger, wired with
/// bounded queues.
///
/// One [`step`](Stage::step) runs a round-robin pass; [`settle`](Engine::settle)
/// repeats passes until every stage is parked on an empty input or a full
/// output. The embedder answers the requests surfaced through [`Services`]
/// (exactly one response per request, in order) and feeds ingress words
/// between passes; scheduling granularity never changes the results.
pub struct Engine {
	length_extract: LengthExtract,
	pseudo_header: PseudoHeaderInsert,
	parse: ChecksumAndParse,
	invalid: InvalidDropper,
	metadata: MetadataHandler,
	fsm: TcpFsm,
	payload: PayloadDropper,
	writer: MemWriter,
	delayer: NotificationDelayer,
	merger: EventMerger,
}

/// The far ends of every queue the engine shares with the outside world.
pub struct Services {
	/// Ingress IPv4 datagrams, beat by beat.
	pub ingress: Sender<Word>,

	pub port_req: Receiver<u16>,
	pub port_rsp: Sender<bool>,
	pub lookup_req: Receiver<SessionLookupQuery>,
	pub lookup_rsp: Sender<SessionLookupReply>,
	pub state_req: Receiver<StateQuery>,
	pub state_rsp: Sender<TcpState>,
	pub rx_sar_req: Receiver<RxSarUpdate>,
	pub rx_sar_rsp: Sender<RxSarEntry>,
	pub tx_sar_req: Receiver<TxSarUpdate>,
	pub tx_sar_rsp: Sender<TxSarReply>,

	pub clear_retransmit: Receiver<RetransmitTimerUpdate>,
	pub clear_probe: Receiver<u16>,
	pub set_close: Receiver<u16>,
	pub open_status: Receiver<OpenStatus>,
	pub events: Receiver<Event>,

	pub mem_cmd: Receiver<MemCommand>,
	pub mem_data: Receiver<Word>,
	pub mem_status: Sender<MemStatus>,
	pub notifications: Receiver<AppNotification>,
}

impl Engine {
	pub fn new() -> (Engine, Services) {
		let (ingress, data0) = bounded(DATA_DEPTH);
		let (data1_tx, data1) = bounded(DATA_DEPTH);
		let (data2_tx, data2) = bounded(DATA_DEPTH);
		let (data3_tx, data3) = bounded(CHECKSUM_DEPTH);
		let (data4_tx, data4) = bounded(DATA_DEPTH);
		let (data5_tx, data5) = bounded(MEM_DATA_DEPTH);

		let (tcp_len_tx, tcp_len) = bounded(META_DEPTH);
		let (valid_tx, valid) = bounded(META_DEPTH);
		let (meta_tx, meta) = bounded(META_DEPTH);
		let (tuple_tx, tuple) = bounded(META_DEPTH);
		let (work_tx, work) = bounded(META_DEPTH);

		let (meta_drop_tx, meta_drop) = bounded(META_DEPTH);
		let (fsm_drop_tx, fsm_drop) = bounded(META_DEPTH);

		let (meta_event_tx, meta_event) = bounded(META_DEPTH);
		let (fsm_event_tx, fsm_event) = bounded(META_DEPTH);
		let (event_tx, events) = bounded(SERVICE_DEPTH);

		let (port_req_tx, port_req) = bounded(SERVICE_DEPTH);
		let (port_rsp_tx, port_rsp) = bounded(SERVICE_DEPTH);
		let (lookup_req_tx, lookup_req) = bounded(SERVICE_DEPTH);
		let (lookup_rsp_tx, lookup_rsp) = bounded(SERVICE_DEPTH);
		let (state_req_tx, state_req) = bounded(SERVICE_DEPTH);
		let (state_rsp_tx, state_rsp) = bounded(SERVICE_DEPTH);
		let (rx_sar_req_tx, rx_sar_req) = bounded(SERVICE_DEPTH);
		let (rx_sar_rsp_tx, rx_sar_rsp) = bounded(SERVICE_DEPTH);
		let (tx_sar_req_tx, tx_sar_req) = bounded(SERVICE_DEPTH);
		let (tx_sar_rsp_tx, tx_sar_rsp) = bounded(SERVICE_DEPTH);

		let (clear_retransmit_tx, clear_retransmit) = bounded(SERVICE_DEPTH);
		let (clear_probe_tx, clear_probe) = bounded(SERVICE_DEPTH);
		let (set_close_tx, set_close) = bounded(SERVICE_DEPTH);
		let (open_status_tx, open_status) = bounded(SERVICE_DEPTH);

		let (mem_cmd_fsm_tx, mem_cmd_fsm) = bounded(MEM_CMD_DEPTH);
		let (mem_cmd_tx, mem_cmd) = bounded(MEM_CMD_DEPTH);
		let (mem_data_tx, mem_data) = bounded(MEM_DATA_DEPTH);
		let (double_tx, double) = bounded(MEM_CMD_DEPTH);
		let (mem_status_tx, mem_status) = bounded(MEM_CMD_DEPTH);
		let (notify_tx, notify) = bounded(NOTIFY_DEPTH);
		let (notification_tx, notifications) = bounded(NOTIFY_DEPTH);

		let engine = Engine {
			length_extract: LengthExtract::new(data0, data1_tx, tcp_len_tx),
			pseudo_header: PseudoHeaderInsert::new(data1, tcp_len, data2_tx),
			parse: ChecksumAndParse::new(data2, data3_tx, valid_tx, meta_tx, tuple_tx, port_req_tx),
			invalid: InvalidDropper::new(data3, valid, data4_tx),
			metadata: MetadataHandler::new(meta, port_rsp, tuple, lookup_rsp, lookup_req_tx, meta_event_tx, meta_drop_tx, work_tx),
			fsm: TcpFsm::new(
				work,
				state_rsp,
				rx_sar_rsp,
				tx_sar_rsp,
				state_req_tx,
				rx_sar_req_tx,
				tx_sar_req_tx,
				clear_retransmit_tx,
				clear_probe_tx,
				set_close_tx,
				open_status_tx,
				fsm_event_tx,
				fsm_drop_tx,
				mem_cmd_fsm_tx,
				notify_tx,
			),
			payload: PayloadDropper::new(data4, meta_drop, fsm_drop, data5_tx),
			writer: MemWriter::new(mem_cmd_fsm, data5, mem_cmd_tx, mem_data_tx, double_tx),
			delayer: NotificationDelayer::new(mem_status, notify, double, notification_tx),
			merger: EventMerger::new(meta_event, fsm_event, event_tx),
		};

		let services = Services {
			ingress,
			port_req,
			port_rsp: port_rsp_tx,
			lookup_req,
			lookup_rsp: lookup_rsp_tx,
			state_req,
			state_rsp: state_rsp_tx,
			rx_sar_req,
			rx_sar_rsp: rx_sar_rsp_tx,
			tx_sar_req,
			tx_sar_rsp: tx_sar_rsp_tx,
			clear_retransmit,
			clear_probe,
			set_close,
			open_status,
			events,
			mem_cmd,
			mem_data,
			mem_status: mem_status_tx,
			notifications,
		};

		(engine, services)
	}

	/// Run passes until the pipeline is quiescent. Returns the number of
	/// individual stage steps taken.
	pub fn settle(&mut self) -> u64 {
		runtime::settle(&mut [
			&mut self.length_extract,
			&mut self.pseudo_header,
			&mut self.parse,
			&mut self.invalid,
			&mut self.metadata,
			&mut self.fsm,
			&mut self.payload,
			&mut self.writer,
			&mut self.delayer,
			&mut self.merger,
		])
	}
}

impl Stage for Engine {
	fn step(&mut self) -> bool {
		self.settle() != 0
	}
}
