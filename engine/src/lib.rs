//! Receive-side data path of a TCP endpoint.
//!
//! IPv4 datagrams enter as a stream of 64-bit beats and run through a
//! pipeline of cooperative stages: header stripping, pseudo-header
//! insertion, combined checksum verification and TCP header parsing, port
//! and session resolution, the per-connection state machine, payload
//! dropping, and finally memory-write translation with delayed application
//! notifications. Stages share nothing and talk only through bounded
//! queues, so the pipeline runs the same under a single-threaded scheduler
//! or with a thread per stage.
//!
//! Everything stateful per session (state table, RX/TX-SAR records, session
//! lookup, timers, the memory fabric) lives behind request/response queue
//! pairs; [`Engine::new`] returns the [`Services`] bundle holding the far
//! ends.

mod checksum;
mod dropper;
mod event;
mod fsm;
mod ip;
mod mem;
mod meta;
mod parse;
mod pipeline;
mod tables;
mod tcp;
mod word;

pub use checksum::Checksum;
pub use dropper::{InvalidDropper, PayloadDropper};
pub use event::{Event, EventMerger, RstTarget};
pub use fsm::{TcpFsm, INIT_CONG_WINDOW, MSS};
pub use ip::{LengthExtract, PseudoHeaderInsert};
pub use mem::{MemWriter, NotificationDelayer};
pub use meta::MetadataHandler;
pub use parse::ChecksumAndParse;
pub use pipeline::{Engine, Services};
pub use tables::*;
pub use tcp::{Control, Ctl, FourTuple, SegmentMeta, TcpState, WorkItem};
pub use word::{keep_to_len, len_to_keep, pack, unpack, Word};
