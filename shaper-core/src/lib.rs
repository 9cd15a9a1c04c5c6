#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! A tick-driven traffic shaping engine.
//!
//! Packets are admitted into a [`Target`]: either a pipe, which serves its queues at a fixed
//! rate, or a flow set, whose queues share the bandwidth of their parent pipe through WF2Q+.
//! Queues are kept per masked [`FlowId`] and guarded by tail drop or RED. Served packets wait
//! out the pipe's delay on its delay line and are then handed to an [`Egress`].
//!
//! Time only moves when [`Shaper::on_tick`] is called; running the ticks (and locking) is up
//! to the caller.
//!
//! ```
//! use bytes::Bytes;
//! use shaper_core::{FlowId, Packet, PipeConfig, Shaper, ShaperOptions, Target};
//!
//! let mut shaper = Shaper::new(ShaperOptions::default(), Vec::new()).unwrap();
//! shaper.configure_pipe(PipeConfig::new(1).bandwidth(8_000).delay(10)).unwrap();
//!
//! let packet = Packet::new(Bytes::from(vec![0u8; 1000]), FlowId::default());
//! assert!(shaper.admit(Target::Pipe(1), packet).is_accepted());
//!
//! // One second to send 1000 bytes at 8 kbit/s, then 10 ms of delay.
//! shaper.advance(1009);
//! assert!(shaper.egress().is_empty());
//! shaper.advance(1);
//! assert_eq!(shaper.egress().len(), 1);
//! ```

mod config;
mod error;
pub mod fixed;
mod flow;
mod flowset;
pub mod heap;
mod packet;
mod pipe;
mod red;
mod sched;
mod shaper;
mod snapshot;
mod stats;

/// The scheduler clock, in ticks of `1 / hz` seconds.
pub type Tick = u64;

pub use config::{
    FlowSetConfig, PipeConfig, QueueLimit, QueueParams, ShaperOptions, DEFAULT_QUEUE_PACKETS,
    MAX_BUCKETS, MAX_HZ, MAX_QUEUE_BYTES, MAX_QUEUE_PACKETS, MAX_WEIGHT, MIN_BUCKETS,
};
pub use error::{ConfigError, DropReason, Verdict};
pub use heap::HeapError;
pub use packet::{Egress, FlowId, Packet, Target};
pub use red::RedConfig;
pub use shaper::Shaper;
pub use snapshot::{FlowQueueSnapshot, FlowSetSnapshot, PipeSnapshot, Snapshot};
pub use stats::{DropCounters, ShaperStats};
