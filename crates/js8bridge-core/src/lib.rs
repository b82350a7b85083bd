//! `js8bridge-core` – reassembly, command pacing and the bridge loop.
//!
//! # Modules
//!
//! - [`reassembly`] – [`ReassemblyEngine`][reassembly::ReassemblyEngine]:
//!   merges `RX.ACTIVITY` frames into whole messages per conversation key and
//!   flushes idle conversations as incomplete.
//! - [`command_queue`] – [`CommandQueue`][command_queue::CommandQueue]:
//!   FIFO of bus commands released no faster than one per minimum delay.
//! - [`topic`] – [`TopicMapper`][topic::TopicMapper]: event category to bus
//!   topic mapping plus the fixed bridge topics.
//! - [`bridge`] – [`Bridge`][bridge::Bridge]: the single task that owns the
//!   engine and the queue and moves traffic between the radio link and the bus.
//! - [`stats`] – [`BridgeStats`][stats::BridgeStats]: running counters,
//!   published with the offline status notice.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.

pub mod bridge;
pub mod command_queue;
pub mod reassembly;
pub mod stats;
pub mod telemetry;
pub mod topic;

pub use bridge::{Bridge, BridgeConfig};
pub use command_queue::CommandQueue;
pub use reassembly::{AssemblyBuffer, ReassemblyEngine};
pub use stats::{BridgeStats, StatsSnapshot};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use topic::TopicMapper;
