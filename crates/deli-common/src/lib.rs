//! Common types and utilities shared across the Deli sequencer crates.

pub mod error;
pub mod message;
pub mod metrics;
pub mod store;
pub mod throughput;
pub mod types;

pub use error::{Error, Result};
pub use message::{InboundMessage, MessageKind, OutboundMessage};
pub use metrics::DeliMetrics;
pub use store::{CheckpointStore, DocumentCheckpoint};
pub use throughput::ThroughputCounter;
pub use types::{LogPosition, Offset, PartitionId, PartitionOffset, SequenceNumber};

/// Re-export commonly used external types
pub use bytes::Bytes;
