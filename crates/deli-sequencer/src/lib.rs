//! Deli: per-document ticketing over a partitioned log.
//!
//! Operations for many documents arrive multiplexed over a few inbound
//! partitions. Each document gets a [`Sequencer`] that stamps its operations
//! with a gapless, strictly increasing sequence number and publishes them in
//! order. A [`CheckpointCoordinator`] periodically persists sequencer state and
//! commits inbound offsets, never past work that has not been published.
//! [`DeliService`] wires intake, checkpointing and the lifecycle together.

pub mod checkpoint;
pub mod config;
pub mod ingest;
pub mod log;
pub mod partition;
pub mod pending;
pub mod registry;
pub mod sequencer;
pub mod service;
pub mod state;
pub mod ticket;

pub use checkpoint::{
    CheckpointCoordinator, CheckpointPhase, CheckpointReason, CheckpointTrigger, CycleReport,
};
pub use config::{DeliConfig, ParseErrorPolicy};
pub use ingest::{IngestionHandle, IngestionLoop, IngestionSettings};
pub use log::{InboundRecord, LogConsumer, LogProducer, OffsetCommitter};
pub use partition::PartitionTracker;
pub use pending::{PendingTickets, TicketWindow};
pub use registry::SequencerRegistry;
pub use sequencer::{Sequencer, TicketOutcome};
pub use service::{DeliService, LifecycleState, ServiceHandle};
pub use state::{ServiceState, SharedState};
pub use ticket::TicketHandle;
