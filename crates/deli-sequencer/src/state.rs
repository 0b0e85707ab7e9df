//! State shared by the intake worker and the checkpoint coordinator.

use parking_lot::Mutex;
use prometheus::IntGauge;
use std::sync::Arc;

use crate::partition::PartitionTracker;
use crate::pending::PendingTickets;
use crate::registry::SequencerRegistry;

/// Everything intake mutates and a checkpoint cycle snapshots.
///
/// Kept behind one lock so a cycle can capture tickets, sequencer state and
/// offsets atomically with respect to intake. The lock is never held across an
/// await.
pub struct ServiceState {
    pub registry: SequencerRegistry,
    pub tracker: PartitionTracker,
    pub pending: PendingTickets,
    /// Records fully processed by the intake worker
    pub processed: u64,
}

pub type SharedState = Arc<Mutex<ServiceState>>;

impl ServiceState {
    pub fn new(topic: impl Into<String>, sequencers: IntGauge, warn_threshold: usize) -> Self {
        Self {
            registry: SequencerRegistry::new(sequencers, warn_threshold),
            tracker: PartitionTracker::new(topic),
            pending: PendingTickets::new(),
            processed: 0,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }
}
