//! Checkpoint coordinator.
//!
//! One task owns every checkpoint cycle, so cycles never overlap. A cycle:
//!
//! 1. **Collecting**: under the service lock, take the pending ticket
//!    handles, capture a checkpoint of every sequencer that produced one, and
//!    snapshot the partition offsets.
//! 2. **Joining**: wait for every captured handle to resolve.
//! 3. **Persisting**: write the captured sequencer state.
//! 4. **Committing**: commit the captured offsets to the inbound log.
//!
//! Offsets are only committed once everything they cover has been published
//! and persisted. Any failure ends the cycle and is fatal to the service.

use deli_common::{DeliMetrics, DocumentCheckpoint, Error, PartitionOffset, Result};
use futures::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::log::OffsetCommitter;
use crate::state::SharedState;

/// Phase of the checkpoint cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// No cycle in progress.
    Idle,
    /// Capturing tickets, sequencer state and offsets.
    Collecting,
    /// Waiting for captured tickets to be published.
    Joining,
    /// Writing sequencer state to the store.
    Persisting,
    /// Committing offsets to the inbound log.
    Committing,
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Collecting => write!(f, "Collecting"),
            Self::Joining => write!(f, "Joining"),
            Self::Persisting => write!(f, "Persisting"),
            Self::Committing => write!(f, "Committing"),
        }
    }
}

/// Why a cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// The intake worker processed another batch of records
    Count,
    /// The checkpoint interval elapsed
    Timer,
    /// Final cycle after the intake drained
    Shutdown,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::Count => "count",
            CheckpointReason::Timer => "timer",
            CheckpointReason::Shutdown => "shutdown",
        }
    }
}

/// Wakes the coordinator for a count-based cycle.
///
/// Fires while a cycle is running are merged into one follow-up cycle.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTrigger {
    notify: Arc<Notify>,
}

impl CheckpointTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn fired(&self) {
        self.notify.notified().await;
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Documents with tickets in the window
    pub documents: usize,
    /// Sequencer records written (unchanged state is skipped)
    pub persisted: usize,
    /// Offsets handed to the committer
    pub committed: Vec<PartitionOffset>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.documents == 0 && self.committed.is_empty()
    }
}

pub struct CheckpointCoordinator {
    state: SharedState,
    committer: Arc<dyn OffsetCommitter>,
    topic: String,
    metrics: Arc<DeliMetrics>,
    trigger: CheckpointTrigger,
    interval: Duration,
    phase: watch::Sender<CheckpointPhase>,
}

impl CheckpointCoordinator {
    pub fn new(
        state: SharedState,
        committer: Arc<dyn OffsetCommitter>,
        topic: impl Into<String>,
        metrics: Arc<DeliMetrics>,
        trigger: CheckpointTrigger,
        interval: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(CheckpointPhase::Idle);
        Self {
            state,
            committer,
            topic: topic.into(),
            metrics,
            trigger,
            interval,
            phase,
        }
    }

    /// Observe the current phase.
    pub fn phase(&self) -> watch::Receiver<CheckpointPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: CheckpointPhase) {
        self.phase.send_replace(phase);
    }

    /// Run cycles on trigger or timer until `shutdown` flips to true (or its
    /// sender goes away), then optionally run a final cycle.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, final_cycle: bool) -> Result<()> {
        info!(
            topic = %self.topic,
            interval_ms = self.interval.as_millis() as u64,
            "Checkpoint coordinator started"
        );

        let mut deadline = Instant::now() + self.interval;
        loop {
            let reason = tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = self.trigger.fired() => CheckpointReason::Count,
                _ = tokio::time::sleep_until(deadline) => CheckpointReason::Timer,
            };

            self.run_cycle(reason).await?;
            deadline = Instant::now() + self.interval;
        }

        if final_cycle {
            self.run_cycle(CheckpointReason::Shutdown).await?;
        }

        info!(topic = %self.topic, "Checkpoint coordinator stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(reason = reason.as_str()))]
    pub async fn run_cycle(&self, reason: CheckpointReason) -> Result<CycleReport> {
        let started = std::time::Instant::now();

        self.enter(CheckpointPhase::Collecting);
        let (window, checkpoints, offsets) = {
            let mut state = self.state.lock();
            let window = state.pending.take();
            let checkpoints: Vec<_> = window
                .documents()
                .filter_map(|document_id| state.registry.get(document_id))
                .map(|sequencer| sequencer.checkpoint())
                .collect();
            let offsets = state.tracker.checkpoint();
            (window, checkpoints, offsets)
        };

        if window.is_empty() && offsets.is_empty() {
            self.enter(CheckpointPhase::Idle);
            debug!("Nothing to checkpoint");
            return Ok(CycleReport::default());
        }

        let documents = window.len();

        self.enter(CheckpointPhase::Joining);
        window.join().await?;

        self.enter(CheckpointPhase::Persisting);
        let persisted: Vec<DocumentCheckpoint> = try_join_all(checkpoints)
            .await
            .map_err(|e| Error::Checkpoint(format!("Persisting sequencer state failed: {}", e)))?
            .into_iter()
            .flatten()
            .collect();
        let persisted_count = persisted.len();
        {
            let mut state = self.state.lock();
            for checkpoint in persisted {
                if let Some(sequencer) = state.registry.get_mut(&checkpoint.document_id) {
                    sequencer.mark_checkpointed(checkpoint);
                }
            }
        }

        self.enter(CheckpointPhase::Committing);
        if !offsets.is_empty() {
            self.committer
                .commit(&self.topic, &offsets)
                .await
                .map_err(|e| Error::Checkpoint(format!("Offset commit failed: {}", e)))?;
            self.state.lock().tracker.mark_committed(&offsets);
            self.metrics.record_commit(&offsets);
        }

        self.enter(CheckpointPhase::Idle);

        let elapsed = started.elapsed();
        self.metrics
            .checkpoint_cycles_total
            .with_label_values(&[reason.as_str()])
            .inc();
        self.metrics
            .checkpoint_duration
            .with_label_values(&[reason.as_str()])
            .observe(elapsed.as_secs_f64());

        info!(
            documents = documents,
            persisted = persisted_count,
            offsets = ?offsets,
            elapsed_ms = elapsed.as_millis() as u64,
            "Checkpoint complete"
        );

        Ok(CycleReport {
            documents,
            persisted: persisted_count,
            committed: offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::memory::{MemoryCommitter, MemoryProducer};
    use crate::sequencer::{Sequencer, TicketOutcome};
    use crate::state::ServiceState;
    use deli_common::store::InMemoryCheckpointStore;
    use deli_common::{InboundMessage, LogPosition};

    struct Fixture {
        state: SharedState,
        producer: Arc<MemoryProducer>,
        store: Arc<InMemoryCheckpointStore>,
        committer: Arc<MemoryCommitter>,
        trigger: CheckpointTrigger,
        metrics: Arc<DeliMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let metrics = Arc::new(DeliMetrics::new().unwrap());
            let state = ServiceState::new("raw", metrics.sequencers.clone(), 100).shared();
            Self {
                state,
                producer: Arc::new(MemoryProducer::new()),
                store: Arc::new(InMemoryCheckpointStore::new()),
                committer: Arc::new(MemoryCommitter::new()),
                trigger: CheckpointTrigger::new(),
                metrics,
            }
        }

        fn coordinator(&self, interval: Duration) -> CheckpointCoordinator {
            CheckpointCoordinator::new(
                self.state.clone(),
                self.committer.clone(),
                "raw",
                self.metrics.clone(),
                self.trigger.clone(),
                interval,
            )
        }

        /// Process one raw operation the way the intake worker does.
        fn ingest(&self, document_id: &str, offset: i64) {
            let message = InboundMessage::parse(
                format!(
                    r#"{{"type":"RawOperation","documentId":"{}","clientId":"c",
                        "operation":{{"clientSequenceNumber":1,"referenceSequenceNumber":0,"type":"op"}}}}"#,
                    document_id
                )
                .as_bytes(),
            )
            .unwrap();

            let mut state = self.state.lock();
            if !state.registry.contains(document_id) {
                let sequencer = Sequencer::from_checkpoint(
                    document_id,
                    None,
                    self.store.clone(),
                    self.producer.clone(),
                );
                state.registry.insert(sequencer);
            }
            let sequencer = state.registry.get_mut(document_id).unwrap();
            match sequencer.ticket(LogPosition::new(0, offset), &message).unwrap() {
                TicketOutcome::Issued(handle) => state.pending.track(handle),
                TicketOutcome::Redelivered => panic!("unexpected re-delivery"),
            }
            state.tracker.update(0, offset);
            state.processed += 1;
        }
    }

    #[tokio::test]
    async fn test_commit_waits_for_ticket_completion() {
        let fixture = Fixture::new();
        fixture.producer.hold();
        fixture.ingest("a", 1);
        fixture.ingest("a", 2);

        let coordinator = Arc::new(fixture.coordinator(Duration::from_secs(60)));
        let mut phase = coordinator.phase();
        let cycle = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_cycle(CheckpointReason::Count).await })
        };

        phase
            .wait_for(|phase| *phase == CheckpointPhase::Joining)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fixture.committer.commits().is_empty());
        assert_eq!(fixture.store.write_count(), 0);

        fixture.producer.release();
        let report = cycle.await.unwrap().unwrap();

        assert_eq!(report.documents, 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(fixture.committer.committed(0), Some(2));
        assert_eq!(fixture.store.get("a").await.unwrap().sequence_number, 2);
        assert_eq!(*coordinator.phase().borrow(), CheckpointPhase::Idle);
        assert_eq!(
            fixture
                .metrics
                .checkpoint_cycles_total
                .with_label_values(&["count"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_cycle_is_noop() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(Duration::from_secs(60));

        let report = coordinator.run_cycle(CheckpointReason::Timer).await.unwrap();
        assert!(report.is_empty());
        assert!(fixture.committer.commits().is_empty());
    }

    #[tokio::test]
    async fn test_untyped_records_commit_without_persisting() {
        let fixture = Fixture::new();
        {
            let mut state = fixture.state.lock();
            state.tracker.update(0, 0);
            state.processed += 1;
        }

        let coordinator = fixture.coordinator(Duration::from_secs(60));
        let report = coordinator.run_cycle(CheckpointReason::Count).await.unwrap();

        assert_eq!(report.documents, 0);
        assert_eq!(report.persisted, 0);
        assert_eq!(
            fixture.committer.commits(),
            vec![vec![PartitionOffset { partition: 0, offset: 0 }]]
        );
        assert_eq!(fixture.store.write_count(), 0);

        let again = coordinator.run_cycle(CheckpointReason::Timer).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(fixture.committer.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_cycle_writes_nothing() {
        let fixture = Fixture::new();
        fixture.ingest("a", 0);
        fixture.ingest("b", 1);

        let coordinator = fixture.coordinator(Duration::from_secs(60));
        coordinator.run_cycle(CheckpointReason::Count).await.unwrap();
        assert_eq!(fixture.store.write_count(), 2);

        let again = coordinator.run_cycle(CheckpointReason::Timer).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(fixture.store.write_count(), 2);
        assert_eq!(fixture.committer.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_cycle_before_commit() {
        let fixture = Fixture::new();
        fixture.producer.set_fail_sends(true);
        fixture.ingest("a", 0);

        let coordinator = fixture.coordinator(Duration::from_secs(60));
        let err = coordinator.run_cycle(CheckpointReason::Count).await.unwrap_err();

        assert!(err.is_publish());
        assert!(fixture.committer.commits().is_empty());
        assert_eq!(fixture.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_fails_cycle_before_commit() {
        let fixture = Fixture::new();
        fixture.store.set_fail_writes(true);
        fixture.ingest("a", 0);

        let coordinator = fixture.coordinator(Duration::from_secs(60));
        let err = coordinator.run_cycle(CheckpointReason::Count).await.unwrap_err();

        assert!(matches!(err, Error::Checkpoint(_)));
        assert!(fixture.committer.commits().is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_offsets_uncommitted() {
        let fixture = Fixture::new();
        fixture.committer.set_fail_commits(true);
        fixture.ingest("a", 4);

        let coordinator = fixture.coordinator(Duration::from_secs(60));
        let err = coordinator.run_cycle(CheckpointReason::Count).await.unwrap_err();

        assert!(matches!(err, Error::Checkpoint(_)));
        assert_eq!(fixture.state.lock().tracker.committed(0), None);
        assert!(!fixture
            .metrics
            .export_prometheus()
            .unwrap()
            .contains("deli_committed_offset{"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_triggers_cycle() {
        let fixture = Fixture::new();
        fixture.ingest("a", 0);

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(fixture.coordinator(Duration::from_secs(1)).run(shutdown, false));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fixture.committer.committed(0), Some(0));

        stop.send_replace(true);
        task.await.unwrap().unwrap();
        assert_eq!(
            fixture
                .metrics
                .checkpoint_cycles_total
                .with_label_values(&["timer"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_triggers_during_cycle_merge_into_one() {
        let fixture = Fixture::new();
        fixture.producer.hold();
        fixture.ingest("a", 0);

        let coordinator = fixture.coordinator(Duration::from_secs(60));
        let mut phase = coordinator.phase();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(shutdown, false));

        fixture.trigger.fire();
        phase
            .wait_for(|phase| *phase == CheckpointPhase::Joining)
            .await
            .unwrap();

        // More work and more triggers while the first cycle is blocked.
        fixture.ingest("a", 1);
        fixture.trigger.fire();
        fixture.trigger.fire();
        fixture.trigger.fire();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*phase.borrow(), CheckpointPhase::Joining);
        assert!(fixture.committer.commits().is_empty());

        fixture.producer.release();
        let cycles = || {
            fixture
                .metrics
                .checkpoint_cycles_total
                .with_label_values(&["count"])
                .get()
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while cycles() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cycles(), 2);
        assert_eq!(
            fixture.committer.commits(),
            vec![
                vec![PartitionOffset { partition: 0, offset: 0 }],
                vec![PartitionOffset { partition: 0, offset: 1 }],
            ]
        );

        stop.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_trigger_and_final_cycle() {
        let fixture = Fixture::new();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(fixture.coordinator(Duration::from_secs(60)).run(shutdown, true));

        fixture.ingest("a", 0);
        fixture.trigger.fire();
        fixture.trigger.fire();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.committer.committed(0), Some(0));

        fixture.ingest("a", 1);
        stop.send_replace(true);
        task.await.unwrap().unwrap();

        assert_eq!(fixture.committer.committed(0), Some(1));
        assert_eq!(fixture.store.get("a").await.unwrap().sequence_number, 2);
        assert_eq!(
            fixture
                .metrics
                .checkpoint_cycles_total
                .with_label_values(&["shutdown"])
                .get(),
            1
        );
    }
}
