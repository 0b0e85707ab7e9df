//! Service lifecycle: start, supervised run, graceful stop.

use deli_common::{CheckpointStore, DeliMetrics, Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointCoordinator, CheckpointPhase, CheckpointTrigger};
use crate::config::DeliConfig;
use crate::ingest::{IngestionHandle, IngestionLoop, IngestionSettings};
use crate::log::{LogConsumer, LogProducer, OffsetCommitter};
use crate::state::{ServiceState, SharedState};

/// Where the service is in its lifecycle.
///
/// `Running → Stopping → Stopped`, or `Failed` from any non-terminal state.
/// Terminal states are final.
#[derive(Debug, Clone)]
pub enum LifecycleState {
    Running,
    Stopping,
    Stopped,
    Failed(Arc<Error>),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed(_))
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// A configured, not yet started sequencing service.
pub struct DeliService {
    config: DeliConfig,
    consumer: Box<dyn LogConsumer>,
    producer: Arc<dyn LogProducer>,
    committer: Arc<dyn OffsetCommitter>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<DeliMetrics>,
}

impl DeliService {
    pub fn new(
        config: DeliConfig,
        consumer: impl LogConsumer + 'static,
        producer: Arc<dyn LogProducer>,
        committer: Arc<dyn OffsetCommitter>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            consumer: Box::new(consumer),
            producer,
            committer,
            store,
            metrics: Arc::new(DeliMetrics::new()?),
        })
    }

    pub fn metrics(&self) -> Arc<DeliMetrics> {
        self.metrics.clone()
    }

    /// Start intake and checkpointing under a supervisor task.
    pub fn start(self) -> ServiceHandle {
        let config = self.config;
        info!(
            group_id = %config.group_id,
            receive_topic = %config.receive_topic,
            send_topic = %config.send_topic,
            checkpoint_batch_size = config.checkpoint_batch_size,
            checkpoint_interval_ms = config.checkpoint_interval_ms,
            "Starting deli service"
        );

        let state = ServiceState::new(
            config.receive_topic.clone(),
            self.metrics.sequencers.clone(),
            config.sequencer_warn_threshold,
        )
        .shared();
        let trigger = CheckpointTrigger::new();

        let coordinator = CheckpointCoordinator::new(
            state.clone(),
            self.committer,
            config.receive_topic.clone(),
            self.metrics.clone(),
            trigger.clone(),
            config.checkpoint_interval(),
        );
        let phase = coordinator.phase();
        let (coordinator_stop, coordinator_shutdown) = watch::channel(false);
        let coordinator =
            tokio::spawn(coordinator.run(coordinator_shutdown, config.checkpoint_on_stop));

        let (faults_tx, faults) = mpsc::unbounded_channel();
        let ingestion = IngestionLoop::new(
            IngestionSettings::from(&config),
            state.clone(),
            self.store,
            self.producer,
            self.metrics.clone(),
            trigger,
        )
        .spawn(self.consumer, faults_tx);
        let depth = ingestion.depth();

        let (stop, stop_requested) = watch::channel(false);
        let (lifecycle_tx, lifecycle) = watch::channel(LifecycleState::Running);

        let supervisor = Supervisor {
            ingestion,
            worker_done: false,
            faults,
            coordinator,
            coordinator_stop,
            stop_requested,
            lifecycle: lifecycle_tx,
        };
        tokio::spawn(supervisor.run());

        ServiceHandle {
            stop: Arc::new(stop),
            lifecycle,
            depth,
            phase,
            state,
            metrics: self.metrics,
        }
    }
}

/// Control and observation handle for a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    stop: Arc<watch::Sender<bool>>,
    lifecycle: watch::Receiver<LifecycleState>,
    depth: Arc<AtomicUsize>,
    phase: watch::Receiver<CheckpointPhase>,
    state: SharedState,
    metrics: Arc<DeliMetrics>,
}

impl ServiceHandle {
    /// Pause intake, drain the queue, run the final checkpoint and wait for
    /// the outcome. Returns the same result as [`completed`](Self::completed).
    pub async fn stop(&self) -> Result<()> {
        self.stop.send_replace(true);
        self.completed().await
    }

    /// Resolves once the service reaches a terminal state.
    pub async fn completed(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.clone();
        let state = lifecycle
            .wait_for(LifecycleState::is_terminal)
            .await
            .map_err(|_| Error::Internal("Supervisor exited without a final state".to_string()))?
            .clone();

        match state {
            LifecycleState::Failed(e) => Err(Error::Failed(e)),
            _ => Ok(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.borrow().clone()
    }

    /// Records read from the log and not yet processed.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn checkpoint_phase(&self) -> CheckpointPhase {
        *self.phase.borrow()
    }

    /// Records fully processed by the intake worker.
    pub fn processed(&self) -> u64 {
        self.state.lock().processed
    }

    pub fn sequencers(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn metrics(&self) -> Arc<DeliMetrics> {
        self.metrics.clone()
    }
}

struct Supervisor {
    ingestion: IngestionHandle,
    worker_done: bool,
    faults: mpsc::UnboundedReceiver<Error>,
    coordinator: JoinHandle<Result<()>>,
    coordinator_stop: watch::Sender<bool>,
    stop_requested: watch::Receiver<bool>,
    lifecycle: watch::Sender<LifecycleState>,
}

impl Supervisor {
    async fn run(mut self) {
        let result = match self.watch().await {
            Ok(()) => self.drain().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Deli service stopped");
                self.lifecycle.send_replace(LifecycleState::Stopped);
            }
            Err(e) => {
                error!(error = %e, "Deli service failed");
                self.ingestion.abort();
                self.coordinator.abort();
                self.lifecycle.send_replace(LifecycleState::Failed(Arc::new(e)));
            }
        }
    }

    /// Wait until stop is requested or a component fails.
    async fn watch(&mut self) -> Result<()> {
        loop {
            let stop_requested = &mut self.stop_requested;
            tokio::select! {
                biased;
                Some(fault) = self.faults.recv() => return Err(fault),
                result = &mut self.ingestion.worker, if !self.worker_done => {
                    let handled = joined(result, "intake worker")?;
                    self.worker_done = true;
                    warn!(records = handled, "Inbound log ended; waiting for stop");
                }
                result = &mut self.coordinator => {
                    joined(result, "checkpoint coordinator")?;
                    return Err(Error::Internal(
                        "Checkpoint coordinator exited while running".to_string(),
                    ));
                }
                _ = async { let _ = stop_requested.wait_for(|stop| *stop).await; } => {
                    return Ok(())
                }
            }
        }
    }

    /// Pause intake, let the worker empty the queue, then run the final
    /// checkpoint.
    async fn drain(&mut self) -> Result<()> {
        self.lifecycle.send_replace(LifecycleState::Stopping);
        info!(
            queued = self.ingestion.queue_depth(),
            "Stopping: pausing intake and draining queue"
        );

        self.ingestion.pause();
        if !self.worker_done {
            let handled = joined((&mut self.ingestion.worker).await, "intake worker")?;
            self.worker_done = true;
            info!(records = handled, "Intake worker finished");
        }
        if let Err(e) = (&mut self.ingestion.reader).await {
            return Err(Error::Internal(format!("Intake reader panicked: {}", e)));
        }
        if let Ok(fault) = self.faults.try_recv() {
            return Err(fault);
        }

        self.coordinator_stop.send_replace(true);
        joined((&mut self.coordinator).await, "checkpoint coordinator")
    }
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>, task: &str) -> Result<T> {
    result.map_err(|e| Error::Internal(format!("{} panicked: {}", task, e)))?
}
