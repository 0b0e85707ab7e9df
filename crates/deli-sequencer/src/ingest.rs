//! Ordered intake of inbound records.
//!
//! A reader task pulls records from the consumer into a bounded queue and a
//! single worker task processes them one at a time, so processing order is
//! exactly arrival order. The only await on the worker is the first-record
//! restore of a document's sequencer.

use deli_common::{
    CheckpointStore, DeliMetrics, Error, InboundMessage, Result, ThroughputCounter,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointTrigger;
use crate::config::{DeliConfig, ParseErrorPolicy};
use crate::log::{InboundRecord, LogConsumer, LogProducer};
use crate::sequencer::{Sequencer, TicketOutcome};
use crate::state::SharedState;

/// Intake worker settings, taken from [`DeliConfig`].
#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub queue_capacity: usize,
    pub checkpoint_batch_size: u64,
    pub parse_error_policy: ParseErrorPolicy,
    pub throughput_log_interval: Duration,
}

impl From<&DeliConfig> for IngestionSettings {
    fn from(config: &DeliConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            checkpoint_batch_size: config.checkpoint_batch_size,
            parse_error_policy: config.parse_error_policy,
            throughput_log_interval: config.throughput_log_interval(),
        }
    }
}

pub struct IngestionLoop {
    settings: IngestionSettings,
    state: SharedState,
    store: Arc<dyn CheckpointStore>,
    producer: Arc<dyn LogProducer>,
    metrics: Arc<DeliMetrics>,
    trigger: CheckpointTrigger,
}

impl IngestionLoop {
    pub fn new(
        settings: IngestionSettings,
        state: SharedState,
        store: Arc<dyn CheckpointStore>,
        producer: Arc<dyn LogProducer>,
        metrics: Arc<DeliMetrics>,
        trigger: CheckpointTrigger,
    ) -> Self {
        Self {
            settings,
            state,
            store,
            producer,
            metrics,
            trigger,
        }
    }

    /// Start the reader and the worker. Transport errors are reported on
    /// `faults`; worker failures through the worker's join handle.
    pub fn spawn(
        self,
        consumer: Box<dyn LogConsumer>,
        faults: mpsc::UnboundedSender<Error>,
    ) -> IngestionHandle {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let (pause, paused) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));

        let reader = tokio::spawn(read_loop(
            consumer,
            tx,
            paused,
            depth.clone(),
            self.metrics.clone(),
            faults,
        ));
        let worker = tokio::spawn(self.work_loop(rx, depth.clone()));

        IngestionHandle {
            pause,
            depth,
            reader,
            worker,
        }
    }

    async fn work_loop(
        self,
        mut rx: mpsc::Receiver<InboundRecord>,
        depth: Arc<AtomicUsize>,
    ) -> Result<u64> {
        let throughput =
            ThroughputCounter::new("deli-intake", self.settings.throughput_log_interval);
        let mut handled = 0u64;

        while let Some(record) = rx.recv().await {
            throughput.produce();
            let result = self.process(&record).await;

            let remaining = depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            self.metrics.queue_depth.set(remaining as i64);

            if let Err(e) = result {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Intake worker failed"
                );
                return Err(e);
            }
            throughput.acknowledge();
            handled += 1;
        }

        info!(records = handled, "Intake drained");
        Ok(handled)
    }

    async fn process(&self, record: &InboundRecord) -> Result<()> {
        let message = match InboundMessage::parse(&record.value) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.parse_failures_total.inc();
                let err = Error::Parse {
                    partition: record.partition,
                    offset: record.offset,
                    reason: e.to_string(),
                };
                match self.settings.parse_error_policy {
                    ParseErrorPolicy::Fail => return Err(err),
                    ParseErrorPolicy::Skip => {
                        warn!(error = %err, "Skipping undecodable record");
                        return self.apply(record, None);
                    }
                }
            }
        };

        self.metrics
            .records_total
            .with_label_values(&[message.kind().as_str()])
            .inc();

        match message.document_id() {
            Some(document_id) => {
                let known = self.state.lock().registry.contains(document_id);
                if !known {
                    let sequencer = Sequencer::restore(
                        document_id,
                        self.store.clone(),
                        self.producer.clone(),
                    )
                    .await?;
                    self.state.lock().registry.insert(sequencer);
                }
                self.apply(record, Some((document_id, &message)))
            }
            None => {
                debug!(
                    partition = record.partition,
                    offset = record.offset,
                    "Untyped record tracked for offsets only"
                );
                self.apply(record, None)
            }
        }
    }

    /// Ticket the record (if it addresses a document) and track its offset in
    /// one critical section, then fire the count trigger on batch boundaries.
    fn apply(
        &self,
        record: &InboundRecord,
        routed: Option<(&str, &InboundMessage)>,
    ) -> Result<()> {
        let processed = {
            let mut state = self.state.lock();

            if let Some((document_id, message)) = routed {
                let sequencer = state.registry.get_mut(document_id).ok_or_else(|| {
                    Error::Internal(format!("No sequencer registered for {}", document_id))
                })?;

                match sequencer.ticket(record.position(), message)? {
                    TicketOutcome::Issued(handle) => {
                        if handle.sequence_number().is_some() {
                            self.metrics.tickets_total.inc();
                        }
                        state.pending.track(handle);
                    }
                    TicketOutcome::Redelivered => self.metrics.duplicates_total.inc(),
                }
            }

            state.tracker.update(record.partition, record.offset);
            state.processed += 1;
            state.processed
        };

        if processed % self.settings.checkpoint_batch_size == 0 {
            self.trigger.fire();
        }
        Ok(())
    }
}

async fn read_loop(
    mut consumer: Box<dyn LogConsumer>,
    tx: mpsc::Sender<InboundRecord>,
    mut paused: watch::Receiver<bool>,
    depth: Arc<AtomicUsize>,
    metrics: Arc<DeliMetrics>,
    faults: mpsc::UnboundedSender<Error>,
) {
    loop {
        tokio::select! {
            biased;
            // The watch guard is dropped inside the inner future so nothing
            // !Send is held across the pause below.
            _ = async { let _ = paused.wait_for(|paused| *paused).await; } => {
                consumer.pause().await;
                info!("Intake paused");
                break;
            }
            next = consumer.recv() => match next {
                Some(Ok(record)) => {
                    let queued = depth.fetch_add(1, Ordering::SeqCst) + 1;
                    metrics.queue_depth.set(queued as i64);
                    if tx.send(record).await.is_err() {
                        depth.fetch_sub(1, Ordering::SeqCst);
                        debug!("Intake worker gone; reader stopping");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Inbound log error");
                    consumer.close().await;
                    let _ = faults.send(e);
                    break;
                }
                None => {
                    info!("Inbound log closed");
                    break;
                }
            }
        }
    }
}

/// Running intake: reader and worker tasks plus the pause switch.
pub struct IngestionHandle {
    pause: watch::Sender<bool>,
    depth: Arc<AtomicUsize>,
    pub(crate) reader: JoinHandle<()>,
    pub(crate) worker: JoinHandle<Result<u64>>,
}

impl IngestionHandle {
    /// Stop reading new records. Queued records are still processed.
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    /// Records read but not yet processed.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub(crate) fn depth(&self) -> Arc<AtomicUsize> {
        self.depth.clone()
    }

    pub(crate) fn abort(&self) {
        self.reader.abort();
        self.worker.abort();
    }
}
