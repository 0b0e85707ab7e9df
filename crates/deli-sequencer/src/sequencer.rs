//! Per-document sequencer: assigns the total order and forwards ticketed
//! operations to the outbound log.

use deli_common::message::{
    InboundMessage, OutboundMessage, RawOperationMessage, SequencedDocumentMessage,
    SequencedOperationMessage,
};
use deli_common::store::{CheckpointStore, ClientCheckpoint, DocumentCheckpoint};
use deli_common::types::Timestamp;
use deli_common::{Error, LogPosition, Result, SequenceNumber};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::log::LogProducer;
use crate::ticket::{Publisher, TicketHandle};

/// Result of handing one record to a sequencer.
#[derive(Debug)]
pub enum TicketOutcome {
    /// The record was applied; the handle resolves once it is published.
    Issued(TicketHandle),
    /// The record was already applied before the last restart.
    Redelivered,
}

/// Issues sequence numbers for one document.
///
/// Owns the document's counter, the reference sequence number of every client
/// it has heard from, and the derived minimum sequence number. State changes
/// happen synchronously inside [`ticket`](Self::ticket); publication runs on
/// the document's publisher task.
pub struct Sequencer {
    document_id: String,
    sequence_number: SequenceNumber,
    minimum_sequence_number: SequenceNumber,
    clients: BTreeMap<String, ClientCheckpoint>,
    log_position: Option<LogPosition>,
    /// Position persisted by a previous process; records at or before it on
    /// the same partition are re-deliveries.
    restored_position: Option<LogPosition>,
    /// State as of the last completed checkpoint.
    last_checkpoint: Option<DocumentCheckpoint>,
    publisher: Publisher,
    store: Arc<dyn CheckpointStore>,
}

impl Sequencer {
    /// Load the document's persisted state, or start fresh when there is none.
    pub async fn restore(
        document_id: &str,
        store: Arc<dyn CheckpointStore>,
        producer: Arc<dyn LogProducer>,
    ) -> Result<Self> {
        let checkpoint = store.load(document_id).await?;
        Ok(Self::from_checkpoint(document_id, checkpoint, store, producer))
    }

    pub fn from_checkpoint(
        document_id: &str,
        checkpoint: Option<DocumentCheckpoint>,
        store: Arc<dyn CheckpointStore>,
        producer: Arc<dyn LogProducer>,
    ) -> Self {
        let publisher = Publisher::spawn(document_id.to_string(), producer);

        match checkpoint {
            Some(checkpoint) => {
                info!(
                    document_id = document_id,
                    sequence_number = checkpoint.sequence_number,
                    minimum_sequence_number = checkpoint.minimum_sequence_number,
                    log_position = ?checkpoint.log_position,
                    "Restored sequencer"
                );
                Self {
                    document_id: document_id.to_string(),
                    sequence_number: checkpoint.sequence_number,
                    minimum_sequence_number: checkpoint.minimum_sequence_number,
                    clients: checkpoint
                        .clients
                        .iter()
                        .map(|client| (client.client_id.clone(), client.clone()))
                        .collect(),
                    log_position: checkpoint.log_position,
                    restored_position: checkpoint.log_position,
                    last_checkpoint: Some(checkpoint),
                    publisher,
                    store,
                }
            }
            None => Self {
                document_id: document_id.to_string(),
                sequence_number: 0,
                minimum_sequence_number: 0,
                clients: BTreeMap::new(),
                log_position: None,
                restored_position: None,
                last_checkpoint: None,
                publisher,
                store,
            },
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.minimum_sequence_number
    }

    /// Apply one parsed record read at `position`.
    pub fn ticket(
        &mut self,
        position: LogPosition,
        message: &InboundMessage,
    ) -> Result<TicketOutcome> {
        if message.document_id() != Some(self.document_id.as_str()) {
            return Err(Error::Internal(format!(
                "{:?} routed to sequencer for document {}",
                message.kind(),
                self.document_id
            )));
        }

        if let Some(restored) = &self.restored_position {
            if restored.covers(&position) {
                debug!(
                    document_id = %self.document_id,
                    position = %position,
                    restored = %restored,
                    "Skipping re-delivered record"
                );
                return Ok(TicketOutcome::Redelivered);
            }
        }

        let handle = match message {
            InboundMessage::RawOperation(raw) => self.sequence(position, raw)?,
            InboundMessage::UpdateReferenceSequenceNumber(update) => {
                self.update_reference(&update.client_id, update.sequence_number, update.timestamp);
                self.minimum_sequence_number = self.compute_minimum(self.sequence_number);
                self.publisher.barrier(position)
            }
            InboundMessage::Other => {
                return Err(Error::Internal(format!(
                    "untyped message routed to sequencer for document {}",
                    self.document_id
                )))
            }
        };

        self.log_position = Some(position);
        Ok(TicketOutcome::Issued(handle))
    }

    fn sequence(
        &mut self,
        position: LogPosition,
        raw: &RawOperationMessage,
    ) -> Result<TicketHandle> {
        if let Some(client_id) = &raw.client_id {
            self.update_reference(
                client_id,
                raw.operation.reference_sequence_number,
                raw.timestamp,
            );
        }

        let sequence_number = self.sequence_number + 1;
        let minimum_sequence_number = self.compute_minimum(sequence_number);

        let outbound = OutboundMessage::SequencedOperation(SequencedOperationMessage {
            document_id: self.document_id.clone(),
            operation: SequencedDocumentMessage {
                client_id: raw.client_id.clone(),
                client_sequence_number: raw.operation.client_sequence_number,
                reference_sequence_number: raw.operation.reference_sequence_number,
                sequence_number,
                minimum_sequence_number,
                op_type: raw.operation.op_type.clone(),
                contents: raw.operation.contents.clone(),
                timestamp: raw.timestamp,
            },
        });
        // Encode before committing the new number so a failure leaves no gap.
        let payload = outbound.to_bytes()?;

        self.sequence_number = sequence_number;
        self.minimum_sequence_number = minimum_sequence_number;
        Ok(self.publisher.publish(position, sequence_number, payload))
    }

    /// Reference numbers only move forward.
    fn update_reference(
        &mut self,
        client_id: &str,
        reference_sequence_number: SequenceNumber,
        timestamp: Timestamp,
    ) {
        let client = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientCheckpoint {
                client_id: client_id.to_string(),
                reference_sequence_number,
                last_update: timestamp,
            });
        client.reference_sequence_number = client
            .reference_sequence_number
            .max(reference_sequence_number);
        client.last_update = timestamp;
    }

    /// Lowest client reference number, or the sequence number itself with no
    /// clients. Never below the previous value nor above `sequence_number`.
    fn compute_minimum(&self, sequence_number: SequenceNumber) -> SequenceNumber {
        let slowest = self
            .clients
            .values()
            .map(|client| client.reference_sequence_number)
            .min()
            .unwrap_or(sequence_number);
        slowest
            .max(self.minimum_sequence_number)
            .min(sequence_number)
    }

    /// Current state in its durable form.
    pub fn snapshot(&self) -> DocumentCheckpoint {
        DocumentCheckpoint {
            document_id: self.document_id.clone(),
            sequence_number: self.sequence_number,
            minimum_sequence_number: self.minimum_sequence_number,
            clients: self.clients.values().cloned().collect(),
            log_position: self.log_position,
        }
    }

    /// Capture the current state and return the write that persists it.
    ///
    /// The future resolves to the persisted state, or `None` when the state
    /// equals the last checkpoint and nothing was written. Pass the persisted
    /// state to [`mark_checkpointed`](Self::mark_checkpointed) afterwards.
    pub fn checkpoint(&self) -> BoxFuture<'static, Result<Option<DocumentCheckpoint>>> {
        let snapshot = self.snapshot();
        let unchanged = self.last_checkpoint.as_ref() == Some(&snapshot);
        let store = self.store.clone();

        async move {
            if unchanged {
                debug!(document_id = %snapshot.document_id, "Checkpoint unchanged");
                return Ok(None);
            }
            store.upsert(&snapshot).await?;
            Ok(Some(snapshot))
        }
        .boxed()
    }

    pub fn mark_checkpointed(&mut self, checkpoint: DocumentCheckpoint) {
        self.last_checkpoint = Some(checkpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::memory::MemoryProducer;
    use deli_common::message::{DocumentMessage, UpdateReferenceSequenceNumberMessage};
    use deli_common::store::InMemoryCheckpointStore;

    fn raw(document_id: &str, client_id: &str, reference: u64) -> InboundMessage {
        raw_from(document_id, Some(client_id), reference)
    }

    fn raw_from(document_id: &str, client_id: Option<&str>, reference: u64) -> InboundMessage {
        InboundMessage::RawOperation(RawOperationMessage {
            document_id: document_id.to_string(),
            client_id: client_id.map(str::to_string),
            operation: DocumentMessage {
                client_sequence_number: 1,
                reference_sequence_number: reference,
                op_type: "op".to_string(),
                contents: serde_json::Value::Null,
            },
            timestamp: 0,
        })
    }

    fn update(document_id: &str, client_id: &str, sequence_number: u64) -> InboundMessage {
        InboundMessage::UpdateReferenceSequenceNumber(UpdateReferenceSequenceNumberMessage {
            document_id: document_id.to_string(),
            client_id: client_id.to_string(),
            sequence_number,
            timestamp: 0,
        })
    }

    fn issued(outcome: TicketOutcome) -> TicketHandle {
        match outcome {
            TicketOutcome::Issued(handle) => handle,
            TicketOutcome::Redelivered => panic!("record unexpectedly treated as re-delivered"),
        }
    }

    fn fresh(producer: Arc<MemoryProducer>) -> (Sequencer, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let sequencer = Sequencer::from_checkpoint("doc", None, store.clone(), producer);
        (sequencer, store)
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_gapless() {
        let producer = Arc::new(MemoryProducer::new());
        let (mut sequencer, _) = fresh(producer.clone());

        let mut last = None;
        for offset in 0..20 {
            let handle = issued(
                sequencer
                    .ticket(LogPosition::new(0, offset), &raw("doc", "a", 0))
                    .unwrap(),
            );
            assert_eq!(handle.sequence_number(), Some(offset as u64 + 1));
            last = Some(handle);
        }
        last.unwrap().wait().await.unwrap();

        assert_eq!(producer.sequence_numbers("doc"), (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reference_updates_do_not_consume_slots() {
        let producer = Arc::new(MemoryProducer::new());
        let (mut sequencer, _) = fresh(producer.clone());

        sequencer.ticket(LogPosition::new(0, 0), &raw("doc", "a", 0)).unwrap();
        let barrier = issued(
            sequencer
                .ticket(LogPosition::new(0, 1), &update("doc", "a", 1))
                .unwrap(),
        );
        assert_eq!(barrier.sequence_number(), None);
        let next = issued(
            sequencer
                .ticket(LogPosition::new(0, 2), &raw("doc", "a", 1))
                .unwrap(),
        );
        assert_eq!(next.sequence_number(), Some(2));

        barrier.wait().await.unwrap();
        next.wait().await.unwrap();
        assert_eq!(producer.sequence_numbers("doc"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_minimum_tracks_slowest_client() {
        let producer = Arc::new(MemoryProducer::new());
        let (mut sequencer, _) = fresh(producer.clone());

        // No clients known yet: the minimum follows the counter.
        sequencer
            .ticket(LogPosition::new(0, 0), &raw_from("doc", None, 0))
            .unwrap();
        assert_eq!(sequencer.minimum_sequence_number(), 1);

        sequencer.ticket(LogPosition::new(0, 1), &raw("doc", "a", 1)).unwrap();
        sequencer.ticket(LogPosition::new(0, 2), &raw("doc", "b", 2)).unwrap();
        assert_eq!(sequencer.sequence_number(), 3);
        assert_eq!(sequencer.minimum_sequence_number(), 1);

        sequencer.ticket(LogPosition::new(0, 3), &update("doc", "a", 3)).unwrap();
        assert_eq!(sequencer.minimum_sequence_number(), 2);

        // A stale acknowledgement never lowers a client or the minimum.
        sequencer.ticket(LogPosition::new(0, 4), &update("doc", "b", 0)).unwrap();
        assert_eq!(sequencer.minimum_sequence_number(), 2);

        let last = issued(sequencer.ticket(LogPosition::new(0, 5), &update("doc", "b", 3)).unwrap());
        assert_eq!(sequencer.minimum_sequence_number(), 3);
        last.wait().await.unwrap();

        let published = producer.sequenced("doc");
        let minimums: Vec<_> = published
            .iter()
            .map(|op| op.operation.minimum_sequence_number)
            .collect();
        assert_eq!(minimums, vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_wrong_document_is_rejected() {
        let producer = Arc::new(MemoryProducer::new());
        let (mut sequencer, _) = fresh(producer);

        let result = sequencer.ticket(LogPosition::new(0, 0), &raw("other", "a", 0));
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(sequencer.sequence_number(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_is_idempotent() {
        let producer = Arc::new(MemoryProducer::new());
        let (mut sequencer, store) = fresh(producer);

        sequencer.ticket(LogPosition::new(0, 0), &raw("doc", "a", 0)).unwrap();

        let persisted = sequencer.checkpoint().await.unwrap().unwrap();
        assert_eq!(persisted.sequence_number, 1);
        sequencer.mark_checkpointed(persisted);
        assert_eq!(store.write_count(), 1);

        assert!(sequencer.checkpoint().await.unwrap().is_none());
        assert!(sequencer.checkpoint().await.unwrap().is_none());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_captures_state_at_call_time() {
        let producer = Arc::new(MemoryProducer::new());
        let (mut sequencer, store) = fresh(producer);

        sequencer.ticket(LogPosition::new(0, 0), &raw("doc", "a", 0)).unwrap();
        let pending = sequencer.checkpoint();
        sequencer.ticket(LogPosition::new(0, 1), &raw("doc", "a", 0)).unwrap();

        let persisted = pending.await.unwrap().unwrap();
        assert_eq!(persisted.sequence_number, 1);
        assert_eq!(persisted.log_position, Some(LogPosition::new(0, 0)));
        assert_eq!(store.get("doc").await.unwrap().sequence_number, 1);
    }

    #[tokio::test]
    async fn test_restore_continues_and_skips_redeliveries() {
        let producer = Arc::new(MemoryProducer::new());
        let store = Arc::new(InMemoryCheckpointStore::new());
        store
            .insert(DocumentCheckpoint {
                document_id: "doc".to_string(),
                sequence_number: 7,
                minimum_sequence_number: 5,
                clients: vec![ClientCheckpoint {
                    client_id: "a".to_string(),
                    reference_sequence_number: 5,
                    last_update: 0,
                }],
                log_position: Some(LogPosition::new(1, 40)),
            })
            .await;

        let mut sequencer = Sequencer::restore("doc", store.clone(), producer.clone())
            .await
            .unwrap();

        let replay = sequencer
            .ticket(LogPosition::new(1, 40), &raw("doc", "a", 5))
            .unwrap();
        assert!(matches!(replay, TicketOutcome::Redelivered));

        let next = issued(
            sequencer
                .ticket(LogPosition::new(1, 41), &raw("doc", "a", 6))
                .unwrap(),
        );
        assert_eq!(next.sequence_number(), Some(8));
        next.wait().await.unwrap();

        // Restored state counts as already checkpointed.
        let restored = Sequencer::restore("doc", store.clone(), producer).await.unwrap();
        assert!(restored.checkpoint().await.unwrap().is_none());
        assert_eq!(store.write_count(), 0);
    }
}
