//! Ticket completion handles and the per-document publisher.
//!
//! Each sequencer owns one publisher task. Requests are handled strictly in
//! the order they were issued, so a handle resolving means every earlier
//! request for the same document has resolved too. The first failed send
//! poisons the publisher: nothing after it is sent and every later handle
//! fails with the same reason. That is what lets the pending set keep only
//! the newest handle per document.

use bytes::Bytes;
use deli_common::{Error, LogPosition, Result, SequenceNumber};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::log::LogProducer;

/// Completion token for one ticketing call.
#[derive(Debug)]
pub struct TicketHandle {
    document_id: String,
    position: LogPosition,
    sequence_number: Option<SequenceNumber>,
    done: oneshot::Receiver<Result<()>>,
}

impl TicketHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Sequence number assigned by the call, `None` for reference updates.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_number
    }

    /// Wait until the ticketed record (and everything before it for this
    /// document) is durably published.
    pub async fn wait(self) -> Result<()> {
        let document_id = self.document_id;
        self.done.await.map_err(|_| Error::Publish {
            document_id,
            reason: "publisher stopped before completing the ticket".to_string(),
        })?
    }
}

enum PublishRequest {
    /// Append a sequenced payload
    Send {
        sequence_number: SequenceNumber,
        payload: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    /// Resolve once everything queued before it has resolved
    Barrier { done: oneshot::Sender<Result<()>> },
}

/// Sending half of a document's publisher task.
#[derive(Debug, Clone)]
pub(crate) struct Publisher {
    document_id: String,
    tx: mpsc::UnboundedSender<PublishRequest>,
}

impl std::fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishRequest::Send { sequence_number, .. } => f
                .debug_struct("Send")
                .field("sequence_number", sequence_number)
                .finish(),
            PublishRequest::Barrier { .. } => f.write_str("Barrier"),
        }
    }
}

impl Publisher {
    /// Spawn the publisher task for a document.
    pub(crate) fn spawn(document_id: String, producer: Arc<dyn LogProducer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_publisher(document_id.clone(), producer, rx));
        Self { document_id, tx }
    }

    pub(crate) fn publish(
        &self,
        position: LogPosition,
        sequence_number: SequenceNumber,
        payload: Bytes,
    ) -> TicketHandle {
        let (done, rx) = oneshot::channel();
        self.enqueue(PublishRequest::Send {
            sequence_number,
            payload,
            done,
        });
        TicketHandle {
            document_id: self.document_id.clone(),
            position,
            sequence_number: Some(sequence_number),
            done: rx,
        }
    }

    pub(crate) fn barrier(&self, position: LogPosition) -> TicketHandle {
        let (done, rx) = oneshot::channel();
        self.enqueue(PublishRequest::Barrier { done });
        TicketHandle {
            document_id: self.document_id.clone(),
            position,
            sequence_number: None,
            done: rx,
        }
    }

    fn enqueue(&self, request: PublishRequest) {
        // A closed channel drops the request and with it the completion
        // sender, so the handle reports the failure when awaited.
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            error!(
                document_id = %self.document_id,
                request = ?request,
                "Publisher task is gone"
            );
        }
    }
}

async fn run_publisher(
    document_id: String,
    producer: Arc<dyn LogProducer>,
    mut rx: mpsc::UnboundedReceiver<PublishRequest>,
) {
    let mut poisoned: Option<String> = None;

    while let Some(request) = rx.recv().await {
        match request {
            PublishRequest::Send {
                sequence_number,
                payload,
                done,
            } => {
                let result = match &poisoned {
                    Some(reason) => Err(Error::Publish {
                        document_id: document_id.clone(),
                        reason: reason.clone(),
                    }),
                    None => producer.send(&document_id, payload).await,
                };

                match &result {
                    Ok(()) => debug!(
                        document_id = %document_id,
                        sequence_number = sequence_number,
                        "Published sequenced operation"
                    ),
                    Err(e) if poisoned.is_none() => {
                        error!(
                            document_id = %document_id,
                            sequence_number = sequence_number,
                            error = %e,
                            "Publish failed; later operations for this document are withheld"
                        );
                        poisoned = Some(e.to_string());
                    }
                    Err(_) => {}
                }

                let _ = done.send(result);
            }
            PublishRequest::Barrier { done } => {
                let result = match &poisoned {
                    Some(reason) => Err(Error::Publish {
                        document_id: document_id.clone(),
                        reason: reason.clone(),
                    }),
                    None => Ok(()),
                };
                let _ = done.send(result);
            }
        }
    }

    debug!(document_id = %document_id, "Publisher stopped");
}
