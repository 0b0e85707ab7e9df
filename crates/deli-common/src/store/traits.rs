//! Checkpoint store abstraction for per-document sequencing state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{LogPosition, SequenceNumber, Timestamp};

/// Last reference sequence number acknowledged by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCheckpoint {
    pub client_id: String,
    pub reference_sequence_number: SequenceNumber,
    pub last_update: Timestamp,
}

/// Durable image of one document's sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCheckpoint {
    pub document_id: String,
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
    /// Sorted by client id so equal states compare equal.
    #[serde(default)]
    pub clients: Vec<ClientCheckpoint>,
    /// Position of the last inbound record applied to this state.
    #[serde(default)]
    pub log_position: Option<LogPosition>,
}

impl DocumentCheckpoint {
    /// State of a document that has never been ticketed.
    pub fn empty(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            sequence_number: 0,
            minimum_sequence_number: 0,
            clients: Vec::new(),
            log_position: None,
        }
    }
}

/// Document-oriented durable store holding one record per document.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last persisted state for a document.
    async fn load(&self, document_id: &str) -> Result<Option<DocumentCheckpoint>>;

    /// Insert or replace the record for `checkpoint.document_id`.
    async fn upsert(&self, checkpoint: &DocumentCheckpoint) -> Result<()>;
}
