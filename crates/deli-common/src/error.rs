//! Error types for the Deli sequencer.

use std::sync::Arc;
use thiserror::Error;

use crate::types::{Offset, PartitionId};

/// Result type alias for Deli operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Deli.
///
/// Nearly every variant is fatal to a running service: the supervisor stops
/// intake and fails the completion signal, and recovery happens by restarting
/// from the last checkpoint.
#[derive(Error, Debug)]
pub enum Error {
    /// The inbound log consumer reported an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound payload could not be decoded
    #[error("Parse error at partition {partition} offset {offset}: {reason}")]
    Parse {
        partition: PartitionId,
        offset: Offset,
        reason: String,
    },

    /// A ticketed operation failed to reach the outbound log
    #[error("Publish error for document {document_id}: {reason}")]
    Publish { document_id: String, reason: String },

    /// Persisting sequencer state or committing offsets failed mid-cycle
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Terminal failure observed through a service's completion signal
    #[error(transparent)]
    Failed(Arc<Error>),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Unwraps a terminal failure down to the error that caused it.
    pub fn root(&self) -> &Error {
        match self {
            Error::Failed(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the error came from the outbound publish path.
    pub fn is_publish(&self) -> bool {
        matches!(self.root(), Error::Publish { .. })
    }

    /// Whether the error came from the inbound log consumer.
    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Error::Transport(_))
    }

    /// Whether the error is a payload decoding failure.
    pub fn is_parse(&self) -> bool {
        matches!(self.root(), Error::Parse { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics: {}", e))
    }
}
