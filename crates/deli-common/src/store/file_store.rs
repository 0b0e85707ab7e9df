//! File-based checkpoint store
//!
//! Keeps one JSON document per sequencer under a directory. Each upsert writes
//! a temporary file and renames it over the previous record, so a crash leaves
//! either the old or the new state on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::traits::*;
use crate::error::{Error, Result};
use crate::types::{Offset, PartitionId};

/// On-disk envelope around a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCheckpoint {
    checkpoint: DocumentCheckpoint,
    checkpointed_at: DateTime<Utc>,
}

/// File-based implementation of CheckpointStore
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let root = data_dir.as_ref().join("documents");
        fs::create_dir_all(&root).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to create checkpoint directory {}: {}",
                root.display(),
                e
            ))
        })?;

        info!("Checkpoint store opened at {}", root.display());
        Ok(Self { root })
    }

    /// Highest log position on `partition` recorded by any stored document.
    pub async fn max_log_offset(&self, partition: PartitionId) -> Result<Option<Offset>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            Error::Storage(format!("Failed to list {}: {}", self.root.display(), e))
        })?;

        let mut highest: Option<Offset> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            let stored: StoredCheckpoint = serde_json::from_str(&content)?;
            if let Some(position) = stored.checkpoint.log_position {
                if position.partition == partition {
                    highest = Some(highest.map_or(position.offset, |h| h.max(position.offset)));
                }
            }
        }
        Ok(highest)
    }

    fn document_path(&self, document_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_file_name(document_id)))
    }
}

/// Escape everything outside `[A-Za-z0-9_-]` so arbitrary ids map to distinct
/// file names.
fn encode_file_name(document_id: &str) -> String {
    let mut name = String::with_capacity(document_id.len());
    for byte in document_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            let _ = write!(name, "%{:02X}", byte);
        }
    }
    name
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, document_id: &str) -> Result<Option<DocumentCheckpoint>> {
        let path = self.document_path(document_id);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read checkpoint {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let stored: StoredCheckpoint = serde_json::from_str(&content)?;
        debug!(
            document_id = document_id,
            sequence_number = stored.checkpoint.sequence_number,
            checkpointed_at = %stored.checkpointed_at,
            "Loaded document checkpoint"
        );
        Ok(Some(stored.checkpoint))
    }

    async fn upsert(&self, checkpoint: &DocumentCheckpoint) -> Result<()> {
        let stored = StoredCheckpoint {
            checkpoint: checkpoint.clone(),
            checkpointed_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&stored)?;

        let path = self.document_path(&checkpoint.document_id);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write checkpoint: {}", e)))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to rename checkpoint file: {}", e)))?;

        debug!(
            document_id = %checkpoint.document_id,
            sequence_number = checkpoint.sequence_number,
            "Persisted document checkpoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogPosition;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();

        let mut checkpoint = DocumentCheckpoint::empty("tenant/doc 1");
        checkpoint.sequence_number = 42;
        checkpoint.minimum_sequence_number = 40;
        checkpoint.log_position = Some(LogPosition::new(3, 1001));
        checkpoint.clients.push(ClientCheckpoint {
            client_id: "a".to_string(),
            reference_sequence_number: 40,
            last_update: 5,
        });

        {
            let store = FileCheckpointStore::new(temp_dir.path()).await.unwrap();
            store.upsert(&checkpoint).await.unwrap();
        }

        let store = FileCheckpointStore::new(temp_dir.path()).await.unwrap();
        let loaded = store.load("tenant/doc 1").await.unwrap();
        assert_eq!(loaded, Some(checkpoint));
        assert!(store.load("tenant/doc 2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_log_offset_per_partition() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path()).await.unwrap();
        assert_eq!(store.max_log_offset(0).await.unwrap(), None);

        for (document_id, partition, offset) in [("a", 0, 7), ("b", 0, 12), ("c", 1, 30)] {
            let mut checkpoint = DocumentCheckpoint::empty(document_id);
            checkpoint.log_position = Some(LogPosition::new(partition, offset));
            store.upsert(&checkpoint).await.unwrap();
        }
        store.upsert(&DocumentCheckpoint::empty("fresh")).await.unwrap();

        assert_eq!(store.max_log_offset(0).await.unwrap(), Some(12));
        assert_eq!(store.max_log_offset(1).await.unwrap(), Some(30));
        assert_eq!(store.max_log_offset(2).await.unwrap(), None);
    }

    #[test]
    fn test_encoded_names_do_not_collide() {
        assert_eq!(encode_file_name("plain-id_1"), "plain-id_1");
        assert_ne!(encode_file_name("a/b"), encode_file_name("a_b"));
        assert_eq!(encode_file_name("a/b"), "a%2Fb");
    }
}
