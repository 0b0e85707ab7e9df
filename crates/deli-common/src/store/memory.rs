//! In-memory implementation of CheckpointStore for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use super::traits::*;
use crate::error::{Error, Result};

/// In-memory implementation of CheckpointStore for testing.
///
/// Loads can be held behind a gate to simulate a slow store, and writes can be
/// switched to fail.
pub struct InMemoryCheckpointStore {
    documents: Arc<RwLock<HashMap<String, DocumentCheckpoint>>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
    load_gate: watch::Sender<bool>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        let (load_gate, _) = watch::channel(true);
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            writes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            load_gate,
        }
    }

    /// Seed a record as if a previous process had checkpointed it.
    pub async fn insert(&self, checkpoint: DocumentCheckpoint) {
        self.documents
            .write()
            .await
            .insert(checkpoint.document_id.clone(), checkpoint);
    }

    pub async fn get(&self, document_id: &str) -> Option<DocumentCheckpoint> {
        self.documents.read().await.get(document_id).cloned()
    }

    /// Number of upserts that reached the store.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Block every `load` until [`open_loads`](Self::open_loads) is called.
    pub fn hold_loads(&self) {
        self.load_gate.send_replace(false);
    }

    pub fn open_loads(&self) {
        self.load_gate.send_replace(true);
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, document_id: &str) -> Result<Option<DocumentCheckpoint>> {
        let mut gate = self.load_gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| Error::Storage("load gate closed".to_string()))?;

        let documents = self.documents.read().await;
        Ok(documents.get(document_id).cloned())
    }

    async fn upsert(&self, checkpoint: &DocumentCheckpoint) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "write rejected for document {}",
                checkpoint.document_id
            )));
        }

        let mut documents = self.documents.write().await;
        documents.insert(checkpoint.document_id.clone(), checkpoint.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_upsert_replaces_record() {
        let store = InMemoryCheckpointStore::new();

        let mut checkpoint = DocumentCheckpoint::empty("doc");
        checkpoint.sequence_number = 3;
        store.upsert(&checkpoint).await.unwrap();

        checkpoint.sequence_number = 7;
        store.upsert(&checkpoint).await.unwrap();

        let loaded = store.load("doc").await.unwrap().unwrap();
        assert_eq!(loaded.sequence_number, 7);
        assert_eq!(store.write_count(), 2);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_writes_are_not_counted() {
        let store = InMemoryCheckpointStore::new();
        store.set_fail_writes(true);

        let result = store.upsert(&DocumentCheckpoint::empty("doc")).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_held_loads_wait_for_gate() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.hold_loads();

        let loader = {
            let store = store.clone();
            tokio::spawn(async move { store.load("doc").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!loader.is_finished());

        store.open_loads();
        assert!(loader.await.unwrap().unwrap().is_none());
    }
}
