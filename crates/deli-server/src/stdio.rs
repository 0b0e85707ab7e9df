//! Line-oriented driver: JSON records in on one stream, sequenced operations
//! out on another, offsets committed to a local file.
//!
//! Every input line is one record on partition 0. Offsets continue after both
//! the last committed offset and the highest position any persisted sequencer
//! has applied. A run can persist sequencer state and then fail to commit, so
//! the committed offset alone may sit behind positions a restored sequencer
//! would treat as re-delivered.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use deli_common::store::FileCheckpointStore;
use deli_common::{Error, Offset, PartitionId, PartitionOffset, Result};
use deli_sequencer::{InboundRecord, LogConsumer, LogProducer, OffsetCommitter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Reads one record per non-empty line.
pub struct LineConsumer<R> {
    topic: String,
    lines: Lines<R>,
    next_offset: Offset,
    paused: bool,
    eof: watch::Sender<bool>,
}

impl<R: AsyncBufRead + Unpin + Send> LineConsumer<R> {
    pub fn new(reader: R, topic: impl Into<String>, next_offset: Offset) -> Self {
        let (eof, _) = watch::channel(false);
        Self {
            topic: topic.into(),
            lines: reader.lines(),
            next_offset,
            paused: false,
            eof,
        }
    }

    /// Flips to true once the input is exhausted.
    pub fn eof(&self) -> watch::Receiver<bool> {
        self.eof.subscribe()
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> LogConsumer for LineConsumer<R> {
    async fn recv(&mut self) -> Option<Result<InboundRecord>> {
        if self.paused {
            return None;
        }

        loop {
            // `next_line` is cancel safe; partial lines stay buffered.
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let offset = self.next_offset;
                    self.next_offset += 1;
                    return Some(Ok(InboundRecord {
                        topic: self.topic.clone(),
                        partition: 0,
                        offset,
                        value: Bytes::from(line),
                    }));
                }
                Ok(None) => {
                    info!(next_offset = self.next_offset, "Input exhausted");
                    self.eof.send_replace(true);
                    return None;
                }
                Err(e) => return Some(Err(Error::Transport(format!("stdin read failed: {}", e)))),
            }
        }
    }

    async fn pause(&mut self) {
        self.paused = true;
    }

    async fn close(&mut self) {
        self.paused = true;
    }
}

/// Writes each sequenced payload as one line.
pub struct LineProducer<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> LineProducer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LogProducer for LineProducer<W> {
    async fn send(&self, key: &str, payload: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(&payload).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        write.await.map_err(|e| Error::Publish {
            document_id: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommittedOffsets {
    group_id: String,
    topic: String,
    offsets: Vec<PartitionOffset>,
    committed_at: DateTime<Utc>,
}

/// Keeps the last committed offsets in a JSON file.
pub struct FileOffsetCommitter {
    path: PathBuf,
    group_id: String,
    state: Mutex<Vec<PartitionOffset>>,
}

impl FileOffsetCommitter {
    /// Open the offsets file, loading whatever a previous run committed.
    pub async fn open(path: impl AsRef<Path>, group_id: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let offsets = match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice::<CommittedOffsets>(&content)?.offsets,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            group_id: group_id.into(),
            state: Mutex::new(offsets),
        })
    }

    /// Offset the next record on `partition` should get.
    pub async fn resume_offset(&self, partition: i32) -> Offset {
        self.state
            .lock()
            .await
            .iter()
            .find(|committed| committed.partition == partition)
            .map(|committed| committed.offset + 1)
            .unwrap_or(0)
    }
}

#[async_trait]
impl OffsetCommitter for FileOffsetCommitter {
    async fn commit(&self, topic: &str, offsets: &[PartitionOffset]) -> Result<()> {
        let mut state = self.state.lock().await;
        for committed in offsets {
            match state.iter_mut().find(|o| o.partition == committed.partition) {
                Some(existing) => existing.offset = committed.offset,
                None => state.push(*committed),
            }
        }

        let record = CommittedOffsets {
            group_id: self.group_id.clone(),
            topic: topic.to_string(),
            offsets: state.clone(),
            committed_at: Utc::now(),
        };
        let content = serde_json::to_vec_pretty(&record)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), offsets = ?offsets, "Offsets committed");
        Ok(())
    }
}

/// Offset the next input line on `partition` gets.
pub async fn resume_offset(
    committer: &FileOffsetCommitter,
    store: &FileCheckpointStore,
    partition: PartitionId,
) -> Result<Offset> {
    let committed = committer.resume_offset(partition).await;
    let persisted = store
        .max_log_offset(partition)
        .await?
        .map_or(0, |offset| offset + 1);

    if persisted > committed {
        warn!(
            partition = partition,
            committed = committed,
            persisted = persisted,
            "Persisted sequencer state is ahead of committed offsets; resuming after it"
        );
    }
    Ok(committed.max(persisted))
}
