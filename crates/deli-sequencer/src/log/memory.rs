//! In-process log used by tests and local runs.
//!
//! [`MemoryLog`] hands out a writer and a consumer over one topic.
//! [`MemoryProducer`] keeps every published record and can hold or fail
//! sends, and [`MemoryCommitter`] keeps every offset commit.

use async_trait::async_trait;
use bytes::Bytes;
use deli_common::message::{OutboundMessage, SequencedOperationMessage};
use deli_common::{Error, Offset, PartitionId, PartitionOffset, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{InboundRecord, LogConsumer, LogProducer, OffsetCommitter};

enum ConsumerEvent {
    Record(InboundRecord),
    Error(String),
}

#[derive(Default)]
struct LogFlags {
    paused: AtomicBool,
    closed: AtomicBool,
}

pub struct MemoryLog;

impl MemoryLog {
    /// Create a topic and return its writer and its single consumer.
    pub fn open(topic: impl Into<String>) -> (MemoryLogWriter, MemoryConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flags = Arc::new(LogFlags::default());
        let writer = MemoryLogWriter {
            topic: topic.into(),
            tx: Mutex::new(Some(tx)),
            next_offsets: Mutex::new(HashMap::new()),
            flags: flags.clone(),
        };
        let consumer = MemoryConsumer { rx, flags };
        (writer, consumer)
    }
}

pub struct MemoryLogWriter {
    topic: String,
    tx: Mutex<Option<mpsc::UnboundedSender<ConsumerEvent>>>,
    next_offsets: Mutex<HashMap<PartitionId, Offset>>,
    flags: Arc<LogFlags>,
}

impl MemoryLogWriter {
    /// Append at the partition's next offset (starting at 0).
    pub fn append(&self, partition: PartitionId, value: impl Into<Bytes>) -> Offset {
        let offset = {
            let mut next = self.next_offsets.lock();
            let slot = next.entry(partition).or_insert(0);
            let offset = *slot;
            *slot += 1;
            offset
        };
        self.deliver(partition, offset, value.into());
        offset
    }

    /// Append at an explicit offset; later `append` calls continue after it.
    pub fn append_at(&self, partition: PartitionId, offset: Offset, value: impl Into<Bytes>) {
        self.next_offsets.lock().insert(partition, offset + 1);
        self.deliver(partition, offset, value.into());
    }

    /// Deliver a transport error to the consumer.
    pub fn fail(&self, reason: impl Into<String>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(ConsumerEvent::Error(reason.into()));
        }
    }

    /// End the log; the consumer yields `None` after draining.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, partition: PartitionId, offset: Offset, value: Bytes) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(ConsumerEvent::Record(InboundRecord {
                topic: self.topic.clone(),
                partition,
                offset,
                value,
            }));
        }
    }
}

pub struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<ConsumerEvent>,
    flags: Arc<LogFlags>,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Result<InboundRecord>> {
        if self.flags.paused.load(Ordering::SeqCst) || self.flags.closed.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.recv().await? {
            ConsumerEvent::Record(record) => Some(Ok(record)),
            ConsumerEvent::Error(reason) => Some(Err(Error::Transport(reason))),
        }
    }

    async fn pause(&mut self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    async fn close(&mut self) {
        self.flags.closed.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

/// A record accepted by [`MemoryProducer`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    pub key: String,
    pub payload: Bytes,
}

pub struct MemoryProducer {
    published: Mutex<Vec<PublishedRecord>>,
    gate: watch::Sender<bool>,
    fail_sends: AtomicBool,
}

impl MemoryProducer {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            published: Mutex::new(Vec::new()),
            gate,
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Keep every subsequent send pending until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().clone()
    }

    /// Decoded sequenced operations for one document, in publish order.
    pub fn sequenced(&self, document_id: &str) -> Vec<SequencedOperationMessage> {
        self.published
            .lock()
            .iter()
            .filter(|record| record.key == document_id)
            .filter_map(|record| OutboundMessage::parse(&record.payload).ok())
            .map(|message| match message {
                OutboundMessage::SequencedOperation(op) => op,
            })
            .collect()
    }

    /// Sequence numbers published for one document, in publish order.
    pub fn sequence_numbers(&self, document_id: &str) -> Vec<u64> {
        self.sequenced(document_id)
            .into_iter()
            .map(|op| op.operation.sequence_number)
            .collect()
    }
}

impl Default for MemoryProducer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn send(&self, key: &str, payload: Bytes) -> Result<()> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await.map_err(|_| Error::Publish {
            document_id: key.to_string(),
            reason: "producer dropped".to_string(),
        })?;

        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Publish {
                document_id: key.to_string(),
                reason: "broker rejected record".to_string(),
            });
        }

        self.published.lock().push(PublishedRecord {
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}

pub struct MemoryCommitter {
    commits: Mutex<Vec<(String, Vec<PartitionOffset>)>>,
    fail_commits: AtomicBool,
}

impl MemoryCommitter {
    pub fn new() -> Self {
        Self {
            commits: Mutex::new(Vec::new()),
            fail_commits: AtomicBool::new(false),
        }
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Every commit call, oldest first.
    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        self.commits
            .lock()
            .iter()
            .map(|(_, offsets)| offsets.clone())
            .collect()
    }

    /// Highest offset committed for a partition.
    pub fn committed(&self, partition: PartitionId) -> Option<Offset> {
        self.commits
            .lock()
            .iter()
            .flat_map(|(_, offsets)| offsets.iter())
            .filter(|committed| committed.partition == partition)
            .map(|committed| committed.offset)
            .max()
    }
}

impl Default for MemoryCommitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OffsetCommitter for MemoryCommitter {
    async fn commit(&self, topic: &str, offsets: &[PartitionOffset]) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("offset commit rejected for {}", topic)));
        }
        self.commits
            .lock()
            .push((topic.to_string(), offsets.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_offsets_are_per_partition() {
        let (writer, mut consumer) = MemoryLog::open("raw");
        assert_eq!(writer.append(0, "a"), 0);
        assert_eq!(writer.append(1, "b"), 0);
        assert_eq!(writer.append(0, "c"), 1);
        writer.append_at(1, 10, "d");
        assert_eq!(writer.append(1, "e"), 11);

        let first = consumer.recv().await.unwrap().unwrap();
        assert_eq!((first.topic.as_str(), first.partition, first.offset), ("raw", 0, 0));
    }

    #[tokio::test]
    async fn test_errors_and_close() {
        let (writer, mut consumer) = MemoryLog::open("raw");
        writer.fail("connection reset");
        writer.close();

        let event = consumer.recv().await.unwrap();
        assert!(matches!(event, Err(Error::Transport(_))));
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_paused_consumer_yields_nothing() {
        let (writer, mut consumer) = MemoryLog::open("raw");
        writer.append(0, "a");
        consumer.pause().await;

        assert!(writer.is_paused());
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_held_producer_publishes_after_release() {
        let producer = Arc::new(MemoryProducer::new());
        producer.hold();

        let send = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.send("doc", Bytes::from_static(b"x")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(producer.published().is_empty());

        producer.release();
        send.await.unwrap().unwrap();
        assert_eq!(producer.published().len(), 1);
    }
}
