//! Kafka driver built on rdkafka.
//!
//! The inbound topic is consumed through a `StreamConsumer` with auto commit
//! disabled; offsets are committed only by the checkpoint coordinator, as
//! `offset + 1` per Kafka convention, and synchronously so a rejected commit
//! fails the cycle.

use async_trait::async_trait;
use bytes::Bytes;
use deli_common::{Error, PartitionOffset, Result};
use deli_sequencer::{DeliConfig, InboundRecord, LogConsumer, LogProducer, OffsetCommitter};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::util::Timeout;
use rdkafka::Message;
use std::sync::Arc;
use tracing::{info, warn};

pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    paused: bool,
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

pub struct KafkaCommitter {
    consumer: Arc<StreamConsumer>,
}

/// Connect to the brokers and subscribe to the inbound topic.
pub fn connect(
    brokers: &str,
    config: &DeliConfig,
) -> anyhow::Result<(KafkaConsumer, KafkaProducer, KafkaCommitter)> {
    info!(
        brokers = %brokers,
        group_id = %config.group_id,
        receive_topic = %config.receive_topic,
        send_topic = %config.send_topic,
        "Connecting to Kafka"
    );

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("fetch.wait.max.ms", "100")
        .create()?;
    consumer.subscribe(&[config.receive_topic.as_str()])?;

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "10000")
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("linger.ms", "5")
        .create()?;

    let consumer = Arc::new(consumer);
    Ok((
        KafkaConsumer {
            consumer: consumer.clone(),
            paused: false,
        },
        KafkaProducer {
            producer,
            topic: config.send_topic.clone(),
        },
        KafkaCommitter { consumer },
    ))
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn recv(&mut self) -> Option<Result<InboundRecord>> {
        if self.paused {
            return None;
        }

        match self.consumer.recv().await {
            Ok(message) => Some(Ok(InboundRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                value: message
                    .payload()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default(),
            })),
            Err(e) => Some(Err(Error::Transport(e.to_string()))),
        }
    }

    async fn pause(&mut self) {
        self.paused = true;
        match self.consumer.assignment() {
            Ok(assignment) => {
                if let Err(e) = self.consumer.pause(&assignment) {
                    warn!(error = %e, "Failed to pause partition fetching");
                }
            }
            Err(e) => warn!(error = %e, "Failed to read partition assignment"),
        }
    }

    async fn close(&mut self) {
        self.paused = true;
        self.consumer.unsubscribe();
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn send(&self, key: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(&self.topic).key(key).payload(&payload[..]);
        self.producer
            .send(record, Timeout::Never)
            .await
            .map(|_| ())
            .map_err(|(e, _)| Error::Publish {
                document_id: key.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Kafka stores the offset of the next record to read, one past the last
/// processed record.
fn commit_list(topic: &str, offsets: &[PartitionOffset]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for committed in offsets {
        tpl.add_partition_offset(
            topic,
            committed.partition,
            rdkafka::Offset::Offset(committed.offset + 1),
        )
        .map_err(|e| Error::Checkpoint(format!("invalid commit offset: {}", e)))?;
    }
    Ok(tpl)
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(&self, topic: &str, offsets: &[PartitionOffset]) -> Result<()> {
        let tpl = commit_list(topic, offsets)?;
        let consumer = self.consumer.clone();

        // Sync mode reports broker-side rejections; it blocks, so it runs off
        // the async workers.
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| Error::Checkpoint(format!("offset commit task failed: {}", e)))?
            .map_err(|e| Error::Checkpoint(format!("offset commit rejected: {}", e)))
    }
}
