//! Boundary to the partitioned inbound log, the outbound log, and the log's
//! consumer-group offset commits.
//!
//! Drivers implement these traits; the sequencer never sees a concrete
//! transport.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use deli_common::{LogPosition, Offset, PartitionId, PartitionOffset, Result};

/// One record read from the inbound log.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub value: Bytes,
}

impl InboundRecord {
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.partition, self.offset)
    }
}

/// Source of inbound records.
#[async_trait]
pub trait LogConsumer: Send {
    /// Next record, a transport error, or `None` once the log is closed.
    ///
    /// Must be cancel safe: the intake loop races it against a pause signal.
    async fn recv(&mut self) -> Option<Result<InboundRecord>>;

    /// Stop fetching new records. Records already handed out are unaffected.
    async fn pause(&mut self);

    /// Release the underlying connection.
    async fn close(&mut self);
}

/// Sink for sequenced operations, keyed by document id.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Resolves once the payload is durably appended.
    async fn send(&self, key: &str, payload: Bytes) -> Result<()>;
}

/// The inbound log's native consumer-group checkpoint.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Commit the offset of the last processed record for each partition.
    async fn commit(&self, topic: &str, offsets: &[PartitionOffset]) -> Result<()>;
}
