//! Common types used throughout Deli.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset within a partition.
pub type Offset = i64;

/// Partition number within the inbound topic.
pub type PartitionId = i32;

/// Per-document total order position.
pub type SequenceNumber = u64;

/// Timestamp in milliseconds since epoch.
pub type Timestamp = i64;

/// Where a record sits in the inbound log.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogPosition {
    pub partition: PartitionId,
    pub offset: Offset,
}

impl LogPosition {
    pub fn new(partition: PartitionId, offset: Offset) -> Self {
        Self { partition, offset }
    }

    /// True when `other` is on the same partition and not after this position.
    pub fn covers(&self, other: &LogPosition) -> bool {
        self.partition == other.partition && other.offset <= self.offset
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Offset of the last processed record for one partition, as handed to the
/// log's commit mechanism.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub partition: PartitionId,
    pub offset: Offset,
}
