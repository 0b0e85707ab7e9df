//! Per-partition read progress of the inbound topic.

use deli_common::{Offset, PartitionId, PartitionOffset};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Latest processed offset per partition, and what has been committed.
///
/// The tracker only records progress. When a commit is safe is decided by the
/// checkpoint coordinator, which snapshots the tracker in the same critical
/// section as the outstanding tickets.
#[derive(Debug)]
pub struct PartitionTracker {
    topic: String,
    current: BTreeMap<PartitionId, Offset>,
    committed: BTreeMap<PartitionId, Offset>,
}

impl PartitionTracker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            current: BTreeMap::new(),
            committed: BTreeMap::new(),
        }
    }

    /// Record that `offset` on `partition` has been processed.
    pub fn update(&mut self, partition: PartitionId, offset: Offset) {
        if let Some(previous) = self.current.get(&partition) {
            if offset < *previous {
                warn!(
                    topic = %self.topic,
                    partition = partition,
                    previous = *previous,
                    offset = offset,
                    "Offset regression on inbound partition"
                );
            }
        }
        self.current.insert(partition, offset);
    }

    pub fn current(&self, partition: PartitionId) -> Option<Offset> {
        self.current.get(&partition).copied()
    }

    pub fn committed(&self, partition: PartitionId) -> Option<Offset> {
        self.committed.get(&partition).copied()
    }

    /// Offsets that moved since the last commit, ready to hand to the log.
    pub fn checkpoint(&self) -> Vec<PartitionOffset> {
        self.current
            .iter()
            .filter(|(partition, offset)| self.committed.get(partition) != Some(offset))
            .map(|(&partition, &offset)| PartitionOffset { partition, offset })
            .collect()
    }

    /// Record offsets the log has accepted.
    pub fn mark_committed(&mut self, offsets: &[PartitionOffset]) {
        for committed in offsets {
            self.committed.insert(committed.partition, committed.offset);
        }
        debug!(topic = %self.topic, partitions = offsets.len(), "Offsets committed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_reports_latest_offsets() {
        let mut tracker = PartitionTracker::new("raw");
        tracker.update(0, 1);
        tracker.update(1, 5);
        tracker.update(0, 2);

        assert_eq!(
            tracker.checkpoint(),
            vec![
                PartitionOffset { partition: 0, offset: 2 },
                PartitionOffset { partition: 1, offset: 5 },
            ]
        );
    }

    #[test]
    fn test_committed_partitions_are_not_repeated() {
        let mut tracker = PartitionTracker::new("raw");
        tracker.update(0, 3);
        tracker.update(1, 7);

        let offsets = tracker.checkpoint();
        tracker.mark_committed(&offsets);
        assert!(tracker.checkpoint().is_empty());
        assert_eq!(tracker.committed(1), Some(7));

        tracker.update(1, 8);
        assert_eq!(
            tracker.checkpoint(),
            vec![PartitionOffset { partition: 1, offset: 8 }]
        );
    }
}
