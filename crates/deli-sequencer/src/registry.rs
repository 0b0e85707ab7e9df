//! Document id to sequencer lookup.

use prometheus::IntGauge;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::sequencer::Sequencer;

/// Live sequencers, one per document.
///
/// Sequencers are never evicted. The population is published on a gauge and a
/// warning is logged every time it crosses another multiple of the warning
/// threshold.
pub struct SequencerRegistry {
    sequencers: HashMap<String, Sequencer>,
    gauge: IntGauge,
    warn_threshold: usize,
}

impl SequencerRegistry {
    pub fn new(gauge: IntGauge, warn_threshold: usize) -> Self {
        Self {
            sequencers: HashMap::new(),
            gauge,
            warn_threshold,
        }
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.sequencers.contains_key(document_id)
    }

    pub fn get(&self, document_id: &str) -> Option<&Sequencer> {
        self.sequencers.get(document_id)
    }

    pub fn get_mut(&mut self, document_id: &str) -> Option<&mut Sequencer> {
        self.sequencers.get_mut(document_id)
    }

    /// Register a restored sequencer. An existing sequencer for the same
    /// document is kept and the new one dropped.
    pub fn insert(&mut self, sequencer: Sequencer) -> &mut Sequencer {
        let document_id = sequencer.document_id().to_string();

        if self.sequencers.contains_key(&document_id) {
            warn!(document_id = %document_id, "Sequencer already registered");
        } else {
            let count = self.sequencers.len() + 1;
            self.gauge.set(count as i64);
            info!(document_id = %document_id, sequencers = count, "New document");
            if self.warn_threshold > 0 && count % self.warn_threshold == 0 {
                warn!(
                    sequencers = count,
                    threshold = self.warn_threshold,
                    "Sequencer population keeps growing; sequencers are never evicted"
                );
            }
        }

        self.sequencers.entry(document_id).or_insert(sequencer)
    }

    pub fn len(&self) -> usize {
        self.sequencers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequencers.is_empty()
    }
}
