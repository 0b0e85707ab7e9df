//! Service configuration

use deli_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the intake worker does with a payload it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorPolicy {
    /// Fail the whole service
    #[default]
    Fail,
    /// Log, count, and move past the record (its offset is still tracked)
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliConfig {
    /// Consumer group used for offset commits
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Topic carrying raw operations
    #[serde(default = "default_receive_topic")]
    pub receive_topic: String,

    /// Topic receiving sequenced operations
    #[serde(default = "default_send_topic")]
    pub send_topic: String,

    /// Processed records between count-triggered checkpoints
    #[serde(default = "default_checkpoint_batch_size")]
    pub checkpoint_batch_size: u64,

    /// Timer-triggered checkpoint interval
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// Bound of the intake queue between the reader and the worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub parse_error_policy: ParseErrorPolicy,

    /// Run one last checkpoint cycle after the intake drains on stop
    #[serde(default = "default_checkpoint_on_stop")]
    pub checkpoint_on_stop: bool,

    /// Warn each time the live sequencer count crosses a multiple of this
    #[serde(default = "default_sequencer_warn_threshold")]
    pub sequencer_warn_threshold: usize,

    /// Period of the intake throughput log line
    #[serde(default = "default_throughput_log_interval_ms")]
    pub throughput_log_interval_ms: u64,
}

fn default_group_id() -> String {
    "deli".to_string()
}

fn default_receive_topic() -> String {
    "rawdeltas".to_string()
}

fn default_send_topic() -> String {
    "deltas".to_string()
}

fn default_checkpoint_batch_size() -> u64 {
    10
}

fn default_checkpoint_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_checkpoint_on_stop() -> bool {
    true
}

fn default_sequencer_warn_threshold() -> usize {
    10_000
}

fn default_throughput_log_interval_ms() -> u64 {
    10_000
}

impl Default for DeliConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            receive_topic: default_receive_topic(),
            send_topic: default_send_topic(),
            checkpoint_batch_size: default_checkpoint_batch_size(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            queue_capacity: default_queue_capacity(),
            parse_error_policy: ParseErrorPolicy::default(),
            checkpoint_on_stop: default_checkpoint_on_stop(),
            sequencer_warn_threshold: default_sequencer_warn_threshold(),
            throughput_log_interval_ms: default_throughput_log_interval_ms(),
        }
    }
}

impl DeliConfig {
    /// Load from a `.toml` or `.json` file, filling unspecified fields with
    /// defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e))),
            Some("toml") | None => Self::from_toml_str(&content),
            Some(other) => Err(Error::Configuration(format!(
                "Unsupported config format: {}",
                other
            ))),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn throughput_log_interval(&self) -> Duration {
        Duration::from_millis(self.throughput_log_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.group_id.trim().is_empty() {
            problems.push("group_id must not be empty".to_string());
        }
        if self.receive_topic.trim().is_empty() {
            problems.push("receive_topic must not be empty".to_string());
        }
        if self.send_topic.trim().is_empty() {
            problems.push("send_topic must not be empty".to_string());
        }
        if self.checkpoint_batch_size == 0 {
            problems.push("checkpoint_batch_size must be greater than 0".to_string());
        }
        if self.checkpoint_interval_ms == 0 {
            problems.push("checkpoint_interval_ms must be greater than 0".to_string());
        }
        if self.queue_capacity == 0 {
            problems.push("queue_capacity must be greater than 0".to_string());
        }
        if self.sequencer_warn_threshold == 0 {
            problems.push("sequencer_warn_threshold must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(problems.join("; ")))
        }
    }
}
