//! Prometheus metrics for the Deli sequencer.

use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::types::PartitionOffset;

/// Metrics for one sequencer service.
///
/// Each instance owns its registry, so several services (or tests) can live in
/// one process without colliding on metric names.
pub struct DeliMetrics {
    registry: Registry,

    /// Inbound records by message kind
    pub records_total: IntCounterVec,
    /// Payloads that failed to parse
    pub parse_failures_total: IntCounter,
    /// Operations assigned a sequence number
    pub tickets_total: IntCounter,
    /// Re-delivered records skipped after restore
    pub duplicates_total: IntCounter,
    /// Live sequencers
    pub sequencers: IntGauge,
    /// Records waiting in the intake queue
    pub queue_depth: IntGauge,
    /// Completed checkpoint cycles by trigger
    pub checkpoint_cycles_total: IntCounterVec,
    /// Checkpoint cycle latency
    pub checkpoint_duration: HistogramVec,
    /// Last committed offset per partition
    pub committed_offset: IntGaugeVec,
}

impl DeliMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let records_total = IntCounterVec::new(
            Opts::new("deli_records_total", "Inbound records processed"),
            &["kind"],
        )?;
        let parse_failures_total = IntCounter::new(
            "deli_parse_failures_total",
            "Inbound payloads that could not be decoded",
        )?;
        let tickets_total = IntCounter::new(
            "deli_tickets_total",
            "Operations assigned a sequence number",
        )?;
        let duplicates_total = IntCounter::new(
            "deli_duplicates_total",
            "Re-delivered records skipped by restored sequencers",
        )?;
        let sequencers = IntGauge::new("deli_sequencers", "Live per-document sequencers")?;
        let queue_depth = IntGauge::new("deli_queue_depth", "Records waiting in the intake queue")?;
        let checkpoint_cycles_total = IntCounterVec::new(
            Opts::new("deli_checkpoint_cycles_total", "Completed checkpoint cycles"),
            &["trigger"],
        )?;
        let checkpoint_duration = HistogramVec::new(
            HistogramOpts::new(
                "deli_checkpoint_duration_seconds",
                "Checkpoint cycle latency in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 14)?),
            &["trigger"],
        )?;
        let committed_offset = IntGaugeVec::new(
            Opts::new("deli_committed_offset", "Last committed inbound offset"),
            &["partition"],
        )?;

        registry.register(Box::new(records_total.clone()))?;
        registry.register(Box::new(parse_failures_total.clone()))?;
        registry.register(Box::new(tickets_total.clone()))?;
        registry.register(Box::new(duplicates_total.clone()))?;
        registry.register(Box::new(sequencers.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(checkpoint_cycles_total.clone()))?;
        registry.register(Box::new(checkpoint_duration.clone()))?;
        registry.register(Box::new(committed_offset.clone()))?;

        Ok(Self {
            registry,
            records_total,
            parse_failures_total,
            tickets_total,
            duplicates_total,
            sequencers,
            queue_depth,
            checkpoint_cycles_total,
            checkpoint_duration,
            committed_offset,
        })
    }

    pub fn record_commit(&self, offsets: &[PartitionOffset]) {
        for committed in offsets {
            self.committed_offset
                .with_label_values(&[&committed.partition.to_string()])
                .set(committed.offset);
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("UTF-8 conversion failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_collide() {
        let first = DeliMetrics::new().unwrap();
        let second = DeliMetrics::new().unwrap();

        first.tickets_total.inc();
        assert_eq!(first.tickets_total.get(), 1);
        assert_eq!(second.tickets_total.get(), 0);
    }

    #[test]
    fn test_export_contains_committed_offsets() {
        let metrics = DeliMetrics::new().unwrap();
        metrics.record_commit(&[PartitionOffset {
            partition: 3,
            offset: 77,
        }]);
        metrics.records_total.with_label_values(&["raw_operation"]).inc();

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("deli_committed_offset{partition=\"3\"} 77"));
        assert!(text.contains("deli_records_total{kind=\"raw_operation\"} 1"));
    }
}
