//! Rolling throughput log for hot loops.
//!
//! Counts produced and acknowledged items and emits one `info!` line per
//! interval with the observed rates. Cheap enough to call per record.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub produced: u64,
    pub acknowledged: u64,
    pub elapsed: Duration,
}

impl ThroughputSample {
    pub fn produce_rate(&self) -> f64 {
        rate(self.produced, self.elapsed)
    }

    pub fn ack_rate(&self) -> f64 {
        rate(self.acknowledged, self.elapsed)
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

pub struct ThroughputCounter {
    name: &'static str,
    interval: Duration,
    produced: AtomicU64,
    acknowledged: AtomicU64,
    window_start: Mutex<Instant>,
}

impl ThroughputCounter {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            produced: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
        }
    }

    pub fn produce(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acknowledge(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        if let Some(sample) = self.roll(Instant::now()) {
            info!(
                counter = self.name,
                produced = sample.produced,
                acknowledged = sample.acknowledged,
                produce_rate = format!("{:.1}/s", sample.produce_rate()),
                ack_rate = format!("{:.1}/s", sample.ack_rate()),
                "Throughput"
            );
        }
    }

    /// Close the current window if it is at least one interval old.
    fn roll(&self, now: Instant) -> Option<ThroughputSample> {
        let mut window_start = self.window_start.lock();
        let elapsed = now.saturating_duration_since(*window_start);
        if elapsed < self.interval {
            return None;
        }

        *window_start = now;
        Some(ThroughputSample {
            produced: self.produced.swap(0, Ordering::Relaxed),
            acknowledged: self.acknowledged.swap(0, Ordering::Relaxed),
            elapsed,
        })
    }
}
