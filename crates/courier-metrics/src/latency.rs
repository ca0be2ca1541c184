//! ---
//! courier_section: "03-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Latency sample collection and percentile summaries."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use courier_common::time::nanos_to_millis;
use parking_lot::Mutex;
use serde::Serialize;

/// Percentile summary of recorded latencies, expressed in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Thread-safe, append-only collection of latency samples in nanoseconds.
#[derive(Debug)]
pub struct LatencyRecorder {
    samples: Mutex<Vec<u64>>,
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Append a sample.
    pub fn record(&self, duration_nanos: u64) {
        self.samples.lock().push(duration_nanos);
    }

    /// Number of samples in the current window.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all samples.
    pub fn reset(&self) {
        self.samples.lock().clear();
    }

    /// Compute percentile statistics over the current samples.
    ///
    /// Percentiles use the sample at rank `floor(count * p)` of the ascending
    /// order, clamped to the last index; no interpolation is applied.
    pub fn summary(&self) -> LatencyStats {
        let mut sorted = self.samples.lock().clone();
        if sorted.is_empty() {
            return LatencyStats::default();
        }
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u128 = sorted.iter().map(|&nanos| u128::from(nanos)).sum();
        let avg = sum as f64 / count as f64;
        let min = sorted[0];
        let max = sorted[count - 1];

        LatencyStats {
            avg_ms: nanos_to_millis(avg),
            min_ms: nanos_to_millis(min as f64),
            max_ms: nanos_to_millis(max as f64),
            p50_ms: nanos_to_millis(percentile(&sorted, 0.50) as f64),
            p95_ms: nanos_to_millis(percentile(&sorted, 0.95) as f64),
            p99_ms: nanos_to_millis(percentile(&sorted, 0.99) as f64),
        }
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    let last = sorted.len() - 1;
    let rank = (sorted.len() as f64 * p).floor() as usize;
    sorted[rank.min(last)]
}
