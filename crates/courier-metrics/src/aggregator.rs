//! ---
//! courier_section: "03-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Delivery counters and point-in-time performance summaries."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use courier_common::config::ResetPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::exporter::DeliveryMetricsExporter;
use crate::latency::{LatencyRecorder, LatencyStats};

/// Smallest elapsed window used as a throughput denominator.
const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Immutable snapshot of delivery statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_produced: u64,
    pub total_consumed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub duration_seconds: f64,
    pub throughput_msg_per_sec: f64,
    pub success_rate_percent: f64,
    /// Publish latency of the current window.
    pub latency: LatencyStats,
    /// End-to-end processing latency of successful deliveries.
    pub consumer_latency: LatencyStats,
}

impl PerformanceSummary {
    /// Emit the operator report as a single structured event.
    pub fn log_report(&self, title: &str) {
        info!(
            title,
            total_produced = self.total_produced,
            total_consumed = self.total_consumed,
            total_failed = self.total_failed,
            total_retries = self.total_retries,
            duration_s = %format!("{:.2}", self.duration_seconds),
            throughput_msg_per_sec = %format!("{:.2}", self.throughput_msg_per_sec),
            success_rate_percent = %format!("{:.2}", self.success_rate_percent),
            latency_avg_ms = %format!("{:.2}", self.latency.avg_ms),
            latency_min_ms = %format!("{:.2}", self.latency.min_ms),
            latency_max_ms = %format!("{:.2}", self.latency.max_ms),
            latency_p50_ms = %format!("{:.2}", self.latency.p50_ms),
            latency_p95_ms = %format!("{:.2}", self.latency.p95_ms),
            latency_p99_ms = %format!("{:.2}", self.latency.p99_ms),
            consumer_p95_ms = %format!("{:.2}", self.consumer_latency.p95_ms),
            "performance summary"
        );
    }
}

/// Counters plus producer/consumer latency distributions shared by every worker.
///
/// Counters are lifetime totals. [`MetricsAggregator::reset_window`] only
/// restarts the elapsed-time origin and clears latency samples according to
/// the configured [`ResetPolicy`].
#[derive(Debug)]
pub struct MetricsAggregator {
    produced: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    producer: LatencyRecorder,
    consumer: LatencyRecorder,
    window_start: Mutex<Instant>,
    reset_policy: ResetPolicy,
    exporter: Option<DeliveryMetricsExporter>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(ResetPolicy::default())
    }
}

impl MetricsAggregator {
    pub fn new(reset_policy: ResetPolicy) -> Self {
        Self {
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            producer: LatencyRecorder::new(),
            consumer: LatencyRecorder::new(),
            window_start: Mutex::new(Instant::now()),
            reset_policy,
            exporter: None,
        }
    }

    /// Mirror every recorded event into Prometheus.
    pub fn with_exporter(mut self, exporter: DeliveryMetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    pub fn record_produced(&self, latency_nanos: u64) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        self.producer.record(latency_nanos);
        if let Some(exporter) = &self.exporter {
            exporter.observe_produced(Duration::from_nanos(latency_nanos));
        }
    }

    pub fn record_consumed(&self, latency_nanos: u64) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        self.consumer.record(latency_nanos);
        if let Some(exporter) = &self.exporter {
            exporter.observe_consumed(Duration::from_nanos(latency_nanos));
        }
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observe_failed();
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observe_retry();
        }
    }

    pub fn record_drained(&self) {
        if let Some(exporter) = &self.exporter {
            exporter.observe_drained();
        }
    }

    pub fn total_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn total_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Restart the measurement window.
    pub fn reset_window(&self) {
        *self.window_start.lock() = Instant::now();
        self.producer.reset();
        if self.reset_policy == ResetPolicy::FullWindow {
            self.consumer.reset();
        }
    }

    /// Compute a fresh summary and mirror its window figures into Prometheus.
    pub fn publish_summary(&self) -> PerformanceSummary {
        let summary = self.summary();
        if let Some(exporter) = &self.exporter {
            exporter.observe_summary(&summary);
        }
        summary
    }

    /// Compute a fresh summary.
    pub fn summary(&self) -> PerformanceSummary {
        let elapsed = self.window_start.lock().elapsed();
        let duration_seconds = elapsed.as_secs_f64();
        let denominator = elapsed.max(MIN_WINDOW).as_secs_f64();

        let produced = self.total_produced();
        let consumed = self.total_consumed();
        let success_rate_percent = if produced > 0 {
            consumed as f64 * 100.0 / produced as f64
        } else {
            0.0
        };

        PerformanceSummary {
            total_produced: produced,
            total_consumed: consumed,
            total_failed: self.total_failed(),
            total_retries: self.total_retries(),
            duration_seconds,
            throughput_msg_per_sec: produced as f64 / denominator,
            success_rate_percent,
            latency: self.producer.summary(),
            consumer_latency: self.consumer.summary(),
        }
    }
}
