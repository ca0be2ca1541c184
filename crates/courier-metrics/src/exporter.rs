//! ---
//! courier_section: "03-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Prometheus instrumentation for delivery activity."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, Opts};

use crate::aggregator::PerformanceSummary;
use crate::SharedRegistry;

/// Prometheus metric handles mirroring the delivery counters.
#[derive(Clone)]
pub struct DeliveryMetricsExporter {
    produced: IntCounter,
    consumed: IntCounter,
    failed: IntCounter,
    retries: IntCounter,
    drained: IntCounter,
    producer_latency: Histogram,
    consumer_latency: Histogram,
    success_rate: Gauge,
    window_throughput: Gauge,
    window_seconds: Gauge,
}

impl DeliveryMetricsExporter {
    /// Register delivery metrics labelled with the transport `origin`.
    pub fn register(registry: &SharedRegistry, origin: &str) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter =
                IntCounter::with_opts(Opts::new(name, help).const_label("origin", origin))?;
            registry
                .register(Box::new(counter.clone()))
                .with_context(|| format!("failed to register {name}"))?;
            Ok(counter)
        };
        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let buckets = prometheus::exponential_buckets(0.0001, 2.0, 20)
                .context("failed to construct histogram buckets")?;
            let histogram = Histogram::with_opts(
                HistogramOpts::new(name, help)
                    .const_label("origin", origin)
                    .buckets(buckets),
            )?;
            registry
                .register(Box::new(histogram.clone()))
                .with_context(|| format!("failed to register {name}"))?;
            Ok(histogram)
        };

        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let gauge = Gauge::with_opts(Opts::new(name, help).const_label("origin", origin))?;
            registry
                .register(Box::new(gauge.clone()))
                .with_context(|| format!("failed to register {name}"))?;
            Ok(gauge)
        };

        Ok(Self {
            produced: counter(
                "courier_messages_produced_total",
                "Messages accepted by the message source on publish",
            )?,
            consumed: counter(
                "courier_messages_consumed_total",
                "Deliveries handled successfully and acknowledged",
            )?,
            failed: counter(
                "courier_messages_failed_total",
                "Deliveries routed to the dead-letter sink after exhausting retries",
            )?,
            retries: counter(
                "courier_retries_scheduled_total",
                "Retry attempts scheduled after handler failures",
            )?,
            drained: counter(
                "courier_dead_letters_drained_total",
                "Dead-lettered messages drained and acknowledged by the sink listener",
            )?,
            producer_latency: histogram(
                "courier_producer_latency_seconds",
                "Time between publish and acceptance by the message source",
            )?,
            consumer_latency: histogram(
                "courier_consumer_latency_seconds",
                "Time between receipt and acknowledgment of a successful delivery",
            )?,
            success_rate: gauge(
                "courier_success_rate_percent",
                "Consumed over produced messages at the last summary",
            )?,
            window_throughput: gauge(
                "courier_window_throughput_messages_per_second",
                "Produced messages per second over the current window",
            )?,
            window_seconds: gauge(
                "courier_window_seconds",
                "Age of the current statistics window",
            )?,
        })
    }

    pub fn observe_produced(&self, latency: Duration) {
        self.produced.inc();
        self.producer_latency.observe(latency.as_secs_f64());
    }

    pub fn observe_consumed(&self, latency: Duration) {
        self.consumed.inc();
        self.consumer_latency.observe(latency.as_secs_f64());
    }

    pub fn observe_failed(&self) {
        self.failed.inc();
    }

    pub fn observe_retry(&self) {
        self.retries.inc();
    }

    pub fn observe_drained(&self) {
        self.drained.inc();
    }

    /// Copy the window-relative figures of `summary` into gauges.
    pub fn observe_summary(&self, summary: &PerformanceSummary) {
        self.success_rate.set(summary.success_rate_percent);
        self.window_throughput.set(summary.throughput_msg_per_sec);
        self.window_seconds.set(summary.duration_seconds);
    }
}

impl std::fmt::Debug for DeliveryMetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryMetricsExporter")
            .finish_non_exhaustive()
    }
}
