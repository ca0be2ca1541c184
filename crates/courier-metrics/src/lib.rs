//! ---
//! courier_section: "03-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Latency statistics, delivery counters and the Prometheus scrape endpoint."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::Registry;

pub mod aggregator;
pub mod exporter;
pub mod latency;
pub mod server;

pub use aggregator::{MetricsAggregator, PerformanceSummary};
pub use exporter::DeliveryMetricsExporter;
pub use latency::{LatencyRecorder, LatencyStats};
pub use server::{serve_metrics, MetricsServer};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

pub use prometheus;
