//! ---
//! courier_section: "03-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Scrape endpoint for delivery counters and the live performance summary."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::TextEncoder;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregator::{MetricsAggregator, PerformanceSummary};
use crate::SharedRegistry;

#[derive(Clone)]
struct ScrapeState {
    registry: SharedRegistry,
    aggregator: Arc<MetricsAggregator>,
}

/// Serve `/metrics` (Prometheus text) and `/summary` (JSON
/// [`PerformanceSummary`]) for one aggregator.
///
/// Window gauges are refreshed from the aggregator on every scrape.
pub async fn serve_metrics(
    registry: SharedRegistry,
    aggregator: Arc<MetricsAggregator>,
    addr: SocketAddr,
) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    let bound = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let app = router(ScrapeState {
        registry,
        aggregator,
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")
    });
    info!(address = %bound, "metrics endpoint listening");

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

fn router(state: ScrapeState) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .route("/summary", get(summary))
        .with_state(state)
}

type ScrapeResponse = (StatusCode, [(HeaderName, HeaderValue); 1], String);

async fn scrape(State(state): State<ScrapeState>) -> ScrapeResponse {
    state.aggregator.publish_summary();
    match TextEncoder::new().encode_to_string(&state.registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode delivery metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

async fn summary(State(state): State<ScrapeState>) -> Json<PerformanceSummary> {
    Json(state.aggregator.publish_summary())
}

/// Handle to the running scrape endpoint.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics server task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::DeliveryMetricsExporter;
    use crate::new_registry;

    fn state() -> ScrapeState {
        let registry = new_registry();
        let exporter = DeliveryMetricsExporter::register(&registry, "test").expect("register");
        ScrapeState {
            aggregator: Arc::new(MetricsAggregator::default().with_exporter(exporter)),
            registry,
        }
    }

    #[tokio::test]
    async fn scrape_refreshes_window_gauges() {
        let state = state();
        for _ in 0..4 {
            state.aggregator.record_produced(1_000_000);
        }
        for _ in 0..3 {
            state.aggregator.record_consumed(2_000_000);
        }

        let (status, headers, body) = scrape(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[0].1, prometheus::TEXT_FORMAT);
        assert!(body.contains("courier_messages_produced_total{origin=\"test\"} 4"));
        assert!(body.contains("courier_success_rate_percent{origin=\"test\"} 75"));
        assert!(body.contains("courier_window_throughput_messages_per_second"));
    }

    #[tokio::test]
    async fn summary_endpoint_reports_lifetime_totals() {
        let state = state();
        state.aggregator.record_produced(1_000_000);
        state.aggregator.record_failed();

        let Json(summary) = summary(State(state)).await;
        assert_eq!(summary.total_produced, 1);
        assert_eq!(summary.total_failed, 1);
        assert_eq!(summary.success_rate_percent, 0.0);
    }

    #[tokio::test]
    async fn binds_ephemeral_port_and_shuts_down() {
        let state = state();
        let server = serve_metrics(
            state.registry,
            state.aggregator,
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
        .await
        .expect("serve");
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.expect("clean shutdown");
    }
}
