//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Dead-letter drain for operator visibility."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_metrics::MetricsAggregator;
use courier_msg::{AckStatus, Envelope, MessageSource};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::dispatcher::stopped;
use crate::error::{DispatchError, ErrorReporter, Result};

/// Acknowledges and logs everything that reaches the dead-letter topic.
///
/// Drained messages are never retried.
pub struct DeadLetterListener {
    source: Arc<dyn MessageSource>,
    metrics: Arc<MetricsAggregator>,
    drained: AtomicU64,
}

impl DeadLetterListener {
    pub fn new(source: Arc<dyn MessageSource>, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            source,
            metrics,
            drained: AtomicU64::new(0),
        }
    }

    /// Dead-lettered messages acknowledged so far.
    pub fn drained_count(&self) -> u64 {
        self.drained.load(Ordering::Relaxed)
    }

    pub async fn drain(&self, envelope: &Envelope) -> Result<AckStatus> {
        let status = self
            .source
            .ack(&envelope.identity)
            .await
            .map_err(|source| DispatchError::Acknowledgment {
                identity: envelope.identity.clone(),
                source,
            })?;
        if status.is_settled() {
            self.drained.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_drained();
        }

        let message = &envelope.payload;
        info!(
            routing_key = %envelope.key,
            message_id = message.id,
            retry_count = message.retry_count,
            content = %message.content,
            diagnostics = ?message.diagnostics,
            "dead-lettered message drained"
        );
        Ok(status)
    }

    /// Drain until shutdown or until the dead-letter source closes.
    pub async fn run(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
        errors: ErrorReporter,
    ) -> Result<()> {
        debug!(source = self.source.name(), "dead-letter listener started");
        loop {
            let envelope = tokio::select! {
                biased;
                _ = stopped(shutdown.clone()) => break,
                envelope = self.source.receive() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if let Err(err) = self.drain(&envelope).await {
                error!(error = %err, "failed to acknowledge dead-lettered message");
                errors.report(err);
            }
        }
        debug!(drained = self.drained_count(), "dead-letter listener stopped");
        Ok(())
    }
}

impl std::fmt::Debug for DeadLetterListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterListener")
            .field("source", &self.source.name())
            .field("drained", &self.drained_count())
            .finish()
    }
}
