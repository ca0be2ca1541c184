//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Synthetic batch traffic generation with producer latency capture."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use courier_common::time::elapsed_nanos;
use courier_common::EmitterConfig;
use courier_metrics::{MetricsAggregator, PerformanceSummary};
use courier_msg::{MessageSource, PublishReceipt, WorkshopMessage};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use crate::error::{DispatchError, Result};

/// Outcome of [`BatchEmitter::send_batch`].
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub requested: u64,
    /// Publishes accepted by the source.
    pub published: u64,
    /// Publishes the source rejected.
    pub failed: u64,
    /// Publishes still outstanding when the settle timeout expired.
    pub unsettled: u64,
    pub errors: Vec<DispatchError>,
    pub summary: PerformanceSummary,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.published == self.requested
    }
}

/// Publishes generated messages to a topic and records producer latency.
pub struct BatchEmitter {
    source: Arc<dyn MessageSource>,
    metrics: Arc<MetricsAggregator>,
    topic: String,
    config: EmitterConfig,
}

impl BatchEmitter {
    pub fn new(
        source: Arc<dyn MessageSource>,
        metrics: Arc<MetricsAggregator>,
        topic: impl Into<String>,
        config: EmitterConfig,
    ) -> Self {
        Self {
            source,
            metrics,
            topic: topic.into(),
            config,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one message under `{key_prefix}{id}`.
    pub async fn send_message(&self, message: WorkshopMessage) -> Result<PublishReceipt> {
        let message_id = message.id;
        let key = format!("{}{}", self.config.key_prefix, message_id);
        let started = Instant::now();
        match self.source.publish(&self.topic, &key, message).await {
            Ok(receipt) => {
                self.metrics.record_produced(elapsed_nanos(started));
                Ok(receipt)
            }
            Err(source) => {
                warn!(message_id, topic = %self.topic, error = %source, "publish failed");
                Err(DispatchError::Publish {
                    message_id,
                    destination: self.topic.clone(),
                    source,
                })
            }
        }
    }

    /// Publish messages `1..=count` and wait, bounded by the settle timeout,
    /// for every publish to be confirmed.
    ///
    /// The metrics window restarts first. Individual publish failures are
    /// collected in the report and never abort the batch.
    pub async fn send_batch(&self, count: u64) -> BatchReport {
        self.metrics.reset_window();
        info!(count, topic = %self.topic, "sending batch");

        let mut pending = FuturesUnordered::new();
        for id in 1..=count {
            let message = WorkshopMessage::new(id, format!("Test message {id}"), self.config.origin.clone());
            pending.push(self.send_message(message));
            if self.config.progress_interval > 0 && id % self.config.progress_interval == 0 {
                info!(submitted = id, count, "batch progress");
            }
        }

        let mut published = 0u64;
        let mut failed = 0u64;
        let mut errors = Vec::new();
        let deadline = tokio::time::sleep(self.config.settle_timeout);
        tokio::pin!(deadline);

        let unsettled = loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(Ok(_receipt)) => published += 1,
                    Some(Err(err)) => {
                        failed += 1;
                        errors.push(err);
                    }
                    None => break 0,
                },
                _ = &mut deadline => break pending.len() as u64,
            }
        };
        if unsettled > 0 {
            warn!(unsettled, "settle timeout expired with publishes outstanding");
        }

        let summary = self.metrics.summary();
        summary.log_report("batch complete");
        BatchReport {
            requested: count,
            published,
            failed,
            unsettled,
            errors,
            summary,
        }
    }
}

impl std::fmt::Debug for BatchEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEmitter")
            .field("source", &self.source.name())
            .field("topic", &self.topic)
            .field("config", &self.config)
            .finish()
    }
}
