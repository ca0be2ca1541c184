//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Embedder-facing handle wiring dispatcher, dead-letter drain and metrics."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use courier_common::{DeliveryConfig, Sleeper};
use courier_metrics::{MetricsAggregator, PerformanceSummary};
use courier_msg::{DeadLetterSink, MessageSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::dlq::DeadLetterListener;
use crate::error::{DispatchError, ErrorReporter, Result};
use crate::handler::MessageHandler;
use crate::ledger::RetryLedger;

const SETTLE_POLL: Duration = Duration::from_millis(10);
const DEFAULT_ERROR_BACKLOG: usize = 256;

/// Collaborators and options for a [`DeliveryRuntime`].
pub struct DeliveryRuntimeBuilder {
    config: DeliveryConfig,
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn DeadLetterSink>,
    handler: Arc<dyn MessageHandler>,
    metrics: Option<Arc<MetricsAggregator>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    dead_letter_source: Option<Arc<dyn MessageSource>>,
    error_backlog: usize,
}

impl DeliveryRuntimeBuilder {
    pub fn new(
        config: DeliveryConfig,
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn DeadLetterSink>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            handler,
            metrics: None,
            sleeper: None,
            dead_letter_source: None,
            error_backlog: DEFAULT_ERROR_BACKLOG,
        }
    }

    /// Share an aggregator, e.g. one wired to a Prometheus exporter.
    pub fn metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Drain the dead-letter topic through this source.
    pub fn dead_letter_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.dead_letter_source = Some(source);
        self
    }

    /// Infrastructure failures kept for [`DeliveryRuntime::next_error`] before
    /// newer ones are dropped.
    pub fn error_backlog(mut self, backlog: usize) -> Self {
        self.error_backlog = backlog;
        self
    }

    /// Spawn the dispatch loop (and the dead-letter drain when configured)
    /// on the current tokio runtime.
    pub fn spawn(self) -> DeliveryRuntime {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsAggregator::new(self.config.reset_policy)));
        let mut dispatcher = Dispatcher::new(
            self.source,
            self.sink,
            self.handler,
            Arc::clone(&metrics),
            DispatcherOptions::from_config(&self.config),
        );
        if let Some(sleeper) = self.sleeper {
            dispatcher = dispatcher.with_sleeper(sleeper);
        }
        let dispatcher = Arc::new(dispatcher);
        let (errors_tx, errors_rx) = ErrorReporter::channel(self.error_backlog);

        let mut tasks = vec![tokio::spawn(
            Arc::clone(&dispatcher).run(errors_tx.clone()),
        )];
        let listener = self.dead_letter_source.map(|source| {
            let listener = Arc::new(DeadLetterListener::new(source, Arc::clone(&metrics)));
            tasks.push(tokio::spawn(
                Arc::clone(&listener).run(dispatcher.shutdown_signal(), errors_tx),
            ));
            listener
        });

        info!(
            topic = %self.config.topic,
            dead_letter_topic = %self.config.dead_letter_topic,
            drain_dead_letters = listener.is_some(),
            "delivery runtime started"
        );
        DeliveryRuntime {
            dispatcher,
            listener,
            metrics,
            tasks,
            errors: errors_rx,
        }
    }
}

/// Running delivery core: statistics queries, reset and shutdown.
pub struct DeliveryRuntime {
    dispatcher: Arc<Dispatcher>,
    listener: Option<Arc<DeadLetterListener>>,
    metrics: Arc<MetricsAggregator>,
    tasks: Vec<JoinHandle<Result<()>>>,
    errors: mpsc::Receiver<DispatchError>,
}

impl DeliveryRuntime {
    pub fn builder(
        config: DeliveryConfig,
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn DeadLetterSink>,
        handler: Arc<dyn MessageHandler>,
    ) -> DeliveryRuntimeBuilder {
        DeliveryRuntimeBuilder::new(config, source, sink, handler)
    }

    pub fn summary(&self) -> PerformanceSummary {
        self.metrics.summary()
    }

    /// Deliveries acknowledged since start or the last reset.
    pub fn processed_count(&self) -> u64 {
        self.dispatcher.processed_count()
    }

    /// Dead-lettered messages drained, zero without a dead-letter source.
    pub fn drained_count(&self) -> u64 {
        self.listener
            .as_ref()
            .map(|listener| listener.drained_count())
            .unwrap_or(0)
    }

    /// Restart the metrics window, zero the processed count and forget retry attempts.
    ///
    /// Lifetime totals survive the reset.
    pub fn reset(&self) {
        self.metrics.reset_window();
        self.dispatcher.reset_processed();
        self.dispatcher.ledger().clear_all();
        info!("delivery statistics reset");
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn ledger(&self) -> &Arc<RetryLedger> {
        self.dispatcher.ledger()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Wait until `expected` deliveries reached a terminal state (consumed or
    /// dead-lettered). Returns `false` if `timeout` expired first.
    pub async fn wait_for_settled(&self, expected: u64, timeout: Duration) -> bool {
        let settled = async {
            while self.metrics.total_consumed() + self.metrics.total_failed() < expected {
                tokio::time::sleep(SETTLE_POLL).await;
            }
        };
        tokio::time::timeout(timeout, settled).await.is_ok()
    }

    /// Next infrastructure failure, waiting until one arrives or every task stopped.
    pub async fn next_error(&mut self) -> Option<DispatchError> {
        self.errors.recv().await
    }

    /// Infrastructure failures reported so far, without waiting.
    pub fn errors(&mut self) -> Vec<DispatchError> {
        let mut drained = Vec::new();
        while let Ok(err) = self.errors.try_recv() {
            drained.push(err);
        }
        drained
    }

    /// Stop receiving, cancel backoffs, let running handlers finish and wait
    /// for every task.
    pub async fn shutdown(self) -> anyhow::Result<PerformanceSummary> {
        self.dispatcher.shutdown();
        for task in self.tasks {
            task.await.context("delivery task panicked")??;
        }
        let summary = self.metrics.summary();
        info!(
            processed = self.dispatcher.processed_count(),
            total_failed = summary.total_failed,
            "delivery runtime stopped"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for DeliveryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRuntime")
            .field("dispatcher", &self.dispatcher)
            .field("listener", &self.listener)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
