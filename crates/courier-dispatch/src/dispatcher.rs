//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "At-least-once delivery state machine with retry and dead-letter routing."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_common::time::elapsed_nanos;
use courier_common::{DeliveryConfig, RedeliveryMode, Sleeper, TokioSleeper};
use courier_metrics::MetricsAggregator;
use courier_msg::{
    dead_letter_key, AckStatus, DeadLetterSink, DeliveryIdentity, Envelope, MessageSource,
};
use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::BackoffPolicy;
use crate::error::{DispatchError, ErrorReporter, Result};
use crate::handler::MessageHandler;
use crate::ledger::RetryLedger;

/// Tunables for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherOptions {
    /// Retries allowed before a delivery is dead-lettered.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Deliveries handled in parallel.
    pub concurrency: u32,
    pub redelivery: RedeliveryMode,
    /// Successful deliveries between progress log lines; zero disables them.
    pub progress_interval: u64,
}

impl DispatcherOptions {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: BackoffPolicy::from_config(config),
            concurrency: u32::try_from(config.concurrency.max(1)).unwrap_or(u32::MAX),
            redelivery: config.redelivery,
            progress_interval: config.progress_interval,
        }
    }
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

/// Where one pass through the dispatcher left a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded and the delivery was acknowledged.
    Acked,
    /// Handler succeeded but the delivery had already been settled elsewhere.
    AlreadySettled,
    /// Handler failed; the delivery will be presented again after `backoff`.
    RetryScheduled { attempt: u32, backoff: Duration },
    /// Retries exhausted; the payload went to the dead-letter sink.
    DeadLettered { attempts: u32 },
    /// Shutdown interrupted the backoff; the delivery was handed back to the source.
    Cancelled,
}

/// Consumes envelopes from a [`MessageSource`] and drives each one to a
/// terminal state.
pub struct Dispatcher {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn DeadLetterSink>,
    handler: Arc<dyn MessageHandler>,
    ledger: Arc<RetryLedger>,
    metrics: Arc<MetricsAggregator>,
    sleeper: Arc<dyn Sleeper>,
    options: DispatcherOptions,
    processed: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn DeadLetterSink>,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<MetricsAggregator>,
        options: DispatcherOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            source,
            sink,
            handler,
            ledger: Arc::new(RetryLedger::new()),
            metrics,
            sleeper: Arc::new(TokioSleeper),
            options,
            processed: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replace the sleeper used for backoff delays.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Share an existing ledger.
    pub fn with_ledger(mut self, ledger: Arc<RetryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    pub fn ledger(&self) -> &Arc<RetryLedger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Deliveries acknowledged after successful handling.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn reset_processed(&self) {
        self.processed.store(0, Ordering::Relaxed);
    }

    /// Receiver that flips to `true` once [`Dispatcher::shutdown`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop receiving and cancel pending backoffs.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Receive and handle deliveries until shutdown or until the source closes.
    ///
    /// At most `concurrency` deliveries run the handler at once. A delivery
    /// gives its worker slot back while it backs off. Returns after every
    /// spawned delivery task has finished.
    pub async fn run(self: Arc<Self>, errors: ErrorReporter) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(self.options.concurrency as usize));
        let mut deliveries = JoinSet::new();
        info!(
            source = self.source.name(),
            concurrency = self.options.concurrency,
            max_retries = self.options.max_retries,
            "dispatcher started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = stopped(self.shutdown_signal()) => break,
                Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                    reap(joined);
                    continue;
                }
                permit = Arc::clone(&limiter).acquire_owned() => {
                    permit.map_err(|_| DispatchError::LimiterClosed)?
                }
            };
            let envelope = tokio::select! {
                biased;
                _ = stopped(self.shutdown_signal()) => break,
                envelope = self.source.receive() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let span = info_span!(
                "delivery",
                identity = %envelope.identity,
                message_id = envelope.payload.id
            );
            let slot = WorkerSlot {
                limiter: Arc::clone(&limiter),
                permit: Some(permit),
            };
            let dispatcher = Arc::clone(&self);
            let errors = errors.clone();
            deliveries.spawn(
                async move {
                    if let Err(err) = dispatcher.drive(envelope, Some(slot)).await {
                        error!(error = %err, "delivery ended with an infrastructure failure");
                        errors.report(err);
                    }
                }
                .instrument(span),
            );
        }

        while let Some(joined) = deliveries.join_next().await {
            reap(joined);
        }
        info!(processed = self.processed_count(), "dispatcher stopped");
        Ok(())
    }

    /// Drive one delivery to a terminal state, waiting out each backoff.
    ///
    /// In [`RedeliveryMode::NackRequeue`] the delivery is handed back to the
    /// source after the first backoff and the redelivery arrives through
    /// [`Dispatcher::run`]. In [`RedeliveryMode::Resubmit`] the handler is
    /// invoked again here.
    pub async fn handle_delivery(&self, envelope: Envelope) -> Result<DeliveryOutcome> {
        self.drive(envelope, None).await
    }

    async fn drive(
        &self,
        envelope: Envelope,
        mut slot: Option<WorkerSlot>,
    ) -> Result<DeliveryOutcome> {
        let identity = &envelope.identity;
        loop {
            let outcome = self.process(&envelope).await?;
            let DeliveryOutcome::RetryScheduled { backoff, .. } = outcome else {
                return Ok(outcome);
            };

            if let Some(slot) = slot.as_mut() {
                slot.release();
            }
            if !self.pause(backoff).await {
                return self.cancel(identity).await;
            }
            match self.options.redelivery {
                RedeliveryMode::NackRequeue => {
                    self.settle(identity, Settlement::Requeue).await?;
                    return Ok(outcome);
                }
                RedeliveryMode::Resubmit => {
                    if let Some(slot) = slot.as_mut() {
                        if !slot.reacquire(self.shutdown_signal()).await? {
                            return self.cancel(identity).await;
                        }
                    }
                }
            }
        }
    }

    /// Run the handler once and apply the ack or dead-letter decision.
    ///
    /// A failure with retries left is recorded in the ledger and returned as
    /// [`DeliveryOutcome::RetryScheduled`]; the delivery stays unsettled and
    /// the caller owns the backoff.
    pub async fn process(&self, envelope: &Envelope) -> Result<DeliveryOutcome> {
        let started = Instant::now();
        let invocation = AssertUnwindSafe(self.handler.handle(&envelope.payload))
            .catch_unwind()
            .await;
        let reason = match invocation {
            Ok(Ok(())) => return self.acknowledge(envelope, started).await,
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_reason(panic),
        };

        let identity = &envelope.identity;
        let attempts = self.ledger.attempts_for(identity);
        if attempts >= self.options.max_retries {
            return self.dead_letter(envelope, reason).await;
        }

        let attempt = self.ledger.record_failure(identity);
        let backoff = self.options.backoff.delay(attempts);
        self.metrics.record_retry();
        warn!(
            identity = %identity,
            message_id = envelope.payload.id,
            attempt,
            max_retries = self.options.max_retries,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            reason = %reason,
            "processing failed; retry scheduled"
        );
        Ok(DeliveryOutcome::RetryScheduled { attempt, backoff })
    }

    async fn acknowledge(&self, envelope: &Envelope, started: Instant) -> Result<DeliveryOutcome> {
        let identity = &envelope.identity;
        let status = self.settle(identity, Settlement::Ack).await?;
        self.ledger.clear(identity);

        if status == AckStatus::AlreadySettled {
            debug!(identity = %identity, "duplicate acknowledgment ignored");
            return Ok(DeliveryOutcome::AlreadySettled);
        }

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_consumed(elapsed_nanos(started));
        debug!(identity = %identity, message_id = envelope.payload.id, "delivery acknowledged");
        if self.options.progress_interval > 0 && processed % self.options.progress_interval == 0 {
            info!(processed, "delivery progress");
        }
        Ok(DeliveryOutcome::Acked)
    }

    async fn dead_letter(&self, envelope: &Envelope, reason: String) -> Result<DeliveryOutcome> {
        let identity = &envelope.identity;
        let max_retries = self.options.max_retries;
        let routing_key = dead_letter_key(envelope.payload.id);

        let mut payload = envelope.payload.clone();
        payload.mark_exhausted(max_retries, reason.clone());

        if let Err(source) = self.sink.submit(&routing_key, payload).await {
            error!(
                identity = %identity,
                routing_key = %routing_key,
                error = %source,
                "dead-letter submission failed; delivery left unacknowledged"
            );
            if self.options.redelivery == RedeliveryMode::NackRequeue {
                if let Err(nack) = self.source.nack_requeue(identity).await {
                    warn!(identity = %identity, error = %nack, "failed to hand delivery back");
                }
            }
            return Err(DispatchError::DeadLetterSubmit {
                identity: identity.clone(),
                source,
            });
        }

        // Counted as failed once the payload is in the sink, even if the ack fails.
        let acked = self.settle(identity, Settlement::Ack).await;
        self.ledger.clear(identity);
        if !matches!(acked, Ok(AckStatus::AlreadySettled)) {
            self.metrics.record_failed();
        }
        acked?;
        error!(
            identity = %identity,
            message_id = envelope.payload.id,
            attempts = max_retries,
            reason = %reason,
            routing_key = %routing_key,
            "message dead-lettered"
        );
        Ok(DeliveryOutcome::DeadLettered {
            attempts: max_retries,
        })
    }

    async fn settle(&self, identity: &DeliveryIdentity, settlement: Settlement) -> Result<AckStatus> {
        let result = match settlement {
            Settlement::Ack => self.source.ack(identity).await,
            Settlement::Requeue => self.source.nack_requeue(identity).await,
        };
        result.map_err(|source| DispatchError::Acknowledgment {
            identity: identity.clone(),
            source,
        })
    }

    async fn cancel(&self, identity: &DeliveryIdentity) -> Result<DeliveryOutcome> {
        debug!(identity = %identity, "retry cancelled by shutdown");
        self.settle(identity, Settlement::Requeue).await?;
        Ok(DeliveryOutcome::Cancelled)
    }

    /// Sleep for `backoff`, returning `false` if shutdown interrupted it.
    async fn pause(&self, backoff: Duration) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        tokio::select! {
            _ = self.sleeper.sleep(backoff) => true,
            _ = stopped(self.shutdown_signal()) => false,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("source", &self.source.name())
            .field("options", &self.options)
            .field("processed", &self.processed_count())
            .finish_non_exhaustive()
    }
}

/// Worker capacity held by one delivery while its handler runs.
struct WorkerSlot {
    limiter: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerSlot {
    fn release(&mut self) {
        self.permit = None;
    }

    /// Wait for capacity again. Returns `false` if shutdown came first.
    async fn reacquire(&mut self, shutdown: watch::Receiver<bool>) -> Result<bool> {
        tokio::select! {
            biased;
            _ = stopped(shutdown) => Ok(false),
            permit = Arc::clone(&self.limiter).acquire_owned() => {
                self.permit = Some(permit.map_err(|_| DispatchError::LimiterClosed)?);
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
}

/// Resolves once the shutdown flag is set. Pends forever if the sender is gone.
pub(crate) async fn stopped(mut signal: watch::Receiver<bool>) {
    loop {
        let stopping = *signal.borrow_and_update();
        if stopping {
            return;
        }
        if signal.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "delivery task panicked");
        }
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
