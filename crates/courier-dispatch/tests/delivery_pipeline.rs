//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "test"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "End-to-end delivery scenarios over the in-memory broker."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use courier_common::logging::init_test_tracing;
use courier_common::{
    DeliveryConfig, EmitterConfig, RecordingSleeper, RedeliveryMode, Sleeper, TokioSleeper,
};
use courier_dispatch::{
    handler_fn, BatchEmitter, DeliveryRuntime, DispatchError, MessageHandler,
    SimulatedFailureHandler,
};
use courier_metrics::MetricsAggregator;
use courier_msg::{InMemoryBroker, WorkshopMessage};

const TOPIC: &str = "workshop-topic";
const DLQ: &str = "workshop-dlq";

fn delivery_config(max_retries: u32, base_backoff: Duration, concurrency: usize) -> DeliveryConfig {
    DeliveryConfig {
        max_retries,
        base_backoff,
        concurrency,
        processing_delay: Duration::ZERO,
        ..DeliveryConfig::default()
    }
}

fn handler(failure_rate: f64) -> Arc<dyn MessageHandler> {
    Arc::new(SimulatedFailureHandler::new(true, failure_rate, Duration::ZERO).with_seed(11))
}

fn emitter(broker: &InMemoryBroker, metrics: &Arc<MetricsAggregator>) -> BatchEmitter {
    BatchEmitter::new(
        Arc::new(broker.subscribe(TOPIC)),
        Arc::clone(metrics),
        TOPIC,
        EmitterConfig::default(),
    )
}

struct Harness {
    broker: InMemoryBroker,
    metrics: Arc<MetricsAggregator>,
    runtime: DeliveryRuntime,
}

fn start(
    config: DeliveryConfig,
    handler: Arc<dyn MessageHandler>,
    sleeper: Arc<dyn Sleeper>,
) -> Harness {
    init_test_tracing();
    let broker = InMemoryBroker::new(DLQ);
    let metrics = Arc::new(MetricsAggregator::new(config.reset_policy));
    let runtime = DeliveryRuntime::builder(
        config,
        Arc::new(broker.subscribe(TOPIC)),
        Arc::new(broker.clone()),
        handler,
    )
    .metrics(Arc::clone(&metrics))
    .sleeper(sleeper)
    .dead_letter_source(Arc::new(broker.dead_letter_source()))
    .error_backlog(16)
    .spawn();
    Harness {
        broker,
        metrics,
        runtime,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn always_failing_batch_is_fully_dead_lettered() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let harness = start(
        delivery_config(2, Duration::from_millis(1000), 8),
        handler(1.0),
        sleeper.clone(),
    );

    let report = emitter(&harness.broker, &harness.metrics).send_batch(100).await;
    assert_eq!(report.published, 100);
    assert!(harness
        .runtime
        .wait_for_settled(100, Duration::from_secs(10))
        .await);

    let summary = harness.runtime.summary();
    assert_eq!(summary.total_failed, 100);
    assert_eq!(summary.total_consumed, 0);
    assert_eq!(summary.total_retries, 200);
    assert_eq!(summary.success_rate_percent, 0.0);
    assert!(harness.runtime.ledger().is_empty());

    let dead = harness.broker.published(DLQ);
    assert_eq!(dead.len(), 100);
    assert!(dead.iter().all(|record| record.payload.retry_count == 2));
    assert!(dead.iter().all(|record| record.key == format!("dlq-{}", record.payload.id)));
    let ids: BTreeSet<u64> = dead.iter().map(|record| record.payload.id).collect();
    assert_eq!(ids, (1..=100).collect());

    let requested = sleeper.requested();
    assert_eq!(requested.len(), 200);
    assert_eq!(
        requested
            .iter()
            .filter(|delay| **delay == Duration::from_millis(1000))
            .count(),
        100
    );
    assert_eq!(
        requested
            .iter()
            .filter(|delay| **delay == Duration::from_millis(2000))
            .count(),
        100
    );

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while harness.runtime.drained_count() < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "dead-letter topic drained");
    assert_eq!(harness.broker.acked(DLQ), 100);
    assert_eq!(harness.broker.acked(TOPIC), 100);

    harness.runtime.shutdown().await.expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn succeeding_batch_consumes_everything_produced() {
    let harness = start(
        delivery_config(3, Duration::from_millis(1000), 4),
        handler(0.0),
        Arc::new(RecordingSleeper::new()),
    );

    emitter(&harness.broker, &harness.metrics).send_batch(50).await;
    assert!(harness
        .runtime
        .wait_for_settled(50, Duration::from_secs(5))
        .await);

    let summary = harness.runtime.summary();
    assert_eq!(summary.total_produced, 50);
    assert_eq!(summary.total_consumed, summary.total_produced);
    assert_eq!(summary.success_rate_percent, 100.0);
    assert_eq!(harness.runtime.processed_count(), 50);
    assert!(harness.runtime.ledger().is_empty());
    assert!(harness.broker.published(DLQ).is_empty());

    harness.runtime.shutdown().await.expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_retry_sequences_run_in_parallel() {
    // Each sequence backs off 50 + 100 + 200 ms before dead-lettering. Eight
    // sequences through two workers would take four times that if a backoff
    // held its worker.
    let harness = start(
        delivery_config(3, Duration::from_millis(50), 2),
        handler(1.0),
        Arc::new(TokioSleeper),
    );

    let started = Instant::now();
    emitter(&harness.broker, &harness.metrics).send_batch(8).await;
    assert!(harness
        .runtime
        .wait_for_settled(8, Duration::from_secs(5))
        .await);
    let elapsed = started.elapsed();

    assert_eq!(harness.metrics.total_failed(), 8);
    assert_eq!(harness.metrics.total_retries(), 24);
    assert!(elapsed >= Duration::from_millis(350), "elapsed {elapsed:?}");
    assert!(
        elapsed < Duration::from_millis(1000),
        "sequences were serialised: {elapsed:?}"
    );

    harness.runtime.shutdown().await.expect("clean shutdown");
}

async fn healthy_delivery_overtakes_backoffs(redelivery: RedeliveryMode) {
    // Ids 1..=3 always fail, id 4 succeeds; a single worker serves all of them.
    let failing_ids: Arc<dyn MessageHandler> =
        Arc::new(handler_fn(|message: WorkshopMessage| async move {
            if message.id <= 3 {
                Err::<(), _>(anyhow!("downstream unavailable"))
            } else {
                Ok(())
            }
        }));
    let harness = start(
        DeliveryConfig {
            redelivery,
            ..delivery_config(2, Duration::from_secs(1), 1)
        },
        failing_ids,
        Arc::new(TokioSleeper),
    );

    let started = Instant::now();
    emitter(&harness.broker, &harness.metrics).send_batch(4).await;
    let consumed = tokio::time::timeout(Duration::from_secs(2), async {
        while harness.metrics.total_consumed() == 0 || harness.metrics.total_retries() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let elapsed = started.elapsed();

    assert!(consumed.is_ok(), "healthy delivery acknowledged");
    assert!(
        elapsed < Duration::from_millis(500),
        "healthy delivery waited behind a backoff: {elapsed:?}"
    );
    assert_eq!(harness.metrics.total_retries(), 3);
    assert_eq!(harness.metrics.total_failed(), 0);

    harness.runtime.shutdown().await.expect("clean shutdown");
    assert_eq!(harness.broker.depth(TOPIC), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backoff_frees_worker_for_requeued_deliveries() {
    healthy_delivery_overtakes_backoffs(RedeliveryMode::NackRequeue).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backoff_frees_worker_for_resubmitted_deliveries() {
    healthy_delivery_overtakes_backoffs(RedeliveryMode::Resubmit).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_long_backoff() {
    let harness = start(
        delivery_config(3, Duration::from_secs(30), 2),
        handler(1.0),
        Arc::new(TokioSleeper),
    );

    emitter(&harness.broker, &harness.metrics).send_batch(1).await;
    let retried = tokio::time::timeout(Duration::from_secs(2), async {
        while harness.metrics.total_retries() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(retried.is_ok(), "first failure recorded");

    let broker = harness.broker.clone();
    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), harness.runtime.shutdown())
        .await
        .expect("shutdown is prompt")
        .expect("clean shutdown");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(broker.depth(TOPIC), 1);
    assert_eq!(broker.in_flight(TOPIC), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_keeps_lifetime_totals() {
    let harness = start(
        delivery_config(3, Duration::from_millis(1000), 2),
        handler(0.0),
        Arc::new(RecordingSleeper::new()),
    );

    emitter(&harness.broker, &harness.metrics).send_batch(10).await;
    assert!(harness
        .runtime
        .wait_for_settled(10, Duration::from_secs(5))
        .await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let before = harness.runtime.summary();

    harness.runtime.reset();
    let after = harness.runtime.summary();
    assert_eq!(after.total_consumed, 10);
    assert_eq!(after.total_produced, 10);
    assert_eq!(after.total_failed, 0);
    assert!(after.duration_seconds < before.duration_seconds);
    assert_eq!(after.latency.max_ms, 0.0);
    assert_eq!(harness.runtime.processed_count(), 0);
    assert!(harness.runtime.ledger().is_empty());

    harness.runtime.shutdown().await.expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_letter_outage_is_reported_and_recovered() {
    let mut harness = start(
        delivery_config(0, Duration::from_millis(1000), 1),
        handler(1.0),
        Arc::new(RecordingSleeper::new()),
    );
    harness.broker.faults().fail_next_dead_letters(1);

    emitter(&harness.broker, &harness.metrics).send_batch(1).await;
    let err = tokio::time::timeout(Duration::from_secs(2), harness.runtime.next_error())
        .await
        .expect("error reported")
        .expect("error channel open");
    assert!(matches!(err, DispatchError::DeadLetterSubmit { .. }));

    assert!(harness
        .runtime
        .wait_for_settled(1, Duration::from_secs(2))
        .await);
    assert_eq!(harness.broker.published(DLQ).len(), 1);
    assert_eq!(harness.metrics.total_failed(), 1);
    assert!(harness.runtime.errors().is_empty());

    harness.runtime.shutdown().await.expect("clean shutdown");
}
