//! ---
//! courier_section: "02-messaging-data-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "In-memory broker implementing the message source and dead-letter sink."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::transport::{AckStatus, DeadLetterSink, MessageSource, PublishReceipt};
use crate::types::{DeliveryIdentity, Envelope, WorkshopMessage};
use crate::{MessagingError, Result};

const BROKER_NAME: &str = "in-memory";

/// Snapshot of a message accepted by a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    /// Offset assigned on publish.
    pub offset: u64,
    /// Routing key supplied by the publisher.
    pub key: String,
    /// Payload as published.
    pub payload: WorkshopMessage,
}

/// Injected failures for exercising error paths.
///
/// Each counter fails that many upcoming calls, then calls succeed again.
#[derive(Debug, Default)]
pub struct FaultPlan {
    acks: AtomicU32,
    publishes: AtomicU32,
    dead_letters: AtomicU32,
}

impl FaultPlan {
    /// Fail the next `count` acknowledgments.
    pub fn fail_next_acks(&self, count: u32) {
        self.acks.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: u32) {
        self.publishes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` dead-letter submissions.
    pub fn fail_next_dead_letters(&self, count: u32) {
        self.dead_letters.store(count, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct TopicState {
    next_offset: u64,
    ready: VecDeque<Envelope>,
    in_flight: HashMap<DeliveryIdentity, Envelope>,
    acked: u64,
    discarded: u64,
    history: Vec<PublishedRecord>,
}

#[derive(Debug)]
struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
    dead_letter_topic: String,
    faults: FaultPlan,
    closed: AtomicBool,
    notify: Notify,
}

/// Process-local broker with per-topic queues and explicit settlement.
///
/// Deliveries move from `ready` to `in_flight` on receive. Requeued
/// deliveries keep their identity and are marked redelivered.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a broker that routes dead letters to `dead_letter_topic`.
    pub fn new(dead_letter_topic: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                dead_letter_topic: dead_letter_topic.into(),
                faults: FaultPlan::default(),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Competing consumer handle for `topic`.
    pub fn subscribe(&self, topic: impl Into<String>) -> InMemorySource {
        InMemorySource {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    /// Consumer handle for the dead-letter topic.
    pub fn dead_letter_source(&self) -> InMemorySource {
        self.subscribe(self.inner.dead_letter_topic.clone())
    }

    /// Topic receiving dead-lettered messages.
    pub fn dead_letter_topic(&self) -> &str {
        &self.inner.dead_letter_topic
    }

    /// Fault injection controls.
    pub fn faults(&self) -> &FaultPlan {
        &self.inner.faults
    }

    /// Stop accepting publishes and wake idle receivers.
    ///
    /// Receivers drain what is already ready before returning `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        debug!("in-memory broker closed");
    }

    /// Whether [`InMemoryBroker::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Every message ever accepted by `topic`, in offset order.
    pub fn published(&self, topic: &str) -> Vec<PublishedRecord> {
        self.with_topic(topic, |state| state.history.clone())
    }

    /// Deliveries waiting to be received.
    pub fn depth(&self, topic: &str) -> usize {
        self.with_topic(topic, |state| state.ready.len())
    }

    /// Deliveries received but not yet settled.
    pub fn in_flight(&self, topic: &str) -> usize {
        self.with_topic(topic, |state| state.in_flight.len())
    }

    /// Deliveries acknowledged on `topic`.
    pub fn acked(&self, topic: &str) -> u64 {
        self.with_topic(topic, |state| state.acked)
    }

    /// Deliveries discarded on `topic`.
    pub fn discarded(&self, topic: &str) -> u64 {
        self.with_topic(topic, |state| state.discarded)
    }

    fn with_topic<T: Default>(&self, topic: &str, read: impl FnOnce(&TopicState) -> T) -> T {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(read)
            .unwrap_or_default()
    }

    fn publish_to(&self, topic: &str, key: &str, payload: WorkshopMessage) -> Result<PublishReceipt> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        if FaultPlan::trip(&self.inner.faults.publishes) {
            return Err(MessagingError::rejected("publish", "injected publish fault"));
        }

        let offset = {
            let mut topics = self.inner.topics.lock();
            let state = topics.entry(topic.to_string()).or_default();
            let offset = state.next_offset;
            state.next_offset += 1;
            state.history.push(PublishedRecord {
                offset,
                key: key.to_string(),
                payload: payload.clone(),
            });
            state.ready.push_back(Envelope::new(
                DeliveryIdentity::from_offset(topic, offset),
                key,
                payload,
            ));
            offset
        };
        self.inner.notify.notify_waiters();
        trace!(topic, key, offset, "message accepted");

        Ok(PublishReceipt {
            destination: topic.to_string(),
            key: key.to_string(),
            offset,
            accepted_at: Utc::now(),
        })
    }

    fn try_take(&self, topic: &str) -> Option<Envelope> {
        let mut topics = self.inner.topics.lock();
        let state = topics.get_mut(topic)?;
        let envelope = state.ready.pop_front()?;
        state
            .in_flight
            .insert(envelope.identity.clone(), envelope.clone());
        Some(envelope)
    }

    fn settle(
        &self,
        topic: &str,
        identity: &DeliveryIdentity,
        apply: impl FnOnce(&mut TopicState, Envelope),
    ) -> AckStatus {
        let mut topics = self.inner.topics.lock();
        let Some(state) = topics.get_mut(topic) else {
            return AckStatus::AlreadySettled;
        };
        match state.in_flight.remove(identity) {
            Some(envelope) => {
                apply(state, envelope);
                AckStatus::Settled
            }
            None => AckStatus::AlreadySettled,
        }
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryBroker {
    async fn submit(&self, routing_key: &str, payload: WorkshopMessage) -> Result<()> {
        if FaultPlan::trip(&self.inner.faults.dead_letters) {
            return Err(MessagingError::rejected(
                "dead_letter",
                "injected dead-letter fault",
            ));
        }
        let topic = self.inner.dead_letter_topic.clone();
        self.publish_to(&topic, routing_key, payload).map(|_| ())
    }
}

/// Consumer handle bound to one topic of an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemorySource {
    broker: InMemoryBroker,
    topic: String,
}

impl InMemorySource {
    /// Topic this handle consumes from.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Broker backing this handle.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn receive(&self) -> Option<Envelope> {
        loop {
            let mut notified = std::pin::pin!(self.broker.inner.notify.notified());
            notified.as_mut().enable();

            if let Some(envelope) = self.broker.try_take(&self.topic) {
                return Some(envelope);
            }
            if self.broker.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    async fn ack(&self, identity: &DeliveryIdentity) -> Result<AckStatus> {
        if FaultPlan::trip(&self.broker.inner.faults.acks) {
            return Err(MessagingError::rejected("ack", "injected ack fault"));
        }
        Ok(self
            .broker
            .settle(&self.topic, identity, |state, _| state.acked += 1))
    }

    async fn nack_requeue(&self, identity: &DeliveryIdentity) -> Result<AckStatus> {
        let status = self.broker.settle(&self.topic, identity, |state, mut envelope| {
            envelope.meta.redelivered = true;
            envelope.meta.delivery_count = envelope.meta.delivery_count.saturating_add(1);
            state.ready.push_back(envelope);
        });
        if status.is_settled() {
            self.broker.inner.notify.notify_waiters();
        }
        Ok(status)
    }

    async fn nack_discard(&self, identity: &DeliveryIdentity) -> Result<AckStatus> {
        Ok(self
            .broker
            .settle(&self.topic, identity, |state, _| state.discarded += 1))
    }

    async fn publish(
        &self,
        destination: &str,
        key: &str,
        payload: WorkshopMessage,
    ) -> Result<PublishReceipt> {
        self.broker.publish_to(destination, key, payload)
    }

    fn name(&self) -> &str {
        BROKER_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(id: u64) -> WorkshopMessage {
        WorkshopMessage::new(id, format!("Test message {id}"), BROKER_NAME)
    }

    #[tokio::test]
    async fn publish_then_receive_in_order() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        for id in 1..=3 {
            source.publish("orders", &format!("msg-{id}"), message(id)).await.unwrap();
        }

        let first = source.receive().await.unwrap();
        assert_eq!(first.payload.id, 1);
        assert_eq!(first.identity, DeliveryIdentity::from_offset("orders", 0));
        assert_eq!(first.key, "msg-1");
        assert_eq!(broker.depth("orders"), 2);
        assert_eq!(broker.in_flight("orders"), 1);
    }

    #[tokio::test]
    async fn duplicate_ack_reports_already_settled() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        source.publish("orders", "k", message(1)).await.unwrap();
        let delivery = source.receive().await.unwrap();

        assert_eq!(source.ack(&delivery.identity).await.unwrap(), AckStatus::Settled);
        assert_eq!(
            source.ack(&delivery.identity).await.unwrap(),
            AckStatus::AlreadySettled
        );
        assert_eq!(broker.acked("orders"), 1);
        assert_eq!(broker.in_flight("orders"), 0);
    }

    #[tokio::test]
    async fn requeue_keeps_identity_and_marks_redelivery() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        source.publish("orders", "k", message(1)).await.unwrap();
        let first = source.receive().await.unwrap();
        assert!(!first.meta.redelivered);

        source.nack_requeue(&first.identity).await.unwrap();
        let second = source.receive().await.unwrap();
        assert_eq!(second.identity, first.identity);
        assert!(second.meta.redelivered);
        assert_eq!(second.meta.delivery_count, 2);
    }

    #[tokio::test]
    async fn discard_drops_delivery() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        source.publish("orders", "k", message(1)).await.unwrap();
        let delivery = source.receive().await.unwrap();
        source.nack_discard(&delivery.identity).await.unwrap();
        assert_eq!(broker.discarded("orders"), 1);
        assert_eq!(broker.depth("orders"), 0);
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        let waiter = {
            let source = source.clone();
            tokio::spawn(async move { source.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.publish("orders", "k", message(9)).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join")
            .expect("delivery");
        assert_eq!(delivery.payload.id, 9);
    }

    #[tokio::test]
    async fn close_releases_idle_receivers() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        let waiter = tokio::spawn(async move { source.receive().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert!(result.is_none());
        assert!(matches!(
            broker.subscribe("orders").publish("orders", "k", message(1)).await,
            Err(MessagingError::Closed)
        ));
    }

    #[tokio::test]
    async fn dead_letters_land_on_configured_topic() {
        let broker = InMemoryBroker::new("workshop-dlq");
        broker.submit("dlq-5", message(5)).await.unwrap();
        let records = broker.published("workshop-dlq");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "dlq-5");
        let drained = broker.dead_letter_source().receive().await.unwrap();
        assert_eq!(drained.payload.id, 5);
    }

    #[tokio::test]
    async fn injected_faults_fail_then_recover() {
        let broker = InMemoryBroker::new("dlq");
        let source = broker.subscribe("orders");
        broker.faults().fail_next_publishes(1);
        assert!(source.publish("orders", "k", message(1)).await.is_err());
        source.publish("orders", "k", message(2)).await.unwrap();

        let delivery = source.receive().await.unwrap();
        broker.faults().fail_next_acks(1);
        assert!(source.ack(&delivery.identity).await.is_err());
        assert_eq!(broker.in_flight("orders"), 1);
        assert_eq!(source.ack(&delivery.identity).await.unwrap(), AckStatus::Settled);

        broker.faults().fail_next_dead_letters(1);
        assert!(broker.submit("dlq-1", message(1)).await.is_err());
        assert!(broker.published("dlq").is_empty());
    }
}
