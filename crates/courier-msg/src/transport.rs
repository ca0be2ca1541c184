//! ---
//! courier_section: "02-messaging-data-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message source and dead-letter sink contracts."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryIdentity, Envelope, WorkshopMessage};
use crate::Result;

/// Result of a settlement call (`ack`, `nack_requeue`, `nack_discard`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The delivery was outstanding and is now settled.
    Settled,
    /// The delivery had already been settled; the call was a no-op.
    AlreadySettled,
}

impl AckStatus {
    /// Whether this call performed the settlement.
    pub fn is_settled(self) -> bool {
        matches!(self, AckStatus::Settled)
    }
}

/// Confirmation that a publish was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Destination topic or queue.
    pub destination: String,
    /// Routing key supplied by the caller.
    pub key: String,
    /// Position assigned by the transport.
    pub offset: u64,
    /// Acceptance time.
    pub accepted_at: DateTime<Utc>,
}

/// Inbound side of a broker plus the publish path used by producers.
///
/// Every delivery returned from [`MessageSource::receive`] must eventually be
/// settled exactly once through `ack`, `nack_requeue` or `nack_discard`.
/// Settling again reports [`AckStatus::AlreadySettled`] instead of failing.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next delivery. `None` once the source is closed and drained.
    async fn receive(&self) -> Option<Envelope>;

    /// Acknowledge and remove the delivery.
    async fn ack(&self, identity: &DeliveryIdentity) -> Result<AckStatus>;

    /// Return the delivery to the source for redelivery under the same identity.
    async fn nack_requeue(&self, identity: &DeliveryIdentity) -> Result<AckStatus>;

    /// Drop the delivery without redelivery.
    async fn nack_discard(&self, identity: &DeliveryIdentity) -> Result<AckStatus>;

    /// Publish a new message.
    async fn publish(
        &self,
        destination: &str,
        key: &str,
        payload: WorkshopMessage,
    ) -> Result<PublishReceipt>;

    /// Human-readable transport name for logging and metrics.
    fn name(&self) -> &str;
}

/// Terminal destination for messages that exhausted their retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Submit a dead-lettered message under `routing_key`.
    async fn submit(&self, routing_key: &str, payload: WorkshopMessage) -> Result<()>;
}

/// Routing key used for a dead-lettered copy of message `id`.
pub fn dead_letter_key(id: u64) -> String {
    format!("dlq-{id}")
}
