//! ---
//! courier_section: "02-messaging-data-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Payload, delivery identity and envelope types carried between source, handler and sink."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Business message carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkshopMessage {
    /// Business identifier assigned by the producer.
    pub id: u64,
    /// Opaque body.
    pub content: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Transport that produced the message; informational only.
    pub origin: String,
    /// Processing attempts recorded before dead-lettering.
    #[serde(default)]
    pub retry_count: u32,
    /// Failure reasons appended on the way to the dead-letter sink.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl WorkshopMessage {
    /// Construct a fresh message with `retry_count == 0`.
    pub fn new(id: u64, content: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            timestamp: Utc::now(),
            origin: origin.into(),
            retry_count: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Record exhausted retries ahead of dead-lettering.
    ///
    /// `retry_count` never decreases, even if the message was dead-lettered
    /// before under a larger retry budget.
    pub fn mark_exhausted(&mut self, attempts: u32, reason: impl Into<String>) {
        self.retry_count = self.retry_count.max(attempts);
        self.diagnostics.push(reason.into());
    }
}

/// Transport-assigned key of one physical delivery.
///
/// The core treats it as opaque; only equality and hashing are used.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryIdentity(Arc<str>);

impl DeliveryIdentity {
    /// Wrap an arbitrary collaborator-supplied key.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Identity of a log-structured delivery (`partition:offset`).
    pub fn from_offset(partition: impl fmt::Display, offset: u64) -> Self {
        Self::new(format!("{partition}:{offset}"))
    }

    /// Identity of a channel-scoped delivery tag.
    pub fn from_delivery_tag(channel: impl fmt::Display, tag: u64) -> Self {
        Self::new(format!("{channel}#{tag}"))
    }

    /// Borrow the raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeliveryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeliveryIdentity({})", self.0)
    }
}

/// Broker-specific redelivery hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMeta {
    /// Whether the transport has presented this delivery before.
    pub redelivered: bool,
    /// Number of times the transport has presented this delivery, including this one.
    pub delivery_count: u32,
}

/// One inbound unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Identity of this physical delivery.
    pub identity: DeliveryIdentity,
    /// Business payload.
    pub payload: WorkshopMessage,
    /// Transport metadata.
    pub meta: DeliveryMeta,
    /// Routing key the message was published under.
    pub key: String,
}

impl Envelope {
    /// Build a first-time delivery.
    pub fn new(identity: DeliveryIdentity, key: impl Into<String>, payload: WorkshopMessage) -> Self {
        Self {
            identity,
            payload,
            meta: DeliveryMeta {
                redelivered: false,
                delivery_count: 1,
            },
            key: key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identities_compare_by_key_only() {
        let a = DeliveryIdentity::from_offset("workshop-topic", 7);
        let b = DeliveryIdentity::new("workshop-topic:7");
        let c = DeliveryIdentity::from_delivery_tag("channel-1", 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "workshop-topic:7");
    }

    #[test]
    fn exhausted_marking_keeps_retry_count_monotonic() {
        let mut message = WorkshopMessage::new(1, "Test message 1", "kafka");
        assert_eq!(message.retry_count, 0);
        message.mark_exhausted(3, "boom");
        assert_eq!(message.retry_count, 3);
        message.mark_exhausted(2, "again");
        assert_eq!(message.retry_count, 3);
        assert_eq!(message.diagnostics, vec!["boom", "again"]);
    }

    #[test]
    fn message_json_shape() {
        let message = WorkshopMessage::new(42, "body", "rabbitmq");
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["id"], 42);
        assert_eq!(json["retry_count"], 0);
        assert!(json.get("diagnostics").is_none());
    }

    #[test]
    fn identity_serializes_as_its_key() {
        let identity = DeliveryIdentity::from_delivery_tag("channel-1", 9);
        let json = serde_json::to_value(&identity).expect("serialize");
        assert_eq!(json, serde_json::json!("channel-1#9"));
        let back: DeliveryIdentity = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, identity);
    }
}
