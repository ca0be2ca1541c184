//! ---
//! courier_section: "02-messaging-data-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message model and collaborator contracts."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Message model plus the message source and dead-letter sink contracts the
//! delivery core is written against, with an in-memory broker implementing both.

pub mod memory;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures reported by message source and dead-letter sink collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    /// The collaborator refused or could not complete the operation.
    #[error("{operation} rejected by transport: {reason}")]
    Rejected {
        /// Operation that failed (`ack`, `publish`, ...).
        operation: &'static str,
        /// Collaborator supplied reason.
        reason: String,
    },
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

impl MessagingError {
    /// Convenience constructor for [`MessagingError::Rejected`].
    pub fn rejected(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}

pub use memory::{FaultPlan, InMemoryBroker, InMemorySource, PublishedRecord};
pub use transport::{dead_letter_key, AckStatus, DeadLetterSink, MessageSource, PublishReceipt};
pub use types::{DeliveryIdentity, DeliveryMeta, Envelope, WorkshopMessage};
