//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Infrastructure failures surfaced by the delivery core."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use courier_msg::{DeliveryIdentity, MessagingError};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Result alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Collaborator failures that end the core's handling of one delivery.
///
/// Handler failures never appear here; they are converted into a retry or
/// dead-letter decision.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("failed to settle delivery {identity}: {source}")]
    Acknowledgment {
        identity: DeliveryIdentity,
        #[source]
        source: MessagingError,
    },
    #[error("failed to publish message {message_id} to {destination}: {source}")]
    Publish {
        message_id: u64,
        destination: String,
        #[source]
        source: MessagingError,
    },
    #[error("dead-letter submission for {identity} failed; delivery left unacknowledged: {source}")]
    DeadLetterSubmit {
        identity: DeliveryIdentity,
        #[source]
        source: MessagingError,
    },
    #[error("worker limiter closed")]
    LimiterClosed,
}

impl DispatchError {
    /// Identity of the delivery involved, when there is one.
    pub fn identity(&self) -> Option<&DeliveryIdentity> {
        match self {
            DispatchError::Acknowledgment { identity, .. }
            | DispatchError::DeadLetterSubmit { identity, .. } => Some(identity),
            DispatchError::Publish { .. } | DispatchError::LimiterClosed => None,
        }
    }
}

/// Bounded outlet for infrastructure failures raised by background tasks.
///
/// When the backlog is full the newest failure is logged and dropped.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<DispatchError>,
}

impl ErrorReporter {
    pub fn channel(backlog: usize) -> (Self, mpsc::Receiver<DispatchError>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        (Self { tx }, rx)
    }

    /// Queue `err` for the embedder. Returns `false` if it was dropped.
    pub fn report(&self, err: DispatchError) -> bool {
        match self.tx.try_send(err) {
            Ok(()) => true,
            Err(TrySendError::Full(err)) => {
                warn!(error = %err, "error backlog full; dropping infrastructure failure");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_failure(key: &str) -> DispatchError {
        DispatchError::Acknowledgment {
            identity: DeliveryIdentity::new(key),
            source: MessagingError::Closed,
        }
    }

    #[tokio::test]
    async fn full_backlog_drops_newest_failure() {
        let (reporter, mut rx) = ErrorReporter::channel(2);
        assert!(reporter.report(ack_failure("t:1")));
        assert!(reporter.report(ack_failure("t:2")));
        assert!(!reporter.report(ack_failure("t:3")));

        let first = rx.recv().await.expect("first failure");
        let second = rx.recv().await.expect("second failure");
        assert_eq!(first.identity().map(DeliveryIdentity::as_str), Some("t:1"));
        assert_eq!(second.identity().map(DeliveryIdentity::as_str), Some("t:2"));
        assert!(rx.try_recv().is_err());

        assert!(reporter.report(ack_failure("t:4")));
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (reporter, rx) = ErrorReporter::channel(4);
        drop(rx);
        assert!(!reporter.report(DispatchError::LimiterClosed));
    }
}
