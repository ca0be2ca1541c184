//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Per-delivery retry attempt tracking."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use courier_msg::DeliveryIdentity;
use dashmap::DashMap;

/// Attempt counts keyed by delivery identity.
///
/// Backed by a sharded map, so operations on different identities do not
/// contend and operations on one identity are linearizable.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: DashMap<DeliveryIdentity, u32>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures recorded so far for `identity`, zero when untracked.
    pub fn attempts_for(&self, identity: &DeliveryIdentity) -> u32 {
        self.attempts
            .get(identity)
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    /// Count one more failure and return the new total.
    pub fn record_failure(&self, identity: &DeliveryIdentity) -> u32 {
        let mut entry = self.attempts.entry(identity.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    pub fn clear(&self, identity: &DeliveryIdentity) {
        self.attempts.remove(identity);
    }

    pub fn clear_all(&self) {
        self.attempts.clear();
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
