//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Exponential retry backoff policy."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use courier_common::DeliveryConfig;

/// Doubling backoff: `delay(n) = 2^n * base`, uncapped unless a ceiling is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Optional upper bound for any single delay.
    pub ceiling: Option<Duration>,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            ceiling: None,
        }
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base: config.base_backoff,
            ceiling: config.max_backoff,
        }
    }

    /// Delay before the retry that follows `attempts` earlier failures.
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn delay(&self, attempts: u32) -> Duration {
        let delay = 2u32
            .checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        match self.ceiling {
            Some(ceiling) => delay.min(ceiling),
            None => delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
