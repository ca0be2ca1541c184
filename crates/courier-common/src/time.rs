//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for the delivery runtime."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Suspension provider used for retry backoff.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that records every requested delay and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    requested: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in call order.
    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().clone()
    }

    /// Sum of all requested delays.
    pub fn total(&self) -> Duration {
        self.requested.lock().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.requested.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Nanoseconds elapsed since `started`, saturating at `u64::MAX`.
pub fn elapsed_nanos(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Convert nanoseconds into fractional milliseconds for reporting.
pub fn nanos_to_millis(nanos: f64) -> f64 {
    nanos / 1_000_000.0
}
