//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Business handler seam and the simulated-failure handler."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use courier_common::{DeliveryConfig, Sleeper, TokioSleeper};
use courier_msg::WorkshopMessage;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Business processing invoked once per delivery attempt.
///
/// `Ok(())` acknowledges the delivery. An error or a panic counts as a
/// failed attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &WorkshopMessage) -> Result<()>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &WorkshopMessage) -> Result<()> {
        (**self).handle(message).await
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    func: F,
}

/// Wrap `func` as a handler. The closure receives an owned copy of the message.
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(WorkshopMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler { func }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(WorkshopMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &WorkshopMessage) -> Result<()> {
        (self.func)(message.clone()).await
    }
}

/// Demo handler that waits out a processing delay and fails at random.
pub struct SimulatedFailureHandler {
    enabled: bool,
    failure_rate: f64,
    processing_delay: Duration,
    rng: Mutex<StdRng>,
    sleeper: Arc<dyn Sleeper>,
}

impl SimulatedFailureHandler {
    pub fn new(enabled: bool, failure_rate: f64, processing_delay: Duration) -> Self {
        Self {
            enabled,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            processing_delay,
            rng: Mutex::new(StdRng::from_entropy()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.simulate_failures,
            config.failure_rate,
            config.processing_delay,
        )
    }

    /// Seed the internal RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Replace the sleeper used for the processing delay.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn should_fail(&self) -> bool {
        self.enabled && self.rng.lock().gen::<f64>() < self.failure_rate
    }
}

#[async_trait]
impl MessageHandler for SimulatedFailureHandler {
    async fn handle(&self, message: &WorkshopMessage) -> Result<()> {
        let fail = self.should_fail();
        if !self.processing_delay.is_zero() {
            self.sleeper.sleep(self.processing_delay).await;
        }
        if fail {
            bail!("simulated processing failure");
        }
        trace!(message_id = message.id, "message processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::RecordingSleeper;

    fn message() -> WorkshopMessage {
        WorkshopMessage::new(1, "Test message 1", "in-memory")
    }

    #[tokio::test]
    async fn disabled_simulation_always_succeeds() {
        let handler = SimulatedFailureHandler::new(false, 1.0, Duration::ZERO);
        for _ in 0..50 {
            handler.handle(&message()).await.expect("no failures when disabled");
        }
    }

    #[tokio::test]
    async fn full_failure_rate_always_fails() {
        let handler = SimulatedFailureHandler::new(true, 1.0, Duration::ZERO).with_seed(7);
        for _ in 0..50 {
            let err = handler.handle(&message()).await.unwrap_err();
            assert_eq!(err.to_string(), "simulated processing failure");
        }
    }

    #[tokio::test]
    async fn zero_failure_rate_never_fails() {
        let handler = SimulatedFailureHandler::new(true, 0.0, Duration::ZERO).with_seed(7);
        for _ in 0..50 {
            assert!(handler.handle(&message()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn seeded_rate_is_roughly_honoured() {
        let handler = SimulatedFailureHandler::new(true, 0.5, Duration::ZERO).with_seed(42);
        let mut failures = 0;
        for _ in 0..1000 {
            if handler.handle(&message()).await.is_err() {
                failures += 1;
            }
        }
        assert!((350..=650).contains(&failures), "failures = {failures}");
    }

    #[tokio::test]
    async fn processing_delay_goes_through_sleeper() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let handler = SimulatedFailureHandler::new(false, 0.0, Duration::from_millis(1))
            .with_sleeper(sleeper.clone());
        handler.handle(&message()).await.unwrap();
        assert_eq!(sleeper.requested(), vec![Duration::from_millis(1)]);
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|message: WorkshopMessage| async move {
            if message.id % 2 == 0 {
                bail!("even ids fail");
            }
            Ok(())
        });
        assert!(handler.handle(&message()).await.is_ok());
        let even = WorkshopMessage::new(2, "x", "in-memory");
        assert!(handler.handle(&even).await.is_err());
    }
}
