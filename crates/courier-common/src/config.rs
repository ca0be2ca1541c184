//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for the delivery runtime."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_topic() -> String {
    "workshop-topic".to_owned()
}

fn default_dead_letter_topic() -> String {
    "workshop-dlq".to_owned()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff() -> Duration {
    Duration::from_millis(1000)
}

fn default_concurrency() -> usize {
    4
}

fn default_failure_rate() -> f64 {
    0.1
}

fn default_processing_delay() -> Duration {
    Duration::from_millis(1)
}

fn default_progress_interval() -> u64 {
    100
}

fn default_origin() -> String {
    "in-memory".to_owned()
}

fn default_settle_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_key_prefix() -> String {
    "msg-".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for a Courier process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "COURIER_CONFIG";

    /// Load configuration from disk, respecting the `COURIER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// When neither the environment override nor any candidate exists the
    /// built-in defaults are returned with `source == None`.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        let config = AppConfig::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.delivery.validate()?;
        self.emitter.validate()?;
        Ok(())
    }

    /// Render the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration as toml")
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// How a failed delivery becomes eligible again after its backoff.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RedeliveryMode {
    /// Hand the delivery back to the source with a requeueing negative acknowledgment.
    #[default]
    NackRequeue,
    /// Re-invoke the same envelope locally; the source is not touched until a terminal state.
    Resubmit,
}

/// What a metrics window reset clears.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Restart the elapsed-time origin and clear producer latency only.
    #[default]
    ProducerWindow,
    /// Additionally clear the consumer latency samples.
    FullWindow,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "base_backoff_millis", default = "default_base_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_backoff: Duration,
    #[serde(rename = "max_backoff_millis", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub max_backoff: Option<Duration>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub simulate_failures: bool,
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    #[serde(rename = "processing_delay_millis", default = "default_processing_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub processing_delay: Duration,
    #[serde(default)]
    pub redelivery: RedeliveryMode,
    #[serde(default)]
    pub reset_policy: ResetPolicy,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            max_retries: default_max_retries(),
            base_backoff: default_base_backoff(),
            max_backoff: None,
            concurrency: default_concurrency(),
            simulate_failures: false,
            failure_rate: default_failure_rate(),
            processing_delay: default_processing_delay(),
            redelivery: RedeliveryMode::default(),
            reset_policy: ResetPolicy::default(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(anyhow!("delivery.topic must not be empty"));
        }
        if self.topic == self.dead_letter_topic {
            return Err(anyhow!(
                "delivery.dead_letter_topic must differ from delivery.topic ('{}')",
                self.topic
            ));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("delivery.concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(anyhow!(
                "delivery.failure_rate must lie within [0, 1], got {}",
                self.failure_rate
            ));
        }
        if let Some(ceiling) = self.max_backoff {
            if ceiling < self.base_backoff {
                return Err(anyhow!(
                    "delivery.max_backoff_millis ({}) is below base_backoff_millis ({})",
                    ceiling.as_millis(),
                    self.base_backoff.as_millis()
                ));
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(rename = "settle_timeout_millis", default = "default_settle_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_timeout: Duration,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            settle_timeout: default_settle_timeout(),
            key_prefix: default_key_prefix(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl EmitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.settle_timeout.is_zero() {
            return Err(anyhow!("emitter.settle_timeout_millis must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_policy() {
        let config = AppConfig::default();
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.delivery.base_backoff, Duration::from_millis(1000));
        assert!(config.delivery.max_backoff.is_none());
        assert!(!config.delivery.simulate_failures);
        assert!((config.delivery.failure_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.delivery.redelivery, RedeliveryMode::NackRequeue);
        assert_eq!(config.delivery.reset_policy, ResetPolicy::ProducerWindow);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn parses_delivery_section() {
        let config: AppConfig = r#"
            [delivery]
            max_retries = 2
            base_backoff_millis = 250
            max_backoff_millis = 4000
            simulate_failures = true
            failure_rate = 1.0
            redelivery = "resubmit"
            reset_policy = "full-window"

            [emitter]
            origin = "kafka"
            settle_timeout_millis = 500
            "#
        .parse()
        .expect("valid config");

        assert_eq!(config.delivery.max_retries, 2);
        assert_eq!(config.delivery.base_backoff, Duration::from_millis(250));
        assert_eq!(config.delivery.max_backoff, Some(Duration::from_secs(4)));
        assert_eq!(config.delivery.redelivery, RedeliveryMode::Resubmit);
        assert_eq!(config.delivery.reset_policy, ResetPolicy::FullWindow);
        assert_eq!(config.emitter.origin, "kafka");
        assert_eq!(config.emitter.settle_timeout, Duration::from_millis(500));
        assert_eq!(config.delivery.topic, "workshop-topic");
    }

    #[test]
    fn rejects_out_of_range_failure_rate() {
        let err = "[delivery]\nfailure_rate = 1.5\n"
            .parse::<AppConfig>()
            .expect_err("rate above one is invalid");
        assert!(err.to_string().contains("failure_rate"));
    }

    #[test]
    fn rejects_zero_concurrency_and_shared_topics() {
        assert!("[delivery]\nconcurrency = 0\n".parse::<AppConfig>().is_err());
        assert!("[delivery]\ntopic = \"a\"\ndead_letter_topic = \"a\"\n"
            .parse::<AppConfig>()
            .is_err());
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("courier.toml");
        fs::write(&path, "[delivery]\nmax_retries = 7\n").expect("write config");
        let missing = dir.path().join("missing.toml");

        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).expect("load");
        assert_eq!(loaded.config.delivery.max_retries, 7);
        assert_eq!(loaded.source, Some(path));
    }

    #[test]
    fn renders_back_to_toml() {
        let rendered = AppConfig::default().to_toml().expect("render");
        let reparsed: AppConfig = rendered.parse().expect("reparse");
        assert_eq!(reparsed.delivery.max_retries, 3);
    }
}
