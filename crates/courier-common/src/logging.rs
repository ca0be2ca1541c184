//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Tracing setup with a delivery audit trail."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Stdout carries everything the filter lets through. A separate daily JSON
//! file keeps only delivery-core events (acks, retries, dead-letter routing,
//! drains) together with the `delivery` span that names the identity and
//! message id they belong to.
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "COURIER_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static WRITER_GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Available log formats for stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber.
///
/// * `COURIER_LOG` overrides the filter (e.g. `info`, `courier_dispatch=debug`). When unset or
///   invalid `RUST_LOG` is honoured, finally defaulting to `info`.
/// * The audit file `<prefix>-deliveries.log` under `config.directory` rolls daily.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "unable to create log directory {}",
            config.directory.display()
        )
    })?;
    let audit_file = audit_file_name(service_name, config);
    let (audit_writer, audit_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &audit_file));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = WRITER_GUARDS.set([stdout_guard, audit_guard]);

    let filter = resolve_filter(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
    );

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let audit_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(audit_writer)
        .with_filter(audit_targets())
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(audit_layer)
        .try_init()
        .ok();

    let audit_path: PathBuf = config.directory.join(&audit_file);
    info!(
        service = %service_name,
        audit_log = %audit_path.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

/// Install a plain stdout subscriber for tests and short-lived tools.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn audit_file_name(service_name: &str, config: &LoggingConfig) -> String {
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    format!("{prefix}-deliveries.log")
}

/// Delivery transitions from the dispatcher, broker warnings and summaries.
fn audit_targets() -> Targets {
    Targets::new()
        .with_target("courier_dispatch", Level::INFO)
        .with_target("courier_msg", Level::WARN)
        .with_target("courier_metrics", Level::INFO)
}

fn resolve_filter(custom: Option<&str>, fallback: Option<&str>) -> EnvFilter {
    if let Some(directive) = custom {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("invalid {LOG_ENV} directive ({err}); ignoring it"),
        }
    }
    fallback
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}
