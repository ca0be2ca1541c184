//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for the delivery runtime."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Core shared primitives for the Courier workspace.
//! This crate exposes configuration loading, tracing setup, and the
//! sleep provider used for retry backoff.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, DeliveryConfig, EmitterConfig, LoggingConfig, MetricsConfig, RedeliveryMode,
    ResetPolicy,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{RecordingSleeper, Sleeper, TokioSleeper};
