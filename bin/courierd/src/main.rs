//! ---
//! courier_section: "05-operator-binary"
//! courier_subsection: "binary"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Binary entrypoint for the Courier operator tool."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_common::config::AppConfig;
use courier_common::logging::init_tracing;
use courier_dispatch::{BatchEmitter, DeliveryRuntime, SimulatedFailureHandler};
use courier_metrics::{new_registry, serve_metrics, DeliveryMetricsExporter, MetricsAggregator};
use courier_msg::InMemoryBroker;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Courier delivery core operator tool", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Send a synthetic batch through the delivery core and report statistics")]
    Run {
        #[arg(long, default_value_t = 1000, help = "Number of messages to send")]
        count: u64,
        #[arg(long, help = "Enable simulated handler failures")]
        simulate_failures: bool,
        #[arg(long, value_name = "RATE", help = "Override the simulated failure rate")]
        failure_rate: Option<f64>,
        #[arg(long, value_name = "N", help = "Override the retry budget")]
        max_retries: Option<u32>,
        #[arg(
            long,
            value_name = "SECONDS",
            default_value_t = 300,
            help = "Give up waiting for settlement after this many seconds"
        )]
        timeout_secs: u64,
    },
    #[command(about = "Print the effective configuration as TOML")]
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/courier.toml"));
    candidates.push(PathBuf::from("configs/courier.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;

    match cli.command.unwrap_or(Commands::Run {
        count: 1000,
        simulate_failures: false,
        failure_rate: None,
        max_retries: None,
        timeout_secs: 300,
    }) {
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
        }
        Commands::Run {
            count,
            simulate_failures,
            failure_rate,
            max_retries,
            timeout_secs,
        } => {
            config.delivery.simulate_failures |= simulate_failures;
            if let Some(rate) = failure_rate {
                config.delivery.failure_rate = rate;
            }
            if let Some(retries) = max_retries {
                config.delivery.max_retries = retries;
            }
            config.validate()?;
            init_tracing("courierd", &config.logging)?;
            match &loaded.source {
                Some(path) => info!(path = %path.display(), "configuration loaded"),
                None => info!("no configuration file found; using defaults"),
            }
            run_batch(config, count, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}

async fn run_batch(config: AppConfig, count: u64, timeout: Duration) -> Result<()> {
    let delivery = config.delivery.clone();
    let registry = new_registry();
    let mut metrics = MetricsAggregator::new(delivery.reset_policy);
    if config.metrics.enabled {
        metrics = metrics.with_exporter(DeliveryMetricsExporter::register(
            &registry,
            &config.emitter.origin,
        )?);
    }
    let metrics = Arc::new(metrics);
    let metrics_server = if config.metrics.enabled {
        let server =
            serve_metrics(registry.clone(), Arc::clone(&metrics), config.metrics.listen).await?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let broker = InMemoryBroker::new(delivery.dead_letter_topic.clone());
    let handler = Arc::new(SimulatedFailureHandler::from_config(&delivery));
    let mut runtime = DeliveryRuntime::builder(
        delivery.clone(),
        Arc::new(broker.subscribe(delivery.topic.clone())),
        Arc::new(broker.clone()),
        handler,
    )
    .metrics(Arc::clone(&metrics))
    .dead_letter_source(Arc::new(broker.dead_letter_source()))
    .spawn();

    let emitter = BatchEmitter::new(
        Arc::new(broker.subscribe(delivery.topic.clone())),
        Arc::clone(&metrics),
        delivery.topic.clone(),
        config.emitter.clone(),
    );
    let report = emitter.send_batch(count).await;
    if !report.is_complete() {
        warn!(
            published = report.published,
            failed = report.failed,
            unsettled = report.unsettled,
            "batch incomplete"
        );
    }

    tokio::select! {
        settled = runtime.wait_for_settled(report.published, timeout) => {
            if settled {
                info!(expected = report.published, "every published message settled");
            } else {
                warn!(timeout_secs = timeout.as_secs(), "timed out waiting for settlement");
            }
        }
        interrupted = signal::ctrl_c() => {
            interrupted.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
        }
    }

    for err in runtime.errors() {
        warn!(error = %err, "delivery infrastructure failure");
    }
    let processed = runtime.processed_count();
    let drained = runtime.drained_count();
    runtime.shutdown().await?;
    let summary = metrics.publish_summary();
    broker.close();
    summary.log_report("final performance summary");
    info!(processed, drained, "run complete");
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
