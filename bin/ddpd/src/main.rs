//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "binary"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Binary entrypoint for the DDP daemon."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ddp_common::config::{AppConfig, DuplicateDevicePolicy, LoadedAppConfig};
use ddp_common::logging::init_tracing;
use ddp_core::{
    spawn_listener, CoefficientTable, Collaborators, DeviceSupervisor, SupervisorConfig,
    SupervisorEvent, TracingActuator, TracingSampleSink,
};
use ddp_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["configs/ddp.toml", "/etc/ddp/ddp.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("DDP ", env!("CARGO_PKG_VERSION")),
    about = "Digital device platform ingestion daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Override the device listener address")]
    listen: Option<SocketAddr>,

    #[arg(long, value_enum, help = "Override duplicate announce handling")]
    duplicate_policy: Option<CliDuplicatePolicy>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliDuplicatePolicy {
    Reject,
    Replace,
}

impl From<CliDuplicatePolicy> for DuplicateDevicePolicy {
    fn from(value: CliDuplicatePolicy) -> Self {
        match value {
            CliDuplicatePolicy::Reject => DuplicateDevicePolicy::Reject,
            CliDuplicatePolicy::Replace => DuplicateDevicePolicy::Replace,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Accept device connections until interrupted")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let candidates: Vec<PathBuf> = cli
        .config
        .iter()
        .cloned()
        .chain(DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from))
        .collect();

    let started = Instant::now();
    let LoadedAppConfig {
        config: mut config,
        source: config_path,
    } = AppConfig::load_with_source(&candidates)?;
    let config_elapsed = started.elapsed();

    if let Some(listen) = cli.listen {
        config.listener.listen = listen;
    }
    if let Some(policy) = cli.duplicate_policy {
        config.duplicate_device_policy = policy.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let coefficients = CoefficientTable::from_config(&config.calibration)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            eprintln!(
                "configuration {} is valid ({} calibrated devices)",
                config_path.display(),
                coefficients.len()
            );
        }
        Commands::Run => {
            init_tracing("ddpd", &config.logging)?;
            info!(config_path = %config_path.display(), "configuration loaded");

            let registry = new_registry();
            let process = DaemonMetrics::new(registry.clone())?;
            process.inc_start();
            process.observe_config_load(config_elapsed.as_secs_f64());
            process.set_build_info(env!("CARGO_PKG_VERSION"));
            run_daemon(config, registry).await?;
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry) -> Result<()> {
    // Metrics are always recorded; the flag only controls the exporter.
    let exporter = if config.metrics.enabled {
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let coefficients = CoefficientTable::from_config(&config.calibration)
        .context("failed to load calibration coefficients")?;
    if coefficients.is_empty() {
        warn!("no calibration coefficients configured; every announce will be rejected");
    } else {
        info!(devices = coefficients.len(), "calibration table loaded");
    }

    let supervisor_config = SupervisorConfig::from_app_config(&config)
        .context("invalid protocol configuration")?;
    let collaborators = Collaborators {
        coefficients: Arc::new(coefficients),
        sink: Arc::new(TracingSampleSink),
        actuator: Arc::new(TracingActuator),
    };
    let supervisor = DeviceSupervisor::new(supervisor_config, collaborators, Some(registry))?;
    let alerts = tokio::spawn(report_events(supervisor.subscribe()));

    let listener = spawn_listener(supervisor.clone(), config.listener.listen)?;
    info!(
        address = %listener.addr(),
        duplicate_policy = ?config.duplicate_device_policy,
        "daemon running; waiting for termination signal"
    );

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    listener.shutdown().await?;
    let stopped = supervisor.shutdown();
    info!(stopped, "digital devices terminated");
    alerts.abort();

    if let Some(exporter) = exporter {
        exporter.shutdown().await?;
    }

    Ok(())
}

/// Surface supervisor events to operators through the log pipeline.
async fn report_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::DeviceCrashed { device_id, attempt }) => {
                warn!(device_id = device_id.get(), attempt, "digital device crashed");
            }
            Ok(SupervisorEvent::DeviceFailed {
                device_id,
                failures,
            }) => {
                error!(
                    device_id = device_id.get(),
                    failures,
                    "digital device permanently failed; run reset before it can reconnect"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "supervisor event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
