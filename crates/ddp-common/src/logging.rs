//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Shared primitives and utilities for the core runtime."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Metadata};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "DDP_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Target of the per-sample events emitted once a reading is calibrated.
pub const SAMPLE_TARGET: &str = "ddp::samples";

static WRITER_GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber for `service_name`.
///
/// The filter comes from `DDP_LOG`, then `RUST_LOG`, then `info`. Operational
/// events go to stdout in the configured format and to a daily JSON file in
/// `config.directory`. With `sample_journal` enabled, [`SAMPLE_TARGET`]
/// events are diverted to a separate `<prefix>-samples.log` file so the
/// operational log stays readable under load.
///
/// Calling this twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "unable to create log directory {}",
            config.directory.display()
        )
    })?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());
    let mut guards = Vec::with_capacity(3);

    let stdout_writer = keep(&mut guards, tracing_appender::non_blocking(std::io::stdout()));
    let ops_writer = rolling_writer(&mut guards, &config.directory, &format!("{prefix}.log"));
    let journal_writer = config.sample_journal.then(|| {
        rolling_writer(
            &mut guards,
            &config.directory,
            &format!("{prefix}-samples.log"),
        )
    });
    let divert_samples = journal_writer.is_some();
    let operational = move |meta: &Metadata<'_>| !divert_samples || meta.target() != SAMPLE_TARGET;

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .with_filter(filter_fn(operational))
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .with_filter(filter_fn(operational))
            .boxed(),
    };

    let ops_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(ops_writer)
        .with_filter(filter_fn(operational))
        .boxed();

    // Flat records: one line per sample with no span context.
    let journal_layer = journal_writer.map(|writer| {
        fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(writer)
            .with_filter(filter_fn(|meta: &Metadata<'_>| meta.target() == SAMPLE_TARGET))
    });

    let installed = tracing_subscriber::registry()
        .with(build_filter(std::env::var(LOG_ENV).ok()))
        .with(stdout_layer)
        .with(ops_layer)
        .with(journal_layer)
        .try_init()
        .is_ok();

    if installed {
        let _ = WRITER_GUARDS.set(guards);
    }
    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        sample_journal = config.sample_journal,
        installed,
        "tracing initialised"
    );
    Ok(())
}

fn keep(guards: &mut Vec<WorkerGuard>, (writer, guard): (NonBlocking, WorkerGuard)) -> NonBlocking {
    guards.push(guard);
    writer
}

fn rolling_writer(guards: &mut Vec<WorkerGuard>, directory: &Path, file_name: &str) -> NonBlocking {
    keep(guards, tracing_appender::non_blocking(daily(directory, file_name)))
}

fn build_filter(directive: Option<String>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {DEFAULT_DIRECTIVE}");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}
