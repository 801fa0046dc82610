//! ---
//! ddp_section: "03-observability"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Metrics collection and export utilities."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Registry shared by every component of one process.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Routes served by the exporter: `/metrics` for scrapes and `/healthz` for
/// liveness probes.
pub fn router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry)
}

/// Bind `addr` and serve [`router`] until [`MetricsServer::shutdown`].
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = StdTcpListener::bind(addr)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    let bound = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener =
        TcpListener::from_std(listener).context("failed to register metrics listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(registry);
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics exporter failed")
    });
    info!(address = %bound, "metrics exporter listening");

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn metrics_handler(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "ddpd_starts_total",
            "Total number of times the ingestion daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ddpd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("ddpd_build_info", "Build metadata for the running daemon"),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }
}

/// Ingestion counters shared by every connection and digital device.
#[derive(Clone, Debug)]
pub struct IngestMetrics {
    messages_total: IntCounterVec,
    throttled_total: IntCounter,
    throttle_abandoned_total: IntCounter,
    protocol_violations_total: IntCounterVec,
    decode_errors_total: IntCounter,
    rejected_announces_total: IntCounterVec,
    sessions_completed_total: IntCounter,
    active_devices: IntGauge,
}

impl IngestMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let messages_total = IntCounterVec::new(
            Opts::new(
                "ddp_messages_total",
                "Inbound protocol messages processed, by message kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let throttled_total = IntCounter::with_opts(Opts::new(
            "ddp_throttled_total",
            "Data messages denied immediate admission by the rate limiter",
        ))?;
        registry.register(Box::new(throttled_total.clone()))?;

        let throttle_abandoned_total = IntCounter::with_opts(Opts::new(
            "ddp_throttle_abandoned_total",
            "Throttled data messages dropped after the admission timeout",
        ))?;
        registry.register(Box::new(throttle_abandoned_total.clone()))?;

        let protocol_violations_total = IntCounterVec::new(
            Opts::new(
                "ddp_protocol_violations_total",
                "Sessions closed because of an out-of-order message, by session state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(protocol_violations_total.clone()))?;

        let decode_errors_total = IntCounter::with_opts(Opts::new(
            "ddp_decode_errors_total",
            "Connections closed because of an undecodable frame",
        ))?;
        registry.register(Box::new(decode_errors_total.clone()))?;

        let rejected_announces_total = IntCounterVec::new(
            Opts::new(
                "ddp_rejected_announces_total",
                "Announce messages refused by the supervisor, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejected_announces_total.clone()))?;

        let sessions_completed_total = IntCounter::with_opts(Opts::new(
            "ddp_sessions_completed_total",
            "Sessions that reached Terminate normally",
        ))?;
        registry.register(Box::new(sessions_completed_total.clone()))?;

        let active_devices = IntGauge::with_opts(Opts::new(
            "ddp_active_devices",
            "Digital devices currently registered as active",
        ))?;
        registry.register(Box::new(active_devices.clone()))?;

        Ok(Self {
            messages_total,
            throttled_total,
            throttle_abandoned_total,
            protocol_violations_total,
            decode_errors_total,
            rejected_announces_total,
            sessions_completed_total,
            active_devices,
        })
    }

    pub fn record_message(&self, kind: &str) {
        self.messages_total.with_label_values(&[kind]).inc();
    }

    pub fn record_throttled(&self) {
        self.throttled_total.inc();
    }

    pub fn record_throttle_abandoned(&self) {
        self.throttle_abandoned_total.inc();
    }

    pub fn record_violation(&self, state: &str) {
        self.protocol_violations_total
            .with_label_values(&[state])
            .inc();
    }

    pub fn record_decode_error(&self) {
        self.decode_errors_total.inc();
    }

    pub fn record_rejected_announce(&self, reason: &str) {
        self.rejected_announces_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_session_completed(&self) {
        self.sessions_completed_total.inc();
    }

    pub fn set_active_devices(&self, count: usize) {
        self.active_devices.set(count as i64);
    }
}

pub use prometheus;
