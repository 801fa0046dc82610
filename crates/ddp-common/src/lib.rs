//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Shared primitives and utilities for the core runtime."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
//! Core shared primitives for the digital device platform workspace.
//! This crate exposes configuration loading, logging bootstrap and the
//! monotonic clock used by rate limiting and restart bookkeeping.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, CalibrationConfig, DeviceCalibration, DuplicateDevicePolicy, ListenerConfig,
    LoadedAppConfig, LoggingConfig, MetricsConfig, ProtocolConfig, RateLimitConfig,
    RestartPolicyConfig, ThrottleAlgorithm,
};
pub use logging::{init_tracing, LogFormat, SAMPLE_TARGET};
pub use time::{duration_to_millis, monotonic_now};
