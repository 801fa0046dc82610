//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Shared primitives and utilities for the core runtime."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_timestamp_bits() -> u8 {
    32
}

fn default_value_bits() -> u8 {
    16
}

fn default_remaining_count_bits() -> u8 {
    16
}

fn default_max_messages() -> u32 {
    100
}

fn default_rate_window() -> Duration {
    Duration::from_secs(1)
}

fn default_throttle_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7400))
}

fn default_mailbox_capacity() -> usize {
    32
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_sample_journal() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the ingestion runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
    #[serde(default)]
    pub duplicate_device_policy: DuplicateDevicePolicy,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "DDP_CONFIG";

    /// Load configuration from disk, respecting the `DDP_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
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
        self.protocol.validate()?;
        self.rate_limit.validate()?;
        self.restart_policy.validate()?;
        self.listener.validate()?;
        self.calibration.validate()?;
        Ok(())
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

/// Field widths of the wire protocol, in bits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    #[serde(default = "default_timestamp_bits")]
    pub timestamp_bits: u8,
    #[serde(default = "default_value_bits")]
    pub value_bits: u8,
    /// Width of both `Announce.sample_count` and `DataAck.remaining_count`.
    #[serde(default = "default_remaining_count_bits")]
    pub remaining_count_bits: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timestamp_bits: default_timestamp_bits(),
            value_bits: default_value_bits(),
            remaining_count_bits: default_remaining_count_bits(),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, bits) in [
            ("timestamp_bits", self.timestamp_bits),
            ("value_bits", self.value_bits),
            ("remaining_count_bits", self.remaining_count_bits),
        ] {
            if bits == 0 || bits > 64 || bits % 8 != 0 {
                return Err(anyhow!(
                    "protocol.{field} must be a multiple of 8 between 8 and 64 (got {bits})"
                ));
            }
        }
        Ok(())
    }
}

/// Admission algorithm used by the per-device throttle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleAlgorithm {
    #[default]
    SlidingWindow,
    TokenBucket,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(rename = "window_ms", default = "default_rate_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window: Duration,
    #[serde(default)]
    pub algorithm: ThrottleAlgorithm,
    /// Upper bound on how long a throttled data message waits for admission.
    #[serde(rename = "throttle_timeout_ms", default = "default_throttle_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub throttle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            window: default_rate_window(),
            algorithm: ThrottleAlgorithm::default(),
            throttle_timeout: default_throttle_timeout(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            return Err(anyhow!("rate_limit.max_messages must be greater than zero"));
        }
        if self.window.is_zero() {
            return Err(anyhow!("rate_limit.window_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Restart intensity: at most `max_restarts` crashes per `window` before a
/// device id is marked permanently failed.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicyConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(rename = "window_ms", default = "default_restart_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window: Duration,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window: default_restart_window(),
        }
    }
}

impl RestartPolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(anyhow!("restart_policy.window_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// What to do when an Announce arrives for a device id that already has an
/// active digital device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateDevicePolicy {
    #[default]
    Reject,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Bounded mailbox depth of each digital device.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 {
            return Err(anyhow!("listener.mailbox_capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// Linear calibration entry for one device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeviceCalibration {
    pub device_id: u8,
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

/// Calibration coefficient sources. Inline entries take precedence over the
/// optional external file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub devices: Vec<DeviceCalibration>,
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.devices {
            if !seen.insert(entry.device_id) {
                return Err(anyhow!(
                    "calibration entry for device {} declared more than once",
                    entry.device_id
                ));
            }
            if !entry.scale.is_finite() || !entry.offset.is_finite() {
                return Err(anyhow!(
                    "calibration coefficients for device {} must be finite",
                    entry.device_id
                ));
            }
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
    /// Write calibrated samples to their own rolling file instead of the
    /// operational log.
    #[serde(default = "default_sample_journal")]
    pub sample_journal: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            sample_journal: default_sample_journal(),
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
