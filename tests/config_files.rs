//! ---
//! ddp_section: "15-testing-qa-runbook"
//! ddp_subsection: "integration-tests"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Checks that the shipped configuration files load and agree."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use ddp_common::{AppConfig, DuplicateDevicePolicy, LogFormat};
use ddp_core::{CalibrationCoefficients, CoefficientSource, CoefficientTable, SupervisorConfig};
use ddp_msg::DeviceId;

fn workspace_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

fn read(path: &str) -> String {
    let full = workspace_path(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

fn reference_config() -> AppConfig {
    read("configs/ddp.toml")
        .parse()
        .expect("reference config must validate")
}

#[test]
fn reference_config_matches_documented_defaults() {
    let config = reference_config();
    let defaults = AppConfig::default();
    assert_eq!(config.protocol, defaults.protocol);
    assert_eq!(config.rate_limit, defaults.rate_limit);
    assert_eq!(config.restart_policy, defaults.restart_policy);
    assert_eq!(config.listener, defaults.listener);
    assert_eq!(config.duplicate_device_policy, DuplicateDevicePolicy::Reject);
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert!(
        config.metrics.listen.ip().is_loopback(),
        "reference config should not expose metrics beyond localhost"
    );
}

#[test]
fn reference_config_builds_a_supervisor_config() {
    let config = reference_config();
    let supervisor = SupervisorConfig::from_app_config(&config).unwrap();
    assert_eq!(supervisor.format.timestamp_bits(), 32);
    assert_eq!(supervisor.format.max_raw_value(), u64::from(u16::MAX));
    assert_eq!(supervisor.mailbox_capacity, 32);
}

#[test]
fn inline_calibration_overrides_the_shipped_table() {
    let mut calibration = reference_config().calibration;
    let relative = calibration
        .path
        .clone()
        .expect("reference config points at a calibration file");
    calibration.path = Some(workspace_path(&relative.to_string_lossy()));

    let table = CoefficientTable::from_config(&calibration).unwrap();
    assert_eq!(table.len(), 4);
    assert_eq!(
        table.get_coefficients(DeviceId(42)),
        Some(CalibrationCoefficients::new(0.01, -5.0))
    );
    assert_eq!(
        table.get_coefficients(DeviceId(3)),
        Some(CalibrationCoefficients::new(1.0, 0.0))
    );
    assert_eq!(table.get_coefficients(DeviceId(4)), None);
}
