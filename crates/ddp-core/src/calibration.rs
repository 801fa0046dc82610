//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Per-device calibration of raw ADC counts."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use ddp_common::config::{CalibrationConfig, DeviceCalibration};
use ddp_msg::{DeviceId, WireFormat};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Linear transform `value = raw * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCoefficients {
    pub scale: f64,
    pub offset: f64,
}

impl CalibrationCoefficients {
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        offset: 0.0,
    };

    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }
}

impl From<&DeviceCalibration> for CalibrationCoefficients {
    fn from(entry: &DeviceCalibration) -> Self {
        Self::new(entry.scale, entry.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("raw value {raw} exceeds the {bits}-bit value width")]
    OutOfRange { raw: u64, bits: u8 },
}

/// Convert a raw sample into its physical value.
pub fn calibrate(
    raw: u64,
    coefficients: &CalibrationCoefficients,
    format: &WireFormat,
) -> Result<f64, CalibrationError> {
    if raw > format.max_raw_value() {
        return Err(CalibrationError::OutOfRange {
            raw,
            bits: format.value_bits(),
        });
    }
    Ok(raw as f64 * coefficients.scale + coefficients.offset)
}

/// Lookup of per-device coefficients, supplied by the deployment.
pub trait CoefficientSource: Send + Sync {
    fn get_coefficients(&self, device_id: DeviceId) -> Option<CalibrationCoefficients>;
}

#[derive(Debug, Default, Deserialize)]
struct CoefficientFile {
    #[serde(default)]
    devices: Vec<DeviceCalibration>,
}

/// In-memory coefficient table, ordered by insertion.
#[derive(Debug, Clone, Default)]
pub struct CoefficientTable {
    entries: IndexMap<DeviceId, CalibrationCoefficients>,
}

impl CoefficientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from the `[calibration]` section. Entries from the
    /// external file are loaded first; inline entries override them.
    pub fn from_config(config: &CalibrationConfig) -> anyhow::Result<Self> {
        let mut table = match &config.path {
            Some(path) => Self::from_path(path)?,
            None => Self::new(),
        };
        for entry in &config.devices {
            table.insert(DeviceId(entry.device_id), entry.into());
        }
        Ok(table)
    }

    /// Load a standalone TOML file of `[[devices]]` entries.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        debug!(calibration_path = %path.display(), "loading calibration table");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read calibration file {}", path.display()))?;
        let file: CoefficientFile = toml::from_str(&contents)
            .with_context(|| format!("failed to parse calibration file {}", path.display()))?;
        let mut table = Self::new();
        for entry in &file.devices {
            if !entry.scale.is_finite() || !entry.offset.is_finite() {
                return Err(anyhow!(
                    "calibration coefficients for device {} in {} must be finite",
                    entry.device_id,
                    path.display()
                ));
            }
            if table
                .insert(DeviceId(entry.device_id), entry.into())
                .is_some()
            {
                return Err(anyhow!(
                    "calibration entry for device {} declared more than once in {}",
                    entry.device_id,
                    path.display()
                ));
            }
        }
        Ok(table)
    }

    pub fn insert(
        &mut self,
        device_id: DeviceId,
        coefficients: CalibrationCoefficients,
    ) -> Option<CalibrationCoefficients> {
        self.entries.insert(device_id, coefficients)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, CalibrationCoefficients)> + '_ {
        self.entries.iter().map(|(id, coefficients)| (*id, *coefficients))
    }
}

impl FromIterator<(DeviceId, CalibrationCoefficients)> for CoefficientTable {
    fn from_iter<T: IntoIterator<Item = (DeviceId, CalibrationCoefficients)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl CoefficientSource for CoefficientTable {
    fn get_coefficients(&self, device_id: DeviceId) -> Option<CalibrationCoefficients> {
        self.entries.get(&device_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn applies_linear_transform() {
        let format = WireFormat::default();
        let coefficients = CalibrationCoefficients::new(0.5, -10.0);
        assert_eq!(calibrate(100, &coefficients, &format), Ok(40.0));
        assert_eq!(
            calibrate(0, &CalibrationCoefficients::IDENTITY, &format),
            Ok(0.0)
        );
    }

    #[test]
    fn rejects_values_wider_than_the_value_field() {
        let format = WireFormat::default();
        let raw = format.max_raw_value() + 1;
        assert_eq!(
            calibrate(raw, &CalibrationCoefficients::IDENTITY, &format),
            Err(CalibrationError::OutOfRange { raw, bits: 16 })
        );
    }

    #[test]
    fn inline_entries_override_file_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[devices]]
            device_id = 1
            scale = 2.0

            [[devices]]
            device_id = 2
            scale = 3.0
            offset = 1.5
            "#
        )
        .unwrap();

        let config = CalibrationConfig {
            path: Some(file.path().to_path_buf()),
            devices: vec![DeviceCalibration {
                device_id: 1,
                scale: 10.0,
                offset: 0.0,
            }],
        };
        let table = CoefficientTable::from_config(&config).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get_coefficients(DeviceId(1)),
            Some(CalibrationCoefficients::new(10.0, 0.0))
        );
        assert_eq!(
            table.get_coefficients(DeviceId(2)),
            Some(CalibrationCoefficients::new(3.0, 1.5))
        );
        assert_eq!(table.get_coefficients(DeviceId(3)), None);
    }

    #[test]
    fn duplicate_file_entries_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[devices]]\ndevice_id = 4\nscale = 1.0\n\n[[devices]]\ndevice_id = 4\nscale = 2.0"
        )
        .unwrap();
        let err = CoefficientTable::from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
