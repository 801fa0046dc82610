//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Downstream collaborators of digital devices."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddp_common::logging::SAMPLE_TARGET;
use ddp_msg::DeviceId;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One admitted and calibrated data message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedSample {
    pub device_id: DeviceId,
    pub timestamp: u64,
    pub raw_value: u64,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}

/// Command forwarded to a physical device through its digital counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActuationCommand {
    SetOutput { channel: u8, value: f64 },
    Reset,
}

/// Persistence of calibrated samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn store(&self, sample: CalibratedSample) -> Result<()>;
}

/// Delivery of actuation commands to physical devices.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn actuate(&self, device_id: DeviceId, command: ActuationCommand) -> Result<()>;
}

/// Sink that records every sample as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSampleSink;

#[async_trait]
impl SampleSink for TracingSampleSink {
    async fn store(&self, sample: CalibratedSample) -> Result<()> {
        info!(
            target: SAMPLE_TARGET,
            device_id = sample.device_id.get(),
            timestamp = sample.timestamp,
            raw_value = sample.raw_value,
            value = sample.value,
            received_at = %sample.received_at,
            "calibrated sample"
        );
        Ok(())
    }
}

/// Actuator used when no control path is wired in; commands are logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActuator;

#[async_trait]
impl Actuator for TracingActuator {
    async fn actuate(&self, device_id: DeviceId, command: ActuationCommand) -> Result<()> {
        info!(
            target: "ddp::actuation",
            device_id = device_id.get(),
            command = ?command,
            "actuation requested"
        );
        Ok(())
    }
}
