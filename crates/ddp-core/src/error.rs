//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Error taxonomy of the device supervisor."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use ddp_msg::{CodecError, DeviceId, TransportError};
use thiserror::Error;

use crate::session::SessionError;

/// Reasons a connection or operator request was refused or cut short.
/// Every variant is local to one device id.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("device {0} already has an active digital device")]
    DuplicateDevice(DeviceId),
    #[error("no calibration coefficients for device {0}")]
    CalibrationNotFound(DeviceId),
    #[error("device {0} exceeded its restart budget and is marked failed")]
    RestartBudgetExhausted(DeviceId),
    #[error("digital device {0} is no longer running")]
    DeviceUnavailable(DeviceId),
    #[error("actuation of device {device_id} failed: {reason}")]
    Actuation { device_id: DeviceId, reason: String },
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Protocol(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<CodecError> for SupervisorError {
    fn from(err: CodecError) -> Self {
        SupervisorError::Transport(TransportError::Codec(err))
    }
}

impl SupervisorError {
    /// Short label used for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            SupervisorError::DuplicateDevice(_) => "duplicate_device",
            SupervisorError::CalibrationNotFound(_) => "calibration_not_found",
            SupervisorError::RestartBudgetExhausted(_) => "restart_budget_exhausted",
            SupervisorError::DeviceUnavailable(_) => "device_unavailable",
            SupervisorError::Actuation { .. } => "actuation",
            SupervisorError::ShuttingDown => "shutting_down",
            SupervisorError::Protocol(_) => "protocol_violation",
            SupervisorError::Transport(TransportError::Codec(_)) => "decode_error",
            SupervisorError::Transport(_) => "io",
        }
    }
}
