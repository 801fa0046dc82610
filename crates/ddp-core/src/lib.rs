//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Primary orchestration and lifecycle management."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
//! Protocol sessions, isolated digital devices and the supervisor that owns
//! their lifecycle.

pub mod calibration;
pub mod device;
pub mod error;
pub mod listener;
pub mod registry;
pub mod session;
pub mod sink;
pub mod supervisor;

pub use calibration::{
    calibrate, CalibrationCoefficients, CalibrationError, CoefficientSource, CoefficientTable,
};
pub use device::{spawn_device, Action, DeviceCommand, DeviceHandle, DigitalDevice};
pub use error::SupervisorError;
pub use listener::{spawn_listener, ListenerServer};
pub use registry::{ActiveDevice, DeviceRegistry, FailedDevice, Slot};
pub use session::{SessionError, SessionEvent, SessionState, SessionStateMachine};
pub use sink::{
    ActuationCommand, Actuator, CalibratedSample, SampleSink, TracingActuator, TracingSampleSink,
};
pub use supervisor::{
    Collaborators, DeviceSupervisor, SessionEnd, SessionSummary, SupervisorConfig,
    SupervisorEvent,
};
