//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Digital device execution units and their mailboxes."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ddp_common::time::{duration_to_millis, monotonic_now};
use ddp_metrics::IngestMetrics;
use ddp_msg::{DeviceId, Message, WireFormat};
use ddp_rt::RateLimiter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::calibration::{calibrate, CalibrationCoefficients};
use crate::error::SupervisorError;
use crate::session::{SessionError, SessionEvent, SessionState, SessionStateMachine};
use crate::sink::{ActuationCommand, Actuator, CalibratedSample, SampleSink};

/// What the connection should do after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(Message),
    /// Send the reply, then close; the sample could not be delivered.
    ReplyAndClose(Message),
    /// No reply; the message was not admitted.
    Throttle { retry_after: Duration },
    /// Normal end of session.
    Close,
    ViolationClose(SessionError),
}

impl Action {
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            Action::ReplyAndClose(_) | Action::Close | Action::ViolationClose(_)
        )
    }
}

/// Platform-side counterpart of one physical device for one session.
pub struct DigitalDevice {
    device_id: DeviceId,
    session: SessionStateMachine,
    limiter: RateLimiter,
    coefficients: CalibrationCoefficients,
    format: WireFormat,
    sink: Arc<dyn SampleSink>,
    actuator: Arc<dyn Actuator>,
    last_reading: Option<CalibratedSample>,
}

impl std::fmt::Debug for DigitalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalDevice")
            .field("device_id", &self.device_id)
            .field("state", &self.session.state())
            .field("coefficients", &self.coefficients)
            .finish_non_exhaustive()
    }
}

impl DigitalDevice {
    pub fn new(
        device_id: DeviceId,
        coefficients: CalibrationCoefficients,
        format: WireFormat,
        limiter: RateLimiter,
        sink: Arc<dyn SampleSink>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        Self {
            device_id,
            session: SessionStateMachine::new(),
            limiter,
            coefficients,
            format,
            sink,
            actuator,
            last_reading: None,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Samples still expected in the current session.
    pub fn outstanding(&self) -> u64 {
        match self.session.state() {
            SessionState::ExpectingData { remaining } => remaining,
            _ => 0,
        }
    }

    pub fn current_reading(&self) -> Option<&CalibratedSample> {
        self.last_reading.as_ref()
    }

    pub async fn handle_message(&mut self, message: Message, now: Instant) -> Action {
        let event = self.session.on_message(&message, &mut self.limiter, now);
        self.apply(event).await
    }

    /// Wait up to `timeout` for the limiter to admit a previously throttled
    /// data message. `None` means the message was abandoned.
    pub async fn admit_throttled(&mut self, message: Message, timeout: Duration) -> Option<Action> {
        if !self.limiter.acquire_within(timeout).await {
            return None;
        }
        let event = self.session.on_admitted(&message);
        Some(self.apply(event).await)
    }

    pub fn retry_after(&mut self, now: Instant) -> Duration {
        self.limiter.retry_after(now)
    }

    pub async fn actuate(&self, command: ActuationCommand) -> anyhow::Result<()> {
        self.actuator.actuate(self.device_id, command).await
    }

    async fn apply(&mut self, event: Result<SessionEvent, SessionError>) -> Action {
        match event {
            Ok(SessionEvent::Announced {
                sample_count,
                reply,
                ..
            }) => {
                info!(device_id = self.device_id.get(), sample_count, "session announced");
                Action::Reply(reply)
            }
            Ok(SessionEvent::Sample {
                timestamp,
                raw_value,
                reply,
            }) => self.record_sample(timestamp, raw_value, reply).await,
            Ok(SessionEvent::Throttled { retry_after }) => Action::Throttle { retry_after },
            Ok(SessionEvent::Terminated) => {
                info!(device_id = self.device_id.get(), "session terminated");
                Action::Close
            }
            Err(violation) => {
                warn!(
                    device_id = self.device_id.get(),
                    state = %violation.state(),
                    error = %violation,
                    "closing session on protocol violation"
                );
                Action::ViolationClose(violation)
            }
        }
    }

    async fn record_sample(&mut self, timestamp: u64, raw_value: u64, reply: Message) -> Action {
        let value = match calibrate(raw_value, &self.coefficients, &self.format) {
            Ok(value) => value,
            Err(err) => {
                error!(device_id = self.device_id.get(), error = %err, "calibration failed");
                self.session.close();
                return Action::ReplyAndClose(reply);
            }
        };
        let sample = CalibratedSample {
            device_id: self.device_id,
            timestamp,
            raw_value,
            value,
            received_at: Utc::now(),
        };
        self.last_reading = Some(sample.clone());
        match self.sink.store(sample).await {
            Ok(()) => Action::Reply(reply),
            Err(err) => {
                error!(
                    device_id = self.device_id.get(),
                    error = %err,
                    "sample sink rejected sample; closing session"
                );
                self.session.close();
                Action::ReplyAndClose(reply)
            }
        }
    }
}

/// Requests accepted by a running digital device.
#[derive(Debug)]
pub enum DeviceCommand {
    Inbound {
        message: Message,
        reply: oneshot::Sender<Action>,
    },
    CurrentReading {
        reply: oneshot::Sender<Option<CalibratedSample>>,
    },
    Actuate {
        command: ActuationCommand,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Address of a running digital device.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device_id: DeviceId,
    mailbox: mpsc::Sender<DeviceCommand>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Whether the device task has stopped consuming its mailbox.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Resolves once the device task is gone.
    pub async fn closed(&self) {
        self.mailbox.closed().await
    }

    /// Forward one inbound protocol message and wait for the resulting action.
    pub async fn deliver(&self, message: Message) -> Result<Action, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.request(DeviceCommand::Inbound { message, reply }, rx)
            .await
    }

    pub async fn current_reading(&self) -> Result<Option<CalibratedSample>, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.request(DeviceCommand::CurrentReading { reply }, rx)
            .await
    }

    pub async fn actuate(&self, command: ActuationCommand) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.request(DeviceCommand::Actuate { command, reply }, rx)
            .await?
            .map_err(|err| SupervisorError::Actuation {
                device_id: self.device_id,
                reason: format!("{err:#}"),
            })
    }

    async fn request<T>(
        &self,
        command: DeviceCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SupervisorError> {
        self.mailbox
            .send(command)
            .await
            .map_err(|_| SupervisorError::DeviceUnavailable(self.device_id))?;
        rx.await
            .map_err(|_| SupervisorError::DeviceUnavailable(self.device_id))
    }
}

/// Spawn `device` on its own task and return its handle and join handle.
pub fn spawn_device(
    device: DigitalDevice,
    mailbox_capacity: usize,
    throttle_timeout: Duration,
    metrics: Option<IngestMetrics>,
) -> (DeviceHandle, JoinHandle<()>) {
    let device_id = device.device_id();
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let span = tracing::info_span!("digital_device", device_id = device_id.get());
    let task = tokio::spawn(run_device(device, rx, throttle_timeout, metrics).instrument(span));
    (
        DeviceHandle {
            device_id,
            mailbox: tx,
        },
        task,
    )
}

async fn run_device(
    mut device: DigitalDevice,
    mut mailbox: mpsc::Receiver<DeviceCommand>,
    throttle_timeout: Duration,
    metrics: Option<IngestMetrics>,
) {
    while let Some(command) = mailbox.recv().await {
        match command {
            DeviceCommand::Inbound { message, reply } => {
                let mut action = device.handle_message(message, monotonic_now()).await;
                if let Action::Throttle { retry_after } = action {
                    if let Some(metrics) = &metrics {
                        metrics.record_throttled();
                    }
                    debug!(
                        retry_after_ms = duration_to_millis(retry_after),
                        "data message throttled"
                    );
                    action = match device.admit_throttled(message, throttle_timeout).await {
                        Some(admitted) => admitted,
                        None => {
                            if let Some(metrics) = &metrics {
                                metrics.record_throttle_abandoned();
                            }
                            warn!(
                                timeout_ms = duration_to_millis(throttle_timeout),
                                "throttled data message abandoned"
                            );
                            Action::Throttle {
                                retry_after: device.retry_after(monotonic_now()),
                            }
                        }
                    };
                }
                let closes = action.closes_session();
                let _ = reply.send(action);
                if closes {
                    break;
                }
            }
            DeviceCommand::CurrentReading { reply } => {
                let _ = reply.send(device.current_reading().cloned());
            }
            DeviceCommand::Actuate { command, reply } => {
                let _ = reply.send(device.actuate(command).await);
            }
        }
    }
    debug!(state = %device.state(), "digital device stopped");
}
