//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Digital device lifecycle supervision."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use ddp_common::config::{AppConfig, DuplicateDevicePolicy, RateLimitConfig};
use ddp_common::time::{duration_to_millis, monotonic_now};
use ddp_metrics::{IngestMetrics, SharedRegistry};
use ddp_msg::{CodecError, Connection, DeviceId, Message, TransportError, WireFormat};
use ddp_resilience::{RestartDecision, RestartLedger, RestartPolicy, ResilienceMetrics};
use ddp_rt::RateLimiter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calibration::CoefficientSource;
use crate::device::{spawn_device, Action, DeviceHandle, DigitalDevice};
use crate::error::SupervisorError;
use crate::registry::{ActiveDevice, DeviceRegistry, Slot};
use crate::session::{SessionError, SessionState};
use crate::sink::{Actuator, SampleSink};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Runtime parameters of the supervisor, resolved from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub format: WireFormat,
    pub rate_limit: RateLimitConfig,
    pub restart_policy: RestartPolicy,
    pub duplicate_policy: DuplicateDevicePolicy,
    pub mailbox_capacity: usize,
}

impl SupervisorConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, CodecError> {
        Ok(Self {
            format: WireFormat::from_config(&config.protocol)?,
            rate_limit: config.rate_limit.clone(),
            restart_policy: RestartPolicy::from_config(&config.restart_policy),
            duplicate_policy: config.duplicate_device_policy,
            mailbox_capacity: config.listener.mailbox_capacity,
        })
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::default(),
            rate_limit: RateLimitConfig::default(),
            restart_policy: RestartPolicy::default(),
            duplicate_policy: DuplicateDevicePolicy::default(),
            mailbox_capacity: 32,
        }
    }
}

/// External systems every digital device talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub coefficients: Arc<dyn CoefficientSource>,
    pub sink: Arc<dyn SampleSink>,
    pub actuator: Arc<dyn Actuator>,
}

/// Lifecycle notifications for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A device task panicked; its slot was released for a reconnect.
    DeviceCrashed { device_id: DeviceId, attempt: u32 },
    /// Restart budget exhausted; the id is rejected until reset.
    DeviceFailed { device_id: DeviceId, failures: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Terminate received after the last sample.
    Completed,
    /// The physical device hung up mid-session.
    PeerDisconnected,
    /// A sample could not be delivered downstream.
    SampleRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// `None` when the peer left before announcing itself.
    pub device_id: Option<DeviceId>,
    pub samples_acked: u64,
    pub end: SessionEnd,
}

struct SupervisorState {
    registry: DeviceRegistry,
    restarts: RestartLedger<DeviceId>,
}

struct Shared {
    config: SupervisorConfig,
    collaborators: Collaborators,
    state: Mutex<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
    shutting_down: AtomicBool,
    metrics: Option<IngestMetrics>,
}

/// A digital device bound to the connection that created it.
struct DeviceLease {
    device_id: DeviceId,
    generation: u64,
    handle: DeviceHandle,
    task: JoinHandle<()>,
}

/// Creates, tracks and restarts digital devices, one per device id.
#[derive(Clone)]
pub struct DeviceSupervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DeviceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSupervisor")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl DeviceSupervisor {
    pub fn new(
        config: SupervisorConfig,
        collaborators: Collaborators,
        metrics: Option<SharedRegistry>,
    ) -> anyhow::Result<Self> {
        let (ingest, resilience) = match metrics {
            Some(registry) => (
                Some(
                    IngestMetrics::new(registry.clone())
                        .context("failed to register ingest metrics")?,
                ),
                Some(
                    ResilienceMetrics::new(registry)
                        .context("failed to register resilience metrics")?,
                ),
            ),
            None => (None, None),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = SupervisorState {
            registry: DeviceRegistry::new(),
            restarts: RestartLedger::new(config.restart_policy, resilience),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                collaborators,
                state: Mutex::new(state),
                events,
                shutting_down: AtomicBool::new(false),
                metrics: ingest,
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Subscribe to crash and permanent-failure notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    /// Run one physical-device session to completion.
    ///
    /// The first message must be an Announce; anything else is a protocol
    /// violation that never touches the registry. The digital device is
    /// released before this returns, whatever the outcome.
    pub async fn serve_connection<C: Connection>(
        &self,
        mut connection: C,
    ) -> Result<SessionSummary, SupervisorError> {
        let peer = connection.peer().to_owned();
        let Some(first) = self.read_next(&mut connection).await? else {
            debug!(peer = %peer, "connection closed before announce");
            return Ok(SessionSummary {
                device_id: None,
                samples_acked: 0,
                end: SessionEnd::PeerDisconnected,
            });
        };
        self.record_message(&first);

        let Message::Announce { device_id, .. } = first else {
            let violation = SessionError::ProtocolViolation {
                state: SessionState::AwaitingAnnounce,
                received: first.kind(),
            };
            self.record_violation(&violation);
            warn!(peer = %peer, error = %violation, "first message was not an announce");
            return Err(violation.into());
        };

        let lease = match self.admit(device_id) {
            Ok(lease) => lease,
            Err(err) => {
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_rejected_announce(err.label());
                }
                warn!(peer = %peer, device_id = device_id.get(), error = %err, "announce rejected");
                return Err(err);
            }
        };

        let outcome = self.drive(&mut connection, &lease, first).await;
        let summary = self.settle(lease, outcome).await;
        match &summary {
            Ok(summary) => info!(
                peer = %peer,
                device_id = device_id.get(),
                samples = summary.samples_acked,
                end = ?summary.end,
                "session finished"
            ),
            Err(err) => warn!(
                peer = %peer,
                device_id = device_id.get(),
                reason = err.label(),
                error = %err,
                "session aborted"
            ),
        }
        summary
    }

    /// Handle of the active digital device for `device_id`.
    pub fn lookup(&self, device_id: DeviceId) -> Option<DeviceHandle> {
        self.shared.state.lock().registry.lookup(device_id)
    }

    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.shared.state.lock().registry.active_ids()
    }

    pub fn failed_devices(&self) -> Vec<DeviceId> {
        self.shared.state.lock().registry.failed_ids()
    }

    /// Terminate the active device for `device_id`. Returns `false` when
    /// nothing was running, so repeated calls are harmless.
    pub fn evict(&self, device_id: DeviceId) -> bool {
        let evicted = {
            let mut state = self.shared.state.lock();
            let evicted = state.registry.take_active(device_id);
            self.publish_active_count(&state.registry);
            evicted
        };
        match evicted {
            Some(device) => {
                device.terminate();
                info!(
                    device_id = device_id.get(),
                    generation = device.generation,
                    "digital device evicted"
                );
                true
            }
            None => false,
        }
    }

    /// Clear a permanent failure so the device may announce again.
    pub fn reset_failed(&self, device_id: DeviceId) -> bool {
        let mut state = self.shared.state.lock();
        let cleared = state.registry.clear_failed(device_id);
        if cleared {
            state.restarts.reset(&device_id);
            info!(device_id = device_id.get(), "permanent failure cleared by operator");
        }
        cleared
    }

    /// Refuse new sessions and terminate every active device.
    pub fn shutdown(&self) -> usize {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let drained = {
            let mut state = self.shared.state.lock();
            let drained = state.registry.drain_active();
            self.publish_active_count(&state.registry);
            drained
        };
        for device in &drained {
            device.terminate();
        }
        info!(terminated = drained.len(), "device supervisor shut down");
        drained.len()
    }

    fn admit(&self, device_id: DeviceId) -> Result<DeviceLease, SupervisorError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        let coefficients = self
            .shared
            .collaborators
            .coefficients
            .get_coefficients(device_id)
            .ok_or(SupervisorError::CalibrationNotFound(device_id))?;

        let config = &self.shared.config;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        match state.registry.slot(device_id) {
            Some(Slot::Failed(_)) => {
                return Err(SupervisorError::RestartBudgetExhausted(device_id));
            }
            // The previous device may have crashed without being settled yet.
            Some(Slot::Active(current))
                if current.handle.is_closed()
                    && state.restarts.would_give_up(&device_id, monotonic_now()) =>
            {
                return Err(SupervisorError::RestartBudgetExhausted(device_id));
            }
            Some(Slot::Active(current)) if current.handle.is_closed() => {
                debug!(
                    device_id = device_id.get(),
                    generation = current.generation,
                    "reclaiming slot of a stopped device"
                );
            }
            Some(Slot::Active(_)) => {
                if config.duplicate_policy == DuplicateDevicePolicy::Reject {
                    return Err(SupervisorError::DuplicateDevice(device_id));
                }
            }
            None => {}
        }
        if let Some(stale) = state.registry.take_active(device_id) {
            info!(
                device_id = device_id.get(),
                generation = stale.generation,
                "replacing digital device"
            );
            stale.terminate();
        }

        let generation = state.registry.next_generation();
        let device = DigitalDevice::new(
            device_id,
            coefficients,
            config.format,
            RateLimiter::from_config(&config.rate_limit),
            self.shared.collaborators.sink.clone(),
            self.shared.collaborators.actuator.clone(),
        );
        let (handle, task) = spawn_device(
            device,
            config.mailbox_capacity,
            config.rate_limit.throttle_timeout,
            self.shared.metrics.clone(),
        );
        let active = ActiveDevice::new(handle.clone(), generation, task.abort_handle());
        if !state.registry.insert_if_absent(device_id, active) {
            task.abort();
            return Err(SupervisorError::DuplicateDevice(device_id));
        }
        self.publish_active_count(&state.registry);
        drop(guard);

        info!(device_id = device_id.get(), generation, "digital device started");
        Ok(DeviceLease {
            device_id,
            generation,
            handle,
            task,
        })
    }

    async fn drive<C: Connection>(
        &self,
        connection: &mut C,
        lease: &DeviceLease,
        first: Message,
    ) -> Result<(SessionEnd, u64), SupervisorError> {
        let mut message = first;
        let mut acked = 0u64;
        loop {
            match lease.handle.deliver(message).await? {
                Action::Reply(reply) => {
                    if matches!(reply, Message::DataAck { .. }) {
                        acked += 1;
                    }
                    connection.send(reply).await?;
                }
                Action::ReplyAndClose(reply) => {
                    connection.send(reply).await?;
                    return Ok((SessionEnd::SampleRejected, acked + 1));
                }
                Action::Throttle { retry_after } => {
                    debug!(
                        device_id = lease.device_id.get(),
                        retry_after_ms = duration_to_millis(retry_after),
                        "data message left unacknowledged"
                    );
                }
                Action::Close => return Ok((SessionEnd::Completed, acked)),
                Action::ViolationClose(violation) => return Err(violation.into()),
            }

            message = tokio::select! {
                next = self.read_next(connection) => match next? {
                    Some(message) => message,
                    None => return Ok((SessionEnd::PeerDisconnected, acked)),
                },
                _ = lease.handle.closed() => {
                    return Err(SupervisorError::DeviceUnavailable(lease.device_id));
                }
            };
            self.record_message(&message);
        }
    }

    /// Stop the lease's task, classify how it ended and release its slot.
    async fn settle(
        &self,
        lease: DeviceLease,
        outcome: Result<(SessionEnd, u64), SupervisorError>,
    ) -> Result<SessionSummary, SupervisorError> {
        let DeviceLease {
            device_id,
            generation,
            handle,
            task,
        } = lease;
        drop(handle);
        task.abort();
        let crashed = matches!(task.await, Err(err) if err.is_panic());
        if crashed {
            error!(device_id = device_id.get(), generation, "digital device panicked");
        }
        self.release(device_id, generation, crashed);

        if let Err(SupervisorError::Protocol(violation)) = &outcome {
            self.record_violation(violation);
        }
        let (end, samples_acked) = outcome?;
        if end == SessionEnd::Completed {
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_session_completed();
            }
        }
        Ok(SessionSummary {
            device_id: Some(device_id),
            samples_acked,
            end,
        })
    }

    fn release(&self, device_id: DeviceId, generation: u64, crashed: bool) {
        let event = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            state.registry.release(device_id, generation);
            let event = if crashed {
                match state.restarts.record_failure(&device_id, monotonic_now()) {
                    RestartDecision::Restart { attempt } => {
                        Some(SupervisorEvent::DeviceCrashed { device_id, attempt })
                    }
                    RestartDecision::GiveUp { failures } => {
                        if let Some(replacement) = state.registry.take_active(device_id) {
                            replacement.terminate();
                        }
                        state.registry.mark_failed(device_id, failures);
                        Some(SupervisorEvent::DeviceFailed {
                            device_id,
                            failures,
                        })
                    }
                }
            } else {
                None
            };
            self.publish_active_count(&state.registry);
            event
        };

        if let Some(event) = event {
            if let SupervisorEvent::DeviceFailed { failures, .. } = event {
                error!(
                    device_id = device_id.get(),
                    failures,
                    "device marked permanently failed; announces will be rejected until reset"
                );
            }
            let _ = self.shared.events.send(event);
        }
    }

    async fn read_next<C: Connection>(
        &self,
        connection: &mut C,
    ) -> Result<Option<Message>, SupervisorError> {
        match connection.recv().await {
            Ok(message) => Ok(message),
            Err(err) => {
                if let TransportError::Codec(codec) = &err {
                    if let Some(metrics) = &self.shared.metrics {
                        metrics.record_decode_error();
                    }
                    warn!(peer = connection.peer(), error = %codec, "undecodable frame");
                }
                Err(err.into())
            }
        }
    }

    fn record_message(&self, message: &Message) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_message(message.kind().as_str());
        }
    }

    fn record_violation(&self, violation: &SessionError) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_violation(violation.state().as_str());
        }
    }

    fn publish_active_count(&self, registry: &DeviceRegistry) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_active_devices(registry.active_count());
        }
    }
}
