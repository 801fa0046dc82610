//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Per-connection protocol sequencing."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::fmt;
use std::time::{Duration, Instant};

use ddp_msg::{DeviceId, Message, MessageKind};
use ddp_rt::RateLimiter;
use thiserror::Error;

/// Position of a connection within the Announce..Terminate exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAnnounce,
    ExpectingData { remaining: u64 },
    AwaitingTerminate,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingAnnounce => "awaiting_announce",
            SessionState::ExpectingData { .. } => "expecting_data",
            SessionState::AwaitingTerminate => "awaiting_terminate",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::ExpectingData { remaining } => {
                write!(f, "expecting_data({remaining})")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("protocol violation: received {received} while {state}")]
    ProtocolViolation {
        state: SessionState,
        received: MessageKind,
    },
}

impl SessionError {
    /// State the session was in when the offending message arrived.
    pub fn state(&self) -> SessionState {
        match self {
            SessionError::ProtocolViolation { state, .. } => *state,
        }
    }
}

/// Accepted step of the exchange, with the reply to send where one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Announced {
        device_id: DeviceId,
        sample_count: u64,
        reply: Message,
    },
    /// A data message passed admission; `reply` is its DataAck.
    Sample {
        timestamp: u64,
        raw_value: u64,
        reply: Message,
    },
    /// Admission denied. The state is unchanged.
    Throttled { retry_after: Duration },
    Terminated,
}

enum Admission {
    Granted,
    Denied(Duration),
}

/// Strict ordering of one session's messages.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingAnnounce,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Force the terminal state.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Validate `message` against the current state, consulting `limiter`
    /// before a data message is admitted.
    pub fn on_message(
        &mut self,
        message: &Message,
        limiter: &mut RateLimiter,
        now: Instant,
    ) -> Result<SessionEvent, SessionError> {
        self.step(message, || {
            if limiter.allow(now) {
                Admission::Granted
            } else {
                Admission::Denied(limiter.retry_after(now))
            }
        })
    }

    /// Same as [`on_message`](Self::on_message) for a data message whose
    /// admission was already granted by the caller.
    pub fn on_admitted(&mut self, message: &Message) -> Result<SessionEvent, SessionError> {
        self.step(message, || Admission::Granted)
    }

    fn step(
        &mut self,
        message: &Message,
        admit: impl FnOnce() -> Admission,
    ) -> Result<SessionEvent, SessionError> {
        match (self.state, *message) {
            (
                SessionState::AwaitingAnnounce,
                Message::Announce {
                    device_id,
                    sample_count,
                },
            ) => {
                self.state = if sample_count > 0 {
                    SessionState::ExpectingData {
                        remaining: sample_count,
                    }
                } else {
                    SessionState::AwaitingTerminate
                };
                Ok(SessionEvent::Announced {
                    device_id,
                    sample_count,
                    reply: Message::AnnounceAck,
                })
            }
            (
                SessionState::ExpectingData { remaining },
                Message::Data {
                    timestamp,
                    raw_value,
                },
            ) => match admit() {
                Admission::Denied(retry_after) => Ok(SessionEvent::Throttled { retry_after }),
                Admission::Granted => {
                    let remaining = remaining - 1;
                    self.state = if remaining > 0 {
                        SessionState::ExpectingData { remaining }
                    } else {
                        SessionState::AwaitingTerminate
                    };
                    Ok(SessionEvent::Sample {
                        timestamp,
                        raw_value,
                        reply: Message::DataAck {
                            remaining_count: remaining,
                        },
                    })
                }
            },
            (SessionState::AwaitingTerminate, Message::Terminate) => {
                self.state = SessionState::Closed;
                Ok(SessionEvent::Terminated)
            }
            (state, other) => {
                self.state = SessionState::Closed;
                Err(SessionError::ProtocolViolation {
                    state,
                    received: other.kind(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddp_common::config::ThrottleAlgorithm;

    fn generous_limiter() -> RateLimiter {
        RateLimiter::new(1_000, Duration::from_secs(1), ThrottleAlgorithm::SlidingWindow)
    }

    fn data(timestamp: u64) -> Message {
        Message::Data {
            timestamp,
            raw_value: 42,
        }
    }

    fn replies(
        machine: &mut SessionStateMachine,
        limiter: &mut RateLimiter,
        messages: &[Message],
    ) -> Vec<Message> {
        let now = Instant::now();
        messages
            .iter()
            .filter_map(|message| match machine.on_message(message, limiter, now) {
                Ok(SessionEvent::Announced { reply, .. })
                | Ok(SessionEvent::Sample { reply, .. }) => Some(reply),
                Ok(_) => None,
                Err(err) => panic!("unexpected violation: {err}"),
            })
            .collect()
    }

    #[test]
    fn full_exchange_produces_acks_in_order() {
        let mut machine = SessionStateMachine::new();
        let mut limiter = generous_limiter();
        let announce = Message::Announce {
            device_id: DeviceId(7),
            sample_count: 3,
        };
        let out = replies(
            &mut machine,
            &mut limiter,
            &[announce, data(1), data(2), data(3), Message::Terminate],
        );
        assert_eq!(
            out,
            vec![
                Message::AnnounceAck,
                Message::DataAck { remaining_count: 2 },
                Message::DataAck { remaining_count: 1 },
                Message::DataAck { remaining_count: 0 },
            ]
        );
        assert!(machine.is_closed());
    }

    #[test]
    fn extra_data_before_terminate_is_a_violation() {
        let mut machine = SessionStateMachine::new();
        let mut limiter = generous_limiter();
        let announce = Message::Announce {
            device_id: DeviceId(1),
            sample_count: 1,
        };
        replies(&mut machine, &mut limiter, &[announce, data(1)]);
        assert_eq!(machine.state(), SessionState::AwaitingTerminate);

        let err = machine
            .on_message(&data(2), &mut limiter, Instant::now())
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation {
                state: SessionState::AwaitingTerminate,
                received: MessageKind::Data,
            }
        );
        assert!(machine.is_closed());
    }

    #[test]
    fn anything_but_announce_first_closes_the_session() {
        for first in [
            Message::AnnounceAck,
            data(0),
            Message::DataAck { remaining_count: 0 },
            Message::Terminate,
        ] {
            let mut machine = SessionStateMachine::new();
            let err = machine
                .on_message(&first, &mut generous_limiter(), Instant::now())
                .unwrap_err();
            assert_eq!(err.state(), SessionState::AwaitingAnnounce);
            assert!(machine.is_closed());
        }
    }

    #[test]
    fn zero_samples_goes_straight_to_terminate() {
        let mut machine = SessionStateMachine::new();
        let mut limiter = generous_limiter();
        let announce = Message::Announce {
            device_id: DeviceId(3),
            sample_count: 0,
        };
        replies(&mut machine, &mut limiter, &[announce]);
        assert_eq!(machine.state(), SessionState::AwaitingTerminate);
        assert_eq!(
            machine.on_message(&Message::Terminate, &mut limiter, Instant::now()),
            Ok(SessionEvent::Terminated)
        );
    }

    #[test]
    fn closed_is_terminal() {
        let mut machine = SessionStateMachine::new();
        machine.close();
        let err = machine
            .on_message(
                &Message::Announce {
                    device_id: DeviceId(1),
                    sample_count: 1,
                },
                &mut generous_limiter(),
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err.state(), SessionState::Closed);
    }

    #[test]
    fn throttled_data_leaves_state_untouched() {
        let mut machine = SessionStateMachine::new();
        let mut limiter =
            RateLimiter::new(1, Duration::from_millis(100), ThrottleAlgorithm::SlidingWindow);
        let now = Instant::now();
        machine
            .on_message(
                &Message::Announce {
                    device_id: DeviceId(9),
                    sample_count: 2,
                },
                &mut limiter,
                now,
            )
            .unwrap();
        assert!(matches!(
            machine.on_message(&data(1), &mut limiter, now),
            Ok(SessionEvent::Sample { .. })
        ));
        assert_eq!(
            machine.on_message(&data(2), &mut limiter, now),
            Ok(SessionEvent::Throttled {
                retry_after: Duration::from_millis(100)
            })
        );
        assert_eq!(machine.state(), SessionState::ExpectingData { remaining: 1 });
        assert!(matches!(
            machine.on_admitted(&data(2)),
            Ok(SessionEvent::Sample {
                reply: Message::DataAck { remaining_count: 0 },
                ..
            })
        ));
    }
}
