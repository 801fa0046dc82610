//! ---
//! ddp_section: "04-rate-control"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Runtime helpers supporting per-device ingestion."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ddp_common::config::{RateLimitConfig, ThrottleAlgorithm};
use ddp_common::time::{duration_to_millis, monotonic_now};
use tracing::debug;

const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Per-device admission control: at most `max_messages` per rolling `window`.
///
/// The limiter is a plain value owned by exactly one digital device; callers
/// pass the current instant so the decision logic stays deterministic.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_messages: u32,
    window: Duration,
    state: Budget,
}

#[derive(Debug, Clone)]
enum Budget {
    SlidingWindow {
        admitted: VecDeque<Instant>,
    },
    TokenBucket {
        tokens: f64,
        last_refill: Option<Instant>,
    },
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration, algorithm: ThrottleAlgorithm) -> Self {
        let max_messages = max_messages.max(1);
        let state = match algorithm {
            ThrottleAlgorithm::SlidingWindow => Budget::SlidingWindow {
                admitted: VecDeque::with_capacity(max_messages as usize),
            },
            ThrottleAlgorithm::TokenBucket => Budget::TokenBucket {
                tokens: f64::from(max_messages),
                last_refill: None,
            },
        };
        Self {
            max_messages,
            window: window.max(MIN_BACKOFF),
            state,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_messages, config.window, config.algorithm)
    }

    pub fn algorithm(&self) -> ThrottleAlgorithm {
        match self.state {
            Budget::SlidingWindow { .. } => ThrottleAlgorithm::SlidingWindow,
            Budget::TokenBucket { .. } => ThrottleAlgorithm::TokenBucket,
        }
    }

    /// Admit one message at `now`, consuming budget on success.
    pub fn allow(&mut self, now: Instant) -> bool {
        self.refresh(now);
        match &mut self.state {
            Budget::SlidingWindow { admitted } => {
                if admitted.len() < self.max_messages as usize {
                    admitted.push_back(now);
                    true
                } else {
                    false
                }
            }
            Budget::TokenBucket { tokens, .. } => {
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// How long until [`allow`](Self::allow) can next succeed; zero if it
    /// would succeed at `now`.
    pub fn retry_after(&mut self, now: Instant) -> Duration {
        self.refresh(now);
        match &self.state {
            Budget::SlidingWindow { admitted } => {
                if admitted.len() < self.max_messages as usize {
                    return Duration::ZERO;
                }
                admitted
                    .front()
                    .map(|oldest| {
                        self.window
                            .saturating_sub(now.saturating_duration_since(*oldest))
                    })
                    .unwrap_or(Duration::ZERO)
            }
            Budget::TokenBucket { tokens, .. } => {
                if *tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - tokens) / self.refill_per_sec())
                }
            }
        }
    }

    /// Wait for admission for at most `timeout`. Returns `false` without
    /// consuming budget when admission cannot happen before the deadline.
    pub async fn acquire_within(&mut self, timeout: Duration) -> bool {
        let deadline = monotonic_now() + timeout;
        loop {
            let now = monotonic_now();
            if self.allow(now) {
                return true;
            }
            let wait = self.retry_after(now).max(MIN_BACKOFF);
            if now + wait > deadline {
                return false;
            }
            debug!(wait_ms = duration_to_millis(wait), "throttled; waiting for admission");
            tokio::time::sleep(wait).await;
        }
    }

    fn refill_per_sec(&self) -> f64 {
        f64::from(self.max_messages) / self.window.as_secs_f64()
    }

    fn refresh(&mut self, now: Instant) {
        let window = self.window;
        let capacity = f64::from(self.max_messages);
        let rate = self.refill_per_sec();
        match &mut self.state {
            Budget::SlidingWindow { admitted } => {
                while let Some(oldest) = admitted.front() {
                    if now.saturating_duration_since(*oldest) >= window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }
            }
            Budget::TokenBucket {
                tokens,
                last_refill,
            } => {
                if let Some(last) = *last_refill {
                    let elapsed = now.saturating_duration_since(last).as_secs_f64();
                    *tokens = (*tokens + elapsed * rate).min(capacity);
                }
                *last_refill = Some(now);
            }
        }
    }
}
