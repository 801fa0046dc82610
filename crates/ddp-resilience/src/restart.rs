//! ---
//! ddp_section: "07-resilience-fault-tolerance"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Restart policies for supervised digital devices."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::time::{Duration, Instant};

use ddp_common::config::RestartPolicyConfig;
use tracing::{error, warn};

use crate::metrics::ResilienceMetrics;

/// Restart intensity limit: more than `max_restarts` failures inside any
/// rolling `window` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Failures tolerated per window before giving up.
    pub max_restarts: u32,
    /// Length of the rolling window.
    pub window: Duration,
}

impl RestartPolicy {
    /// Construct a policy. A zero window is clamped to one millisecond.
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window: window.max(Duration::from_millis(1)),
        }
    }

    /// Build the policy from the `[restart_policy]` configuration section.
    pub fn from_config(config: &RestartPolicyConfig) -> Self {
        Self::new(config.max_restarts, config.window)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&RestartPolicyConfig::default())
    }
}

/// What the supervisor should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Within budget; `attempt` counts failures in the current window.
    Restart {
        /// 1-based failure count inside the window.
        attempt: u32,
    },
    /// Budget exhausted; the key should be marked permanently failed.
    GiveUp {
        /// Failures observed inside the window, including this one.
        failures: u32,
    },
}

impl RestartDecision {
    /// Whether the decision allows another instance.
    pub fn is_restart(&self) -> bool {
        matches!(self, RestartDecision::Restart { .. })
    }
}

/// Failure timestamps for a single supervised child.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    failures: VecDeque<Instant>,
}

impl RestartTracker {
    /// Create an empty tracker.
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: VecDeque::new(),
        }
    }

    /// Register a failure at `now` and decide whether a restart is allowed.
    pub fn record_failure(&mut self, now: Instant) -> RestartDecision {
        self.prune(now);
        self.failures.push_back(now);
        let count = u32::try_from(self.failures.len()).unwrap_or(u32::MAX);
        if count > self.policy.max_restarts {
            RestartDecision::GiveUp { failures: count }
        } else {
            RestartDecision::Restart { attempt: count }
        }
    }

    /// Failures still inside the window at `now`.
    pub fn failures_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.failures.len()
    }

    /// Forget every recorded failure.
    pub fn reset(&mut self) {
        self.failures.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-key restart trackers sharing one policy, with logging and metrics.
#[derive(Debug)]
pub struct RestartLedger<K> {
    policy: RestartPolicy,
    trackers: HashMap<K, RestartTracker>,
    metrics: Option<ResilienceMetrics>,
}

impl<K> RestartLedger<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create a ledger with an optional metrics handle.
    pub fn new(policy: RestartPolicy, metrics: Option<ResilienceMetrics>) -> Self {
        Self {
            policy,
            trackers: HashMap::new(),
            metrics,
        }
    }

    /// Policy shared by every tracker.
    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Record a failure of `key` at `now`.
    pub fn record_failure(&mut self, key: &K, now: Instant) -> RestartDecision {
        let policy = self.policy;
        let decision = self
            .trackers
            .entry(key.clone())
            .or_insert_with(|| RestartTracker::new(policy))
            .record_failure(now);

        match decision {
            RestartDecision::Restart { attempt } => {
                warn!(
                    target: "ddp::resilience::restart",
                    child = %key,
                    attempt,
                    max_restarts = policy.max_restarts,
                    "supervised child failed; restart permitted",
                );
            }
            RestartDecision::GiveUp { failures } => {
                error!(
                    target: "ddp::resilience::restart",
                    child = %key,
                    failures,
                    window_ms = policy.window.as_millis() as u64,
                    "restart intensity exceeded; giving up",
                );
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(&decision);
        }
        decision
    }

    /// Failures of `key` still inside the window.
    pub fn failures_in_window(&mut self, key: &K, now: Instant) -> usize {
        self.trackers
            .get_mut(key)
            .map(|tracker| tracker.failures_in_window(now))
            .unwrap_or(0)
    }

    /// Whether one more failure of `key` at `now` would exhaust the budget.
    pub fn would_give_up(&mut self, key: &K, now: Instant) -> bool {
        self.failures_in_window(key, now) >= self.policy.max_restarts as usize
    }

    /// Drop the history of `key`, typically after an operator reset.
    pub fn reset(&mut self, key: &K) {
        self.trackers.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn gives_up_after_budget_is_spent() {
        let mut tracker = RestartTracker::new(RestartPolicy::new(2, WINDOW));
        let start = Instant::now();
        assert_eq!(
            tracker.record_failure(start),
            RestartDecision::Restart { attempt: 1 }
        );
        assert_eq!(
            tracker.record_failure(start + Duration::from_secs(1)),
            RestartDecision::Restart { attempt: 2 }
        );
        assert_eq!(
            tracker.record_failure(start + Duration::from_secs(2)),
            RestartDecision::GiveUp { failures: 3 }
        );
    }

    #[test]
    fn old_failures_age_out_of_the_window() {
        let mut tracker = RestartTracker::new(RestartPolicy::new(1, WINDOW));
        let start = Instant::now();
        assert!(tracker.record_failure(start).is_restart());
        assert!(tracker.record_failure(start + WINDOW).is_restart());
        assert_eq!(tracker.failures_in_window(start + WINDOW), 1);
    }

    #[test]
    fn zero_budget_gives_up_immediately() {
        let mut tracker = RestartTracker::new(RestartPolicy::new(0, WINDOW));
        assert_eq!(
            tracker.record_failure(Instant::now()),
            RestartDecision::GiveUp { failures: 1 }
        );
    }

    #[test]
    fn ledger_tracks_keys_independently() {
        let mut ledger: RestartLedger<u8> = RestartLedger::new(RestartPolicy::new(1, WINDOW), None);
        let now = Instant::now();
        assert!(ledger.record_failure(&1, now).is_restart());
        assert!(ledger.record_failure(&2, now).is_restart());
        assert!(!ledger.record_failure(&1, now).is_restart());
        assert_eq!(ledger.failures_in_window(&2, now), 1);

        ledger.reset(&1);
        assert_eq!(ledger.failures_in_window(&1, now), 0);
        assert!(ledger.record_failure(&1, now).is_restart());
    }

    #[test]
    fn would_give_up_looks_one_failure_ahead() {
        let mut ledger: RestartLedger<u8> = RestartLedger::new(RestartPolicy::new(1, WINDOW), None);
        let now = Instant::now();
        assert!(!ledger.would_give_up(&7, now));
        assert!(ledger.record_failure(&7, now).is_restart());
        assert!(ledger.would_give_up(&7, now));
        assert!(!ledger.would_give_up(&7, now + WINDOW));
    }
}
