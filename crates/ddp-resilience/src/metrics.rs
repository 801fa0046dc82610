//! ---
//! ddp_section: "07-resilience-fault-tolerance"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Restart policies for supervised digital devices."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use anyhow::Result;
use ddp_metrics::SharedRegistry;
use prometheus::{IntCounterVec, Opts};

use crate::restart::RestartDecision;

/// Metrics published by the restart bookkeeping.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    device_restarts_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let device_restarts_total = IntCounterVec::new(
            Opts::new(
                "ddp_device_restarts_total",
                "Digital device failures handled by the supervisor, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(device_restarts_total.clone()))?;

        Ok(Self {
            registry,
            device_restarts_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one restart decision.
    pub fn record_decision(&self, decision: &RestartDecision) {
        let outcome = match decision {
            RestartDecision::Restart { .. } => "restart",
            RestartDecision::GiveUp { .. } => "give_up",
        };
        self.device_restarts_total
            .with_label_values(&[outcome])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
