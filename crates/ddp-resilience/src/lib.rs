//! ---
//! ddp_section: "07-resilience-fault-tolerance"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Restart policies for supervised digital devices."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Restart intensity tracking. Pure bookkeeping over caller-supplied
//! instants; the supervisor decides what a restart means.

pub mod metrics;
pub mod restart;

pub use metrics::ResilienceMetrics;
pub use restart::{RestartDecision, RestartLedger, RestartPolicy, RestartTracker};
