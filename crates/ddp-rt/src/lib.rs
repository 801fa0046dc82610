//! ---
//! ddp_section: "04-rate-control"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Runtime helpers supporting per-device ingestion."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
//! Admission control for inbound device traffic.

pub mod throttle;

pub use throttle::RateLimiter;
