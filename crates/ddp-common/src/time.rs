//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Shared primitives and utilities for the core runtime."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// Capture an instant suitable for rate-limit and restart-window comparisons.
///
/// Reads tokio's clock, so tests running with a paused runtime advance it
/// deterministically. Outside a runtime this is plain `Instant::now()`.
pub fn monotonic_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn monotonic_now_follows_paused_clock() {
        let before = monotonic_now();
        tokio::time::advance(Duration::from_secs(5)).await;
        let after = monotonic_now();
        assert_eq!(after.duration_since(before), Duration::from_secs(5));
    }

    #[test]
    fn millis_saturate() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }
}
