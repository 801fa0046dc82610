//! ---
//! ddp_section: "07-resilience-fault-tolerance"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Restart policies for supervised digital devices."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use ddp_common::config::RestartPolicyConfig;
use ddp_metrics::new_registry;
use ddp_resilience::{RestartDecision, RestartLedger, RestartPolicy, ResilienceMetrics};

fn counter_value(registry: &ddp_metrics::SharedRegistry, outcome: &str) -> u64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == "ddp_device_restarts_total")
        .flat_map(|family| family.get_metric().iter())
        .filter(|metric| {
            metric
                .get_label()
                .iter()
                .any(|label| label.get_name() == "outcome" && label.get_value() == outcome)
        })
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

#[test]
fn ledger_reports_restarts_and_give_ups() {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
    let config = RestartPolicyConfig {
        max_restarts: 2,
        window: Duration::from_secs(60),
    };
    let mut ledger = RestartLedger::new(RestartPolicy::from_config(&config), Some(metrics));

    let start = Instant::now();
    let decisions: Vec<_> = (0..3u64)
        .map(|offset| ledger.record_failure(&"device-7", start + Duration::from_secs(offset)))
        .collect();

    assert_eq!(
        decisions,
        vec![
            RestartDecision::Restart { attempt: 1 },
            RestartDecision::Restart { attempt: 2 },
            RestartDecision::GiveUp { failures: 3 },
        ]
    );
    assert_eq!(counter_value(&registry, "restart"), 2);
    assert_eq!(counter_value(&registry, "give_up"), 1);
}

#[test]
fn default_policy_follows_configuration_defaults() {
    let policy = RestartPolicy::default();
    let config = RestartPolicyConfig::default();
    assert_eq!(policy.max_restarts, config.max_restarts);
    assert_eq!(policy.window, config.window);
}
