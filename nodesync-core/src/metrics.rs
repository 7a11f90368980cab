//! Prometheus counters for node synchronization
//!
//! Registered lazily on first use in a crate-local registry.

use prometheus::{
    register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Poll loop iterations by outcome: `unchanged`, `changed`, `failed`
pub static POLL_ITERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "nodesync_poll_iterations_total",
        "Poll loop iterations by outcome",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register POLL_ITERATIONS")
});

/// Registry queries that failed and were replaced by an empty node list
pub static REGISTRY_FETCH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "nodesync_registry_fetch_failures_total",
        "Registry instance queries that failed",
        &["service"],
        REGISTRY.clone()
    )
    .expect("Failed to register REGISTRY_FETCH_FAILURES")
});

/// Fan-out deliveries that failed, by recipient kind: `worker`, `process`
pub static FANOUT_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "nodesync_fanout_failures_total",
        "Snapshot deliveries to sibling recipients that failed",
        &["recipient_kind"],
        REGISTRY.clone()
    )
    .expect("Failed to register FANOUT_FAILURES")
});

/// Push listener packets by ack type
pub static PUSH_PACKETS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "nodesync_push_packets_total",
        "Registry push packets received, by ack type",
        &["type"],
        REGISTRY.clone()
    )
    .expect("Failed to register PUSH_PACKETS")
});

/// Expose metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        POLL_ITERATIONS.with_label_values(&["unchanged"]).inc();
        REGISTRY_FETCH_FAILURES.with_label_values(&["order-svc"]).inc();
        FANOUT_FAILURES.with_label_values(&["worker"]).inc();
        PUSH_PACKETS.with_label_values(&["push-ack"]).inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("nodesync_poll_iterations_total"));
        assert!(output.contains("nodesync_registry_fetch_failures_total"));
        assert!(output.contains("nodesync_fanout_failures_total"));
        assert!(output.contains("nodesync_push_packets_total"));
    }
}
