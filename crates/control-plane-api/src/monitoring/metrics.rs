//! Prometheus metrics for the control plane.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry holding every control-plane metric.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Commands routed, labelled by outcome.
    pub static ref COMMANDS_ROUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("commands_routed_total", "Commands routed to worker instances")
            .namespace("control_plane"),
        &["outcome"]
    ).expect("metric definition");

    /// Queries routed, labelled by outcome.
    pub static ref QUERIES_ROUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("queries_routed_total", "Queries routed to worker instances")
            .namespace("control_plane"),
        &["outcome"]
    ).expect("metric definition");

    /// Domain events appended to the log.
    pub static ref EVENTS_APPENDED: IntCounter = IntCounter::with_opts(
        Opts::new("events_appended_total", "Domain events appended to the event log")
            .namespace("control_plane"),
    ).expect("metric definition");

    /// Sequence conflicts surfaced by the event store.
    pub static ref SEQUENCE_CONFLICTS: IntCounter = IntCounter::with_opts(
        Opts::new("sequence_conflicts_total", "Optimistic concurrency conflicts")
            .namespace("control_plane"),
    ).expect("metric definition");

    /// Heartbeats ingested.
    pub static ref HEARTBEATS: IntCounter = IntCounter::with_opts(
        Opts::new("heartbeats_total", "Worker heartbeats ingested")
            .namespace("control_plane"),
    ).expect("metric definition");

    /// Health changes broadcast to subscribers.
    pub static ref HEALTH_CHANGES_BROADCAST: IntCounter = IntCounter::with_opts(
        Opts::new("health_changes_broadcast_total", "Health changes fanned out")
            .namespace("control_plane"),
    ).expect("metric definition");

    /// Currently attached health-stream subscribers.
    pub static ref ACTIVE_SUBSCRIBERS: IntGauge = IntGauge::with_opts(
        Opts::new("active_subscribers", "Attached health stream subscribers")
            .namespace("control_plane"),
    ).expect("metric definition");

    /// Entries removed by cleanup sweeps.
    pub static ref CLEANUP_REMOVALS: IntCounter = IntCounter::with_opts(
        Opts::new("cleanup_removals_total", "Instances and route entries pruned")
            .namespace("control_plane"),
    ).expect("metric definition");
}

/// Register every metric; safe to call more than once.
pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(COMMANDS_ROUTED.clone()),
        Box::new(QUERIES_ROUTED.clone()),
        Box::new(EVENTS_APPENDED.clone()),
        Box::new(SEQUENCE_CONFLICTS.clone()),
        Box::new(HEARTBEATS.clone()),
        Box::new(HEALTH_CHANGES_BROADCAST.clone()),
        Box::new(ACTIVE_SUBSCRIBERS.clone()),
        Box::new(CLEANUP_REMOVALS.clone()),
    ];

    for collector in collectors {
        // Already-registered collectors are fine on repeated init.
        let _ = REGISTRY.register(collector);
    }
}

/// Render the registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %error, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();

        EVENTS_APPENDED.inc();
        let rendered = render();
        assert!(rendered.contains("control_plane_events_appended_total"));
    }
}
