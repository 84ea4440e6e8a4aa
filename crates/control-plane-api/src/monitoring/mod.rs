//! Monitoring: the Prometheus registry and metric definitions.

pub mod metrics;
