pub mod metrics;

pub use metrics::{circuit_breakers_prometheus, LatencyStats, Metrics, MetricsSnapshot};
