use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::errors::Stage;
use crate::middleware::circuit_breaker::{CircuitBreakerStats, CircuitState};

/// Latency samples kept per series
const MAX_SAMPLES: usize = 10_000;

/// Process-wide metrics collector.
///
/// Tracks request outcomes, stage latencies, detection fallbacks and model
/// lifecycle operations. Cheap to clone and safe to share across handlers.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    requests_total: AtomicUsize,
    requests_success: AtomicUsize,
    requests_failed: AtomicUsize,
    failures_by_tag: DashMap<String, AtomicUsize>,

    detection_fallbacks: AtomicUsize,
    recovered_recognition_items: AtomicUsize,
    unclassified_results: AtomicUsize,
    low_confidence_leaves: AtomicUsize,

    detection_ms: RwLock<Vec<u64>>,
    recognition_ms: RwLock<Vec<u64>>,
    classification_ms: RwLock<Vec<u64>>,
    persistence_ms: RwLock<Vec<u64>>,

    swaps_total: AtomicUsize,
    swaps_succeeded: AtomicUsize,
    swaps_failed: AtomicUsize,
    swap_attempts_failed: AtomicUsize,
    lifecycle_rejections: AtomicUsize,
    rollbacks_total: AtomicUsize,
    rollbacks_succeeded: AtomicUsize,
    rollbacks_failed: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_success: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                failures_by_tag: DashMap::new(),
                detection_fallbacks: AtomicUsize::new(0),
                recovered_recognition_items: AtomicUsize::new(0),
                unclassified_results: AtomicUsize::new(0),
                low_confidence_leaves: AtomicUsize::new(0),
                detection_ms: RwLock::new(Vec::new()),
                recognition_ms: RwLock::new(Vec::new()),
                classification_ms: RwLock::new(Vec::new()),
                persistence_ms: RwLock::new(Vec::new()),
                swaps_total: AtomicUsize::new(0),
                swaps_succeeded: AtomicUsize::new(0),
                swaps_failed: AtomicUsize::new(0),
                swap_attempts_failed: AtomicUsize::new(0),
                lifecycle_rejections: AtomicUsize::new(0),
                rollbacks_total: AtomicUsize::new(0),
                rollbacks_succeeded: AtomicUsize::new(0),
                rollbacks_failed: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Request outcomes
    pub fn record_request_success(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self, tag: &str) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .failures_by_tag
            .entry(tag.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Stage behaviour
    pub fn record_detection_fallback(&self) {
        self.inner.detection_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered_recognition_items(&self, count: usize) {
        self.inner
            .recovered_recognition_items
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_unclassified(&self) {
        self.inner.unclassified_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_low_confidence_leaf(&self) {
        self.inner.low_confidence_leaves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_duration(&self, stage: Stage, duration: Duration) {
        let series = match stage {
            Stage::Detection => &self.inner.detection_ms,
            Stage::Recognition => &self.inner.recognition_ms,
            Stage::Classification => &self.inner.classification_ms,
            Stage::Persistence => &self.inner.persistence_ms,
        };
        let mut samples = series.write();
        if samples.len() >= MAX_SAMPLES {
            samples.remove(0);
        }
        samples.push(duration.as_millis() as u64);
    }

    // Model lifecycle
    pub fn record_swap(&self, success: bool) {
        self.inner.swaps_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.swaps_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.swaps_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_swap_attempt_failure(&self) {
        self.inner.swap_attempts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lifecycle_rejection(&self) {
        self.inner.lifecycle_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self, success: bool) {
        self.inner.rollbacks_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.rollbacks_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.rollbacks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stage_stats = |series: &RwLock<Vec<u64>>| {
            let samples = series.read();
            LatencyStats {
                count: samples.len(),
                avg_ms: avg(&samples),
                p50_ms: percentile(&samples, 0.5),
                p95_ms: percentile(&samples, 0.95),
            }
        };

        let failures_by_tag = self
            .inner
            .failures_by_tag
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_success: self.inner.requests_success.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            failures_by_tag,
            detection_fallbacks: self.inner.detection_fallbacks.load(Ordering::Relaxed),
            recovered_recognition_items: self
                .inner
                .recovered_recognition_items
                .load(Ordering::Relaxed),
            unclassified_results: self.inner.unclassified_results.load(Ordering::Relaxed),
            low_confidence_leaves: self.inner.low_confidence_leaves.load(Ordering::Relaxed),
            detection: stage_stats(&self.inner.detection_ms),
            recognition: stage_stats(&self.inner.recognition_ms),
            classification: stage_stats(&self.inner.classification_ms),
            persistence: stage_stats(&self.inner.persistence_ms),
            swaps_total: self.inner.swaps_total.load(Ordering::Relaxed),
            swaps_succeeded: self.inner.swaps_succeeded.load(Ordering::Relaxed),
            swaps_failed: self.inner.swaps_failed.load(Ordering::Relaxed),
            swap_attempts_failed: self.inner.swap_attempts_failed.load(Ordering::Relaxed),
            lifecycle_rejections: self.inner.lifecycle_rejections.load(Ordering::Relaxed),
            rollbacks_total: self.inner.rollbacks_total.load(Ordering::Relaxed),
            rollbacks_succeeded: self.inner.rollbacks_succeeded.load(Ordering::Relaxed),
            rollbacks_failed: self.inner.rollbacks_failed.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP pipeline_requests_total Total labelling requests
# TYPE pipeline_requests_total counter
pipeline_requests_total {{}} {}

# HELP pipeline_requests_success Requests that produced a classification result
# TYPE pipeline_requests_success counter
pipeline_requests_success {{}} {}

# HELP pipeline_requests_failed Requests that ended in a tagged failure
# TYPE pipeline_requests_failed counter
pipeline_requests_failed {{}} {}

# HELP detection_fallbacks_total Requests that fell back to two-step detection
# TYPE detection_fallbacks_total counter
detection_fallbacks_total {{}} {}

# HELP recognition_recovered_items_total Regions whose recognition failure was recovered as empty text
# TYPE recognition_recovered_items_total counter
recognition_recovered_items_total {{}} {}

# HELP classification_unclassified_total Results without a major category
# TYPE classification_unclassified_total counter
classification_unclassified_total {{}} {}

# HELP classification_low_confidence_total Results with a major category but no leaf
# TYPE classification_low_confidence_total counter
classification_low_confidence_total {{}} {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms {{stage="detection"}} {}
stage_avg_duration_ms {{stage="recognition"}} {}
stage_avg_duration_ms {{stage="classification"}} {}
stage_avg_duration_ms {{stage="persistence"}} {}

# HELP model_swaps_total Model swap operations by outcome
# TYPE model_swaps_total counter
model_swaps_total {{outcome="success"}} {}
model_swaps_total {{outcome="failure"}} {}

# HELP model_swap_attempts_failed_total Individual failed swap attempts
# TYPE model_swap_attempts_failed_total counter
model_swap_attempts_failed_total {{}} {}

# HELP model_lifecycle_rejections_total Swap/rollback calls rejected while another was in flight
# TYPE model_lifecycle_rejections_total counter
model_lifecycle_rejections_total {{}} {}

# HELP model_rollbacks_total Model rollbacks by outcome
# TYPE model_rollbacks_total counter
model_rollbacks_total {{outcome="success"}} {}
model_rollbacks_total {{outcome="failure"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            s.requests_total,
            s.requests_success,
            s.requests_failed,
            s.detection_fallbacks,
            s.recovered_recognition_items,
            s.unclassified_results,
            s.low_confidence_leaves,
            s.detection.avg_ms,
            s.recognition.avg_ms,
            s.classification.avg_ms,
            s.persistence.avg_ms,
            s.swaps_succeeded,
            s.swaps_failed,
            s.swap_attempts_failed,
            s.lifecycle_rejections,
            s.rollbacks_succeeded,
            s.rollbacks_failed,
            s.uptime_seconds,
        );

        if !s.failures_by_tag.is_empty() {
            out.push_str("\n# HELP pipeline_failures_total Failed requests by error tag\n");
            out.push_str("# TYPE pipeline_failures_total counter\n");
            for (tag, count) in &s.failures_by_tag {
                out.push_str(&format!("pipeline_failures_total {{tag=\"{}\"}} {}\n", tag, count));
            }
        }
        out
    }
}

/// Prometheus lines for per-collaborator circuit breakers
pub fn circuit_breakers_prometheus(breakers: &[CircuitBreakerStats]) -> String {
    if breakers.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "\n# HELP circuit_breaker_open Whether the collaborator's breaker is open (1) or half-open (0.5)\n\
         # TYPE circuit_breaker_open gauge\n",
    );
    for b in breakers {
        let open = match b.state {
            CircuitState::Closed => "0",
            CircuitState::HalfOpen => "0.5",
            CircuitState::Open => "1",
        };
        out.push_str(&format!("circuit_breaker_open {{service=\"{}\"}} {}\n", b.service, open));
    }
    out.push_str("\n# HELP circuit_breaker_trips_total Times the breaker opened\n");
    out.push_str("# TYPE circuit_breaker_trips_total counter\n");
    for b in breakers {
        out.push_str(&format!(
            "circuit_breaker_trips_total {{service=\"{}\"}} {}\n",
            b.service, b.trips
        ));
    }
    out
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_success: usize,
    pub requests_failed: usize,
    pub failures_by_tag: BTreeMap<String, usize>,
    pub detection_fallbacks: usize,
    pub recovered_recognition_items: usize,
    pub unclassified_results: usize,
    pub low_confidence_leaves: usize,
    pub detection: LatencyStats,
    pub recognition: LatencyStats,
    pub classification: LatencyStats,
    pub persistence: LatencyStats,
    pub swaps_total: usize,
    pub swaps_succeeded: usize,
    pub swaps_failed: usize,
    pub swap_attempts_failed: usize,
    pub lifecycle_rejections: usize,
    pub rollbacks_total: usize,
    pub rollbacks_succeeded: usize,
    pub rollbacks_failed: usize,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
