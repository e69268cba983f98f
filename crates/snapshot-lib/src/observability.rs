//! Observability infrastructure for snapshot collection
//!
//! Provides:
//! - Prometheus metrics (collection duration, per-collector duration, attempts, measurement count)
//! - Structured JSON logging with tracing

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::{info, warn};

/// Default histogram buckets for collection durations (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Outcome label values for collection attempts
pub mod outcomes {
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
}

/// Snapshot metrics for Prometheus exposition
///
/// Owns its registry; clones share the same underlying collectors, so a
/// handle can be passed to every component that records.
#[derive(Clone)]
pub struct SnapshotMetrics {
    registry: Registry,
    collection_duration_seconds: Histogram,
    collector_duration_seconds: HistogramVec,
    collection_attempts: IntCounterVec,
    snapshot_measurements: IntGauge,
}

impl SnapshotMetrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let collection_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "nodesnap_collection_duration_seconds",
                "Time spent collecting a complete snapshot",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(collection_duration_seconds.clone()))?;

        let collector_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "nodesnap_collector_duration_seconds",
                "Time spent in a single collector",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["collector"],
        )?;
        registry.register(Box::new(collector_duration_seconds.clone()))?;

        let collection_attempts = IntCounterVec::new(
            Opts::new(
                "nodesnap_collection_attempts_total",
                "Snapshot collection attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(collection_attempts.clone()))?;

        let snapshot_measurements = IntGauge::new(
            "nodesnap_snapshot_measurements",
            "Number of measurements in the last collected snapshot",
        )?;
        registry.register(Box::new(snapshot_measurements.clone()))?;

        Ok(Self {
            registry,
            collection_duration_seconds,
            collector_duration_seconds,
            collection_attempts,
            snapshot_measurements,
        })
    }

    /// Record the duration of a whole collection
    pub fn observe_collection(&self, elapsed: Duration) {
        self.collection_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Record the duration of one collector
    pub fn observe_collector(&self, collector: &str, elapsed: Duration) {
        self.collector_duration_seconds
            .with_label_values(&[collector])
            .observe(elapsed.as_secs_f64());
    }

    /// Count a collection attempt
    pub fn inc_attempt(&self, outcome: &str) {
        self.collection_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn set_measurement_count(&self, count: usize) {
        self.snapshot_measurements.set(count as i64);
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Structured logger for snapshot events
///
/// Provides consistent event-tagged logging for collections and the
/// agent lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a completed snapshot collection
    pub fn log_snapshot_collected(&self, measurements: usize, elapsed: Duration) {
        info!(
            event = "snapshot_collected",
            node = %self.node_name,
            measurements = measurements,
            elapsed_ms = elapsed.as_millis() as u64,
            "Snapshot collected"
        );
    }

    /// Log a failed snapshot collection
    pub fn log_collection_failed(&self, error: &dyn std::error::Error, elapsed: Duration) {
        warn!(
            event = "collection_failed",
            node = %self.node_name,
            error = %error,
            elapsed_ms = elapsed.as_millis() as u64,
            "Snapshot collection failed"
        );
    }

    /// Log an agent lifecycle phase transition
    pub fn log_agent_phase(&self, namespace: &str, job: &str, phase: &str) {
        info!(
            event = "agent_phase",
            node = %self.node_name,
            namespace = %namespace,
            job = %job,
            phase = %phase,
            "Agent phase started"
        );
    }

    /// Log the outcome of agent cleanup
    pub fn log_cleanup(&self, namespace: &str, job: &str, retained_access: bool, success: bool) {
        if success {
            info!(
                event = "agent_cleanup",
                node = %self.node_name,
                namespace = %namespace,
                job = %job,
                retained_access = retained_access,
                "Agent resources cleaned up"
            );
        } else {
            warn!(
                event = "agent_cleanup",
                node = %self.node_name,
                namespace = %namespace,
                job = %job,
                retained_access = retained_access,
                "Agent cleanup incomplete"
            );
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, output: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            output = %output,
            "Snapshot agent started"
        );
    }
}
