//! Local collection coordinator
//!
//! Runs every registered collector concurrently against one shared deadline
//! and joins their measurements into a single snapshot. Any failure cancels
//! the siblings; the snapshot is only returned when every collector succeeded.

use super::{Collector, CollectorRegistry};
use crate::deadline::{CancelScope, Deadline, DeadlineState};
use crate::models::{metadata_keys, MeasurementType, Snapshot};
use crate::observability::{outcomes, SnapshotMetrics, StructuredLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Label used for the metadata task
const METADATA_TASK: &str = "metadata";

/// Errors returned by a local collection
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("{category} collector failed: {source:#}")]
    Collector {
        category: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{category} collection cancelled")]
    Cancelled { category: String },

    #[error("{category} collection exceeded its deadline")]
    DeadlineExceeded { category: String },

    #[error("collector task panicked: {0}")]
    Panicked(String),
}

impl CollectError {
    fn from_state(category: impl Into<String>, state: DeadlineState) -> Self {
        let category = category.into();
        match state {
            DeadlineState::Cancelled => CollectError::Cancelled { category },
            DeadlineState::Expired => CollectError::DeadlineExceeded { category },
        }
    }
}

/// Configuration for a local collection
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound for the whole collection (default: 60 seconds)
    pub timeout: Duration,
    /// Node identity written into the snapshot header
    pub node_name: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            node_name: default_node_name(),
        }
    }
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Collects a complete snapshot in the calling process
pub struct LocalCollector {
    registry: CollectorRegistry,
    metrics: SnapshotMetrics,
    logger: StructuredLogger,
    config: CoordinatorConfig,
}

impl LocalCollector {
    pub fn new(
        registry: CollectorRegistry,
        metrics: SnapshotMetrics,
        config: CoordinatorConfig,
    ) -> Self {
        let logger = StructuredLogger::new(&config.node_name);
        Self {
            registry,
            metrics,
            logger,
            config,
        }
    }

    pub fn metrics(&self) -> &SnapshotMetrics {
        &self.metrics
    }

    /// Collect a snapshot, bounded by the configured timeout and `parent` if given
    pub async fn measure(&self, parent: Option<&Deadline>) -> Result<Snapshot, CollectError> {
        let start = Instant::now();
        let result = self.collect_all(parent).await;
        let elapsed = start.elapsed();

        self.metrics.observe_collection(elapsed);
        match &result {
            Ok(snapshot) => {
                self.metrics.inc_attempt(outcomes::SUCCESS);
                self.metrics.set_measurement_count(snapshot.measurements.len());
                self.logger
                    .log_snapshot_collected(snapshot.measurements.len(), elapsed);
            }
            Err(e) => {
                self.metrics.inc_attempt(outcomes::FAILURE);
                self.logger.log_collection_failed(e, elapsed);
            }
        }

        result
    }

    async fn collect_all(&self, parent: Option<&Deadline>) -> Result<Snapshot, CollectError> {
        let scope = CancelScope::new();
        let timeout = match parent {
            Some(parent) => self.config.timeout.min(parent.remaining()),
            None => self.config.timeout,
        };
        let deadline = scope.deadline(timeout);
        let shared = Arc::new(Mutex::new(Snapshot::new()));
        let mut tasks = JoinSet::new();

        tasks.spawn(collect_metadata(
            self.config.node_name.clone(),
            Arc::clone(&shared),
            deadline.clone(),
        ));

        for (category, collector) in self.registry.instantiate() {
            tasks.spawn(collect_one(
                category,
                collector,
                Arc::clone(&shared),
                deadline.clone(),
                self.metrics.clone(),
            ));
        }

        let mut first_error: Option<CollectError> = None;
        loop {
            let joined = match parent {
                Some(parent) if !scope.is_cancelled() => {
                    tokio::select! {
                        joined = tasks.join_next() => joined,
                        state = parent.done() => {
                            debug!(state = %state, "Parent deadline ended, cancelling collectors");
                            scope.cancel();
                            first_error.get_or_insert(CollectError::from_state("snapshot", state));
                            continue;
                        }
                    }
                }
                _ => tasks.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };

            let outcome = joined.unwrap_or_else(|e| Err(CollectError::Panicked(e.to_string())));
            if let Err(e) = outcome {
                if first_error.is_none() {
                    warn!(error = %e, "Collector failed, cancelling remaining collectors");
                    scope.cancel();
                    first_error = Some(e);
                } else {
                    debug!(error = %e, "Collector stopped after cancellation");
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let snapshot = match Arc::try_unwrap(shared) {
            Ok(snapshot) => snapshot.into_inner(),
            Err(shared) => shared.lock().await.clone(),
        };
        Ok(snapshot)
    }
}

/// Run one collector and append its measurement to the shared snapshot
async fn collect_one(
    category: MeasurementType,
    collector: Arc<dyn Collector>,
    shared: Arc<Mutex<Snapshot>>,
    deadline: Deadline,
    metrics: SnapshotMetrics,
) -> Result<(), CollectError> {
    let start = Instant::now();
    let outcome = deadline.bound(collector.collect(&deadline)).await;
    metrics.observe_collector(category.as_str(), start.elapsed());

    let measurement = match outcome {
        Ok(Ok(measurement)) => measurement,
        Ok(Err(source)) => {
            return Err(CollectError::Collector {
                category: category.to_string(),
                source,
            })
        }
        Err(state) => return Err(CollectError::from_state(category.as_str(), state)),
    };

    if measurement.measurement_type != category {
        return Err(CollectError::Collector {
            category: category.to_string(),
            source: anyhow::anyhow!(
                "collector returned a {} measurement",
                measurement.measurement_type
            ),
        });
    }

    debug!(
        collector = %category,
        subtypes = measurement.subtypes.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Collector finished"
    );

    shared.lock().await.measurements.push(measurement);
    Ok(())
}

/// Fill the snapshot header
async fn collect_metadata(
    node_name: String,
    shared: Arc<Mutex<Snapshot>>,
    deadline: Deadline,
) -> Result<(), CollectError> {
    if let Some(state) = deadline.state() {
        return Err(CollectError::from_state(METADATA_TASK, state));
    }

    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let mut snapshot = shared.lock().await;
    snapshot
        .metadata
        .insert(metadata_keys::SOURCE_NODE.to_string(), node_name);
    snapshot
        .metadata
        .insert(metadata_keys::TIMESTAMP.to_string(), timestamp);
    snapshot.metadata.insert(
        metadata_keys::VERSION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    Ok(())
}
