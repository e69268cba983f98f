//! nodesnap agent - node snapshot collector
//!
//! This binary runs as the one-shot Job deployed by `nodesnap snapshot
//! --deploy-agent`: it collects a snapshot of the node it is scheduled on and
//! writes the result to the configured destination, usually a ConfigMap.

use anyhow::{Context, Result};
use snapshot_lib::agent::artifact::{write_config_map, ResultArtifact};
use snapshot_lib::collector::{CollectorRegistry, CoordinatorConfig, LocalCollector};
use snapshot_lib::output::{to_bytes, write_local};
use snapshot_lib::{CancelScope, OutputDestination, SnapshotMetrics, StructuredLogger};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let settings = config::AgentSettings::load()?;
    let destination = settings.destination()?;
    let collector_settings = settings.collector_settings();

    let mut coordinator_config = CoordinatorConfig {
        timeout: settings.timeout(),
        ..Default::default()
    };
    if let Some(node_name) = &collector_settings.node_name {
        coordinator_config.node_name = node_name.clone();
    }

    let logger = StructuredLogger::new(&coordinator_config.node_name);
    logger.log_startup(AGENT_VERSION, &destination.to_string());

    let metrics = SnapshotMetrics::new().context("failed to register metrics")?;
    let registry = CollectorRegistry::with_defaults(&collector_settings);
    let coordinator = LocalCollector::new(registry, metrics, coordinator_config);

    // Ctrl-C cancels the collectors and lets them drain
    let scope = CancelScope::new();
    let deadline = scope.deadline(settings.timeout());
    let measure = coordinator.measure(Some(&deadline));
    tokio::pin!(measure);
    let result = tokio::select! {
        result = &mut measure => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling collection");
            scope.cancel();
            measure.await
        }
    };

    if let Some(path) = &settings.metrics_path {
        match coordinator.metrics().encode_text() {
            Ok(text) => {
                if let Err(e) = std::fs::write(path, text) {
                    warn!(path = %path.display(), error = %e, "Failed to write metrics");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode metrics"),
        }
    }

    let snapshot = result.context("snapshot collection failed")?;
    let bytes = to_bytes(&snapshot, settings.format).context("failed to serialize snapshot")?;

    match &destination {
        OutputDestination::ConfigMap { namespace, name } => {
            let content = String::from_utf8(bytes).context("snapshot is not valid UTF-8")?;
            let artifact = ResultArtifact::new(content, settings.format);
            let client = kube::Client::try_default()
                .await
                .context("failed to create Kubernetes client")?;
            write_config_map(client, namespace, name, &artifact)
                .await
                .with_context(|| format!("failed to write {}", destination))?;
        }
        _ => write_local(&destination, &bytes)
            .with_context(|| format!("failed to write {}", destination))?,
    }

    info!(destination = %destination, "Snapshot delivered");
    Ok(())
}
