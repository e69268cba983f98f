//! Node configuration snapshots
//!
//! This crate provides the core functionality for:
//! - Concurrent local collection of K8s, GPU, OS and SystemD measurements
//! - Agent mode: collection through a one-shot Kubernetes Job
//! - Snapshot serialization and output destinations
//! - Metrics and structured logging

pub mod agent;
pub mod collector;
pub mod deadline;
pub mod models;
pub mod observability;
pub mod output;

pub use agent::{AgentBackend, AgentConfig, AgentError, AgentRunner, CleanupPolicy, KubeAgent};
pub use collector::{CollectError, CollectorRegistry, CollectorSettings, LocalCollector};
pub use deadline::{CancelScope, Deadline};
pub use models::*;
pub use observability::{SnapshotMetrics, StructuredLogger};
pub use output::{OutputDestination, OutputFormat};
