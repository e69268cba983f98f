//! Agent mode: snapshot collection through a one-shot Kubernetes Job
//!
//! This module provides:
//! - Access provisioning (ServiceAccount, Role/RoleBinding, ClusterRole/ClusterRoleBinding)
//! - Job deployment with node placement constraints
//! - Progress observation (pod readiness, log streaming, completion)
//! - Result retrieval from the ConfigMap the Job writes
//! - Cleanup that runs on every exit path

pub mod artifact;
mod backend;
mod cleanup;
mod config;
mod job;
mod observe;
pub mod placement;
mod rbac;
mod runner;


pub use artifact::ResultArtifact;
pub use backend::KubeAgent;
pub use cleanup::{owned_objects, remediation_command, OwnedKind, OwnedObject};
pub use config::{AgentConfig, CleanupPolicy, DEFAULT_ARTIFACT_NAME};
pub use job::build_job;
pub use observe::{job_outcome, JobOutcome};
pub use placement::{parse_node_selectors, parse_tolerations, tolerate_all, PlacementError};
pub use rbac::{apply_params, AccessObjects, FIELD_MANAGER};
pub use runner::{deliver, AgentRunner};

use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;

/// Number of log lines attached to a job failure
pub const LOG_TAIL_LINES: i64 = 100;

/// Errors from the agent lifecycle
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to provision {resource}: {source}")]
    Provision {
        resource: String,
        #[source]
        source: kube::Error,
    },

    #[error(
        "result ConfigMap namespace {artifact_namespace} differs from agent namespace {namespace}; \
         the agent can only write ConfigMaps in its own namespace"
    )]
    ArtifactNamespace {
        namespace: String,
        artifact_namespace: String,
    },

    #[error("failed to deploy job {job}: {source}")]
    Deploy {
        job: String,
        #[source]
        source: kube::Error,
    },

    #[error("previous job {job} still terminating after {timeout:?}")]
    StaleJob { job: String, timeout: Duration },

    #[error("pod for job {job} not running within {timeout:?}")]
    PodNotReady { job: String, timeout: Duration },

    #[error("failed to stream logs for job {job}: {message}")]
    LogStream { job: String, message: String },

    #[error("job {job} did not complete within {timeout:?}")]
    CompletionTimeout { job: String, timeout: Duration },

    #[error("job {job} failed: {reason}{}", log_suffix(.logs))]
    JobFailed {
        job: String,
        reason: String,
        logs: Option<String>,
    },

    #[error("failed to watch job {job}: {message}")]
    Watch { job: String, message: String },

    #[error("result ConfigMap {namespace}/{name} has no snapshot data")]
    MissingArtifact { namespace: String, name: String },

    #[error("failed to read {resource}: {source}")]
    Retrieve {
        resource: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to write snapshot to {destination}: {source}")]
    Output {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cleanup incomplete: {}", .failures.join("; "))]
    Cleanup { failures: Vec<String> },

    #[error("agent run cancelled")]
    Cancelled,
}

fn log_suffix(logs: &Option<String>) -> String {
    match logs {
        Some(logs) => format!("\n--- job logs ---\n{}", logs.trim_end()),
        None => String::new(),
    }
}

impl AgentError {
    /// The job never reached a terminal state in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::CompletionTimeout { .. })
    }

    /// The job reached a terminal state and reported failure
    pub fn is_job_failure(&self) -> bool {
        matches!(self, AgentError::JobFailed { .. })
    }
}

/// Cluster operations behind one agent run
///
/// [`KubeAgent`] talks to the API server; tests substitute recording fakes.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Apply the ServiceAccount and RBAC objects the Job runs with
    async fn provision(&self) -> Result<(), AgentError>;

    /// Apply the Job; does not wait for it
    async fn deploy(&self) -> Result<(), AgentError>;

    /// Wait until the Job's pod is observable in a running or terminal phase
    async fn wait_for_pod_ready(&self, timeout: Duration) -> Result<(), AgentError>;

    /// Follow the pod's output into `sink` until it ends
    async fn stream_logs(&self, sink: &mut (dyn Write + Send)) -> Result<(), AgentError>;

    /// Wait for the Job to reach a terminal state
    async fn wait_for_completion(&self, timeout: Duration) -> Result<(), AgentError>;

    /// Last `tail_lines` lines of the pod's output
    async fn fetch_logs(&self, tail_lines: i64) -> Result<String, AgentError>;

    /// Read the result the Job persisted
    async fn get_snapshot(&self) -> Result<ResultArtifact, AgentError>;

    /// Remove the Job, and the access objects unless retained
    async fn cleanup(&self, policy: CleanupPolicy) -> Result<(), AgentError>;
}
