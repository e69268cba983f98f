//! Kubernetes API backend for agent runs

use super::artifact::{read_config_map, ResultArtifact};
use super::{AgentBackend, AgentConfig, AgentError, CleanupPolicy};
use async_trait::async_trait;
use kube::Client;
use std::io::Write;
use std::time::Duration;

/// Agent backend talking to a live cluster
#[derive(Clone)]
pub struct KubeAgent {
    pub(crate) client: Client,
    pub(crate) config: AgentConfig,
}

impl KubeAgent {
    pub fn new(client: Client, config: AgentConfig) -> Self {
        Self { client, config }
    }

    /// Connect with the ambient kubeconfig or in-cluster credentials
    pub async fn try_default(config: AgentConfig) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

#[async_trait]
impl AgentBackend for KubeAgent {
    async fn provision(&self) -> Result<(), AgentError> {
        self.apply_access_objects().await
    }

    async fn deploy(&self) -> Result<(), AgentError> {
        self.remove_stale_job().await?;
        self.apply_job().await
    }

    async fn wait_for_pod_ready(&self, timeout: Duration) -> Result<(), AgentError> {
        self.wait_pod_ready(timeout).await
    }

    async fn stream_logs(&self, sink: &mut (dyn Write + Send)) -> Result<(), AgentError> {
        self.stream_pod_logs(sink).await
    }

    async fn wait_for_completion(&self, timeout: Duration) -> Result<(), AgentError> {
        self.wait_job_completion(timeout).await
    }

    async fn fetch_logs(&self, tail_lines: i64) -> Result<String, AgentError> {
        self.tail_logs(tail_lines).await
    }

    async fn get_snapshot(&self) -> Result<ResultArtifact, AgentError> {
        let (namespace, name) = self.config.artifact_location();
        read_config_map(self.client.clone(), &namespace, &name).await
    }

    async fn cleanup(&self, policy: CleanupPolicy) -> Result<(), AgentError> {
        self.delete_owned(policy).await
    }
}
