//! Drives one agent run through its phases
//!
//! provision → deploy → observe → retrieve, with cleanup owed from before
//! provisioning starts and paid exactly once on every exit path.

use super::artifact::ResultArtifact;
use super::cleanup::remediation_command;
use super::{AgentBackend, AgentConfig, AgentError, CleanupPolicy, LOG_TAIL_LINES};
use crate::observability::StructuredLogger;
use crate::output::{write_local, OutputDestination};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on the cleanup phase
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on fetching the log tail of a failed Job
const LOG_TAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Cleanup owed to the cluster for one run
pub(crate) struct CleanupObligation<'a, B: AgentBackend + ?Sized> {
    backend: &'a B,
    policy: CleanupPolicy,
    discharged: bool,
}

impl<'a, B: AgentBackend + ?Sized> CleanupObligation<'a, B> {
    pub(crate) fn new(backend: &'a B, policy: CleanupPolicy) -> Self {
        Self {
            backend,
            policy,
            discharged: false,
        }
    }

    /// Run the cleanup; consuming `self` makes a second discharge impossible
    pub(crate) async fn discharge(mut self, timeout: Duration) -> Result<(), AgentError> {
        self.discharged = true;
        match tokio::time::timeout(timeout, self.backend.cleanup(self.policy)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Cleanup {
                failures: vec![format!("cleanup timed out after {:?}", timeout)],
            }),
        }
    }
}

impl<B: AgentBackend + ?Sized> Drop for CleanupObligation<'_, B> {
    fn drop(&mut self) {
        if !self.discharged {
            warn!(policy = ?self.policy, "Agent run ended without cleanup");
        }
    }
}

/// Runs the agent lifecycle against a backend
pub struct AgentRunner<B> {
    backend: B,
    config: AgentConfig,
    logger: StructuredLogger,
    cleanup_timeout: Duration,
}

impl<B: AgentBackend> AgentRunner<B> {
    pub fn new(backend: B, config: AgentConfig) -> Self {
        let target = if config.node_selector.is_empty() {
            "*".to_string()
        } else {
            config
                .node_selector
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        };
        Self {
            backend,
            config,
            logger: StructuredLogger::new(target),
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run every phase and return the retrieved artifact
    ///
    /// Job output is streamed into `sink`. When `shutdown` resolves first the
    /// run stops waiting, cleans up and returns [`AgentError::Cancelled`].
    /// A cleanup failure is logged with a remediation command and never
    /// replaces the run's own result.
    pub async fn run<S>(
        &self,
        sink: &mut (dyn Write + Send),
        shutdown: S,
    ) -> Result<ResultArtifact, AgentError>
    where
        S: Future<Output = ()>,
    {
        // Nothing exists yet, so a bad config needs no cleanup
        self.config.validate()?;
        let obligation = CleanupObligation::new(&self.backend, self.config.cleanup);

        let result = tokio::select! {
            result = self.run_phases(sink) => result,
            _ = shutdown => {
                warn!(job = %self.config.job_name, "Agent run interrupted");
                Err(AgentError::Cancelled)
            }
        };

        self.phase("cleanup");
        let retained = self.config.cleanup == CleanupPolicy::RetainAccess;
        match obligation.discharge(self.cleanup_timeout).await {
            Ok(()) => self.logger.log_cleanup(
                &self.config.namespace,
                &self.config.job_name,
                retained,
                true,
            ),
            Err(e) => {
                self.logger.log_cleanup(
                    &self.config.namespace,
                    &self.config.job_name,
                    retained,
                    false,
                );
                warn!(
                    error = %e,
                    remediation = %remediation_command(&self.config, self.config.cleanup),
                    "Remove leftover agent resources manually"
                );
            }
        }

        result
    }

    /// [`run`](Self::run), then hand the artifact to the configured destination
    pub async fn run_and_deliver<S>(
        &self,
        sink: &mut (dyn Write + Send),
        shutdown: S,
    ) -> Result<ResultArtifact, AgentError>
    where
        S: Future<Output = ()>,
    {
        let artifact = self.run(sink, shutdown).await?;
        deliver(&artifact, &self.config.output)?;
        Ok(artifact)
    }

    fn phase(&self, phase: &str) {
        self.logger
            .log_agent_phase(&self.config.namespace, &self.config.job_name, phase);
    }

    async fn run_phases(
        &self,
        sink: &mut (dyn Write + Send),
    ) -> Result<ResultArtifact, AgentError> {
        self.phase("provision");
        self.backend.provision().await?;

        self.phase("deploy");
        self.backend.deploy().await?;

        self.phase("observe");
        self.observe(sink).await?;

        self.phase("retrieve");
        self.backend.get_snapshot().await
    }

    async fn observe(&self, sink: &mut (dyn Write + Send)) -> Result<(), AgentError> {
        let ready = self
            .backend
            .wait_for_pod_ready(self.config.ready_timeout)
            .await;

        let completion = self.backend.wait_for_completion(self.config.timeout);
        tokio::pin!(completion);

        let outcome = match ready {
            Err(e) => {
                warn!(error = %e, "Agent pod not observable, skipping log streaming");
                completion.await
            }
            Ok(()) => {
                tokio::select! {
                    biased;
                    outcome = &mut completion => outcome,
                    streamed = self.backend.stream_logs(sink) => {
                        match streamed {
                            Ok(()) => debug!("Agent log stream ended"),
                            Err(e) => warn!(error = %e, "Agent log stream failed"),
                        }
                        completion.await
                    }
                }
            }
        };

        match outcome {
            Err(AgentError::JobFailed {
                job,
                reason,
                logs: None,
            }) => Err(AgentError::JobFailed {
                job,
                reason,
                logs: self.log_tail().await,
            }),
            other => other,
        }
    }

    async fn log_tail(&self) -> Option<String> {
        match tokio::time::timeout(LOG_TAIL_TIMEOUT, self.backend.fetch_logs(LOG_TAIL_LINES)).await
        {
            Ok(Ok(logs)) => Some(logs),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not fetch logs of failed job");
                None
            }
            Err(_) => {
                warn!("Timed out fetching logs of failed job");
                None
            }
        }
    }
}

/// Hand a retrieved artifact to its destination
///
/// A ConfigMap destination is where the Job already wrote the artifact.
pub fn deliver(artifact: &ResultArtifact, destination: &OutputDestination) -> Result<(), AgentError> {
    if destination.is_config_map() {
        debug!(destination = %destination, "Snapshot already persisted by the job");
        return Ok(());
    }
    write_local(destination, artifact.content.as_bytes()).map_err(|source| AgentError::Output {
        destination: destination.to_string(),
        source,
    })
}
