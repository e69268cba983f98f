//! Watching a running Job: pod readiness, log streaming, completion

use super::backend::KubeAgent;
use super::AgentError;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use kube::runtime::wait::await_condition;
use kube::{Api, ResourceExt};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

/// Interval between pod lookups while waiting for readiness
const POD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pod phases in which logs can be read
const OBSERVABLE_PHASES: &[&str] = &["Running", "Succeeded", "Failed"];

/// Terminal state of a Job as reported by its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed(String),
}

/// Derive the Job's outcome from its status conditions and pod counters
pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = job.status.as_ref() else {
        return JobOutcome::Running;
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobOutcome::Succeeded,
            "Failed" => {
                let reason = condition
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                return JobOutcome::Failed(reason);
            }
            _ => {}
        }
    }

    if status.failed.unwrap_or(0) > 0 {
        return JobOutcome::Failed("pod failed".to_string());
    }
    if status.succeeded.unwrap_or(0) > 0 {
        return JobOutcome::Succeeded;
    }
    JobOutcome::Running
}

impl KubeAgent {
    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Newest pod created by the Job
    async fn find_pod(&self) -> Result<Option<Pod>, kube::Error> {
        let params = ListParams::default().labels(&self.config.pod_selector());
        let pods = self.pods().list(&params).await?;
        Ok(pods
            .items
            .into_iter()
            .max_by(|a, b| a.creation_timestamp().cmp(&b.creation_timestamp())))
    }

    async fn require_pod_name(&self) -> Result<String, AgentError> {
        let job = self.config.job_name.clone();
        match self.find_pod().await {
            Ok(Some(pod)) => Ok(pod.name_any()),
            Ok(None) => Err(AgentError::LogStream {
                job,
                message: "no pod found".to_string(),
            }),
            Err(e) => Err(AgentError::LogStream {
                job,
                message: e.to_string(),
            }),
        }
    }

    pub(crate) async fn wait_pod_ready(&self, timeout: Duration) -> Result<(), AgentError> {
        let job = self.config.job_name.as_str();
        let poll = async {
            loop {
                match self.find_pod().await {
                    Ok(Some(pod)) => {
                        let phase = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.phase.clone())
                            .unwrap_or_default();
                        if OBSERVABLE_PHASES.contains(&phase.as_str()) {
                            info!(job = %job, pod = %pod.name_any(), phase = %phase, "Agent pod observable");
                            return;
                        }
                        debug!(job = %job, phase = %phase, "Waiting for agent pod");
                    }
                    Ok(None) => debug!(job = %job, "Agent pod not created yet"),
                    Err(e) => debug!(job = %job, error = %e, "Pod lookup failed, retrying"),
                }
                tokio::time::sleep(POD_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| AgentError::PodNotReady {
                job: job.to_string(),
                timeout,
            })
    }

    pub(crate) async fn stream_pod_logs(
        &self,
        sink: &mut (dyn Write + Send),
    ) -> Result<(), AgentError> {
        let job = self.config.job_name.clone();
        let pod = self.require_pod_name().await?;
        let stream_error = |message: String| AgentError::LogStream {
            job: job.clone(),
            message,
        };

        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let reader = self
            .pods()
            .log_stream(&pod, &params)
            .await
            .map_err(|e| stream_error(e.to_string()))?;

        let mut lines = Box::pin(reader.lines());
        while let Some(line) = lines
            .try_next()
            .await
            .map_err(|e| stream_error(e.to_string()))?
        {
            writeln!(sink, "{}", line).map_err(|e| stream_error(e.to_string()))?;
        }
        Ok(())
    }

    pub(crate) async fn wait_job_completion(&self, timeout: Duration) -> Result<(), AgentError> {
        let job = self.config.job_name.clone();
        let finished = |job: Option<&Job>| match job {
            Some(job) => job_outcome(job) != JobOutcome::Running,
            None => true,
        };

        let result = tokio::time::timeout(
            timeout,
            await_condition(self.jobs(), &job, finished),
        )
        .await
        .map_err(|_| AgentError::CompletionTimeout {
            job: job.clone(),
            timeout,
        })?
        .map_err(|e| AgentError::Watch {
            job: job.clone(),
            message: e.to_string(),
        })?;

        let Some(finished_job) = result else {
            return Err(AgentError::JobFailed {
                job,
                reason: "job was deleted before completing".to_string(),
                logs: None,
            });
        };

        match job_outcome(&finished_job) {
            JobOutcome::Succeeded => Ok(()),
            JobOutcome::Failed(reason) => Err(AgentError::JobFailed {
                job,
                reason,
                logs: None,
            }),
            JobOutcome::Running => Err(AgentError::Watch {
                job,
                message: "watch ended before the job finished".to_string(),
            }),
        }
    }

    pub(crate) async fn tail_logs(&self, tail_lines: i64) -> Result<String, AgentError> {
        let pod = self.require_pod_name().await?;
        let params = LogParams {
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        self.pods()
            .logs(&pod, &params)
            .await
            .map_err(|e| AgentError::LogStream {
                job: self.config.job_name.clone(),
                message: e.to_string(),
            })
    }
}
