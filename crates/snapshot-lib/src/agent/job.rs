//! The one-shot Job that runs the collector on a target node

use super::backend::KubeAgent;
use super::rbac::{apply_object, labels};
use super::{AgentConfig, AgentError};
use crate::output::OutputDestination;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, LocalObjectReference,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DeleteParams;
use kube::runtime::wait::{await_condition, conditions};
use kube::Api;
use std::time::Duration;
use tracing::{debug, info};

/// Seconds a finished Job lingers before the cluster garbage-collects it
pub const JOB_TTL_SECONDS: i32 = 3600;

/// Where the host filesystem is mounted inside the pod
pub const HOST_ROOT_MOUNT: &str = "/host";

/// Bound on waiting for a previous Job with the same name to go away
const STALE_JOB_TIMEOUT: Duration = Duration::from_secs(60);

const AGENT_BINARY: &str = "nodesnap-agent";

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn node_name_env(name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str, mount_path: &str) -> (Volume, VolumeMount) {
    let volume = Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(true),
        ..Default::default()
    };
    (volume, mount)
}

/// Build the Job for one agent run
///
/// The Job never retries: a failed pod is a failed run.
pub fn build_job(config: &AgentConfig) -> Job {
    let (namespace, artifact) = config.artifact_location();
    let output = OutputDestination::ConfigMap {
        namespace,
        name: artifact,
    };

    let log_level = if config.debug { "debug" } else { "info" };
    // Host mounts only exist for privileged pods
    let host_root = if config.privileged { HOST_ROOT_MOUNT } else { "/" };
    let env = vec![
        node_name_env("NODE_NAME"),
        node_name_env("AGENT_NODE_NAME"),
        env("AGENT_OUTPUT", output.to_string()),
        env("AGENT_FORMAT", config.format.as_str()),
        env("AGENT_HOST_ROOT", host_root),
        env("RUST_LOG", log_level),
    ];

    let (volumes, mounts): (Vec<_>, Vec<_>) = if config.privileged {
        [
            host_path("host-root", "/", HOST_ROOT_MOUNT),
            host_path("run-systemd", "/run/systemd", "/run/systemd"),
            host_path("run-dbus", "/run/dbus", "/run/dbus"),
        ]
        .into_iter()
        .unzip()
    } else {
        (Vec::new(), Vec::new())
    };

    let security_context = config.privileged.then(|| SecurityContext {
        privileged: Some(true),
        run_as_user: Some(0),
        ..Default::default()
    });

    let container = Container {
        name: "nodesnap".to_string(),
        image: Some(config.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![AGENT_BINARY.to_string()]),
        env: Some(env),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        security_context,
        ..Default::default()
    };

    let image_pull_secrets = (!config.image_pull_secrets.is_empty()).then(|| {
        config
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference {
                name: Some(name.clone()),
            })
            .collect()
    });

    let tolerations = if config.tolerations.is_empty() {
        vec![super::tolerate_all()]
    } else {
        config.tolerations.clone()
    };

    let privileged = config.privileged.then_some(true);
    let pod_spec = PodSpec {
        service_account_name: Some(config.service_account_name.clone()),
        restart_policy: Some("Never".to_string()),
        node_selector: (!config.node_selector.is_empty()).then(|| config.node_selector.clone()),
        tolerations: Some(tolerations),
        image_pull_secrets,
        host_pid: privileged,
        host_network: privileged,
        host_ipc: privileged,
        dns_policy: config
            .privileged
            .then(|| "ClusterFirstWithHostNet".to_string()),
        containers: vec![container],
        volumes: (!volumes.is_empty()).then_some(volumes),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(config.job_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(config)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(config)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl KubeAgent {
    pub(crate) fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Delete a leftover Job with the same name and wait for it to disappear
    ///
    /// Job templates are immutable, so applying over a previous run fails.
    pub(crate) async fn remove_stale_job(&self) -> Result<(), AgentError> {
        let jobs = self.jobs();
        let name = self.config.job_name.as_str();
        let deploy_error = |source| AgentError::Deploy {
            job: name.to_string(),
            source,
        };

        let Some(existing) = jobs.get_opt(name).await.map_err(deploy_error)? else {
            return Ok(());
        };
        let uid = existing.metadata.uid.clone().unwrap_or_default();
        info!(job = %name, "Removing previous job with the same name");

        match jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(()),
            Err(e) => return Err(deploy_error(e)),
        }

        tokio::time::timeout(
            STALE_JOB_TIMEOUT,
            await_condition(jobs, name, conditions::is_deleted(&uid)),
        )
        .await
        .map_err(|_| AgentError::StaleJob {
            job: name.to_string(),
            timeout: STALE_JOB_TIMEOUT,
        })?
        .map_err(|e| AgentError::Watch {
            job: name.to_string(),
            message: e.to_string(),
        })?;

        debug!(job = %name, "Previous job removed");
        Ok(())
    }

    pub(crate) async fn apply_job(&self) -> Result<(), AgentError> {
        let job = build_job(&self.config);
        apply_object(&self.jobs(), &job)
            .await
            .map_err(|source| AgentError::Deploy {
                job: self.config.job_name.clone(),
                source,
            })?;
        Ok(())
    }
}
