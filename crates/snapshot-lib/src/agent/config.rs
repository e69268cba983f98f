//! Agent deployment configuration

use super::placement::tolerate_all;
use super::AgentError;
use crate::output::{OutputDestination, OutputFormat};
use k8s_openapi::api::core::v1::Toleration;
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the ConfigMap the Job writes when no ConfigMap output is configured
pub const DEFAULT_ARTIFACT_NAME: &str = "nodesnap-snapshot";

/// What happens to the access objects after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Delete the Job and every access object
    #[default]
    RemoveAll,
    /// Delete the Job, keep ServiceAccount and RBAC for the next run
    RetainAccess,
}

/// Parameters of one agent deployment
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub namespace: String,
    pub image: String,
    pub image_pull_secrets: Vec<String>,
    pub job_name: String,
    pub service_account_name: String,
    /// Node labels the pod must match
    pub node_selector: BTreeMap<String, String>,
    /// Taints the pod tolerates; empty means tolerate everything
    pub tolerations: Vec<Toleration>,
    /// Bound on waiting for the Job to finish
    pub timeout: Duration,
    /// Bound on waiting for the pod to become observable
    pub ready_timeout: Duration,
    pub cleanup: CleanupPolicy,
    pub output: OutputDestination,
    pub format: OutputFormat,
    /// Grant host namespaces and mounts to the collector pod
    pub privileged: bool,
    /// Run the in-cluster agent with debug logging
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "ghcr.io/nodesnap/nodesnap-agent:latest".to_string(),
            image_pull_secrets: Vec::new(),
            job_name: "nodesnap".to_string(),
            service_account_name: "nodesnap".to_string(),
            node_selector: BTreeMap::new(),
            tolerations: vec![tolerate_all()],
            timeout: Duration::from_secs(300),
            ready_timeout: Duration::from_secs(60),
            cleanup: CleanupPolicy::RemoveAll,
            output: OutputDestination::Stdout,
            format: OutputFormat::Json,
            privileged: true,
            debug: false,
        }
    }
}

impl AgentConfig {
    /// (namespace, name) of the ConfigMap the Job writes its result to
    pub fn artifact_location(&self) -> (String, String) {
        match &self.output {
            OutputDestination::ConfigMap { namespace, name } => (namespace.clone(), name.clone()),
            _ => (self.namespace.clone(), DEFAULT_ARTIFACT_NAME.to_string()),
        }
    }

    /// Reject settings the provisioned access cannot serve
    ///
    /// The Role granting ConfigMap writes lives in `namespace` only.
    pub fn validate(&self) -> Result<(), AgentError> {
        let (artifact_namespace, _) = self.artifact_location();
        if artifact_namespace != self.namespace {
            return Err(AgentError::ArtifactNamespace {
                namespace: self.namespace.clone(),
                artifact_namespace,
            });
        }
        Ok(())
    }

    /// Name of the Role and RoleBinding
    pub fn role_name(&self) -> String {
        self.service_account_name.clone()
    }

    /// Name of the ClusterRole and ClusterRoleBinding, unique per namespace
    pub fn cluster_role_name(&self) -> String {
        format!("{}-{}", self.service_account_name, self.namespace)
    }

    /// Label selector matching the Job's pods
    pub fn pod_selector(&self) -> String {
        format!("job-name={}", self.job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_location_follows_configmap_output() {
        let mut config = AgentConfig {
            namespace: "gpu-operator".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.artifact_location(),
            ("gpu-operator".to_string(), DEFAULT_ARTIFACT_NAME.to_string())
        );

        config.output = OutputDestination::ConfigMap {
            namespace: "gpu-operator".to_string(),
            name: "node-a".to_string(),
        };
        assert_eq!(
            config.artifact_location(),
            ("gpu-operator".to_string(), "node-a".to_string())
        );
    }

    #[test]
    fn test_validate_requires_artifact_in_agent_namespace() {
        let mut config = AgentConfig {
            namespace: "ops".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.output = OutputDestination::ConfigMap {
            namespace: "ops".to_string(),
            name: "snap".to_string(),
        };
        assert!(config.validate().is_ok());

        config.output = OutputDestination::ConfigMap {
            namespace: "other".to_string(),
            name: "snap".to_string(),
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            &err,
            AgentError::ArtifactNamespace { namespace, artifact_namespace }
                if namespace == "ops" && artifact_namespace == "other"
        ));
        assert!(err.to_string().contains("other"));
    }

    #[test]
    fn test_cluster_scoped_names_include_namespace() {
        let config = AgentConfig {
            namespace: "ops".to_string(),
            service_account_name: "snap".to_string(),
            ..Default::default()
        };
        assert_eq!(config.role_name(), "snap");
        assert_eq!(config.cluster_role_name(), "snap-ops");
    }

    #[test]
    fn test_default_tolerates_everything() {
        let config = AgentConfig::default();
        assert_eq!(config.tolerations, vec![tolerate_all()]);
        assert_eq!(config.cleanup, CleanupPolicy::RemoveAll);
    }
}
