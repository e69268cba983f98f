//! Removal of agent-owned objects

use super::backend::KubeAgent;
use super::{AgentConfig, AgentError, CleanupPolicy};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::DeleteParams;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{debug, warn};

/// Kinds of object a run creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnedKind {
    Job,
    ConfigMap,
    RoleBinding,
    Role,
    ClusterRoleBinding,
    ClusterRole,
    ServiceAccount,
}

impl OwnedKind {
    /// Resource name as kubectl spells it
    pub fn as_str(self) -> &'static str {
        match self {
            OwnedKind::Job => "job",
            OwnedKind::ConfigMap => "configmap",
            OwnedKind::RoleBinding => "rolebinding",
            OwnedKind::Role => "role",
            OwnedKind::ClusterRoleBinding => "clusterrolebinding",
            OwnedKind::ClusterRole => "clusterrole",
            OwnedKind::ServiceAccount => "serviceaccount",
        }
    }
}

/// One object a cleanup pass deletes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedObject {
    pub kind: OwnedKind,
    /// `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    pub name: String,
}

impl OwnedObject {
    fn namespaced(kind: OwnedKind, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.into(),
        }
    }

    fn cluster(kind: OwnedKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    /// kubectl invocation that deletes this object if it still exists
    pub fn delete_command(&self) -> String {
        let scope = match &self.namespace {
            Some(namespace) => format!("-n {} ", namespace),
            None => String::new(),
        };
        format!(
            "kubectl {}delete {} {} --ignore-not-found",
            scope,
            self.kind.as_str(),
            self.name
        )
    }
}

impl fmt::Display for OwnedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.name)
    }
}

/// Objects a cleanup pass removes under `policy`, in deletion order
///
/// The Job always goes. The scratch result ConfigMap goes when the caller
/// asked for stdout or a file, since the artifact was only a transport.
/// Access objects go only under [`CleanupPolicy::RemoveAll`].
pub fn owned_objects(config: &AgentConfig, policy: CleanupPolicy) -> Vec<OwnedObject> {
    let namespace = config.namespace.as_str();
    let mut objects = vec![OwnedObject::namespaced(
        OwnedKind::Job,
        namespace,
        &config.job_name,
    )];

    if !config.output.is_config_map() {
        let (artifact_namespace, artifact_name) = config.artifact_location();
        objects.push(OwnedObject::namespaced(
            OwnedKind::ConfigMap,
            &artifact_namespace,
            artifact_name,
        ));
    }

    if policy == CleanupPolicy::RemoveAll {
        objects.extend([
            OwnedObject::namespaced(OwnedKind::RoleBinding, namespace, config.role_name()),
            OwnedObject::namespaced(OwnedKind::Role, namespace, config.role_name()),
            OwnedObject::cluster(OwnedKind::ClusterRoleBinding, config.cluster_role_name()),
            OwnedObject::cluster(OwnedKind::ClusterRole, config.cluster_role_name()),
            OwnedObject::namespaced(
                OwnedKind::ServiceAccount,
                namespace,
                &config.service_account_name,
            ),
        ]);
    }
    objects
}

/// kubectl commands that remove whatever a failed cleanup left behind
pub fn remediation_command(config: &AgentConfig, policy: CleanupPolicy) -> String {
    owned_objects(config, policy)
        .iter()
        .map(OwnedObject::delete_command)
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Classify a delete response; an object that is already gone counts as deleted
pub(crate) fn deletion_outcome<T>(
    object: &OwnedObject,
    result: Result<T, kube::Error>,
) -> Result<(), String> {
    match result {
        Ok(_) => {
            debug!(resource = %object, "Deleted");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(resource = %object, "Already gone");
            Ok(())
        }
        Err(e) => {
            warn!(resource = %object, error = %e, "Delete failed");
            Err(format!("{}: {}", object, e))
        }
    }
}

async fn delete_object<K>(api: Api<K>, object: &OwnedObject) -> Result<(), String>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
{
    let result = api.delete(&object.name, &DeleteParams::background()).await;
    deletion_outcome(object, result)
}

impl KubeAgent {
    async fn delete(&self, object: &OwnedObject) -> Result<(), String> {
        let client = self.client.clone();
        let namespace = object.namespace.as_deref().unwrap_or_default();
        match object.kind {
            OwnedKind::Job => delete_object(Api::<Job>::namespaced(client, namespace), object).await,
            OwnedKind::ConfigMap => {
                delete_object(Api::<ConfigMap>::namespaced(client, namespace), object).await
            }
            OwnedKind::RoleBinding => {
                delete_object(Api::<RoleBinding>::namespaced(client, namespace), object).await
            }
            OwnedKind::Role => {
                delete_object(Api::<Role>::namespaced(client, namespace), object).await
            }
            OwnedKind::ClusterRoleBinding => {
                delete_object(Api::<ClusterRoleBinding>::all(client), object).await
            }
            OwnedKind::ClusterRole => delete_object(Api::<ClusterRole>::all(client), object).await,
            OwnedKind::ServiceAccount => {
                delete_object(Api::<ServiceAccount>::namespaced(client, namespace), object).await
            }
        }
    }

    /// Delete every object the run owns; failures are collected, not short-circuited
    pub(crate) async fn delete_owned(&self, policy: CleanupPolicy) -> Result<(), AgentError> {
        let mut failures = Vec::new();
        for object in owned_objects(&self.config, policy) {
            if let Err(failure) = self.delete(&object).await {
                failures.push(failure);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Cleanup { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputDestination;

    fn config() -> AgentConfig {
        AgentConfig {
            namespace: "ops".to_string(),
            job_name: "snap-job".to_string(),
            service_account_name: "snap".to_string(),
            ..Default::default()
        }
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_lowercase(),
            reason: reason.to_string(),
            code,
        })
    }

    fn refs(objects: &[OwnedObject]) -> Vec<String> {
        objects.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_remove_all_deletes_job_artifact_and_access() {
        let objects = owned_objects(&config(), CleanupPolicy::RemoveAll);
        assert_eq!(
            refs(&objects),
            vec![
                "job/snap-job",
                "configmap/nodesnap-snapshot",
                "rolebinding/snap",
                "role/snap",
                "clusterrolebinding/snap-ops",
                "clusterrole/snap-ops",
                "serviceaccount/snap",
            ]
        );
        for object in &objects {
            let cluster_scoped = matches!(
                object.kind,
                OwnedKind::ClusterRole | OwnedKind::ClusterRoleBinding
            );
            assert_eq!(object.namespace.is_none(), cluster_scoped, "{}", object);
        }
        assert_eq!(objects[1].namespace.as_deref(), Some("ops"));
    }

    #[test]
    fn test_retain_access_deletes_only_job_and_artifact() {
        let objects = owned_objects(&config(), CleanupPolicy::RetainAccess);
        assert_eq!(
            refs(&objects),
            vec!["job/snap-job", "configmap/nodesnap-snapshot"]
        );
    }

    #[test]
    fn test_requested_configmap_is_kept() {
        let config = AgentConfig {
            output: OutputDestination::ConfigMap {
                namespace: "ops".to_string(),
                name: "node-a".to_string(),
            },
            ..config()
        };
        for policy in [CleanupPolicy::RemoveAll, CleanupPolicy::RetainAccess] {
            let objects = owned_objects(&config, policy);
            assert!(objects.iter().all(|o| o.kind != OwnedKind::ConfigMap));
            assert_eq!(objects[0].to_string(), "job/snap-job");
        }
    }

    #[test]
    fn test_missing_object_counts_as_deleted() {
        let job = OwnedObject::namespaced(OwnedKind::Job, "ops", "snap-job");
        assert_eq!(deletion_outcome(&job, Ok(())), Ok(()));
        assert_eq!(
            deletion_outcome::<()>(&job, Err(api_error(404, "NotFound"))),
            Ok(())
        );
    }

    #[test]
    fn test_other_delete_errors_name_the_object() {
        let role = OwnedObject::cluster(OwnedKind::ClusterRole, "snap-ops");
        let failure = deletion_outcome::<()>(&role, Err(api_error(403, "Forbidden"))).unwrap_err();
        assert!(failure.starts_with("clusterrole/snap-ops: "), "{}", failure);
        assert!(failure.contains("forbidden"), "{}", failure);
    }

    #[test]
    fn test_remediation_remove_all() {
        let command = remediation_command(&config(), CleanupPolicy::RemoveAll);
        assert!(command.starts_with("kubectl -n ops delete job snap-job --ignore-not-found"));
        assert!(command.contains("kubectl -n ops delete configmap nodesnap-snapshot"));
        assert!(command.contains("kubectl -n ops delete rolebinding snap"));
        assert!(command.contains("kubectl delete clusterrolebinding snap-ops"));
        assert!(command.contains("kubectl delete clusterrole snap-ops"));
        assert!(command.contains("kubectl -n ops delete serviceaccount snap"));
        assert_eq!(command.matches(" && ").count(), 6);
    }

    #[test]
    fn test_remediation_retain_access() {
        let command = remediation_command(&config(), CleanupPolicy::RetainAccess);
        assert!(command.contains("delete job snap-job"));
        assert!(!command.contains("serviceaccount"));
        assert!(!command.contains("clusterrole"));
    }
}
