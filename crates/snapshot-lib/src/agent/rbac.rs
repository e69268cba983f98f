//! Access objects the agent Job runs with
//!
//! Everything is applied with server-side apply under one field manager, so
//! provisioning the same configuration twice converges on the same objects.

use super::backend::KubeAgent;
use super::{AgentConfig, AgentError};
use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "nodesnap";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Server-side apply parameters for every object the agent owns
pub fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Labels stamped on every agent-owned object
pub(crate) fn labels(config: &AgentConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "nodesnap".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
        ("app.kubernetes.io/instance".to_string(), config.job_name.clone()),
    ])
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// The fixed set of objects one agent run is provisioned with
#[derive(Debug, Clone, PartialEq)]
pub struct AccessObjects {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub role_binding: RoleBinding,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
}

impl AccessObjects {
    pub fn for_config(config: &AgentConfig) -> Self {
        let namespaced = |name: String| ObjectMeta {
            name: Some(name),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(config)),
            ..Default::default()
        };
        let cluster_scoped = |name: String| ObjectMeta {
            name: Some(name),
            labels: Some(labels(config)),
            ..Default::default()
        };
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: config.service_account_name.clone(),
            namespace: Some(config.namespace.clone()),
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

        Self {
            service_account: ServiceAccount {
                metadata: namespaced(config.service_account_name.clone()),
                image_pull_secrets,
                ..Default::default()
            },
            role: Role {
                metadata: namespaced(config.role_name()),
                rules: Some(vec![
                    // Result artifact
                    rule("", &["configmaps"], &["get", "list", "create", "update", "patch"]),
                    rule("", &["pods", "pods/log"], &["get", "list", "watch"]),
                    rule("batch", &["jobs"], &["get", "list", "watch"]),
                ]),
            },
            role_binding: RoleBinding {
                metadata: namespaced(config.role_name()),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: config.role_name(),
                },
                subjects: Some(vec![subject.clone()]),
            },
            cluster_role: ClusterRole {
                metadata: cluster_scoped(config.cluster_role_name()),
                rules: Some(vec![
                    rule("", &["nodes"], &["get", "list", "watch"]),
                    rule("", &["pods", "namespaces", "services"], &["get", "list"]),
                    rule("nvidia.com", &["clusterpolicies"], &["get", "list"]),
                ]),
                ..Default::default()
            },
            cluster_role_binding: ClusterRoleBinding {
                metadata: cluster_scoped(config.cluster_role_name()),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "ClusterRole".to_string(),
                    name: config.cluster_role_name(),
                },
                subjects: Some(vec![subject]),
            },
        }
    }
}

/// Apply one object and return the server's view of it
pub(crate) async fn apply_object<K>(api: &Api<K>, object: &K) -> Result<K, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object.name_any();
    debug!(kind = %K::kind(&()), name = %name, "Applying object");
    api.patch(&name, &apply_params(), &Patch::Apply(object)).await
}

/// `kind/name` for error messages
pub(crate) fn resource_ref<K>(name: &str) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!("{}/{}", K::kind(&()).to_lowercase(), name)
}

impl KubeAgent {
    /// Apply all access objects; the first failure aborts
    pub(crate) async fn apply_access_objects(&self) -> Result<(), AgentError> {
        let objects = AccessObjects::for_config(&self.config);
        let namespace = self.config.namespace.as_str();

        let provision_error = |resource: String| {
            move |source: kube::Error| AgentError::Provision { resource, source }
        };

        let service_accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        apply_object(&service_accounts, &objects.service_account)
            .await
            .map_err(provision_error(resource_ref::<ServiceAccount>(
                &self.config.service_account_name,
            )))?;

        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        apply_object(&roles, &objects.role)
            .await
            .map_err(provision_error(resource_ref::<Role>(&self.config.role_name())))?;

        let role_bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        apply_object(&role_bindings, &objects.role_binding)
            .await
            .map_err(provision_error(resource_ref::<RoleBinding>(
                &self.config.role_name(),
            )))?;

        let cluster_roles: Api<ClusterRole> = Api::all(self.client.clone());
        apply_object(&cluster_roles, &objects.cluster_role)
            .await
            .map_err(provision_error(resource_ref::<ClusterRole>(
                &self.config.cluster_role_name(),
            )))?;

        let cluster_role_bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        apply_object(&cluster_role_bindings, &objects.cluster_role_binding)
            .await
            .map_err(provision_error(resource_ref::<ClusterRoleBinding>(
                &self.config.cluster_role_name(),
            )))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig {
            namespace: "gpu-operator".to_string(),
            service_account_name: "nodesnap".to_string(),
            image_pull_secrets: vec!["regcred".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_access_objects_are_deterministic() {
        // Applying the same configuration twice targets the same objects
        assert_eq!(
            AccessObjects::for_config(&config()),
            AccessObjects::for_config(&config())
        );
    }

    #[test]
    fn test_bindings_reference_service_account() {
        let objects = AccessObjects::for_config(&config());

        let subjects = objects.role_binding.subjects.as_ref().unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, "nodesnap");
        assert_eq!(subjects[0].namespace.as_deref(), Some("gpu-operator"));
        assert_eq!(objects.role_binding.role_ref.kind, "Role");
        assert_eq!(objects.role_binding.role_ref.name, "nodesnap");

        assert_eq!(
            objects.cluster_role_binding.subjects,
            objects.role_binding.subjects
        );
        assert_eq!(objects.cluster_role_binding.role_ref.kind, "ClusterRole");
        assert_eq!(
            objects.cluster_role_binding.role_ref.name,
            "nodesnap-gpu-operator"
        );
    }

    #[test]
    fn test_scoping_of_objects() {
        let objects = AccessObjects::for_config(&config());

        assert_eq!(
            objects.role.metadata.namespace.as_deref(),
            Some("gpu-operator")
        );
        assert!(objects.cluster_role.metadata.namespace.is_none());
        assert!(objects.cluster_role_binding.metadata.namespace.is_none());

        let role_resources: Vec<String> = objects
            .role
            .rules
            .unwrap()
            .into_iter()
            .flat_map(|r| r.resources.unwrap_or_default())
            .collect();
        assert!(role_resources.contains(&"configmaps".to_string()));
        assert!(!role_resources.contains(&"nodes".to_string()));

        let cluster_resources: Vec<String> = objects
            .cluster_role
            .rules
            .unwrap()
            .into_iter()
            .flat_map(|r| r.resources.unwrap_or_default())
            .collect();
        assert!(cluster_resources.contains(&"nodes".to_string()));
    }

    #[test]
    fn test_pull_secrets_on_service_account() {
        let objects = AccessObjects::for_config(&config());
        let secrets = objects.service_account.image_pull_secrets.unwrap();
        assert_eq!(secrets[0].name.as_deref(), Some("regcred"));

        let without = AccessObjects::for_config(&AgentConfig::default());
        assert!(without.service_account.image_pull_secrets.is_none());
    }

    #[test]
    fn test_apply_params_force_field_manager() {
        let params = apply_params();
        assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(params.force);
    }

    #[test]
    fn test_resource_ref() {
        assert_eq!(resource_ref::<Role>("nodesnap"), "role/nodesnap");
        assert_eq!(
            resource_ref::<ClusterRoleBinding>("x"),
            "clusterrolebinding/x"
        );
    }
}
