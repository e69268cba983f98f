//! The ConfigMap an agent run persists its snapshot in

use super::rbac::apply_params;
use super::AgentError;
use crate::output::OutputFormat;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Patch;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::info;

/// Data keys of the result ConfigMap
pub mod keys {
    pub const SNAPSHOT: &str = "snapshot";
    pub const FORMAT: &str = "format";
    pub const TIMESTAMP: &str = "timestamp";
}

/// Serialized snapshot plus the facts needed to interpret it
#[derive(Debug, Clone, PartialEq)]
pub struct ResultArtifact {
    pub content: String,
    pub format: OutputFormat,
    pub timestamp: DateTime<Utc>,
}

impl ResultArtifact {
    pub fn new(content: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            content: content.into(),
            format,
            timestamp: Utc::now(),
        }
    }

    pub fn to_config_map(&self, namespace: &str, name: &str) -> ConfigMap {
        let data = BTreeMap::from([
            (keys::SNAPSHOT.to_string(), self.content.clone()),
            (keys::FORMAT.to_string(), self.format.to_string()),
            (
                keys::TIMESTAMP.to_string(),
                self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]);
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/name".to_string(),
                    "nodesnap".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// Read an artifact back; `None` when the snapshot key is missing or empty
    ///
    /// A missing or unreadable format falls back to JSON and a missing
    /// timestamp to now.
    pub fn from_config_map(config_map: &ConfigMap) -> Option<Self> {
        let data = config_map.data.as_ref()?;
        let content = data.get(keys::SNAPSHOT).filter(|c| !c.is_empty())?;
        let format = data
            .get(keys::FORMAT)
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        let timestamp = data
            .get(keys::TIMESTAMP)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(Self {
            content: content.clone(),
            format,
            timestamp,
        })
    }
}

/// Create or replace the result ConfigMap
pub async fn write_config_map(
    client: Client,
    namespace: &str,
    name: &str,
    artifact: &ResultArtifact,
) -> Result<(), kube::Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let config_map = artifact.to_config_map(namespace, name);
    api.patch(name, &apply_params(), &Patch::Apply(&config_map))
        .await?;
    info!(
        namespace = %namespace,
        name = %name,
        bytes = artifact.content.len(),
        "Snapshot written to ConfigMap"
    );
    Ok(())
}

/// Fetch the result ConfigMap and decode it
pub async fn read_config_map(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<ResultArtifact, AgentError> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let config_map = api.get(name).await.map_err(|source| AgentError::Retrieve {
        resource: format!("configmap/{}/{}", namespace, name),
        source,
    })?;
    ResultArtifact::from_config_map(&config_map).ok_or_else(|| AgentError::MissingArtifact {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}
