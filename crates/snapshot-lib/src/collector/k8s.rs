//! Kubernetes facts from the API server

use super::Collector;
use crate::deadline::Deadline;
use crate::models::{Measurement, MeasurementType, Subtype};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{Api, Client};

/// Collector for cluster and node state
pub struct K8sCollector {
    node_name: Option<String>,
}

impl K8sCollector {
    pub fn new(node_name: Option<String>) -> Self {
        Self { node_name }
    }
}

#[async_trait]
impl Collector for K8sCollector {
    async fn collect(&self, _deadline: &Deadline) -> Result<Measurement> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        let version = client
            .apiserver_version()
            .await
            .context("Failed to read API server version")?;

        let mut measurement =
            Measurement::new(MeasurementType::K8s).with_subtype(server_subtype(&version));

        if let Some(node_name) = &self.node_name {
            let nodes: Api<Node> = Api::all(client);
            let node = nodes
                .get(node_name)
                .await
                .with_context(|| format!("Failed to get node {}", node_name))?;
            measurement.subtypes.extend(node_subtypes(&node));
        }

        Ok(measurement)
    }
}

fn server_subtype(version: &Info) -> Subtype {
    Subtype::new("server")
        .with("version", version.git_version.as_str())
        .with("platform", version.platform.as_str())
        .with("go-version", version.go_version.as_str())
}

/// Node info, allocatable resources and labels
fn node_subtypes(node: &Node) -> Vec<Subtype> {
    let mut subtypes = Vec::new();
    let status = node.status.as_ref();

    if let Some(info) = status.and_then(|s| s.node_info.as_ref()) {
        subtypes.push(
            Subtype::new("node")
                .with("kubelet-version", info.kubelet_version.as_str())
                .with("container-runtime", info.container_runtime_version.as_str())
                .with("kernel-version", info.kernel_version.as_str())
                .with("os-image", info.os_image.as_str())
                .with("architecture", info.architecture.as_str())
                .with("operating-system", info.operating_system.as_str()),
        );
    }

    if let Some(allocatable) = status.and_then(|s| s.allocatable.as_ref()) {
        let mut subtype = Subtype::new("allocatable");
        for (resource, quantity) in allocatable {
            subtype.insert(resource.as_str(), quantity.0.as_str());
        }
        subtypes.push(subtype);
    }

    if let Some(labels) = node.metadata.labels.as_ref() {
        let mut subtype = Subtype::new("label");
        for (key, value) in labels {
            subtype.insert(key.as_str(), value.as_str());
        }
        subtypes.push(subtype);
    }

    subtypes
}
