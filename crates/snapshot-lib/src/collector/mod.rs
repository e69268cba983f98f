//! Node facts collection
//!
//! This module provides the collector capability, a registry mapping each
//! measurement category to a collector constructor, the built-in collectors
//! (Kubernetes, GPU, OS, systemd) and the local coordinator that runs them
//! concurrently into one snapshot.

mod coordinator;
mod gpu;
mod k8s;
mod os;
mod registry;
mod systemd;

#[cfg(test)]
mod tests;

pub use coordinator::{CollectError, CoordinatorConfig, LocalCollector};
pub use gpu::GpuCollector;
pub use k8s::K8sCollector;
pub use os::OsCollector;
pub use registry::{CollectorFactory, CollectorRegistry, CollectorSettings};
pub use systemd::SystemdCollector;

use crate::deadline::Deadline;
use crate::models::{Measurement, Reading};
use anyhow::Result;

pub use async_trait::async_trait;

/// Trait for a single data source category
#[async_trait]
pub trait Collector: Send + Sync {
    /// Produce one measurement before `deadline` runs out
    async fn collect(&self, deadline: &Deadline) -> Result<Measurement>;
}

/// Interpret a raw textual value as the narrowest fitting reading
pub(crate) fn typed_reading(raw: &str) -> Reading {
    let value = raw.trim();
    match value {
        "yes" | "true" => return Reading::Bool(true),
        "no" | "false" => return Reading::Bool(false),
        _ => {}
    }
    if let Ok(int) = value.parse::<i64>() {
        return Reading::Int(int);
    }
    Reading::String(value.to_string())
}
