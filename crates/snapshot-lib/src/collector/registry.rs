//! Mapping from measurement category to collector constructor

use super::{Collector, GpuCollector, K8sCollector, OsCollector, SystemdCollector};
use crate::models::MeasurementType;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Constructor for a collector instance
pub type CollectorFactory = Arc<dyn Fn() -> Arc<dyn Collector> + Send + Sync>;

/// Settings shared by the built-in collectors
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Node being described; enables node-level Kubernetes facts
    pub node_name: Option<String>,
    /// Root under which host `/etc` is visible
    pub host_root: PathBuf,
    /// Location of the proc filesystem
    pub proc_root: PathBuf,
    /// systemd units to describe
    pub systemd_units: Vec<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            node_name: None,
            host_root: PathBuf::from("/"),
            proc_root: PathBuf::from("/proc"),
            systemd_units: vec![
                "containerd.service".to_string(),
                "docker.service".to_string(),
                "kubelet.service".to_string(),
            ],
        }
    }
}

/// Registry of collectors keyed by the category they produce
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    factories: BTreeMap<MeasurementType, CollectorFactory>,
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("categories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CollectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in collector for every category
    pub fn with_defaults(settings: &CollectorSettings) -> Self {
        let mut registry = Self::new();

        let node_name = settings.node_name.clone();
        registry.register(MeasurementType::K8s, move || {
            Arc::new(K8sCollector::new(node_name.clone()))
        });

        registry.register(MeasurementType::GPU, || Arc::new(GpuCollector::new()));

        let host_root = settings.host_root.clone();
        let proc_root = settings.proc_root.clone();
        registry.register(MeasurementType::OS, move || {
            Arc::new(OsCollector::new(host_root.clone(), proc_root.clone()))
        });

        let units = settings.systemd_units.clone();
        registry.register(MeasurementType::SystemD, move || {
            Arc::new(SystemdCollector::new(units.clone()))
        });

        registry
    }

    /// Register (or replace) the collector for a category
    pub fn register<F>(&mut self, category: MeasurementType, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Collector> + Send + Sync + 'static,
    {
        self.factories.insert(category, Arc::new(factory));
        self
    }

    /// Remove the collector for a category
    pub fn unregister(&mut self, category: MeasurementType) -> bool {
        self.factories.remove(&category).is_some()
    }

    /// Categories with a registered collector
    pub fn categories(&self) -> Vec<MeasurementType> {
        self.factories.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Construct one collector per registered category
    pub(crate) fn instantiate(&self) -> Vec<(MeasurementType, Arc<dyn Collector>)> {
        self.factories
            .iter()
            .map(|(category, factory)| (*category, factory()))
            .collect()
    }
}
