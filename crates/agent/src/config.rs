//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use snapshot_lib::collector::CollectorSettings;
use snapshot_lib::{OutputDestination, OutputFormat};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: Option<String>,

    /// `-`, a file path or `cm://<namespace>/<name>`
    #[serde(default)]
    pub output: String,

    #[serde(default)]
    pub format: OutputFormat,

    /// Collection timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Root under which the host filesystem is mounted
    #[serde(default = "default_host_root")]
    pub host_root: PathBuf,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Write Prometheus text metrics here after collection
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,

    /// Comma separated systemd units; empty keeps the defaults
    #[serde(default)]
    pub units: String,
}

fn default_node_name() -> Option<String> {
    std::env::var("NODE_NAME").ok()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_host_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

impl AgentSettings {
    /// Load configuration from environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("invalid AGENT_* configuration")
    }

    pub fn destination(&self) -> Result<OutputDestination> {
        OutputDestination::parse(&self.output)
            .with_context(|| format!("invalid output '{}'", self.output))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        let mut settings = CollectorSettings {
            node_name: self.node_name.clone().filter(|n| !n.is_empty()),
            host_root: self.host_root.clone(),
            proc_root: self.proc_root.clone(),
            ..Default::default()
        };
        let units: Vec<String> = self
            .units
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if !units.is_empty() {
            settings.systemd_units = units;
        }
        settings
    }
}
