//! systemd unit facts via `systemctl show`

use super::{typed_reading, Collector};
use crate::deadline::Deadline;
use crate::models::{Measurement, MeasurementType, Subtype};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, warn};

/// Unit properties captured for every unit
const UNIT_PROPERTIES: &[&str] = &[
    "LoadState",
    "ActiveState",
    "SubState",
    "UnitFileState",
    "FragmentPath",
    "CPUAccounting",
    "MemoryAccounting",
    "TasksMax",
    "LimitNOFILE",
    "Delegate",
];

/// Collector for service manager configuration
pub struct SystemdCollector {
    units: Vec<String>,
    systemctl: String,
}

impl SystemdCollector {
    pub fn new(units: Vec<String>) -> Self {
        Self {
            units,
            systemctl: "systemctl".to_string(),
        }
    }

    /// Use a different systemctl binary
    pub fn with_systemctl(mut self, program: impl Into<String>) -> Self {
        self.systemctl = program.into();
        self
    }

    /// Run `systemctl show` for one unit; `None` when systemctl is unavailable
    async fn show(&self, unit: &str) -> Result<Option<String>> {
        let output = Command::new(&self.systemctl)
            .arg("show")
            .arg(unit)
            .arg(format!("--property={}", UNIT_PROPERTIES.join(",")))
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to run systemctl for {}", unit))
            }
        };

        if !output.status.success() {
            anyhow::bail!(
                "systemctl show {} exited with {}: {}",
                unit,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

#[async_trait]
impl Collector for SystemdCollector {
    async fn collect(&self, _deadline: &Deadline) -> Result<Measurement> {
        let mut measurement = Measurement::new(MeasurementType::SystemD);

        for unit in &self.units {
            let Some(stdout) = self.show(unit).await? else {
                warn!(program = %self.systemctl, "systemctl not available, skipping units");
                break;
            };

            let properties = parse_unit_properties(&stdout);
            if properties.get("LoadState").map(String::as_str) == Some("not-found") {
                debug!(unit = %unit, "Unit not installed, skipping");
                continue;
            }

            let mut subtype = Subtype::new(unit.clone());
            for (key, value) in properties {
                subtype.insert(key, typed_reading(&value));
            }
            measurement.subtypes.push(subtype);
        }

        Ok(measurement)
    }
}

/// Parse `Key=Value` lines emitted by `systemctl show`
fn parse_unit_properties(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;
    use std::time::Duration;

    #[test]
    fn test_parse_unit_properties() {
        let stdout = "LoadState=loaded\nActiveState=active\nCPUAccounting=yes\nTasksMax=4915\nExecStart={ path=/usr/bin/containerd ; argv[]=/usr/bin/containerd }\n";
        let properties = parse_unit_properties(stdout);

        assert_eq!(properties["LoadState"], "loaded");
        assert_eq!(properties["TasksMax"], "4915");
        assert_eq!(
            properties["ExecStart"],
            "{ path=/usr/bin/containerd ; argv[]=/usr/bin/containerd }"
        );
        assert_eq!(typed_reading(&properties["CPUAccounting"]), Reading::Bool(true));
    }

    #[tokio::test]
    async fn test_missing_systemctl_yields_empty_measurement() {
        let collector = SystemdCollector::new(vec!["kubelet.service".to_string()])
            .with_systemctl("/nonexistent/systemctl");

        let measurement = collector
            .collect(&Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(measurement.measurement_type, MeasurementType::SystemD);
        assert!(measurement.subtypes.is_empty());
    }
}
