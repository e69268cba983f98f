//! GPU and driver facts via `nvidia-smi`

use super::{typed_reading, Collector};
use crate::deadline::Deadline;
use crate::models::{Measurement, MeasurementType, Subtype};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

/// Fields requested from `nvidia-smi --query-gpu`
const QUERY_FIELDS: &[&str] = &[
    "index",
    "name",
    "uuid",
    "driver_version",
    "vbios_version",
    "memory.total",
    "pci.bus_id",
    "persistence_mode",
    "mig.mode.current",
];

/// Collector for GPU hardware and driver state
pub struct GpuCollector {
    smi: String,
}

impl Default for GpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuCollector {
    pub fn new() -> Self {
        Self {
            smi: "nvidia-smi".to_string(),
        }
    }

    /// Use a different nvidia-smi binary
    pub fn with_smi(mut self, program: impl Into<String>) -> Self {
        self.smi = program.into();
        self
    }
}

#[async_trait]
impl Collector for GpuCollector {
    async fn collect(&self, _deadline: &Deadline) -> Result<Measurement> {
        let output = Command::new(&self.smi)
            .arg(format!("--query-gpu={}", QUERY_FIELDS.join(",")))
            .arg("--format=csv,noheader,nounits")
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(program = %self.smi, "nvidia-smi not found, reporting no GPUs");
                return Ok(Measurement::new(MeasurementType::GPU)
                    .with_subtype(Subtype::new("smi").with("present", false)));
            }
            Err(e) => return Err(e).context("Failed to run nvidia-smi"),
        };

        if !output.status.success() {
            anyhow::bail!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_query_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse CSV rows from `nvidia-smi --query-gpu` into a measurement
fn parse_query_output(stdout: &str) -> Result<Measurement> {
    let mut gpus = Vec::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let values: Vec<&str> = line.split(',').map(str::trim).collect();
        if values.len() != QUERY_FIELDS.len() {
            anyhow::bail!(
                "unexpected nvidia-smi row with {} fields (expected {}): {}",
                values.len(),
                QUERY_FIELDS.len(),
                line
            );
        }

        let mut gpu = Subtype::new(format!("gpu{}", gpus.len()));
        for (field, value) in QUERY_FIELDS.iter().zip(values) {
            if value == "[N/A]" || value == "[Not Supported]" {
                continue;
            }
            let reading = match *field {
                // Versions and identifiers stay textual
                "name" | "uuid" | "driver_version" | "vbios_version" | "pci.bus_id" => {
                    value.into()
                }
                _ => typed_reading(value),
            };
            gpu.insert(*field, reading);
        }
        gpus.push(gpu);
    }

    let mut smi = Subtype::new("smi")
        .with("present", !gpus.is_empty())
        .with("count", gpus.len() as i64);
    if let Some(driver) = gpus.first().and_then(|g| g.get("driver_version")).cloned() {
        smi.insert("driver", driver);
    }

    let mut measurement = Measurement::new(MeasurementType::GPU).with_subtype(smi);
    measurement.subtypes.extend(gpus);
    Ok(measurement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;
    use std::time::Duration;

    const SAMPLE: &str = "0, NVIDIA H100 80GB HBM3, GPU-1111, 550.54.15, 96.00.89.00.01, 81559, 00000000:18:00.0, Enabled, Disabled\n1, NVIDIA H100 80GB HBM3, GPU-2222, 550.54.15, 96.00.89.00.01, 81559, 00000000:2A:00.0, Enabled, [N/A]\n";

    #[test]
    fn test_parse_query_output() {
        let measurement = parse_query_output(SAMPLE).unwrap();

        let smi = measurement.subtype("smi").unwrap();
        assert_eq!(smi.get("present"), Some(&Reading::Bool(true)));
        assert_eq!(smi.get("count"), Some(&Reading::Int(2)));
        assert_eq!(smi.get("driver"), Some(&Reading::String("550.54.15".into())));

        let gpu1 = measurement.subtype("gpu1").unwrap();
        assert_eq!(gpu1.get("memory.total"), Some(&Reading::Int(81559)));
        assert_eq!(gpu1.get("index"), Some(&Reading::Int(1)));
        assert!(gpu1.get("mig.mode.current").is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_rows() {
        assert!(parse_query_output("0, only-two\n").is_err());
    }

    #[tokio::test]
    async fn test_missing_smi_reports_absent() {
        let collector = GpuCollector::new().with_smi("/nonexistent/nvidia-smi");
        let measurement = collector
            .collect(&Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(
            measurement.subtype("smi").unwrap().get("present"),
            Some(&Reading::Bool(false))
        );
    }
}
