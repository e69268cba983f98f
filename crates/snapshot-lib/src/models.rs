//! Core data models for node snapshots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind written into every snapshot header
pub const SNAPSHOT_KIND: &str = "Snapshot";

/// Schema version of the snapshot document
pub const SNAPSHOT_API_VERSION: &str = "nodesnap.dev/v1alpha1";

/// Well-known metadata keys
pub mod metadata_keys {
    pub const SOURCE_NODE: &str = "source-node";
    pub const TIMESTAMP: &str = "timestamp";
    pub const VERSION: &str = "version";
}

/// Data source category a measurement was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MeasurementType {
    K8s,
    GPU,
    OS,
    SystemD,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 4] = [
        MeasurementType::K8s,
        MeasurementType::GPU,
        MeasurementType::OS,
        MeasurementType::SystemD,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementType::K8s => "K8s",
            MeasurementType::GPU => "GPU",
            MeasurementType::OS => "OS",
            MeasurementType::SystemD => "SystemD",
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Bool(v) => write!(f, "{}", v),
            Reading::Int(v) => write!(f, "{}", v),
            Reading::Float(v) => write!(f, "{}", v),
            Reading::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Reading {
    fn from(value: &str) -> Self {
        Reading::String(value.to_string())
    }
}

impl From<String> for Reading {
    fn from(value: String) -> Self {
        Reading::String(value)
    }
}

impl From<bool> for Reading {
    fn from(value: bool) -> Self {
        Reading::Bool(value)
    }
}

impl From<i64> for Reading {
    fn from(value: i64) -> Self {
        Reading::Int(value)
    }
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Reading::Float(value)
    }
}

/// Named group of readings inside a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtype {
    pub subtype: String,
    #[serde(default)]
    pub data: BTreeMap<String, Reading>,
}

impl Subtype {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            subtype: name.into(),
            data: BTreeMap::new(),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Reading>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Reading>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Reading> {
        self.data.get(key)
    }
}

/// Facts from one data source category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "type")]
    pub measurement_type: MeasurementType,
    #[serde(default)]
    pub subtypes: Vec<Subtype>,
}

impl Measurement {
    pub fn new(measurement_type: MeasurementType) -> Self {
        Self {
            measurement_type,
            subtypes: Vec::new(),
        }
    }

    pub fn with_subtype(mut self, subtype: Subtype) -> Self {
        self.subtypes.push(subtype);
        self
    }

    pub fn subtype(&self, name: &str) -> Option<&Subtype> {
        self.subtypes.iter().find(|s| s.subtype == name)
    }
}

/// Point-in-time configuration snapshot of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            kind: SNAPSHOT_KIND.to_string(),
            api_version: SNAPSHOT_API_VERSION.to_string(),
            metadata: BTreeMap::new(),
            measurements: Vec::new(),
        }
    }

    pub fn measurement(&self, measurement_type: MeasurementType) -> Option<&Measurement> {
        self.measurements
            .iter()
            .find(|m| m.measurement_type == measurement_type)
    }

    /// Look up one value by its (type, subtype, key) address
    pub fn reading(
        &self,
        measurement_type: MeasurementType,
        subtype: &str,
        key: &str,
    ) -> Option<&Reading> {
        self.measurement(measurement_type)?.subtype(subtype)?.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.measurements.push(
            Measurement::new(MeasurementType::OS).with_subtype(
                Subtype::new("release")
                    .with("ID", "ubuntu")
                    .with("VERSION_ID", "22.04"),
            ),
        );
        snapshot.measurements.push(
            Measurement::new(MeasurementType::GPU)
                .with_subtype(Subtype::new("smi").with("present", true).with("count", 8i64)),
        );
        snapshot
    }

    #[test]
    fn test_snapshot_header_defaults() {
        let snapshot = Snapshot::new();
        assert_eq!(snapshot.kind, "Snapshot");
        assert_eq!(snapshot.api_version, SNAPSHOT_API_VERSION);
        assert!(snapshot.measurements.is_empty());
    }

    #[test]
    fn test_reading_lookup_by_address() {
        let snapshot = sample();
        assert_eq!(
            snapshot.reading(MeasurementType::OS, "release", "ID"),
            Some(&Reading::String("ubuntu".into()))
        );
        assert_eq!(
            snapshot.reading(MeasurementType::GPU, "smi", "count"),
            Some(&Reading::Int(8))
        );
        assert!(snapshot.reading(MeasurementType::K8s, "server", "version").is_none());
        assert!(snapshot.reading(MeasurementType::OS, "grub", "ID").is_none());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["apiVersion"], SNAPSHOT_API_VERSION);
        assert_eq!(json["measurements"][0]["type"], "OS");
        assert_eq!(json["measurements"][1]["subtypes"][0]["data"]["present"], true);
    }

    #[test]
    fn test_untagged_readings_keep_scalar_types() {
        let subtype: Subtype = serde_json::from_str(
            r#"{"subtype":"x","data":{"a":true,"b":3,"c":1.5,"d":"text"}}"#,
        )
        .unwrap();
        assert_eq!(subtype.get("a"), Some(&Reading::Bool(true)));
        assert_eq!(subtype.get("b"), Some(&Reading::Int(3)));
        assert_eq!(subtype.get("c"), Some(&Reading::Float(1.5)));
        assert_eq!(subtype.get("d"), Some(&Reading::String("text".into())));
    }
}
