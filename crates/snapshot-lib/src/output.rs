//! Snapshot serialization and output destinations

use crate::models::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// URI scheme addressing a ConfigMap destination
pub const CONFIGMAP_SCHEME: &str = "cm";

/// Serialization format of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed JSON document
    #[default]
    Json,
    /// One `Type.subtype.key=value` line per reading
    Flat,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Flat => "flat",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "flat" => Ok(OutputFormat::Flat),
            other => Err(DestinationError::UnknownFormat(other.to_string())),
        }
    }
}

/// Errors from parsing output settings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    #[error("invalid ConfigMap URI '{0}', expected cm://<namespace>/<name>")]
    InvalidConfigMapUri(String),

    #[error("unknown output format '{0}'")]
    UnknownFormat(String),
}

/// Serializer capability for finished snapshots
pub trait Serializer: Send + Sync {
    fn format(&self) -> OutputFormat;

    fn serialize(&self, snapshot: &Snapshot, writer: &mut dyn Write) -> io::Result<()>;
}

/// Pretty JSON serializer
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn serialize(&self, snapshot: &Snapshot, writer: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *writer, snapshot)?;
        writeln!(writer)
    }
}

/// Line-oriented serializer
pub struct FlatSerializer;

impl Serializer for FlatSerializer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Flat
    }

    fn serialize(&self, snapshot: &Snapshot, writer: &mut dyn Write) -> io::Result<()> {
        writeln!(writer, "kind={}", snapshot.kind)?;
        writeln!(writer, "apiVersion={}", snapshot.api_version)?;
        for (key, value) in &snapshot.metadata {
            writeln!(writer, "metadata.{}={}", key, value)?;
        }
        for measurement in &snapshot.measurements {
            for subtype in &measurement.subtypes {
                for (key, reading) in &subtype.data {
                    writeln!(
                        writer,
                        "{}.{}.{}={}",
                        measurement.measurement_type, subtype.subtype, key, reading
                    )?;
                }
            }
        }
        Ok(())
    }
}

pub fn serializer_for(format: OutputFormat) -> Box<dyn Serializer> {
    match format {
        OutputFormat::Json => Box::new(JsonSerializer),
        OutputFormat::Flat => Box::new(FlatSerializer),
    }
}

/// Serialize a snapshot into memory
pub fn to_bytes(snapshot: &Snapshot, format: OutputFormat) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    serializer_for(format).serialize(snapshot, &mut buffer)?;
    Ok(buffer)
}

/// Where a serialized snapshot ends up
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputDestination {
    #[default]
    Stdout,
    File(PathBuf),
    ConfigMap { namespace: String, name: String },
}

impl OutputDestination {
    /// Parse `-`/empty (stdout), `cm://<namespace>/<name>` or a file path
    pub fn parse(raw: &str) -> Result<Self, DestinationError> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "-" {
            return Ok(OutputDestination::Stdout);
        }

        if raw.starts_with(&format!("{}://", CONFIGMAP_SCHEME)) {
            let invalid = || DestinationError::InvalidConfigMapUri(raw.to_string());
            let url = Url::parse(raw).map_err(|_| invalid())?;
            let namespace = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
            let name = url.path().trim_start_matches('/');
            if name.is_empty() || name.contains('/') {
                return Err(invalid());
            }
            return Ok(OutputDestination::ConfigMap {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        Ok(OutputDestination::File(PathBuf::from(raw)))
    }

    pub fn is_config_map(&self) -> bool {
        matches!(self, OutputDestination::ConfigMap { .. })
    }
}

impl FromStr for OutputDestination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OutputDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputDestination::Stdout => f.write_str("-"),
            OutputDestination::File(path) => write!(f, "{}", path.display()),
            OutputDestination::ConfigMap { namespace, name } => {
                write!(f, "{}://{}/{}", CONFIGMAP_SCHEME, namespace, name)
            }
        }
    }
}

/// Write bytes to stdout or a file
///
/// ConfigMap destinations need a cluster client and are handled by
/// [`crate::agent::artifact`].
pub fn write_local(destination: &OutputDestination, bytes: &[u8]) -> io::Result<()> {
    match destination {
        OutputDestination::Stdout => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()
        }
        OutputDestination::File(path) => std::fs::write(path, bytes),
        OutputDestination::ConfigMap { .. } => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} is not a local destination", destination),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Measurement, MeasurementType, Subtype};

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot
            .metadata
            .insert("source-node".to_string(), "node-a".to_string());
        snapshot.measurements.push(
            Measurement::new(MeasurementType::SystemD).with_subtype(
                Subtype::new("kubelet.service")
                    .with("ActiveState", "active")
                    .with("CPUAccounting", true),
            ),
        );
        snapshot
    }

    #[test]
    fn test_parse_destinations() {
        assert_eq!(OutputDestination::parse("").unwrap(), OutputDestination::Stdout);
        assert_eq!(OutputDestination::parse("-").unwrap(), OutputDestination::Stdout);
        assert_eq!(
            OutputDestination::parse("cm://gpu-operator/nodesnap-snapshot").unwrap(),
            OutputDestination::ConfigMap {
                namespace: "gpu-operator".to_string(),
                name: "nodesnap-snapshot".to_string(),
            }
        );
        assert_eq!(
            OutputDestination::parse("/tmp/snapshot.json").unwrap(),
            OutputDestination::File(PathBuf::from("/tmp/snapshot.json"))
        );
    }

    #[test]
    fn test_parse_rejects_malformed_configmap_uri() {
        for raw in ["cm://", "cm://ns", "cm://ns/", "cm://ns/a/b"] {
            assert!(
                matches!(
                    OutputDestination::parse(raw),
                    Err(DestinationError::InvalidConfigMapUri(_))
                ),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_destination_display_round_trip() {
        let destination = OutputDestination::parse("cm://default/snap").unwrap();
        assert_eq!(destination.to_string(), "cm://default/snap");
    }

    #[test]
    fn test_flat_serializer() {
        let bytes = to_bytes(&sample(), OutputFormat::Flat).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("kind=Snapshot\n"));
        assert!(text.contains("metadata.source-node=node-a\n"));
        assert!(text.contains("SystemD.kubelet.service.ActiveState=active\n"));
        assert!(text.contains("SystemD.kubelet.service.CPUAccounting=true\n"));
    }

    #[test]
    fn test_json_serializer_parses_back() {
        let bytes = to_bytes(&sample(), OutputFormat::Json).unwrap();
        let parsed: Snapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("flat".parse::<OutputFormat>().unwrap(), OutputFormat::Flat);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_write_local_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshot.json");

        write_local(&OutputDestination::File(path.clone()), b"{}\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}\n");

        let cm = OutputDestination::parse("cm://ns/name").unwrap();
        assert!(write_local(&cm, b"{}").is_err());
    }
}
