//! Operating system facts
//!
//! Reads os-release, the kernel command line, loaded kernel modules and a
//! fixed set of sysctl values from the host filesystem.

use super::{typed_reading, Collector};
use crate::deadline::Deadline;
use crate::models::{Measurement, MeasurementType, Subtype};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// sysctl entries captured under the `sysctl` subtype
const SYSCTL_KEYS: &[&str] = &[
    "kernel/osrelease",
    "kernel/pid_max",
    "kernel/numa_balancing",
    "vm/max_map_count",
    "vm/swappiness",
    "vm/nr_hugepages",
    "net/ipv4/ip_forward",
    "net/core/somaxconn",
    "fs/file-max",
    "fs/inotify/max_user_watches",
];

/// Collector for operating system configuration
pub struct OsCollector {
    host_root: PathBuf,
    proc_root: PathBuf,
}

impl OsCollector {
    pub fn new(host_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
            proc_root: proc_root.into(),
        }
    }

    async fn release(&self) -> Result<Subtype> {
        let candidates = [
            self.host_root.join("etc/os-release"),
            self.host_root.join("usr/lib/os-release"),
        ];

        for path in &candidates {
            if let Some(content) = read_optional(path).await? {
                return Ok(parse_os_release(&content));
            }
        }

        anyhow::bail!(
            "os-release not found under {}",
            self.host_root.display()
        )
    }

    async fn grub(&self) -> Result<Option<Subtype>> {
        let path = self.proc_root.join("cmdline");
        Ok(read_optional(&path).await?.map(|c| parse_cmdline(&c)))
    }

    async fn kmod(&self) -> Result<Option<Subtype>> {
        let path = self.proc_root.join("modules");
        Ok(read_optional(&path).await?.map(|c| parse_modules(&c)))
    }

    async fn sysctl(&self) -> Result<Subtype> {
        let mut subtype = Subtype::new("sysctl");
        for key in SYSCTL_KEYS {
            let path = self.proc_root.join("sys").join(key);
            if let Some(value) = read_optional(&path).await? {
                subtype.insert(format!("/proc/sys/{}", key), typed_reading(&value));
            }
        }
        Ok(subtype)
    }
}

#[async_trait]
impl Collector for OsCollector {
    async fn collect(&self, _deadline: &Deadline) -> Result<Measurement> {
        let mut measurement =
            Measurement::new(MeasurementType::OS).with_subtype(self.release().await?);

        if let Some(grub) = self.grub().await? {
            measurement.subtypes.push(grub);
        }
        if let Some(kmod) = self.kmod().await? {
            measurement.subtypes.push(kmod);
        }
        measurement.subtypes.push(self.sysctl().await?);

        Ok(measurement)
    }
}

/// Read a file, treating "not found" as absent
async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Skipping missing file");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Parse os-release `KEY=value` lines
fn parse_os_release(content: &str) -> Subtype {
    let mut subtype = Subtype::new("release");
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            subtype.insert(key.trim(), value);
        }
    }
    subtype
}

/// Parse the kernel command line; bare flags map to an empty value
fn parse_cmdline(content: &str) -> Subtype {
    let mut subtype = Subtype::new("grub");
    for token in content.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => subtype.insert(key, value),
            None => subtype.insert(token, ""),
        }
    }
    subtype
}

/// Parse /proc/modules into loaded module names
fn parse_modules(content: &str) -> Subtype {
    let mut subtype = Subtype::new("kmod");
    for name in content.lines().filter_map(|l| l.split_whitespace().next()) {
        subtype.insert(name, true);
    }
    subtype
}
