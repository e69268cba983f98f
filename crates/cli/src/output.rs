//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use snapshot_lib::models::Snapshot;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON document (default)
    #[default]
    Json,
    /// One Type.subtype.key=value line per reading
    Flat,
    /// Table for terminals
    Table,
}

impl OutputFormat {
    /// Serialization used for storage; the table is rendered from JSON
    pub fn serialization(self) -> snapshot_lib::OutputFormat {
        match self {
            OutputFormat::Json | OutputFormat::Table => snapshot_lib::OutputFormat::Json,
            OutputFormat::Flat => snapshot_lib::OutputFormat::Flat,
        }
    }
}

/// Row for snapshot table
#[derive(Tabled)]
struct ReadingRow {
    #[tabled(rename = "Type")]
    measurement: String,
    #[tabled(rename = "Subtype")]
    subtype: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Render a snapshot as a header plus one table row per reading
pub fn render_snapshot_table(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for (key, value) in &snapshot.metadata {
        out.push_str(&format!("{}: {}\n", key.bold(), value.cyan()));
    }

    let rows: Vec<ReadingRow> = snapshot
        .measurements
        .iter()
        .flat_map(|m| {
            m.subtypes.iter().flat_map(move |s| {
                s.data.iter().map(move |(key, reading)| ReadingRow {
                    measurement: m.measurement_type.to_string(),
                    subtype: s.subtype.clone(),
                    key: key.clone(),
                    value: reading.to_string(),
                })
            })
        })
        .collect();

    if rows.is_empty() {
        out.push_str(&format!("{}\n", "No readings collected".yellow()));
        return out;
    }

    let count = rows.len();
    out.push_str(&Table::new(rows).with(Style::rounded()).to_string());
    out.push_str(&format!("\n\nTotal: {} readings\n", count));
    out
}

/// Print a success message
pub fn print_success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    eprintln!("{} {}", "ℹ".blue().bold(), message);
}
