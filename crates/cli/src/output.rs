//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use pinning_lib::{bitmask::BitMask, topologymanager::TopologyHint};
use serde::{Deserialize, Serialize};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print any response as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a rounded table, or a notice when there are no rows
pub fn print_table<T: tabled::Tabled>(rows: Vec<T>, empty: &str) {
    if rows.is_empty() {
        print_info(empty);
        return;
    }
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// NUMA nodes of a mask, e.g. `0,1`
pub fn format_numa(mask: Option<&BitMask>) -> String {
    match mask {
        Some(mask) => mask
            .get_bits()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
        None => "any".to_string(),
    }
}

/// Affinity of an admission hint, marked when it was not preferred
pub fn format_hint(hint: Option<&TopologyHint>) -> String {
    match hint {
        Some(hint) => {
            let numa = format_numa(hint.numa_node_affinity.as_ref());
            if hint.preferred {
                numa
            } else {
                format!("{} {}", numa, "(not preferred)".yellow())
            }
        }
        None => "-".to_string(),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "admitted" => status.green().to_string(),
        "degraded" => status.yellow().to_string(),
        "unhealthy" | "rejected" | "error" => status.red().to_string(),
        _ => status.to_string(),
    }
}
