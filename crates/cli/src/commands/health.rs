//! `pinctl health`: component health of the agent

use anyhow::Result;
use chrono::DateTime;
use colored::Colorize;
use pinning_lib::HealthResponse;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

fn component_rows(health: &HealthResponse) -> Vec<ComponentRow> {
    let mut rows: Vec<ComponentRow> = health
        .components
        .iter()
        .map(|(name, component)| ComponentRow {
            component: name.clone(),
            status: color_status(component.status.as_str()),
            message: component.message.clone().unwrap_or_else(|| "-".to_string()),
            last_check: DateTime::from_timestamp(component.last_check_timestamp, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    rows.sort_by(|a, b| a.component.cmp(&b.component));
    rows
}

/// Show agent health
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!(
                "{} {}",
                "Agent status:".bold(),
                color_status(health.status.as_str())
            );
            print_table(component_rows(&health), "No components reported");
        }
    }
    Ok(())
}
