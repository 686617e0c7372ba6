//! `pinctl register`: hand a device list to the agent

use anyhow::Result;
use pinning_lib::devicemanager::Device;
use std::path::Path;

use super::read_json;
use crate::client::ApiClient;
use crate::output::{print_json, print_success, OutputFormat};

/// Register (or replace) the devices of `resource` from a JSON array file
pub async fn register(
    client: &ApiClient,
    resource: &str,
    file: &Path,
    format: OutputFormat,
) -> Result<()> {
    let devices: Vec<Device> = read_json(file)?;
    client.register_devices(resource, &devices).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "resource": resource,
            "devices": devices.len(),
        }))?,
        OutputFormat::Table => {
            let aligned = devices.iter().filter(|d| d.has_topology()).count();
            print_success(&format!(
                "Registered {} devices for {} ({} with NUMA affinity)",
                devices.len(),
                resource,
                aligned
            ));
        }
    }
    Ok(())
}
