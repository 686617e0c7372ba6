//! `pinctl admit` and `pinctl remove`

use anyhow::Result;
use pinning_lib::Pod;
use std::path::Path;

use super::read_json;
use crate::client::ApiClient;
use crate::output::{color_status, print_error, print_json, print_success, OutputFormat};

/// Submit a pod for admission. A rejection is reported and returned as an error.
pub async fn admit(client: &ApiClient, file: &Path, format: OutputFormat) -> Result<()> {
    let pod: Pod = read_json(file)?;
    let result = client.admit(&pod).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table if result.admit => {
            print_success(&format!("Pod {} {}", pod.name, color_status("admitted")));
        }
        OutputFormat::Table => {
            print_error(&format!(
                "Pod {} {}: {}",
                pod.name,
                color_status("rejected"),
                result.reason.as_deref().unwrap_or("unknown reason")
            ));
            if let Some(message) = &result.message {
                eprintln!("  {}", message);
            }
        }
    }

    if !result.admit {
        anyhow::bail!("admission rejected");
    }
    Ok(())
}

/// Release every CPU and device held by the pod
pub async fn remove(client: &ApiClient, pod_uid: &str, format: OutputFormat) -> Result<()> {
    client.remove_pod(pod_uid).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "removed": pod_uid }))?,
        OutputFormat::Table => print_success(&format!("Released resources of pod {}", pod_uid)),
    }
    Ok(())
}
