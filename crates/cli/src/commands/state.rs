//! `pinctl state`: CPU assignments and device allocations of the node

use anyhow::Result;
use colored::Colorize;
use pinning_lib::cpuset::CpuSet;
use tabled::Tabled;

use crate::client::{ApiClient, NodeState};
use crate::output::{format_hint, format_numa, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct CpuRow {
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "CPUs")]
    cpus: String,
    #[tabled(rename = "Count")]
    count: usize,
    #[tabled(rename = "NUMA")]
    numa: String,
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "Pod")]
    pod: String,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Devices")]
    devices: String,
    #[tabled(rename = "NUMA")]
    numa: String,
}

#[derive(Tabled)]
struct RegisteredRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "NUMA")]
    numa: String,
}

fn cpu_count(list: &str) -> usize {
    list.parse::<CpuSet>().map(|set| set.size()).unwrap_or(0)
}

fn cpu_rows(state: &NodeState) -> Vec<CpuRow> {
    let snapshot = &state.snapshot;
    snapshot
        .cpu_assignments
        .iter()
        .map(|(id, cpus)| {
            let hint = id.split_once('/').and_then(|(pod, container)| {
                snapshot.topology_hints.get(pod)?.get(container)
            });
            CpuRow {
                container: id.clone(),
                cpus: cpus.clone(),
                count: cpu_count(cpus),
                numa: format_hint(hint),
            }
        })
        .collect()
}

fn device_rows(state: &NodeState) -> Vec<DeviceRow> {
    state
        .snapshot
        .device_allocations
        .iter()
        .map(|(pod, container, resource, allocation)| DeviceRow {
            pod: pod.to_string(),
            container: container.to_string(),
            resource: resource.to_string(),
            devices: allocation
                .device_ids
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            numa: format_numa(allocation.numa_affinity.as_ref()),
        })
        .collect()
}

fn registered_rows(state: &NodeState) -> Vec<RegisteredRow> {
    state
        .snapshot
        .registered_devices
        .iter()
        .flat_map(|(resource, devices)| {
            devices.iter().map(move |device| RegisteredRow {
                resource: resource.clone(),
                device: device.id.clone(),
                health: crate::output::color_status(&device.health.to_string()),
                numa: if device.topology.is_empty() {
                    "-".to_string()
                } else {
                    device
                        .topology
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                },
            })
        })
        .collect()
}

/// Show the node's current assignments
pub async fn show_state(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let state = client.state().await?;

    match format {
        OutputFormat::Json => print_json(&state)?,
        OutputFormat::Table => {
            let snapshot = &state.snapshot;
            println!("{}", "Node State".bold());
            println!("{}", "=".repeat(60));
            println!("Node:            {}", snapshot.node_name.cyan());
            println!("CPU policy:      {}", snapshot.cpu_policy);
            println!(
                "Topology policy: {} (scope {})",
                snapshot.topology_policy, snapshot.scope
            );
            println!(
                "CPUs:            {} on NUMA nodes {:?}",
                snapshot.num_cpus, snapshot.numa_nodes
            );
            println!(
                "Shared pool:     {} ({} cpus)",
                snapshot.default_cpu_set,
                cpu_count(&snapshot.default_cpu_set)
            );
            println!(
                "As of:           {}",
                state.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );

            println!("\n{}", "Exclusive CPUs".bold());
            print_table(cpu_rows(&state), "No exclusive CPU assignments");

            println!("\n{}", "Device Allocations".bold());
            print_table(device_rows(&state), "No devices allocated");

            println!("\n{}", "Registered Devices".bold());
            print_table(registered_rows(&state), "No device plugins registered");
        }
    }

    Ok(())
}
