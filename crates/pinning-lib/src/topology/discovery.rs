//! CPU topology discovery from sysfs
//!
//! Reads:
//! - devices/system/cpu/online for the set of usable CPUs
//! - devices/system/cpu/cpuN/topology/{physical_package_id,core_id}
//! - devices/system/node/nodeM/cpulist for NUMA placement

use super::{CpuInfo, CpuTopology};
use crate::cpuset::CpuSet;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Discover the machine topology below `sysfs_root` (normally `/sys`).
///
/// Kernel core IDs are only unique within a package, so each physical core is
/// renumbered to the lowest logical CPU ID it contains. Machines without
/// NUMA information are treated as one NUMA node per socket.
pub async fn discover(sysfs_root: &Path) -> Result<CpuTopology> {
    let cpu_dir = sysfs_root.join("devices/system/cpu");
    let online = read_cpu_list(&cpu_dir.join("online")).await?;
    let numa = read_numa_placement(&sysfs_root.join("devices/system/node")).await?;

    let mut raw: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for cpu in online.iter() {
        let topology_dir = cpu_dir.join(format!("cpu{cpu}/topology"));
        let socket = read_id(&topology_dir.join("physical_package_id")).await?;
        let core = read_id(&topology_dir.join("core_id")).await?;
        raw.insert(cpu, (socket, core));
    }

    let details = assign_core_ids(&raw, &numa);
    let topology = CpuTopology::new(details).context("Inconsistent cpu topology in sysfs")?;

    info!(
        cpus = topology.num_cpus,
        cores = topology.num_cores,
        sockets = topology.num_sockets,
        numa_nodes = topology.num_numa_nodes,
        "Discovered CPU topology"
    );

    Ok(topology)
}

/// Turn raw (socket, kernel core id) pairs into globally unique placements.
pub fn assign_core_ids(
    raw: &BTreeMap<usize, (usize, usize)>,
    numa: &BTreeMap<usize, usize>,
) -> BTreeMap<usize, CpuInfo> {
    let mut first_cpu: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for (&cpu, &pair) in raw {
        first_cpu.entry(pair).or_insert(cpu);
    }

    raw.iter()
        .map(|(&cpu, &(socket, core))| {
            let core_id = first_cpu[&(socket, core)];
            let numa_node = numa.get(&cpu).copied().unwrap_or(socket);
            (cpu, CpuInfo::new(socket, core_id, numa_node))
        })
        .collect()
}

async fn read_numa_placement(node_dir: &Path) -> Result<BTreeMap<usize, usize>> {
    let mut placement = BTreeMap::new();

    let mut entries = match fs::read_dir(node_dir).await {
        Ok(entries) => entries,
        Err(_) => {
            debug!(path = %node_dir.display(), "No NUMA information, using sockets");
            return Ok(placement);
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(node) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };

        let cpus = read_cpu_list(&entry.path().join("cpulist")).await?;
        for cpu in cpus.iter() {
            placement.insert(cpu, node);
        }
    }

    Ok(placement)
}

async fn read_cpu_list(path: &Path) -> Result<CpuSet> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .parse()
        .with_context(|| format!("Failed to parse cpu list in {}", path.display()))
}

async fn read_id(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {}", path.display()))
}
