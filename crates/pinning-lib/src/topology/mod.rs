//! Machine CPU topology: sockets, physical cores, hardware threads and NUMA nodes.

pub mod discovery;

#[cfg(test)]
pub(crate) mod fixtures;

use crate::cpuset::CpuSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub use discovery::discover;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology contains no cpus")]
    Empty,

    #[error("core {core} spans sockets {first} and {second}")]
    CoreSpansSockets {
        core: usize,
        first: usize,
        second: usize,
    },

    #[error("core {core} spans numa nodes {first} and {second}")]
    CoreSpansNumaNodes {
        core: usize,
        first: usize,
        second: usize,
    },

    #[error("topology is not homogeneous: {cpus} cpus across {cores} cores and {sockets} sockets")]
    Heterogeneous {
        cpus: usize,
        cores: usize,
        sockets: usize,
    },
}

/// Placement of a single logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub socket_id: usize,
    pub core_id: usize,
    pub numa_node_id: usize,
}

impl CpuInfo {
    pub fn new(socket_id: usize, core_id: usize, numa_node_id: usize) -> Self {
        Self {
            socket_id,
            core_id,
            numa_node_id,
        }
    }
}

/// Mapping of CPU ID to its placement, with filtered views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuDetails(BTreeMap<usize, CpuInfo>);

impl CpuDetails {
    pub fn new(details: BTreeMap<usize, CpuInfo>) -> Self {
        Self(details)
    }

    pub fn get(&self, cpu: usize) -> Option<&CpuInfo> {
        self.0.get(&cpu)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a view restricted to the CPUs in `cpus`.
    pub fn keep_only(&self, cpus: &CpuSet) -> CpuDetails {
        Self(
            self.0
                .iter()
                .filter(|(cpu, _)| cpus.contains(**cpu))
                .map(|(cpu, info)| (*cpu, *info))
                .collect(),
        )
    }

    pub fn cpus(&self) -> CpuSet {
        self.0.keys().copied().collect()
    }

    pub fn numa_nodes(&self) -> BTreeSet<usize> {
        self.0.values().map(|info| info.numa_node_id).collect()
    }

    pub fn sockets(&self) -> BTreeSet<usize> {
        self.0.values().map(|info| info.socket_id).collect()
    }

    pub fn cores(&self) -> BTreeSet<usize> {
        self.0.values().map(|info| info.core_id).collect()
    }

    pub fn numa_nodes_in_sockets(&self, sockets: &[usize]) -> BTreeSet<usize> {
        self.0
            .values()
            .filter(|info| sockets.contains(&info.socket_id))
            .map(|info| info.numa_node_id)
            .collect()
    }

    pub fn cores_in_sockets(&self, sockets: &[usize]) -> BTreeSet<usize> {
        self.0
            .values()
            .filter(|info| sockets.contains(&info.socket_id))
            .map(|info| info.core_id)
            .collect()
    }

    pub fn cpus_in_numa_nodes(&self, nodes: &[usize]) -> CpuSet {
        self.cpus_where(|info| nodes.contains(&info.numa_node_id))
    }

    pub fn cpus_in_sockets(&self, sockets: &[usize]) -> CpuSet {
        self.cpus_where(|info| sockets.contains(&info.socket_id))
    }

    pub fn cpus_in_cores(&self, cores: &[usize]) -> CpuSet {
        self.cpus_where(|info| cores.contains(&info.core_id))
    }

    fn cpus_where(&self, predicate: impl Fn(&CpuInfo) -> bool) -> CpuSet {
        self.0
            .iter()
            .filter(|(_, info)| predicate(info))
            .map(|(cpu, _)| *cpu)
            .collect()
    }
}

/// Immutable description of the machine's CPUs. Safe to share behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub num_cpus: usize,
    pub num_cores: usize,
    pub num_sockets: usize,
    pub num_numa_nodes: usize,
    pub cpu_details: CpuDetails,
}

impl CpuTopology {
    /// Builds a topology from per-CPU placement.
    ///
    /// Core IDs must be unique across the machine, every core must sit in a
    /// single socket and NUMA node, and all cores/sockets must hold the same
    /// number of CPUs.
    pub fn new(details: BTreeMap<usize, CpuInfo>) -> Result<Self, TopologyError> {
        if details.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut core_placement: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for info in details.values() {
            let (socket, node) = *core_placement
                .entry(info.core_id)
                .or_insert((info.socket_id, info.numa_node_id));
            if socket != info.socket_id {
                return Err(TopologyError::CoreSpansSockets {
                    core: info.core_id,
                    first: socket,
                    second: info.socket_id,
                });
            }
            if node != info.numa_node_id {
                return Err(TopologyError::CoreSpansNumaNodes {
                    core: info.core_id,
                    first: node,
                    second: info.numa_node_id,
                });
            }
        }

        let cpu_details = CpuDetails::new(details);
        let num_cpus = cpu_details.len();
        let num_cores = cpu_details.cores().len();
        let num_sockets = cpu_details.sockets().len();
        let num_numa_nodes = cpu_details.numa_nodes().len();

        if num_cpus % num_cores != 0 || num_cpus % num_sockets != 0 {
            return Err(TopologyError::Heterogeneous {
                cpus: num_cpus,
                cores: num_cores,
                sockets: num_sockets,
            });
        }

        Ok(Self {
            num_cpus,
            num_cores,
            num_sockets,
            num_numa_nodes,
            cpu_details,
        })
    }

    pub fn cpus_per_core(&self) -> usize {
        self.num_cpus / self.num_cores
    }

    pub fn cpus_per_socket(&self) -> usize {
        self.num_cpus / self.num_sockets
    }

    pub fn all_cpus(&self) -> CpuSet {
        self.cpu_details.cpus()
    }

    /// NUMA node IDs in ascending order.
    pub fn numa_node_ids(&self) -> Vec<usize> {
        self.cpu_details.numa_nodes().into_iter().collect()
    }
}
