//! Machine shapes shared by the unit tests.

use super::{CpuInfo, CpuTopology};
use std::collections::BTreeMap;

fn build(cpus: impl IntoIterator<Item = (usize, CpuInfo)>) -> CpuTopology {
    CpuTopology::new(cpus.into_iter().collect::<BTreeMap<_, _>>()).unwrap()
}

/// 1 socket, 4 cores, 2 threads per core. CPU `i` sits on core `i % 4`.
pub fn single_socket_ht() -> CpuTopology {
    build((0..8).map(|cpu| (cpu, CpuInfo::new(0, cpu % 4, 0))))
}

/// 2 sockets, 6 cores, 2 threads per core. CPU `i` sits on core `i % 6`,
/// socket and NUMA node `i % 2`.
pub fn dual_socket_ht() -> CpuTopology {
    build((0..12).map(|cpu| (cpu, CpuInfo::new(cpu % 2, cpu % 6, cpu % 2))))
}

/// 2 sockets, 8 cores, no hyperthreading. CPUs 0-3 on socket 0, 4-7 on socket 1.
pub fn dual_socket_no_ht() -> CpuTopology {
    build((0..8).map(|cpu| (cpu, CpuInfo::new(cpu / 4, cpu, cpu / 4))))
}

/// 2 sockets, 6 cores each, 2 threads per core: 24 CPUs laid out the way
/// Linux enumerates them. CPUs 0-5 and 12-17 on socket 0, 6-11 and 18-23 on
/// socket 1; CPU `i` and `i + 12` are siblings.
pub fn dual_socket_six_core_ht() -> CpuTopology {
    build((0..24).map(|cpu| {
        let core = cpu % 12;
        (cpu, CpuInfo::new(core / 6, core, core / 6))
    }))
}
