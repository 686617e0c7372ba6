//! Topology-aware selection of exclusive CPUs.
//!
//! Whole sockets are taken first, then whole physical cores, then single
//! hardware threads packed next to what was already chosen.

use super::CpuAllocationError;
use crate::cpuset::CpuSet;
use crate::topology::{CpuDetails, CpuTopology};
use std::cmp::Reverse;

struct CpuAccumulator<'a> {
    topology: &'a CpuTopology,
    details: CpuDetails,
    num_cpus_needed: usize,
    result: CpuSet,
}

impl<'a> CpuAccumulator<'a> {
    fn new(topology: &'a CpuTopology, available: &CpuSet, num_cpus: usize) -> Self {
        Self {
            topology,
            details: topology.cpu_details.keep_only(available),
            num_cpus_needed: num_cpus,
            result: CpuSet::empty(),
        }
    }

    fn take(&mut self, cpus: &CpuSet) {
        self.result = self.result.union(cpus);
        self.details = self.details.keep_only(&self.details.cpus().difference(&self.result));
        self.num_cpus_needed -= cpus.size();
    }

    fn is_socket_free(&self, socket: usize) -> bool {
        self.details.cpus_in_sockets(&[socket]).size() == self.topology.cpus_per_socket()
    }

    fn is_core_free(&self, core: usize) -> bool {
        self.details.cpus_in_cores(&[core]).size() == self.topology.cpus_per_core()
    }

    /// Fully available sockets in ascending ID order.
    fn free_sockets(&self) -> Vec<usize> {
        self.details
            .sockets()
            .into_iter()
            .filter(|&s| self.is_socket_free(s))
            .collect()
    }

    /// Fully available cores, grouped by socket. Sockets with fewer free
    /// cores come first so partially used sockets are drained before
    /// untouched ones; ties break on socket ID, cores ascend within a socket.
    fn free_cores(&self) -> Vec<usize> {
        let mut sockets: Vec<(usize, Vec<usize>)> = self
            .details
            .sockets()
            .into_iter()
            .map(|socket| {
                let cores: Vec<usize> = self
                    .details
                    .cores_in_sockets(&[socket])
                    .into_iter()
                    .filter(|&c| self.is_core_free(c))
                    .collect();
                (socket, cores)
            })
            .collect();
        sockets.sort_by_key(|(socket, cores)| (cores.len(), *socket));

        sockets.into_iter().flat_map(|(_, cores)| cores).collect()
    }

    /// Remaining available CPUs in preference order.
    ///
    /// Cores are ranked by: sockets already holding result CPUs first, then
    /// sockets with fewer available CPUs, then cores with fewer available
    /// CPUs, then socket ID and core ID. CPUs ascend within a core.
    fn free_cpus(&self) -> Vec<usize> {
        let all = &self.topology.cpu_details;
        let socket_of = |core: usize| {
            all.cpus_in_cores(&[core])
                .iter()
                .next()
                .and_then(|cpu| all.get(cpu))
                .map_or(0, |info| info.socket_id)
        };

        let mut cores: Vec<usize> = self.details.cores().into_iter().collect();
        cores.sort_by_key(|&core| {
            let socket = socket_of(core);
            let colocated = all.cpus_in_sockets(&[socket]).intersection(&self.result).size();
            (
                Reverse(colocated),
                self.details.cpus_in_sockets(&[socket]).size(),
                self.details.cpus_in_cores(&[core]).size(),
                socket,
                core,
            )
        });

        cores
            .into_iter()
            .flat_map(|core| self.details.cpus_in_cores(&[core]).to_vec())
            .collect()
    }

    fn needs(&self, n: usize) -> bool {
        self.num_cpus_needed >= n
    }

    fn is_satisfied(&self) -> bool {
        self.num_cpus_needed < 1
    }

    fn is_failed(&self) -> bool {
        self.num_cpus_needed > self.details.cpus().size()
    }
}

/// Pick `num_cpus` CPUs from `available`, preferring whole sockets, then
/// whole cores, then threads packed on already-used sockets and cores.
pub fn take_by_topology(
    topology: &CpuTopology,
    available: &CpuSet,
    num_cpus: usize,
) -> Result<CpuSet, CpuAllocationError> {
    let mut acc = CpuAccumulator::new(topology, available, num_cpus);
    if acc.is_satisfied() {
        return Ok(acc.result);
    }
    if acc.is_failed() {
        return Err(CpuAllocationError::NotEnoughCpus);
    }

    if acc.needs(topology.cpus_per_socket()) {
        for socket in acc.free_sockets() {
            if !acc.needs(topology.cpus_per_socket()) {
                break;
            }
            let cpus = acc.details.cpus_in_sockets(&[socket]);
            acc.take(&cpus);
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
        }
    }

    if acc.needs(topology.cpus_per_core()) {
        for core in acc.free_cores() {
            if !acc.needs(topology.cpus_per_core()) {
                break;
            }
            let cpus = acc.details.cpus_in_cores(&[core]);
            acc.take(&cpus);
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
        }
    }

    for cpu in acc.free_cpus() {
        if acc.needs(1) {
            acc.take(&CpuSet::new([cpu]));
        }
        if acc.is_satisfied() {
            return Ok(acc.result);
        }
    }

    Err(CpuAllocationError::NotEnoughCpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::fixtures;

    #[test]
    fn test_take_zero_cpus() {
        let topo = fixtures::single_socket_ht();
        assert_eq!(take_by_topology(&topo, &topo.all_cpus(), 0).unwrap(), CpuSet::empty());
    }

    #[test]
    fn test_take_more_than_available() {
        let topo = fixtures::single_socket_ht();
        let err = take_by_topology(&topo, &CpuSet::new([0, 2, 4, 6]), 5).unwrap_err();
        assert_eq!(err.to_string(), "not enough cpus available to satisfy request");
    }

    #[test]
    fn test_take_one_cpu_from_full_socket() {
        let topo = fixtures::single_socket_ht();
        assert_eq!(
            take_by_topology(&topo, &topo.all_cpus(), 1).unwrap(),
            CpuSet::new([0])
        );
    }

    #[test]
    fn test_take_one_cpu_prefers_partially_used_core() {
        let topo = fixtures::single_socket_ht();
        let available = CpuSet::new([1, 3, 5, 6, 7]);
        assert_eq!(take_by_topology(&topo, &available, 1).unwrap(), CpuSet::new([6]));
    }

    #[test]
    fn test_take_whole_core() {
        let topo = fixtures::single_socket_ht();
        assert_eq!(
            take_by_topology(&topo, &topo.all_cpus(), 2).unwrap(),
            CpuSet::new([0, 4])
        );
    }

    #[test]
    fn test_take_whole_socket() {
        let topo = fixtures::dual_socket_ht();
        assert_eq!(
            take_by_topology(&topo, &topo.all_cpus(), 6).unwrap(),
            CpuSet::new([0, 2, 4, 6, 8, 10])
        );
    }

    #[test]
    fn test_take_socket_then_core() {
        let topo = fixtures::dual_socket_ht();
        assert_eq!(
            take_by_topology(&topo, &topo.all_cpus(), 8).unwrap(),
            CpuSet::new([0, 1, 2, 4, 6, 7, 8, 10])
        );
    }

    #[test]
    fn test_take_cores_from_fuller_socket_first() {
        let topo = fixtures::dual_socket_ht();
        // Socket 0 has one free core left, socket 1 has three.
        let available = CpuSet::new([0, 6, 1, 3, 5, 7, 9, 11]);
        assert_eq!(
            take_by_topology(&topo, &available, 2).unwrap(),
            CpuSet::new([0, 6])
        );
    }

    #[test]
    fn test_take_whole_socket_on_24_cpu_machine() {
        let topo = fixtures::dual_socket_six_core_ht();
        let expected = CpuSet::new([0, 1, 2, 3, 4, 5, 12, 13, 14, 15, 16, 17]);
        assert_eq!(take_by_topology(&topo, &topo.all_cpus(), 12).unwrap(), expected);
    }

    #[test]
    fn test_take_free_socket_over_scattered_cpus() {
        let topo = fixtures::dual_socket_six_core_ht();
        let socket1 = CpuSet::new([6, 7, 8, 9, 10, 11, 18, 19, 20, 21, 22, 23]);
        let available = socket1.union(&CpuSet::new([0, 2, 14]));
        assert_eq!(take_by_topology(&topo, &available, 12).unwrap(), socket1);
    }
}
