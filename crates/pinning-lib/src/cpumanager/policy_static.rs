//! Static policy: Guaranteed containers with whole-CPU requests get
//! exclusive CPUs; everything else shares the default pool.

use super::cpu_assignment::take_by_topology;
use super::state::{State, StateValidationError};
use super::{CpuAllocationError, Policy};
use crate::bitmask::{iterate_bit_masks, BitMask};
use crate::cpuset::CpuSet;
use crate::models::{Container, Pod, QosClass, RESOURCE_CPU};
use crate::topology::CpuTopology;
use crate::topologymanager::{ProviderHints, TopologyHint};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const POLICY_STATIC: &str = "static";

pub struct StaticPolicy {
    topology: Arc<CpuTopology>,
    /// Never handed out exclusively. Chosen by the same packing as regular
    /// allocations, so the lowest cores go first.
    reserved: CpuSet,
}

impl StaticPolicy {
    pub fn new(
        topology: Arc<CpuTopology>,
        num_reserved_cpus: usize,
    ) -> Result<Self, CpuAllocationError> {
        let all = topology.all_cpus();
        let reserved = take_by_topology(&topology, &all, num_reserved_cpus).map_err(|_| {
            CpuAllocationError::InvalidReservation {
                requested: num_reserved_cpus,
                available: all.size(),
            }
        })?;
        info!(reserved = %reserved, "Reserved cpus excluded from exclusive assignment");

        Ok(Self { topology, reserved })
    }

    pub fn reserved_cpus(&self) -> &CpuSet {
        &self.reserved
    }

    /// CPUs that may be handed out exclusively right now.
    pub fn assignable_cpus(&self, state: &dyn State) -> CpuSet {
        state.default_cpu_set().difference(&self.reserved)
    }

    fn validate_state(&self, state: &mut dyn State) -> Result<(), CpuAllocationError> {
        let assignments = state.cpu_assignments();
        let default = state.default_cpu_set();
        let all = self.topology.all_cpus();

        if default.is_empty() {
            if !assignments.is_empty() {
                return Err(StateValidationError::EmptyDefaultWithAssignments {
                    assignments: assignments.len(),
                }
                .into());
            }
            let initial = all.difference(&self.reserved);
            state.set_default_cpu_set(initial)?;
            return Ok(());
        }

        for (id, cpus) in &assignments {
            let overlap = cpus.intersection(&self.reserved);
            if !overlap.is_empty() {
                return Err(StateValidationError::ReservedOverlap {
                    reserved: self.reserved.clone(),
                    owner: format!("container {id}"),
                    overlap,
                }
                .into());
            }

            let overlap = cpus.intersection(&default);
            if !overlap.is_empty() {
                return Err(StateValidationError::AssignmentInDefault {
                    container_id: id.clone(),
                    cpus: overlap,
                }
                .into());
            }
        }

        let entries: Vec<(&String, &CpuSet)> = assignments.iter().collect();
        for (i, (first, first_cpus)) in entries.iter().enumerate() {
            for (second, second_cpus) in &entries[i + 1..] {
                let shared = first_cpus.intersection(second_cpus);
                if !shared.is_empty() {
                    return Err(StateValidationError::DuplicateAssignment {
                        first: (*first).clone(),
                        second: (*second).clone(),
                        cpus: shared,
                    }
                    .into());
                }
            }
        }

        let union = default
            .union(&self.reserved)
            .union_all(assignments.values());
        let unknown = union.difference(&all);
        if !unknown.is_empty() {
            return Err(StateValidationError::UnknownCpus { cpus: unknown }.into());
        }
        if union != all {
            return Err(StateValidationError::Mismatch {
                expected: all,
                actual: union,
            }
            .into());
        }

        Ok(())
    }

    /// Pick `num_cpus` from the assignable pool. With an affinity, CPUs on
    /// the affinity's NUMA nodes are taken first and the rest of the pool
    /// covers any shortfall.
    pub fn allocate_cpus(
        &self,
        state: &dyn State,
        num_cpus: usize,
        numa_affinity: Option<&BitMask>,
    ) -> Result<CpuSet, CpuAllocationError> {
        self.allocate_from(&self.assignable_cpus(state), num_cpus, numa_affinity)
    }

    fn allocate_from(
        &self,
        pool: &CpuSet,
        num_cpus: usize,
        numa_affinity: Option<&BitMask>,
    ) -> Result<CpuSet, CpuAllocationError> {
        let mut result = CpuSet::empty();

        if let Some(mask) = numa_affinity {
            let aligned = pool.intersection(
                &self
                    .topology
                    .cpu_details
                    .cpus_in_numa_nodes(&mask.get_bits()),
            );
            let take = num_cpus.min(aligned.size());
            result = take_by_topology(&self.topology, &aligned, take)?;
        }

        let remaining = take_by_topology(
            &self.topology,
            &pool.difference(&result),
            num_cpus - result.size(),
        )?;
        let result = result.union(&remaining);

        debug!(cpus = %result, "Allocated cpus");
        Ok(result)
    }

    /// Whole CPUs the container is entitled to exclusively; 0 unless the pod
    /// is Guaranteed and the cpu request is an integer.
    pub fn guaranteed_cpus(pod: &Pod, container: &Container) -> usize {
        if pod.qos_class() != QosClass::Guaranteed {
            return 0;
        }
        match container.resources.request(RESOURCE_CPU) {
            Some(q) if q.milli_value() % 1000 == 0 => q.value() as usize,
            _ => 0,
        }
    }

    /// Pod-wide exclusive CPU demand: init containers run one at a time, app
    /// containers together.
    fn pod_guaranteed_cpus(pod: &Pod) -> usize {
        let init = pod
            .init_containers
            .iter()
            .map(|c| Self::guaranteed_cpus(pod, c))
            .max()
            .unwrap_or(0);
        let app: usize = pod
            .containers
            .iter()
            .map(|c| Self::guaranteed_cpus(pod, c))
            .sum();
        init.max(app)
    }

    /// Exclusive CPUs held by the pod's init containers other than `container`.
    fn init_container_cpus(&self, state: &dyn State, pod: &Pod, container: &Container) -> CpuSet {
        pod.init_containers
            .iter()
            .filter(|init| init.name != container.name)
            .filter_map(|init| state.cpu_set(&pod.container_id(&init.name)))
            .fold(CpuSet::empty(), |acc, cpus| acc.union(&cpus))
    }

    /// Init containers have finished by the time a later container starts,
    /// so their CPUs go back to the pool.
    fn release_init_containers(
        &self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Result<(), CpuAllocationError> {
        for init in &pod.init_containers {
            if init.name == container.name {
                continue;
            }
            let id = pod.container_id(&init.name);
            if state.cpu_set(&id).is_some() {
                debug!(container_id = %id, "Releasing cpus of finished init container");
                self.remove_container(state, &id)?;
            }
        }
        Ok(())
    }

    fn generate_cpu_topology_hints(&self, available: &CpuSet, request: usize) -> Vec<TopologyHint> {
        let details = &self.topology.cpu_details;
        let numa_nodes = self.topology.numa_node_ids();
        let mut min_affinity_size = numa_nodes.len();
        let mut hints = Vec::new();

        iterate_bit_masks(&numa_nodes, |mask| {
            let bits = mask.get_bits();
            if details.cpus_in_numa_nodes(&bits).size() >= request && mask.count() < min_affinity_size {
                min_affinity_size = mask.count();
            }

            let matching = available
                .iter()
                .filter(|&cpu| details.get(cpu).is_some_and(|info| mask.is_set(info.numa_node_id)))
                .count();
            if matching >= request {
                hints.push(TopologyHint::new(Some(mask), false));
            }
        });

        for hint in &mut hints {
            hint.preferred = hint
                .numa_node_affinity
                .is_some_and(|mask| mask.count() == min_affinity_size);
        }
        hints
    }

    fn cpu_hints(hints: Vec<TopologyHint>) -> ProviderHints {
        ProviderHints::from([(RESOURCE_CPU.to_string(), Some(hints))])
    }
}

impl Policy for StaticPolicy {
    fn name(&self) -> &'static str {
        POLICY_STATIC
    }

    fn start(&self, state: &mut dyn State) -> Result<(), CpuAllocationError> {
        self.validate_state(state).inspect_err(|err| {
            warn!(error = %err, "Invalid cpu manager state");
        })
    }

    fn add_container(
        &self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
        container_id: &str,
        numa_affinity: Option<&BitMask>,
    ) -> Result<(), CpuAllocationError> {
        let num_cpus = Self::guaranteed_cpus(pod, container);
        if num_cpus == 0 {
            return Ok(());
        }

        info!(
            pod = %pod.name,
            container = %container.name,
            container_id = %container_id,
            cpus = num_cpus,
            "Static policy: adding container"
        );

        if state.cpu_set(container_id).is_some() {
            info!(container_id = %container_id, "Container already present in state, skipping");
            return Ok(());
        }

        let pool = self
            .assignable_cpus(state)
            .union(&self.init_container_cpus(state, pod, container).difference(&self.reserved));
        let cpus = self.allocate_from(&pool, num_cpus, numa_affinity)?;

        self.release_init_containers(state, pod, container)?;
        state.set_cpu_set(container_id, cpus.clone())?;
        if let Err(err) = state.set_default_cpu_set(state.default_cpu_set().difference(&cpus)) {
            state.delete(container_id)?;
            return Err(err.into());
        }

        info!(container_id = %container_id, cpus = %cpus, "Assigned exclusive cpus");
        Ok(())
    }

    fn remove_container(
        &self,
        state: &mut dyn State,
        container_id: &str,
    ) -> Result<(), CpuAllocationError> {
        let Some(cpus) = state.cpu_set(container_id) else {
            return Ok(());
        };

        info!(container_id = %container_id, cpus = %cpus, "Static policy: releasing cpus");
        state.set_default_cpu_set(state.default_cpu_set().union(&cpus))?;
        state.delete(container_id)?;
        Ok(())
    }

    fn get_topology_hints(
        &self,
        state: &dyn State,
        pod: &Pod,
        container: &Container,
    ) -> ProviderHints {
        if container.resources.request(RESOURCE_CPU).is_none() {
            return ProviderHints::new();
        }
        let requested = Self::guaranteed_cpus(pod, container);
        if requested == 0 {
            return ProviderHints::new();
        }

        let id = pod.container_id(&container.name);
        if let Some(allocated) = state.cpu_set(&id) {
            if allocated.size() != requested {
                warn!(
                    container_id = %id,
                    allocated = allocated.size(),
                    requested,
                    "Container already holds a different number of cpus"
                );
                return Self::cpu_hints(Vec::new());
            }
            return Self::cpu_hints(self.generate_cpu_topology_hints(&allocated, requested));
        }

        let available = self
            .assignable_cpus(state)
            .union(&self.init_container_cpus(state, pod, container).difference(&self.reserved));
        Self::cpu_hints(self.generate_cpu_topology_hints(&available, requested))
    }

    fn get_pod_topology_hints(&self, state: &dyn State, pod: &Pod) -> ProviderHints {
        let requested = Self::pod_guaranteed_cpus(pod);
        if requested == 0 {
            return ProviderHints::new();
        }

        let mut assigned = CpuSet::empty();
        for container in pod.all_containers() {
            if let Some(allocated) = state.cpu_set(&pod.container_id(&container.name)) {
                if allocated.size() != Self::guaranteed_cpus(pod, container) {
                    return Self::cpu_hints(Vec::new());
                }
                assigned = assigned.union(&allocated);
            }
        }
        if assigned.size() == requested {
            return Self::cpu_hints(self.generate_cpu_topology_hints(&assigned, requested));
        }

        let available = self.assignable_cpus(state).union(&assigned);
        Self::cpu_hints(self.generate_cpu_topology_hints(&available, requested))
    }
}
