//! Policy that never assigns exclusive CPUs; every container runs on the
//! shared pool.

use super::state::State;
use super::{CpuAllocationError, Policy};
use crate::bitmask::BitMask;
use crate::models::{Container, Pod};
use crate::topology::CpuTopology;
use crate::topologymanager::ProviderHints;
use std::sync::Arc;
use tracing::info;

pub const POLICY_NONE: &str = "none";

pub struct NonePolicy {
    topology: Arc<CpuTopology>,
}

impl NonePolicy {
    pub fn new(topology: Arc<CpuTopology>) -> Self {
        Self { topology }
    }
}

impl Policy for NonePolicy {
    fn name(&self) -> &'static str {
        POLICY_NONE
    }

    fn start(&self, state: &mut dyn State) -> Result<(), CpuAllocationError> {
        if state.default_cpu_set().is_empty() {
            state.set_default_cpu_set(self.topology.all_cpus())?;
        }
        info!(policy = POLICY_NONE, "No exclusive cpu assignment");
        Ok(())
    }

    fn add_container(
        &self,
        _state: &mut dyn State,
        _pod: &Pod,
        _container: &Container,
        _container_id: &str,
        _numa_affinity: Option<&BitMask>,
    ) -> Result<(), CpuAllocationError> {
        Ok(())
    }

    fn remove_container(
        &self,
        _state: &mut dyn State,
        _container_id: &str,
    ) -> Result<(), CpuAllocationError> {
        Ok(())
    }

    fn get_topology_hints(
        &self,
        _state: &dyn State,
        _pod: &Pod,
        _container: &Container,
    ) -> ProviderHints {
        ProviderHints::new()
    }

    fn get_pod_topology_hints(&self, _state: &dyn State, _pod: &Pod) -> ProviderHints {
        ProviderHints::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumanager::state::MemoryState;
    use crate::models::test_pods::pod;
    use crate::topology::fixtures;

    #[test]
    fn test_none_policy_shares_every_cpu() {
        let policy = NonePolicy::new(Arc::new(fixtures::single_socket_ht()));
        let mut state = MemoryState::default();
        policy.start(&mut state).unwrap();
        assert_eq!(state.default_cpu_set().size(), 8);

        let p = pod("uid", "app", "2", "2");
        policy
            .add_container(&mut state, &p, &p.containers[0], "uid/app", None)
            .unwrap();
        assert!(state.cpu_assignments().is_empty());
        assert!(policy.get_topology_hints(&state, &p, &p.containers[0]).is_empty());
    }
}
