//! CPU manager: exclusive CPU assignment for Guaranteed pods
//!
//! The manager owns a policy and the assignment state behind one mutex, and
//! acts as a topology hint provider for the `cpu` resource.

pub mod cpu_assignment;
pub mod policy_none;
pub mod policy_static;
pub mod state;

pub use cpu_assignment::take_by_topology;
pub use policy_none::NonePolicy;
pub use policy_static::StaticPolicy;
pub use state::{
    CheckpointState, ContainerCpuAssignments, MemoryState, RestoreError, State,
    StateValidationError, CPU_CHECKPOINT_KEY,
};

use crate::bitmask::BitMask;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::cpuset::CpuSet;
use crate::models::{container_id, Container, Pod};
use crate::topology::CpuTopology;
use crate::topologymanager::{AllocationError, HintProvider, ProviderHints, TopologyHint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CpuAllocationError {
    #[error("not enough cpus available to satisfy request")]
    NotEnoughCpus,

    #[error("cannot reserve {requested} cpus on a machine with {available}")]
    InvalidReservation { requested: usize, available: usize },

    #[error("failed to persist cpu assignments: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    InvalidState(#[from] StateValidationError),
}

impl CpuAllocationError {
    /// Errors the agent must not continue past.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CpuAllocationError::InvalidState(_))
    }
}

impl From<RestoreError> for CpuAllocationError {
    fn from(err: RestoreError) -> Self {
        match err {
            RestoreError::Checkpoint(e) => CpuAllocationError::Checkpoint(e),
            RestoreError::Invalid(e) => CpuAllocationError::InvalidState(e),
        }
    }
}

/// A CPU assignment strategy.
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate or initialize `state`. Called once before any other hook.
    fn start(&self, state: &mut dyn State) -> Result<(), CpuAllocationError>;

    fn add_container(
        &self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
        container_id: &str,
        numa_affinity: Option<&BitMask>,
    ) -> Result<(), CpuAllocationError>;

    fn remove_container(
        &self,
        state: &mut dyn State,
        container_id: &str,
    ) -> Result<(), CpuAllocationError>;

    fn get_topology_hints(&self, state: &dyn State, pod: &Pod, container: &Container)
        -> ProviderHints;

    fn get_pod_topology_hints(&self, state: &dyn State, pod: &Pod) -> ProviderHints;
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown cpu manager policy '{0}'")]
pub struct UnknownCpuPolicyError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuPolicyKind {
    None,
    Static,
}

impl CpuPolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuPolicyKind::None => policy_none::POLICY_NONE,
            CpuPolicyKind::Static => policy_static::POLICY_STATIC,
        }
    }
}

impl fmt::Display for CpuPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuPolicyKind {
    type Err = UnknownCpuPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CpuPolicyKind::None),
            "static" => Ok(CpuPolicyKind::Static),
            other => Err(UnknownCpuPolicyError(other.to_string())),
        }
    }
}

pub struct CpuManager {
    policy: Box<dyn Policy>,
    state: Mutex<Box<dyn State>>,
    topology: Arc<CpuTopology>,
}

impl CpuManager {
    pub fn new(policy: Box<dyn Policy>, state: Box<dyn State>, topology: Arc<CpuTopology>) -> Self {
        Self {
            policy,
            state: Mutex::new(state),
            topology,
        }
    }

    /// Build a manager whose state is restored from, and persisted to, `store`.
    pub fn with_checkpoint(
        kind: CpuPolicyKind,
        topology: Arc<CpuTopology>,
        reserved_cpus: usize,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, CpuAllocationError> {
        let policy: Box<dyn Policy> = match kind {
            CpuPolicyKind::None => Box::new(NonePolicy::new(topology.clone())),
            CpuPolicyKind::Static => Box::new(StaticPolicy::new(topology.clone(), reserved_cpus)?),
        };
        let state = CheckpointState::restore(store, CPU_CHECKPOINT_KEY, policy.name())?;
        Ok(Self::new(policy, Box::new(state), topology))
    }

    /// Validate restored state. A fatal error here means the state cannot be
    /// trusted and the process must stop.
    pub fn start(&self) -> Result<(), CpuAllocationError> {
        let mut state = self.lock_state();
        self.policy.start(state.as_mut())?;
        info!(
            policy = self.policy.name(),
            default = %state.default_cpu_set(),
            assignments = state.cpu_assignments().len(),
            "CPU manager started"
        );
        Ok(())
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    pub fn add_container(
        &self,
        pod: &Pod,
        container: &Container,
        numa_affinity: Option<&BitMask>,
    ) -> Result<(), CpuAllocationError> {
        let id = pod.container_id(&container.name);
        let mut state = self.lock_state();
        self.policy
            .add_container(state.as_mut(), pod, container, &id, numa_affinity)
    }

    pub fn remove_container(&self, container_id: &str) -> Result<(), CpuAllocationError> {
        let mut state = self.lock_state();
        self.policy.remove_container(state.as_mut(), container_id)
    }

    /// Free the CPUs of every container belonging to `pod_uid`.
    pub fn remove_pod(&self, pod_uid: &str) -> Result<(), CpuAllocationError> {
        let prefix = container_id(pod_uid, "");
        let mut state = self.lock_state();
        let ids: Vec<String> = state
            .cpu_assignments()
            .into_keys()
            .filter(|id| id.starts_with(&prefix))
            .collect();
        for id in ids {
            self.policy.remove_container(state.as_mut(), &id)?;
        }
        Ok(())
    }

    pub fn cpu_set(&self, container_id: &str) -> Option<CpuSet> {
        self.lock_state().cpu_set(container_id)
    }

    pub fn default_cpu_set(&self) -> CpuSet {
        self.lock_state().default_cpu_set()
    }

    pub fn assignments(&self) -> ContainerCpuAssignments {
        self.lock_state().cpu_assignments()
    }

    fn lock_state(&self) -> MutexGuard<'_, Box<dyn State>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HintProvider for CpuManager {
    fn name(&self) -> &'static str {
        "cpu_manager"
    }

    fn get_topology_hints(&self, pod: &Pod, container: &Container) -> ProviderHints {
        let state = self.lock_state();
        self.policy.get_topology_hints(state.as_ref(), pod, container)
    }

    fn get_pod_topology_hints(&self, pod: &Pod) -> ProviderHints {
        let state = self.lock_state();
        self.policy.get_pod_topology_hints(state.as_ref(), pod)
    }

    fn allocate(
        &self,
        pod: &Pod,
        container: &Container,
        hint: &TopologyHint,
    ) -> Result<(), AllocationError> {
        self.add_container(pod, container, hint.numa_node_affinity.as_ref())?;
        Ok(())
    }
}
