//! CPU assignment state: the shared pool plus per-container exclusive sets

use crate::checkpoint::{read_checkpoint, write_checkpoint, CheckpointError, CheckpointStore};
use crate::cpuset::CpuSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Container ID to its exclusive CPUs.
pub type ContainerCpuAssignments = BTreeMap<String, CpuSet>;

pub const CPU_CHECKPOINT_KEY: &str = "cpu_manager_state";

/// Inconsistent CPU state found at startup. Always fatal: the agent refuses
/// to run rather than risk double-assigning CPUs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateValidationError {
    #[error("default cpu set is empty while {assignments} containers hold exclusive cpus")]
    EmptyDefaultWithAssignments { assignments: usize },

    #[error("reserved cpus {reserved} overlap with {owner} ({overlap})")]
    ReservedOverlap {
        reserved: CpuSet,
        owner: String,
        overlap: CpuSet,
    },

    #[error("container {container_id} cpus {cpus} overlap with the default cpu set")]
    AssignmentInDefault { container_id: String, cpus: CpuSet },

    #[error("containers {first} and {second} share cpus {cpus}")]
    DuplicateAssignment {
        first: String,
        second: String,
        cpus: CpuSet,
    },

    #[error("cpus {cpus} in state are not present in the machine topology")]
    UnknownCpus { cpus: CpuSet },

    #[error("current set of available cpus {expected} does not match cpus in state {actual}")]
    Mismatch { expected: CpuSet, actual: CpuSet },

    #[error("configured policy '{configured}' differs from state checkpoint policy '{checkpoint}'")]
    PolicyMismatch {
        configured: String,
        checkpoint: String,
    },
}

/// Read/write access to the CPU assignment state.
///
/// Writers return an error only when the change could not be persisted; the
/// in-memory view is left unchanged in that case.
pub trait State: Send {
    fn cpu_set(&self, container_id: &str) -> Option<CpuSet>;

    fn default_cpu_set(&self) -> CpuSet;

    fn cpu_assignments(&self) -> ContainerCpuAssignments;

    fn set_cpu_set(&mut self, container_id: &str, cpus: CpuSet) -> Result<(), CheckpointError>;

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<(), CheckpointError>;

    fn set_cpu_assignments(
        &mut self,
        assignments: ContainerCpuAssignments,
    ) -> Result<(), CheckpointError>;

    fn delete(&mut self, container_id: &str) -> Result<(), CheckpointError>;

    fn clear_state(&mut self) -> Result<(), CheckpointError>;

    /// Exclusive set of the container, or the shared pool when it has none.
    fn cpu_set_or_default(&self, container_id: &str) -> CpuSet {
        self.cpu_set(container_id)
            .unwrap_or_else(|| self.default_cpu_set())
    }
}

/// Plain in-memory state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryState {
    pub assignments: ContainerCpuAssignments,
    pub default_cpu_set: CpuSet,
}

impl State for MemoryState {
    fn cpu_set(&self, container_id: &str) -> Option<CpuSet> {
        self.assignments.get(container_id).cloned()
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.default_cpu_set.clone()
    }

    fn cpu_assignments(&self) -> ContainerCpuAssignments {
        self.assignments.clone()
    }

    fn set_cpu_set(&mut self, container_id: &str, cpus: CpuSet) -> Result<(), CheckpointError> {
        self.assignments.insert(container_id.to_string(), cpus);
        Ok(())
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<(), CheckpointError> {
        self.default_cpu_set = cpus;
        Ok(())
    }

    fn set_cpu_assignments(
        &mut self,
        assignments: ContainerCpuAssignments,
    ) -> Result<(), CheckpointError> {
        self.assignments = assignments;
        Ok(())
    }

    fn delete(&mut self, container_id: &str) -> Result<(), CheckpointError> {
        self.assignments.remove(container_id);
        Ok(())
    }

    fn clear_state(&mut self) -> Result<(), CheckpointError> {
        self.assignments.clear();
        self.default_cpu_set = CpuSet::empty();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CpuManagerCheckpoint {
    policy_name: String,
    default_cpu_set: CpuSet,
    #[serde(default)]
    entries: ContainerCpuAssignments,
}

/// State persisted to a checkpoint store after every mutation.
pub struct CheckpointState {
    cache: MemoryState,
    policy_name: String,
    store: Arc<dyn CheckpointStore>,
    key: String,
}

impl CheckpointState {
    /// Restore state from `store`, or start empty when no checkpoint exists.
    ///
    /// A checkpoint written by a different policy is rejected.
    pub fn restore(
        store: Arc<dyn CheckpointStore>,
        key: &str,
        policy_name: &str,
    ) -> Result<Self, RestoreError> {
        let mut cache = MemoryState::default();

        if let Some(checkpoint) = read_checkpoint::<CpuManagerCheckpoint>(store.as_ref(), key)? {
            if checkpoint.policy_name != policy_name {
                return Err(StateValidationError::PolicyMismatch {
                    configured: policy_name.to_string(),
                    checkpoint: checkpoint.policy_name,
                }
                .into());
            }
            cache.default_cpu_set = checkpoint.default_cpu_set;
            cache.assignments = checkpoint.entries;
            info!(
                default = %cache.default_cpu_set,
                assignments = cache.assignments.len(),
                "Restored cpu manager state from checkpoint"
            );
        }

        Ok(Self {
            cache,
            policy_name: policy_name.to_string(),
            store,
            key: key.to_string(),
        })
    }

    fn store_state(&self, state: &MemoryState) -> Result<(), CheckpointError> {
        let checkpoint = CpuManagerCheckpoint {
            policy_name: self.policy_name.clone(),
            default_cpu_set: state.default_cpu_set.clone(),
            entries: state.assignments.clone(),
        };
        write_checkpoint(self.store.as_ref(), &self.key, &checkpoint)
    }

    /// Apply `change` to a copy of the cache, persist it, then commit.
    fn update(&mut self, change: impl FnOnce(&mut MemoryState)) -> Result<(), CheckpointError> {
        let mut next = self.cache.clone();
        change(&mut next);
        self.store_state(&next)?;
        self.cache = next;
        Ok(())
    }
}

/// Failure restoring checkpointed CPU state.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Invalid(#[from] StateValidationError),
}

impl State for CheckpointState {
    fn cpu_set(&self, container_id: &str) -> Option<CpuSet> {
        self.cache.cpu_set(container_id)
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.cache.default_cpu_set()
    }

    fn cpu_assignments(&self) -> ContainerCpuAssignments {
        self.cache.cpu_assignments()
    }

    fn set_cpu_set(&mut self, container_id: &str, cpus: CpuSet) -> Result<(), CheckpointError> {
        self.update(|s| {
            s.assignments.insert(container_id.to_string(), cpus);
        })
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<(), CheckpointError> {
        self.update(|s| s.default_cpu_set = cpus)
    }

    fn set_cpu_assignments(
        &mut self,
        assignments: ContainerCpuAssignments,
    ) -> Result<(), CheckpointError> {
        self.update(|s| s.assignments = assignments)
    }

    fn delete(&mut self, container_id: &str) -> Result<(), CheckpointError> {
        self.update(|s| {
            s.assignments.remove(container_id);
        })
    }

    fn clear_state(&mut self) -> Result<(), CheckpointError> {
        self.update(|s| {
            s.assignments.clear();
            s.default_cpu_set = CpuSet::empty();
        })
    }
}
