//! Node-level facade wiring the CPU, device and topology managers together.
//!
//! [`NodeResourceManager`] restores every manager from the checkpoint store,
//! registers the CPU and device managers as hint providers and exposes the
//! admission, removal and inspection entry points the agent serves.

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::cpumanager::{CpuAllocationError, CpuManager, CpuPolicyKind};
use crate::devicemanager::{
    Device, DeviceAllocationError, DeviceManager, PodDevices, PreferredAllocator,
};
use crate::models::Pod;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::topology::CpuTopology;
use crate::topologymanager::{
    AllocationError, PodAdmitResult, PodTopologyHints, Policy, PolicyKind, Scope,
    TopologyManager, ERR_UNEXPECTED_ADMISSION,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Policy selection for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResourceConfig {
    pub node_name: String,
    pub cpu_policy: CpuPolicyKind,
    pub reserved_cpus: usize,
    pub topology_policy: PolicyKind,
    pub scope: Scope,
}

impl Default for NodeResourceConfig {
    fn default() -> Self {
        Self {
            node_name: "unknown".to_string(),
            cpu_policy: CpuPolicyKind::Static,
            reserved_cpus: 1,
            topology_policy: PolicyKind::BestEffort,
            scope: Scope::Container,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cpu manager: {0}")]
    Cpu(#[from] CpuAllocationError),

    #[error("device manager checkpoint: {0}")]
    Device(#[from] CheckpointError),
}

impl StartupError {
    /// Name of the health component that failed.
    pub fn component(&self) -> &'static str {
        match self {
            StartupError::Cpu(_) => crate::health::components::CPU_MANAGER,
            StartupError::Device(_) => crate::health::components::DEVICE_MANAGER,
        }
    }
}

/// Everything the node currently hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_name: String,
    pub cpu_policy: String,
    pub topology_policy: String,
    pub scope: String,
    pub num_cpus: usize,
    pub numa_nodes: Vec<usize>,
    pub reserved_cpus: usize,
    /// Shared pool, in cpuset list format.
    pub default_cpu_set: String,
    pub cpu_assignments: BTreeMap<String, String>,
    pub device_allocations: PodDevices,
    pub registered_devices: BTreeMap<String, Vec<Device>>,
    pub topology_hints: PodTopologyHints,
}

pub struct NodeResourceManager {
    config: NodeResourceConfig,
    cpu_manager: Arc<CpuManager>,
    device_manager: Arc<DeviceManager>,
    topology_manager: TopologyManager,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl NodeResourceManager {
    /// Restore all managers from `store` and validate the CPU state.
    ///
    /// Any error is fatal: the caller must not serve admissions.
    pub fn new(
        topology: Arc<CpuTopology>,
        config: NodeResourceConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, StartupError> {
        let logger = StructuredLogger::new(&config.node_name);
        let numa_nodes = topology.numa_node_ids();

        let cpu_manager = CpuManager::with_checkpoint(
            config.cpu_policy,
            topology.clone(),
            config.reserved_cpus,
            store.clone(),
        )
        .and_then(|manager| manager.start().map(|()| manager))
        .inspect_err(|err| {
            logger.log_state_invalid(crate::health::components::CPU_MANAGER, &err.to_string())
        })?;
        let cpu_manager = Arc::new(cpu_manager);

        let device_manager = DeviceManager::with_checkpoint(numa_nodes.clone(), store)
            .inspect_err(|err| {
                logger.log_state_invalid(crate::health::components::DEVICE_MANAGER, &err.to_string())
            })?;
        let device_manager = Arc::new(device_manager);

        let mut topology_manager =
            TopologyManager::new(Policy::new(config.topology_policy, numa_nodes), config.scope);
        topology_manager.add_hint_provider(cpu_manager.clone());
        topology_manager.add_hint_provider(device_manager.clone());

        let metrics = AgentMetrics::new();
        metrics.set_policy_info(
            config.cpu_policy.as_str(),
            config.topology_policy.as_str(),
            config.scope.as_str(),
        );

        let manager = Self {
            config,
            cpu_manager,
            device_manager,
            topology_manager,
            metrics,
            logger,
        };
        manager.refresh_gauges();
        Ok(manager)
    }

    pub fn config(&self) -> &NodeResourceConfig {
        &self.config
    }

    pub fn cpu_manager(&self) -> &CpuManager {
        &self.cpu_manager
    }

    pub fn device_manager(&self) -> &DeviceManager {
        &self.device_manager
    }

    pub fn topology_manager(&self) -> &TopologyManager {
        &self.topology_manager
    }

    /// Admit `pod` and allocate its resources.
    ///
    /// A rejected pod that was not admitted before keeps nothing: whatever
    /// its earlier containers were given is released before returning.
    pub fn admit(&self, pod: &Pod) -> PodAdmitResult {
        let started = Instant::now();
        let known = self.topology_manager.has_pod(&pod.uid);
        let mut result = self.topology_manager.admit(pod);
        let elapsed = started.elapsed().as_secs_f64();

        if result.admit {
            self.metrics.observe_admission("admitted", elapsed);
            self.logger.log_pod_admitted(
                &pod.uid,
                &pod.name,
                &pod.namespace,
                pod.all_containers().count(),
            );
        } else {
            let reason = result.reason.as_deref().unwrap_or_default();
            let outcome = if reason == ERR_UNEXPECTED_ADMISSION {
                self.metrics.inc_allocation_errors();
                "error"
            } else {
                "rejected"
            };
            self.metrics.observe_admission(outcome, elapsed);
            self.logger.log_pod_rejected(
                &pod.uid,
                &pod.name,
                reason,
                result.message.as_deref().unwrap_or_default(),
            );

            if known {
                warn!(pod_uid = %pod.uid, "Keeping resources of previously admitted pod");
            } else if let Err(err) = self.release_pod(&pod.uid) {
                warn!(pod_uid = %pod.uid, error = %err, "Failed to release resources of rejected pod");
                result.checkpoint_failed = true;
            }
        }
        if result.checkpoint_failed {
            self.metrics.inc_checkpoint_errors();
        }

        self.refresh_gauges();
        result
    }

    /// Release every CPU, device and hint held by the pod.
    pub fn remove_pod(&self, pod_uid: &str) -> Result<(), AllocationError> {
        let released = self.release_pod(pod_uid);
        self.refresh_gauges();
        released.inspect_err(|_| self.metrics.inc_checkpoint_errors())?;

        self.metrics.inc_pods_removed();
        self.logger.log_pod_removed(pod_uid);
        Ok(())
    }

    /// Drop the resources of every pod not in `active_pods`. Returns the
    /// UIDs that were released.
    pub fn remove_stale_pods<'a>(
        &self,
        active_pods: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, AllocationError> {
        let active: BTreeSet<&str> = active_pods.into_iter().collect();

        let mut stale: BTreeSet<String> = self
            .cpu_manager
            .assignments()
            .into_keys()
            .filter_map(|id| id.split_once('/').map(|(uid, _)| uid.to_string()))
            .filter(|uid| !active.contains(uid.as_str()))
            .collect();
        stale.extend(
            self.topology_manager
                .hints_snapshot()
                .into_keys()
                .filter(|uid| !active.contains(uid.as_str())),
        );
        stale.extend(
            self.device_manager
                .update_allocated_devices(active.iter().copied())?,
        );

        for uid in &stale {
            self.remove_pod(uid)?;
        }
        if !stale.is_empty() {
            warn!(pods = ?stale, "Released resources of inactive pods");
        }
        Ok(stale.into_iter().collect())
    }

    pub fn register_devices(
        &self,
        resource: &str,
        devices: Vec<Device>,
        allocator: Option<Arc<dyn PreferredAllocator>>,
    ) -> Result<(), DeviceAllocationError> {
        let count = devices.len();
        self.device_manager
            .register_devices(resource, devices, allocator)
            .inspect_err(|_| self.metrics.inc_checkpoint_errors())?;
        self.logger.log_devices_registered(resource, count);
        Ok(())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let topology = self.cpu_manager.topology();
        NodeSnapshot {
            node_name: self.config.node_name.clone(),
            cpu_policy: self.cpu_manager.policy_name().to_string(),
            topology_policy: self.topology_manager.policy().name().to_string(),
            scope: self.topology_manager.scope().as_str().to_string(),
            num_cpus: topology.num_cpus,
            numa_nodes: topology.numa_node_ids(),
            reserved_cpus: self.config.reserved_cpus,
            default_cpu_set: self.cpu_manager.default_cpu_set().to_string(),
            cpu_assignments: self
                .cpu_manager
                .assignments()
                .into_iter()
                .map(|(id, cpus)| (id, cpus.to_string()))
                .collect(),
            device_allocations: self.device_manager.allocations(),
            registered_devices: self.device_manager.registered_devices(),
            topology_hints: self.topology_manager.hints_snapshot(),
        }
    }

    /// Log the configured policies.
    pub fn log_startup(&self, version: &str) {
        self.logger.log_startup(
            version,
            self.config.cpu_policy.as_str(),
            self.config.topology_policy.as_str(),
            self.config.scope.as_str(),
        );
        info!(
            cpus = self.cpu_manager.topology().num_cpus,
            shared = %self.cpu_manager.default_cpu_set(),
            "Node resource manager ready"
        );
    }

    fn release_pod(&self, pod_uid: &str) -> Result<(), AllocationError> {
        self.topology_manager.remove_pod(pod_uid);
        let cpu = self.cpu_manager.remove_pod(pod_uid);
        let device = self.device_manager.remove_pod(pod_uid);
        cpu?;
        device?;
        Ok(())
    }

    fn refresh_gauges(&self) {
        let exclusive: usize = self
            .cpu_manager
            .assignments()
            .values()
            .map(|cpus| cpus.size())
            .sum();
        self.metrics
            .set_cpu_pools(exclusive, self.cpu_manager.default_cpu_set().size());
        self.metrics
            .set_allocated_devices(&self.device_manager.allocated_counts());
    }
}
