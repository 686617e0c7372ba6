//! Device manager: topology-aware allocation of extended resources
//!
//! Devices come from device plugins through [`DeviceManager::register_devices`].
//! The manager answers NUMA hints for every registered resource a container
//! requests and, once a pod is admitted, picks concrete devices close to the
//! merged hint. Allocations are checkpointed after every change.

mod allocate;
pub mod pod_devices;
pub mod registry;
mod topology_hints;

pub use pod_devices::{ContainerDevices, DeviceAllocation, PodDevices, ResourceDeviceIds};
pub use registry::{Device, DeviceHealth, DeviceRegistry, PreferredAllocator};

use crate::checkpoint::{read_checkpoint, write_checkpoint, CheckpointError, CheckpointStore};
use crate::models::{Container, Pod};
use crate::topologymanager::{AllocationError, HintProvider, ProviderHints, TopologyHint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEVICE_CHECKPOINT_KEY: &str = "device_manager_checkpoint";

#[derive(Debug, Error)]
pub enum DeviceAllocationError {
    #[error("cannot allocate unregistered device {resource}")]
    Unregistered { resource: String },

    #[error("requested number of devices unavailable for {resource}. Requested: {requested}, Available: {available}")]
    Unavailable {
        resource: String,
        requested: usize,
        available: usize,
    },

    #[error("unexpectedly allocated less resources than required for {resource}. Requested: {requested}, Got: {got}")]
    Shortfall {
        resource: String,
        requested: usize,
        got: usize,
    },

    #[error("preferred allocation for {resource} failed: {message}")]
    PreferredAllocation { resource: String, message: String },

    #[error("failed to persist device allocations: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceCheckpoint {
    #[serde(default)]
    pod_devices: PodDevices,
    #[serde(default)]
    registered_devices: BTreeMap<String, Vec<Device>>,
}

#[derive(Default)]
struct Inner {
    registry: DeviceRegistry,
    pod_devices: PodDevices,
    /// Devices released by finished init containers, per pod. Only the pod
    /// currently being admitted keeps an entry.
    devices_to_reuse: BTreeMap<String, ResourceDeviceIds>,
}

impl Inner {
    /// Healthy devices of `resource` not held by any container.
    fn available_devices(&self, resource: &str) -> BTreeSet<String> {
        let healthy = self.registry.healthy_devices(resource);
        match self.pod_devices.devices().get(resource) {
            Some(allocated) => healthy.difference(allocated).cloned().collect(),
            None => healthy,
        }
    }

    fn checkpoint(&self) -> DeviceCheckpoint {
        DeviceCheckpoint {
            pod_devices: self.pod_devices.clone(),
            registered_devices: self.registry.snapshot(),
        }
    }
}

pub struct DeviceManager {
    numa_nodes: Vec<usize>,
    inner: Mutex<Inner>,
    store: Arc<dyn CheckpointStore>,
}

impl DeviceManager {
    pub fn new(numa_nodes: Vec<usize>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            numa_nodes,
            inner: Mutex::new(Inner::default()),
            store,
        }
    }

    /// Build a manager from the last checkpoint in `store`, if any.
    ///
    /// Restored devices stay unhealthy until their plugin registers again, so
    /// nothing new is handed out from a resource whose plugin is gone.
    pub fn with_checkpoint(
        numa_nodes: Vec<usize>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, CheckpointError> {
        let manager = Self::new(numa_nodes, store);
        if let Some(checkpoint) =
            read_checkpoint::<DeviceCheckpoint>(manager.store.as_ref(), DEVICE_CHECKPOINT_KEY)?
        {
            let mut inner = manager.lock_inner();
            for (resource, devices) in checkpoint.registered_devices {
                inner.registry.restore(&resource, devices);
            }
            inner.pod_devices = checkpoint.pod_devices;
            info!(
                pods = inner.pod_devices.pods().len(),
                resources = inner.registry.resources().count(),
                "Restored device manager state from checkpoint"
            );
        }
        Ok(manager)
    }

    pub fn register_devices(
        &self,
        resource: &str,
        devices: Vec<Device>,
        allocator: Option<Arc<dyn PreferredAllocator>>,
    ) -> Result<(), DeviceAllocationError> {
        let mut inner = self.lock_inner();
        inner.registry.register(resource, devices, allocator);
        self.write_checkpoint(&inner)?;
        Ok(())
    }

    /// Returns `false` when the device is unknown.
    pub fn update_device_health(&self, resource: &str, device_id: &str, health: DeviceHealth) -> bool {
        self.lock_inner()
            .registry
            .update_health(resource, device_id, health)
    }

    /// Allocate every registered device resource the container asks for,
    /// constrained by `hint`. Either all resources are recorded or none.
    pub fn allocate(
        &self,
        pod: &Pod,
        container: &Container,
        hint: &TopologyHint,
    ) -> Result<(), DeviceAllocationError> {
        let mut inner = self.lock_inner();

        inner.devices_to_reuse.retain(|uid, _| *uid == pod.uid);
        let reuse = inner
            .devices_to_reuse
            .get(&pod.uid)
            .cloned()
            .unwrap_or_default();

        let mut planned: Vec<(String, BTreeSet<String>)> = Vec::new();
        for (resource, required) in container.extended_resources() {
            if !inner.registry.is_registered(resource) {
                continue;
            }
            let empty = BTreeSet::new();
            let reusable = reuse.get(resource).unwrap_or(&empty);
            let devices = inner.devices_to_allocate(
                &pod.uid,
                &container.name,
                resource,
                required as usize,
                reusable,
                hint,
            )?;
            planned.push((resource.to_string(), devices));
        }

        if !planned.is_empty() {
            let previous = inner.pod_devices.clone();
            for (resource, device_ids) in &planned {
                inner.pod_devices.insert(
                    &pod.uid,
                    &container.name,
                    resource,
                    DeviceAllocation {
                        device_ids: device_ids.clone(),
                        numa_affinity: hint.numa_node_affinity,
                    },
                );
            }
            if let Err(err) = self.write_checkpoint(&inner) {
                inner.pod_devices = previous;
                return Err(err.into());
            }
            for (resource, device_ids) in &planned {
                info!(
                    pod_uid = %pod.uid,
                    container = %container.name,
                    resource = %resource,
                    devices = ?device_ids,
                    "Allocated devices"
                );
            }
        }

        let Inner {
            pod_devices,
            devices_to_reuse,
            ..
        } = &mut *inner;
        let reuse = devices_to_reuse.entry(pod.uid.clone()).or_default();
        if pod.is_init_container(&container.name) {
            pod_devices.add_container_allocated_resources(&pod.uid, &container.name, reuse);
        } else {
            pod_devices.remove_container_allocated_resources(&pod.uid, &container.name, reuse);
        }
        Ok(())
    }

    /// Release every device of the pod. Returns whether it held any.
    pub fn remove_pod(&self, pod_uid: &str) -> Result<bool, DeviceAllocationError> {
        let mut inner = self.lock_inner();
        inner.devices_to_reuse.remove(pod_uid);
        if !inner.pod_devices.remove_pod(pod_uid) {
            return Ok(false);
        }
        self.write_checkpoint(&inner)?;
        info!(pod_uid = %pod_uid, "Released pod devices");
        Ok(true)
    }

    /// Drop allocations of pods that are no longer active. Returns the UIDs
    /// that were removed.
    pub fn update_allocated_devices<'a>(
        &self,
        active_pods: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, DeviceAllocationError> {
        let active: BTreeSet<&str> = active_pods.into_iter().collect();
        let mut inner = self.lock_inner();

        let stale: Vec<String> = inner
            .pod_devices
            .pods()
            .into_iter()
            .filter(|uid| !active.contains(uid.as_str()))
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        for uid in &stale {
            inner.pod_devices.remove_pod(uid);
            inner.devices_to_reuse.remove(uid);
        }
        self.write_checkpoint(&inner)?;
        warn!(pods = ?stale, "Removed device allocations of inactive pods");
        Ok(stale)
    }

    pub fn container_devices(
        &self,
        pod_uid: &str,
        container_name: &str,
        resource: &str,
    ) -> Option<BTreeSet<String>> {
        self.lock_inner()
            .pod_devices
            .container_devices(pod_uid, container_name, resource)
            .cloned()
    }

    pub fn allocations(&self) -> PodDevices {
        self.lock_inner().pod_devices.clone()
    }

    pub fn registered_devices(&self) -> BTreeMap<String, Vec<Device>> {
        self.lock_inner().registry.snapshot()
    }

    /// Number of allocated devices per resource.
    pub fn allocated_counts(&self) -> BTreeMap<String, usize> {
        self.lock_inner()
            .pod_devices
            .devices()
            .into_iter()
            .map(|(resource, ids)| (resource, ids.len()))
            .collect()
    }

    fn write_checkpoint(&self, inner: &Inner) -> Result<(), CheckpointError> {
        write_checkpoint(self.store.as_ref(), DEVICE_CHECKPOINT_KEY, &inner.checkpoint())
            .inspect_err(|err| warn!(error = %err, "Failed to write device manager checkpoint"))?;
        debug!("Device manager checkpoint written");
        Ok(())
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HintProvider for DeviceManager {
    fn name(&self) -> &'static str {
        "device_manager"
    }

    fn get_topology_hints(&self, pod: &Pod, container: &Container) -> ProviderHints {
        self.lock_inner()
            .container_hints(&self.numa_nodes, pod, container)
    }

    fn get_pod_topology_hints(&self, pod: &Pod) -> ProviderHints {
        self.lock_inner().pod_hints(&self.numa_nodes, pod)
    }

    fn allocate(
        &self,
        pod: &Pod,
        container: &Container,
        hint: &TopologyHint,
    ) -> Result<(), AllocationError> {
        DeviceManager::allocate(self, pod, container, hint)?;
        Ok(())
    }
}
