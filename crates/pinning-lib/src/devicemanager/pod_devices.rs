//! Record of which devices each container holds

use crate::bitmask::BitMask;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAllocation {
    pub device_ids: BTreeSet<String>,
    /// Affinity of the hint the allocation was made under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numa_affinity: Option<BitMask>,
}

/// Resource name to allocation.
pub type ContainerDevices = BTreeMap<String, DeviceAllocation>;

/// Device reuse candidates of one pod, resource name to device IDs.
pub type ResourceDeviceIds = BTreeMap<String, BTreeSet<String>>;

/// Pod UID to container name to resource to allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodDevices(BTreeMap<String, BTreeMap<String, ContainerDevices>>);

impl PodDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        resource: &str,
        allocation: DeviceAllocation,
    ) {
        self.0
            .entry(pod_uid.to_string())
            .or_default()
            .entry(container_name.to_string())
            .or_default()
            .insert(resource.to_string(), allocation);
    }

    pub fn container_devices(
        &self,
        pod_uid: &str,
        container_name: &str,
        resource: &str,
    ) -> Option<&BTreeSet<String>> {
        self.container_allocations(pod_uid, container_name)?
            .get(resource)
            .map(|a| &a.device_ids)
    }

    pub fn container_allocations(&self, pod_uid: &str, container_name: &str) -> Option<&ContainerDevices> {
        self.0.get(pod_uid)?.get(container_name)
    }

    /// Devices of `resource` held by any container of the pod.
    pub fn pod_devices(&self, pod_uid: &str, resource: &str) -> BTreeSet<String> {
        self.0
            .get(pod_uid)
            .into_iter()
            .flat_map(|containers| containers.values())
            .filter_map(|devices| devices.get(resource))
            .flat_map(|a| a.device_ids.iter().cloned())
            .collect()
    }

    pub fn has_pod(&self, pod_uid: &str) -> bool {
        self.0.contains_key(pod_uid)
    }

    pub fn pods(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    pub fn remove_pod(&mut self, pod_uid: &str) -> bool {
        self.0.remove(pod_uid).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(pod uid, container name, resource, allocation)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, &DeviceAllocation)> + '_ {
        self.0.iter().flat_map(|(pod, containers)| {
            containers.iter().flat_map(move |(container, devices)| {
                devices.iter().map(move |(resource, allocation)| {
                    (pod.as_str(), container.as_str(), resource.as_str(), allocation)
                })
            })
        })
    }

    /// Every allocated device, grouped by resource.
    pub fn devices(&self) -> ResourceDeviceIds {
        let mut out = ResourceDeviceIds::new();
        for containers in self.0.values() {
            for devices in containers.values() {
                for (resource, allocation) in devices {
                    out.entry(resource.clone())
                        .or_default()
                        .extend(allocation.device_ids.iter().cloned());
                }
            }
        }
        out
    }

    /// Make the container's devices available for reuse by later containers
    /// of the same pod.
    pub fn add_container_allocated_resources(
        &self,
        pod_uid: &str,
        container_name: &str,
        reuse: &mut ResourceDeviceIds,
    ) {
        let Some(devices) = self.container_allocations(pod_uid, container_name) else {
            return;
        };
        for (resource, allocation) in devices {
            reuse
                .entry(resource.clone())
                .or_default()
                .extend(allocation.device_ids.iter().cloned());
        }
    }

    /// Withdraw the container's devices from the reuse set; an app container
    /// keeps what it got.
    pub fn remove_container_allocated_resources(
        &self,
        pod_uid: &str,
        container_name: &str,
        reuse: &mut ResourceDeviceIds,
    ) {
        let Some(devices) = self.container_allocations(pod_uid, container_name) else {
            return;
        };
        for (resource, allocation) in devices {
            if let Some(ids) = reuse.get_mut(resource) {
                ids.retain(|id| !allocation.device_ids.contains(id));
            }
        }
    }
}
