//! Devices advertised by device plugins, per extended resource.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHealth {
    #[default]
    Healthy,
    Unhealthy,
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceHealth::Healthy => f.write_str("healthy"),
            DeviceHealth::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// One allocatable device instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub health: DeviceHealth,
    /// NUMA nodes the device is attached to; empty when the plugin reports none.
    #[serde(default)]
    pub topology: Vec<usize>,
}

impl Device {
    pub fn new(id: impl Into<String>, numa_nodes: &[usize]) -> Self {
        Self {
            id: id.into(),
            health: DeviceHealth::Healthy,
            topology: numa_nodes.to_vec(),
        }
    }

    pub fn has_topology(&self) -> bool {
        !self.topology.is_empty()
    }

    pub fn is_healthy(&self) -> bool {
        self.health == DeviceHealth::Healthy
    }
}

/// Device-plugin side choice of which devices to hand out.
///
/// Implementations may return any IDs; callers keep only those that are
/// actually allocatable.
pub trait PreferredAllocator: Send + Sync {
    fn get_preferred_allocation(
        &self,
        available: &[String],
        must_include: &[String],
        size: usize,
    ) -> anyhow::Result<Vec<String>>;
}

struct ResourceDevices {
    devices: BTreeMap<String, Device>,
    allocator: Option<Arc<dyn PreferredAllocator>>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    resources: BTreeMap<String, ResourceDevices>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the device list of `resource`.
    pub fn register(
        &mut self,
        resource: &str,
        devices: Vec<Device>,
        allocator: Option<Arc<dyn PreferredAllocator>>,
    ) {
        let healthy = devices.iter().filter(|d| d.is_healthy()).count();
        info!(
            resource = %resource,
            devices = devices.len(),
            healthy,
            preferred_allocation = allocator.is_some(),
            "Registered devices"
        );
        self.resources.insert(
            resource.to_string(),
            ResourceDevices {
                devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
                allocator,
            },
        );
    }

    /// Re-create a resource from a checkpoint. Every device starts unhealthy
    /// until its plugin registers again.
    pub fn restore(&mut self, resource: &str, devices: Vec<Device>) {
        let devices = devices
            .into_iter()
            .map(|mut d| {
                d.health = DeviceHealth::Unhealthy;
                (d.id.clone(), d)
            })
            .collect();
        self.resources.insert(
            resource.to_string(),
            ResourceDevices {
                devices,
                allocator: None,
            },
        );
    }

    /// Returns `false` when the device is unknown.
    pub fn update_health(&mut self, resource: &str, device_id: &str, health: DeviceHealth) -> bool {
        let Some(device) = self
            .resources
            .get_mut(resource)
            .and_then(|r| r.devices.get_mut(device_id))
        else {
            warn!(resource = %resource, device = %device_id, "Health update for unknown device");
            return false;
        };
        if device.health != health {
            info!(resource = %resource, device = %device_id, health = %health, "Device health changed");
            device.health = health;
        }
        true
    }

    pub fn is_registered(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> + '_ {
        self.resources.keys().map(String::as_str)
    }

    pub fn device(&self, resource: &str, device_id: &str) -> Option<&Device> {
        self.resources.get(resource)?.devices.get(device_id)
    }

    /// Every registered device of `resource`, healthy or not.
    pub fn devices(&self, resource: &str) -> impl Iterator<Item = &Device> + '_ {
        self.resources
            .get(resource)
            .into_iter()
            .flat_map(|r| r.devices.values())
    }

    pub fn healthy_devices(&self, resource: &str) -> BTreeSet<String> {
        self.devices(resource)
            .filter(|d| d.is_healthy())
            .map(|d| d.id.clone())
            .collect()
    }

    /// Whether any device of `resource` reports NUMA placement.
    pub fn has_topology_alignment(&self, resource: &str) -> bool {
        self.devices(resource).any(Device::has_topology)
    }

    pub fn preferred_allocator(&self, resource: &str) -> Option<&Arc<dyn PreferredAllocator>> {
        self.resources.get(resource)?.allocator.as_ref()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<Device>> {
        self.resources
            .iter()
            .map(|(name, r)| (name.clone(), r.devices.values().cloned().collect()))
            .collect()
    }
}
