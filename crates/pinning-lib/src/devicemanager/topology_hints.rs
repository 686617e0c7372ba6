use super::Inner;
use crate::bitmask::iterate_bit_masks;
use crate::models::{Container, Pod};
use crate::topologymanager::{ProviderHints, TopologyHint};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Device requests of the whole pod: init containers run one at a time, app
/// containers together.
fn pod_device_requests(pod: &Pod) -> BTreeMap<String, usize> {
    let mut init: BTreeMap<String, usize> = BTreeMap::new();
    for container in &pod.init_containers {
        for (resource, count) in container.extended_resources() {
            let entry = init.entry(resource.to_string()).or_default();
            *entry = (*entry).max(count as usize);
        }
    }

    let mut app: BTreeMap<String, usize> = BTreeMap::new();
    for container in &pod.containers {
        for (resource, count) in container.extended_resources() {
            *app.entry(resource.to_string()).or_default() += count as usize;
        }
    }

    for (resource, count) in init {
        let entry = app.entry(resource).or_default();
        *entry = (*entry).max(count);
    }
    app
}

impl Inner {
    pub(super) fn container_hints(
        &self,
        numa_nodes: &[usize],
        pod: &Pod,
        container: &Container,
    ) -> ProviderHints {
        let no_reuse = BTreeSet::new();
        let mut hints = ProviderHints::new();

        for (resource, requested) in container.extended_resources() {
            if !self.registry.is_registered(resource) {
                continue;
            }
            let held = self
                .pod_devices
                .container_devices(&pod.uid, &container.name, resource)
                .cloned()
                .unwrap_or_default();
            let reusable = self
                .devices_to_reuse
                .get(&pod.uid)
                .and_then(|r| r.get(resource))
                .unwrap_or(&no_reuse);
            let resource_hints =
                self.resource_hints(numa_nodes, resource, requested as usize, &held, reusable);
            hints.insert(resource.to_string(), resource_hints);
        }
        hints
    }

    pub(super) fn pod_hints(&self, numa_nodes: &[usize], pod: &Pod) -> ProviderHints {
        let no_reuse = BTreeSet::new();
        pod_device_requests(pod)
            .into_iter()
            .filter(|(resource, _)| self.registry.is_registered(resource))
            .map(|(resource, requested)| {
                let held = self.pod_devices.pod_devices(&pod.uid, &resource);
                let hints = self.resource_hints(numa_nodes, &resource, requested, &held, &no_reuse);
                (resource, hints)
            })
            .collect()
    }

    /// `None` when the resource has no NUMA information at all.
    fn resource_hints(
        &self,
        numa_nodes: &[usize],
        resource: &str,
        requested: usize,
        held: &BTreeSet<String>,
        reusable: &BTreeSet<String>,
    ) -> Option<Vec<TopologyHint>> {
        if !self.registry.has_topology_alignment(resource) {
            debug!(resource = %resource, "Resource has no topology alignment");
            return None;
        }

        if held.len() == requested {
            if !held.is_empty() {
                return Some(self.generate_device_topology_hints(
                    numa_nodes,
                    resource,
                    held,
                    &BTreeSet::new(),
                    requested,
                ));
            }
        } else if held.len() > requested {
            warn!(
                resource = %resource,
                held = held.len(),
                requested,
                "More devices already allocated than requested"
            );
            return Some(Vec::new());
        }

        // Held devices stay with the container, only the difference is new.
        let must_include: BTreeSet<String> = held.union(reusable).cloned().collect();
        let available: BTreeSet<String> = self
            .available_devices(resource)
            .difference(&must_include)
            .cloned()
            .collect();
        if available.len() + must_include.len() < requested {
            debug!(
                resource = %resource,
                available = available.len() + must_include.len(),
                requested,
                "Not enough devices for any placement"
            );
            return Some(Vec::new());
        }

        Some(self.generate_device_topology_hints(
            numa_nodes,
            resource,
            &available,
            &must_include,
            requested,
        ))
    }

    fn generate_device_topology_hints(
        &self,
        numa_nodes: &[usize],
        resource: &str,
        available: &BTreeSet<String>,
        must_include: &BTreeSet<String>,
        request: usize,
    ) -> Vec<TopologyHint> {
        let mut min_affinity_size = numa_nodes.len();
        let mut hints = Vec::new();

        iterate_bit_masks(numa_nodes, |mask| {
            let registered_in_mask = self
                .registry
                .devices(resource)
                .filter(|d| mask.any_set(&d.topology))
                .count();
            if registered_in_mask >= request && mask.count() < min_affinity_size {
                min_affinity_size = mask.count();
            }

            let mut matching = 0;
            for id in must_include {
                let Some(device) = self.registry.device(resource, id) else {
                    continue;
                };
                if !device.has_topology() {
                    continue;
                }
                if !mask.any_set(&device.topology) {
                    return;
                }
                matching += 1;
            }

            matching += available
                .iter()
                .filter_map(|id| self.registry.device(resource, id))
                .filter(|d| mask.any_set(&d.topology))
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
}
