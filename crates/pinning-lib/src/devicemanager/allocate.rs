use super::{DeviceAllocationError, Inner};
use crate::topologymanager::TopologyHint;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Add candidates to `chosen` until it holds `required` devices. Returns
/// whether the target was reached.
fn take_remaining<'a>(
    chosen: &mut BTreeSet<String>,
    required: usize,
    candidates: impl IntoIterator<Item = &'a String>,
) -> bool {
    for id in candidates {
        if chosen.len() >= required {
            break;
        }
        chosen.insert(id.clone());
    }
    chosen.len() >= required
}

/// Available devices split by their relation to a hint.
#[derive(Debug, Default)]
struct AffinitySplit {
    aligned: Vec<String>,
    unaligned: Vec<String>,
    no_topology: Vec<String>,
}

impl Inner {
    /// Pick the devices `container_name` should hold for `resource`.
    ///
    /// Devices the container already holds are always kept. The rest come
    /// from `reusable` first, then from devices on the hint's NUMA nodes, then
    /// from other nodes, then from devices without NUMA information.
    pub(super) fn devices_to_allocate(
        &self,
        pod_uid: &str,
        container_name: &str,
        resource: &str,
        required: usize,
        reusable: &BTreeSet<String>,
        hint: &TopologyHint,
    ) -> Result<BTreeSet<String>, DeviceAllocationError> {
        if !self.registry.is_registered(resource) {
            return Err(DeviceAllocationError::Unregistered {
                resource: resource.to_string(),
            });
        }
        let healthy = self.registry.healthy_devices(resource);

        let mut chosen: BTreeSet<String> = self
            .pod_devices
            .container_devices(pod_uid, container_name, resource)
            .map(|held| held.intersection(&healthy).cloned().collect())
            .unwrap_or_default();
        if chosen.len() >= required {
            debug!(resource = %resource, container = %container_name, "Container already holds its devices");
            return Ok(chosen);
        }

        if take_remaining(&mut chosen, required, reusable.iter().filter(|id| healthy.contains(*id))) {
            return Ok(chosen);
        }

        let allocated = self.pod_devices.devices().remove(resource).unwrap_or_default();
        let available: BTreeSet<String> = healthy
            .iter()
            .filter(|id| !allocated.contains(*id) && !chosen.contains(*id))
            .cloned()
            .collect();
        let needed = required - chosen.len();
        if available.len() < needed {
            return Err(DeviceAllocationError::Unavailable {
                resource: resource.to_string(),
                requested: needed,
                available: available.len(),
            });
        }

        let split = self.filter_by_affinity(resource, &available, hint);

        if needed < split.aligned.len() {
            let candidates: Vec<String> = split.aligned.iter().chain(chosen.iter()).cloned().collect();
            let preferred = self.preferred_allocation(resource, candidates, &chosen, required)?;
            if take_remaining(
                &mut chosen,
                required,
                preferred.iter().filter(|id| split.aligned.contains(*id)),
            ) {
                return Ok(chosen);
            }
            if take_remaining(&mut chosen, required, &split.aligned) {
                return Ok(chosen);
            }
            return Err(self.shortfall(resource, required, &chosen));
        }

        if take_remaining(&mut chosen, required, &split.aligned) {
            return Ok(chosen);
        }

        let candidates: Vec<String> = available.union(&chosen).cloned().collect();
        let preferred = self.preferred_allocation(resource, candidates, &chosen, required)?;
        if take_remaining(
            &mut chosen,
            required,
            preferred.iter().filter(|id| available.contains(*id)),
        ) {
            return Ok(chosen);
        }
        if take_remaining(&mut chosen, required, &split.unaligned) {
            return Ok(chosen);
        }
        if take_remaining(&mut chosen, required, &split.no_topology) {
            return Ok(chosen);
        }

        Err(self.shortfall(resource, required, &chosen))
    }

    fn shortfall(&self, resource: &str, required: usize, chosen: &BTreeSet<String>) -> DeviceAllocationError {
        DeviceAllocationError::Shortfall {
            resource: resource.to_string(),
            requested: required,
            got: chosen.len(),
        }
    }

    /// Ask the plugin which devices it would like; empty when the plugin does
    /// not offer preferred allocation.
    fn preferred_allocation(
        &self,
        resource: &str,
        available: Vec<String>,
        must_include: &BTreeSet<String>,
        size: usize,
    ) -> Result<Vec<String>, DeviceAllocationError> {
        let Some(allocator) = self.registry.preferred_allocator(resource) else {
            return Ok(Vec::new());
        };
        let must_include: Vec<String> = must_include.iter().cloned().collect();
        allocator
            .get_preferred_allocation(&available, &must_include, size)
            .map_err(|err| DeviceAllocationError::PreferredAllocation {
                resource: resource.to_string(),
                message: format!("{err:#}"),
            })
    }

    /// Split `available` into devices on the hint's nodes, devices on other
    /// nodes and devices without NUMA information.
    ///
    /// Nodes are visited hint nodes first, then other nodes, each group by
    /// ascending device count; a device attached to several nodes lands in
    /// the group of the first node visited. Without a hint affinity or NUMA
    /// information everything is returned as `no_topology`.
    fn filter_by_affinity(
        &self,
        resource: &str,
        available: &BTreeSet<String>,
        hint: &TopologyHint,
    ) -> AffinitySplit {
        let affinity = match hint.numa_node_affinity {
            Some(mask) if self.registry.has_topology_alignment(resource) => mask,
            _ => {
                return AffinitySplit {
                    no_topology: available.iter().cloned().collect(),
                    ..AffinitySplit::default()
                }
            }
        };

        let mut per_node: BTreeMap<Option<usize>, Vec<&String>> = BTreeMap::new();
        for id in available {
            match self.registry.device(resource, id) {
                Some(device) if device.has_topology() => {
                    for &node in &device.topology {
                        per_node.entry(Some(node)).or_default().push(id);
                    }
                }
                _ => per_node.entry(None).or_default().push(id),
            }
        }

        let group = |node: Option<usize>| match node {
            Some(n) if affinity.is_set(n) => 0,
            Some(_) => 1,
            None => 2,
        };
        let mut nodes: Vec<Option<usize>> = per_node.keys().copied().collect();
        nodes.sort_by_key(|&node| (group(node), per_node[&node].len(), node));

        let mut split = AffinitySplit::default();
        let mut placed: BTreeSet<&String> = BTreeSet::new();
        for node in nodes {
            for &id in &per_node[&node] {
                if !placed.insert(id) {
                    continue;
                }
                let target = match group(node) {
                    0 => &mut split.aligned,
                    1 => &mut split.unaligned,
                    _ => &mut split.no_topology,
                };
                target.push(id.clone());
            }
        }
        split
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmask::BitMask;
    use crate::devicemanager::{Device, DeviceAllocation, PreferredAllocator};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    const RESOURCE: &str = "resource";

    /// Plugin returning a fixed answer and recording its arguments.
    #[derive(Default)]
    struct FixedAllocator {
        response: Vec<String>,
        calls: Mutex<Vec<(BTreeSet<String>, BTreeSet<String>, usize)>>,
    }

    impl FixedAllocator {
        fn returning(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                response: ids.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl PreferredAllocator for FixedAllocator {
        fn get_preferred_allocation(
            &self,
            available: &[String],
            must_include: &[String],
            size: usize,
        ) -> anyhow::Result<Vec<String>> {
            self.calls.lock().unwrap().push((
                available.iter().cloned().collect(),
                must_include.iter().cloned().collect(),
                size,
            ));
            Ok(self.response.clone())
        }
    }

    struct FailingAllocator;

    impl PreferredAllocator for FailingAllocator {
        fn get_preferred_allocation(&self, _: &[String], _: &[String], _: usize) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("plugin unreachable")
        }
    }

    fn numa_device(id: &str, node: usize) -> Device {
        Device::new(id, &[node])
    }

    fn numbered(range: std::ops::Range<usize>, node: usize) -> Vec<Device> {
        range.map(|i| numa_device(&format!("Dev{i}"), node)).collect()
    }

    fn hint(bits: &[usize]) -> TopologyHint {
        TopologyHint::new(Some(BitMask::new(bits).unwrap()), true)
    }

    fn inner(devices: Vec<Device>, allocator: Option<Arc<dyn PreferredAllocator>>) -> Inner {
        let mut inner = Inner::default();
        inner.registry.register(RESOURCE, devices, allocator);
        inner
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn allocate(inner: &Inner, request: usize, hint: &TopologyHint) -> BTreeSet<String> {
        inner
            .devices_to_allocate("podUID", "containerName", RESOURCE, request, &BTreeSet::new(), hint)
            .unwrap()
    }

    /// NUMA node to number of allocated devices on it.
    fn alignment(inner: &Inner, allocated: &BTreeSet<String>) -> BTreeMap<usize, usize> {
        let mut out = BTreeMap::new();
        for id in allocated {
            if let Some(&node) = inner
                .registry
                .device(RESOURCE, id)
                .and_then(|d| d.topology.first())
            {
                *out.entry(node).or_default() += 1;
            }
        }
        out
    }

    fn two_sockets(count: usize) -> Vec<Device> {
        (1..=count)
            .map(|i| numa_device(&format!("Dev{i}"), (i + 1) % 2))
            .collect()
    }

    #[test]
    fn test_no_alignment_information() {
        let inner = inner(vec![Device::new("Dev1", &[]), Device::new("Dev2", &[])], None);
        let allocated = allocate(&inner, 1, &hint(&[0, 1]));
        assert_eq!(allocated.len(), 1);
        assert!(alignment(&inner, &allocated).is_empty());
    }

    #[test]
    fn test_partial_alignment() {
        let inner = inner(vec![Device::new("Dev1", &[]), numa_device("Dev2", 1)], None);
        let allocated = allocate(&inner, 1, &hint(&[1]));
        assert_eq!(alignment(&inner, &allocated), BTreeMap::from([(1, 1)]));
    }

    #[test]
    fn test_single_node_requests() {
        let cases: [(usize, usize, &[usize], BTreeMap<usize, usize>); 4] = [
            (2, 1, &[0], BTreeMap::from([(0, 1)])),
            (2, 1, &[1], BTreeMap::from([(1, 1)])),
            (4, 2, &[0], BTreeMap::from([(0, 2)])),
            (4, 2, &[1], BTreeMap::from([(1, 2)])),
        ];
        for (devices, request, nodes, expected) in cases {
            let inner = inner(two_sockets(devices), None);
            let allocated = allocate(&inner, request, &hint(nodes));
            assert_eq!(alignment(&inner, &allocated), expected, "hint {nodes:?}");
        }
    }

    #[test]
    fn test_unsatisfiable_hint_spills_to_other_node() {
        let inner0 = inner(two_sockets(6), None);
        let allocated = allocate(&inner0, 4, &hint(&[0]));
        assert_eq!(alignment(&inner0, &allocated), BTreeMap::from([(0, 3), (1, 1)]));

        let inner1 = inner(two_sockets(6), None);
        let allocated = allocate(&inner1, 4, &hint(&[1]));
        assert_eq!(alignment(&inner1, &allocated), BTreeMap::from([(0, 1), (1, 3)]));
    }

    #[test]
    fn test_multi_node_hint() {
        let devices = (1..=8)
            .map(|i| numa_device(&format!("Dev{i}"), (i - 1) % 4))
            .collect();
        let inner = inner(devices, None);
        let allocated = allocate(&inner, 4, &hint(&[1, 3]));
        assert_eq!(alignment(&inner, &allocated), BTreeMap::from([(1, 2), (3, 2)]));
    }

    #[test]
    fn test_preferred_allocation_accepted() {
        let mut devices = numbered(0..100, 0);
        devices.extend(numbered(100..200, 1));
        let plugin = FixedAllocator::returning(&["Dev0", "Dev19", "Dev83", "Dev42", "Dev77"]);
        let inner = inner(devices, Some(plugin.clone()));

        let allocated = allocate(&inner, 5, &hint(&[0]));

        assert_eq!(allocated, set(&["Dev0", "Dev19", "Dev83", "Dev42", "Dev77"]));
        assert_eq!(plugin.calls.lock().unwrap()[0].2, 5);
    }

    #[test]
    fn test_preferred_unaligned_and_bogus_ignored() {
        let mut devices = numbered(0..100, 0);
        devices.extend(numbered(100..200, 1));
        let plugin = FixedAllocator::returning(&["Dev0", "Dev19", "Dev83", "Dev150", "bogus0"]);
        let inner = inner(devices, Some(plugin));

        let allocated = allocate(&inner, 5, &hint(&[0]));

        assert_eq!(allocated.len(), 5);
        assert!(allocated.is_superset(&set(&["Dev0", "Dev19", "Dev83"])));
        assert_eq!(alignment(&inner, &allocated), BTreeMap::from([(0, 5)]));
    }

    #[test]
    fn test_preferred_fills_after_aligned() {
        let mut devices = numbered(0..3, 0);
        devices.extend(numbered(3..100, 1));
        let plugin = FixedAllocator::returning(&["Dev0", "Dev1", "Dev2", "Dev42", "bogus0"]);
        let inner = inner(devices, Some(plugin));

        let allocated = allocate(&inner, 5, &hint(&[0]));

        assert!(allocated.is_superset(&set(&["Dev0", "Dev1", "Dev2", "Dev42"])));
        assert_eq!(alignment(&inner, &allocated), BTreeMap::from([(0, 3), (1, 2)]));
    }

    #[test]
    fn test_preferred_allocation_parameters() {
        struct Case {
            request: usize,
            devices: Vec<Device>,
            allocated: &'static [&'static str],
            reusable: &'static [&'static str],
            available: &'static [&'static str],
            must_include: &'static [&'static str],
        }
        let cases = [
            Case {
                request: 1,
                devices: numbered(0..4, 0),
                allocated: &[],
                reusable: &[],
                available: &["Dev0", "Dev1", "Dev2", "Dev3"],
                must_include: &[],
            },
            Case {
                request: 4,
                devices: numbered(0..8, 0),
                allocated: &["Dev0", "Dev5"],
                reusable: &["Dev0", "Dev5"],
                available: &["Dev0", "Dev1", "Dev2", "Dev3", "Dev4", "Dev5", "Dev6", "Dev7"],
                must_include: &["Dev0", "Dev5"],
            },
            Case {
                request: 4,
                devices: numbered(0..8, 0),
                allocated: &["Dev0", "Dev5", "Dev4", "Dev1"],
                reusable: &["Dev0", "Dev5"],
                available: &["Dev0", "Dev2", "Dev3", "Dev5", "Dev6", "Dev7"],
                must_include: &["Dev0", "Dev5"],
            },
            Case {
                request: 6,
                devices: [numbered(0..4, 0), numbered(4..8, 1)].concat(),
                allocated: &["Dev1", "Dev6"],
                reusable: &["Dev1", "Dev6"],
                available: &["Dev0", "Dev1", "Dev2", "Dev3", "Dev4", "Dev5", "Dev6", "Dev7"],
                must_include: &["Dev0", "Dev1", "Dev2", "Dev3", "Dev6"],
            },
            Case {
                request: 6,
                devices: [numbered(0..4, 0), numbered(4..8, 1)].concat(),
                allocated: &["Dev0", "Dev1", "Dev6", "Dev7"],
                reusable: &["Dev1", "Dev6"],
                available: &["Dev1", "Dev2", "Dev3", "Dev4", "Dev5", "Dev6"],
                must_include: &["Dev1", "Dev2", "Dev3", "Dev6"],
            },
        ];

        for case in cases {
            let plugin = FixedAllocator::returning(&[]);
            let mut inner = inner(case.devices, Some(plugin.clone()));
            if !case.allocated.is_empty() {
                inner.pod_devices.insert(
                    "otherPod",
                    "init",
                    RESOURCE,
                    DeviceAllocation {
                        device_ids: set(case.allocated),
                        numa_affinity: None,
                    },
                );
            }

            inner
                .devices_to_allocate(
                    "podUID",
                    "containerName",
                    RESOURCE,
                    case.request,
                    &set(case.reusable),
                    &hint(&[0]),
                )
                .unwrap();

            let calls = plugin.calls.lock().unwrap();
            assert_eq!(calls[0], (set(case.available), set(case.must_include), case.request));
        }
    }

    #[test]
    fn test_held_devices_are_kept() {
        let mut inner = inner(numbered(0..4, 0), None);
        inner.pod_devices.insert(
            "podUID",
            "containerName",
            RESOURCE,
            DeviceAllocation {
                device_ids: set(&["Dev3"]),
                numa_affinity: None,
            },
        );

        let allocated = allocate(&inner, 2, &hint(&[0]));

        assert!(allocated.contains("Dev3"));
        assert_eq!(allocated.len(), 2);
    }

    #[test]
    fn test_errors() {
        let inner0 = inner(numbered(0..2, 0), None);
        let err = inner0
            .devices_to_allocate("p", "c", RESOURCE, 3, &BTreeSet::new(), &hint(&[0]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "requested number of devices unavailable for resource. Requested: 3, Available: 2"
        );

        let err = inner0
            .devices_to_allocate("p", "c", "other", 1, &BTreeSet::new(), &hint(&[0]))
            .unwrap_err();
        assert!(matches!(err, DeviceAllocationError::Unregistered { .. }));

        let inner1 = inner(numbered(0..4, 0), Some(Arc::new(FailingAllocator)));
        let err = inner1
            .devices_to_allocate("p", "c", RESOURCE, 1, &BTreeSet::new(), &hint(&[0]))
            .unwrap_err();
        assert!(err.to_string().contains("plugin unreachable"));
    }
}
