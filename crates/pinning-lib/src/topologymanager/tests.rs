//! Tests for admission through the topology manager

use super::*;
use crate::cpumanager::CpuAllocationError;
use crate::models::test_pods::{pod, pod_with_init};
use std::sync::Mutex;

/// Provider returning fixed hints and recording every allocation.
struct FakeProvider {
    hints: ProviderHints,
    pod_hints: ProviderHints,
    fail: bool,
    allocations: Mutex<Vec<(String, TopologyHint)>>,
}

impl FakeProvider {
    fn new(hints: ProviderHints) -> Self {
        Self {
            pod_hints: hints.clone(),
            hints,
            fail: false,
            allocations: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(ProviderHints::new())
        }
    }

    fn allocations(&self) -> Vec<(String, TopologyHint)> {
        self.allocations.lock().unwrap().clone()
    }
}

impl HintProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn get_topology_hints(&self, _pod: &Pod, _container: &Container) -> ProviderHints {
        self.hints.clone()
    }

    fn get_pod_topology_hints(&self, _pod: &Pod) -> ProviderHints {
        self.pod_hints.clone()
    }

    fn allocate(
        &self,
        _pod: &Pod,
        container: &Container,
        hint: &TopologyHint,
    ) -> Result<(), AllocationError> {
        if self.fail {
            return Err(CpuAllocationError::NotEnoughCpus.into());
        }
        self.allocations
            .lock()
            .unwrap()
            .push((container.name.clone(), *hint));
        Ok(())
    }
}

fn hint(bits: &[usize], preferred: bool) -> TopologyHint {
    TopologyHint::new(Some(BitMask::new(bits).unwrap()), preferred)
}

fn hints(resource: &str, list: Vec<TopologyHint>) -> ProviderHints {
    ProviderHints::from([(resource.to_string(), Some(list))])
}

fn manager(kind: PolicyKind, scope: Scope, providers: &[Arc<FakeProvider>]) -> TopologyManager {
    let mut manager = TopologyManager::new(Policy::new(kind, vec![0, 1]), scope);
    for p in providers {
        manager.add_hint_provider(p.clone());
    }
    manager
}

#[test]
fn test_container_scope_admits_and_stores_hint() {
    let cpu = Arc::new(FakeProvider::new(hints("cpu", vec![hint(&[0], true), hint(&[0, 1], false)])));
    let manager = manager(PolicyKind::Restricted, Scope::Container, &[cpu.clone()]);
    let p = pod("uid-1", "app", "2", "2");

    let result = manager.admit(&p);

    assert_eq!(result, PodAdmitResult::admitted());
    assert_eq!(manager.get_affinity("uid-1", "app"), Some(hint(&[0], true)));
    assert_eq!(cpu.allocations(), vec![("app".to_string(), hint(&[0], true))]);
}

#[test]
fn test_restricted_rejection_reason() {
    let cpu = Arc::new(FakeProvider::new(hints("cpu", vec![hint(&[0], true)])));
    let gpu = Arc::new(FakeProvider::new(hints("gpu", vec![hint(&[1], true)])));
    let manager = manager(PolicyKind::Restricted, Scope::Container, &[cpu.clone(), gpu]);

    let result = manager.admit(&pod("uid-1", "app", "2", "2"));

    assert!(!result.admit);
    assert_eq!(result.reason.as_deref(), Some(ERR_TOPOLOGY_AFFINITY));
    assert_eq!(
        result.message.as_deref(),
        Some("Resources cannot be allocated with Topology locality")
    );
    assert!(cpu.allocations().is_empty());
    assert!(manager.get_affinity("uid-1", "app").is_none());
}

#[test]
fn test_allocation_failure_is_unexpected_admission_error() {
    let failing = Arc::new(FakeProvider::failing());
    let manager = manager(PolicyKind::BestEffort, Scope::Container, &[failing]);

    let result = manager.admit(&pod("uid-1", "app", "2", "2"));

    assert!(!result.admit);
    assert_eq!(result.reason.as_deref(), Some(ERR_UNEXPECTED_ADMISSION));
    assert_eq!(
        result.message.as_deref(),
        Some("Allocate failed due to not enough cpus available to satisfy request, which is unexpected")
    );
}

#[test]
fn test_container_scope_visits_init_containers_first() {
    let cpu = Arc::new(FakeProvider::new(ProviderHints::new()));
    let manager = manager(PolicyKind::BestEffort, Scope::Container, &[cpu.clone()]);
    let p = pod_with_init("uid-1", &[("1", "1")], &[("1", "1"), ("1", "1")]);

    assert!(manager.admit(&p).admit);

    let order: Vec<String> = cpu.allocations().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, vec!["initContainer-0", "appContainer-0", "appContainer-1"]);
}

#[test]
fn test_pod_scope_stores_one_hint_for_every_container() {
    let cpu = Arc::new(FakeProvider::new(hints("cpu", vec![hint(&[1], true)])));
    let manager = manager(PolicyKind::SingleNumaNode, Scope::Pod, &[cpu.clone()]);
    let p = pod_with_init("uid-2", &[("1", "1")], &[("1", "1"), ("1", "1")]);

    assert!(manager.admit(&p).admit);

    for name in ["initContainer-0", "appContainer-0", "appContainer-1"] {
        assert_eq!(manager.get_affinity("uid-2", name), Some(hint(&[1], true)));
    }
    assert_eq!(cpu.allocations().len(), 3);
}

#[test]
fn test_none_policy_skips_hints_and_allocates_unconstrained() {
    let gpu = Arc::new(FakeProvider::new(hints("gpu", vec![])));
    let manager = manager(PolicyKind::None, Scope::Container, &[gpu.clone()]);

    let unconstrained = TopologyHint::new(None, true);
    assert!(manager.admit(&pod("uid-3", "app", "1", "1")).admit);
    assert_eq!(gpu.allocations(), vec![("app".to_string(), unconstrained)]);
    assert_eq!(manager.get_affinity("uid-3", "app"), Some(unconstrained));
}

#[test]
fn test_remove_container_and_pod() {
    let cpu = Arc::new(FakeProvider::new(ProviderHints::new()));
    let manager = manager(PolicyKind::BestEffort, Scope::Container, &[cpu]);
    let p = pod_with_init("uid-4", &[], &[("1", "1"), ("1", "1")]);
    assert!(manager.admit(&p).admit);

    manager.remove_container("uid-4", "appContainer-0");
    assert!(manager.get_affinity("uid-4", "appContainer-0").is_none());
    assert!(manager.get_affinity("uid-4", "appContainer-1").is_some());

    manager.remove_pod("uid-4");
    assert!(manager.hints_snapshot().is_empty());
}
