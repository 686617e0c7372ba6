//! Topology manager: collects NUMA hints from resource managers, merges them
//! under the configured policy and decides pod admission.

pub mod policy;
pub mod scope;

pub use policy::{Policy, PolicyKind};
pub use scope::Scope;

use crate::bitmask::BitMask;
use crate::cpumanager::CpuAllocationError;
use crate::devicemanager::DeviceAllocationError;
use crate::models::{Container, Pod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

pub const ERR_TOPOLOGY_AFFINITY: &str = "TopologyAffinityError";
pub const ERR_UNEXPECTED_ADMISSION: &str = "UnexpectedAdmissionError";

/// A candidate NUMA placement for one resource.
///
/// `numa_node_affinity == None` means the provider does not care where the
/// resource lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyHint {
    pub numa_node_affinity: Option<BitMask>,
    pub preferred: bool,
}

impl TopologyHint {
    pub fn new(numa_node_affinity: Option<BitMask>, preferred: bool) -> Self {
        Self {
            numa_node_affinity,
            preferred,
        }
    }
}

/// Hints of one provider, keyed by resource name.
///
/// A `None` list means "no preference" for that resource; an empty list means
/// the resource cannot be satisfied anywhere.
pub type ProviderHints = BTreeMap<String, Option<Vec<TopologyHint>>>;

/// Error returned by a provider while allocating an admitted container.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Cpu(#[from] CpuAllocationError),

    #[error(transparent)]
    Device(#[from] DeviceAllocationError),
}

impl AllocationError {
    /// The allocation itself succeeded but could not be persisted.
    pub fn is_checkpoint(&self) -> bool {
        matches!(
            self,
            AllocationError::Cpu(CpuAllocationError::Checkpoint(_))
                | AllocationError::Device(DeviceAllocationError::Checkpoint(_))
        )
    }
}

/// A resource manager able to express NUMA preferences and allocate against
/// the merged hint.
pub trait HintProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn get_topology_hints(&self, pod: &Pod, container: &Container) -> ProviderHints;

    fn get_pod_topology_hints(&self, pod: &Pod) -> ProviderHints;

    fn allocate(
        &self,
        pod: &Pod,
        container: &Container,
        hint: &TopologyHint,
    ) -> Result<(), AllocationError>;
}

/// Outcome of a pod admission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAdmitResult {
    pub admit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// A checkpoint write failed while handling the pod.
    #[serde(skip)]
    pub checkpoint_failed: bool,
}

impl PodAdmitResult {
    pub fn admitted() -> Self {
        Self {
            admit: true,
            reason: None,
            message: None,
            checkpoint_failed: false,
        }
    }

    pub fn topology_affinity_error() -> Self {
        Self {
            admit: false,
            reason: Some(ERR_TOPOLOGY_AFFINITY.to_string()),
            message: Some("Resources cannot be allocated with Topology locality".to_string()),
            checkpoint_failed: false,
        }
    }

    pub fn unexpected_admission_error(err: &AllocationError) -> Self {
        Self {
            admit: false,
            reason: Some(ERR_UNEXPECTED_ADMISSION.to_string()),
            message: Some(format!("Allocate failed due to {err}, which is unexpected")),
            checkpoint_failed: err.is_checkpoint(),
        }
    }
}

/// Pod UID to container name to the hint the container was admitted with.
pub type PodTopologyHints = BTreeMap<String, BTreeMap<String, TopologyHint>>;

pub struct TopologyManager {
    policy: Policy,
    scope: Scope,
    providers: Vec<Arc<dyn HintProvider>>,
    pod_topology_hints: Mutex<PodTopologyHints>,
}

impl TopologyManager {
    pub fn new(policy: Policy, scope: Scope) -> Self {
        Self {
            policy,
            scope,
            providers: Vec::new(),
            pod_topology_hints: Mutex::new(PodTopologyHints::new()),
        }
    }

    /// Register a provider. Providers are consulted in registration order.
    pub fn add_hint_provider(&mut self, provider: Arc<dyn HintProvider>) {
        self.providers.push(provider);
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Decide whether `pod` can be placed and, if so, allocate every container.
    pub fn admit(&self, pod: &Pod) -> PodAdmitResult {
        self.scope.admit(self, pod)
    }

    /// The hint `container` of `pod_uid` was admitted with.
    pub fn get_affinity(&self, pod_uid: &str, container_name: &str) -> Option<TopologyHint> {
        self.hints()
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
            .copied()
    }

    /// Whether any container of `pod_uid` has been admitted.
    pub fn has_pod(&self, pod_uid: &str) -> bool {
        self.hints().contains_key(pod_uid)
    }

    pub fn remove_container(&self, pod_uid: &str, container_name: &str) {
        let mut hints = self.hints();
        if let Some(containers) = hints.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                hints.remove(pod_uid);
            }
        }
    }

    pub fn remove_pod(&self, pod_uid: &str) {
        if self.hints().remove(pod_uid).is_some() {
            debug!(pod_uid = %pod_uid, "Dropped topology hints for pod");
        }
    }

    pub fn hints_snapshot(&self) -> PodTopologyHints {
        self.hints().clone()
    }

    fn hints(&self) -> std::sync::MutexGuard<'_, PodTopologyHints> {
        self.pod_topology_hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_topology_hint(&self, pod_uid: &str, container_name: &str, hint: TopologyHint) {
        self.hints()
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), hint);
    }

    fn container_hints(&self, pod: &Pod, container: &Container) -> Vec<ProviderHints> {
        self.providers
            .iter()
            .map(|p| p.get_topology_hints(pod, container))
            .collect()
    }

    fn pod_hints(&self, pod: &Pod) -> Vec<ProviderHints> {
        self.providers
            .iter()
            .map(|p| p.get_pod_topology_hints(pod))
            .collect()
    }

    fn allocate_alignment(
        &self,
        pod: &Pod,
        container: &Container,
        hint: &TopologyHint,
    ) -> Result<(), AllocationError> {
        for provider in &self.providers {
            debug!(
                provider = provider.name(),
                pod_uid = %pod.uid,
                container = %container.name,
                "Allocating aligned resources"
            );
            provider.allocate(pod, container, hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
