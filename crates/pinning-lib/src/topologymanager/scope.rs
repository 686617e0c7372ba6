//! Admission granularity: one merged hint per container, or one per pod.

use super::{PodAdmitResult, TopologyHint, TopologyManager};
use crate::models::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown topology manager scope '{0}'")]
pub struct UnknownScopeError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    Container,
    Pod,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Container => "container",
            Scope::Pod => "pod",
        }
    }

    pub(super) fn admit(&self, manager: &TopologyManager, pod: &Pod) -> PodAdmitResult {
        if manager.policy.kind() == super::PolicyKind::None {
            return admit_unconstrained(manager, pod);
        }
        match self {
            Scope::Container => admit_per_container(manager, pod),
            Scope::Pod => admit_per_pod(manager, pod),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = UnknownScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Scope::Container),
            "pod" => Ok(Scope::Pod),
            other => Err(UnknownScopeError(other.to_string())),
        }
    }
}

fn admit_per_container(manager: &TopologyManager, pod: &Pod) -> PodAdmitResult {
    for container in pod.all_containers() {
        let providers_hints = manager.container_hints(pod, container);
        let (best_hint, admit) = manager.policy.merge(&providers_hints);
        info!(
            pod = %pod.name,
            container = %container.name,
            hint = ?best_hint,
            admit,
            "Topology affinity computed"
        );

        if !admit {
            warn!(pod = %pod.name, container = %container.name, "Pod rejected by topology policy");
            return PodAdmitResult::topology_affinity_error();
        }

        manager.set_topology_hint(&pod.uid, &container.name, best_hint);
        if let Err(err) = manager.allocate_alignment(pod, container, &best_hint) {
            error!(pod = %pod.name, container = %container.name, error = %err, "Allocation failed after admission");
            return PodAdmitResult::unexpected_admission_error(&err);
        }
    }
    PodAdmitResult::admitted()
}

fn admit_per_pod(manager: &TopologyManager, pod: &Pod) -> PodAdmitResult {
    let providers_hints = manager.pod_hints(pod);
    let (best_hint, admit) = manager.policy.merge(&providers_hints);
    info!(pod = %pod.name, hint = ?best_hint, admit, "Pod topology affinity computed");

    if !admit {
        warn!(pod = %pod.name, "Pod rejected by topology policy");
        return PodAdmitResult::topology_affinity_error();
    }

    for container in pod.all_containers() {
        manager.set_topology_hint(&pod.uid, &container.name, best_hint);
        if let Err(err) = manager.allocate_alignment(pod, container, &best_hint) {
            error!(pod = %pod.name, container = %container.name, error = %err, "Allocation failed after admission");
            return PodAdmitResult::unexpected_admission_error(&err);
        }
    }
    PodAdmitResult::admitted()
}

/// `none` policy: no hints are gathered; every container is allocated
/// without a NUMA constraint.
fn admit_unconstrained(manager: &TopologyManager, pod: &Pod) -> PodAdmitResult {
    let hint = TopologyHint::new(None, true);
    for container in pod.all_containers() {
        manager.set_topology_hint(&pod.uid, &container.name, hint);
        if let Err(err) = manager.allocate_alignment(pod, container, &hint) {
            error!(pod = %pod.name, container = %container.name, error = %err, "Allocation failed after admission");
            return PodAdmitResult::unexpected_admission_error(&err);
        }
    }
    PodAdmitResult::admitted()
}
