//! Hint merging and the admission policies built on it.

use super::{ProviderHints, TopologyHint};
use crate::bitmask::BitMask;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown topology manager policy '{0}'")]
pub struct UnknownPolicyError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Admit everything without consulting providers.
    None,
    /// Merge hints, always admit.
    BestEffort,
    /// Admit only when the merged hint is preferred.
    Restricted,
    /// Admit only when every resource fits on one NUMA node.
    SingleNumaNode,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::None => "none",
            PolicyKind::BestEffort => "best-effort",
            PolicyKind::Restricted => "restricted",
            PolicyKind::SingleNumaNode => "single-numa-node",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = UnknownPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PolicyKind::None),
            "best-effort" => Ok(PolicyKind::BestEffort),
            "restricted" => Ok(PolicyKind::Restricted),
            "single-numa-node" => Ok(PolicyKind::SingleNumaNode),
            other => Err(UnknownPolicyError(other.to_string())),
        }
    }
}

/// A merge policy bound to the machine's NUMA nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    kind: PolicyKind,
    numa_nodes: Vec<usize>,
}

impl Policy {
    pub fn new(kind: PolicyKind, numa_nodes: Vec<usize>) -> Self {
        Self { kind, numa_nodes }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Merge the hints of every provider into one hint and decide admission.
    pub fn merge(&self, providers_hints: &[ProviderHints]) -> (TopologyHint, bool) {
        match self.kind {
            PolicyKind::None => (TopologyHint::default(), true),
            PolicyKind::BestEffort => {
                let filtered = filter_providers_hints(providers_hints);
                (merge_filtered_hints(&self.numa_nodes, &filtered), true)
            }
            PolicyKind::Restricted => {
                let filtered = filter_providers_hints(providers_hints);
                let hint = merge_filtered_hints(&self.numa_nodes, &filtered);
                (hint, hint.preferred)
            }
            PolicyKind::SingleNumaNode => {
                let filtered = filter_single_numa_hints(filter_providers_hints(providers_hints));
                let mut hint = merge_filtered_hints(&self.numa_nodes, &filtered);

                // Spanning every node is the same as not caring.
                if hint.numa_node_affinity == Some(self.default_affinity()) {
                    hint.numa_node_affinity = None;
                }
                (hint, hint.preferred)
            }
        }
    }

    fn default_affinity(&self) -> BitMask {
        all_nodes_mask(&self.numa_nodes)
    }
}

fn all_nodes_mask(numa_nodes: &[usize]) -> BitMask {
    BitMask::new(numa_nodes).unwrap_or_default()
}

/// Normalize provider output into one hint list per resource.
///
/// A provider with no hints at all, or a resource with a `None` list, becomes
/// a single preferred don't-care hint; an empty list becomes a single
/// non-preferred don't-care hint.
pub(crate) fn filter_providers_hints(providers_hints: &[ProviderHints]) -> Vec<Vec<TopologyHint>> {
    let mut all = Vec::new();
    for hints in providers_hints {
        if hints.is_empty() {
            debug!("Hint provider has no preference for NUMA affinity with any resource");
            all.push(vec![TopologyHint::new(None, true)]);
            continue;
        }

        for (resource, resource_hints) in hints {
            match resource_hints {
                None => {
                    debug!(resource = %resource, "Hint provider has no preference for NUMA affinity");
                    all.push(vec![TopologyHint::new(None, true)]);
                }
                Some(list) if list.is_empty() => {
                    debug!(resource = %resource, "Hint provider has no possible NUMA affinities");
                    all.push(vec![TopologyHint::new(None, false)]);
                }
                Some(list) => all.push(list.clone()),
            }
        }
    }
    all
}

/// Keep only don't-care preferred hints and preferred single-node hints.
fn filter_single_numa_hints(all: Vec<Vec<TopologyHint>>) -> Vec<Vec<TopologyHint>> {
    all.into_iter()
        .map(|hints| {
            hints
                .into_iter()
                .filter(|hint| match hint.numa_node_affinity {
                    None => hint.preferred,
                    Some(mask) => hint.preferred && mask.count() == 1,
                })
                .collect()
        })
        .collect()
}

/// AND together the affinities of one permutation.
///
/// The result is preferred only if every hint is preferred and every set
/// affinity equals the first set affinity.
pub(crate) fn merge_permutation(numa_nodes: &[usize], permutation: &[TopologyHint]) -> TopologyHint {
    let mut preferred = true;
    let mut affinities: Vec<BitMask> = Vec::new();

    for hint in permutation {
        if let Some(mask) = hint.numa_node_affinity {
            affinities.push(mask);
            if mask != affinities[0] {
                preferred = false;
            }
        }
        if !hint.preferred {
            preferred = false;
        }
    }

    let merged = all_nodes_mask(numa_nodes).and_all(&affinities);
    TopologyHint::new(Some(merged), preferred)
}

fn compare_hints(current: Option<TopologyHint>, candidate: TopologyHint) -> Option<TopologyHint> {
    let candidate_mask = candidate.numa_node_affinity.unwrap_or_default();
    if candidate_mask.count() == 0 {
        return current;
    }

    let Some(current) = current else {
        return Some(candidate);
    };

    if !current.preferred && candidate.preferred {
        return Some(candidate);
    }
    if current.preferred && !candidate.preferred {
        return Some(current);
    }

    let current_mask = current.numa_node_affinity.unwrap_or_default();
    if candidate_mask.is_narrower_than(&current_mask) {
        Some(candidate)
    } else {
        Some(current)
    }
}

pub(crate) fn merge_filtered_hints(numa_nodes: &[usize], filtered: &[Vec<TopologyHint>]) -> TopologyHint {
    let mut best: Option<TopologyHint> = None;
    iterate_all_provider_topology_hints(filtered, |permutation| {
        let merged = merge_permutation(numa_nodes, &permutation);
        best = compare_hints(best, merged);
    });

    best.unwrap_or_else(|| TopologyHint::new(Some(all_nodes_mask(numa_nodes)), false))
}

/// Visit every combination that picks one hint from each list.
///
/// The first list varies slowest. Each permutation is handed over as its own
/// vector. If any list is empty there are no permutations; with no lists at
/// all there is exactly one, empty permutation.
pub(crate) fn iterate_all_provider_topology_hints(
    all: &[Vec<TopologyHint>],
    mut callback: impl FnMut(Vec<TopologyHint>),
) {
    if all.iter().any(Vec::is_empty) {
        return;
    }

    let mut indices = vec![0usize; all.len()];
    loop {
        callback(
            indices
                .iter()
                .enumerate()
                .map(|(list, &i)| all[list][i])
                .collect(),
        );

        let mut pos = all.len();
        loop {
            if pos == 0 {
                return;
            }
            pos -= 1;
            indices[pos] += 1;
            if indices[pos] < all[pos].len() {
                break;
            }
            indices[pos] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn mask(bits: &[usize]) -> BitMask {
        BitMask::new(bits).unwrap()
    }

    fn hint(bits: &[usize], preferred: bool) -> TopologyHint {
        TopologyHint::new(Some(mask(bits)), preferred)
    }

    fn provider(resource: &str, hints: Option<Vec<TopologyHint>>) -> ProviderHints {
        BTreeMap::from([(resource.to_string(), hints)])
    }

    fn policy(kind: PolicyKind) -> Policy {
        Policy::new(kind, vec![0, 1])
    }

    #[test]
    fn test_policy_names_round_trip() {
        for name in ["none", "best-effort", "restricted", "single-numa-node"] {
            let kind: PolicyKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert_eq!(
            "strict".parse::<PolicyKind>(),
            Err(UnknownPolicyError("strict".to_string()))
        );
    }

    #[test]
    fn test_merge_permutation_first_affinity_asymmetry() {
        // {0,1} then {1}: affinities differ, so the result is not preferred
        // even though {1} is a subset of {0,1}.
        let merged = merge_permutation(&[0, 1], &[hint(&[0, 1], true), hint(&[1], true)]);
        assert_eq!(merged, hint(&[1], false));
    }

    #[test]
    fn test_merge_permutation_ignores_dont_care() {
        let merged = merge_permutation(
            &[0, 1],
            &[TopologyHint::new(None, true), hint(&[0], true)],
        );
        assert_eq!(merged, hint(&[0], true));

        let merged = merge_permutation(&[0, 1], &[TopologyHint::new(None, true)]);
        assert_eq!(merged, hint(&[0, 1], true));
    }

    #[test]
    fn test_filter_providers_hints() {
        let filtered = filter_providers_hints(&[
            ProviderHints::new(),
            provider("a", None),
            provider("b", Some(vec![])),
            provider("c", Some(vec![hint(&[0], true)])),
        ]);
        assert_eq!(
            filtered,
            vec![
                vec![TopologyHint::new(None, true)],
                vec![TopologyHint::new(None, true)],
                vec![TopologyHint::new(None, false)],
                vec![hint(&[0], true)],
            ]
        );
    }

    #[test]
    fn test_iterate_permutations_order() {
        let a = vec![hint(&[0], true), hint(&[1], true)];
        let b = vec![hint(&[0], false), hint(&[1], false), hint(&[0, 1], false)];
        let mut seen = Vec::new();
        iterate_all_provider_topology_hints(&[a.clone(), b.clone()], |p| seen.push(p));

        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![a[0], b[0]]);
        assert_eq!(seen[2], vec![a[0], b[2]]);
        assert_eq!(seen[3], vec![a[1], b[0]]);
    }

    #[test]
    fn test_iterate_permutations_edge_cases() {
        let mut calls = 0;
        iterate_all_provider_topology_hints(&[], |p| {
            assert!(p.is_empty());
            calls += 1;
        });
        assert_eq!(calls, 1);

        calls = 0;
        iterate_all_provider_topology_hints(&[vec![hint(&[0], true)], vec![]], |_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_best_effort_picks_narrowest_preferred() {
        let hints = [
            provider(
                "cpu",
                Some(vec![hint(&[0], true), hint(&[1], true), hint(&[0, 1], false)]),
            ),
            provider(
                "gpu",
                Some(vec![hint(&[1], true), hint(&[0, 1], false)]),
            ),
        ];
        assert_eq!(policy(PolicyKind::BestEffort).merge(&hints), (hint(&[1], true), true));
    }

    #[test]
    fn test_best_effort_admits_unaligned() {
        let hints = [
            provider("cpu", Some(vec![hint(&[0], true)])),
            provider("gpu", Some(vec![hint(&[1], true)])),
        ];
        let (merged, admit) = policy(PolicyKind::BestEffort).merge(&hints);
        assert!(admit);
        assert_eq!(merged, hint(&[0, 1], false));
    }

    #[test]
    fn test_restricted_rejects_unaligned() {
        let hints = [
            provider("cpu", Some(vec![hint(&[0], true)])),
            provider("gpu", Some(vec![hint(&[1], true)])),
        ];
        let (merged, admit) = policy(PolicyKind::Restricted).merge(&hints);
        assert!(!admit);
        assert!(!merged.preferred);
    }

    #[test]
    fn test_restricted_admits_dont_care() {
        let (merged, admit) = policy(PolicyKind::Restricted).merge(&[ProviderHints::new()]);
        assert!(admit);
        assert_eq!(merged, hint(&[0, 1], true));
    }

    #[test]
    fn test_empty_list_is_not_preferred() {
        let (merged, admit) = policy(PolicyKind::Restricted).merge(&[provider("gpu", Some(vec![]))]);
        assert!(!admit);
        assert_eq!(merged, hint(&[0, 1], false));
    }

    #[test]
    fn test_single_numa_node_filters_wide_hints() {
        let hints = [provider(
            "cpu",
            Some(vec![hint(&[0, 1], true)]),
        )];
        let (merged, admit) = policy(PolicyKind::SingleNumaNode).merge(&hints);
        assert!(!admit);
        assert_eq!(merged, TopologyHint::new(None, false));
    }

    #[test]
    fn test_single_numa_node_admits_single_node() {
        let hints = [
            provider("cpu", Some(vec![hint(&[0], true), hint(&[1], true)])),
            provider("gpu", Some(vec![hint(&[1], true), hint(&[0, 1], false)])),
        ];
        assert_eq!(
            policy(PolicyKind::SingleNumaNode).merge(&hints),
            (hint(&[1], true), true)
        );
    }

    #[test]
    fn test_single_numa_node_dont_care_is_admitted() {
        let (merged, admit) = policy(PolicyKind::SingleNumaNode).merge(&[provider("cpu", None)]);
        assert!(admit);
        assert_eq!(merged, TopologyHint::new(None, true));
    }

    #[test]
    fn test_none_policy_admits_without_merging() {
        let hints = [provider("gpu", Some(vec![]))];
        assert_eq!(
            policy(PolicyKind::None).merge(&hints),
            (TopologyHint::default(), true)
        );
    }
}
