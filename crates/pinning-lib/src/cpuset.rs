//! Immutable sets of logical CPU IDs.
//!
//! A [`CpuSet`] renders and parses the Linux list format used by sysfs and
//! cgroup `cpuset.cpus` files, e.g. `0-3,8,10-11`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a CPU list string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuSetParseError {
    #[error("invalid cpu id '{0}'")]
    InvalidId(String),

    #[error("invalid cpu range '{0}': start is greater than end")]
    InvertedRange(String),
}

/// An immutable set of logical CPU IDs. Every operation returns a new set.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet {
    elems: BTreeSet<usize>,
}

impl CpuSet {
    /// Builds a set from any collection of CPU IDs.
    pub fn new(cpus: impl IntoIterator<Item = usize>) -> Self {
        Self {
            elems: cpus.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.elems.contains(&cpu)
    }

    /// Returns the CPUs matching the predicate.
    pub fn filter(&self, predicate: impl Fn(usize) -> bool) -> Self {
        self.iter().filter(|&cpu| predicate(cpu)).collect()
    }

    /// Returns the CPUs not matching the predicate.
    pub fn filter_not(&self, predicate: impl Fn(usize) -> bool) -> Self {
        self.iter().filter(|&cpu| !predicate(cpu)).collect()
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.elems.is_subset(&other.elems)
    }

    pub fn is_superset_of(&self, other: &CpuSet) -> bool {
        self.elems.is_superset(&other.elems)
    }

    pub fn union(&self, other: &CpuSet) -> Self {
        Self {
            elems: self.elems.union(&other.elems).copied().collect(),
        }
    }

    /// Union of this set with every set in `others`.
    pub fn union_all<'a>(&self, others: impl IntoIterator<Item = &'a CpuSet>) -> Self {
        let mut elems = self.elems.clone();
        for other in others {
            elems.extend(other.elems.iter().copied());
        }
        Self { elems }
    }

    pub fn intersection(&self, other: &CpuSet) -> Self {
        Self {
            elems: self.elems.intersection(&other.elems).copied().collect(),
        }
    }

    pub fn difference(&self, other: &CpuSet) -> Self {
        Self {
            elems: self.elems.difference(&other.elems).copied().collect(),
        }
    }

    /// CPU IDs in ascending order.
    pub fn to_vec(&self) -> Vec<usize> {
        self.elems.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.elems.iter().copied()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for cpu in self.iter() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }

        let rendered: Vec<String> = ranges
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect();
        f.write_str(&rendered.join(","))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({self})")
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut elems = BTreeSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::empty());
        }

        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_id(start)?;
                    let end = parse_id(end)?;
                    if start > end {
                        return Err(CpuSetParseError::InvertedRange(part.to_string()));
                    }
                    elems.extend(start..=end);
                }
                None => {
                    elems.insert(parse_id(part)?);
                }
            }
        }

        Ok(Self { elems })
    }
}

fn parse_id(s: &str) -> Result<usize, CpuSetParseError> {
    s.trim()
        .parse::<usize>()
        .map_err(|_| CpuSetParseError::InvalidId(s.to_string()))
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
