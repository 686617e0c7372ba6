//! Pod and container descriptions consumed by the resource managers

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";

/// Resource names managed by the node itself rather than a device plugin.
const NATIVE_RESOURCE_PREFIXES: &[&str] = &["cpu", "memory", "ephemeral-storage", "hugepages-"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityParseError {
    #[error("quantity '{0}' is empty")]
    Empty(String),

    #[error("quantity '{0}' has an invalid number")]
    InvalidNumber(String),

    #[error("quantity '{0}' has an unknown suffix")]
    UnknownSuffix(String),

    #[error("quantity '{0}' is too large")]
    Overflow(String),
}

/// A resource amount such as `500m`, `2` or `1Gi`, held in milli-units.
#[derive(Clone)]
pub struct Quantity {
    repr: String,
    milli: u128,
}

impl Quantity {
    /// A whole-unit quantity, e.g. `Quantity::from_units(2)` for two CPUs.
    pub fn from_units(units: u64) -> Self {
        Self {
            repr: units.to_string(),
            milli: u128::from(units) * 1000,
        }
    }

    pub fn milli_value(&self) -> u128 {
        self.milli
    }

    /// Value in whole units, rounded up.
    pub fn value(&self) -> u64 {
        u64::try_from(self.milli.div_ceil(1000)).unwrap_or(u64::MAX)
    }

    pub fn is_zero(&self) -> bool {
        self.milli == 0
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.milli == other.milli
    }
}

impl Eq for Quantity {}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quantity({})", self.repr)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl FromStr for Quantity {
    type Err = QuantityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let repr = s.trim();
        if repr.is_empty() {
            return Err(QuantityParseError::Empty(s.to_string()));
        }

        let split = repr
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(repr.len());
        let (number, suffix) = repr.split_at(split);

        // scale to milli-units
        let scale: u128 = match suffix {
            "m" => 1,
            "" => 1_000,
            "k" => 1_000_000,
            "M" => 1_000_000_000,
            "G" => 1_000_000_000_000,
            "T" => 1_000_000_000_000_000,
            "P" => 1_000_000_000_000_000_000,
            "E" => 1_000_000_000_000_000_000_000,
            "Ki" => 1_000 << 10,
            "Mi" => 1_000 << 20,
            "Gi" => 1_000 << 30,
            "Ti" => 1_000 << 40,
            "Pi" => 1_000 << 50,
            "Ei" => 1_000 << 60,
            _ => return Err(QuantityParseError::UnknownSuffix(s.to_string())),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.len() > 9 {
            return Err(QuantityParseError::InvalidNumber(s.to_string()));
        }
        let parse = |digits: &str| -> Result<u128, QuantityParseError> {
            if digits.is_empty() {
                return Ok(0);
            }
            digits
                .parse::<u128>()
                .map_err(|_| QuantityParseError::InvalidNumber(s.to_string()))
        };
        let whole = parse(whole)?;
        let fraction_value = parse(fraction)?;

        let denominator = 10u128.pow(fraction.len() as u32);
        let numerator = whole
            .checked_mul(denominator)
            .and_then(|n| n.checked_add(fraction_value))
            .and_then(|n| n.checked_mul(scale))
            .ok_or_else(|| QuantityParseError::Overflow(s.to_string()))?;

        Ok(Self {
            repr: repr.to_string(),
            milli: numerator.div_ceil(denominator),
        })
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.repr)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(Quantity::from_units(n)),
        }
    }
}

/// Requests and limits of a single container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub limits: BTreeMap<String, Quantity>,
}

impl ResourceRequirements {
    /// Effective request: the explicit request, or the limit when no request is set.
    pub fn request(&self, resource: &str) -> Option<&Quantity> {
        self.requests.get(resource).or_else(|| self.limits.get(resource))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    pub fn new(name: impl Into<String>, resources: ResourceRequirements) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }

    /// Limits of device-plugin resources (anything not cpu, memory, storage or hugepages).
    pub fn extended_resources(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.resources
            .limits
            .iter()
            .filter(|(name, _)| {
                !NATIVE_RESOURCE_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
            })
            .map(|(name, q)| (name.as_str(), q.value()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// A pod as submitted for admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub init_containers: Vec<Container>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

impl Pod {
    /// Stable container identifier: `<pod-uid>/<container-name>`.
    pub fn container_id(&self, container_name: &str) -> String {
        container_id(&self.uid, container_name)
    }

    pub fn is_init_container(&self, container_name: &str) -> bool {
        self.init_containers.iter().any(|c| c.name == container_name)
    }

    /// Init containers first, in declaration order, then app containers.
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.init_containers.iter().chain(self.containers.iter())
    }

    /// Quality-of-service class derived from cpu and memory requests/limits.
    ///
    /// Guaranteed requires every container to set both limits with matching
    /// (or absent) requests. BestEffort means nothing is set anywhere.
    pub fn qos_class(&self) -> QosClass {
        let compute = [RESOURCE_CPU, RESOURCE_MEMORY];

        let any_set = self.all_containers().any(|c| {
            compute.iter().any(|r| {
                let set = |m: &BTreeMap<String, Quantity>| m.get(*r).is_some_and(|q| !q.is_zero());
                set(&c.resources.requests) || set(&c.resources.limits)
            })
        });
        if !any_set {
            return QosClass::BestEffort;
        }

        let guaranteed = self.all_containers().all(|c| {
            compute.iter().all(|r| match c.resources.limits.get(*r) {
                Some(limit) if !limit.is_zero() => {
                    c.resources.requests.get(*r).map_or(true, |req| req == limit)
                }
                _ => false,
            })
        });

        if guaranteed {
            QosClass::Guaranteed
        } else {
            QosClass::Burstable
        }
    }
}

pub fn container_id(pod_uid: &str, container_name: &str) -> String {
    format!("{pod_uid}/{container_name}")
}
