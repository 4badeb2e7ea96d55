//! Resource offers as presented by the master.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The default role every framework may consume from.
pub const DEFAULT_ROLE: &str = "*";

/// A contiguous inclusive range of integer values (ports, mostly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub begin: u64,
    pub end: u64,
}

impl ValueRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, value: u64) -> bool {
        (self.begin..=self.end).contains(&value)
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// The typed quantity of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceValue {
    Scalar { value: f64 },
    Ranges { ranges: Vec<ValueRange> },
    Set { items: BTreeSet<String> },
}

/// One role-tagged resource inside an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub value: ResourceValue,
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

impl Resource {
    pub fn scalar(name: &str, role: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            value: ResourceValue::Scalar { value },
        }
    }

    pub fn ranges(name: &str, role: &str, ranges: Vec<ValueRange>) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            value: ResourceValue::Ranges { ranges },
        }
    }

    pub fn set(name: &str, role: &str, items: BTreeSet<String>) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            value: ResourceValue::Set { items },
        }
    }

    /// Scalar quantity, zero for other kinds.
    pub fn scalar_value(&self) -> f64 {
        match &self.value {
            ResourceValue::Scalar { value } => *value,
            _ => 0.0,
        }
    }
}

/// A bundle of resources available on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Offer {
    /// Total scalar quantity of a named resource across accepted roles.
    pub fn scalar_total(&self, name: &str, accepted_roles: &BTreeSet<String>) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name && accepted_roles.contains(&r.role))
            .map(Resource::scalar_value)
            .sum()
    }

    /// All port ranges across accepted roles, tagged with their role.
    pub fn port_ranges(&self, accepted_roles: &BTreeSet<String>) -> Vec<(String, ValueRange)> {
        let mut out = Vec::new();
        for resource in &self.resources {
            if resource.name != "ports" || !accepted_roles.contains(&resource.role) {
                continue;
            }
            if let ResourceValue::Ranges { ranges } = &resource.value {
                for range in ranges {
                    out.push((resource.role.clone(), *range));
                }
            }
        }
        out
    }

    /// The attribute value the constraint machinery sees for `field`.
    /// `hostname` is special-cased; everything else is an attribute.
    pub fn field_value(&self, field: &str) -> Option<String> {
        if field == "hostname" {
            return Some(self.hostname.clone());
        }
        self.attributes.get(field).cloned()
    }
}
