//! Limit configuration attachable to holdings.

use crate::ids::{HoldingKey, ResourceName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Named behaviour switches on a holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaFlag {
    /// The holding may act as the source of a provision (lend stock out).
    Exportable,
    /// Capacity checks are skipped for imports into the holding.
    AllowOverLimit,
}

/// Limit template for a holding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Maximum usage (`imported - released + importing`).
    pub capacity: u64,
    /// Maximum pending imports at any time. `None` is unlimited.
    #[serde(default)]
    pub import_limit: Option<u64>,
    /// Maximum pending exports at any time. `None` is unlimited.
    #[serde(default)]
    pub export_limit: Option<u64>,
    #[serde(default)]
    pub flags: BTreeSet<QuotaFlag>,
}

impl QuotaPolicy {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn import_limit(mut self, limit: u64) -> Self {
        self.import_limit = Some(limit);
        self
    }

    pub fn export_limit(mut self, limit: u64) -> Self {
        self.export_limit = Some(limit);
        self
    }

    pub fn flag(mut self, flag: QuotaFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn has_flag(&self, flag: QuotaFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_exportable(&self) -> bool {
        self.has_flag(QuotaFlag::Exportable)
    }

    pub fn allows_over_limit(&self) -> bool {
        self.has_flag(QuotaFlag::AllowOverLimit)
    }
}

/// Registered resource with the policy seeded into new holdings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: ResourceName,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_policy: QuotaPolicy,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: ResourceName::new(name),
            unit: None,
            description: String::new(),
            default_policy: QuotaPolicy::default(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default_policy(mut self, policy: QuotaPolicy) -> Self {
        self.default_policy = policy;
        self
    }
}

/// Signed capacity adjustment for one holding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDelta {
    pub key: HoldingKey,
    pub capacity: i64,
}

impl QuotaDelta {
    pub fn new(key: HoldingKey, capacity: i64) -> Self {
        Self { key, capacity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_builder_sets_flags_and_limits() {
        let policy = QuotaPolicy::with_capacity(10)
            .import_limit(4)
            .flag(QuotaFlag::Exportable);
        assert_eq!(policy.capacity, 10);
        assert_eq!(policy.import_limit, Some(4));
        assert!(policy.export_limit.is_none());
        assert!(policy.is_exportable());
        assert!(!policy.allows_over_limit());
    }

    #[test]
    fn flags_serialize_snake_case() {
        let policy = QuotaPolicy::with_capacity(1).flag(QuotaFlag::AllowOverLimit);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["flags"][0], "allow_over_limit");

        let back: QuotaPolicy = serde_json::from_value(serde_json::json!({"capacity": 3})).unwrap();
        assert_eq!(back, QuotaPolicy::with_capacity(3));
    }
}
