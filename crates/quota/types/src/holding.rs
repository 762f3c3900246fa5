//! Holding rows and their accumulators.

use crate::ids::HoldingKey;
use crate::policy::QuotaPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The eight accumulators of a holding.
///
/// `imported/released` track inbound flow and its reversal, `exported/returned`
/// outbound flow and its reversal. The `-ing` counterparts carry amounts of
/// commissions that are still pending and drop back to zero once those
/// commissions are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingCounters {
    pub imported: u64,
    pub released: u64,
    pub exported: u64,
    pub returned: u64,
    pub importing: u64,
    pub releasing: u64,
    pub exporting: u64,
    pub returning: u64,
}

impl HoldingCounters {
    /// Committed inbound quantity still held.
    pub fn held(&self) -> u64 {
        self.imported.saturating_sub(self.released)
    }

    /// Quantity counted against capacity: committed plus pending imports.
    ///
    /// Pending releases free capacity only once accepted.
    pub fn usage(&self) -> u64 {
        self.held().saturating_add(self.importing)
    }

    /// Committed outbound quantity not yet returned.
    pub fn outstanding_exports(&self) -> u64 {
        self.exported.saturating_sub(self.returned)
    }

    /// Quantity the holding can still lend out or give back.
    pub fn available_stock(&self) -> u64 {
        self.held()
            .saturating_sub(self.outstanding_exports())
            .saturating_sub(self.exporting)
            .saturating_sub(self.releasing)
    }

    /// Outstanding exports that can still be returned to this holding.
    pub fn returnable(&self) -> u64 {
        self.outstanding_exports().saturating_sub(self.returning)
    }

    pub fn has_pending(&self) -> bool {
        self.importing != 0 || self.releasing != 0 || self.exporting != 0 || self.returning != 0
    }

    /// No committed quantity is held or lent out.
    pub fn is_settled(&self) -> bool {
        self.held() == 0 && self.outstanding_exports() == 0
    }

    /// Checks `imported >= released` and `exported >= returned`.
    pub fn is_consistent(&self) -> bool {
        self.imported >= self.released && self.exported >= self.returned
    }
}

/// One holder's accounting row for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub key: HoldingKey,
    pub policy: QuotaPolicy,
    /// Name of the policy template last applied, if any.
    #[serde(default)]
    pub policy_name: Option<String>,
    pub counters: HoldingCounters,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    pub fn new(key: HoldingKey, policy: QuotaPolicy, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            policy,
            policy_name: None,
            counters: HoldingCounters::default(),
            updated_at: created_at,
        }
    }

    pub fn view(&self) -> QuotaView {
        QuotaView {
            key: self.key.clone(),
            policy: self.policy.clone(),
            policy_name: self.policy_name.clone(),
            counters: self.counters,
            exists: true,
        }
    }
}

/// Read model returned by quota queries.
///
/// Unknown holdings read as the all-zero default with `exists == false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaView {
    pub key: HoldingKey,
    pub policy: QuotaPolicy,
    pub policy_name: Option<String>,
    pub counters: HoldingCounters,
    pub exists: bool,
}

impl QuotaView {
    pub fn unset(key: HoldingKey) -> Self {
        Self {
            key,
            policy: QuotaPolicy::default(),
            policy_name: None,
            counters: HoldingCounters::default(),
            exists: false,
        }
    }

    pub fn limit(&self) -> u64 {
        self.policy.capacity
    }
}

/// Administrative override of a holding's accumulators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingReset {
    pub key: HoldingKey,
    pub counters: HoldingCounters,
}

impl HoldingReset {
    pub fn new(key: HoldingKey, counters: HoldingCounters) -> Self {
        Self { key, counters }
    }

    /// Reset to all-zero accumulators.
    pub fn zeroed(key: HoldingKey) -> Self {
        Self::new(key, HoldingCounters::default())
    }
}
