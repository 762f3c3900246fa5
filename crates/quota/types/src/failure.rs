//! Per-key refusal reasons.
//!
//! Capacity and stock shortfalls are expected outcomes; they travel as data
//! so batch callers can tell exactly which `(holder, resource)` failed.

use crate::holding::QuotaView;
use crate::ids::{HolderId, HoldingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Import would push usage over capacity.
    NoCapacity {
        limit: u64,
        requested: u64,
        current: u64,
    },
    /// Source does not hold enough unlent stock.
    NoStock { limit: u64, requested: u64 },
    /// Source holding is not flagged exportable.
    NonExported,
    /// Pending imports would exceed the import limit.
    ImportLimit { limit: u64, requested: u64 },
    /// Pending exports would exceed the export limit.
    ExportLimit { limit: u64, requested: u64 },
    /// Limit adjustment would go below zero.
    NegativeLimit { limit: u64, delta: i64 },
    /// Limit adjustment would exceed the largest representable capacity.
    LimitOverflow { limit: u64, delta: i64 },
    /// A pending commission references the holding.
    PendingCommission,
    /// The holding still holds or lends out quantity.
    NonZeroUsage { held: u64, outstanding_exports: u64 },
    UnknownHolding,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoCapacity {
                limit,
                requested,
                current,
            } => write!(
                f,
                "no capacity: requested {requested} exceeds limit {limit} (current {current})"
            ),
            FailureReason::NoStock { limit, requested } => {
                write!(f, "no stock: requested {requested}, available {limit}")
            }
            FailureReason::NonExported => f.write_str("holding is not exportable"),
            FailureReason::ImportLimit { limit, requested } => {
                write!(f, "import limit {limit} exceeded (requested {requested})")
            }
            FailureReason::ExportLimit { limit, requested } => {
                write!(f, "export limit {limit} exceeded (requested {requested})")
            }
            FailureReason::NegativeLimit { limit, delta } => {
                write!(f, "limit {limit} adjusted by {delta} would be negative")
            }
            FailureReason::LimitOverflow { limit, delta } => {
                write!(f, "limit {limit} adjusted by {delta} overflows")
            }
            FailureReason::PendingCommission => {
                f.write_str("pending commission references holding")
            }
            FailureReason::NonZeroUsage {
                held,
                outstanding_exports,
            } => write!(
                f,
                "holding in use: held {held}, outstanding exports {outstanding_exports}"
            ),
            FailureReason::UnknownHolding => f.write_str("unknown holding"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: HoldingKey,
    pub reason: FailureReason,
}

impl KeyFailure {
    pub fn new(key: HoldingKey, reason: FailureReason) -> Self {
        Self { key, reason }
    }
}

impl fmt::Display for KeyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

/// Formats a failure list as `a/b: reason; c/d: reason`.
pub fn describe_failures(failures: &[KeyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Partition of a batch call into succeeded and rejected keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<HoldingKey>,
    pub rejected: Vec<KeyFailure>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Holdings grouped by holder; holders without holdings are listed apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingListing {
    pub holdings: BTreeMap<HolderId, Vec<QuotaView>>,
    pub rejected: Vec<HolderId>,
}
