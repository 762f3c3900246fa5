//! Commissions (two-phase reservations) and their provisions.

use crate::failure::KeyFailure;
use crate::ids::{CallerId, ClientSerial, HolderId, HoldingKey, ResourceName, Serial};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a provision relative to the commission target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionKind {
    /// Quantity flows from the source into the target.
    Import,
    /// Quantity flows from the target back out to the source.
    Export,
}

/// One line item of a commission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    /// `None` is the unlimited root source.
    pub source: Option<HolderId>,
    pub resource: ResourceName,
    pub kind: ProvisionKind,
    pub quantity: u64,
}

impl Provision {
    pub fn import(source: Option<HolderId>, resource: impl Into<String>, quantity: u64) -> Self {
        Self {
            source,
            resource: ResourceName::new(resource),
            kind: ProvisionKind::Import,
            quantity,
        }
    }

    pub fn export(source: Option<HolderId>, resource: impl Into<String>, quantity: u64) -> Self {
        Self {
            source,
            resource: ResourceName::new(resource),
            kind: ProvisionKind::Export,
            quantity,
        }
    }

    /// Import from the unlimited root.
    pub fn grant(resource: impl Into<String>, quantity: u64) -> Self {
        Self::import(None, resource, quantity)
    }

    /// Export back to the unlimited root.
    pub fn release(resource: impl Into<String>, quantity: u64) -> Self {
        Self::export(None, resource, quantity)
    }

    pub fn target_key(&self, target: &HolderId) -> HoldingKey {
        HoldingKey::from_parts(target.clone(), self.resource.clone())
    }

    pub fn source_key(&self) -> Option<HoldingKey> {
        self.source
            .as_ref()
            .map(|holder| HoldingKey::from_parts(holder.clone(), self.resource.clone()))
    }
}

/// Lifecycle state of a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionState {
    Pending,
    Accepted,
    Rejected,
}

impl CommissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommissionState::Pending => "pending",
            CommissionState::Accepted => "accepted",
            CommissionState::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommissionState::Pending),
            "accepted" => Some(CommissionState::Accepted),
            "rejected" => Some(CommissionState::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CommissionState::Pending)
    }
}

impl fmt::Display for CommissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks the ledger to reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRequest {
    #[serde(default)]
    pub client_serial: Option<ClientSerial>,
    pub target: HolderId,
    #[serde(default)]
    pub name: String,
    pub provisions: Vec<Provision>,
}

impl CommissionRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            client_serial: None,
            target: HolderId::new(target),
            name: String::new(),
            provisions: Vec::new(),
        }
    }

    pub fn with_client_serial(mut self, token: impl Into<String>) -> Self {
        self.client_serial = Some(ClientSerial::new(token));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_provision(mut self, provision: Provision) -> Self {
        self.provisions.push(provision);
        self
    }
}

/// Persisted commission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub serial: Serial,
    pub caller: CallerId,
    pub client_serial: Option<ClientSerial>,
    pub target: HolderId,
    pub name: String,
    pub provisions: Vec<Provision>,
    pub issued_at: DateTime<Utc>,
    pub state: CommissionState,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Commission {
    /// Every holding the commission touches, in lock order, without duplicates.
    pub fn holding_keys(&self) -> Vec<HoldingKey> {
        holding_keys(&self.target, &self.provisions)
    }

    pub fn is_pending(&self) -> bool {
        self.state == CommissionState::Pending
    }
}

/// Keys touched by `provisions` against `target`, sorted and deduplicated.
pub fn holding_keys(target: &HolderId, provisions: &[Provision]) -> Vec<HoldingKey> {
    let mut keys = provisions
        .iter()
        .flat_map(|p| std::iter::once(p.target_key(target)).chain(p.source_key()))
        .collect::<Vec<_>>();
    keys.sort();
    keys.dedup();
    keys
}

/// Cached result of an issue call, replayed for duplicate client serials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssueOutcome {
    Issued { serial: Serial },
    Refused { failures: Vec<KeyFailure> },
}

/// Result of accept/reject/resolve calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub accepted: Vec<Serial>,
    pub rejected: Vec<Serial>,
    /// Serials that were already resolved, with their prior outcome.
    pub previously_resolved: Vec<(Serial, CommissionState)>,
    /// Unknown serials and serials owned by another caller.
    pub skipped: Vec<Serial>,
}

impl ResolutionReport {
    pub fn resolved_count(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }
}
