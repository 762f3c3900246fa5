//! Quota ledger data model.
//!
//! Pure data shared by the storage layer and the ledger engine:
//! - identifiers (`HolderId`, `ResourceName`, `CallerId`, `Serial`, ...)
//! - limit policies and the resource registry
//! - holdings with their eight monotonic accumulators
//! - commissions, provisions and resolution reports
//! - per-key refusal reasons returned by batch and admission calls

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod commission;
mod failure;
mod holding;
mod ids;
mod policy;

pub use commission::{
    holding_keys, Commission, CommissionRequest, CommissionState, IssueOutcome, Provision,
    ProvisionKind, ResolutionReport,
};
pub use failure::{describe_failures, BatchOutcome, FailureReason, HoldingListing, KeyFailure};
pub use holding::{Holding, HoldingCounters, HoldingReset, QuotaView};
pub use ids::{CallerId, ClientSerial, HolderId, HoldingKey, ResourceName, Serial};
pub use policy::{QuotaDelta, QuotaFlag, QuotaPolicy, ResourceDefinition};
