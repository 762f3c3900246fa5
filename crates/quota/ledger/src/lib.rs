//! Quota ledger engine.
//!
//! A central authority that arbitrates finite resource quotas (CPU, RAM,
//! disk, object counts) between independent services through a two-phase
//! reservation protocol:
//!
//! 1. `issue_commission` validates and reserves every provision atomically,
//!    recording a pending commission and returning its serial.
//! 2. Once the real side effect is known, the caller accepts the serial
//!    (pending amounts become committed) or rejects it (they are undone).
//!
//! Holdings are locked in a fixed global order, so commissions touching
//! overlapping holdings never deadlock. Issue calls carrying a client serial
//! are idempotent per caller. Resolved provisions land in a hash-linked
//! provision log.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod admission;
mod audit;
mod commission;
pub mod config;
mod context;
pub mod dedup;
mod engine;
mod error;
pub mod telemetry;

pub use config::{AdmissionConfig, LedgerConfig, LoggingConfig, StorageConfig};
pub use context::CallContext;
pub use dedup::SerialDeduper;
pub use engine::QuotaLedger;
pub use error::{LedgerError, LedgerResult};
pub use quota_storage::{LogWindow, ProvisionLogAppend, ProvisionLogRecord};
pub use quota_types::*;
