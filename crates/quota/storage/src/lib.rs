//! Quota ledger storage abstractions.
//!
//! This crate defines the storage contract the ledger engine runs on:
//! - named policies and the resource registry (create-only definitions)
//! - holding rows with their accumulators
//! - pending and resolved commissions
//! - the idempotency index of consumed `(caller, client serial)` pairs
//! - the append-only, hash-linked provision log
//!
//! Every mutation goes through a [`QuotaTransaction`] that locks rows in a
//! single global order (see [`LockKey`]) and commits atomically.
//!
//! Design stance:
//! - Postgres is the transactional source of truth.
//! - The in-memory adapter mirrors its locking semantics for tests and
//!   single-process deployments.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use model::{
    first_broken_link, provision_log_hash, CallSerialRecord, LogWindow, ProvisionLogAppend,
    ProvisionLogRecord,
};
pub use traits::{
    plan_acquisition, CommissionReader, HoldingReader, LockKey, PolicyStore, ProvisionLogStore,
    QuotaStorage, QuotaTransaction, TransactionalStore,
};
