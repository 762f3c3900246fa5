use crate::model::{CallSerialRecord, LogWindow, ProvisionLogAppend, ProvisionLogRecord};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quota_types::{
    CallerId, ClientSerial, Commission, CommissionState, HolderId, Holding, HoldingKey,
    QuotaPolicy, ResourceDefinition, ResourceName, Serial,
};
use std::fmt;

/// Row lock identity.
///
/// The derived ordering is the global acquisition order: idempotency rows,
/// then commissions by serial, then holdings by `(holder, resource)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    CallSerial(CallerId, ClientSerial),
    Commission(Serial),
    Holding(HoldingKey),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::CallSerial(caller, token) => {
                write!(f, "call:{}\u{1f}{}", caller.as_str(), token)
            }
            LockKey::Commission(serial) => write!(f, "commission:{}", serial.0),
            LockKey::Holding(key) => write!(
                f,
                "holding:{}\u{1f}{}",
                key.holder.as_str(),
                key.resource.as_str()
            ),
        }
    }
}

/// Named policy templates and the resource registry. Definitions are create-only.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fails with `Conflict` if `name` is already defined.
    async fn define_policy(&self, name: &str, policy: QuotaPolicy) -> StorageResult<()>;
    async fn get_policy(&self, name: &str) -> StorageResult<Option<QuotaPolicy>>;

    /// Fails with `Conflict` if the resource is already registered.
    async fn define_resource(&self, definition: ResourceDefinition) -> StorageResult<()>;
    async fn get_resource(&self, name: &ResourceName) -> StorageResult<Option<ResourceDefinition>>;
    async fn list_resources(&self) -> StorageResult<Vec<ResourceDefinition>>;
}

/// Committed-state reads of holdings.
#[async_trait]
pub trait HoldingReader: Send + Sync {
    async fn get_holding(&self, key: &HoldingKey) -> StorageResult<Option<Holding>>;

    /// Holdings of one holder ordered by resource.
    async fn list_holdings(&self, holder: &HolderId) -> StorageResult<Vec<Holding>>;
}

/// Committed-state reads of commissions.
#[async_trait]
pub trait CommissionReader: Send + Sync {
    async fn get_commission(&self, serial: Serial) -> StorageResult<Option<Commission>>;

    /// Ascending serials still pending for `caller`.
    async fn pending_serials(&self, caller: &CallerId) -> StorageResult<Vec<Serial>>;
}

/// Read side of the append-only provision log.
#[async_trait]
pub trait ProvisionLogStore: Send + Sync {
    /// Records in ascending sequence order.
    async fn list_provision_log(&self, window: LogWindow) -> StorageResult<Vec<ProvisionLogRecord>>;
    async fn provision_log_for(&self, serial: Serial) -> StorageResult<Vec<ProvisionLogRecord>>;
    async fn latest_log_hash(&self) -> StorageResult<Option<String>>;
}

/// Opens serializable transactions over holdings and commissions.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> StorageResult<Box<dyn QuotaTransaction>>;
}

/// One atomic unit of work.
///
/// Writes are visible to other callers only after `commit`. Dropping the
/// transaction without committing discards every staged write and releases
/// its locks.
#[async_trait]
pub trait QuotaTransaction: Send {
    /// Acquires row locks, held until commit or drop.
    ///
    /// `keys` must be ascending and must not sort before a key this
    /// transaction already holds; already-held keys are skipped.
    async fn lock(&mut self, keys: &[LockKey]) -> StorageResult<()>;

    async fn holding(&mut self, key: &HoldingKey) -> StorageResult<Option<Holding>>;
    async fn put_holding(&mut self, holding: Holding) -> StorageResult<()>;
    async fn delete_holding(&mut self, key: &HoldingKey) -> StorageResult<()>;

    /// Whether any pending commission has a provision touching `key`.
    async fn holding_is_referenced(&mut self, key: &HoldingKey) -> StorageResult<bool>;

    async fn call_serial(
        &mut self,
        caller: &CallerId,
        client_serial: &ClientSerial,
    ) -> StorageResult<Option<CallSerialRecord>>;

    /// Fails with `Conflict` if the token was already consumed.
    async fn record_call_serial(&mut self, record: CallSerialRecord) -> StorageResult<()>;

    async fn next_serial(&mut self) -> StorageResult<Serial>;
    async fn commission(&mut self, serial: Serial) -> StorageResult<Option<Commission>>;
    async fn insert_commission(&mut self, commission: Commission) -> StorageResult<()>;

    /// Moves a pending commission to a terminal state and drops its pending
    /// provision rows.
    async fn resolve_commission(
        &mut self,
        serial: Serial,
        state: CommissionState,
        resolved_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn append_provision_log(&mut self, entry: ProvisionLogAppend) -> StorageResult<()>;

    async fn commit(&mut self) -> StorageResult<()>;
}

/// Unified storage bundle used by the ledger engine.
pub trait QuotaStorage:
    PolicyStore
    + HoldingReader
    + CommissionReader
    + ProvisionLogStore
    + TransactionalStore
    + Send
    + Sync
{
}

impl<T> QuotaStorage for T where
    T: PolicyStore
        + HoldingReader
        + CommissionReader
        + ProvisionLogStore
        + TransactionalStore
        + Send
        + Sync
{
}

/// Rejects out-of-order acquisition and filters keys already held.
///
/// Returns the keys that still need acquiring.
pub fn plan_acquisition(
    held: &std::collections::BTreeSet<LockKey>,
    keys: &[LockKey],
) -> StorageResult<Vec<LockKey>> {
    let mut pending: Vec<LockKey> = Vec::with_capacity(keys.len());
    let mut last: Option<LockKey> = held.iter().next_back().cloned();
    for key in keys {
        if held.contains(key) || last.as_ref() == Some(key) {
            continue;
        }
        if let Some(previous) = &last {
            if key < previous {
                return Err(crate::StorageError::InvariantViolation(format!(
                    "lock order violation: {key} requested after {previous}"
                )));
            }
        }
        pending.push(key.clone());
        last = Some(key.clone());
    }
    Ok(pending)
}
