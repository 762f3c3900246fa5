//! In-memory reference implementation of the quota storage traits.
//!
//! Row locks are per-key async mutexes acquired in `LockKey` order and held
//! until the transaction commits or is dropped. Staged writes are applied
//! under a single short write lock at commit. Deterministic and
//! test-friendly; production deployments should use a transactional backend
//! (e.g. PostgreSQL) as the source of truth.

use crate::model::{
    apply_window, provision_log_hash, CallSerialRecord, LogWindow, ProvisionLogAppend,
    ProvisionLogRecord,
};
use crate::traits::{
    plan_acquisition, CommissionReader, HoldingReader, LockKey, PolicyStore, ProvisionLogStore,
    QuotaTransaction, TransactionalStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quota_types::{
    CallerId, ClientSerial, Commission, CommissionState, HolderId, Holding, HoldingKey,
    QuotaPolicy, ResourceDefinition, ResourceName, Serial,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
struct LedgerTables {
    policies: HashMap<String, QuotaPolicy>,
    resources: BTreeMap<ResourceName, ResourceDefinition>,
    holdings: BTreeMap<HoldingKey, Holding>,
    commissions: BTreeMap<Serial, Commission>,
    /// Pending serials per holding they reference.
    pending_by_holding: BTreeMap<HoldingKey, BTreeSet<Serial>>,
    call_serials: HashMap<(CallerId, ClientSerial), CallSerialRecord>,
    provision_log: Vec<ProvisionLogRecord>,
}

impl LedgerTables {
    fn store_commission(&mut self, commission: Commission) {
        for key in commission.holding_keys() {
            if commission.is_pending() {
                self.pending_by_holding
                    .entry(key)
                    .or_default()
                    .insert(commission.serial);
            } else if let Some(serials) = self.pending_by_holding.get_mut(&key) {
                serials.remove(&commission.serial);
                if serials.is_empty() {
                    self.pending_by_holding.remove(&key);
                }
            }
        }
        self.commissions.insert(commission.serial, commission);
    }

    fn pending_serials_for(&self, key: &HoldingKey) -> impl Iterator<Item = Serial> + '_ {
        self.pending_by_holding.get(key).into_iter().flatten().copied()
    }
}

#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    fn slot(&self, key: &LockKey) -> StorageResult<Arc<AsyncMutex<()>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StorageError::poisoned("lock table"))?;
        Ok(Arc::clone(slots.entry(key.clone()).or_default()))
    }

    /// Drops slots nobody holds or waits on.
    fn prune(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}

/// In-memory quota storage adapter.
#[derive(Default, Clone)]
pub struct InMemoryQuotaStorage {
    tables: Arc<RwLock<LedgerTables>>,
    locks: Arc<LockTable>,
    serials: Arc<AtomicU64>,
}

impl InMemoryQuotaStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lock slots currently allocated.
    pub fn active_lock_slots(&self) -> usize {
        self.locks.len()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, LedgerTables>> {
        read_tables(&self.tables)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, LedgerTables>> {
        write_tables(&self.tables)
    }
}

fn read_tables(tables: &RwLock<LedgerTables>) -> StorageResult<RwLockReadGuard<'_, LedgerTables>> {
    tables
        .read()
        .map_err(|_| StorageError::poisoned("ledger tables"))
}

fn write_tables(
    tables: &RwLock<LedgerTables>,
) -> StorageResult<RwLockWriteGuard<'_, LedgerTables>> {
    tables
        .write()
        .map_err(|_| StorageError::poisoned("ledger tables"))
}

#[async_trait]
impl PolicyStore for InMemoryQuotaStorage {
    async fn define_policy(&self, name: &str, policy: QuotaPolicy) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard.policies.contains_key(name) {
            return Err(StorageError::Conflict(format!(
                "policy {name} already exists"
            )));
        }
        guard.policies.insert(name.to_string(), policy);
        Ok(())
    }

    async fn get_policy(&self, name: &str) -> StorageResult<Option<QuotaPolicy>> {
        Ok(self.read()?.policies.get(name).cloned())
    }

    async fn define_resource(&self, definition: ResourceDefinition) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard.resources.contains_key(&definition.name) {
            return Err(StorageError::Conflict(format!(
                "resource {} already exists",
                definition.name
            )));
        }
        guard.resources.insert(definition.name.clone(), definition);
        Ok(())
    }

    async fn get_resource(&self, name: &ResourceName) -> StorageResult<Option<ResourceDefinition>> {
        Ok(self.read()?.resources.get(name).cloned())
    }

    async fn list_resources(&self) -> StorageResult<Vec<ResourceDefinition>> {
        Ok(self.read()?.resources.values().cloned().collect())
    }
}

#[async_trait]
impl HoldingReader for InMemoryQuotaStorage {
    async fn get_holding(&self, key: &HoldingKey) -> StorageResult<Option<Holding>> {
        Ok(self.read()?.holdings.get(key).cloned())
    }

    async fn list_holdings(&self, holder: &HolderId) -> StorageResult<Vec<Holding>> {
        let guard = self.read()?;
        Ok(guard
            .holdings
            .values()
            .filter(|holding| &holding.key.holder == holder)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommissionReader for InMemoryQuotaStorage {
    async fn get_commission(&self, serial: Serial) -> StorageResult<Option<Commission>> {
        Ok(self.read()?.commissions.get(&serial).cloned())
    }

    async fn pending_serials(&self, caller: &CallerId) -> StorageResult<Vec<Serial>> {
        let guard = self.read()?;
        Ok(guard
            .commissions
            .values()
            .filter(|commission| commission.is_pending() && &commission.caller == caller)
            .map(|commission| commission.serial)
            .collect())
    }
}

#[async_trait]
impl ProvisionLogStore for InMemoryQuotaStorage {
    async fn list_provision_log(
        &self,
        window: LogWindow,
    ) -> StorageResult<Vec<ProvisionLogRecord>> {
        let values = self.read()?.provision_log.clone();
        Ok(apply_window(values, window))
    }

    async fn provision_log_for(&self, serial: Serial) -> StorageResult<Vec<ProvisionLogRecord>> {
        let guard = self.read()?;
        Ok(guard
            .provision_log
            .iter()
            .filter(|record| record.entry.serial == serial)
            .cloned()
            .collect())
    }

    async fn latest_log_hash(&self) -> StorageResult<Option<String>> {
        Ok(self.read()?.provision_log.last().map(|r| r.hash.clone()))
    }
}

#[async_trait]
impl TransactionalStore for InMemoryQuotaStorage {
    async fn begin(&self) -> StorageResult<Box<dyn QuotaTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            locks: Arc::clone(&self.locks),
            serials: Arc::clone(&self.serials),
            held: BTreeSet::new(),
            guards: Vec::new(),
            staged: StagedWrites::default(),
            committed: false,
        }))
    }
}

#[derive(Default)]
struct StagedWrites {
    /// `None` marks a deletion.
    holdings: BTreeMap<HoldingKey, Option<Holding>>,
    commissions: BTreeMap<Serial, Commission>,
    call_serials: Vec<CallSerialRecord>,
    log: Vec<ProvisionLogAppend>,
}

/// Transaction over [`InMemoryQuotaStorage`].
pub struct InMemoryTransaction {
    tables: Arc<RwLock<LedgerTables>>,
    locks: Arc<LockTable>,
    serials: Arc<AtomicU64>,
    held: BTreeSet<LockKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    staged: StagedWrites,
    committed: bool,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.committed {
            return Err(StorageError::already_committed());
        }
        Ok(())
    }

    fn release(&mut self) {
        self.guards.clear();
        self.held.clear();
        self.locks.prune();
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl QuotaTransaction for InMemoryTransaction {
    async fn lock(&mut self, keys: &[LockKey]) -> StorageResult<()> {
        self.ensure_open()?;
        for key in plan_acquisition(&self.held, keys)? {
            let slot = self.locks.slot(&key)?;
            let guard = slot.lock_owned().await;
            self.guards.push(guard);
            self.held.insert(key);
        }
        Ok(())
    }

    async fn holding(&mut self, key: &HoldingKey) -> StorageResult<Option<Holding>> {
        if let Some(staged) = self.staged.holdings.get(key) {
            return Ok(staged.clone());
        }
        Ok(read_tables(&self.tables)?.holdings.get(key).cloned())
    }

    async fn put_holding(&mut self, holding: Holding) -> StorageResult<()> {
        self.ensure_open()?;
        self.staged
            .holdings
            .insert(holding.key.clone(), Some(holding));
        Ok(())
    }

    async fn delete_holding(&mut self, key: &HoldingKey) -> StorageResult<()> {
        self.ensure_open()?;
        self.staged.holdings.insert(key.clone(), None);
        Ok(())
    }

    async fn holding_is_referenced(&mut self, key: &HoldingKey) -> StorageResult<bool> {
        let staged = &self.staged.commissions;
        if staged
            .values()
            .any(|commission| commission.is_pending() && commission.holding_keys().contains(key))
        {
            return Ok(true);
        }
        // A staged resolution shadows the committed pending entry.
        let guard = read_tables(&self.tables)?;
        let referenced = guard
            .pending_serials_for(key)
            .any(|serial| !staged.contains_key(&serial));
        Ok(referenced)
    }

    async fn call_serial(
        &mut self,
        caller: &CallerId,
        client_serial: &ClientSerial,
    ) -> StorageResult<Option<CallSerialRecord>> {
        if let Some(record) = self
            .staged
            .call_serials
            .iter()
            .find(|r| &r.caller == caller && &r.client_serial == client_serial)
        {
            return Ok(Some(record.clone()));
        }
        let guard = read_tables(&self.tables)?;
        Ok(guard
            .call_serials
            .get(&(caller.clone(), client_serial.clone()))
            .cloned())
    }

    async fn record_call_serial(&mut self, record: CallSerialRecord) -> StorageResult<()> {
        self.ensure_open()?;
        if self
            .call_serial(&record.caller, &record.client_serial)
            .await?
            .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "client serial {} already consumed by {}",
                record.client_serial, record.caller
            )));
        }
        self.staged.call_serials.push(record);
        Ok(())
    }

    async fn next_serial(&mut self) -> StorageResult<Serial> {
        self.ensure_open()?;
        Ok(Serial(self.serials.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn commission(&mut self, serial: Serial) -> StorageResult<Option<Commission>> {
        if let Some(staged) = self.staged.commissions.get(&serial) {
            return Ok(Some(staged.clone()));
        }
        Ok(read_tables(&self.tables)?.commissions.get(&serial).cloned())
    }

    async fn insert_commission(&mut self, commission: Commission) -> StorageResult<()> {
        self.ensure_open()?;
        if self.commission(commission.serial).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "commission {} already exists",
                commission.serial
            )));
        }
        self.staged
            .commissions
            .insert(commission.serial, commission);
        Ok(())
    }

    async fn resolve_commission(
        &mut self,
        serial: Serial,
        state: CommissionState,
        resolved_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let mut commission = self
            .commission(serial)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("commission {serial} not found")))?;
        if !commission.is_pending() || !state.is_terminal() {
            return Err(StorageError::InvariantViolation(format!(
                "cannot move commission {serial} from {} to {state}",
                commission.state
            )));
        }
        commission.state = state;
        commission.resolved_at = Some(resolved_at);
        self.staged.commissions.insert(serial, commission);
        Ok(())
    }

    async fn append_provision_log(&mut self, entry: ProvisionLogAppend) -> StorageResult<()> {
        self.ensure_open()?;
        self.staged.log.push(entry);
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        let staged = std::mem::take(&mut self.staged);
        {
            let mut guard = write_tables(&self.tables)?;

            // Hash the log first so a serialization failure leaves the tables untouched.
            let mut previous_hash = guard.provision_log.last().map(|r| r.hash.clone());
            let mut sequence = guard.provision_log.len() as u64;
            let mut records = Vec::with_capacity(staged.log.len());
            for entry in staged.log {
                sequence += 1;
                let hash = provision_log_hash(&entry, previous_hash.as_deref(), sequence)?;
                records.push(ProvisionLogRecord {
                    sequence,
                    entry,
                    previous_hash: previous_hash.replace(hash.clone()),
                    hash,
                });
            }

            for (key, holding) in staged.holdings {
                match holding {
                    Some(holding) => {
                        guard.holdings.insert(key, holding);
                    }
                    None => {
                        guard.holdings.remove(&key);
                    }
                }
            }
            for commission in staged.commissions.into_values() {
                guard.store_commission(commission);
            }
            for record in staged.call_serials {
                guard.call_serials.insert(
                    (record.caller.clone(), record.client_serial.clone()),
                    record,
                );
            }
            let appended = records.len();
            guard.provision_log.extend(records);
            tracing::debug!(
                log_records = appended,
                log_head = guard.provision_log.len(),
                "in-memory transaction committed"
            );
        }
        self.committed = true;
        self.release();
        Ok(())
    }
}
