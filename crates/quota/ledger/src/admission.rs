//! Admission control and settlement over a transaction's working copy of
//! the locked holdings.
//!
//! Every check runs against the working copy, so several provisions touching
//! one holding accumulate. Nothing reaches storage until [`WorkingSet::flush`].

use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use quota_storage::{ProvisionLogAppend, QuotaTransaction, StorageError};
use quota_types::{
    Commission, CommissionState, FailureReason, HolderId, Holding, HoldingCounters, HoldingKey,
    KeyFailure, Provision, ProvisionKind, QuotaPolicy, ResourceName,
};
use std::collections::BTreeMap;

/// Pending counter a provision moves on one side of the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Import,
    Release,
    Export,
    Return,
}

impl Leg {
    fn on_target(kind: ProvisionKind) -> Self {
        match kind {
            ProvisionKind::Import => Leg::Import,
            ProvisionKind::Export => Leg::Release,
        }
    }

    fn on_source(kind: ProvisionKind) -> Self {
        match kind {
            ProvisionKind::Import => Leg::Export,
            ProvisionKind::Export => Leg::Return,
        }
    }

    fn pending(self, counters: &mut HoldingCounters) -> &mut u64 {
        match self {
            Leg::Import => &mut counters.importing,
            Leg::Release => &mut counters.releasing,
            Leg::Export => &mut counters.exporting,
            Leg::Return => &mut counters.returning,
        }
    }

    fn committed(self, counters: &mut HoldingCounters) -> &mut u64 {
        match self {
            Leg::Import => &mut counters.imported,
            Leg::Release => &mut counters.released,
            Leg::Export => &mut counters.exported,
            Leg::Return => &mut counters.returned,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Leg::Import => "importing",
            Leg::Release => "releasing",
            Leg::Export => "exporting",
            Leg::Return => "returning",
        }
    }
}

struct Entry {
    holding: Holding,
    dirty: bool,
}

/// Locked holdings of one transaction, keyed in lock order.
pub(crate) struct WorkingSet {
    now: DateTime<Utc>,
    entries: BTreeMap<HoldingKey, Entry>,
}

impl WorkingSet {
    /// Loads `keys`, seeding absent holdings from the resource default policy.
    ///
    /// The caller must already hold the row locks for `keys`.
    pub(crate) async fn load_or_create(
        tx: &mut dyn QuotaTransaction,
        keys: &[HoldingKey],
        defaults: &BTreeMap<ResourceName, QuotaPolicy>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let mut entries = BTreeMap::new();
        for key in keys {
            let holding = match tx.holding(key).await? {
                Some(holding) => holding,
                None => Holding::new(
                    key.clone(),
                    defaults.get(&key.resource).cloned().unwrap_or_default(),
                    now,
                ),
            };
            entries.insert(
                key.clone(),
                Entry {
                    holding,
                    dirty: false,
                },
            );
        }
        Ok(Self { now, entries })
    }

    /// Loads `keys`; absent holdings are skipped.
    pub(crate) async fn load_existing(
        tx: &mut dyn QuotaTransaction,
        keys: &[HoldingKey],
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let mut entries = BTreeMap::new();
        for key in keys {
            if let Some(holding) = tx.holding(key).await? {
                entries.insert(
                    key.clone(),
                    Entry {
                        holding,
                        dirty: false,
                    },
                );
            }
        }
        Ok(Self { now, entries })
    }

    pub(crate) fn get(&self, key: &HoldingKey) -> Option<&Holding> {
        self.entries.get(key).map(|entry| &entry.holding)
    }

    /// Mutable access; the holding is written back on flush.
    pub(crate) fn holding_mut(&mut self, key: &HoldingKey) -> LedgerResult<&mut Holding> {
        let entry = self.entries.get_mut(key).ok_or_else(|| {
            LedgerError::Storage(StorageError::InvariantViolation(format!(
                "holding {key} is not part of the working set"
            )))
        })?;
        entry.dirty = true;
        entry.holding.updated_at = self.now;
        Ok(&mut entry.holding)
    }

    fn counters(&self, key: &HoldingKey) -> LedgerResult<HoldingCounters> {
        self.get(key).map(|holding| holding.counters).ok_or_else(|| {
            LedgerError::commission_value(key, "holding referenced by commission is missing")
        })
    }

    /// Validates and reserves every provision.
    ///
    /// Returns every refusal; the working set must be discarded when any
    /// are returned. `CommissionValue` errors abort immediately.
    pub(crate) fn admit(
        &mut self,
        target: &HolderId,
        provisions: &[Provision],
    ) -> LedgerResult<Vec<KeyFailure>> {
        let mut failures = Vec::new();
        for provision in provisions {
            let target_key = provision.target_key(target);
            let source_key = provision.source_key();
            let quantity = provision.quantity;

            match provision.kind {
                ProvisionKind::Import => {
                    let holding = self.holding_mut(&target_key)?;
                    for reason in admit_inbound(holding, quantity)? {
                        failures.push(KeyFailure::new(target_key.clone(), reason));
                    }
                    if let Some(source_key) = source_key {
                        let holding = self.holding_mut(&source_key)?;
                        for reason in admit_lending(holding, quantity)? {
                            failures.push(KeyFailure::new(source_key.clone(), reason));
                        }
                    }
                }
                ProvisionKind::Export => {
                    let holding = self.holding_mut(&target_key)?;
                    let stock = holding.counters.available_stock();
                    if stock < quantity {
                        return Err(LedgerError::commission_value(
                            &target_key,
                            format!("release of {quantity} exceeds available stock {stock}"),
                        ));
                    }
                    reserve(holding, Leg::Release, quantity)?;

                    if let Some(source_key) = source_key {
                        let holding = self.holding_mut(&source_key)?;
                        let returnable = holding.counters.returnable();
                        if returnable < quantity {
                            let message = format!(
                                "return of {quantity} exceeds outstanding exports {returnable}"
                            );
                            return Err(LedgerError::commission_value(&source_key, message));
                        }
                        reserve(holding, Leg::Return, quantity)?;
                    }
                }
            }
        }
        Ok(failures)
    }

    /// Moves a pending commission's amounts into committed counters
    /// (`Accepted`) or back out (`Rejected`).
    ///
    /// Returns one log entry per provision with before/after snapshots.
    pub(crate) fn settle(
        &mut self,
        commission: &Commission,
        outcome: CommissionState,
        resolved_at: DateTime<Utc>,
        reason: &str,
    ) -> LedgerResult<Vec<ProvisionLogAppend>> {
        let mut entries = Vec::with_capacity(commission.provisions.len());
        for provision in &commission.provisions {
            let target_key = provision.target_key(&commission.target);
            let source_key = provision.source_key();

            let target_before = self.counters(&target_key)?;
            let source_before = source_key
                .as_ref()
                .map(|key| self.counters(key))
                .transpose()?;

            let target_leg = Leg::on_target(provision.kind);
            self.settle_leg(&target_key, target_leg, provision.quantity, outcome)?;
            if let Some(key) = &source_key {
                self.settle_leg(key, Leg::on_source(provision.kind), provision.quantity, outcome)?;
            }

            entries.push(ProvisionLogAppend {
                serial: commission.serial,
                caller: commission.caller.clone(),
                target: commission.target.clone(),
                commission_name: commission.name.clone(),
                issued_at: commission.issued_at,
                resolved_at,
                outcome,
                provision: provision.clone(),
                target_before,
                target_after: self.counters(&target_key)?,
                source_before,
                source_after: source_key
                    .as_ref()
                    .map(|key| self.counters(key))
                    .transpose()?,
                reason: reason.to_string(),
            });
        }
        Ok(entries)
    }

    fn settle_leg(
        &mut self,
        key: &HoldingKey,
        leg: Leg,
        quantity: u64,
        outcome: CommissionState,
    ) -> LedgerResult<()> {
        if self.get(key).is_none() {
            return Err(LedgerError::commission_value(
                key,
                "holding referenced by commission is missing",
            ));
        }
        let counters = &mut self.holding_mut(key)?.counters;

        let pending = *leg.pending(counters);
        *leg.pending(counters) = pending.checked_sub(quantity).ok_or_else(|| {
            LedgerError::commission_value(
                key,
                format!("{} is {pending}, cannot settle {quantity}", leg.name()),
            )
        })?;

        if outcome == CommissionState::Accepted {
            let committed = *leg.committed(counters);
            *leg.committed(counters) = committed.checked_add(quantity).ok_or_else(|| {
                LedgerError::commission_value(key, format!("{} counter overflow", leg.name()))
            })?;
        }
        Ok(())
    }

    /// Writes every modified holding into the transaction.
    pub(crate) async fn flush(self, tx: &mut dyn QuotaTransaction) -> LedgerResult<()> {
        for entry in self.entries.into_values().filter(|entry| entry.dirty) {
            tx.put_holding(entry.holding).await?;
        }
        Ok(())
    }
}

fn admit_inbound(holding: &mut Holding, quantity: u64) -> LedgerResult<Vec<FailureReason>> {
    let counters = holding.counters;
    let policy = &holding.policy;
    let mut reasons = Vec::new();

    let current = counters.usage();
    let requested = checked_add(&holding.key, current, quantity)?;
    if !policy.allows_over_limit() && requested > policy.capacity {
        reasons.push(FailureReason::NoCapacity {
            limit: policy.capacity,
            requested,
            current,
        });
    }
    if let Some(limit) = policy.import_limit {
        let requested = checked_add(&holding.key, counters.importing, quantity)?;
        if requested > limit {
            reasons.push(FailureReason::ImportLimit { limit, requested });
        }
    }

    if reasons.is_empty() {
        reserve(holding, Leg::Import, quantity)?;
    }
    Ok(reasons)
}

fn admit_lending(holding: &mut Holding, quantity: u64) -> LedgerResult<Vec<FailureReason>> {
    if !holding.policy.is_exportable() {
        return Ok(vec![FailureReason::NonExported]);
    }
    let counters = holding.counters;
    let mut reasons = Vec::new();

    let stock = counters.available_stock();
    if stock < quantity {
        reasons.push(FailureReason::NoStock {
            limit: stock,
            requested: quantity,
        });
    }
    if let Some(limit) = holding.policy.export_limit {
        let requested = checked_add(&holding.key, counters.exporting, quantity)?;
        if requested > limit {
            reasons.push(FailureReason::ExportLimit { limit, requested });
        }
    }

    if reasons.is_empty() {
        reserve(holding, Leg::Export, quantity)?;
    }
    Ok(reasons)
}

fn reserve(holding: &mut Holding, leg: Leg, quantity: u64) -> LedgerResult<()> {
    let current = *leg.pending(&mut holding.counters);
    *leg.pending(&mut holding.counters) = checked_add(&holding.key, current, quantity)?;
    Ok(())
}

fn checked_add(key: &HoldingKey, current: u64, quantity: u64) -> LedgerResult<u64> {
    current.checked_add(quantity).ok_or_else(|| {
        LedgerError::commission_value(key, format!("{current} + {quantity} overflows"))
    })
}
