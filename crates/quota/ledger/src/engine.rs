//! Ledger engine: quota administration and holding queries.
//!
//! Commission operations live in `commission.rs`, provision log queries in
//! `audit.rs`; all of them are inherent methods of [`QuotaLedger`].

use crate::admission::WorkingSet;
use crate::config::{AdmissionConfig, LedgerConfig, StorageConfig};
use crate::context::CallContext;
use crate::error::{LedgerError, LedgerResult};
use chrono::Utc;
use quota_storage::memory::InMemoryQuotaStorage;
use quota_storage::{LockKey, QuotaStorage};
use quota_types::{
    BatchOutcome, FailureReason, HolderId, HoldingKey, HoldingListing, HoldingReset, KeyFailure,
    QuotaDelta, QuotaPolicy, QuotaView, ResourceDefinition, ResourceName,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// The quota ledger.
///
/// Stateless apart from its storage handle: any number of instances may run
/// against one transactional store.
#[derive(Clone)]
pub struct QuotaLedger {
    pub(crate) storage: Arc<dyn QuotaStorage>,
    pub(crate) admission: AdmissionConfig,
}

impl QuotaLedger {
    /// Ledger over fresh in-memory storage with default admission limits.
    pub fn in_memory() -> Self {
        Self::with_storage(Arc::new(InMemoryQuotaStorage::new()))
    }

    pub fn with_storage(storage: Arc<dyn QuotaStorage>) -> Self {
        Self {
            storage,
            admission: AdmissionConfig::default(),
        }
    }

    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    /// Open the configured storage backend.
    pub async fn from_config(config: &LedgerConfig) -> LedgerResult<Self> {
        let storage: Arc<dyn QuotaStorage> = match &config.storage {
            StorageConfig::Memory => Arc::new(InMemoryQuotaStorage::new()),
            #[cfg(feature = "postgres")]
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => Arc::new(
                quota_storage::postgres::PostgresQuotaStorage::connect_with_options(
                    url,
                    *max_connections,
                    *connect_timeout_secs,
                )
                .await?,
            ),
            #[cfg(not(feature = "postgres"))]
            StorageConfig::Postgres { .. } => {
                return Err(LedgerError::Config(
                    "postgres storage requires the `postgres` feature".to_string(),
                ))
            }
        };
        info!(backend = storage_kind(&config.storage), "quota ledger storage opened");
        Ok(Self::with_storage(storage).with_admission(config.admission.clone()))
    }

    pub fn storage(&self) -> Arc<dyn QuotaStorage> {
        Arc::clone(&self.storage)
    }

    pub fn admission(&self) -> &AdmissionConfig {
        &self.admission
    }

    /// Create or replace a holding's limit and flags. Accumulators are untouched.
    #[instrument(skip_all, fields(caller = %ctx.caller, request_id = %ctx.request_id, key = %key))]
    pub async fn set_quota(
        &self,
        ctx: &CallContext,
        key: HoldingKey,
        policy: QuotaPolicy,
    ) -> LedgerResult<QuotaView> {
        check_key(&key)?;
        let defaults = self.resource_defaults([&key.resource]).await?;

        let mut tx = self.storage.begin().await?;
        tx.lock(&[LockKey::Holding(key.clone())]).await?;
        let keys = std::slice::from_ref(&key);
        let mut set = WorkingSet::load_or_create(tx.as_mut(), keys, &defaults, Utc::now()).await?;

        let holding = set.holding_mut(&key)?;
        holding.policy = policy;
        holding.policy_name = None;
        let view = holding.view();

        set.flush(tx.as_mut()).await?;
        tx.commit().await?;
        info!(capacity = view.policy.capacity, "quota set");
        Ok(view)
    }

    /// Adjust capacities by signed deltas in one transaction.
    ///
    /// Entries that would take a capacity below zero or past `u64::MAX` are
    /// rejected individually; the rest are applied.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        deltas = deltas.len(),
    ))]
    pub async fn add_quota(
        &self,
        ctx: &CallContext,
        deltas: Vec<QuotaDelta>,
    ) -> LedgerResult<BatchOutcome> {
        self.check_batch(deltas.len(), "quota deltas")?;
        for delta in &deltas {
            check_key(&delta.key)?;
        }
        let keys = sorted_keys(deltas.iter().map(|delta| &delta.key));
        let defaults = self.resource_defaults(keys.iter().map(|key| &key.resource)).await?;

        let mut tx = self.storage.begin().await?;
        tx.lock(&holding_locks(&keys)).await?;
        let mut set = WorkingSet::load_or_create(tx.as_mut(), &keys, &defaults, Utc::now()).await?;

        let mut outcome = BatchOutcome::default();
        for delta in deltas {
            let current = set
                .get(&delta.key)
                .map(|holding| holding.policy.capacity)
                .unwrap_or_default();
            match adjust_capacity(current, delta.capacity) {
                Ok(capacity) => {
                    set.holding_mut(&delta.key)?.policy.capacity = capacity;
                    outcome.succeeded.push(delta.key);
                }
                Err(reason) => outcome.rejected.push(KeyFailure::new(delta.key, reason)),
            }
        }

        set.flush(tx.as_mut()).await?;
        tx.commit().await?;
        if outcome.rejected.is_empty() {
            info!(succeeded = outcome.succeeded.len(), "quota adjusted");
        } else {
            warn!(
                succeeded = outcome.succeeded.len(),
                rejected = outcome.rejected.len(),
                "quota adjusted with rejections"
            );
        }
        Ok(outcome)
    }

    /// Read limits and counters. Unknown holdings read as the zero default.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        keys = keys.len(),
    ))]
    pub async fn get_quota(
        &self,
        ctx: &CallContext,
        keys: &[HoldingKey],
    ) -> LedgerResult<Vec<QuotaView>> {
        self.check_batch(keys.len(), "keys")?;
        let mut views = Vec::with_capacity(keys.len());
        for key in keys {
            let view = match self.storage.get_holding(key).await? {
                Some(holding) => holding.view(),
                None => QuotaView::unset(key.clone()),
            };
            views.push(view);
        }
        Ok(views)
    }

    /// Delete holdings that hold nothing and are not referenced by a pending
    /// commission. All-or-nothing; unknown holdings are ignored.
    ///
    /// Returns the keys actually deleted.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        keys = keys.len(),
    ))]
    pub async fn release_holdings(
        &self,
        ctx: &CallContext,
        keys: &[HoldingKey],
    ) -> LedgerResult<Vec<HoldingKey>> {
        self.check_batch(keys.len(), "keys")?;
        let keys = sorted_keys(keys.iter());

        let mut tx = self.storage.begin().await?;
        tx.lock(&holding_locks(&keys)).await?;

        let mut failures = Vec::new();
        let mut releasable = Vec::new();
        for key in keys {
            let Some(holding) = tx.holding(&key).await? else {
                debug!(key = %key, "release of unknown holding ignored");
                continue;
            };
            let counters = holding.counters;
            if counters.has_pending() || tx.holding_is_referenced(&key).await? {
                failures.push(KeyFailure::new(key.clone(), FailureReason::PendingCommission));
            }
            if !counters.is_settled() {
                failures.push(KeyFailure::new(
                    key.clone(),
                    FailureReason::NonZeroUsage {
                        held: counters.held(),
                        outstanding_exports: counters.outstanding_exports(),
                    },
                ));
            }
            releasable.push(key);
        }

        if !failures.is_empty() {
            warn!(blocked = failures.len(), "holding release blocked");
            return Err(LedgerError::HoldingBlocked { failures });
        }

        for key in &releasable {
            tx.delete_holding(key).await?;
        }
        tx.commit().await?;
        info!(released = releasable.len(), "holdings released");
        Ok(releasable)
    }

    pub async fn release_holding(&self, ctx: &CallContext, key: HoldingKey) -> LedgerResult<bool> {
        Ok(!self.release_holdings(ctx, &[key]).await?.is_empty())
    }

    /// Force-set the committed accumulators of existing holdings (recovery).
    ///
    /// All-or-nothing. Refused for unknown holdings and for holdings a
    /// pending commission references.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        resets = resets.len(),
    ))]
    pub async fn reset_holdings(
        &self,
        ctx: &CallContext,
        resets: Vec<HoldingReset>,
    ) -> LedgerResult<Vec<QuotaView>> {
        self.check_batch(resets.len(), "resets")?;
        let mut seen = BTreeSet::new();
        for reset in &resets {
            check_key(&reset.key)?;
            if !seen.insert(reset.key.clone()) {
                return Err(LedgerError::InvalidRequest(format!(
                    "holding {} reset more than once",
                    reset.key
                )));
            }
            if reset.counters.has_pending() {
                return Err(LedgerError::InvalidRequest(format!(
                    "reset of {} sets pending counters",
                    reset.key
                )));
            }
            if !reset.counters.is_consistent() {
                return Err(LedgerError::InvalidRequest(format!(
                    "reset of {} reverses more than it records",
                    reset.key
                )));
            }
        }
        let keys = seen.into_iter().collect::<Vec<_>>();

        let mut tx = self.storage.begin().await?;
        tx.lock(&holding_locks(&keys)).await?;
        let mut set = WorkingSet::load_existing(tx.as_mut(), &keys, Utc::now()).await?;

        let mut failures = Vec::new();
        for key in &keys {
            match set.get(key) {
                None => failures.push(KeyFailure::new(key.clone(), FailureReason::UnknownHolding)),
                Some(holding) => {
                    if holding.counters.has_pending() || tx.holding_is_referenced(key).await? {
                        failures.push(KeyFailure::new(
                            key.clone(),
                            FailureReason::PendingCommission,
                        ));
                    }
                }
            }
        }
        if !failures.is_empty() {
            warn!(blocked = failures.len(), "holding reset blocked");
            return Err(LedgerError::HoldingBlocked { failures });
        }

        let mut views = Vec::with_capacity(resets.len());
        for reset in resets {
            let holding = set.holding_mut(&reset.key)?;
            holding.counters = reset.counters;
            views.push(holding.view());
        }
        set.flush(tx.as_mut()).await?;
        tx.commit().await?;
        warn!(reset = views.len(), "holding counters overridden");
        Ok(views)
    }

    pub async fn reset_holding(
        &self,
        ctx: &CallContext,
        reset: HoldingReset,
    ) -> LedgerResult<QuotaView> {
        self.reset_holdings(ctx, vec![reset])
            .await?
            .pop()
            .ok_or_else(|| LedgerError::InvalidRequest("empty reset".to_string()))
    }

    /// Register a named policy template. Create-only.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        policy = name,
    ))]
    pub async fn define_policy(
        &self,
        ctx: &CallContext,
        name: &str,
        policy: QuotaPolicy,
    ) -> LedgerResult<()> {
        if name.trim().is_empty() {
            return Err(LedgerError::InvalidRequest("policy name is empty".to_string()));
        }
        self.storage
            .define_policy(name, policy)
            .await
            .map_err(|e| LedgerError::from_definition(e, format!("policy {name}")))?;
        info!("policy defined");
        Ok(())
    }

    /// Found policies by name; unknown names are omitted.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        names = names.len(),
    ))]
    pub async fn get_policies(
        &self,
        ctx: &CallContext,
        names: &[&str],
    ) -> LedgerResult<BTreeMap<String, QuotaPolicy>> {
        self.check_batch(names.len(), "policy names")?;
        let mut found = BTreeMap::new();
        for name in names {
            if let Some(policy) = self.storage.get_policy(name).await? {
                found.insert((*name).to_string(), policy);
            }
        }
        Ok(found)
    }

    /// Copy a named policy onto holdings, creating them as needed.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        policy = name,
    ))]
    pub async fn apply_policy(
        &self,
        ctx: &CallContext,
        name: &str,
        keys: &[HoldingKey],
    ) -> LedgerResult<Vec<QuotaView>> {
        self.check_batch(keys.len(), "keys")?;
        for key in keys {
            check_key(key)?;
        }
        let policy = self
            .storage
            .get_policy(name)
            .await?
            .ok_or_else(|| LedgerError::UnknownPolicy(name.to_string()))?;
        let keys = sorted_keys(keys.iter());
        let defaults = self.resource_defaults(keys.iter().map(|key| &key.resource)).await?;

        let mut tx = self.storage.begin().await?;
        tx.lock(&holding_locks(&keys)).await?;
        let mut set = WorkingSet::load_or_create(tx.as_mut(), &keys, &defaults, Utc::now()).await?;

        let mut views = Vec::with_capacity(keys.len());
        for key in &keys {
            let holding = set.holding_mut(key)?;
            holding.policy = policy.clone();
            holding.policy_name = Some(name.to_string());
            views.push(holding.view());
        }
        set.flush(tx.as_mut()).await?;
        tx.commit().await?;
        info!(holdings = views.len(), "policy applied");
        Ok(views)
    }

    /// Register a resource. Create-only.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        resource = %definition.name,
    ))]
    pub async fn define_resource(
        &self,
        ctx: &CallContext,
        definition: ResourceDefinition,
    ) -> LedgerResult<()> {
        if definition.name.as_str().trim().is_empty() {
            return Err(LedgerError::InvalidRequest("resource name is empty".to_string()));
        }
        let label = format!("resource {}", definition.name);
        self.storage
            .define_resource(definition)
            .await
            .map_err(|e| LedgerError::from_definition(e, label))?;
        info!("resource defined");
        Ok(())
    }

    #[instrument(skip_all, fields(caller = %ctx.caller, request_id = %ctx.request_id))]
    pub async fn list_resources(
        &self,
        ctx: &CallContext,
    ) -> LedgerResult<Vec<ResourceDefinition>> {
        Ok(self.storage.list_resources().await?)
    }

    /// Holdings per holder. Holders with no holdings are listed in `rejected`.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        holders = holders.len(),
    ))]
    pub async fn list_holdings(
        &self,
        ctx: &CallContext,
        holders: &[HolderId],
    ) -> LedgerResult<HoldingListing> {
        self.check_batch(holders.len(), "holders")?;
        let mut listing = HoldingListing::default();
        for holder in holders {
            if listing.holdings.contains_key(holder) || listing.rejected.contains(holder) {
                continue;
            }
            let holdings = self.storage.list_holdings(holder).await?;
            if holdings.is_empty() {
                listing.rejected.push(holder.clone());
            } else {
                listing
                    .holdings
                    .insert(holder.clone(), holdings.iter().map(|h| h.view()).collect());
            }
        }
        Ok(listing)
    }

    pub(crate) fn check_batch(&self, len: usize, what: &str) -> LedgerResult<()> {
        if len > self.admission.max_batch_size {
            return Err(LedgerError::InvalidRequest(format!(
                "{len} {what} exceed the batch limit of {}",
                self.admission.max_batch_size
            )));
        }
        Ok(())
    }

    /// Default policies of the given resources.
    ///
    /// Fails with `UnknownResource` for unregistered resources when
    /// registration is required.
    pub(crate) async fn resource_defaults<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a ResourceName>,
    ) -> LedgerResult<BTreeMap<ResourceName, QuotaPolicy>> {
        let mut defaults = BTreeMap::new();
        let distinct = resources.into_iter().collect::<BTreeSet<_>>();
        for resource in distinct {
            match self.storage.get_resource(resource).await? {
                Some(definition) => {
                    defaults.insert(resource.clone(), definition.default_policy);
                }
                None if self.admission.require_registered_resources => {
                    return Err(LedgerError::UnknownResource(resource.clone()));
                }
                None => {}
            }
        }
        Ok(defaults)
    }
}

pub(crate) fn check_key(key: &HoldingKey) -> LedgerResult<()> {
    if key.holder.as_str().is_empty() || key.resource.as_str().is_empty() {
        return Err(LedgerError::InvalidRequest(format!(
            "holding key {key} has an empty holder or resource"
        )));
    }
    Ok(())
}

pub(crate) fn sorted_keys<'a>(keys: impl IntoIterator<Item = &'a HoldingKey>) -> Vec<HoldingKey> {
    keys.into_iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub(crate) fn holding_locks(keys: &[HoldingKey]) -> Vec<LockKey> {
    keys.iter().cloned().map(LockKey::Holding).collect()
}

/// `None` when the adjusted capacity would be negative.
fn adjust_capacity(current: u64, delta: i64) -> Result<u64, FailureReason> {
    let adjusted = if delta >= 0 {
        current.checked_add(delta.unsigned_abs())
    } else {
        current.checked_sub(delta.unsigned_abs())
    };
    adjusted.ok_or(if delta >= 0 {
        FailureReason::LimitOverflow {
            limit: current,
            delta,
        }
    } else {
        FailureReason::NegativeLimit {
            limit: current,
            delta,
        }
    })
}

fn storage_kind(config: &StorageConfig) -> &'static str {
    match config {
        StorageConfig::Memory => "memory",
        StorageConfig::Postgres { .. } => "postgres",
    }
}
