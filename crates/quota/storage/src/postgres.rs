//! PostgreSQL adapter for quota storage.
//!
//! This adapter is the transactional source-of-truth backend. Row locks are
//! transaction-scoped advisory locks taken in `LockKey` order, so they also
//! cover holdings and idempotency rows that do not exist yet.

use crate::model::{CallSerialRecord, LogWindow, ProvisionLogAppend, ProvisionLogRecord};
use crate::traits::{
    plan_acquisition, CommissionReader, HoldingReader, LockKey, PolicyStore, ProvisionLogStore,
    QuotaTransaction, TransactionalStore,
};
use crate::{provision_log_hash, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quota_types::{
    CallerId, ClientSerial, Commission, CommissionState, HolderId, Holding, HoldingCounters,
    HoldingKey, IssueOutcome, Provision, ProvisionKind, QuotaPolicy, ResourceDefinition,
    ResourceName, Serial,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeSet;

const HOLDING_COLUMNS: &str = "holder, resource, policy, policy_name, imported, released, \
     exported, returned, pending_imported, pending_released, pending_exported, \
     pending_returned, updated_at";

const COMMISSION_COLUMNS: &str =
    "serial, caller, client_serial, target, name, provisions, state, issued_at, resolved_at";

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresQuotaStorage {
    pool: PgPool,
}

impl PostgresQuotaStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS quota_policies (
                name TEXT PRIMARY KEY,
                policy JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_resources (
                name TEXT PRIMARY KEY,
                definition JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_holdings (
                holder TEXT NOT NULL,
                resource TEXT NOT NULL,
                policy JSONB NOT NULL,
                policy_name TEXT,
                imported BIGINT NOT NULL DEFAULT 0,
                released BIGINT NOT NULL DEFAULT 0,
                exported BIGINT NOT NULL DEFAULT 0,
                returned BIGINT NOT NULL DEFAULT 0,
                pending_imported BIGINT NOT NULL DEFAULT 0,
                pending_released BIGINT NOT NULL DEFAULT 0,
                pending_exported BIGINT NOT NULL DEFAULT 0,
                pending_returned BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (holder, resource)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_commissions (
                serial BIGINT PRIMARY KEY,
                caller TEXT NOT NULL,
                client_serial TEXT,
                target TEXT NOT NULL,
                name TEXT NOT NULL,
                provisions JSONB NOT NULL,
                state TEXT NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                resolved_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS quota_commissions_pending
                ON quota_commissions (caller, serial)
                WHERE state = 'pending'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_provisions (
                serial BIGINT NOT NULL REFERENCES quota_commissions (serial),
                position INTEGER NOT NULL,
                source TEXT,
                target TEXT NOT NULL,
                resource TEXT NOT NULL,
                kind TEXT NOT NULL,
                quantity BIGINT NOT NULL,
                PRIMARY KEY (serial, position)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS quota_provisions_target
                ON quota_provisions (target, resource)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS quota_provisions_source
                ON quota_provisions (source, resource)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_call_serials (
                caller TEXT NOT NULL,
                client_serial TEXT NOT NULL,
                outcome JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (caller, client_serial)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_provision_log (
                sequence BIGINT PRIMARY KEY,
                serial BIGINT NOT NULL,
                entry JSONB NOT NULL,
                previous_hash TEXT,
                hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS quota_provision_log_serial
                ON quota_provision_log (serial)
            "#,
            "CREATE SEQUENCE IF NOT EXISTS quota_commission_serial",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for PostgresQuotaStorage {
    async fn define_policy(&self, name: &str, policy: QuotaPolicy) -> StorageResult<()> {
        sqlx::query("INSERT INTO quota_policies (name, policy) VALUES ($1, $2)")
            .bind(name)
            .bind(to_json(&policy)?)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_policy(&self, name: &str) -> StorageResult<Option<QuotaPolicy>> {
        let row = sqlx::query("SELECT policy FROM quota_policies WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| from_json(row.try_get("policy").map_err(backend)?))
            .transpose()
    }

    async fn define_resource(&self, definition: ResourceDefinition) -> StorageResult<()> {
        sqlx::query("INSERT INTO quota_resources (name, definition) VALUES ($1, $2)")
            .bind(definition.name.as_str())
            .bind(to_json(&definition)?)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_resource(&self, name: &ResourceName) -> StorageResult<Option<ResourceDefinition>> {
        let row = sqlx::query("SELECT definition FROM quota_resources WHERE name = $1")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| from_json(row.try_get("definition").map_err(backend)?))
            .transpose()
    }

    async fn list_resources(&self) -> StorageResult<Vec<ResourceDefinition>> {
        let rows = sqlx::query("SELECT definition FROM quota_resources ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(|row| from_json(row.try_get("definition").map_err(backend)?))
            .collect()
    }
}

#[async_trait]
impl HoldingReader for PostgresQuotaStorage {
    async fn get_holding(&self, key: &HoldingKey) -> StorageResult<Option<Holding>> {
        let row = sqlx::query(&format!(
            "SELECT {HOLDING_COLUMNS} FROM quota_holdings WHERE holder = $1 AND resource = $2"
        ))
        .bind(key.holder.as_str())
        .bind(key.resource.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_holding).transpose()
    }

    async fn list_holdings(&self, holder: &HolderId) -> StorageResult<Vec<Holding>> {
        let rows = sqlx::query(&format!(
            "SELECT {HOLDING_COLUMNS} FROM quota_holdings WHERE holder = $1 ORDER BY resource"
        ))
        .bind(holder.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_holding).collect()
    }
}

#[async_trait]
impl CommissionReader for PostgresQuotaStorage {
    async fn get_commission(&self, serial: Serial) -> StorageResult<Option<Commission>> {
        let row = sqlx::query(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM quota_commissions WHERE serial = $1"
        ))
        .bind(to_i64(serial.0)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_commission).transpose()
    }

    async fn pending_serials(&self, caller: &CallerId) -> StorageResult<Vec<Serial>> {
        let rows = sqlx::query(
            r#"
            SELECT serial FROM quota_commissions
            WHERE caller = $1 AND state = 'pending'
            ORDER BY serial
            "#,
        )
        .bind(caller.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|row| Ok(Serial(to_u64(row.try_get("serial").map_err(backend)?)?)))
            .collect()
    }
}

#[async_trait]
impl ProvisionLogStore for PostgresQuotaStorage {
    async fn list_provision_log(
        &self,
        window: LogWindow,
    ) -> StorageResult<Vec<ProvisionLogRecord>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            i64::try_from(window.limit).unwrap_or(i64::MAX)
        };
        let rows = sqlx::query(
            r#"
            SELECT sequence, entry, previous_hash, hash
              FROM quota_provision_log
             WHERE sequence > $1
             ORDER BY sequence ASC
             LIMIT $2
            "#,
        )
        .bind(to_i64(window.after_sequence)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_log_record).collect()
    }

    async fn provision_log_for(&self, serial: Serial) -> StorageResult<Vec<ProvisionLogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, entry, previous_hash, hash
              FROM quota_provision_log
             WHERE serial = $1
             ORDER BY sequence ASC
            "#,
        )
        .bind(to_i64(serial.0)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_log_record).collect()
    }

    async fn latest_log_hash(&self) -> StorageResult<Option<String>> {
        let row = sqlx::query("SELECT hash FROM quota_provision_log ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| r.try_get::<String, _>("hash").map_err(backend))
            .transpose()
    }
}

#[async_trait]
impl TransactionalStore for PostgresQuotaStorage {
    async fn begin(&self) -> StorageResult<Box<dyn QuotaTransaction>> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PostgresTransaction {
            tx: Some(tx),
            held: BTreeSet::new(),
        }))
    }
}

/// Transaction over [`PostgresQuotaStorage`]. Rolled back on drop unless committed.
pub struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    held: BTreeSet<LockKey>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> StorageResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or_else(StorageError::already_committed)
    }
}

#[async_trait]
impl QuotaTransaction for PostgresTransaction {
    async fn lock(&mut self, keys: &[LockKey]) -> StorageResult<()> {
        for key in plan_acquisition(&self.held, keys)? {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(key.to_string())
                .execute(self.conn()?)
                .await
                .map_err(backend)?;
            self.held.insert(key);
        }
        Ok(())
    }

    async fn holding(&mut self, key: &HoldingKey) -> StorageResult<Option<Holding>> {
        let row = sqlx::query(&format!(
            "SELECT {HOLDING_COLUMNS} FROM quota_holdings WHERE holder = $1 AND resource = $2"
        ))
        .bind(key.holder.as_str())
        .bind(key.resource.as_str())
        .fetch_optional(self.conn()?)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_holding).transpose()
    }

    async fn put_holding(&mut self, holding: Holding) -> StorageResult<()> {
        let c = holding.counters;
        sqlx::query(
            r#"
            INSERT INTO quota_holdings
                (holder, resource, policy, policy_name, imported, released, exported, returned,
                 pending_imported, pending_released, pending_exported, pending_returned, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (holder, resource) DO UPDATE SET
                policy = EXCLUDED.policy,
                policy_name = EXCLUDED.policy_name,
                imported = EXCLUDED.imported,
                released = EXCLUDED.released,
                exported = EXCLUDED.exported,
                returned = EXCLUDED.returned,
                pending_imported = EXCLUDED.pending_imported,
                pending_released = EXCLUDED.pending_released,
                pending_exported = EXCLUDED.pending_exported,
                pending_returned = EXCLUDED.pending_returned,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(holding.key.holder.as_str())
        .bind(holding.key.resource.as_str())
        .bind(to_json(&holding.policy)?)
        .bind(holding.policy_name.clone())
        .bind(to_i64(c.imported)?)
        .bind(to_i64(c.released)?)
        .bind(to_i64(c.exported)?)
        .bind(to_i64(c.returned)?)
        .bind(to_i64(c.importing)?)
        .bind(to_i64(c.releasing)?)
        .bind(to_i64(c.exporting)?)
        .bind(to_i64(c.returning)?)
        .bind(holding.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete_holding(&mut self, key: &HoldingKey) -> StorageResult<()> {
        sqlx::query("DELETE FROM quota_holdings WHERE holder = $1 AND resource = $2")
            .bind(key.holder.as_str())
            .bind(key.resource.as_str())
            .execute(self.conn()?)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn holding_is_referenced(&mut self, key: &HoldingKey) -> StorageResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM quota_provisions
                 WHERE resource = $2 AND (target = $1 OR source = $1)
            ) AS referenced
            "#,
        )
        .bind(key.holder.as_str())
        .bind(key.resource.as_str())
        .fetch_one(self.conn()?)
        .await
        .map_err(backend)?;
        row.try_get("referenced").map_err(backend)
    }

    async fn call_serial(
        &mut self,
        caller: &CallerId,
        client_serial: &ClientSerial,
    ) -> StorageResult<Option<CallSerialRecord>> {
        let row = sqlx::query(
            r#"
            SELECT outcome, recorded_at FROM quota_call_serials
             WHERE caller = $1 AND client_serial = $2
            "#,
        )
        .bind(caller.as_str())
        .bind(client_serial.as_str())
        .fetch_optional(self.conn()?)
        .await
        .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let outcome: IssueOutcome = from_json(row.try_get("outcome").map_err(backend)?)?;
        Ok(Some(CallSerialRecord {
            caller: caller.clone(),
            client_serial: client_serial.clone(),
            outcome,
            recorded_at: row.try_get("recorded_at").map_err(backend)?,
        }))
    }

    async fn record_call_serial(&mut self, record: CallSerialRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_call_serials (caller, client_serial, outcome, recorded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.caller.as_str())
        .bind(record.client_serial.as_str())
        .bind(to_json(&record.outcome)?)
        .bind(record.recorded_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn next_serial(&mut self) -> StorageResult<Serial> {
        let row = sqlx::query("SELECT nextval('quota_commission_serial') AS serial")
            .fetch_one(self.conn()?)
            .await
            .map_err(backend)?;
        Ok(Serial(to_u64(row.try_get("serial").map_err(backend)?)?))
    }

    async fn commission(&mut self, serial: Serial) -> StorageResult<Option<Commission>> {
        let row = sqlx::query(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM quota_commissions WHERE serial = $1"
        ))
        .bind(to_i64(serial.0)?)
        .fetch_optional(self.conn()?)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_commission).transpose()
    }

    async fn insert_commission(&mut self, commission: Commission) -> StorageResult<()> {
        let serial = to_i64(commission.serial.0)?;
        sqlx::query(
            r#"
            INSERT INTO quota_commissions
                (serial, caller, client_serial, target, name, provisions, state,
                 issued_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(serial)
        .bind(commission.caller.as_str())
        .bind(commission.client_serial.as_ref().map(|s| s.as_str().to_string()))
        .bind(commission.target.as_str())
        .bind(commission.name.as_str())
        .bind(to_json(&commission.provisions)?)
        .bind(commission.state.as_str())
        .bind(commission.issued_at)
        .bind(commission.resolved_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx_conflict)?;

        for (position, provision) in commission.provisions.iter().enumerate() {
            insert_provision_row(self.conn()?, serial, position, &commission.target, provision)
                .await?;
        }
        Ok(())
    }

    async fn resolve_commission(
        &mut self,
        serial: Serial,
        state: CommissionState,
        resolved_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        if !state.is_terminal() {
            return Err(StorageError::InvariantViolation(format!(
                "cannot resolve commission {serial} to {state}"
            )));
        }
        let serial_value = to_i64(serial.0)?;
        let result = sqlx::query(
            r#"
            UPDATE quota_commissions
               SET state = $2, resolved_at = $3
             WHERE serial = $1 AND state = 'pending'
            "#,
        )
        .bind(serial_value)
        .bind(state.as_str())
        .bind(resolved_at)
        .execute(self.conn()?)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return match self.commission(serial).await? {
                Some(current) => Err(StorageError::InvariantViolation(format!(
                    "cannot move commission {serial} from {} to {state}",
                    current.state
                ))),
                None => Err(StorageError::NotFound(format!(
                    "commission {serial} not found"
                ))),
            };
        }

        sqlx::query("DELETE FROM quota_provisions WHERE serial = $1")
            .bind(serial_value)
            .execute(self.conn()?)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn append_provision_log(&mut self, entry: ProvisionLogAppend) -> StorageResult<()> {
        let conn = self.conn()?;
        sqlx::query("LOCK TABLE quota_provision_log IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(backend)?;

        let last = sqlx::query(
            "SELECT sequence, hash FROM quota_provision_log ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;

        let (sequence, previous_hash) = match last {
            Some(row) => {
                let seq: i64 = row.try_get("sequence").map_err(backend)?;
                let prev: String = row.try_get("hash").map_err(backend)?;
                (seq + 1, Some(prev))
            }
            None => (1_i64, None),
        };

        let hash = provision_log_hash(&entry, previous_hash.as_deref(), to_u64(sequence)?)?;
        sqlx::query(
            r#"
            INSERT INTO quota_provision_log (sequence, serial, entry, previous_hash, hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(sequence)
        .bind(to_i64(entry.serial.0)?)
        .bind(to_json(&entry)?)
        .bind(previous_hash)
        .bind(hash)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or_else(StorageError::already_committed)?;
        tx.commit().await.map_err(backend)?;
        tracing::debug!(locks = self.held.len(), "postgres transaction committed");
        self.held.clear();
        Ok(())
    }
}

async fn insert_provision_row(
    conn: &mut PgConnection,
    serial: i64,
    position: usize,
    target: &HolderId,
    provision: &Provision,
) -> StorageResult<()> {
    let position = i32::try_from(position).map_err(|_| {
        StorageError::InvalidInput(format!("provision position {position} too large"))
    })?;
    let kind = match provision.kind {
        ProvisionKind::Import => "import",
        ProvisionKind::Export => "export",
    };
    sqlx::query(
        r#"
        INSERT INTO quota_provisions (serial, position, source, target, resource, kind, quantity)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(serial)
    .bind(position)
    .bind(provision.source.as_ref().map(|s| s.as_str().to_string()))
    .bind(target.as_str())
    .bind(provision.resource.as_str())
    .bind(kind)
    .bind(to_i64(provision.quantity)?)
    .execute(conn)
    .await
    .map_err(backend)?;
    Ok(())
}

fn row_to_holding(row: &PgRow) -> StorageResult<Holding> {
    let holder: String = row.try_get("holder").map_err(backend)?;
    let resource: String = row.try_get("resource").map_err(backend)?;
    let counter = |column: &str| -> StorageResult<u64> {
        to_u64(row.try_get::<i64, _>(column).map_err(backend)?)
    };
    Ok(Holding {
        key: HoldingKey::new(holder, resource),
        policy: from_json(row.try_get("policy").map_err(backend)?)?,
        policy_name: row.try_get("policy_name").map_err(backend)?,
        counters: HoldingCounters {
            imported: counter("imported")?,
            released: counter("released")?,
            exported: counter("exported")?,
            returned: counter("returned")?,
            importing: counter("pending_imported")?,
            releasing: counter("pending_released")?,
            exporting: counter("pending_exported")?,
            returning: counter("pending_returned")?,
        },
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn row_to_commission(row: &PgRow) -> StorageResult<Commission> {
    let state: String = row.try_get("state").map_err(backend)?;
    let client_serial: Option<String> = row.try_get("client_serial").map_err(backend)?;
    Ok(Commission {
        serial: Serial(to_u64(row.try_get("serial").map_err(backend)?)?),
        caller: CallerId::new(row.try_get::<String, _>("caller").map_err(backend)?),
        client_serial: client_serial.map(ClientSerial::new),
        target: HolderId::new(row.try_get::<String, _>("target").map_err(backend)?),
        name: row.try_get("name").map_err(backend)?,
        provisions: from_json(row.try_get("provisions").map_err(backend)?)?,
        state: CommissionState::parse(&state).ok_or_else(|| {
            StorageError::Serialization(format!("unknown commission state {state}"))
        })?,
        issued_at: row.try_get("issued_at").map_err(backend)?,
        resolved_at: row.try_get("resolved_at").map_err(backend)?,
    })
}

fn row_to_log_record(row: &PgRow) -> StorageResult<ProvisionLogRecord> {
    Ok(ProvisionLogRecord {
        sequence: to_u64(row.try_get("sequence").map_err(backend)?)?,
        entry: from_json(row.try_get("entry").map_err(backend)?)?,
        previous_hash: row.try_get("previous_hash").map_err(backend)?,
        hash: row.try_get("hash").map_err(backend)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput(format!("{value} exceeds BIGINT range")))
}

fn to_u64(value: i64) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("negative counter {value} in storage")))
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}
