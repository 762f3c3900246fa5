//! Idempotency index for commission issue calls.
//!
//! Tokens are namespaced by caller, so two callers may reuse the same token
//! without seeing each other's outcomes.

use chrono::{DateTime, Utc};
use quota_storage::{CallSerialRecord, LockKey, QuotaTransaction, StorageResult};
use quota_types::{CallerId, ClientSerial, IssueOutcome};

/// Deduper for one `(caller, token)` pair inside one transaction.
pub struct SerialDeduper<'a> {
    caller: &'a CallerId,
    token: &'a ClientSerial,
}

impl<'a> SerialDeduper<'a> {
    pub fn new(caller: &'a CallerId, token: &'a ClientSerial) -> Self {
        Self { caller, token }
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::CallSerial(self.caller.clone(), self.token.clone())
    }

    /// Locks the token row and returns the outcome recorded for it, if any.
    ///
    /// Must run before any commission or holding lock is taken in `tx`.
    pub async fn claim(
        &self,
        tx: &mut dyn QuotaTransaction,
    ) -> StorageResult<Option<IssueOutcome>> {
        tx.lock(&[self.lock_key()]).await?;
        Ok(tx
            .call_serial(self.caller, self.token)
            .await?
            .map(|record| record.outcome))
    }

    /// Stages the outcome so replays return it without re-validating.
    pub async fn remember(
        &self,
        tx: &mut dyn QuotaTransaction,
        outcome: IssueOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        tx.record_call_serial(CallSerialRecord {
            caller: self.caller.clone(),
            client_serial: self.token.clone(),
            outcome,
            recorded_at: at,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quota_storage::memory::InMemoryQuotaStorage;
    use quota_storage::TransactionalStore;
    use quota_types::Serial;

    #[tokio::test]
    async fn remembered_outcome_is_replayed_per_caller() {
        let storage = InMemoryQuotaStorage::new();
        let compute = CallerId::new("compute");
        let network = CallerId::new("network");
        let token = ClientSerial::new("req-1");

        let mut tx = storage.begin().await.unwrap();
        let deduper = SerialDeduper::new(&compute, &token);
        assert!(deduper.claim(tx.as_mut()).await.unwrap().is_none());
        deduper
            .remember(tx.as_mut(), IssueOutcome::Issued { serial: Serial(7) }, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        assert_eq!(
            deduper.claim(tx.as_mut()).await.unwrap(),
            Some(IssueOutcome::Issued { serial: Serial(7) })
        );
        drop(tx);

        let mut tx = storage.begin().await.unwrap();
        let other = SerialDeduper::new(&network, &token);
        assert!(other.claim(tx.as_mut()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_transaction_forgets_the_token() {
        let storage = InMemoryQuotaStorage::new();
        let caller = CallerId::new("compute");
        let token = ClientSerial::new("req-2");
        let deduper = SerialDeduper::new(&caller, &token);

        let mut tx = storage.begin().await.unwrap();
        deduper.claim(tx.as_mut()).await.unwrap();
        deduper
            .remember(tx.as_mut(), IssueOutcome::Issued { serial: Serial(1) }, Utc::now())
            .await
            .unwrap();
        drop(tx);

        let mut tx = storage.begin().await.unwrap();
        assert!(deduper.claim(tx.as_mut()).await.unwrap().is_none());
    }
}
