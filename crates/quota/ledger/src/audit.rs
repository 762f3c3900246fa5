//! Read-only provision log feed for audit and billing.

use crate::context::CallContext;
use crate::engine::QuotaLedger;
use crate::error::{LedgerError, LedgerResult};
use quota_storage::{first_broken_link, LogWindow, ProvisionLogRecord};
use quota_types::Serial;
use tracing::{error, info, instrument};

impl QuotaLedger {
    /// Records after `window.after_sequence`, oldest first.
    #[instrument(skip_all, fields(caller = %ctx.caller, request_id = %ctx.request_id))]
    pub async fn provision_log(
        &self,
        ctx: &CallContext,
        window: LogWindow,
    ) -> LedgerResult<Vec<ProvisionLogRecord>> {
        Ok(self.storage.list_provision_log(window).await?)
    }

    /// Records written when `serial` was resolved.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        serial = %serial,
    ))]
    pub async fn provision_log_for(
        &self,
        ctx: &CallContext,
        serial: Serial,
    ) -> LedgerResult<Vec<ProvisionLogRecord>> {
        Ok(self.storage.provision_log_for(serial).await?)
    }

    /// Recompute the hash chain over the whole log.
    ///
    /// Returns the number of verified records.
    #[instrument(skip_all, fields(caller = %ctx.caller, request_id = %ctx.request_id))]
    pub async fn verify_provision_log(&self, ctx: &CallContext) -> LedgerResult<usize> {
        let records = self
            .storage
            .list_provision_log(LogWindow::default())
            .await?;
        if let Some(sequence) = first_broken_link(&records)? {
            error!(sequence, "provision log chain broken");
            return Err(LedgerError::AuditChainBroken { sequence });
        }
        info!(records = records.len(), "provision log verified");
        Ok(records.len())
    }
}
