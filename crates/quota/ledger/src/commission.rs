//! Two-phase commission protocol: issue, then accept or reject.

use crate::admission::WorkingSet;
use crate::context::CallContext;
use crate::dedup::SerialDeduper;
use crate::engine::{holding_locks, QuotaLedger};
use crate::error::{LedgerError, LedgerResult};
use chrono::Utc;
use quota_storage::LockKey;
use quota_types::{
    describe_failures, holding_keys, Commission, CommissionRequest, CommissionState, HoldingKey,
    IssueOutcome, ResolutionReport, Serial,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, instrument, warn};

impl QuotaLedger {
    /// Reserve every provision of `request` atomically and record a pending
    /// commission.
    ///
    /// With a client serial, a repeated call returns the recorded outcome
    /// (serial or refusal) without validating again.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        target = %request.target,
        provisions = request.provisions.len(),
    ))]
    pub async fn issue_commission(
        &self,
        ctx: &CallContext,
        request: CommissionRequest,
    ) -> LedgerResult<Serial> {
        self.validate_request(&request)?;
        let defaults = self
            .resource_defaults(request.provisions.iter().map(|p| &p.resource))
            .await?;
        let now = Utc::now();

        let mut tx = self.storage.begin().await?;
        let deduper = request
            .client_serial
            .as_ref()
            .map(|token| SerialDeduper::new(&ctx.caller, token));
        if let Some(deduper) = &deduper {
            if let Some(outcome) = deduper.claim(tx.as_mut()).await? {
                debug!(?outcome, "replaying recorded issue outcome");
                return match outcome {
                    IssueOutcome::Issued { serial } => Ok(serial),
                    IssueOutcome::Refused { failures } => {
                        Err(LedgerError::CommissionRefused { failures })
                    }
                };
            }
        }

        let keys = holding_keys(&request.target, &request.provisions);
        tx.lock(&holding_locks(&keys)).await?;
        let mut set = WorkingSet::load_or_create(tx.as_mut(), &keys, &defaults, now).await?;

        let failures = set
            .admit(&request.target, &request.provisions)
            .inspect_err(log_value_error)?;
        if !failures.is_empty() {
            // Only the idempotency row survives a refusal.
            drop(set);
            if let Some(deduper) = &deduper {
                let outcome = IssueOutcome::Refused {
                    failures: failures.clone(),
                };
                deduper.remember(tx.as_mut(), outcome, now).await?;
                tx.commit().await?;
            }
            warn!(reasons = %describe_failures(&failures), "commission refused");
            return Err(LedgerError::CommissionRefused { failures });
        }

        let serial = tx.next_serial().await?;
        set.flush(tx.as_mut()).await?;
        tx.insert_commission(Commission {
            serial,
            caller: ctx.caller.clone(),
            client_serial: request.client_serial.clone(),
            target: request.target,
            name: request.name,
            provisions: request.provisions,
            issued_at: now,
            state: CommissionState::Pending,
            resolved_at: None,
        })
        .await?;
        if let Some(deduper) = &deduper {
            deduper
                .remember(tx.as_mut(), IssueOutcome::Issued { serial }, now)
                .await?;
        }
        tx.commit().await?;
        info!(serial = serial.value(), "commission issued");
        Ok(serial)
    }

    /// Commit the pending amounts of the caller's `serials`.
    ///
    /// Unknown, foreign and already resolved serials are reported, not failed.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        serials = serials.len(),
    ))]
    pub async fn accept_commissions(
        &self,
        ctx: &CallContext,
        serials: &[Serial],
    ) -> LedgerResult<ResolutionReport> {
        self.check_batch(serials.len(), "serials")?;
        let decisions = serials
            .iter()
            .map(|serial| (*serial, CommissionState::Accepted))
            .collect();
        self.resolve(ctx, decisions, "accept").await
    }

    /// Undo the pending amounts of the caller's `serials`.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        serials = serials.len(),
    ))]
    pub async fn reject_commissions(
        &self,
        ctx: &CallContext,
        serials: &[Serial],
    ) -> LedgerResult<ResolutionReport> {
        self.check_batch(serials.len(), "serials")?;
        let decisions = serials
            .iter()
            .map(|serial| (*serial, CommissionState::Rejected))
            .collect();
        self.resolve(ctx, decisions, "reject").await
    }

    /// Recovery sweep: every pending commission of the caller up to
    /// `max_serial` is accepted when listed in `accept`, rejected otherwise.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        max_serial = max_serial.value(),
    ))]
    pub async fn resolve_pending_commissions(
        &self,
        ctx: &CallContext,
        max_serial: Serial,
        accept: &[Serial],
    ) -> LedgerResult<ResolutionReport> {
        self.check_batch(accept.len(), "serials")?;
        let accept = accept.iter().copied().collect::<BTreeSet<_>>();
        let decisions = self
            .storage
            .pending_serials(&ctx.caller)
            .await?
            .into_iter()
            .filter(|serial| *serial <= max_serial)
            .map(|serial| {
                let state = if accept.contains(&serial) {
                    CommissionState::Accepted
                } else {
                    CommissionState::Rejected
                };
                (serial, state)
            })
            .collect();
        self.resolve(ctx, decisions, "resolve_pending").await
    }

    /// Serials still pending for the caller, ascending.
    #[instrument(skip_all, fields(caller = %ctx.caller, request_id = %ctx.request_id))]
    pub async fn pending_commissions(&self, ctx: &CallContext) -> LedgerResult<Vec<Serial>> {
        Ok(self.storage.pending_serials(&ctx.caller).await?)
    }

    /// A commission owned by the caller. Foreign serials read as absent.
    #[instrument(skip_all, fields(
        caller = %ctx.caller,
        request_id = %ctx.request_id,
        serial = %serial,
    ))]
    pub async fn get_commission(
        &self,
        ctx: &CallContext,
        serial: Serial,
    ) -> LedgerResult<Option<Commission>> {
        Ok(self
            .storage
            .get_commission(serial)
            .await?
            .filter(|commission| commission.caller == ctx.caller))
    }

    async fn resolve(
        &self,
        ctx: &CallContext,
        decisions: BTreeMap<Serial, CommissionState>,
        reason: &str,
    ) -> LedgerResult<ResolutionReport> {
        let now = Utc::now();
        let mut report = ResolutionReport::default();
        if decisions.is_empty() {
            return Ok(report);
        }

        let mut tx = self.storage.begin().await?;
        let locks = decisions
            .keys()
            .map(|serial| LockKey::Commission(*serial))
            .collect::<Vec<_>>();
        tx.lock(&locks).await?;

        let mut due = Vec::new();
        for (serial, state) in decisions {
            match tx.commission(serial).await? {
                Some(commission) if commission.caller == ctx.caller => {
                    if commission.is_pending() {
                        due.push((commission, state));
                    } else {
                        report.previously_resolved.push((serial, commission.state));
                    }
                }
                _ => report.skipped.push(serial),
            }
        }
        if due.is_empty() {
            debug!(
                previously_resolved = report.previously_resolved.len(),
                skipped = report.skipped.len(),
                "nothing to resolve"
            );
            return Ok(report);
        }

        let keys = due
            .iter()
            .flat_map(|(commission, _)| commission.holding_keys())
            .collect::<BTreeSet<HoldingKey>>()
            .into_iter()
            .collect::<Vec<_>>();
        tx.lock(&holding_locks(&keys)).await?;
        let mut set = WorkingSet::load_existing(tx.as_mut(), &keys, now).await?;

        for (commission, state) in &due {
            let entries = set
                .settle(commission, *state, now, reason)
                .inspect_err(log_value_error)?;
            for entry in entries {
                tx.append_provision_log(entry).await?;
            }
            tx.resolve_commission(commission.serial, *state, now).await?;
            match state {
                CommissionState::Accepted => report.accepted.push(commission.serial),
                CommissionState::Rejected => report.rejected.push(commission.serial),
                CommissionState::Pending => {
                    return Err(LedgerError::InvalidRequest(format!(
                        "{} cannot be resolved to pending",
                        commission.serial
                    )))
                }
            }
        }

        set.flush(tx.as_mut()).await?;
        tx.commit().await?;
        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            previously_resolved = report.previously_resolved.len(),
            skipped = report.skipped.len(),
            "commissions resolved"
        );
        Ok(report)
    }

    /// Fail-fast request checks; no holding is read.
    fn validate_request(&self, request: &CommissionRequest) -> LedgerResult<()> {
        let invalid = |message: String| Err(LedgerError::InvalidRequest(message));

        if request.target.as_str().is_empty() {
            return invalid("commission target is empty".to_string());
        }
        if request.provisions.is_empty() {
            return invalid("commission has no provisions".to_string());
        }
        if request.provisions.len() > self.admission.max_provisions_per_commission {
            return invalid(format!(
                "{} provisions exceed the limit of {}",
                request.provisions.len(),
                self.admission.max_provisions_per_commission
            ));
        }
        if request.name.chars().count() > self.admission.max_commission_name_len {
            return invalid(format!(
                "commission name exceeds {} characters",
                self.admission.max_commission_name_len
            ));
        }
        if let Some(token) = &request.client_serial {
            if token.as_str().is_empty() {
                return invalid("client serial is empty".to_string());
            }
        }

        for (index, provision) in request.provisions.iter().enumerate() {
            if provision.quantity == 0 {
                return invalid(format!("provision {index} has zero quantity"));
            }
            if provision.resource.as_str().is_empty() {
                return invalid(format!("provision {index} has an empty resource"));
            }
            if let Some(source) = &provision.source {
                if source.as_str().is_empty() {
                    return invalid(format!("provision {index} has an empty source"));
                }
                if source == &request.target {
                    return invalid(format!(
                        "provision {index} moves {} from {source} to itself",
                        provision.resource
                    ));
                }
            }
        }
        Ok(())
    }
}

fn log_value_error(err: &LedgerError) {
    if let LedgerError::CommissionValue { key, message } = err {
        error!(key = %key, message = %message, "commission value error");
    }
}
