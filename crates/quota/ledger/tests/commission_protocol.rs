//! Commission protocol scenarios: admission, resolution and idempotent replay.

use quota_ledger::{
    CallContext, CommissionRequest, CommissionState, FailureReason, HolderId, HoldingCounters,
    HoldingKey, HoldingReset, KeyFailure, LedgerError, Provision, QuotaFlag, QuotaLedger,
    QuotaPolicy, QuotaView, Serial,
};
use std::sync::Arc;

fn admin() -> CallContext {
    CallContext::new("admin")
}

fn compute() -> CallContext {
    CallContext::new("compute")
}

async fn quota(ledger: &QuotaLedger, holder: &str, resource: &str) -> QuotaView {
    ledger
        .get_quota(&admin(), &[HoldingKey::new(holder, resource)])
        .await
        .expect("get quota")
        .remove(0)
}

fn grant(target: &str, resource: &str, quantity: u64) -> CommissionRequest {
    CommissionRequest::new(target)
        .with_name("grant")
        .with_provision(Provision::grant(resource, quantity))
}

#[tokio::test]
async fn full_capacity_refuses_next_import() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(&admin(), HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();

    let s1 = ledger
        .issue_commission(&ctx, grant("userA", "cpu", 10))
        .await
        .expect("first commission fits");

    let err = ledger
        .issue_commission(&ctx, grant("userA", "cpu", 1))
        .await
        .expect_err("capacity exhausted");
    match err {
        LedgerError::CommissionRefused { failures } => {
            assert_eq!(
                failures,
                vec![KeyFailure::new(
                    HoldingKey::new("userA", "cpu"),
                    FailureReason::NoCapacity {
                        limit: 10,
                        requested: 11,
                        current: 10,
                    },
                )]
            );
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(ledger.pending_commissions(&ctx).await.unwrap(), vec![s1]);
    assert_eq!(quota(&ledger, "userA", "cpu").await.counters.importing, 10);
}

#[tokio::test]
async fn accept_moves_pending_into_imported() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(&admin(), HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();
    let s1 = ledger
        .issue_commission(&ctx, grant("userA", "cpu", 10))
        .await
        .unwrap();

    let report = ledger.accept_commissions(&ctx, &[s1]).await.unwrap();
    assert_eq!(report.accepted, vec![s1]);
    assert_eq!(report.resolved_count(), 1);

    let view = quota(&ledger, "userA", "cpu").await;
    assert_eq!(view.counters.imported, 10);
    assert_eq!(view.counters.importing, 0);
    assert!(ledger.pending_commissions(&ctx).await.unwrap().is_empty());

    let commission = ledger.get_commission(&ctx, s1).await.unwrap().unwrap();
    assert_eq!(commission.state, CommissionState::Accepted);
    assert!(commission.resolved_at.is_some());
}

#[tokio::test]
async fn lending_beyond_stock_leaves_source_untouched() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(
            &admin(),
            HoldingKey::new("es1", "cpu"),
            QuotaPolicy::with_capacity(100).flag(QuotaFlag::Exportable),
        )
        .await
        .unwrap();
    ledger
        .set_quota(&admin(), HoldingKey::new("userB", "cpu"), QuotaPolicy::with_capacity(100))
        .await
        .unwrap();
    let stocked = ledger
        .issue_commission(&ctx, grant("es1", "cpu", 3))
        .await
        .unwrap();
    ledger.accept_commissions(&ctx, &[stocked]).await.unwrap();
    let before = quota(&ledger, "es1", "cpu").await;
    assert_eq!(before.counters.held(), 3);

    let err = ledger
        .issue_commission(
            &ctx,
            CommissionRequest::new("userB")
                .with_provision(Provision::import(Some(HolderId::new("es1")), "cpu", 5)),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.failures(),
        &[KeyFailure::new(
            HoldingKey::new("es1", "cpu"),
            FailureReason::NoStock {
                limit: 3,
                requested: 5,
            },
        )]
    );

    assert_eq!(quota(&ledger, "es1", "cpu").await.counters, before.counters);
    assert_eq!(
        quota(&ledger, "userB", "cpu").await.counters,
        HoldingCounters::default()
    );
}

#[tokio::test]
async fn lending_from_non_exportable_source_is_refused() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(&admin(), HoldingKey::new("es1", "cpu"), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();

    let err = ledger
        .issue_commission(
            &ctx,
            CommissionRequest::new("userB")
                .with_provision(Provision::import(Some(HolderId::new("es1")), "cpu", 1)),
        )
        .await
        .unwrap_err();
    let failures = err.failures();
    assert!(failures.contains(&KeyFailure::new(
        HoldingKey::new("es1", "cpu"),
        FailureReason::NonExported
    )));
}

#[tokio::test]
async fn lent_quantity_can_be_returned() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(
            &admin(),
            HoldingKey::new("pool", "ram"),
            QuotaPolicy::with_capacity(64).flag(QuotaFlag::Exportable),
        )
        .await
        .unwrap();
    ledger
        .set_quota(&admin(), HoldingKey::new("tenant", "ram"), QuotaPolicy::with_capacity(16))
        .await
        .unwrap();
    let fill = ledger
        .issue_commission(&ctx, grant("pool", "ram", 64))
        .await
        .unwrap();
    ledger.accept_commissions(&ctx, &[fill]).await.unwrap();

    let pool = Some(HolderId::new("pool"));
    let lend = ledger
        .issue_commission(
            &ctx,
            CommissionRequest::new("tenant")
                .with_provision(Provision::import(pool.clone(), "ram", 16)),
        )
        .await
        .unwrap();
    ledger.accept_commissions(&ctx, &[lend]).await.unwrap();
    assert_eq!(quota(&ledger, "pool", "ram").await.counters.available_stock(), 48);

    let give_back = ledger
        .issue_commission(
            &ctx,
            CommissionRequest::new("tenant").with_provision(Provision::export(pool, "ram", 6)),
        )
        .await
        .unwrap();
    ledger.accept_commissions(&ctx, &[give_back]).await.unwrap();

    let tenant = quota(&ledger, "tenant", "ram").await.counters;
    assert_eq!((tenant.imported, tenant.released), (16, 6));
    assert_eq!(tenant.held(), 10);
    let pool = quota(&ledger, "pool", "ram").await.counters;
    assert_eq!((pool.exported, pool.returned), (16, 6));
    assert_eq!(pool.available_stock(), 54);
}

#[tokio::test]
async fn over_release_surfaces_commission_value() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    let err = ledger
        .issue_commission(
            &ctx,
            CommissionRequest::new("userA").with_provision(Provision::release("cpu", 1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::CommissionValue { .. }));
    assert!(!quota(&ledger, "userA", "cpu").await.exists);
}

#[tokio::test]
async fn release_blocked_by_pending_commission() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    let idle = HoldingKey::new("idle", "disk");
    let busy = HoldingKey::new("busy", "disk");
    ledger
        .set_quota(&admin(), idle.clone(), QuotaPolicy::with_capacity(5))
        .await
        .unwrap();
    ledger
        .set_quota(&admin(), busy.clone(), QuotaPolicy::with_capacity(5))
        .await
        .unwrap();

    let released = ledger.release_holdings(&admin(), &[idle.clone()]).await.unwrap();
    assert_eq!(released, vec![idle.clone()]);
    assert!(!quota(&ledger, "idle", "disk").await.exists);

    let serial = ledger
        .issue_commission(&ctx, grant("busy", "disk", 2))
        .await
        .unwrap();
    let err = ledger
        .release_holdings(&admin(), &[busy.clone()])
        .await
        .unwrap_err();
    match &err {
        LedgerError::HoldingBlocked { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].key, busy);
            assert_eq!(failures[0].reason, FailureReason::PendingCommission);
        }
        other => panic!("unexpected error {other:?}"),
    }

    ledger.reject_commissions(&ctx, &[serial]).await.unwrap();
    assert!(ledger.release_holding(&admin(), busy).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_for_last_unit_admits_exactly_one() {
    let ledger = Arc::new(QuotaLedger::in_memory());
    let key = HoldingKey::new("userA", "cpu");
    ledger
        .set_quota(&admin(), key.clone(), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();
    let filler = ledger
        .issue_commission(&compute(), grant("userA", "cpu", 9))
        .await
        .unwrap();
    ledger.accept_commissions(&compute(), &[filler]).await.unwrap();

    // A second engine instance over the same store.
    let other = Arc::new(QuotaLedger::with_storage(ledger.storage()));
    let mut tasks = Vec::new();
    for (index, engine) in [Arc::clone(&ledger), other].into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let ctx = CallContext::new(format!("service-{index}"));
            engine.issue_commission(&ctx, grant("userA", "cpu", 1)).await
        }));
    }

    let mut admitted = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(_) => admitted += 1,
            Err(LedgerError::CommissionRefused { failures }) => {
                assert!(matches!(
                    failures[0].reason,
                    FailureReason::NoCapacity { limit: 10, requested: 11, current: 10 }
                ));
                refused += 1;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((admitted, refused), (1, 1));

    let view = quota(&ledger, "userA", "cpu").await;
    assert_eq!(view.counters.usage(), 10);
    assert!(view.counters.usage() <= view.limit());
}

#[tokio::test]
async fn resolving_twice_is_a_no_op() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(&admin(), HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();
    let accepted = ledger
        .issue_commission(&ctx, grant("userA", "cpu", 4))
        .await
        .unwrap();
    let rejected = ledger
        .issue_commission(&ctx, grant("userA", "cpu", 3))
        .await
        .unwrap();

    ledger.accept_commissions(&ctx, &[accepted]).await.unwrap();
    ledger.reject_commissions(&ctx, &[rejected]).await.unwrap();
    let once = quota(&ledger, "userA", "cpu").await.counters;
    let log_len = ledger
        .provision_log(&ctx, Default::default())
        .await
        .unwrap()
        .len();

    let again = ledger
        .accept_commissions(&ctx, &[accepted, rejected])
        .await
        .unwrap();
    assert!(again.accepted.is_empty());
    assert_eq!(
        again.previously_resolved,
        vec![
            (accepted, CommissionState::Accepted),
            (rejected, CommissionState::Rejected),
        ]
    );
    let again = ledger.reject_commissions(&ctx, &[accepted]).await.unwrap();
    assert!(again.rejected.is_empty());

    assert_eq!(quota(&ledger, "userA", "cpu").await.counters, once);
    assert_eq!(once.imported, 4);
    assert_eq!(once.importing, 0);
    assert_eq!(
        ledger
            .provision_log(&ctx, Default::default())
            .await
            .unwrap()
            .len(),
        log_len
    );
}

#[tokio::test]
async fn foreign_and_unknown_serials_are_skipped() {
    let ledger = QuotaLedger::in_memory();
    ledger
        .set_quota(&admin(), HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();
    let serial = ledger
        .issue_commission(&compute(), grant("userA", "cpu", 2))
        .await
        .unwrap();

    let intruder = CallContext::new("network");
    let report = ledger
        .accept_commissions(&intruder, &[serial, Serial(9_999)])
        .await
        .unwrap();
    assert_eq!(report.skipped, vec![serial, Serial(9_999)]);
    assert!(ledger.get_commission(&intruder, serial).await.unwrap().is_none());
    assert_eq!(quota(&ledger, "userA", "cpu").await.counters.importing, 2);
}

#[tokio::test]
async fn client_serial_replays_issue_outcome() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(&admin(), HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();

    let request = grant("userA", "cpu", 6).with_client_serial("boot-vm-1");
    let first = ledger.issue_commission(&ctx, request.clone()).await.unwrap();
    let second = ledger.issue_commission(&ctx, request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(quota(&ledger, "userA", "cpu").await.counters.importing, 6);
    assert_eq!(ledger.pending_commissions(&ctx).await.unwrap(), vec![first]);

    // Same token, different caller: an independent namespace.
    let other = CallContext::new("storage");
    let refused = ledger
        .issue_commission(&other, grant("userA", "cpu", 6).with_client_serial("boot-vm-1"))
        .await
        .unwrap_err();
    assert!(refused.is_recoverable());

    // The refusal is replayed even after capacity frees up.
    ledger.reject_commissions(&ctx, &[first]).await.unwrap();
    let replayed = ledger
        .issue_commission(&other, grant("userA", "cpu", 6).with_client_serial("boot-vm-1"))
        .await
        .unwrap_err();
    assert_eq!(replayed.failures(), refused.failures());
    assert_eq!(quota(&ledger, "userA", "cpu").await.counters.importing, 0);
}

#[tokio::test]
async fn recovery_sweep_resolves_up_to_max_serial() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    ledger
        .set_quota(&admin(), HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(100))
        .await
        .unwrap();

    let mut serials = Vec::new();
    for _ in 0..4 {
        serials.push(
            ledger
                .issue_commission(&ctx, grant("userA", "cpu", 5))
                .await
                .unwrap(),
        );
    }
    let pending = ledger.pending_commissions(&ctx).await.unwrap();
    assert_eq!(pending, serials);

    let report = ledger
        .resolve_pending_commissions(&ctx, serials[2], &[serials[1]])
        .await
        .unwrap();
    assert_eq!(report.accepted, vec![serials[1]]);
    assert_eq!(report.rejected, vec![serials[0], serials[2]]);
    assert_eq!(ledger.pending_commissions(&ctx).await.unwrap(), vec![serials[3]]);

    let view = quota(&ledger, "userA", "cpu").await;
    assert_eq!(view.counters.imported, 5);
    assert_eq!(view.counters.importing, 5);
}

#[tokio::test]
async fn invalid_requests_fail_fast() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    let cases = [
        CommissionRequest::new("userA"),
        CommissionRequest::new("").with_provision(Provision::grant("cpu", 1)),
        CommissionRequest::new("userA").with_provision(Provision::grant("cpu", 0)),
        CommissionRequest::new("userA").with_provision(Provision::grant("", 1)),
        CommissionRequest::new("userA")
            .with_provision(Provision::import(Some(HolderId::new("userA")), "cpu", 1)),
        grant("userA", "cpu", 1).with_name("n".repeat(257)),
        grant("userA", "cpu", 1).with_client_serial(""),
    ];
    for request in cases {
        let err = ledger.issue_commission(&ctx, request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)), "{err:?}");
    }
    assert!(ledger.pending_commissions(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_refuses_referenced_and_unknown_holdings() {
    let ledger = QuotaLedger::in_memory();
    let ctx = compute();
    let key = HoldingKey::new("userA", "cpu");
    ledger
        .set_quota(&admin(), key.clone(), QuotaPolicy::with_capacity(10))
        .await
        .unwrap();
    let serial = ledger
        .issue_commission(&ctx, grant("userA", "cpu", 2))
        .await
        .unwrap();

    let err = ledger
        .reset_holdings(
            &admin(),
            vec![
                HoldingReset::zeroed(key.clone()),
                HoldingReset::zeroed(HoldingKey::new("ghost", "cpu")),
            ],
        )
        .await
        .unwrap_err();
    let reasons = err
        .failures()
        .iter()
        .map(|failure| failure.reason.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![FailureReason::UnknownHolding, FailureReason::PendingCommission]
    );

    ledger.accept_commissions(&ctx, &[serial]).await.unwrap();
    let view = ledger
        .reset_holding(&admin(), HoldingReset::zeroed(key))
        .await
        .unwrap();
    assert_eq!(view.counters, HoldingCounters::default());
    assert_eq!(view.limit(), 10);
}
