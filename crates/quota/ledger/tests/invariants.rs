//! Property tests: accumulator and capacity invariants hold across random
//! issue/accept/reject sequences.

use proptest::prelude::*;
use quota_ledger::{
    CallContext, CommissionRequest, HolderId, HoldingKey, LedgerError, Provision, QuotaFlag,
    QuotaLedger, QuotaPolicy, Serial,
};

const HOLDERS: [&str; 2] = ["alpha", "beta"];
const POOL: &str = "pool";
const CAPACITY: u64 = 12;

#[derive(Debug, Clone)]
enum Op {
    Grant { holder: usize, quantity: u64 },
    Lend { holder: usize, quantity: u64 },
    GiveBack { holder: usize, quantity: u64 },
    Accept(usize),
    Reject(usize),
}

fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
    let holder = 0..HOLDERS.len();
    proptest::collection::vec(
        prop_oneof![
            (holder.clone(), 1..6u64).prop_map(|(holder, quantity)| Op::Grant { holder, quantity }),
            (holder.clone(), 1..6u64).prop_map(|(holder, quantity)| Op::Lend { holder, quantity }),
            (holder, 1..4u64).prop_map(|(holder, quantity)| Op::GiveBack { holder, quantity }),
            any::<usize>().prop_map(Op::Accept),
            any::<usize>().prop_map(Op::Reject),
        ],
        0..40,
    )
}

async fn assert_invariants(ledger: &QuotaLedger, ctx: &CallContext) {
    let keys = HOLDERS
        .iter()
        .chain(std::iter::once(&POOL))
        .map(|holder| HoldingKey::new(*holder, "cpu"))
        .collect::<Vec<_>>();
    for view in ledger.get_quota(ctx, &keys).await.expect("quota") {
        let c = view.counters;
        assert!(c.imported >= c.released, "{}: {c:?}", view.key);
        assert!(c.exported >= c.returned, "{}: {c:?}", view.key);

        let net = i128::from(c.imported) - i128::from(c.released) + i128::from(c.importing)
            - i128::from(c.releasing);
        assert!(net <= i128::from(view.limit()), "{}: {c:?}", view.key);

        let committed_out = i128::from(c.exported) - i128::from(c.returned);
        let held = i128::from(c.imported) - i128::from(c.released);
        assert!(
            committed_out + i128::from(c.exporting) + i128::from(c.releasing) <= held,
            "{} lends more than it holds: {c:?}",
            view.key
        );
    }
}

proptest! {
    #[test]
    fn property_counters_stay_within_limits(ops in op_strategy()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        rt.block_on(async move {
            let ledger = QuotaLedger::in_memory();
            let admin = CallContext::new("admin");
            let ctx = CallContext::new("prop");

            ledger
                .set_quota(
                    &admin,
                    HoldingKey::new(POOL, "cpu"),
                    QuotaPolicy::with_capacity(CAPACITY * 2).flag(QuotaFlag::Exportable),
                )
                .await
                .expect("pool quota");
            for holder in HOLDERS {
                let key = HoldingKey::new(holder, "cpu");
                ledger
                    .set_quota(&admin, key, QuotaPolicy::with_capacity(CAPACITY))
                    .await
                    .expect("holder quota");
            }
            let stock = ledger
                .issue_commission(
                    &ctx,
                    CommissionRequest::new(POOL).with_provision(Provision::grant("cpu", CAPACITY)),
                )
                .await
                .expect("pool stock");
            ledger.accept_commissions(&ctx, &[stock]).await.expect("accept stock");

            let mut pending: Vec<Serial> = Vec::new();
            for op in ops {
                let issued = match op {
                    Op::Grant { holder, quantity } => Some(
                        CommissionRequest::new(HOLDERS[holder])
                            .with_provision(Provision::grant("cpu", quantity)),
                    ),
                    Op::Lend { holder, quantity } => Some(
                        CommissionRequest::new(HOLDERS[holder]).with_provision(Provision::import(
                            Some(HolderId::new(POOL)),
                            "cpu",
                            quantity,
                        )),
                    ),
                    Op::GiveBack { holder, quantity } => Some(
                        CommissionRequest::new(HOLDERS[holder]).with_provision(Provision::export(
                            Some(HolderId::new(POOL)),
                            "cpu",
                            quantity,
                        )),
                    ),
                    Op::Accept(_) | Op::Reject(_) if pending.is_empty() => None,
                    Op::Accept(pick) => {
                        let serial = pending.remove(pick % pending.len());
                        let report = ledger
                            .accept_commissions(&ctx, &[serial])
                            .await
                            .expect("accept");
                        assert_eq!(report.accepted, vec![serial]);
                        None
                    }
                    Op::Reject(pick) => {
                        let serial = pending.remove(pick % pending.len());
                        let report = ledger
                            .reject_commissions(&ctx, &[serial])
                            .await
                            .expect("reject");
                        assert_eq!(report.rejected, vec![serial]);
                        None
                    }
                };

                if let Some(request) = issued {
                    match ledger.issue_commission(&ctx, request).await {
                        Ok(serial) => pending.push(serial),
                        Err(LedgerError::CommissionRefused { failures }) => {
                            assert!(!failures.is_empty())
                        }
                        Err(LedgerError::CommissionValue { .. }) => {}
                        Err(other) => panic!("unexpected error {other:?}"),
                    }
                }
                assert_invariants(&ledger, &admin).await;
            }

            let mut listed = ledger.pending_commissions(&ctx).await.expect("pending");
            listed.sort();
            pending.sort();
            assert_eq!(listed, pending);
            assert_eq!(ledger.verify_provision_log(&admin).await.expect("chain"), ledger
                .provision_log(&admin, Default::default())
                .await
                .expect("log")
                .len());
        });
    }
}
