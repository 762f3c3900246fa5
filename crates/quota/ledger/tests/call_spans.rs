//! Every ledger call runs inside a span carrying the caller and request id.

use quota_ledger::{
    CallContext, CommissionRequest, HoldingKey, LogWindow, Provision, QuotaLedger, QuotaPolicy,
    Serial,
};
use std::sync::{Arc, Mutex};
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Clone, Default)]
struct SpanRecorder {
    spans: Arc<Mutex<Vec<(String, bool, bool)>>>,
}

impl SpanRecorder {
    fn entered(&self, name: &str) -> bool {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .any(|(span, caller, request_id)| span == name && *caller && *request_id)
    }
}

impl<S: Subscriber> Layer<S> for SpanRecorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let fields = attrs.metadata().fields();
        self.spans.lock().unwrap().push((
            attrs.metadata().name().to_string(),
            fields.field("caller").is_some(),
            fields.field("request_id").is_some(),
        ));
    }
}

#[tokio::test]
async fn read_calls_carry_call_context() -> anyhow::Result<()> {
    let recorder = SpanRecorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let ledger = QuotaLedger::in_memory();
    let ctx = CallContext::new("compute");
    ledger
        .set_quota(&ctx, HoldingKey::new("userA", "cpu"), QuotaPolicy::with_capacity(4))
        .await?;
    let serial = ledger
        .issue_commission(
            &ctx,
            CommissionRequest::new("userA").with_provision(Provision::grant("cpu", 1)),
        )
        .await?;

    ledger.pending_commissions(&ctx).await?;
    ledger.get_commission(&ctx, serial).await?;
    ledger.accept_commissions(&ctx, &[serial]).await?;
    ledger.provision_log(&ctx, LogWindow::default()).await?;
    ledger.provision_log_for(&ctx, Serial(1)).await?;
    ledger.get_policies(&ctx, &["gold"]).await?;
    ledger.list_resources(&ctx).await?;

    for name in [
        "pending_commissions",
        "get_commission",
        "provision_log",
        "provision_log_for",
        "get_policies",
        "list_resources",
        "issue_commission",
        "accept_commissions",
    ] {
        assert!(recorder.entered(name), "no context span for {name}");
    }
    Ok(())
}
