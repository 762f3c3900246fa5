//! Request-scoped call context.

use chrono::{DateTime, Utc};
use quota_types::CallerId;
use uuid::Uuid;

/// Identity and correlation data carried explicitly into every ledger call.
///
/// The caller id scopes idempotency tokens and commission ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub caller: CallerId,
    pub request_id: Uuid,
    pub received_at: DateTime<Utc>,
}

impl CallContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self::for_caller(CallerId::new(caller))
    }

    pub fn for_caller(caller: CallerId) -> Self {
        Self {
            caller,
            request_id: Uuid::new_v4(),
            received_at: Utc::now(),
        }
    }

    /// Reuse an upstream correlation id.
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_get_distinct_request_ids() {
        let a = CallContext::new("compute");
        let b = CallContext::new("compute");
        assert_eq!(a.caller, b.caller);
        assert_ne!(a.request_id, b.request_id);

        let fixed = Uuid::new_v4();
        assert_eq!(a.with_request_id(fixed).request_id, fixed);
    }
}
