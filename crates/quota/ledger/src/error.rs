use quota_storage::StorageError;
use quota_types::{describe_failures, HoldingKey, KeyFailure, ResourceName};
use thiserror::Error;

/// Errors surfaced by ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    // --- Request errors (no side effects) ---
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown resource: {0}")]
    UnknownResource(ResourceName),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("already defined: {0}")]
    Duplicate(String),

    // --- Admission ---
    #[error("commission refused: {}", describe_failures(.failures))]
    CommissionRefused { failures: Vec<KeyFailure> },

    /// A counter movement would break an accumulator. Never swallowed.
    #[error("commission value error on {key}: {message}")]
    CommissionValue { key: HoldingKey, message: String },

    #[error("holding operation blocked: {}", describe_failures(.failures))]
    HoldingBlocked { failures: Vec<KeyFailure> },

    // --- Audit ---
    #[error("provision log chain broken at sequence {sequence}")]
    AuditChainBroken { sequence: u64 },

    // --- Infrastructure ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub(crate) fn commission_value(key: &HoldingKey, message: impl Into<String>) -> Self {
        LedgerError::CommissionValue {
            key: key.clone(),
            message: message.into(),
        }
    }

    /// Per-key failures carried by refusal and blocking errors.
    pub fn failures(&self) -> &[KeyFailure] {
        match self {
            LedgerError::CommissionRefused { failures }
            | LedgerError::HoldingBlocked { failures } => failures,
            _ => &[],
        }
    }

    /// Capacity, stock and blocking outcomes a caller may retry with a smaller request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LedgerError::CommissionRefused { .. } | LedgerError::HoldingBlocked { .. }
        )
    }

    /// Maps create-only conflicts to [`LedgerError::Duplicate`].
    pub(crate) fn from_definition(err: StorageError, what: String) -> Self {
        match err {
            StorageError::Conflict(_) => LedgerError::Duplicate(what),
            other => LedgerError::Storage(other),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use quota_types::FailureReason;

    #[test]
    fn refusal_message_lists_every_key() {
        let err = LedgerError::CommissionRefused {
            failures: vec![
                KeyFailure::new(HoldingKey::new("a", "cpu"), FailureReason::NonExported),
                KeyFailure::new(
                    HoldingKey::new("b", "cpu"),
                    FailureReason::NoStock {
                        limit: 3,
                        requested: 5,
                    },
                ),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("a/cpu"));
        assert!(message.contains("b/cpu"));
        assert_eq!(err.failures().len(), 2);
        assert!(err.is_recoverable());
    }

    #[test]
    fn conflict_maps_to_duplicate() {
        let err = LedgerError::from_definition(
            StorageError::Conflict("policy exists".into()),
            "policy gold".into(),
        );
        assert!(matches!(err, LedgerError::Duplicate(name) if name == "policy gold"));

        let err = LedgerError::from_definition(StorageError::Backend("down".into()), "x".into());
        assert!(matches!(err, LedgerError::Storage(StorageError::Backend(_))));
        assert!(!err.is_recoverable());
    }
}
