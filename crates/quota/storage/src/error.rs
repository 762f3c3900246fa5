use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Failures of the quota storage layer.
///
/// `Conflict` is reserved for unique-key collisions (create-only definitions,
/// consumed client serials); the ledger maps it to a duplicate error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("quota record not found: {0}")]
    NotFound(String),

    #[error("unique key conflict: {0}")]
    Conflict(String),

    /// Lock order or commission state machine broken by the caller.
    #[error("storage invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid storage input: {0}")]
    InvalidInput(String),

    #[error("quota record encoding failed: {0}")]
    Serialization(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn poisoned(what: &str) -> Self {
        StorageError::Backend(format!("{what} lock poisoned"))
    }

    pub(crate) fn already_committed() -> Self {
        StorageError::InvariantViolation("transaction already committed".to_string())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}
