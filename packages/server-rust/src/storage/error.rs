//! Store error taxonomy and SQLSTATE classification.

/// SQLSTATE raised when a serializable transaction loses a conflict.
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE raised when the server breaks a deadlock by aborting a transaction.
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE raised on a unique or primary-key violation.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Failure of a repository call or of the transactional executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("uniqueness violation on {constraint}")]
    Conflict { constraint: String },
    /// The targeted row does not exist.
    #[error("no matching row")]
    NotFound,
    /// The transaction lost a serialization conflict and may be re-run.
    ///
    /// The executor absorbs this kind; callers of a repository never see it.
    #[error("transient serialization conflict")]
    TransientConflict,
    /// A bounded retry policy ran out of attempts.
    #[error("transaction abandoned after {attempts} conflicting attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the executor should re-run the unit of work.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict)
    }
}

/// Maps a database error code onto the store taxonomy.
///
/// `constraint` is the violated constraint name when the server reports one.
#[must_use]
pub fn classify_sqlstate(code: Option<&str>, constraint: Option<&str>, message: &str) -> StoreError {
    match code {
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => StoreError::TransientConflict,
        Some(UNIQUE_VIOLATION) => StoreError::Conflict {
            constraint: constraint.unwrap_or("unknown").to_string(),
        },
        Some(code) => StoreError::Backend(format!("{message} (sqlstate {code})")),
        None => StoreError::Backend(message.to_string()),
    }
}
