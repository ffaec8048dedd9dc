use thiserror::Error;

/// Errors that can occur when interacting with the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An insert collided with a uniqueness constraint.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// A row lock could not be acquired within the configured wait.
    #[error("Timed out waiting for lock on {resource}")]
    LockTimeout { resource: String },

    /// A row expected to exist was missing.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A stored value could not be mapped back to a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The backing store refused the operation.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Lock timeouts are contention, not failure.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, LedgerError::LockTimeout { .. })
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, LedgerError::UniqueViolation { .. })
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
