//! Error types for the record-store driver layer.

use thiserror::Error;

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store drivers and sessions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store does not exist at the given identifier.
    #[error("store not found: {0}")]
    NotFound(String),

    /// A store already exists under this identifier.
    #[error("store already provisioned: {0}")]
    AlreadyExists(String),

    /// The pass key does not open this store.
    ///
    /// This is what a wrong PIN looks like from the driver: the derived
    /// wallet key fails the store's key check. The unlock state machine
    /// maps it to an attempt-counted failure.
    #[error("invalid pass key for store: {0}")]
    InvalidKey(String),

    /// The store was provisioned under a different key-wrap scheme.
    #[error("key-wrap scheme mismatch for store {store}: expected {expected}, got {actual}")]
    SchemeMismatch {
        /// Store identifier.
        store: String,
        /// Scheme the store was provisioned with.
        expected: String,
        /// Scheme supplied to `open`.
        actual: String,
    },

    /// A record with this category/id already exists.
    #[error("duplicate record: {category}/{id}")]
    DuplicateRecord {
        /// Record category.
        category: String,
        /// Record id.
        id: String,
    },

    /// A key entry with this name already exists.
    #[error("duplicate key entry: {0}")]
    DuplicateKey(String),

    /// The named key entry does not exist.
    #[error("key entry not found: {0}")]
    KeyNotFound(String),

    /// The session was closed and can no longer be used.
    #[error("session closed")]
    SessionClosed,

    /// Value (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend failure in the driver itself.
    #[error("store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::InvalidKey("idwallet-wallet-2".into());
        assert!(format!("{err}").contains("invalid pass key"));

        let err = StoreError::SchemeMismatch {
            store: "idwallet-wallet-1".into(),
            expected: "raw".into(),
            actual: "kdf-derived".into(),
        };
        assert!(format!("{err}").contains("scheme mismatch"));
    }
}
