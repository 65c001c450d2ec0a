//! Error types for the shard store.

use crate::types::{ShardId, TypeTag};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {user} may not {permission}")]
    PermissionDenied { user: String, permission: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Schema violation: values tagged {tag} must be {expected}")]
    SchemaViolation { tag: TypeTag, expected: String },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Shard {shard} is corrupt: {detail}")]
    ShardCorruption { shard: ShardId, detail: String },

    #[error("A transaction is already open")]
    TransactionAlreadyOpen,

    #[error("No transaction is open")]
    NoOpenTransaction,

    #[error("Indexing is only supported on ID, Type or Value (got {0})")]
    UnsupportedField(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Operation panicked: {0}")]
    WorkerPanic(String),
}

impl StoreError {
    /// Whether this error rejects an operation before anything durable happened.
    ///
    /// Rejections are returned straight to the caller. Everything else is a
    /// mid-operation failure and gets an `error` entry in the operation log.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::PermissionDenied { .. }
                | StoreError::Auth(_)
                | StoreError::UserExists(_)
                | StoreError::SchemaViolation { .. }
                | StoreError::PayloadTooLarge { .. }
                | StoreError::TransactionAlreadyOpen
                | StoreError::NoOpenTransaction
                | StoreError::UnsupportedField(_)
                | StoreError::InvalidConfig(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
