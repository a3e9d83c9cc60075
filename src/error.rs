use std::path::PathBuf;

use uuid::Uuid;

use crate::coordinator::TransactionState;

/// Error type for pool, coordinator and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Pool {resource} exhausted: all {max} connections are checked out")]
    PoolExhausted { resource: String, max: usize },

    #[error("Pool {0} is closed")]
    PoolClosed(String),

    #[error("Resource {resource} unavailable: {source}")]
    ResourceUnavailable {
        resource: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Local transactions are not allowed on {0}")]
    LocalTransactionsDisallowed(String),

    #[error("Transaction {0} is already active")]
    AlreadyActive(Uuid),

    #[error("No transaction has been started")]
    NoTransaction,

    #[error("Cannot {operation} transaction {id} in state {state}")]
    InvalidState {
        id: Uuid,
        operation: &'static str,
        state: TransactionState,
    },

    #[error("Transaction manager is shut down")]
    ManagerShutdown,

    #[error("Transaction commit failed: {0}")]
    CommitFailed(String),

    #[error("Transaction rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Connection to {0} was already released by its transaction")]
    BranchReleased(String),

    #[error("Shutdown of {resource} reported failure (code {code}, state {state}): {reason}")]
    ShutdownReportedFailure {
        resource: String,
        code: i32,
        state: String,
        reason: String,
    },

    #[error("Resource {0} is already provisioned")]
    DuplicateResource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Result type for pool, coordinator and lifecycle operations
pub type TransactionResult<T> = Result<T, TransactionError>;
