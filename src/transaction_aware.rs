use async_trait::async_trait;
use uuid::Uuid;

use crate::TransactionResult;

/// Trait for components that need to be notified of transaction outcomes.
///
/// Components implementing this trait can be registered with a [`Transaction`]
/// to receive callbacks once the transaction has committed or rolled back on
/// every enlisted resource. This allows session-level caches to be flushed or
/// discarded in step with the stores behind them.
///
/// [`Transaction`]: crate::Transaction
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// Called after every enlisted resource has committed.
    async fn on_commit(&self, transaction: Uuid) -> TransactionResult<()>;

    /// Called after every enlisted resource has rolled back.
    ///
    /// Implementations should use this to revert any in-memory state changes
    /// that were made during the transaction.
    async fn on_rollback(&self, transaction: Uuid) -> TransactionResult<()>;
}
