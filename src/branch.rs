use async_trait::async_trait;
use sqlx::Connection;
use tracing::{trace, warn};

use crate::{Executor, TransactionError, TransactionResult};

/// A resource enlisted in a coordinated transaction.
///
/// The coordinator calls `prepare` on every participant before it calls
/// `commit` on any of them. A participant that cannot guarantee its commit
/// must refuse in `prepare`.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Name of the resource this participant stands for.
    fn resource(&self) -> &str;

    /// Phase one: verify the pending work can be made durable.
    async fn prepare(&self) -> TransactionResult<()>;

    /// Phase two: make the pending work durable.
    async fn commit(&self) -> TransactionResult<()>;

    /// Discard the pending work. Must succeed quietly when there is nothing left to undo.
    async fn rollback(&self) -> TransactionResult<()>;
}

/// The work one transaction has done on one SQLite resource.
pub struct TransactionBranch {
    resource: String,
    executor: Executor,
}

impl TransactionBranch {
    pub fn new(resource: &str, executor: Executor) -> Self {
        Self {
            resource: resource.to_string(),
            executor,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

#[async_trait]
impl Participant for TransactionBranch {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn prepare(&self) -> TransactionResult<()> {
        let mut guard = self.executor.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.executor.released())?;

        if let Err(e) = (**conn).ping().await {
            conn.mark_broken();
            return Err(TransactionError::CommitFailed(format!(
                "{} is not reachable: {e}",
                self.resource
            )));
        }

        // Deferred foreign keys are only enforced at COMMIT; check them now.
        let violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&mut **conn)
            .await?;
        if !violations.is_empty() {
            return Err(TransactionError::CommitFailed(format!(
                "{} has {} pending foreign key violation(s)",
                self.resource,
                violations.len()
            )));
        }
        trace!(resource = %self.resource, "Prepared");
        Ok(())
    }

    async fn commit(&self) -> TransactionResult<()> {
        let mut conn = self.executor.take_connection().await?;
        if let Err(e) = conn.finish("COMMIT").await {
            // The connection is marked broken and will be discarded; make sure nothing stays open.
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                trace!(resource = %self.resource, error = %rollback, "No transaction left to roll back");
            }
            return Err(e.into());
        }
        trace!(resource = %self.resource, "Committed");
        Ok(())
    }

    async fn rollback(&self) -> TransactionResult<()> {
        let Some(mut conn) = self.executor.try_take_connection().await else {
            return Ok(());
        };
        if let Err(e) = conn.finish("ROLLBACK").await {
            warn!(resource = %self.resource, error = %e, "Rollback failed; discarding connection");
            return Err(TransactionError::RollbackFailed(format!(
                "{}: {e}",
                self.resource
            )));
        }
        trace!(resource = %self.resource, "Rolled back");
        Ok(())
    }
}
