use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::{PooledConnection, TransactionError, TransactionResult};

/// Executor wraps the connection a transaction holds on one resource.
///
/// Clones share the connection, so every repository working on the same
/// resource within a transaction sees the writes of the others.
#[derive(Clone, Debug)]
pub struct Executor {
    resource: Arc<str>,
    pub conn: Arc<Mutex<Option<PooledConnection>>>,
}

impl Executor {
    /// Creates a new Executor around a connection that has already begun a transaction.
    pub fn new(resource: &str, conn: PooledConnection) -> Self {
        Self {
            resource: Arc::from(resource),
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Name of the resource this executor's connection belongs to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Lock the connection. The slot is empty once the transaction has finished.
    pub async fn lock(&self) -> MutexGuard<'_, Option<PooledConnection>> {
        self.conn.lock().await
    }

    /// Error returned when the connection has already gone back to the pool.
    pub fn released(&self) -> TransactionError {
        TransactionError::BranchReleased(self.resource.to_string())
    }

    /// True if both executors hand out the same physical connection.
    pub fn same_connection(&self, other: &Executor) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    /// Takes ownership of the connection, leaving None in its place.
    /// This should only be called when committing or rolling back.
    pub(crate) async fn take_connection(&self) -> TransactionResult<PooledConnection> {
        self.conn.lock().await.take().ok_or_else(|| self.released())
    }

    /// Like [`Executor::take_connection`], but an empty slot is not an error.
    pub(crate) async fn try_take_connection(&self) -> Option<PooledConnection> {
        self.conn.lock().await.take()
    }
}
