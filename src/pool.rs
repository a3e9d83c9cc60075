use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, info, trace, warn};

use crate::branch::TransactionBranch;
use crate::config::{PoolConfig, StorageOptions};
use crate::driver::ResourceDriver;
use crate::{Executor, Transaction, TransactionError, TransactionResult};

/// A bounded pool of connections to one resource manager.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    registration_key: String,
    config: PoolConfig,
    storage: StorageOptions,
    driver: Arc<dyn ResourceDriver>,
    // One permit per connection that may be checked out at once.
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

struct PoolState {
    idle: VecDeque<SqliteConnection>,
    // Live physical connections, idle or checked out.
    total: usize,
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub checked_out: usize,
}

impl ResourcePool {
    /// Create an empty pool. Connections are opened on demand or by [`ResourcePool::fill`].
    pub fn new(
        name: impl Into<String>,
        registration_key: impl Into<String>,
        config: PoolConfig,
        storage: StorageOptions,
        driver: Arc<dyn ResourceDriver>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_pool_size));
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                registration_key: registration_key.into(),
                config,
                storage,
                driver,
                permits,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registration_key(&self) -> &str {
        &self.inner.registration_key
    }

    pub fn storage(&self) -> &StorageOptions {
        &self.inner.storage
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let checked_out = self
            .inner
            .config
            .max_pool_size
            .saturating_sub(self.inner.permits.available_permits());
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            checked_out: if self.is_closed() { 0 } else { checked_out },
        }
    }

    /// Open connections until the pool holds `min_pool_size` of them.
    pub async fn fill(&self) -> TransactionResult<()> {
        loop {
            let slot = {
                let mut state = self.inner.state.lock();
                if state.total >= self.inner.config.min_pool_size {
                    return Ok(());
                }
                state.total += 1;
                CountedSlot::adopt(&self.inner)
            };
            let conn = self.connect(slot).await?;
            self.inner.state.lock().idle.push_back(conn);
        }
    }

    /// Get the connection bound to `tx` on this resource, enlisting the resource on first use.
    pub async fn acquire(&self, tx: &Transaction) -> TransactionResult<Executor> {
        tx.ensure_active("acquire")?;

        let share = self.inner.config.share_transaction_connections;
        if share {
            if let Some(executor) = tx.shared_connection(self.registration_key()) {
                trace!(resource = %self.name(), transaction = %tx.id(), "Reusing shared connection");
                return Ok(executor);
            }
        }

        let mut conn = self.checkout().await?;
        conn.begin()
            .await
            .map_err(|source| TransactionError::ResourceUnavailable {
                resource: self.name().to_string(),
                source,
            })?;

        let executor = Executor::new(self.name(), conn);
        tx.enlist(Arc::new(TransactionBranch::new(self.name(), executor.clone())))?;
        if share {
            tx.share_connection(self.registration_key(), executor.clone());
        }
        debug!(resource = %self.name(), transaction = %tx.id(), "Enlisted resource");
        Ok(executor)
    }

    /// Check out an autocommit connection that is not part of any coordinated transaction.
    pub async fn acquire_local(&self) -> TransactionResult<PooledConnection> {
        if !self.inner.config.allow_local_transactions {
            return Err(TransactionError::LocalTransactionsDisallowed(
                self.name().to_string(),
            ));
        }
        self.checkout().await
    }

    /// Return a connection to the idle set.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close every idle connection and refuse further checkouts.
    ///
    /// Connections still checked out are closed as they are released.
    pub async fn shutdown(&self) {
        let drained: Vec<SqliteConnection> = {
            let mut state = self.inner.state.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        self.inner.permits.close();

        let count = drained.len();
        for conn in drained {
            if let Err(e) = conn.close().await {
                warn!(resource = %self.name(), error = %e, "Failed to close pooled connection");
            }
        }
        info!(resource = %self.name(), closed = count, "Pool shut down");
    }

    async fn checkout(&self) -> TransactionResult<PooledConnection> {
        if self.is_closed() {
            return Err(TransactionError::PoolClosed(self.name().to_string()));
        }
        let permit = self.reserve_permit().await?;

        loop {
            let idle = self.inner.state.lock().idle.pop_front();
            let Some(mut conn) = idle else { break };
            // The popped connection is still counted; uncount it if the probe is cancelled.
            let slot = CountedSlot::adopt(&self.inner);
            if self.inner.config.test_connections && !self.inner.driver.is_alive(&mut conn).await {
                warn!(resource = %self.name(), "Discarding connection that failed its liveness probe");
                drop(slot);
                if let Err(e) = conn.close().await {
                    trace!(resource = %self.name(), error = %e, "Dead connection did not close cleanly");
                }
                continue;
            }
            slot.keep();
            trace!(resource = %self.name(), "Reusing idle connection");
            return Ok(PooledConnection::new(conn, permit, self.inner.clone()));
        }

        // Holding a permit with no idle connection keeps `total` within `max_pool_size`.
        let slot = CountedSlot::reserve(&self.inner);
        let conn = self.connect(slot).await?;
        Ok(PooledConnection::new(conn, permit, self.inner.clone()))
    }

    async fn reserve_permit(&self) -> TransactionResult<OwnedSemaphorePermit> {
        let permits = self.inner.permits.clone();
        let timeout = self.inner.config.acquisition_timeout();
        let exhausted = || TransactionError::PoolExhausted {
            resource: self.name().to_string(),
            max: self.inner.config.max_pool_size,
        };

        if timeout.is_zero() {
            return permits.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => TransactionError::PoolClosed(self.name().to_string()),
                TryAcquireError::NoPermits => exhausted(),
            });
        }
        match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(TransactionError::PoolClosed(self.name().to_string())),
            Err(_) => Err(exhausted()),
        }
    }

    async fn connect(&self, slot: CountedSlot<'_>) -> TransactionResult<SqliteConnection> {
        trace!(resource = %self.name(), "Opening connection");
        match self
            .inner
            .driver
            .connect(
                &self.inner.storage,
                self.inner.config.prepared_statement_cache_size,
            )
            .await
        {
            Ok(conn) => {
                slot.keep();
                Ok(conn)
            }
            Err(source) => {
                drop(slot);
                error!(resource = %self.name(), error = %source, "Failed to connect");
                Err(TransactionError::ResourceUnavailable {
                    resource: self.name().to_string(),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("registration_key", &self.inner.registration_key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One connection counted in `total` that is not yet idle or checked out.
///
/// Dropping the slot uncounts it, so a checkout that fails or is cancelled
/// mid-connect leaves the count exact.
struct CountedSlot<'a> {
    pool: &'a PoolInner,
    kept: bool,
}

impl<'a> CountedSlot<'a> {
    fn reserve(pool: &'a PoolInner) -> Self {
        pool.state.lock().total += 1;
        Self::adopt(pool)
    }

    // For a connection already counted by the caller.
    fn adopt(pool: &'a PoolInner) -> Self {
        Self { pool, kept: false }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for CountedSlot<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.state.lock().total -= 1;
        }
    }
}

impl PoolInner {
    fn give_back(&self, conn: SqliteConnection, discard: bool) {
        let mut state = self.state.lock();
        if discard || self.closed.load(Ordering::Acquire) {
            state.total -= 1;
            trace!(resource = %self.name, "Discarding connection");
            drop(conn);
        } else {
            trace!(resource = %self.name, "Returning connection to pool");
            state.idle.push_back(conn);
        }
    }
}

/// A connection checked out of a [`ResourcePool`].
///
/// Dropping it hands the connection back. A connection still inside a
/// transaction is discarded instead so no pending work leaks to the next user.
pub struct PooledConnection {
    conn: Option<SqliteConnection>,
    in_transaction: bool,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

const EXPECT_CONN: &str = "BUG: connection taken before PooledConnection was dropped";

impl PooledConnection {
    fn new(conn: SqliteConnection, permit: OwnedSemaphorePermit, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            in_transaction: false,
            broken: false,
            pool,
            _permit: permit,
        }
    }

    pub fn resource(&self) -> &str {
        &self.pool.name
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Do not return this connection to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub(crate) async fn begin(&mut self) -> Result<(), sqlx::Error> {
        if let Err(e) = sqlx::query("BEGIN").execute(&mut **self).await {
            self.broken = true;
            return Err(e);
        }
        self.in_transaction = true;
        Ok(())
    }

    pub(crate) async fn finish(&mut self, statement: &'static str) -> Result<(), sqlx::Error> {
        match sqlx::query(statement).execute(&mut **self).await {
            Ok(_) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(EXPECT_CONN)
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(EXPECT_CONN)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("resource", &self.pool.name)
            .field("in_transaction", &self.in_transaction)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .give_back(conn, self.in_transaction || self.broken);
        }
    }
}
