use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::SqliteConnection;

use xa_unit_of_work::{
    Participant, ResourceDriver, ResourceFault, SqliteDriver, StorageOptions, TransactionError,
    TransactionResult,
};

/// A SQLite driver whose shutdown replies and liveness probes can be scripted.
#[derive(Default)]
pub struct ScriptedDriver {
    inner: SqliteDriver,
    // Shutdown replies by database file stem; unscripted names use the real handshake.
    shutdown_replies: Mutex<HashMap<String, Result<(), ResourceFault>>>,
    dead_probes: AtomicUsize,
    stall_connects: AtomicBool,
    open_transaction_on_connect: AtomicBool,
    pub probes: AtomicUsize,
    pub connects: AtomicUsize,
    pub storage_setups: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply_to_shutdown(&self, name: &str, reply: Result<(), ResourceFault>) {
        self.shutdown_replies.lock().insert(name.to_string(), reply);
    }

    /// The next `count` liveness probes report a dead connection.
    pub fn fail_next_probes(&self, count: usize) {
        self.dead_probes.store(count, Ordering::SeqCst);
    }

    /// New connects never finish while set.
    pub fn stall_connects(&self, stall: bool) {
        self.stall_connects.store(stall, Ordering::SeqCst);
    }

    /// New connections come back with a transaction already open, so `BEGIN` fails on them.
    pub fn open_transaction_on_connect(&self, open: bool) {
        self.open_transaction_on_connect.store(open, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceDriver for ScriptedDriver {
    async fn create_storage(&self, storage: &StorageOptions) -> Result<(), sqlx::Error> {
        self.storage_setups.fetch_add(1, Ordering::SeqCst);
        self.inner.create_storage(storage).await
    }

    async fn connect(
        &self,
        storage: &StorageOptions,
        statement_cache_size: usize,
    ) -> Result<SqliteConnection, sqlx::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.stall_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut conn = self.inner.connect(storage, statement_cache_size).await?;
        if self.open_transaction_on_connect.load(Ordering::SeqCst) {
            sqlx::query("BEGIN").execute(&mut conn).await?;
        }
        Ok(conn)
    }

    async fn is_alive(&self, conn: &mut SqliteConnection) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let scripted_dead = self
            .dead_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !scripted_dead && self.inner.is_alive(conn).await
    }

    async fn shutdown(&self, storage: &StorageOptions) -> Result<(), ResourceFault> {
        let name = storage
            .database
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scripted = self.shutdown_replies.lock().get(&name).cloned();
        match scripted {
            Some(reply) => reply,
            None => self.inner.shutdown(storage).await,
        }
    }
}

/// A participant that records the calls it receives and fails where told to.
pub struct ScriptedParticipant {
    name: String,
    fail_prepare: bool,
    fail_commit: bool,
    fail_rollback: bool,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedParticipant {
    pub fn healthy(name: &str) -> Arc<Self> {
        Self::build(name, false, false, false)
    }

    pub fn refusing_prepare(name: &str) -> Arc<Self> {
        Self::build(name, true, false, false)
    }

    pub fn failing_commit(name: &str) -> Arc<Self> {
        Self::build(name, false, true, false)
    }

    pub fn failing_rollback(name: &str) -> Arc<Self> {
        Self::build(name, false, false, true)
    }

    fn build(name: &str, fail_prepare: bool, fail_commit: bool, fail_rollback: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_prepare,
            fail_commit,
            fail_rollback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Participant for ScriptedParticipant {
    fn resource(&self) -> &str {
        &self.name
    }

    async fn prepare(&self) -> TransactionResult<()> {
        self.calls.lock().push("prepare");
        if self.fail_prepare {
            return Err(TransactionError::CommitFailed(format!("{} votes no", self.name)));
        }
        Ok(())
    }

    async fn commit(&self) -> TransactionResult<()> {
        self.calls.lock().push("commit");
        if self.fail_commit {
            return Err(TransactionError::CommitFailed(format!("{} lost its disk", self.name)));
        }
        Ok(())
    }

    async fn rollback(&self) -> TransactionResult<()> {
        self.calls.lock().push("rollback");
        if self.fail_rollback {
            return Err(TransactionError::RollbackFailed(format!("{} lost its log", self.name)));
        }
        Ok(())
    }
}
