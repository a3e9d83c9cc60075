//! Transaction coordination across enlisted resources.
//!
//! A [`TransactionManager`] is created once per process and handed to the
//! code that needs it. Each logical thread of control takes its own
//! [`TransactionContext`], which holds at most one active [`Transaction`].
//! Resources enlist lazily through [`ResourcePool::acquire`].
//!
//! [`ResourcePool::acquire`]: crate::ResourcePool::acquire

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Executor, Participant, TransactionAware, TransactionError, TransactionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    NotStarted,
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Active => "ACTIVE",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// Finished transactions kept in the log after they leave the in-flight set.
pub const FINISHED_HISTORY: usize = 1024;

/// In-memory record of transaction states.
///
/// Every unfinished transaction is tracked until it commits or rolls back.
/// After that only the most recent [`FINISHED_HISTORY`] outcomes are kept.
#[derive(Debug, Default)]
pub struct TransactionLog {
    entries: Mutex<LogEntries>,
}

#[derive(Debug, Default)]
struct LogEntries {
    in_flight: HashMap<Uuid, TransactionState>,
    // Oldest first.
    finished: VecDeque<(Uuid, TransactionState)>,
}

impl TransactionLog {
    fn record(&self, id: Uuid, state: TransactionState) {
        let mut entries = self.entries.lock();
        if !state.is_terminal() {
            entries.in_flight.insert(id, state);
            return;
        }
        entries.in_flight.remove(&id);
        if entries.finished.len() == FINISHED_HISTORY {
            entries.finished.pop_front();
        }
        entries.finished.push_back((id, state));
    }

    /// Latest known state, or `None` once a finished transaction has aged out.
    pub fn state_of(&self, id: Uuid) -> Option<TransactionState> {
        let entries = self.entries.lock();
        entries.in_flight.get(&id).copied().or_else(|| {
            entries
                .finished
                .iter()
                .rev()
                .find(|(finished, _)| *finished == id)
                .map(|(_, state)| *state)
        })
    }

    /// Transactions that have begun but not yet committed or rolled back.
    pub fn in_flight(&self) -> usize {
        self.entries.lock().in_flight.len()
    }

    /// Tracked entries: every in-flight transaction plus the retained history.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        entries.in_flight.len() + entries.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to the process's transaction manager. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug, Default)]
struct ManagerInner {
    log: Arc<TransactionLog>,
    shut_down: AtomicBool,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh context for one logical thread of control.
    pub fn context(&self) -> TransactionContext {
        TransactionContext {
            manager: self.clone(),
            current: Mutex::new(None),
        }
    }

    pub fn log(&self) -> &TransactionLog {
        &self.inner.log
    }

    /// Refuse new transactions from now on.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let in_flight = self.inner.log.in_flight();
        if in_flight > 0 {
            warn!(in_flight, "Transaction manager shut down with transactions in flight");
        }
        info!("Transaction manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn start(&self) -> TransactionResult<Arc<Transaction>> {
        if self.is_shut_down() {
            return Err(TransactionError::ManagerShutdown);
        }
        let tx = Transaction::new(self.inner.log.clone());
        tx.set_state(TransactionState::Active);
        Ok(Arc::new(tx))
    }
}

/// One logical thread of control: at most one active transaction at a time.
pub struct TransactionContext {
    manager: TransactionManager,
    current: Mutex<Option<Arc<Transaction>>>,
}

impl TransactionContext {
    /// Start a transaction. Fails if the previous one has not finished.
    pub fn begin(&self) -> TransactionResult<Arc<Transaction>> {
        let mut current = self.current.lock();
        if let Some(tx) = current.as_ref() {
            if !tx.state().is_terminal() {
                return Err(TransactionError::AlreadyActive(tx.id()));
            }
        }
        let tx = self.manager.start()?;
        debug!(transaction = %tx.id(), "Started transaction");
        *current = Some(tx.clone());
        Ok(tx)
    }

    /// The transaction most recently begun on this context, finished or not.
    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.current.lock().clone()
    }

    pub async fn commit(&self) -> TransactionResult<()> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        tx.commit().await
    }

    pub async fn rollback(&self) -> TransactionResult<()> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        tx.rollback().await
    }

    /// Run `work` in a new transaction.
    ///
    /// Commits when the work succeeds. When it fails, every enlisted resource
    /// is rolled back before the work's own error is returned. If that
    /// rollback fails too, `RollbackFailed` is returned instead, carrying the
    /// work error in its message.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, work: F) -> Result<T, E>
    where
        F: FnOnce(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        let tx = self.begin()?;
        match work(tx.clone()).await {
            Ok(value) => {
                debug!(transaction = %tx.id(), operation, "Committing transaction");
                if let Err(e) = tx.commit().await {
                    error!(transaction = %tx.id(), operation, error = %e, "Commit failed");
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                error!(transaction = %tx.id(), operation, error = %e, "Work failed; rolling back");
                match tx.rollback().await {
                    Ok(()) => Err(e),
                    Err(rollback) => {
                        error!(transaction = %tx.id(), operation, error = %rollback, "Rollback failed");
                        Err(TransactionError::RollbackFailed(format!(
                            "{rollback}; after work error: {e}"
                        ))
                        .into())
                    }
                }
            }
        }
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("current", &self.current().map(|tx| tx.id()))
            .finish()
    }
}

/// A unit of work spanning every resource enlisted in it.
pub struct Transaction {
    id: Uuid,
    state: Mutex<TransactionState>,
    participants: Mutex<Vec<Arc<dyn Participant>>>,
    // Connections handed to every acquire on a sharing pool, by registration key.
    shared: Mutex<HashMap<String, Executor>>,
    observers: RwLock<Vec<Arc<dyn TransactionAware>>>,
    log: Arc<TransactionLog>,
}

impl Transaction {
    fn new(log: Arc<TransactionLog>) -> Self {
        let id = Uuid::new_v4();
        log.record(id, TransactionState::NotStarted);
        Self {
            id,
            state: Mutex::new(TransactionState::NotStarted),
            participants: Mutex::new(Vec::new()),
            shared: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            log,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Names of the enlisted resources, in enlistment order.
    pub fn enlisted(&self) -> Vec<String> {
        self.participants
            .lock()
            .iter()
            .map(|p| p.resource().to_string())
            .collect()
    }

    /// Add a participant to the commit protocol.
    pub fn enlist(&self, participant: Arc<dyn Participant>) -> TransactionResult<()> {
        let state = self.state.lock();
        if *state != TransactionState::Active {
            return Err(self.invalid("enlist", *state));
        }
        self.participants.lock().push(participant);
        Ok(())
    }

    /// Register a component that needs to be notified of the outcome.
    pub fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn ensure_active(&self, operation: &'static str) -> TransactionResult<()> {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(self.invalid(operation, state));
        }
        Ok(())
    }

    pub(crate) fn shared_connection(&self, key: &str) -> Option<Executor> {
        self.shared.lock().get(key).cloned()
    }

    pub(crate) fn share_connection(&self, key: &str, executor: Executor) {
        self.shared.lock().insert(key.to_string(), executor);
    }

    /// Prepare every participant, then commit every participant.
    ///
    /// If any participant refuses to prepare or fails to commit, the others
    /// are rolled back and `CommitFailed` is returned.
    pub async fn commit(&self) -> TransactionResult<()> {
        {
            let mut state = self.state.lock();
            if *state != TransactionState::Active {
                return Err(self.invalid("commit", *state));
            }
            *state = TransactionState::Committing;
        }
        self.log.record(self.id, TransactionState::Committing);
        let participants = self.take_participants();

        for participant in &participants {
            if let Err(e) = participant.prepare().await {
                error!(
                    transaction = %self.id,
                    resource = participant.resource(),
                    error = %e,
                    "Participant refused to prepare; rolling back"
                );
                self.abort(&participants).await;
                return Err(TransactionError::CommitFailed(format!(
                    "{} could not prepare: {e}",
                    participant.resource()
                )));
            }
        }

        let mut committed: Vec<&str> = Vec::with_capacity(participants.len());
        for (index, participant) in participants.iter().enumerate() {
            if let Err(e) = participant.commit().await {
                error!(
                    transaction = %self.id,
                    resource = participant.resource(),
                    error = %e,
                    "Participant failed to commit; rolling back the rest"
                );
                let mut reason = format!("{} failed to commit: {e}", participant.resource());
                if !committed.is_empty() {
                    error!(
                        transaction = %self.id,
                        committed = ?committed,
                        "Resources committed before the failure need manual recovery"
                    );
                    reason.push_str(&format!("; already committed: {}", committed.join(", ")));
                }
                self.abort(&participants[index..]).await;
                return Err(TransactionError::CommitFailed(reason));
            }
            committed.push(participant.resource());
        }

        self.set_state(TransactionState::Committed);
        debug!(transaction = %self.id, resources = committed.len(), "Transaction committed");

        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            observer.on_commit(self.id).await?;
        }
        Ok(())
    }

    /// Undo the work on every participant. A second call is a no-op.
    pub async fn rollback(&self) -> TransactionResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                TransactionState::RolledBack => {
                    debug!(transaction = %self.id, "Transaction already rolled back");
                    return Ok(());
                }
                TransactionState::Active => *state = TransactionState::RollingBack,
                other => return Err(self.invalid("rollback", other)),
            }
        }
        self.log.record(self.id, TransactionState::RollingBack);
        let participants = self.take_participants();
        debug!(transaction = %self.id, resources = participants.len(), "Rolling back transaction");

        let failures = self.roll_back_each(&participants).await;
        self.set_state(TransactionState::RolledBack);
        if !failures.is_empty() {
            return Err(TransactionError::RollbackFailed(failures.join("; ")));
        }

        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            observer.on_rollback(self.id).await?;
        }
        Ok(())
    }

    // Rollback after a failed commit. The commit error is what the caller sees.
    async fn abort(&self, participants: &[Arc<dyn Participant>]) {
        self.set_state(TransactionState::RollingBack);
        let failures = self.roll_back_each(participants).await;
        self.set_state(TransactionState::RolledBack);
        for failure in &failures {
            error!(transaction = %self.id, error = %failure, "Rollback after failed commit also failed");
        }

        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            if let Err(e) = observer.on_rollback(self.id).await {
                warn!(transaction = %self.id, error = %e, "Rollback observer failed");
            }
        }
    }

    async fn roll_back_each(&self, participants: &[Arc<dyn Participant>]) -> Vec<String> {
        let mut failures = Vec::new();
        for participant in participants {
            if let Err(e) = participant.rollback().await {
                error!(
                    transaction = %self.id,
                    resource = participant.resource(),
                    error = %e,
                    "Participant failed to roll back"
                );
                failures.push(format!("{}: {e}", participant.resource()));
            }
        }
        failures
    }

    fn take_participants(&self) -> Vec<Arc<dyn Participant>> {
        self.shared.lock().clear();
        std::mem::take(&mut *self.participants.lock())
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
        self.log.record(self.id, state);
    }

    fn invalid(&self, operation: &'static str, state: TransactionState) -> TransactionError {
        TransactionError::InvalidState {
            id: self.id,
            operation,
            state,
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("enlisted", &self.enlisted())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state.is_terminal() || state == TransactionState::NotStarted {
            return;
        }
        let enlisted = self.participants.get_mut().len();
        warn!(
            transaction = %self.id,
            %state,
            enlisted,
            "Transaction dropped before completion; its connections are discarded"
        );
        self.log.record(self.id, TransactionState::RolledBack);
    }
}
