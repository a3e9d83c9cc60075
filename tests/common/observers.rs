use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

use xa_unit_of_work::{TransactionAware, TransactionResult};

/// Transaction-aware observer that remembers which outcome it was told about.
pub struct RecordingObserver {
    // Track notifications for verification in tests
    committed: Arc<RwLock<Option<Uuid>>>,
    rolled_back: Arc<RwLock<Option<Uuid>>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            committed: Arc::new(RwLock::new(None)),
            rolled_back: Arc::new(RwLock::new(None)),
        })
    }

    pub fn is_committed(&self) -> bool {
        self.committed.read().is_some()
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.read().is_some()
    }

    pub fn committed_transaction(&self) -> Option<Uuid> {
        *self.committed.read()
    }
}

#[async_trait]
impl TransactionAware for RecordingObserver {
    async fn on_commit(&self, transaction: Uuid) -> TransactionResult<()> {
        *self.committed.write() = Some(transaction);
        Ok(())
    }

    async fn on_rollback(&self, transaction: Uuid) -> TransactionResult<()> {
        *self.rolled_back.write() = Some(transaction);
        Ok(())
    }
}
