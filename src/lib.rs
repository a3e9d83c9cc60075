//! XA Unit of Work
//!
//! Coordinates all-or-nothing transactions across several independently
//! failing SQLite databases within one process. Pools hand out connections
//! bound to the caller's transaction, the coordinator prepares and then
//! commits every enlisted resource, and the lifecycle registry brings
//! resources online and shuts them down with their own handshake.

pub mod branch;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod logging;
pub mod move_users;
pub mod pool;
pub mod transaction_aware;
pub mod users;

pub use branch::{Participant, TransactionBranch};
pub use config::{Config, CreatePolicy, PoolConfig, ResourceConfig, StorageOptions};
pub use coordinator::{
    Transaction, TransactionContext, TransactionLog, TransactionManager, TransactionState,
    FINISHED_HISTORY,
};
pub use driver::{ResourceDriver, ResourceFault, ShutdownSignature, SqliteDriver};
pub use error::{TransactionError, TransactionResult};
pub use executor::Executor;
pub use lifecycle::{ResourceRegistry, ShutdownOutcome};
pub use move_users::{create_user, list_users, move_users};
pub use pool::{PoolStats, PooledConnection, ResourcePool};
pub use transaction_aware::TransactionAware;
pub use users::{User, UserRepository};
