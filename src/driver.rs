//! Resource-specific connect and shutdown handshakes.
//!
//! The pool and the lifecycle manager only talk to a resource through a
//! [`ResourceDriver`]. [`SqliteDriver`] is the embedded implementation used in
//! production; tests wrap it to script faults.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tracing::trace;

use crate::config::{CreatePolicy, StorageOptions};

/// A fault reported by a resource manager: numeric code, state string, message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFault {
    pub code: i32,
    pub state: String,
    pub message: String,
}

impl ResourceFault {
    pub fn new(code: i32, state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            state: state.into(),
            message: message.into(),
        }
    }

    /// The fault an embedded database raises once it has shut down cleanly.
    pub fn shutdown_complete(database: &Path) -> Self {
        let signature = ShutdownSignature::EMBEDDED_DATABASE;
        Self::new(
            signature.code,
            signature.state,
            format!("Database '{}' shutdown.", database.display()),
        )
    }

    fn from_sqlx(err: &sqlx::Error, state: &str) -> Self {
        let code = match err {
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse().ok())
                .unwrap_or(-1),
            _ => -1,
        };
        Self::new(code, state, err.to_string())
    }
}

/// The (code, state) pair a resource uses to report a successful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSignature {
    pub code: i32,
    pub state: &'static str,
}

impl ShutdownSignature {
    /// Single-database shutdown of an embedded database.
    pub const EMBEDDED_DATABASE: ShutdownSignature = ShutdownSignature {
        code: 45000,
        state: "08006",
    };

    pub fn matches(&self, fault: &ResourceFault) -> bool {
        fault.code == self.code && fault.state == self.state
    }
}

/// SQL state reported when a connection cannot be established.
const STATE_CONNECTION_FAILED: &str = "08001";
/// SQL state reported for any other failure during shutdown.
const STATE_SYSTEM_ERROR: &str = "58000";

/// Connect, probe and shut down one kind of resource manager.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Create the storage location if the options allow it. Called once per resource name.
    async fn create_storage(&self, storage: &StorageOptions) -> Result<(), sqlx::Error>;

    /// Open a new physical connection.
    async fn connect(
        &self,
        storage: &StorageOptions,
        statement_cache_size: usize,
    ) -> Result<SqliteConnection, sqlx::Error>;

    /// Liveness probe run on idle connections before they are handed out.
    async fn is_alive(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }

    /// Send the dedicated shutdown request.
    ///
    /// A clean shutdown is reported as an error carrying
    /// [`ResourceDriver::shutdown_signature`]; callers must classify the reply.
    async fn shutdown(&self, storage: &StorageOptions) -> Result<(), ResourceFault>;

    fn shutdown_signature(&self) -> ShutdownSignature {
        ShutdownSignature::EMBEDDED_DATABASE
    }
}

/// Driver for SQLite database files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    fn options(storage: &StorageOptions) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&storage.database)
            .create_if_missing(false)
            .foreign_keys(true)
    }
}

#[async_trait]
impl ResourceDriver for SqliteDriver {
    async fn create_storage(&self, storage: &StorageOptions) -> Result<(), sqlx::Error> {
        if storage.create != CreatePolicy::Create {
            return Ok(());
        }
        if let Some(parent) = storage.database.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        trace!(database = %storage.database.display(), "Creating database if absent");
        let conn =
            SqliteConnection::connect_with(&Self::options(storage).create_if_missing(true)).await?;
        conn.close().await
    }

    async fn connect(
        &self,
        storage: &StorageOptions,
        statement_cache_size: usize,
    ) -> Result<SqliteConnection, sqlx::Error> {
        // sqlx always keeps at least one cached statement per connection.
        let options = Self::options(storage).statement_cache_capacity(statement_cache_size.max(1));
        SqliteConnection::connect_with(&options).await
    }

    async fn shutdown(&self, storage: &StorageOptions) -> Result<(), ResourceFault> {
        let mut conn = SqliteConnection::connect_with(&Self::options(storage))
            .await
            .map_err(|e| ResourceFault::from_sqlx(&e, STATE_CONNECTION_FAILED))?;

        // Fold any write-ahead log back into the main file so the next start has nothing to replay.
        for pragma in ["PRAGMA wal_checkpoint(TRUNCATE)", "PRAGMA optimize"] {
            sqlx::query(pragma)
                .execute(&mut conn)
                .await
                .map_err(|e| ResourceFault::from_sqlx(&e, STATE_SYSTEM_ERROR))?;
        }
        conn.close()
            .await
            .map_err(|e| ResourceFault::from_sqlx(&e, STATE_SYSTEM_ERROR))?;

        Err(ResourceFault::shutdown_complete(&storage.database))
    }
}
