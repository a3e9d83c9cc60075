//! Provisioning configuration for resource managers and their pools.
//!
//! Configuration is read from TOML. Every table rejects keys it does not know,
//! so a misspelled pool option fails provisioning instead of being ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{TransactionError, TransactionResult};

/// Top-level configuration: the resource managers to provision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> TransactionResult<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|source| TransactionError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> TransactionResult<Self> {
        let config: Config = toml::from_str(contents)?;
        for resource in &config.resources {
            resource.validate()?;
        }
        Ok(config)
    }

    /// The two-database setup used by the `move-users` binary.
    pub fn demo(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        let pool = PoolConfig {
            min_pool_size: 1,
            max_pool_size: 3,
            allow_local_transactions: true,
            share_transaction_connections: true,
            prepared_statement_cache_size: 10,
            test_connections: true,
            acquisition_timeout_ms: default_acquisition_timeout_ms(),
        };
        let resource = |name: &str| ResourceConfig {
            name: name.to_string(),
            registration_key: format!("db/{name}"),
            pool: pool.clone(),
            storage: StorageOptions {
                database: data_dir.join(format!("{name}.db")),
                create: CreatePolicy::Create,
            },
        };
        Self {
            resources: vec![resource("users1"), resource("users2")],
        }
    }
}

/// One resource manager: its identity, pool settings and connect options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Logical name, e.g. `users1`.
    pub name: String,
    /// Key under which consumers look the pool up.
    pub registration_key: String,
    #[serde(default)]
    pub pool: PoolConfig,
    pub storage: StorageOptions,
}

impl ResourceConfig {
    pub fn validate(&self) -> TransactionResult<()> {
        if self.name.trim().is_empty() {
            return Err(TransactionError::InvalidConfig(
                "resource name must not be empty".to_string(),
            ));
        }
        if self.registration_key.trim().is_empty() {
            return Err(TransactionError::InvalidConfig(format!(
                "resource {} has an empty registration key",
                self.name
            )));
        }
        self.pool.validate(&self.name)
    }
}

/// Pool sizing and connection handling options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Connections opened when the pool is provisioned (default: 0).
    #[serde(default)]
    pub min_pool_size: usize,
    /// Upper bound on connections checked out at once (default: 5).
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Allow autocommit connections outside a coordinated transaction (default: false).
    #[serde(default)]
    pub allow_local_transactions: bool,
    /// Hand the same connection to every acquire within one transaction (default: false).
    #[serde(default)]
    pub share_transaction_connections: bool,
    /// Prepared statements cached per connection (default: 0).
    #[serde(default)]
    pub prepared_statement_cache_size: usize,
    /// Probe idle connections before handing them out (default: false).
    #[serde(default)]
    pub test_connections: bool,
    /// How long acquire waits for a free connection; 0 fails at once (default: 30000).
    #[serde(default = "default_acquisition_timeout_ms")]
    pub acquisition_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 0,
            max_pool_size: default_max_pool_size(),
            allow_local_transactions: false,
            share_transaction_connections: false,
            prepared_statement_cache_size: 0,
            test_connections: false,
            acquisition_timeout_ms: default_acquisition_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self, resource: &str) -> TransactionResult<()> {
        if self.max_pool_size == 0 {
            return Err(TransactionError::InvalidConfig(format!(
                "{resource}: max_pool_size must be at least 1"
            )));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(TransactionError::InvalidConfig(format!(
                "{resource}: min_pool_size {} exceeds max_pool_size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        Ok(())
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_timeout_ms)
    }
}

fn default_max_pool_size() -> usize {
    5
}

fn default_acquisition_timeout_ms() -> u64 {
    30_000
}

/// Connect options for an embedded SQLite resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageOptions {
    /// Database file backing the resource.
    pub database: PathBuf,
    /// Whether provisioning may create the database when it is missing.
    #[serde(default)]
    pub create: CreatePolicy,
}

impl StorageOptions {
    pub fn new(database: impl Into<PathBuf>, create: CreatePolicy) -> Self {
        Self {
            database: database.into(),
            create,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatePolicy {
    Create,
    #[default]
    Never,
}
