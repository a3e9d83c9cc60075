//! Bringing resource managers online and taking them offline.
//!
//! Provisioning and decommissioning run during process startup and shutdown,
//! never concurrently with active transactions.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::config::ResourceConfig;
use crate::driver::{ResourceDriver, ResourceFault, ShutdownSignature, SqliteDriver};
use crate::{ResourcePool, TransactionError, TransactionResult};

/// How a resource answered its shutdown request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The resource reported the expected shutdown signature.
    Success,
    /// The resource was not provisioned (or was already decommissioned).
    AlreadyShutdown,
    /// Anything else. The resource will have to recover on its next start.
    Failure {
        code: i32,
        state: String,
        reason: String,
    },
}

impl ShutdownOutcome {
    /// Interpret a shutdown reply against the signature the resource uses for success.
    pub fn classify(signature: ShutdownSignature, reply: Result<(), ResourceFault>) -> Self {
        match reply {
            Err(fault) if signature.matches(&fault) => Self::Success,
            Err(fault) => Self::Failure {
                code: fault.code,
                state: fault.state,
                reason: fault.message,
            },
            Ok(()) => Self::Failure {
                code: 0,
                state: String::new(),
                reason: "resource returned without confirming shutdown".to_string(),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Turn a `Failure` into `ShutdownReportedFailure` for callers that want a `Result`.
    pub fn into_result(self, resource: &str) -> TransactionResult<()> {
        match self {
            Self::Success | Self::AlreadyShutdown => Ok(()),
            Self::Failure {
                code,
                state,
                reason,
            } => Err(TransactionError::ShutdownReportedFailure {
                resource: resource.to_string(),
                code,
                state,
                reason,
            }),
        }
    }
}

/// Registry of provisioned resources, looked up by registration key.
pub struct ResourceRegistry {
    driver: Arc<dyn ResourceDriver>,
    // Provisioning order; decommission_all follows it.
    pools: Mutex<Vec<ResourcePool>>,
    // Names whose storage setup has already run.
    initialized: Mutex<HashSet<String>>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SqliteDriver::new()))
    }
}

impl ResourceRegistry {
    pub fn new(driver: Arc<dyn ResourceDriver>) -> Self {
        Self {
            driver,
            pools: Mutex::new(Vec::new()),
            initialized: Mutex::new(HashSet::new()),
        }
    }

    /// Create, warm up and register the pool described by `config`.
    pub async fn provision(&self, config: ResourceConfig) -> TransactionResult<ResourcePool> {
        config.validate()?;
        self.ensure_unique(&config)?;

        let first_setup = !self.initialized.lock().contains(&config.name);
        if first_setup {
            trace!(resource = %config.name, "Running storage setup");
            self.driver
                .create_storage(&config.storage)
                .await
                .map_err(|source| TransactionError::ResourceUnavailable {
                    resource: config.name.clone(),
                    source,
                })?;
            self.initialized.lock().insert(config.name.clone());
        }

        let pool = ResourcePool::new(
            config.name,
            config.registration_key,
            config.pool,
            config.storage,
            self.driver.clone(),
        );
        if let Err(e) = pool.fill().await {
            pool.shutdown().await;
            return Err(e);
        }

        let mut pools = self.pools.lock();
        if pools
            .iter()
            .any(|p| p.registration_key() == pool.registration_key())
        {
            return Err(TransactionError::DuplicateResource(
                pool.registration_key().to_string(),
            ));
        }
        pools.push(pool.clone());
        info!(
            resource = %pool.name(),
            key = %pool.registration_key(),
            connections = pool.stats().total,
            "Provisioned resource"
        );
        Ok(pool)
    }

    /// Provision every resource in order, stopping at the first failure.
    pub async fn provision_all(
        &self,
        configs: impl IntoIterator<Item = ResourceConfig>,
    ) -> TransactionResult<Vec<ResourcePool>> {
        let mut pools = Vec::new();
        for config in configs {
            pools.push(self.provision(config).await?);
        }
        Ok(pools)
    }

    pub fn lookup(&self, registration_key: &str) -> Option<ResourcePool> {
        self.pools
            .lock()
            .iter()
            .find(|pool| pool.registration_key() == registration_key)
            .cloned()
    }

    /// Every provisioned pool, in provisioning order.
    pub fn pools(&self) -> Vec<ResourcePool> {
        self.pools.lock().clone()
    }

    /// Close the pool for `name` and send the resource its shutdown request.
    ///
    /// Never fails: an unexpected reply is logged and returned as `Failure`.
    pub async fn decommission(&self, name: &str) -> ShutdownOutcome {
        let pool = {
            let mut pools = self.pools.lock();
            let index = pools.iter().position(|pool| pool.name() == name);
            index.map(|index| pools.remove(index))
        };
        let Some(pool) = pool else {
            debug!(resource = name, "Resource is not provisioned; nothing to shut down");
            return ShutdownOutcome::AlreadyShutdown;
        };

        pool.shutdown().await;
        trace!(resource = name, "Sending shutdown request");
        let reply = self.driver.shutdown(pool.storage()).await;
        let outcome = ShutdownOutcome::classify(self.driver.shutdown_signature(), reply);
        match &outcome {
            ShutdownOutcome::Failure {
                code,
                state,
                reason,
            } => error!(
                resource = name,
                code,
                state = %state,
                reason = %reason,
                "Failed to shut down resource; it will recover on next start"
            ),
            _ => info!(resource = name, "Resource shut down"),
        }
        outcome
    }

    /// Decommission every provisioned resource in provisioning order.
    /// One failure does not stop the rest.
    pub async fn decommission_all(&self) -> Vec<(String, ShutdownOutcome)> {
        let names: Vec<String> = self
            .pools
            .lock()
            .iter()
            .map(|pool| pool.name().to_string())
            .collect();
        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let outcome = self.decommission(&name).await;
            outcomes.push((name, outcome));
        }
        outcomes
    }

    fn ensure_unique(&self, config: &ResourceConfig) -> TransactionResult<()> {
        let pools = self.pools.lock();
        if pools
            .iter()
            .any(|pool| pool.registration_key() == config.registration_key)
        {
            return Err(TransactionError::DuplicateResource(
                config.registration_key.clone(),
            ));
        }
        if pools.iter().any(|pool| pool.name() == config.name) {
            return Err(TransactionError::DuplicateResource(config.name.clone()));
        }
        Ok(())
    }
}
