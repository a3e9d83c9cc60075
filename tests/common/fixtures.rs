use std::sync::Arc;

use sqlx::Row;
use tempfile::TempDir;

use xa_unit_of_work::users::create_schema;
use xa_unit_of_work::{
    create_user, CreatePolicy, PoolConfig, ResourceConfig, ResourceDriver, ResourcePool,
    ResourceRegistry, SqliteDriver, StorageOptions, TransactionError, TransactionManager,
};

/// Two provisioned databases, `users1` and `users2`, in a private directory.
pub struct TestResources {
    pub dir: TempDir,
    pub registry: ResourceRegistry,
    pub manager: TransactionManager,
    pub users1: ResourcePool,
    pub users2: ResourcePool,
}

/// Pool settings used by most tests: sharing on, local transactions on, no waiting.
pub fn pool_config() -> PoolConfig {
    PoolConfig {
        min_pool_size: 1,
        max_pool_size: 3,
        allow_local_transactions: true,
        share_transaction_connections: true,
        prepared_statement_cache_size: 10,
        test_connections: true,
        acquisition_timeout_ms: 0,
    }
}

pub fn storage(dir: &TempDir, name: &str) -> StorageOptions {
    StorageOptions::new(dir.path().join(format!("{name}.db")), CreatePolicy::Create)
}

pub fn resource(dir: &TempDir, name: &str, pool: PoolConfig) -> ResourceConfig {
    ResourceConfig {
        name: name.to_string(),
        registration_key: format!("db/{name}"),
        pool,
        storage: storage(dir, name),
    }
}

pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

pub async fn provision_pair() -> TestResources {
    provision_pair_with(Arc::new(SqliteDriver::new()), pool_config()).await
}

pub async fn provision_pair_with(driver: Arc<dyn ResourceDriver>, pool: PoolConfig) -> TestResources {
    let dir = temp_dir();
    let registry = ResourceRegistry::new(driver);
    let users1 = registry
        .provision(resource(&dir, "users1", pool.clone()))
        .await
        .expect("Failed to provision users1");
    let users2 = registry
        .provision(resource(&dir, "users2", pool))
        .await
        .expect("Failed to provision users2");
    create_schema(&users1).await.expect("Failed to create users1 schema");
    create_schema(&users2).await.expect("Failed to create users2 schema");

    TestResources {
        dir,
        registry,
        manager: TransactionManager::new(),
        users1,
        users2,
    }
}

/// Commit one user per name on `pool`.
pub async fn insert_users(manager: &TransactionManager, pool: &ResourcePool, names: &[&str]) {
    let ctx = manager.context();
    let pool = pool.clone();
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    ctx.run("insert users", |tx| async move {
        for name in &names {
            create_user(&tx, &pool, name).await?;
        }
        Ok::<_, TransactionError>(())
    })
    .await
    .expect("Failed to insert users");
}

/// Names of the committed users on `pool`, read over a local connection.
pub async fn user_names(pool: &ResourcePool) -> Vec<String> {
    let mut conn = pool.acquire_local().await.expect("Failed to acquire local connection");
    let rows = sqlx::query("SELECT name FROM users ORDER BY id")
        .fetch_all(&mut *conn)
        .await
        .expect("Failed to query users");
    rows.into_iter().map(|row| row.get("name")).collect()
}

/// Ids of the committed users on `pool`.
pub async fn user_ids(pool: &ResourcePool) -> Vec<i64> {
    let mut conn = pool.acquire_local().await.expect("Failed to acquire local connection");
    let rows = sqlx::query("SELECT id FROM users ORDER BY id")
        .fetch_all(&mut *conn)
        .await
        .expect("Failed to query users");
    rows.into_iter().map(|row| row.get("id")).collect()
}

/// Run a statement outside any coordinated transaction.
pub async fn execute_local(pool: &ResourcePool, statement: &str) {
    let mut conn = pool.acquire_local().await.expect("Failed to acquire local connection");
    sqlx::query(statement)
        .execute(&mut *conn)
        .await
        .expect("Failed to execute statement");
}
