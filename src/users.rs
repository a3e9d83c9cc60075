use sqlx::Row;

use crate::{Executor, ResourcePool, TransactionResult};

/// A user record. `id` is assigned by the database that stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
}

pub const CREATE_USERS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    )
"#;

/// Create the `users` table over a local (autocommit) connection.
pub async fn create_schema(pool: &ResourcePool) -> TransactionResult<()> {
    let mut conn = pool.acquire_local().await?;
    sqlx::query(CREATE_USERS_TABLE).execute(&mut *conn).await?;
    pool.release(conn);
    Ok(())
}

/// Users stored on one resource, accessed through a transaction's executor.
#[derive(Debug, Clone)]
pub struct UserRepository {
    executor: Executor,
}

impl UserRepository {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub fn resource(&self) -> &str {
        self.executor.resource()
    }

    /// Insert a user and return it with the id the database assigned.
    pub async fn create(&self, name: &str) -> TransactionResult<User> {
        let mut guard = self.executor.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.executor.released())?;
        let result = sqlx::query("INSERT INTO users (name) VALUES (?)")
            .bind(name)
            .execute(&mut **conn)
            .await?;
        Ok(User {
            id: result.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    /// Every user, fully materialized.
    pub async fn find_all(&self) -> TransactionResult<Vec<User>> {
        let mut guard = self.executor.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.executor.released())?;
        let rows = sqlx::query("SELECT id, name FROM users ORDER BY id")
            .fetch_all(&mut **conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| User {
                id: r.get("id"),
                name: r.get("name"),
            })
            .collect())
    }

    pub async fn find_by_id(&self, id: i64) -> TransactionResult<Option<User>> {
        let mut guard = self.executor.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.executor.released())?;
        let row = sqlx::query("SELECT id, name FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **conn)
            .await?;
        Ok(row.map(|r| User {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }

    /// Delete a user. Returns false if no user had that id.
    pub async fn delete(&self, id: i64) -> TransactionResult<bool> {
        let mut guard = self.executor.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.executor.released())?;
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut **conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> TransactionResult<i64> {
        let mut guard = self.executor.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.executor.released())?;
        let row = sqlx::query("SELECT COUNT(*) as count FROM users")
            .fetch_one(&mut **conn)
            .await?;
        Ok(row.get("count"))
    }
}
