use tracing::{info, trace};

use crate::users::{User, UserRepository};
use crate::{ResourcePool, Transaction, TransactionResult};

/// Persist one new user on `pool` within `tx`.
pub async fn create_user(tx: &Transaction, pool: &ResourcePool, name: &str) -> TransactionResult<User> {
    let users = UserRepository::new(pool.acquire(tx).await?);
    let user = users.create(name).await?;
    info!(resource = %pool.name(), id = user.id, "Persisted new user");
    Ok(user)
}

/// Move every user from `from` to `to` within `tx`.
///
/// Each user is re-created on `to`, where it gets a new id, and then deleted
/// from `from`. Returns the users as created on `to`. Nothing is committed
/// here; atomicity comes from the caller's transaction.
pub async fn move_users(
    tx: &Transaction,
    from: &ResourcePool,
    to: &ResourcePool,
) -> TransactionResult<Vec<User>> {
    let source = UserRepository::new(from.acquire(tx).await?);
    let target = UserRepository::new(to.acquire(tx).await?);

    info!(resource = %from.name(), "Querying for users");
    let users = source.find_all().await?;

    info!(from = %from.name(), to = %to.name(), count = users.len(), "Moving users");
    let mut moved = Vec::with_capacity(users.len());
    for user in users {
        let copy = target.create(&user.name).await?;
        source.delete(user.id).await?;
        trace!(old_id = user.id, new_id = copy.id, "Moved user");
        moved.push(copy);
    }
    Ok(moved)
}

/// Every user on `pool`, read within `tx`.
pub async fn list_users(tx: &Transaction, pool: &ResourcePool) -> TransactionResult<Vec<User>> {
    let users = UserRepository::new(pool.acquire(tx).await?).find_all().await?;
    for user in &users {
        info!(resource = %pool.name(), "{}: {}", user.id, user.name);
    }
    Ok(users)
}
