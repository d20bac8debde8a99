//! Per-user row locks.
//!
//! The compliance tables have no user row that every writer touches, so
//! transactions that must serialize per user (destruction, hold placement,
//! protected-membership, key issuance) take an explicit exclusive lock on the
//! user id, the equivalent of `SELECT ... FROM users WHERE user_id = $1
//! FOR UPDATE`. The lock lives in the transaction and is released after
//! commit or rollback.

use crate::core::{DbError, Result, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

/// Idle entries are swept once the map grows past this size.
const SWEEP_THRESHOLD: usize = 1024;

pub type UserLockGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the exclusive lock on `user_id`.
    pub async fn acquire(&self, user_id: UserId, timeout: Duration) -> Result<UserLockGuard> {
        let lock = {
            let mut locks = self.locks.lock()?;
            if locks.len() > SWEEP_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(user_id).or_default())
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(user_id = %user_id, timeout_ms = timeout.as_millis() as u64, "user lock wait timed out");
                Err(DbError::LockTimeout(format!(
                    "user {} is locked by another transaction",
                    user_id
                )))
            }
        }
    }

    pub fn tracked_users(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}
