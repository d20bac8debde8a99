// ============================================================================
// Compliance Components
// ============================================================================
//
// Hold Registry, Backup Protection Index, Compliance Audit Log and User
// Directory are thin typed views over the store. The Guarded Destruction
// Engine composes their in-transaction predicates into one atomic decision.
//
// ============================================================================

pub mod audit;
pub mod backups;
pub mod engine;
pub mod holds;
pub mod users;

pub use audit::AuditLog;
pub use backups::{BackupProtectionIndex, UserBackup};
pub use engine::{DestructionResult, GuardedDestructionEngine};
pub use holds::HoldRegistry;
pub use users::UserDirectory;

use crate::core::{DbError, Result, Timestamp, User, UserId};
use crate::transaction::Transaction;

/// Listing limit used when the caller gives none.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Largest page any listing returns.
pub const MAX_LIST_LIMIT: usize = 500;

/// Clamp a caller-supplied limit into `[1, MAX_LIST_LIMIT]`.
pub fn clamp_limit(limit: Option<i64>) -> usize {
    match limit {
        None => DEFAULT_LIST_LIMIT,
        Some(limit) => limit.clamp(1, MAX_LIST_LIMIT as i64) as usize,
    }
}

/// Newest first; ties broken by the surrogate id, also newest first.
fn newest_first<T, K: Ord>(rows: &mut [T], key: impl Fn(&T) -> (Timestamp, K)) {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
}

/// Fail with `NotFound` unless `user_id` is visible to `tx`.
async fn require_user(tx: &Transaction, user_id: UserId) -> Result<User> {
    tx.get::<User>(&user_id)
        .await?
        .ok_or_else(|| DbError::not_found(format!("user {}", user_id)))
}

/// Roll `tx` back and return `err`.
async fn abort<T>(tx: Transaction, err: DbError) -> Result<T> {
    tx.rollback().await?;
    Err(err)
}
