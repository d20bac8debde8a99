//! Guarded destruction of a user's key material.
//!
//! One call is one transaction:
//!
//! ```text
//! lock user ─> snapshot ─> EVALUATE ─┬─> BLOCK: audit(BLOCKED, reason, 0)
//!                                    └─> ALLOW: destroy live keys,
//!                                               audit(ALLOWED, reason, n)
//!                                  ─> commit
//! ```
//!
//! The guards and the writes share the snapshot taken after the user lock
//! is held. Hold placement and protected membership take the same lock, so
//! anything they committed before the call started blocks it, and nothing
//! they do can slip in between the check and the destruction.

use super::{AuditLog, BackupProtectionIndex, HoldRegistry};
use crate::core::{DbError, DeletionOutcome, KeyRecord, Result, User, UserId};
use crate::facade::Database;
use crate::transaction::Transaction;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const REASON_ACTIVE_HOLD: &str = "active legal hold";
pub const REASON_PROTECTED_BACKUP: &str = "referenced by protected backup";
pub const REASON_ALLOWED: &str = "no active holds or protections";

/// Outcome of a destruction request. A blocked request is a successful
/// call with `allowed == false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestructionResult {
    pub user_id: UserId,
    pub allowed: bool,
    pub reason: String,
    pub keys_destroyed: u64,
}

enum Decision {
    Allow,
    Block(&'static str),
}

#[derive(Clone)]
pub struct GuardedDestructionEngine {
    db: Arc<Database>,
    holds: HoldRegistry,
    backups: BackupProtectionIndex,
}

impl GuardedDestructionEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            holds: HoldRegistry::new(Arc::clone(&db)),
            backups: BackupProtectionIndex::new(Arc::clone(&db)),
            db,
        }
    }

    /// Destroy every live key of `user_id` unless a guard forbids it, and
    /// record the decision either way.
    ///
    /// # Errors
    /// - `NotFound` if the user does not exist (nothing is written)
    /// - any storage fault, including the statement timeout; the
    ///   transaction is rolled back and the call can be retried
    pub async fn destroy_keys(&self, user_id: UserId) -> Result<DestructionResult> {
        let mut tx = self.db.begin_locked(vec![user_id]).await?;

        let decided = match self.db.statement_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.decide(&mut tx, user_id))
                .await
                .unwrap_or_else(|_| {
                    Err(DbError::storage(format!(
                        "destruction for user {} exceeded the statement timeout of {:?}",
                        user_id, limit
                    )))
                }),
            None => self.decide(&mut tx, user_id).await,
        };

        let result = match decided {
            Ok(result) => result,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };
        tx.commit().await?;

        info!(
            user_id = %user_id,
            allowed = result.allowed,
            reason = %result.reason,
            keys_destroyed = result.keys_destroyed,
            "destruction decided"
        );
        Ok(result)
    }

    async fn decide(&self, tx: &mut Transaction, user_id: UserId) -> Result<DestructionResult> {
        if tx.get::<User>(&user_id).await?.is_none() {
            return Err(DbError::not_found(format!("user {}", user_id)));
        }

        let (outcome, reason, keys_destroyed) = match self.evaluate(tx, user_id).await? {
            Decision::Block(reason) => (DeletionOutcome::Blocked, reason, 0),
            Decision::Allow => {
                let destroyed = destroy_live_keys(tx, user_id).await?;
                (DeletionOutcome::Allowed, REASON_ALLOWED, destroyed)
            }
        };
        AuditLog::record_deletion_attempt(tx, user_id, outcome, reason, keys_destroyed).await?;

        Ok(DestructionResult {
            user_id,
            allowed: outcome == DeletionOutcome::Allowed,
            reason: reason.to_string(),
            keys_destroyed,
        })
    }

    /// Guards in fixed order; the first that matches decides.
    async fn evaluate(&self, tx: &Transaction, user_id: UserId) -> Result<Decision> {
        if self.holds.has_active_hold(tx, user_id).await? {
            return Ok(Decision::Block(REASON_ACTIVE_HOLD));
        }
        if self.backups.is_protected(tx, user_id).await? {
            return Ok(Decision::Block(REASON_PROTECTED_BACKUP));
        }
        Ok(Decision::Allow)
    }
}

async fn destroy_live_keys(tx: &mut Transaction, user_id: UserId) -> Result<u64> {
    let live = tx
        .scan_filter::<KeyRecord, _>(|key| key.user_id == user_id && key.is_live())
        .await?;
    let now = Utc::now();
    let mut destroyed = 0;
    for key in live {
        if tx.update(key.destroyed(now)).await?.is_some() {
            destroyed += 1;
        }
    }
    Ok(destroyed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::UserDirectory;
    use crate::config::StoreConfig;
    use crate::core::{DeletionAudit, ErrorKind};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stalled_audit_write_rolls_back_destruction() {
        let db = Database::open(StoreConfig::new().statement_timeout(Duration::from_millis(100)))
            .await
            .unwrap();
        let user = UserDirectory::new(Arc::clone(&db))
            .create_user("Grace Hopper", "grace@example.com", Some("555-0100"))
            .await
            .unwrap();
        let engine = GuardedDestructionEngine::new(Arc::clone(&db));

        // Key updates go through; the audit insert waits on this guard.
        let audit_guard = db.storage().table::<DeletionAudit>().write().await;
        let err = engine.destroy_keys(user.user_id).await.unwrap_err();
        drop(audit_guard);

        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.is_retryable());

        let keys = db
            .read::<KeyRecord, _>(|key| key.user_id == user.user_id)
            .await;
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|key| key.is_live() && key.key_material.is_some()));
        assert!(db.read::<DeletionAudit, _>(|_| true).await.is_empty());

        let retried = engine.destroy_keys(user.user_id).await.unwrap();
        assert!(retried.allowed);
        assert_eq!(retried.keys_destroyed, 3);
        assert_eq!(db.read::<DeletionAudit, _>(|_| true).await.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_decision_writes_only_the_audit_row() {
        let db = Database::in_memory();
        let user = UserDirectory::new(Arc::clone(&db))
            .create_user("Ada Lovelace", "ada@example.com", None)
            .await
            .unwrap();
        HoldRegistry::new(Arc::clone(&db))
            .place_hold(user.user_id, "litigation")
            .await
            .unwrap();

        let result = GuardedDestructionEngine::new(Arc::clone(&db))
            .destroy_keys(user.user_id)
            .await
            .unwrap();
        assert_eq!(result.reason, REASON_ACTIVE_HOLD);

        let audit = db.read::<DeletionAudit, _>(|_| true).await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, DeletionOutcome::Blocked);
        assert_eq!(audit[0].keys_affected, 0);
    }
}
