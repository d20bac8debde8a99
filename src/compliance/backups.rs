use super::{abort, newest_first, require_user, AuditLog};
use crate::core::{
    BackupId, BackupMembership, BackupRun, BackupType, DbError, Result, Timestamp, UserId,
};
use crate::facade::Database;
use crate::storage::Sequence;
use crate::transaction::Transaction;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Reason stored on backups protected when they are created.
pub const PROTECTED_AT_CREATION: &str = "protected at creation";

/// A backup as seen from one of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserBackup {
    pub backup_id: BackupId,
    pub user_id: UserId,
    pub backup_type: BackupType,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub protected_by_hold: bool,
    pub protected_reason: Option<String>,
    pub protected_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// Which users each backup captured, and which backups are protected.
#[derive(Clone)]
pub struct BackupProtectionIndex {
    db: Arc<Database>,
}

impl BackupProtectionIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a backup run. `backup_type` is parsed case-insensitively.
    pub async fn create_backup(&self, backup_type: &str, protected_by_hold: bool) -> Result<BackupRun> {
        let backup_type: BackupType = backup_type.parse()?;
        let now = Utc::now();

        let mut tx = self.db.begin().await?;
        let backup = BackupRun {
            backup_id: BackupId(tx.next_id(Sequence::Backup)?),
            backup_type,
            started_at: now,
            ended_at: now,
            protected_by_hold,
            protected_reason: protected_by_hold.then(|| PROTECTED_AT_CREATION.to_string()),
            protected_at: protected_by_hold.then_some(now),
            created_at: now,
        };
        tx.insert(backup.clone()).await?;
        tx.commit().await?;

        info!(backup_id = %backup.backup_id, backup_type = %backup_type, protected_by_hold, "backup recorded");
        Ok(backup)
    }

    /// Record that `backup_id` captured `user_id`, or refresh `last_seen` if
    /// it already did. A user newly captured by a protected backup gets a
    /// protection audit row in the same transaction.
    pub async fn add_member(&self, backup_id: BackupId, user_id: UserId) -> Result<BackupMembership> {
        let mut tx = self.db.begin_locked(vec![user_id]).await?;
        let Some(backup) = tx.get::<BackupRun>(&backup_id).await? else {
            return abort(tx, DbError::not_found(format!("backup {}", backup_id))).await;
        };
        if let Err(err) = require_user(&tx, user_id).await {
            return abort(tx, err).await;
        }

        let now = Utc::now();
        let membership = match tx.get::<BackupMembership>(&(backup_id, user_id)).await? {
            Some(existing) => {
                let refreshed = BackupMembership {
                    last_seen: now,
                    ..existing
                };
                tx.update(refreshed.clone()).await?;
                refreshed
            }
            None => {
                let created = BackupMembership {
                    backup_id,
                    user_id,
                    first_seen: now,
                    last_seen: now,
                };
                tx.insert(created.clone()).await?;
                if backup.protected_by_hold {
                    let reason = backup
                        .protected_reason
                        .as_deref()
                        .unwrap_or(PROTECTED_AT_CREATION);
                    AuditLog::record_protection_event(&mut tx, backup_id, user_id, reason).await?;
                }
                created
            }
        };
        tx.commit().await?;

        info!(backup_id = %backup_id, user_id = %user_id, protected = backup.protected_by_hold, "backup member recorded");
        Ok(membership)
    }

    /// Whether `user_id` is captured by at least one protected backup, as
    /// seen by `tx`.
    pub async fn is_protected(&self, tx: &Transaction, user_id: UserId) -> Result<bool> {
        let memberships = tx
            .scan_filter::<BackupMembership, _>(|member| member.user_id == user_id)
            .await?;
        for member in memberships {
            let protected = tx
                .get::<BackupRun>(&member.backup_id)
                .await?
                .is_some_and(|backup| backup.protected_by_hold);
            if protected {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Backups that captured `user_id`, newest first.
    pub async fn list_for_user(&self, user_id: UserId) -> Vec<UserBackup> {
        let memberships = self
            .db
            .read::<BackupMembership, _>(|member| member.user_id == user_id)
            .await;
        let backups: HashMap<BackupId, BackupRun> = self
            .db
            .read::<BackupRun, _>(|backup| {
                memberships
                    .iter()
                    .any(|member| member.backup_id == backup.backup_id)
            })
            .await
            .into_iter()
            .map(|backup| (backup.backup_id, backup))
            .collect();

        let mut rows: Vec<UserBackup> = memberships
            .into_iter()
            .filter_map(|member| {
                let backup = backups.get(&member.backup_id)?;
                Some(UserBackup {
                    backup_id: backup.backup_id,
                    user_id: member.user_id,
                    backup_type: backup.backup_type,
                    started_at: backup.started_at,
                    ended_at: backup.ended_at,
                    protected_by_hold: backup.protected_by_hold,
                    protected_reason: backup.protected_reason.clone(),
                    protected_at: backup.protected_at,
                    created_at: backup.created_at,
                    first_seen: member.first_seen,
                    last_seen: member.last_seen,
                })
            })
            .collect();
        newest_first(&mut rows, |row| (row.created_at, row.backup_id));
        rows
    }

    /// The newest `limit` backups.
    pub async fn list_all(&self, limit: usize) -> Vec<BackupRun> {
        let mut backups = self.db.read::<BackupRun, _>(|_| true).await;
        newest_first(&mut backups, |backup| (backup.created_at, backup.backup_id));
        backups.truncate(limit);
        backups
    }
}
