use super::newest_first;
use crate::core::{
    AuditId, BackupId, DeletionAudit, DeletionOutcome, ProtectionAudit, Result, UserId,
};
use crate::facade::Database;
use crate::storage::Sequence;
use crate::transaction::Transaction;
use chrono::Utc;
use std::sync::Arc;

/// Append-only compliance trail.
///
/// Writers append inside the transaction that made the decision, so an
/// audit row is durable exactly when the decision it describes is.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn record_deletion_attempt(
        tx: &mut Transaction,
        user_id: UserId,
        outcome: DeletionOutcome,
        reason: &str,
        keys_affected: u64,
    ) -> Result<DeletionAudit> {
        let entry = DeletionAudit {
            audit_id: AuditId(tx.next_id(Sequence::DeletionAudit)?),
            user_id,
            outcome,
            reason: reason.to_string(),
            keys_affected,
            created_at: Utc::now(),
        };
        tx.insert(entry.clone()).await?;
        Ok(entry)
    }

    pub async fn record_protection_event(
        tx: &mut Transaction,
        backup_id: BackupId,
        user_id: UserId,
        reason: &str,
    ) -> Result<ProtectionAudit> {
        let entry = ProtectionAudit {
            audit_id: AuditId(tx.next_id(Sequence::ProtectionAudit)?),
            backup_id,
            user_id,
            protected: true,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        tx.insert(entry.clone()).await?;
        Ok(entry)
    }

    /// Newest `limit` deletion attempts.
    pub async fn list_deletion_audit(&self, limit: usize) -> Vec<DeletionAudit> {
        let mut rows = self.db.read::<DeletionAudit, _>(|_| true).await;
        newest_first(&mut rows, |row| (row.created_at, row.audit_id));
        rows.truncate(limit);
        rows
    }

    /// Newest `limit` protection events.
    pub async fn list_protection_audit(&self, limit: usize) -> Vec<ProtectionAudit> {
        let mut rows = self.db.read::<ProtectionAudit, _>(|_| true).await;
        newest_first(&mut rows, |row| (row.created_at, row.audit_id));
        rows.truncate(limit);
        rows
    }
}
