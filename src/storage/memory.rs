use super::table::{Row, Table, TableHandle};
use crate::core::{
    BackupId, BackupMembership, BackupRun, DeletionAudit, KeyRecord, LegalHold, ProtectionAudit,
    Record, Snapshot, User, UserId, UserShadow,
};
use crate::transaction::Change;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// Surrogate-key sequences, one per table with a generated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    User,
    Key,
    Hold,
    Backup,
    DeletionAudit,
    ProtectionAudit,
}

/// Last value handed out by each sequence, as persisted in snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceValues {
    pub user: i64,
    pub key: i64,
    pub hold: i64,
    pub backup: i64,
    pub deletion_audit: i64,
    pub protection_audit: i64,
}

#[derive(Debug, Default)]
struct Sequences {
    user: AtomicI64,
    key: AtomicI64,
    hold: AtomicI64,
    backup: AtomicI64,
    deletion_audit: AtomicI64,
    protection_audit: AtomicI64,
}

impl Sequences {
    fn counter(&self, sequence: Sequence) -> &AtomicI64 {
        match sequence {
            Sequence::User => &self.user,
            Sequence::Key => &self.key,
            Sequence::Hold => &self.hold,
            Sequence::Backup => &self.backup,
            Sequence::DeletionAudit => &self.deletion_audit,
            Sequence::ProtectionAudit => &self.protection_audit,
        }
    }

    /// Values are consumed even when the transaction rolls back.
    fn next(&self, sequence: Sequence) -> i64 {
        self.counter(sequence).fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make sure the sequence never hands out `seen` again.
    fn observe(&self, sequence: Sequence, seen: i64) {
        self.counter(sequence).fetch_max(seen, Ordering::SeqCst);
    }

    fn values(&self) -> SequenceValues {
        SequenceValues {
            user: self.user.load(Ordering::SeqCst),
            key: self.key.load(Ordering::SeqCst),
            hold: self.hold.load(Ordering::SeqCst),
            backup: self.backup.load(Ordering::SeqCst),
            deletion_audit: self.deletion_audit.load(Ordering::SeqCst),
            protection_audit: self.protection_audit.load(Ordering::SeqCst),
        }
    }
}

/// Every table of the compliance schema.
///
/// Each table sits behind its own lock; a transaction touches them one at a
/// time, so no lock ordering between tables is required.
#[derive(Default)]
pub struct InMemoryStorage {
    users: TableHandle<User>,
    users_shadow: TableHandle<UserShadow>,
    keys: TableHandle<KeyRecord>,
    holds: TableHandle<LegalHold>,
    backups: TableHandle<BackupRun>,
    memberships: TableHandle<BackupMembership>,
    deletion_audit: TableHandle<DeletionAudit>,
    protection_audit: TableHandle<ProtectionAudit>,
    sequences: Sequences,
}

/// Run `$body` with `$table` bound to the write guard of the table that
/// `$record` belongs to and `$row` bound to the inner row.
macro_rules! with_table_mut {
    ($storage:expr, $record:expr, |$table:ident, $row:ident| $body:expr) => {
        match $record {
            Record::User($row) => {
                let mut $table = $storage.users.write().await;
                $body
            }
            Record::UserShadow($row) => {
                let mut $table = $storage.users_shadow.write().await;
                $body
            }
            Record::Key($row) => {
                let mut $table = $storage.keys.write().await;
                $body
            }
            Record::Hold($row) => {
                let mut $table = $storage.holds.write().await;
                $body
            }
            Record::Backup($row) => {
                let mut $table = $storage.backups.write().await;
                $body
            }
            Record::Membership($row) => {
                let mut $table = $storage.memberships.write().await;
                $body
            }
            Record::DeletionAudit($row) => {
                let mut $table = $storage.deletion_audit.write().await;
                $body
            }
            Record::ProtectionAudit($row) => {
                let mut $table = $storage.protection_audit.write().await;
                $body
            }
        }
    };
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table<R: Row>(&self) -> &TableHandle<R> {
        R::table(self)
    }

    pub fn next_id(&self, sequence: Sequence) -> i64 {
        self.sequences.next(sequence)
    }

    pub fn sequence_values(&self) -> SequenceValues {
        self.sequences.values()
    }

    /// Roll back one change made by `tx_id`.
    pub async fn undo(&self, change: &Change, tx_id: u64) {
        with_table_mut!(self, change.record(), |table, row| table
            .undo(&row.key(), tx_id))
    }

    /// Replay a committed change (WAL recovery).
    pub async fn apply_committed(&self, change: &Change) {
        let record = change.record();
        self.observe_ids(record);
        match change {
            Change::Insert(_) | Change::Update { .. } => {
                with_table_mut!(self, record, |table, row| table.put_committed(row.clone()))
            }
            Change::Delete(_) => {
                with_table_mut!(self, record, |table, row| table.remove_committed(&row.key()))
            }
        }
    }

    /// Every row visible to `snapshot`, table by table.
    pub async fn dump(&self, snapshot: &Snapshot) -> Vec<Record> {
        let mut records = Vec::new();
        records.extend(scan_into(&self.users, snapshot).await);
        records.extend(scan_into(&self.users_shadow, snapshot).await);
        records.extend(scan_into(&self.keys, snapshot).await);
        records.extend(scan_into(&self.holds, snapshot).await);
        records.extend(scan_into(&self.backups, snapshot).await);
        records.extend(scan_into(&self.memberships, snapshot).await);
        records.extend(scan_into(&self.deletion_audit, snapshot).await);
        records.extend(scan_into(&self.protection_audit, snapshot).await);
        records
    }

    /// Load a checkpoint. Existing rows with the same keys are replaced.
    pub async fn restore(&self, records: Vec<Record>, sequences: SequenceValues) {
        self.sequences.observe(Sequence::User, sequences.user);
        self.sequences.observe(Sequence::Key, sequences.key);
        self.sequences.observe(Sequence::Hold, sequences.hold);
        self.sequences.observe(Sequence::Backup, sequences.backup);
        self.sequences
            .observe(Sequence::DeletionAudit, sequences.deletion_audit);
        self.sequences
            .observe(Sequence::ProtectionAudit, sequences.protection_audit);

        for record in records {
            self.observe_ids(&record);
            with_table_mut!(self, record, |table, row| table.put_committed(row))
        }
    }

    pub async fn row_counts(&self) -> Vec<(&'static str, usize)> {
        vec![
            (User::TABLE, self.users.read().await.row_count()),
            (UserShadow::TABLE, self.users_shadow.read().await.row_count()),
            (KeyRecord::TABLE, self.keys.read().await.row_count()),
            (LegalHold::TABLE, self.holds.read().await.row_count()),
            (BackupRun::TABLE, self.backups.read().await.row_count()),
            (BackupMembership::TABLE, self.memberships.read().await.row_count()),
            (DeletionAudit::TABLE, self.deletion_audit.read().await.row_count()),
            (ProtectionAudit::TABLE, self.protection_audit.read().await.row_count()),
        ]
    }

    fn observe_ids(&self, record: &Record) {
        let (sequence, id) = match record {
            Record::User(row) => (Sequence::User, row.user_id.0),
            Record::UserShadow(row) => (Sequence::User, row.user.user_id.0),
            Record::Key(row) => (Sequence::Key, row.key_id.0),
            Record::Hold(row) => (Sequence::Hold, row.hold_id.0),
            Record::Backup(row) => (Sequence::Backup, row.backup_id.0),
            Record::Membership(_) => return,
            Record::DeletionAudit(row) => (Sequence::DeletionAudit, row.audit_id.0),
            Record::ProtectionAudit(row) => (Sequence::ProtectionAudit, row.audit_id.0),
        };
        self.sequences.observe(sequence, id);
    }
}

async fn scan_into<R: Row>(table: &Arc<RwLock<Table<R>>>, snapshot: &Snapshot) -> Vec<Record> {
    table
        .read()
        .await
        .scan(snapshot)
        .into_iter()
        .map(Row::into_record)
        .collect()
}

macro_rules! impl_row {
    ($ty:ty, $key:ty, $table:literal, $field:ident, $variant:ident, |$row:ident| $key_expr:expr) => {
        impl Row for $ty {
            type Key = $key;

            const TABLE: &'static str = $table;

            fn key(&self) -> Self::Key {
                let $row = self;
                $key_expr
            }

            fn into_record(self) -> Record {
                Record::$variant(self)
            }

            fn table(storage: &InMemoryStorage) -> &TableHandle<Self> {
                &storage.$field
            }
        }
    };
}

impl_row!(User, UserId, "users", users, User, |row| row.user_id);
impl_row!(UserShadow, UserId, "users_shadow", users_shadow, UserShadow, |row| row
    .user
    .user_id);
impl_row!(KeyRecord, crate::core::KeyId, "key_store", keys, Key, |row| row.key_id);
impl_row!(LegalHold, crate::core::HoldId, "legal_holds", holds, Hold, |row| row.hold_id);
impl_row!(BackupRun, BackupId, "backup_runs", backups, Backup, |row| row.backup_id);
impl_row!(
    BackupMembership,
    (BackupId, UserId),
    "backup_user_index",
    memberships,
    Membership,
    |row| (row.backup_id, row.user_id)
);
impl_row!(
    DeletionAudit,
    crate::core::AuditId,
    "deletion_audit",
    deletion_audit,
    DeletionAudit,
    |row| row.audit_id
);
impl_row!(
    ProtectionAudit,
    crate::core::AuditId,
    "backup_protection_audit",
    protection_audit,
    ProtectionAudit,
    |row| row.audit_id
);
