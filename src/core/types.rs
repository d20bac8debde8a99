use super::{DbError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub type Timestamp = DateTime<Utc>;

macro_rules! surrogate_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Validate a caller-supplied id (ids are always positive).
            pub fn new(raw: i64) -> Result<Self> {
                if raw <= 0 {
                    return Err(DbError::Validation(format!(
                        "{} must be positive, got {}",
                        $label, raw
                    )));
                }
                Ok(Self(raw))
            }

            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

surrogate_id!(UserId, "user_id");
surrogate_id!(KeyId, "key_id");
surrogate_id!(HoldId, "hold_id");
surrogate_id!(BackupId, "backup_id");
surrogate_id!(
    /// Shared by both audit tables; each table has its own sequence.
    AuditId,
    "audit_id"
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_at: Timestamp,
}

/// Append-only copy of every user ever created, used by
/// `restore_users_from_shadow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserShadow {
    pub user: User,
    pub shadowed_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    pub user_id: UserId,
    pub purpose: String,
    pub bucket_date: NaiveDate,
    /// `None` while the key is live. Never reverts once set.
    pub destroyed_at: Option<Timestamp>,
    /// Wiped together with setting `destroyed_at`.
    pub key_material: Option<Vec<u8>>,
    pub created_at: Timestamp,
}

impl KeyRecord {
    pub fn is_live(&self) -> bool {
        self.destroyed_at.is_none()
    }

    /// One-way transition; a destroyed key stays destroyed.
    pub fn destroyed(&self, at: Timestamp) -> Self {
        Self {
            destroyed_at: Some(self.destroyed_at.unwrap_or(at)),
            key_material: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalHold {
    pub hold_id: HoldId,
    pub user_id: UserId,
    pub hold_reason: String,
    pub created_at: Timestamp,
    pub released_at: Option<Timestamp>,
}

impl LegalHold {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Incremental => "INCREMENTAL",
        }
    }
}

impl FromStr for BackupType {
    type Err = DbError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupType::Full),
            "INCREMENTAL" | "INCR" => Ok(BackupType::Incremental),
            other => Err(DbError::Validation(format!(
                "backup_type must be FULL or INCREMENTAL, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRun {
    pub backup_id: BackupId,
    pub backup_type: BackupType,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub protected_by_hold: bool,
    pub protected_reason: Option<String>,
    pub protected_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMembership {
    pub backup_id: BackupId,
    pub user_id: UserId,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionOutcome {
    Allowed,
    Blocked,
}

impl fmt::Display for DeletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionOutcome::Allowed => write!(f, "ALLOWED"),
            DeletionOutcome::Blocked => write!(f, "BLOCKED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionAudit {
    pub audit_id: AuditId,
    pub user_id: UserId,
    pub outcome: DeletionOutcome,
    pub reason: String,
    pub keys_affected: u64,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionAudit {
    pub audit_id: AuditId,
    pub backup_id: BackupId,
    pub user_id: UserId,
    /// Protection state the user entered with this event.
    pub protected: bool,
    pub reason: String,
    pub created_at: Timestamp,
}

/// A row of any table, as carried by the change log and the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    User(User),
    UserShadow(UserShadow),
    Key(KeyRecord),
    Hold(LegalHold),
    Backup(BackupRun),
    Membership(BackupMembership),
    DeletionAudit(DeletionAudit),
    ProtectionAudit(ProtectionAudit),
}

impl Record {
    pub fn table_name(&self) -> &'static str {
        match self {
            Record::User(_) => "users",
            Record::UserShadow(_) => "users_shadow",
            Record::Key(_) => "key_store",
            Record::Hold(_) => "legal_holds",
            Record::Backup(_) => "backup_runs",
            Record::Membership(_) => "backup_user_index",
            Record::DeletionAudit(_) => "deletion_audit",
            Record::ProtectionAudit(_) => "backup_protection_audit",
        }
    }
}

/// MVCC read view.
///
/// `active` holds transactions that were running when the snapshot was
/// taken; anything at or above `max_tx_id` started afterwards.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: u64,
    pub active: Arc<HashSet<u64>>,
    pub max_tx_id: u64,
}

impl Snapshot {
    /// View that treats every version as committed. Only meaningful when no
    /// transaction is running (recovery, tests).
    pub fn committed() -> Self {
        Self {
            tx_id: u64::MAX,
            active: Arc::new(HashSet::new()),
            max_tx_id: u64::MAX,
        }
    }

    pub fn is_committed(&self, tx_id: u64) -> bool {
        tx_id < self.max_tx_id && !self.active.contains(&tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_must_be_positive() {
        assert!(UserId::new(1).is_ok());
        assert!(matches!(UserId::new(0), Err(DbError::Validation(_))));
        assert!(matches!(BackupId::new(-3), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_backup_type_parsing() {
        assert_eq!("full".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!(" INCR ".parse::<BackupType>().unwrap(), BackupType::Incremental);
        assert_eq!(
            "Incremental".parse::<BackupType>().unwrap(),
            BackupType::Incremental
        );
        assert!("daily".parse::<BackupType>().is_err());
    }

    #[test]
    fn test_destroyed_key_keeps_first_timestamp() {
        let created = Utc::now();
        let key = KeyRecord {
            key_id: KeyId(1),
            user_id: UserId(1),
            purpose: "pii".into(),
            bucket_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            destroyed_at: None,
            key_material: Some(vec![1, 2, 3]),
            created_at: created,
        };
        let first = key.destroyed(created);
        let second = first.destroyed(created + chrono::Duration::seconds(5));
        assert_eq!(second.destroyed_at, Some(created));
        assert!(second.key_material.is_none());
        assert!(!second.is_live());
    }

    #[test]
    fn test_snapshot_visibility_bounds() {
        let snapshot = Snapshot {
            tx_id: 10,
            active: Arc::new([7u64].into_iter().collect()),
            max_tx_id: 10,
        };
        assert!(snapshot.is_committed(3));
        assert!(!snapshot.is_committed(7));
        assert!(!snapshot.is_committed(12));
    }
}
