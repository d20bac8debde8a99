pub mod error;
pub mod types;

pub use error::{DbError, ErrorKind, Result};
pub use types::{
    AuditId, BackupId, BackupMembership, BackupRun, BackupType, DeletionAudit, DeletionOutcome,
    HoldId, KeyId, KeyRecord, LegalHold, ProtectionAudit, Record, Snapshot, Timestamp, User,
    UserId, UserShadow,
};
