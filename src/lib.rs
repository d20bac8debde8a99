// ============================================================================
// retentiondb Library
// ============================================================================

pub mod compliance;
pub mod config;
pub mod core;
pub mod facade;
pub mod storage;
pub mod transaction;
pub mod web;

// Re-export main types for convenience
pub use compliance::{
    clamp_limit, AuditLog, BackupProtectionIndex, DestructionResult, GuardedDestructionEngine,
    HoldRegistry, UserBackup, UserDirectory,
};
pub use config::{ServerConfig, StoreConfig};
pub use core::{
    AuditId, BackupId, BackupMembership, BackupRun, BackupType, DbError, DeletionAudit,
    DeletionOutcome, ErrorKind, HoldId, KeyId, KeyRecord, LegalHold, ProtectionAudit, Result,
    User, UserId,
};
pub use facade::{Database, DatabaseStats};
pub use storage::DurabilityMode;

use chrono::NaiveDate;
use std::sync::Arc;

// ============================================================================
// High-level Client API
// ============================================================================

/// Compliance client
///
/// The single entry point for operators and the HTTP layer. Ids arrive as
/// raw integers and are validated here; non-positive ids are a
/// `Validation` error.
///
/// # Examples
///
/// ```
/// use retentiondb::Client;
///
/// # tokio_test::block_on(async {
/// let client = Client::in_memory();
/// let user = client
///     .create_user("Ada Lovelace", "ada@example.com", None)
///     .await
///     .unwrap();
///
/// let hold = client.create_hold(user.user_id.as_i64(), "litigation").await.unwrap();
/// let blocked = client.destroy_keys(user.user_id.as_i64()).await.unwrap();
/// assert!(!blocked.allowed);
/// assert_eq!(blocked.reason, "active legal hold");
///
/// client.release_hold(hold.hold_id.as_i64()).await.unwrap();
/// let allowed = client.destroy_keys(user.user_id.as_i64()).await.unwrap();
/// assert!(allowed.allowed);
/// assert_eq!(allowed.keys_destroyed, 2);
/// # });
/// ```
#[derive(Clone)]
pub struct Client {
    db: Arc<Database>,
    users: UserDirectory,
    holds: HoldRegistry,
    backups: BackupProtectionIndex,
    audit: AuditLog,
    engine: GuardedDestructionEngine,
}

impl Client {
    /// Client over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::from_database(Database::in_memory())
    }

    /// Open (and recover) a store, then wrap it
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use retentiondb::{Client, DurabilityMode, StoreConfig};
    ///
    /// # tokio_test::block_on(async {
    /// let config = StoreConfig::new()
    ///     .data_dir("./data")
    ///     .durability(DurabilityMode::Sync);
    /// let client = Client::open(config).await.unwrap();
    /// # });
    /// ```
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self::from_database(Database::open(config).await?))
    }

    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            users: UserDirectory::new(Arc::clone(&db)),
            holds: HoldRegistry::new(Arc::clone(&db)),
            backups: BackupProtectionIndex::new(Arc::clone(&db)),
            audit: AuditLog::new(Arc::clone(&db)),
            engine: GuardedDestructionEngine::new(Arc::clone(&db)),
            db,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ========================================================================
    // Users and keys
    // ========================================================================

    pub async fn create_user(
        &self,
        full_name: &str,
        email: &str,
        phone: Option<&str>,
    ) -> Result<User> {
        self.users.create_user(full_name, email, phone).await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        self.users.get_user(UserId::new(user_id)?).await
    }

    pub async fn list_users(&self, limit: Option<i64>) -> Vec<User> {
        self.users.list_users(clamp_limit(limit)).await
    }

    pub async fn issue_key(
        &self,
        user_id: i64,
        purpose: &str,
        bucket_date: Option<NaiveDate>,
        material: Option<Vec<u8>>,
    ) -> Result<KeyRecord> {
        self.users
            .issue_key(UserId::new(user_id)?, purpose, bucket_date, material)
            .await
    }

    pub async fn list_keys(&self, user_id: i64) -> Result<Vec<KeyRecord>> {
        self.users.list_keys(UserId::new(user_id)?).await
    }

    pub async fn truncate_users(&self) -> Result<u64> {
        self.users.truncate_users().await
    }

    pub async fn restore_users_from_shadow(&self) -> Result<u64> {
        self.users.restore_users_from_shadow().await
    }

    // ========================================================================
    // Legal holds
    // ========================================================================

    pub async fn create_hold(&self, user_id: i64, reason: &str) -> Result<LegalHold> {
        self.holds.place_hold(UserId::new(user_id)?, reason).await
    }

    pub async fn release_hold(&self, hold_id: i64) -> Result<LegalHold> {
        self.holds.release_hold(HoldId::new(hold_id)?).await
    }

    pub async fn list_active_holds(&self, user_id: i64) -> Result<Vec<LegalHold>> {
        Ok(self.holds.list_active(UserId::new(user_id)?).await)
    }

    pub async fn list_all_active_holds(&self) -> Vec<LegalHold> {
        self.holds.list_all_active().await
    }

    // ========================================================================
    // Backups
    // ========================================================================

    pub async fn create_backup(&self, backup_type: &str, protected_by_hold: bool) -> Result<BackupRun> {
        self.backups.create_backup(backup_type, protected_by_hold).await
    }

    pub async fn add_user_to_backup(&self, backup_id: i64, user_id: i64) -> Result<BackupMembership> {
        self.backups
            .add_member(BackupId::new(backup_id)?, UserId::new(user_id)?)
            .await
    }

    pub async fn list_backups(&self, limit: Option<i64>) -> Vec<BackupRun> {
        self.backups.list_all(clamp_limit(limit)).await
    }

    pub async fn list_backups_for_user(&self, user_id: i64) -> Result<Vec<UserBackup>> {
        Ok(self.backups.list_for_user(UserId::new(user_id)?).await)
    }

    // ========================================================================
    // Guarded destruction and audit
    // ========================================================================

    pub async fn destroy_keys(&self, user_id: i64) -> Result<DestructionResult> {
        self.engine.destroy_keys(UserId::new(user_id)?).await
    }

    pub async fn list_deletion_audit(&self, limit: Option<i64>) -> Vec<DeletionAudit> {
        self.audit.list_deletion_audit(clamp_limit(limit)).await
    }

    pub async fn list_backup_protection_audit(&self, limit: Option<i64>) -> Vec<ProtectionAudit> {
        self.audit.list_protection_audit(clamp_limit(limit)).await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub async fn checkpoint(&self) -> Result<()> {
        self.db.checkpoint().await
    }

    pub async fn stats(&self) -> DatabaseStats {
        self.db.stats().await
    }
}
