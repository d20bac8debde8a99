use super::{abort, newest_first, require_user};
use crate::core::{
    BackupMembership, DbError, KeyId, KeyRecord, LegalHold, Result, User, UserId, UserShadow,
};
use crate::facade::Database;
use crate::storage::Sequence;
use crate::transaction::Transaction;
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Locking rounds `truncate_users` tries before giving up.
const TRUNCATE_LOCK_ROUNDS: u32 = 8;

/// Users and the key records that protect their personal data.
///
/// Every user is created with one live key per personal field (`name`,
/// `email`, and `phone` when given), and copied to the shadow table used by
/// [`UserDirectory::restore_users_from_shadow`].
#[derive(Clone)]
pub struct UserDirectory {
    db: Arc<Database>,
}

impl UserDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create_user(
        &self,
        full_name: &str,
        email: &str,
        phone: Option<&str>,
    ) -> Result<User> {
        let full_name = full_name.trim();
        let email = email.trim();
        if full_name.is_empty() || email.is_empty() {
            return Err(DbError::validation("full_name and email are required"));
        }
        let phone = phone.map(str::trim).filter(|phone| !phone.is_empty());

        let mut tx = self.db.begin().await?;
        let now = Utc::now();
        let user = User {
            user_id: UserId(tx.next_id(Sequence::User)?),
            full_name: full_name.to_string(),
            email: email.to_string(),
            phone: phone.map(str::to_string),
            created_at: now,
        };
        tx.insert(user.clone()).await?;
        tx.insert(UserShadow {
            user: user.clone(),
            shadowed_at: now,
        })
        .await?;

        let today = now.date_naive();
        let mut purposes = vec!["name", "email"];
        if phone.is_some() {
            purposes.push("phone");
        }
        for purpose in purposes {
            insert_key(&mut tx, user.user_id, purpose, today, None).await?;
        }
        tx.commit().await?;

        info!(user_id = %user.user_id, "user created");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User> {
        self.db
            .get::<User>(&user_id)
            .await
            .ok_or_else(|| DbError::not_found(format!("user {}", user_id)))
    }

    /// Newest `limit` users.
    pub async fn list_users(&self, limit: usize) -> Vec<User> {
        let mut users = self.db.read::<User, _>(|_| true).await;
        newest_first(&mut users, |user| (user.created_at, user.user_id));
        users.truncate(limit);
        users
    }

    /// Issue a live key for `user_id`. Without explicit material, 32 random
    /// bytes are generated.
    ///
    /// Holds the user lock so issuance and destruction never interleave.
    pub async fn issue_key(
        &self,
        user_id: UserId,
        purpose: &str,
        bucket_date: Option<NaiveDate>,
        material: Option<Vec<u8>>,
    ) -> Result<KeyRecord> {
        let purpose = purpose.trim();
        if purpose.is_empty() {
            return Err(DbError::validation("key purpose must not be blank"));
        }

        let mut tx = self.db.begin_locked(vec![user_id]).await?;
        if let Err(err) = require_user(&tx, user_id).await {
            return abort(tx, err).await;
        }
        let bucket = bucket_date.unwrap_or_else(|| Utc::now().date_naive());
        let key = insert_key(&mut tx, user_id, purpose, bucket, material).await?;
        tx.commit().await?;

        info!(user_id = %user_id, key_id = %key.key_id, purpose, "key issued");
        Ok(key)
    }

    /// Keys of `user_id`, newest bucket first, then by purpose.
    pub async fn list_keys(&self, user_id: UserId) -> Result<Vec<KeyRecord>> {
        self.get_user(user_id).await?;
        let mut keys = self
            .db
            .read::<KeyRecord, _>(|key| key.user_id == user_id)
            .await;
        keys.sort_by(|a, b| {
            b.bucket_date
                .cmp(&a.bucket_date)
                .then_with(|| a.purpose.cmp(&b.purpose))
                .then_with(|| a.key_id.cmp(&b.key_id))
        });
        Ok(keys)
    }

    /// Delete every user together with their keys, holds and backup
    /// memberships. Backups, the shadow table and both audit tables are
    /// kept. Returns the number of users removed.
    pub async fn truncate_users(&self) -> Result<u64> {
        let (mut tx, users) = self.lock_all_users().await?;
        for key in tx.scan::<KeyRecord>().await? {
            tx.delete::<KeyRecord>(&key.key_id).await?;
        }
        for hold in tx.scan::<LegalHold>().await? {
            tx.delete::<LegalHold>(&hold.hold_id).await?;
        }
        for member in tx.scan::<BackupMembership>().await? {
            tx.delete::<BackupMembership>(&(member.backup_id, member.user_id))
                .await?;
        }
        for user in &users {
            tx.delete::<User>(&user.user_id).await?;
        }
        tx.commit().await?;

        info!(users = users.len(), "users truncated");
        Ok(users.len() as u64)
    }

    /// Begin a transaction holding the lock of every user its snapshot can
    /// see. Users created between listing and locking force another round.
    async fn lock_all_users(&self) -> Result<(Transaction, Vec<User>)> {
        let mut locked: HashSet<UserId> = HashSet::new();
        for attempt in 1..=TRUNCATE_LOCK_ROUNDS {
            let committed = self.db.read::<User, _>(|_| true).await;
            locked.extend(committed.iter().map(|user| user.user_id));

            let tx = self.db.begin_locked(locked.iter().copied().collect()).await?;
            let users = tx.scan::<User>().await?;
            if users.iter().all(|user| locked.contains(&user.user_id)) {
                return Ok((tx, users));
            }
            debug!(attempt, "users created while locking for truncate, retrying");
            tx.rollback().await?;
        }
        Err(DbError::storage(
            "users kept appearing while locking them for truncate",
        ))
    }

    /// Re-insert every shadowed user that is missing from the users table.
    /// Keys are not restored. Returns the number of users restored.
    pub async fn restore_users_from_shadow(&self) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let mut restored = 0u64;
        for shadow in tx.scan::<UserShadow>().await? {
            if tx.get::<User>(&shadow.user.user_id).await?.is_none() {
                tx.insert(shadow.user).await?;
                restored += 1;
            }
        }
        tx.commit().await?;

        info!(restored, "users restored from shadow");
        Ok(restored)
    }
}

async fn insert_key(
    tx: &mut Transaction,
    user_id: UserId,
    purpose: &str,
    bucket_date: NaiveDate,
    material: Option<Vec<u8>>,
) -> Result<KeyRecord> {
    let key = KeyRecord {
        key_id: KeyId(tx.next_id(Sequence::Key)?),
        user_id,
        purpose: purpose.to_string(),
        bucket_date,
        destroyed_at: None,
        key_material: Some(material.unwrap_or_else(random_key_material)),
        created_at: Utc::now(),
    };
    tx.insert(key.clone()).await?;
    Ok(key)
}

fn random_key_material() -> Vec<u8> {
    let mut material = Vec::with_capacity(32);
    material.extend_from_slice(Uuid::new_v4().as_bytes());
    material.extend_from_slice(Uuid::new_v4().as_bytes());
    material
}
