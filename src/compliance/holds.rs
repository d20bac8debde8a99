use super::{abort, newest_first, require_user};
use crate::core::{DbError, HoldId, LegalHold, Result, UserId};
use crate::facade::Database;
use crate::storage::Sequence;
use crate::transaction::Transaction;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Active and released legal holds per user.
///
/// A user may carry any number of simultaneous active holds; they are not
/// deduplicated. A hold is active until it is released, and a release is
/// final.
#[derive(Clone)]
pub struct HoldRegistry {
    db: Arc<Database>,
}

impl HoldRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Place a new active hold on `user_id`.
    ///
    /// Takes the user lock, so a destruction already evaluating for this user
    /// finishes first and any later one sees the hold.
    pub async fn place_hold(&self, user_id: UserId, reason: &str) -> Result<LegalHold> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DbError::validation("hold reason must not be blank"));
        }

        let mut tx = self.db.begin_locked(vec![user_id]).await?;
        if let Err(err) = require_user(&tx, user_id).await {
            return abort(tx, err).await;
        }

        let hold = LegalHold {
            hold_id: HoldId(tx.next_id(Sequence::Hold)?),
            user_id,
            hold_reason: reason.to_string(),
            created_at: Utc::now(),
            released_at: None,
        };
        tx.insert(hold.clone()).await?;
        tx.commit().await?;

        info!(hold_id = %hold.hold_id, user_id = %user_id, reason, "legal hold placed");
        Ok(hold)
    }

    /// Release an active hold. Releasing an unknown or already released
    /// hold fails with `NotFound`.
    pub async fn release_hold(&self, hold_id: HoldId) -> Result<LegalHold> {
        let mut tx = self.db.begin().await?;
        let active = tx
            .get::<LegalHold>(&hold_id)
            .await?
            .filter(LegalHold::is_active);
        let Some(hold) = active else {
            return abort(tx, DbError::not_found(format!("active hold {}", hold_id))).await;
        };

        let released = LegalHold {
            released_at: Some(Utc::now()),
            ..hold
        };
        tx.update(released.clone()).await?;
        tx.commit().await?;

        info!(hold_id = %hold_id, user_id = %released.user_id, "legal hold released");
        Ok(released)
    }

    /// Active holds of one user, newest first.
    pub async fn list_active(&self, user_id: UserId) -> Vec<LegalHold> {
        let mut holds = self
            .db
            .read::<LegalHold, _>(|hold| hold.user_id == user_id && hold.is_active())
            .await;
        newest_first(&mut holds, |hold| (hold.created_at, hold.hold_id));
        holds
    }

    /// Active holds across all users, newest first.
    pub async fn list_all_active(&self) -> Vec<LegalHold> {
        let mut holds = self.db.read::<LegalHold, _>(LegalHold::is_active).await;
        newest_first(&mut holds, |hold| (hold.created_at, hold.hold_id));
        holds
    }

    /// Whether `user_id` has at least one active hold, as seen by `tx`.
    pub async fn has_active_hold(&self, tx: &Transaction, user_id: UserId) -> Result<bool> {
        tx.exists::<LegalHold, _>(|hold| hold.user_id == user_id && hold.is_active())
            .await
    }
}
