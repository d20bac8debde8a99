use super::{Change, TransactionId, UserLockGuard};
use crate::core::{DbError, Result, Snapshot, UserId};
use crate::facade::Database;
use crate::storage::{Row, Sequence, WalEntry};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A running transaction.
///
/// Reads see the snapshot taken at begin plus the transaction's own writes.
/// Writes go straight into the tables as uncommitted versions and are
/// recorded as [`Change`]s for the WAL and for rollback.
///
/// Dropping a transaction that was neither committed nor rolled back (for
/// example because the caller's future was cancelled by a timeout) rolls it
/// back on the runtime. User locks are released only after the undo.
pub struct Transaction {
    inner: Option<TxnInner>,
}

struct TxnInner {
    db: Arc<Database>,
    id: TransactionId,
    snapshot: Snapshot,
    changes: Vec<Change>,
    locked_users: HashSet<UserId>,
    // Held until the transaction is finished; dropped with `TxnInner`.
    _locks: Vec<UserLockGuard>,
}

impl Transaction {
    pub(crate) fn new(
        db: Arc<Database>,
        id: TransactionId,
        snapshot: Snapshot,
        locks: Vec<(UserId, UserLockGuard)>,
    ) -> Self {
        let (locked_users, locks) = locks.into_iter().unzip();
        Self {
            inner: Some(TxnInner {
                db,
                id,
                snapshot,
                changes: Vec::new(),
                locked_users,
                _locks: locks,
            }),
        }
    }

    fn inner(&self) -> Result<&TxnInner> {
        self.inner
            .as_ref()
            .ok_or_else(|| DbError::storage("transaction already finished"))
    }

    fn inner_mut(&mut self) -> Result<&mut TxnInner> {
        self.inner
            .as_mut()
            .ok_or_else(|| DbError::storage("transaction already finished"))
    }

    pub fn id(&self) -> Option<TransactionId> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    pub fn holds_lock(&self, user_id: UserId) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.locked_users.contains(&user_id))
    }

    pub fn change_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.changes.len())
    }

    pub fn next_id(&self, sequence: Sequence) -> Result<i64> {
        Ok(self.inner()?.db.storage().next_id(sequence))
    }

    pub async fn get<R: Row>(&self, key: &R::Key) -> Result<Option<R>> {
        let inner = self.inner()?;
        let table = inner.db.storage().table::<R>().read().await;
        Ok(table.get(key, &inner.snapshot))
    }

    pub async fn scan<R: Row>(&self) -> Result<Vec<R>> {
        self.scan_filter(|_: &R| true).await
    }

    pub async fn scan_filter<R, F>(&self, predicate: F) -> Result<Vec<R>>
    where
        R: Row,
        F: Fn(&R) -> bool,
    {
        let inner = self.inner()?;
        let table = inner.db.storage().table::<R>().read().await;
        Ok(table.scan_filter(&inner.snapshot, predicate))
    }

    pub async fn exists<R, F>(&self, predicate: F) -> Result<bool>
    where
        R: Row,
        F: Fn(&R) -> bool,
    {
        let inner = self.inner()?;
        let table = inner.db.storage().table::<R>().read().await;
        Ok(table.exists(&inner.snapshot, predicate))
    }

    pub async fn insert<R: Row>(&mut self, row: R) -> Result<()> {
        let inner = self.inner_mut()?;
        {
            let mut table = inner.db.storage().table::<R>().write().await;
            table.insert(row.clone(), &inner.snapshot)?;
        }
        inner.changes.push(Change::Insert(row.into_record()));
        Ok(())
    }

    /// Replace the visible row with the same key. Returns the previous
    /// image, or `None` if no such row is visible (nothing is written).
    pub async fn update<R: Row>(&mut self, row: R) -> Result<Option<R>> {
        let inner = self.inner_mut()?;
        let old = {
            let mut table = inner.db.storage().table::<R>().write().await;
            table.update(row.clone(), &inner.snapshot)?
        };
        if let Some(old) = &old {
            inner.changes.push(Change::Update {
                old: old.clone().into_record(),
                new: row.into_record(),
            });
        }
        Ok(old)
    }

    pub async fn delete<R: Row>(&mut self, key: &R::Key) -> Result<Option<R>> {
        let inner = self.inner_mut()?;
        let removed = {
            let mut table = inner.db.storage().table::<R>().write().await;
            table.delete(key, &inner.snapshot)?
        };
        if let Some(row) = &removed {
            inner.changes.push(Change::Delete(row.clone().into_record()));
        }
        Ok(removed)
    }

    /// Make the writes durable (when persistence is on) and visible.
    ///
    /// The commit runs on its own task, so it completes even if the caller
    /// stops waiting for it.
    pub async fn commit(mut self) -> Result<()> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| DbError::storage("transaction already finished"))?;
        tokio::spawn(inner.commit())
            .await
            .map_err(|e| DbError::storage(format!("commit task failed: {}", e)))?
    }

    pub async fn rollback(mut self) -> Result<()> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| DbError::storage("transaction already finished"))?;
        tokio::spawn(inner.rollback())
            .await
            .map_err(|e| DbError::storage(format!("rollback task failed: {}", e)))?
    }
}

impl TxnInner {
    async fn commit(mut self) -> Result<()> {
        let changes = std::mem::take(&mut self.changes);
        let db = Arc::clone(&self.db);

        if let Some(persistence) = db.persistence() {
            // Commits are ordered by this lock: log order is commit order,
            // and a checkpoint never sees a logged but invisible commit.
            let mut wal = persistence.lock().await;
            if !changes.is_empty() {
                let entry = WalEntry::Commit {
                    tx_id: self.id.as_u64(),
                    changes,
                };
                if let Err(err) = wal.log(&entry) {
                    drop(wal);
                    let WalEntry::Commit { changes, .. } = entry;
                    self.changes = changes;
                    error!(txn = %self.id, error = %err, "WAL append failed, rolling back");
                    self.rollback().await?;
                    return Err(DbError::storage(format!("commit failed: {}", err)));
                }
            }
            db.transaction_manager().commit(self.id).await?;
        } else {
            db.transaction_manager().commit(self.id).await?;
        }

        debug!(txn = %self.id, "committed");
        // Release user locks before the checkpoint.
        drop(self);
        if let Err(err) = db.maybe_checkpoint().await {
            warn!(error = %err, "automatic checkpoint failed");
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        let storage = self.db.storage();
        for change in self.changes.iter().rev() {
            storage.undo(change, self.id.as_u64()).await;
        }
        self.db.transaction_manager().rollback(self.id).await?;
        debug!(txn = %self.id, changes = self.changes.len(), "rolled back");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let id = inner.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(txn = %id, "transaction dropped without commit, rolling back");
                handle.spawn(async move {
                    if let Err(err) = inner.rollback().await {
                        error!(txn = %id, error = %err, "rollback of dropped transaction failed");
                    }
                });
            }
            Err(_) => {
                error!(txn = %id, "transaction dropped outside a runtime; its writes stay pending");
            }
        }
    }
}
