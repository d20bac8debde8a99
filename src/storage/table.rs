use super::InMemoryStorage;
use crate::core::{DbError, Record, Result, Snapshot};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type TableHandle<R> = Arc<RwLock<Table<R>>>;

/// A typed row that lives in one of the store's tables.
pub trait Row: Clone + Send + Sync + 'static {
    type Key: Ord + Clone + Debug + Send + Sync;

    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    fn into_record(self) -> Record;

    fn table(storage: &InMemoryStorage) -> &TableHandle<Self>;
}

#[derive(Debug, Clone)]
pub struct MvccRow<R> {
    pub row: R,
    pub xmin: u64,         // Transaction ID that created this version
    pub xmax: Option<u64>, // Transaction ID that superseded/deleted it
}

/// Transaction id used for rows loaded from a snapshot or replayed from the
/// WAL. Smaller than any live transaction id, so always committed.
pub const BOOTSTRAP_TX: u64 = 0;

// TODO: versions superseded before the oldest active snapshot are never
// reclaimed until the next restart; add a vacuum pass to checkpointing.
#[derive(Debug, Clone)]
pub struct Table<R: Row> {
    rows: BTreeMap<R::Key, Vec<MvccRow<R>>>,
}

impl<R: Row> Default for Table<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Row> Table<R> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        R::TABLE
    }

    /// Number of logical rows (keys), including versions not yet visible.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, key: &R::Key, snapshot: &Snapshot) -> Option<R> {
        let versions = self.rows.get(key)?;
        Self::visible_version(versions, snapshot).map(|idx| versions[idx].row.clone())
    }

    /// Rows visible to `snapshot`, in key order.
    pub fn scan(&self, snapshot: &Snapshot) -> Vec<R> {
        self.scan_filter(snapshot, |_| true)
    }

    pub fn scan_filter<F>(&self, snapshot: &Snapshot, predicate: F) -> Vec<R>
    where
        F: Fn(&R) -> bool,
    {
        self.rows
            .values()
            .filter_map(|versions| {
                Self::visible_version(versions, snapshot).map(|idx| &versions[idx].row)
            })
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }

    pub fn exists<F>(&self, snapshot: &Snapshot, predicate: F) -> bool
    where
        F: Fn(&R) -> bool,
    {
        self.rows.values().any(|versions| {
            Self::visible_version(versions, snapshot).is_some_and(|idx| predicate(&versions[idx].row))
        })
    }

    pub fn insert(&mut self, row: R, snapshot: &Snapshot) -> Result<()> {
        let key = row.key();
        if let Some(versions) = self.rows.get(&key)
            && let Some(latest) = versions.last()
        {
            let deleted = matches!(
                latest.xmax,
                Some(xmax) if xmax == snapshot.tx_id || snapshot.is_committed(xmax)
            );
            if !deleted {
                let pending = latest.xmin != snapshot.tx_id && !snapshot.is_committed(latest.xmin);
                if pending || latest.xmax.is_some() {
                    return Err(DbError::WriteConflict(format!(
                        "{} row {:?} is being written by another transaction",
                        R::TABLE,
                        key
                    )));
                }
                return Err(DbError::ConstraintViolation(format!(
                    "duplicate key {:?} in {}",
                    key,
                    R::TABLE
                )));
            }
        }

        self.rows.entry(key).or_default().push(MvccRow {
            row,
            xmin: snapshot.tx_id,
            xmax: None,
        });
        Ok(())
    }

    /// Replace the row with the same key. Returns the previous version, or
    /// `None` when no version is visible to `snapshot`.
    ///
    /// First updater wins: if the visible version has been superseded by a
    /// transaction this snapshot cannot see, the update fails with
    /// `WriteConflict`.
    pub fn update(&mut self, row: R, snapshot: &Snapshot) -> Result<Option<R>> {
        let key = row.key();
        let Some(versions) = self.rows.get_mut(&key) else {
            return Ok(None);
        };
        let Some(idx) = Self::writable_version(versions, snapshot, &key)? else {
            return Ok(None);
        };

        let latest = &mut versions[idx];
        if latest.xmin == snapshot.tx_id {
            // Our own uncommitted version: rewrite in place.
            return Ok(Some(std::mem::replace(&mut latest.row, row)));
        }

        latest.xmax = Some(snapshot.tx_id);
        let old = latest.row.clone();
        versions.push(MvccRow {
            row,
            xmin: snapshot.tx_id,
            xmax: None,
        });
        Ok(Some(old))
    }

    pub fn delete(&mut self, key: &R::Key, snapshot: &Snapshot) -> Result<Option<R>> {
        let Some(versions) = self.rows.get_mut(key) else {
            return Ok(None);
        };
        let Some(idx) = Self::writable_version(versions, snapshot, key)? else {
            return Ok(None);
        };

        if versions[idx].xmin == snapshot.tx_id {
            let removed = versions.remove(idx);
            if versions.is_empty() {
                self.rows.remove(key);
            }
            return Ok(Some(removed.row));
        }

        versions[idx].xmax = Some(snapshot.tx_id);
        Ok(Some(versions[idx].row.clone()))
    }

    /// Discard everything transaction `tx_id` did to `key`.
    pub fn undo(&mut self, key: &R::Key, tx_id: u64) {
        let Some(versions) = self.rows.get_mut(key) else {
            return;
        };
        versions.retain(|version| version.xmin != tx_id);
        for version in versions.iter_mut() {
            if version.xmax == Some(tx_id) {
                version.xmax = None;
            }
        }
        if versions.is_empty() {
            self.rows.remove(key);
        }
    }

    /// Install `row` as the only, committed version of its key.
    pub fn put_committed(&mut self, row: R) {
        self.rows.insert(
            row.key(),
            vec![MvccRow {
                row,
                xmin: BOOTSTRAP_TX,
                xmax: None,
            }],
        );
    }

    pub fn remove_committed(&mut self, key: &R::Key) {
        self.rows.remove(key);
    }

    fn visible_version(versions: &[MvccRow<R>], snapshot: &Snapshot) -> Option<usize> {
        versions
            .iter()
            .rposition(|version| Self::is_visible(version, snapshot))
    }

    fn writable_version(
        versions: &[MvccRow<R>],
        snapshot: &Snapshot,
        key: &R::Key,
    ) -> Result<Option<usize>> {
        let Some(idx) = Self::visible_version(versions, snapshot) else {
            return Ok(None);
        };
        if idx + 1 != versions.len() || versions[idx].xmax.is_some() {
            return Err(DbError::WriteConflict(format!(
                "{} row {:?} was modified by a concurrent transaction",
                R::TABLE,
                key
            )));
        }
        Ok(Some(idx))
    }

    fn is_visible(version: &MvccRow<R>, snapshot: &Snapshot) -> bool {
        if version.xmin == snapshot.tx_id {
            return version.xmax != Some(snapshot.tx_id);
        }

        if !snapshot.is_committed(version.xmin) {
            return false;
        }

        match version.xmax {
            Some(xmax) => xmax != snapshot.tx_id && !snapshot.is_committed(xmax),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HoldId, LegalHold, UserId};
    use chrono::Utc;
    use std::collections::HashSet;

    fn hold(id: i64, reason: &str) -> LegalHold {
        LegalHold {
            hold_id: HoldId(id),
            user_id: UserId(1),
            hold_reason: reason.to_string(),
            created_at: Utc::now(),
            released_at: None,
        }
    }

    fn snapshot(tx_id: u64, active: &[u64]) -> Snapshot {
        Snapshot {
            tx_id,
            active: Arc::new(active.iter().copied().collect::<HashSet<_>>()),
            max_tx_id: tx_id,
        }
    }

    #[test]
    fn test_uncommitted_insert_is_private() {
        let mut table = Table::<LegalHold>::new();
        table.insert(hold(1, "litigation"), &snapshot(5, &[])).unwrap();

        assert!(table.get(&HoldId(1), &snapshot(5, &[])).is_some());
        // tx 6 started while 5 was still running
        assert!(table.get(&HoldId(1), &snapshot(6, &[5])).is_none());
        // tx 7 started after 5 committed
        assert!(table.get(&HoldId(1), &snapshot(7, &[])).is_some());
    }

    #[test]
    fn test_update_creates_new_version() {
        let mut table = Table::<LegalHold>::new();
        table.put_committed(hold(1, "litigation"));

        let writer = snapshot(10, &[]);
        let old = table.update(hold(1, "audit"), &writer).unwrap().unwrap();
        assert_eq!(old.hold_reason, "litigation");

        let concurrent = snapshot(11, &[10]);
        assert_eq!(
            table.get(&HoldId(1), &concurrent).unwrap().hold_reason,
            "litigation"
        );
        assert_eq!(table.get(&HoldId(1), &writer).unwrap().hold_reason, "audit");
    }

    #[test]
    fn test_concurrent_update_conflicts() {
        let mut table = Table::<LegalHold>::new();
        table.put_committed(hold(1, "litigation"));

        table.update(hold(1, "a"), &snapshot(10, &[])).unwrap();
        let err = table.update(hold(1, "b"), &snapshot(11, &[10])).unwrap_err();
        assert!(matches!(err, DbError::WriteConflict(_)));
    }

    #[test]
    fn test_undo_restores_previous_state() {
        let mut table = Table::<LegalHold>::new();
        table.put_committed(hold(1, "litigation"));

        let writer = snapshot(10, &[]);
        table.update(hold(1, "audit"), &writer).unwrap();
        table.insert(hold(2, "new"), &writer).unwrap();
        table.undo(&HoldId(1), 10);
        table.undo(&HoldId(2), 10);

        let reader = snapshot(20, &[]);
        assert_eq!(table.get(&HoldId(1), &reader).unwrap().hold_reason, "litigation");
        assert!(table.get(&HoldId(2), &reader).is_none());
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = Table::<LegalHold>::new();
        table.put_committed(hold(1, "litigation"));
        let err = table.insert(hold(1, "again"), &snapshot(3, &[])).unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
    }

    #[test]
    fn test_delete_then_reinsert() {
        let mut table = Table::<LegalHold>::new();
        table.put_committed(hold(1, "litigation"));

        table.delete(&HoldId(1), &snapshot(4, &[])).unwrap();
        assert!(table.get(&HoldId(1), &snapshot(5, &[])).is_none());

        table.insert(hold(1, "restored"), &snapshot(6, &[])).unwrap();
        assert_eq!(
            table.get(&HoldId(1), &snapshot(7, &[])).unwrap().hold_reason,
            "restored"
        );
    }
}
