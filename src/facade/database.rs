use crate::config::StoreConfig;
use crate::core::{Result, Snapshot, UserId};
use crate::storage::{InMemoryStorage, PersistenceManager, Row};
use crate::transaction::{LockManager, Transaction, TransactionManager, TransactionStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The embedded transactional store.
///
/// Owns the tables, the transaction manager, the per-user lock table and the
/// optional WAL. Shared as `Arc<Database>`; every transaction keeps a
/// reference to it.
pub struct Database {
    storage: InMemoryStorage,
    transaction_manager: TransactionManager,
    locks: LockManager,
    /// WAL and snapshots; `None` when running purely in memory
    persistence: Option<Mutex<PersistenceManager>>,
    config: StoreConfig,
}

impl Database {
    /// A purely in-memory store with default settings.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::with_parts(StoreConfig::default(), None))
    }

    fn with_parts(config: StoreConfig, persistence: Option<PersistenceManager>) -> Self {
        Self {
            storage: InMemoryStorage::new(),
            transaction_manager: TransactionManager::new(),
            locks: LockManager::new(),
            persistence: persistence.map(Mutex::new),
            config,
        }
    }

    /// Open a store, recovering snapshot + WAL from `config.data_dir` when
    /// persistence is enabled.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use retentiondb::{Database, StoreConfig};
    ///
    /// # tokio_test::block_on(async {
    /// let db = Database::open(StoreConfig::new().data_dir("./data")).await.unwrap();
    /// db.checkpoint().await.unwrap();
    /// # });
    /// ```
    pub async fn open(config: StoreConfig) -> Result<Arc<Self>> {
        let persistence = match &config.data_dir {
            Some(dir) if config.is_persistent() => {
                let mut manager = PersistenceManager::new(dir, config.durability)?;
                manager
                    .wal_mut()
                    .set_checkpoint_threshold(config.checkpoint_threshold);
                Some(manager)
            }
            _ => None,
        };

        let recovered = match &persistence {
            Some(manager) => manager.recover()?,
            None => None,
        };

        let db = Arc::new(Self::with_parts(config, persistence));
        if let Some(state) = recovered {
            let commits = state.commits.len();
            db.storage.restore(state.records, state.sequences).await;
            for changes in &state.commits {
                for change in changes {
                    db.storage.apply_committed(change).await;
                }
            }
            info!(replayed_commits = commits, "database recovered from persistence");
            if commits > 0 {
                db.checkpoint().await?;
            }
        }
        Ok(db)
    }

    /// Begin a transaction without user locks.
    pub async fn begin(self: &Arc<Self>) -> Result<Transaction> {
        self.begin_locked(Vec::new()).await
    }

    /// Lock every user in `users` (in id order), then begin. The snapshot is
    /// taken after the locks are held, so it sees everything committed by
    /// the previous holders.
    pub async fn begin_locked(self: &Arc<Self>, mut users: Vec<UserId>) -> Result<Transaction> {
        users.sort_unstable();
        users.dedup();

        let mut guards = Vec::with_capacity(users.len());
        for user_id in users {
            let guard = self.locks.acquire(user_id, self.config.lock_timeout).await?;
            guards.push((user_id, guard));
        }

        let (id, snapshot) = self.transaction_manager.begin().await?;
        debug!(txn = %id, locks = guards.len(), "transaction started");
        Ok(Transaction::new(Arc::clone(self), id, snapshot, guards))
    }

    /// Snapshot of everything committed so far.
    pub async fn read_snapshot(&self) -> Snapshot {
        self.transaction_manager.read_snapshot().await
    }

    /// Committed rows of `R` matching `predicate`, outside any transaction.
    pub async fn read<R, F>(&self, predicate: F) -> Vec<R>
    where
        R: Row,
        F: Fn(&R) -> bool,
    {
        let snapshot = self.read_snapshot().await;
        let table = self.storage.table::<R>().read().await;
        table.scan_filter(&snapshot, predicate)
    }

    pub async fn get<R: Row>(&self, key: &R::Key) -> Option<R> {
        let snapshot = self.read_snapshot().await;
        let table = self.storage.table::<R>().read().await;
        table.get(key, &snapshot)
    }

    /// Fold the WAL into a fresh snapshot.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let mut guard = persistence.lock().await;
        self.write_checkpoint(&mut guard).await
    }

    pub(crate) async fn maybe_checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let mut guard = persistence.lock().await;
        if guard.needs_checkpoint() {
            self.write_checkpoint(&mut guard).await?;
        }
        Ok(())
    }

    // Caller holds the persistence lock, so no commit is half-applied.
    async fn write_checkpoint(&self, persistence: &mut PersistenceManager) -> Result<()> {
        let snapshot = self.read_snapshot().await;
        let records = self.storage.dump(&snapshot).await;
        persistence.checkpoint(records, self.storage.sequence_values())
    }

    pub fn is_persistence_enabled(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.config.statement_timeout
    }

    pub async fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            tables: self.storage.row_counts().await,
            active_transactions: self.transaction_manager.active_count().await,
            transactions: self.transaction_manager.stats(),
        }
    }

    pub(crate) fn storage(&self) -> &InMemoryStorage {
        &self.storage
    }

    pub(crate) fn transaction_manager(&self) -> &TransactionManager {
        &self.transaction_manager
    }

    pub(crate) fn persistence(&self) -> Option<&Mutex<PersistenceManager>> {
        self.persistence.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Logical rows per table, including versions not yet committed
    pub tables: Vec<(&'static str, usize)>,
    pub active_transactions: usize,
    pub transactions: TransactionStats,
}

impl std::fmt::Display for DatabaseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows: usize = self.tables.iter().map(|(_, count)| count).sum();
        write!(
            f,
            "{} tables, {} rows, {} active transactions ({} committed, {} aborted)",
            self.tables.len(),
            rows,
            self.active_transactions,
            self.transactions.committed,
            self.transactions.aborted
        )
    }
}
