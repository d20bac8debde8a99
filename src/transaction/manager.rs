// ============================================================================
// Transaction Manager
// ============================================================================

use super::{TransactionEntry, TransactionId, TransactionState};
use crate::core::{DbError, Result, Snapshot};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

pub struct TransactionManager {
    // Stores full transaction state.
    transactions: RwLock<HashMap<TransactionId, TransactionEntry>>,

    // Active transaction IDs, copy-on-write so snapshots share the set.
    // Id allocation happens under the write lock: a snapshot can never see
    // an id below its horizon that is neither active nor finished.
    active_ids: RwLock<Arc<HashSet<u64>>>,

    committed: AtomicU64,
    aborted: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            active_ids: RwLock::new(Arc::new(HashSet::new())),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Start a transaction and take its snapshot.
    pub async fn begin(&self) -> Result<(TransactionId, Snapshot)> {
        let (transaction_id, snapshot) = {
            let mut active_lock = self.active_ids.write().await;
            let transaction_id = TransactionId::allocate();
            let snapshot = Snapshot {
                tx_id: transaction_id.0,
                active: Arc::clone(&active_lock),
                max_tx_id: transaction_id.0,
            };

            let mut new_set = (**active_lock).clone();
            new_set.insert(transaction_id.0);
            *active_lock = Arc::new(new_set);
            (transaction_id, snapshot)
        };

        let mut transactions = self.transactions.write().await;
        transactions.insert(
            transaction_id,
            TransactionEntry::new(transaction_id, snapshot.clone()),
        );

        Ok((transaction_id, snapshot))
    }

    /// Snapshot for a read that runs outside any transaction.
    pub async fn read_snapshot(&self) -> Snapshot {
        let active = self.active_ids.read().await;
        Snapshot {
            // Never allocated, so no version is "our own".
            tx_id: u64::MAX,
            active: Arc::clone(&active),
            max_tx_id: TransactionId::next_raw(),
        }
    }

    /// Make the transaction's writes visible to snapshots taken from now on.
    pub async fn commit(&self, txn_id: TransactionId) -> Result<()> {
        self.finish(txn_id, TransactionState::Committed).await?;
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forget an aborted transaction. Its writes must already be undone.
    pub async fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        self.finish(txn_id, TransactionState::Aborted).await?;
        self.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn finish(&self, txn_id: TransactionId, outcome: TransactionState) -> Result<()> {
        {
            let mut transactions = self.transactions.write().await;
            let transaction = transactions.get_mut(&txn_id).ok_or_else(|| {
                DbError::Storage(format!("Transaction {} not found", txn_id))
            })?;
            match outcome {
                TransactionState::Committed => transaction.commit()?,
                _ => transaction.rollback()?,
            }
            transactions.remove(&txn_id);
        }

        // Update active cache (COW)
        let mut active_lock = self.active_ids.write().await;
        if active_lock.contains(&txn_id.0) {
            let mut new_set = (**active_lock).clone();
            new_set.remove(&txn_id.0);
            *active_lock = Arc::new(new_set);
        }
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.active_ids.read().await.len()
    }

    pub async fn get_transaction_info(&self, txn_id: TransactionId) -> Option<TransactionInfo> {
        let transactions = self.transactions.read().await;
        transactions.get(&txn_id).map(|txn| TransactionInfo {
            id: txn.id(),
            state: txn.state(),
            read_version: txn.snapshot().max_tx_id,
            duration: txn.duration(),
        })
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    pub read_version: u64,
    pub duration: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    pub committed: u64,
    pub aborted: u64,
}
