// ============================================================================
// Transaction State Management
// ============================================================================
//
// Implements the State Pattern for transaction lifecycle management.
// Each transaction moves through defined states: Active -> Committed/Aborted
//
// Uses MVCC (Multi-Version Concurrency Control) with snapshot isolation:
// - Each transaction sees a consistent snapshot taken at BEGIN
// - Writes stay invisible to others until COMMIT
// - Rolled back writes are physically undone before the id leaves the
//   active set, so no reader ever observes them
//
// ============================================================================

use crate::core::{DbError, Result, Snapshot};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction ID counter. 0 is reserved for bootstrap rows.
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub(crate) fn allocate() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn next_raw() -> u64 {
        NEXT_TXN_ID.load(Ordering::SeqCst)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state following the State Pattern
///
/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can execute operations
    Active,

    /// Transaction has been successfully committed
    Committed,

    /// Transaction has been aborted/rolled back
    Aborted,
}

impl TransactionState {
    /// Check if transaction can execute operations
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Bookkeeping the manager keeps for a running transaction.
#[derive(Debug)]
pub struct TransactionEntry {
    id: TransactionId,
    state: TransactionState,
    snapshot: Snapshot,
    start_time: std::time::Instant,
}

impl TransactionEntry {
    pub fn new(id: TransactionId, snapshot: Snapshot) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            snapshot,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Mark transaction as committed
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn commit(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::Storage(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Mark transaction as aborted
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::Storage(format!(
                "Cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
