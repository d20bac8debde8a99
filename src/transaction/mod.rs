// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Implements ACID transactions with Snapshot Isolation using MVCC
// (Multi-Version Concurrency Control)
//
// Design Patterns Used:
// - State Pattern: Transaction state management (Active, Committed, Aborted)
// - Command Pattern: Reversible operations for rollback
// - Copy-on-Write: Snapshot isolation
//
// Writers that must serialize per user additionally take a user lock before
// their snapshot is taken (see `lock`).
//
// ============================================================================

pub mod change;
pub mod handle;
pub mod lock;
pub mod manager;
pub mod state;

pub use change::Change;
pub use handle::Transaction;
pub use lock::{LockManager, UserLockGuard};
pub use manager::{TransactionInfo, TransactionManager, TransactionStats};
pub use state::{TransactionEntry, TransactionId, TransactionState};
