pub mod memory;
pub mod persistence;
pub mod table;

pub use memory::{InMemoryStorage, Sequence, SequenceValues};
pub use persistence::{DurabilityMode, PersistenceManager, RecoveredState, WalEntry};
pub use table::{Row, Table, TableHandle};
