// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Implements the Command Pattern for reversible row operations.
// Each Change is recorded while the transaction runs, written to the WAL on
// COMMIT and undone (newest first) on ROLLBACK.
//
// ============================================================================

use crate::core::Record;
use serde::{Deserialize, Serialize};

/// Represents a single reversible change in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Insert a new row
    Insert(Record),

    /// Replace an existing row (same key)
    Update { old: Record, new: Record },

    /// Delete an existing row
    Delete(Record),
}

impl Change {
    /// The row whose key this change touches. For updates this is the new
    /// image, which is also what recovery installs.
    pub fn record(&self) -> &Record {
        match self {
            Change::Insert(record) => record,
            Change::Update { new, .. } => new,
            Change::Delete(record) => record,
        }
    }

    /// Get the table name affected by this change
    pub fn table_name(&self) -> &'static str {
        self.record().table_name()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HoldId, LegalHold, UserId};
    use chrono::Utc;

    fn hold(reason: &str) -> Record {
        Record::Hold(LegalHold {
            hold_id: HoldId(1),
            user_id: UserId(1),
            hold_reason: reason.to_string(),
            created_at: Utc::now(),
            released_at: None,
        })
    }

    #[test]
    fn test_change_table_name() {
        let change = Change::Insert(hold("litigation"));
        assert_eq!(change.table_name(), "legal_holds");
    }

    #[test]
    fn test_update_exposes_new_image() {
        let change = Change::Update {
            old: hold("before"),
            new: hold("after"),
        };
        match change.record() {
            Record::Hold(row) => assert_eq!(row.hold_reason, "after"),
            other => panic!("unexpected record {other:?}"),
        }
        assert!(!change.is_delete());
    }
}
