//! Migration status reporting

use crate::migration::record::{HistoryRecord, LockRecord};
use crate::migration::ChangeKey;

/// An applied changeset whose current checksum differs from the stored one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDrift {
    pub key: ChangeKey,
    pub stored: String,
    pub current: String,
}

/// A changeset from the changelog that has no history record yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub key: ChangeKey,
    pub sequence_index: i64,
    pub checksum: String,
}

/// Migration status information
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    /// History records that match a changelog entry, in execution order
    pub applied: Vec<HistoryRecord>,

    /// Changelog entries not yet applied, in apply order
    pub pending: Vec<PendingChange>,

    /// Applied entries edited since they ran
    pub drifted: Vec<ChecksumDrift>,

    /// History records with no matching changelog entry
    pub unknown: Vec<HistoryRecord>,

    /// Current lock holder
    pub lock: Option<LockRecord>,
}

impl MigrationStatus {
    /// Check if all changesets are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// The most recently applied record
    #[must_use]
    pub fn latest_applied(&self) -> Option<&HistoryRecord> {
        self.applied.iter().max_by_key(|r| r.execution_order)
    }

    /// The next changeset a run would apply
    #[must_use]
    pub fn next_pending(&self) -> Option<&PendingChange> {
        self.pending.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::record::ExecType;
    use chrono::Utc;

    fn record(id: &str, order: i64) -> HistoryRecord {
        HistoryRecord {
            key: ChangeKey::new(id, "x"),
            checksum: "c".to_string(),
            applied_at: Utc::now(),
            execution_order: order,
            exec_type: ExecType::Executed,
        }
    }

    #[test]
    fn test_status_accessors() {
        let status = MigrationStatus {
            applied: vec![record("a", 1), record("b", 2)],
            pending: vec![PendingChange {
                key: ChangeKey::new("c", "x"),
                sequence_index: 3,
                checksum: "c".to_string(),
            }],
            ..MigrationStatus::default()
        };
        assert!(!status.is_up_to_date());
        assert_eq!(status.latest_applied().unwrap().key.id, "b");
        assert_eq!(status.next_pending().unwrap().sequence_index, 3);
        assert!(MigrationStatus::default().is_up_to_date());
    }
}
