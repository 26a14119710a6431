//! Transaction Status Definitions
//!
//! Status IDs follow the JTA numbering so journal files stay readable by
//! tools that speak it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction lifecycle status
///
/// Terminal statuses: COMMITTED (3), ROLLEDBACK (4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Branches may be enlisted
    Active = 0,

    /// Only rollback is possible from here
    MarkedRollback = 1,

    /// Every branch voted, decision not yet taken
    Prepared = 2,

    /// Terminal: every branch committed
    Committed = 3,

    /// Terminal: every branch rolled back
    RolledBack = 4,

    /// At least one branch is in doubt
    Unknown = 5,

    NoTransaction = 6,

    /// Phase 1 in progress
    Preparing = 7,

    /// Commit decision taken, phase 2 in progress
    Committing = 8,

    /// Rollback decision taken, phase 2 in progress
    RollingBack = 9,
}

impl TransactionStatus {
    /// Check if this is a terminal status (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack
        )
    }

    /// Records at or beyond PREPARING must survive a crash once logged
    #[inline]
    pub fn requires_durability(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Preparing
                | TransactionStatus::Prepared
                | TransactionStatus::Committing
                | TransactionStatus::Committed
                | TransactionStatus::RollingBack
                | TransactionStatus::RolledBack
                | TransactionStatus::Unknown
        )
    }

    /// Whether logging this status means the commit decision was taken
    #[inline]
    pub fn is_commit_decision(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committing | TransactionStatus::Committed
        )
    }

    #[inline]
    pub fn is_rollback_decision(&self) -> bool {
        matches!(
            self,
            TransactionStatus::RollingBack | TransactionStatus::RolledBack
        )
    }

    /// Get the numeric status ID for journal storage
    #[inline]
    pub fn id(&self) -> u8 {
        *self as u8
    }

    /// Convert from journal status ID
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(TransactionStatus::Active),
            1 => Some(TransactionStatus::MarkedRollback),
            2 => Some(TransactionStatus::Prepared),
            3 => Some(TransactionStatus::Committed),
            4 => Some(TransactionStatus::RolledBack),
            5 => Some(TransactionStatus::Unknown),
            6 => Some(TransactionStatus::NoTransaction),
            7 => Some(TransactionStatus::Preparing),
            8 => Some(TransactionStatus::Committing),
            9 => Some(TransactionStatus::RollingBack),
            _ => None,
        }
    }

    /// Get human-readable status name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::MarkedRollback => "MARKED_ROLLBACK",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLEDBACK",
            TransactionStatus::Unknown => "UNKNOWN",
            TransactionStatus::NoTransaction => "NO_TRANSACTION",
            TransactionStatus::Preparing => "PREPARING",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::RollingBack => "ROLLING_BACK",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        TransactionStatus::from_id(value).ok_or(())
    }
}

/// Phase-2 decision for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Rollback,
}

impl Decision {
    /// Status journaled before phase 2 starts
    pub fn in_progress_status(&self) -> TransactionStatus {
        match self {
            Decision::Commit => TransactionStatus::Committing,
            Decision::Rollback => TransactionStatus::RollingBack,
        }
    }

    /// Status journaled once every branch resolved
    pub fn terminal_status(&self) -> TransactionStatus {
        match self {
            Decision::Commit => TransactionStatus::Committed,
            Decision::Rollback => TransactionStatus::RolledBack,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Decision::Commit => "commit",
            Decision::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());

        assert!(!TransactionStatus::Active.is_terminal());
        assert!(!TransactionStatus::Preparing.is_terminal());
        assert!(!TransactionStatus::Unknown.is_terminal());
        assert!(!TransactionStatus::Committing.is_terminal());
    }

    #[test]
    fn test_durability_threshold() {
        assert!(!TransactionStatus::Active.requires_durability());
        assert!(!TransactionStatus::MarkedRollback.requires_durability());
        assert!(TransactionStatus::Preparing.requires_durability());
        assert!(TransactionStatus::Unknown.requires_durability());
        assert!(TransactionStatus::Committed.requires_durability());
    }

    #[test]
    fn test_status_id_roundtrip() {
        for id in 0..=9u8 {
            let status = TransactionStatus::from_id(id).unwrap();
            assert_eq!(status.id(), id);
        }
        assert!(TransactionStatus::from_id(10).is_none());
        assert!(TransactionStatus::try_from(200).is_err());
    }

    #[test]
    fn test_decision_statuses() {
        assert_eq!(
            Decision::Commit.in_progress_status(),
            TransactionStatus::Committing
        );
        assert_eq!(
            Decision::Rollback.terminal_status(),
            TransactionStatus::RolledBack
        );
        assert!(Decision::Commit.in_progress_status().is_commit_decision());
        assert!(Decision::Rollback.in_progress_status().is_rollback_decision());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionStatus::RolledBack.to_string(), "ROLLEDBACK");
        assert_eq!(TransactionStatus::RollingBack.to_string(), "ROLLING_BACK");
        assert_eq!(TransactionStatus::Unknown.to_string(), "UNKNOWN");
    }
}
