//! Transaction Journal
//!
//! Append-only log of transaction status transitions. The coordinator writes
//! one record per transition; the recovery manager reads back the transactions
//! that never reached a terminal status.
//!
//! # Implementations
//!
//! - [`MemoryJournal`] - in-process record list
//! - [`DiskJournal`] - CRC-framed bincode records in a single file

pub mod disk;

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{JournalConfig, JournalKind};
use crate::core_types::{Gtrid, SeqNum, now_ms};
use crate::error::JournalError;
use crate::status::{Decision, TransactionStatus};

pub use disk::DiskJournal;

/// Journal collaborator used by the coordinator and the recovery manager
pub trait Journal: Send + Sync {
    /// Append a status transition, returning its sequence number
    fn log(
        &self,
        gtrid: Gtrid,
        status: TransactionStatus,
        resources: &[String],
    ) -> Result<SeqNum, JournalError>;

    /// Transactions whose last logged status is not terminal
    fn collect_dangling_records(&self) -> Result<FxHashMap<Gtrid, DanglingRecord>, JournalError>;

    fn close(&self) -> Result<(), JournalError>;
}

/// One logged status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub sequence: SeqNum,
    pub gtrid: Gtrid,
    pub status: TransactionStatus,
    /// Unique names of the resources involved
    pub resources: Vec<String>,
    pub timestamp_ms: u64,
}

impl JournalRecord {
    pub fn new(sequence: SeqNum, gtrid: Gtrid, status: TransactionStatus, resources: &[String]) -> Self {
        Self {
            sequence,
            gtrid,
            status,
            resources: resources.to_vec(),
            timestamp_ms: now_ms(),
        }
    }
}

/// A transaction the journal has not seen terminate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingRecord {
    pub gtrid: Gtrid,
    pub last_status: TransactionStatus,
    /// Phase-2 decision logged for this transaction, if any
    pub decision: Option<Decision>,
    /// Every resource named by any record of this transaction
    pub resources: Vec<String>,
    /// Sequence of the last record
    pub sequence: SeqNum,
}

/// Folds records into the dangling set, shared by both implementations
#[derive(Debug, Default)]
pub(crate) struct DanglingTracker {
    records: FxHashMap<Gtrid, DanglingRecord>,
}

impl DanglingTracker {
    pub(crate) fn apply(&mut self, record: &JournalRecord) {
        if record.status.is_terminal() {
            self.records.remove(&record.gtrid);
            return;
        }

        let entry = self
            .records
            .entry(record.gtrid)
            .or_insert_with(|| DanglingRecord {
                gtrid: record.gtrid,
                last_status: record.status,
                decision: None,
                resources: Vec::new(),
                sequence: record.sequence,
            });

        entry.last_status = record.status;
        entry.sequence = record.sequence;
        if record.status.is_commit_decision() {
            entry.decision = Some(Decision::Commit);
        } else if record.status.is_rollback_decision() {
            entry.decision = Some(Decision::Rollback);
        }
        for name in &record.resources {
            if !entry.resources.contains(name) {
                entry.resources.push(name.clone());
            }
        }
    }

    pub(crate) fn contains(&self, gtrid: Gtrid) -> bool {
        self.records.contains_key(&gtrid)
    }

    pub(crate) fn snapshot(&self) -> FxHashMap<Gtrid, DanglingRecord> {
        self.records.clone()
    }
}

// ============================================================================
// In-memory journal
// ============================================================================

#[derive(Default)]
struct MemoryState {
    records: Vec<JournalRecord>,
    dangling: DanglingTracker,
    next_seq: SeqNum,
    closed: bool,
}

/// Journal kept in process memory; lost on exit
#[derive(Default)]
pub struct MemoryJournal {
    state: Mutex<MemoryState>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every record logged so far, in sequence order
    pub fn records(&self) -> Vec<JournalRecord> {
        self.lock().records.clone()
    }

    /// Statuses logged for one transaction, in order
    pub fn statuses(&self, gtrid: Gtrid) -> Vec<TransactionStatus> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.gtrid == gtrid)
            .map(|r| r.status)
            .collect()
    }
}

impl Journal for MemoryJournal {
    fn log(
        &self,
        gtrid: Gtrid,
        status: TransactionStatus,
        resources: &[String],
    ) -> Result<SeqNum, JournalError> {
        let mut state = self.lock();
        if state.closed {
            return Err(JournalError::Closed);
        }

        state.next_seq += 1;
        let record = JournalRecord::new(state.next_seq, gtrid, status, resources);
        debug!(gtrid = %gtrid, status = %status, seq = record.sequence, "Journal record");
        state.dangling.apply(&record);
        state.records.push(record);
        Ok(state.next_seq)
    }

    fn collect_dangling_records(&self) -> Result<FxHashMap<Gtrid, DanglingRecord>, JournalError> {
        Ok(self.lock().dangling.snapshot())
    }

    fn close(&self) -> Result<(), JournalError> {
        self.lock().closed = true;
        Ok(())
    }
}

/// Open the journal described by `config`
pub fn open_journal(config: &JournalConfig) -> Result<Arc<dyn Journal>, JournalError> {
    Ok(match config.kind {
        JournalKind::Memory => Arc::new(MemoryJournal::new()),
        JournalKind::Disk => Arc::new(
            DiskJournal::open(&config.path, config.force_sync)?
                .with_compaction_threshold(config.compact_threshold_bytes),
        ),
    })
}
