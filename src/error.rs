//! Error types
//!
//! Per-resource failures are collected into a [`FailureList`] and surfaced
//! through exactly one [`TransactionError`] per commit/rollback. Pool,
//! scheduler and journal errors stay local to their callers.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::core_types::{Gtrid, Xid};
use crate::resource::ResourceState;
use crate::xa::{XaError, code_name};

// ============================================================================
// Per-resource failure
// ============================================================================

/// Protocol phase in which a resource call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Delist,
    Prepare,
    Commit,
    Rollback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Delist => "delist",
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        }
    }
}

/// Whether a failure carries the resource's own error or the coordinator's
/// heuristic reading of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// As reported by the resource
    Resource,
    /// Converted by the coordinator into a heuristic outcome
    Heuristic,
}

impl FailureKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FailureKind::Resource => "XaError",
            FailureKind::Heuristic => "HeuristicError",
        }
    }
}

/// One resource's failure within a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    /// Unique name of the resource
    pub resource: String,
    pub xid: Xid,
    pub phase: Phase,
    pub kind: FailureKind,
    /// XA code of the classification (the resource's code for
    /// [`FailureKind::Resource`], a heuristic code otherwise)
    pub code: i32,
    pub message: String,
}

impl ResourceFailure {
    /// Failure exactly as the resource reported it
    pub fn reported(resource: &str, xid: Xid, phase: Phase, error: &XaError) -> Self {
        Self {
            resource: resource.to_string(),
            xid,
            phase,
            kind: FailureKind::Resource,
            code: error.code,
            message: error.message.clone(),
        }
    }

    /// Failure reclassified as a heuristic outcome
    pub fn heuristic(resource: &str, xid: Xid, phase: Phase, code: i32, message: String) -> Self {
        Self {
            resource: resource.to_string(),
            xid,
            phase,
            kind: FailureKind::Heuristic,
            code,
            message,
        }
    }
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {}({}) - {}]",
            self.resource,
            self.kind.type_name(),
            code_name(self.code),
            self.message
        )
    }
}

/// Ordered list of per-resource failures, the cause of a [`TransactionError`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureList(pub Vec<ResourceFailure>);

impl FailureList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceFailure> {
        self.0.iter()
    }
}

impl fmt::Display for FailureList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collected {} exception(s):", self.0.len())?;
        for failure in &self.0 {
            write!(f, "\n {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureList {}

// ============================================================================
// Transaction outcome errors
// ============================================================================

/// Why a transaction was rolled back instead of committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// At least one resource failed to prepare
    PrepareFailed,
    /// A branch could not be ended before prepare
    DelistFailed,
    /// The transaction deadline expired
    Timeout,
    /// The application marked the transaction rollback-only
    RollbackOnly,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RollbackReason::PrepareFailed => "prepare failed",
            RollbackReason::DelistFailed => "delist failed",
            RollbackReason::Timeout => "timed out",
            RollbackReason::RollbackOnly => "marked rollback-only",
        })
    }
}

/// Shape of a partial resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialOutcome {
    /// Phase 1 failed somewhere and the rollback did not resolve everything
    PreparedRolledBack,
    /// Rollback without prepare left some resources unresolved
    RolledBack,
    /// Commit decision taken, some resources unresolved
    Committed,
}

impl PartialOutcome {
    pub fn summary(&self) -> &'static str {
        match self {
            PartialOutcome::PreparedRolledBack => {
                "partially prepared and only partially rolled back"
            }
            PartialOutcome::RolledBack => "only partially rolled back",
            PartialOutcome::Committed => "partially committed and only partially resolved",
        }
    }
}

/// Aggregate outcome error of a commit or rollback
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// Every resource resolved, but to rollback rather than the requested commit
    #[error("transaction {gtrid} rolled back: {reason}")]
    RolledBack {
        gtrid: Gtrid,
        reason: RollbackReason,
        #[source]
        failures: FailureList,
    },

    /// Some resources resolved, others are left in doubt
    #[error("transaction {}; some resources are left in doubt", .outcome.summary())]
    PartiallyResolved {
        gtrid: Gtrid,
        outcome: PartialOutcome,
        #[source]
        failures: FailureList,
    },

    /// No resource reached a definite outcome
    #[error("transaction {gtrid} outcome unknown; every resource is left in doubt")]
    HeuristicHazard {
        gtrid: Gtrid,
        #[source]
        failures: FailureList,
    },

    #[error("cannot {operation} transaction {gtrid} in status {status}")]
    InvalidStatus {
        gtrid: Gtrid,
        status: crate::status::TransactionStatus,
        operation: &'static str,
    },

    #[error("cannot enlist {resource} in transaction {gtrid}")]
    Enlist {
        gtrid: Gtrid,
        resource: String,
        #[source]
        source: XaError,
    },
}

impl TransactionError {
    pub fn gtrid(&self) -> Gtrid {
        match self {
            TransactionError::RolledBack { gtrid, .. }
            | TransactionError::PartiallyResolved { gtrid, .. }
            | TransactionError::HeuristicHazard { gtrid, .. }
            | TransactionError::InvalidStatus { gtrid, .. }
            | TransactionError::Enlist { gtrid, .. } => *gtrid,
        }
    }

    /// Per-resource failures carried by this error (empty for status errors)
    pub fn failures(&self) -> &[ResourceFailure] {
        match self {
            TransactionError::RolledBack { failures, .. }
            | TransactionError::PartiallyResolved { failures, .. }
            | TransactionError::HeuristicHazard { failures, .. } => failures.0.as_slice(),
            _ => &[],
        }
    }
}

// ============================================================================
// Pool errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("resource pool {name} exhausted after waiting {waited_ms} ms")]
    Exhausted { name: String, waited_ms: u64 },

    #[error("test query failed on a connection of {name}")]
    TestFailed {
        name: String,
        #[source]
        source: XaError,
    },

    #[error("cannot open a connection to {name}")]
    Open {
        name: String,
        #[source]
        source: XaError,
    },

    #[error("resource pool {0} is closed")]
    Closed(String),

    #[error("illegal transition of pooled resource {id} from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: ResourceState,
        to: ResourceState,
    },

    #[error("pooled resource {id} is already transitioning")]
    ReentrantTransition { id: u64 },

    #[error("transition of pooled resource {id} from {from} to {to} vetoed: {reason}")]
    Vetoed {
        id: u64,
        from: ResourceState,
        to: ResourceState,
        reason: String,
    },
}

// ============================================================================
// Scheduler errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("task scheduler is stopped")]
    Stopped,
}

// ============================================================================
// Journal errors
// ============================================================================

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("journal codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("journal corrupted at seq {seq}: {reason}")]
    Corrupted { seq: u64, reason: String },

    #[error("journal is closed")]
    Closed,
}

// ============================================================================
// Top-level error
// ============================================================================

#[derive(Debug, Error)]
pub enum TmError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("resource error: {0}")]
    Resource(#[from] XaError),

    #[error("resource {0} is already registered")]
    DuplicateResource(String),

    #[error("transaction manager is shut down")]
    ShutDown,
}

impl TmError {
    /// Stable error code for logs and operator tooling
    pub fn code(&self) -> &'static str {
        match self {
            TmError::Config(_) => "CONFIG_ERROR",
            TmError::Transaction(TransactionError::RolledBack { .. }) => "ROLLED_BACK",
            TmError::Transaction(TransactionError::PartiallyResolved { .. }) => {
                "PARTIALLY_RESOLVED"
            }
            TmError::Transaction(TransactionError::HeuristicHazard { .. }) => "HEURISTIC_HAZARD",
            TmError::Transaction(TransactionError::InvalidStatus { .. }) => "INVALID_STATUS",
            TmError::Transaction(TransactionError::Enlist { .. }) => "ENLIST_FAILED",
            TmError::Pool(PoolError::Exhausted { .. }) => "POOL_EXHAUSTED",
            TmError::Pool(PoolError::TestFailed { .. }) => "TEST_FAILED",
            TmError::Pool(PoolError::Closed(_)) => "POOL_CLOSED",
            TmError::Pool(_) => "POOL_ERROR",
            TmError::Scheduler(_) => "SCHEDULER_STOPPED",
            TmError::Journal(_) => "JOURNAL_ERROR",
            TmError::Resource(_) => "RESOURCE_ERROR",
            TmError::DuplicateResource(_) => "DUPLICATE_RESOURCE",
            TmError::ShutDown => "SHUT_DOWN",
        }
    }
}
