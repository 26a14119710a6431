//! XA transaction coordinator
//!
//! Two-phase commit over pooled XA resources, with a status journal, background
//! retries of failed phase-2 calls and crash recovery.
//!
//! # Modules
//!
//! - [`core_types`] - Gtrid / Xid identifiers and the gtrid generator
//! - [`xa`] - XA return codes, flags and error classification
//! - [`status`] - Transaction status and phase-2 decision
//! - [`scheduler`] - Timeline of deferred tasks (timeouts, retries, maintenance)
//! - [`journal`] - Status journal, in memory or on disk
//! - [`resource`] - Driver boundary, pooled connections and pools
//! - [`coordinator`] - Transactions and the two-phase commit engine
//! - [`recovery`] - Resolution of in-doubt branches left on the resources
//! - [`manager`] - Services context and the application-facing API
//! - [`management`] - Read-only view of every pooled connection

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod error;
pub mod logging;
pub mod status;
pub mod xa;

pub mod coordinator;
pub mod journal;
pub mod management;
pub mod manager;
pub mod recovery;
pub mod resource;
pub mod scheduler;

// Convenient re-exports at crate root
pub use config::{AppConfig, CoordinatorConfig, JournalConfig, JournalKind, PoolConfig};
pub use coordinator::{BranchOutcome, Transaction, TransactionCoordinator};
pub use core_types::{Gtrid, SeqNum, ServerId, UidGenerator, Xid};
pub use error::{
    FailureKind, FailureList, JournalError, PartialOutcome, Phase, PoolError, ResourceFailure,
    RollbackReason, SchedulerError, TmError, TransactionError,
};
pub use journal::{DanglingRecord, DiskJournal, Journal, JournalRecord, MemoryJournal};
pub use management::{ManagementRegistry, ResourceSnapshot};
pub use manager::{Services, TransactionManager};
pub use recovery::{RecoveredBranch, RecoveryManager, RecoveryReport};
pub use resource::{
    PooledResource, ResourceHolder, ResourcePool, ResourceState, XaResource, XaResourceFactory,
};
pub use scheduler::{Task, TaskHandle, TaskScheduler};
pub use status::{Decision, TransactionStatus};
pub use xa::{EndFlag, StartFlag, Vote, XaError, XaResult};
