//! Transaction
//!
//! Branches in enlistment order plus the status, behind one async mutex.
//! Enlistment, both phases and the timeout task all take that mutex, so at
//! most one of them works on a gtrid at any time.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core_types::{Gtrid, Xid};
use crate::error::TransactionError;
use crate::journal::Journal;
use crate::resource::{HolderState, ResourceHolder};
use crate::scheduler::TaskHandle;
use crate::status::TransactionStatus;
use crate::xa::{EndFlag, StartFlag, XaResult};

/// Where one branch stands in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Enlisted, not prepared
    Pending,
    /// Voted XA_OK, waiting for the decision
    Prepared,
    /// Voted XA_RDONLY; no phase 2
    ReadOnly,
    /// The resource rolled the branch back during prepare
    Aborted,
    Committed,
    RolledBack,
    /// Outcome unknown to the coordinator
    InDoubt,
}

impl BranchOutcome {
    /// Whether the branch reached an outcome the coordinator knows
    pub fn is_definite(&self) -> bool {
        matches!(
            self,
            BranchOutcome::ReadOnly
                | BranchOutcome::Aborted
                | BranchOutcome::Committed
                | BranchOutcome::RolledBack
        )
    }
}

pub(crate) struct Branch {
    pub state: Arc<HolderState>,
    pub outcome: BranchOutcome,
    /// Voted in phase 1, whatever happened afterwards
    pub voted: bool,
}

impl Branch {
    pub fn xid(&self) -> Xid {
        self.state.xid()
    }

    pub fn unique_name(&self) -> &str {
        self.state.unique_name()
    }
}

pub(crate) struct TxState {
    pub branches: Vec<Branch>,
    next_bqual: u32,
    pub timed_out: bool,
    /// Outcome of the rollback run by the timeout task
    pub timeout_outcome: Option<TransactionError>,
}

impl TxState {
    /// Unique names of the enlisted resources, in enlistment order, deduplicated
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for branch in &self.branches {
            if !names.iter().any(|n| n == branch.unique_name()) {
                names.push(branch.unique_name().to_string());
            }
        }
        names
    }
}

/// One global transaction
pub struct Transaction {
    gtrid: Gtrid,
    timeout: Duration,
    deadline: Instant,
    created_at: DateTime<Utc>,
    journal: Arc<dyn Journal>,
    /// Written only while `state` is locked
    status: AtomicU8,
    state: tokio::sync::Mutex<TxState>,
    timeout_task: Mutex<Option<TaskHandle>>,
    self_ref: Weak<Transaction>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("gtrid", &self.gtrid)
            .field("status", &self.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Transaction {
    pub fn new(gtrid: Gtrid, timeout: Duration, journal: Arc<dyn Journal>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            gtrid,
            timeout,
            deadline: Instant::now() + timeout,
            created_at: Utc::now(),
            journal,
            status: AtomicU8::new(TransactionStatus::Active.id()),
            state: tokio::sync::Mutex::new(TxState {
                branches: Vec::new(),
                next_bqual: 1,
                timed_out: false,
                timeout_outcome: None,
            }),
            timeout_task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn gtrid(&self) -> Gtrid {
        self.gtrid
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_id(self.status.load(Ordering::SeqCst))
            .unwrap_or(TransactionStatus::Unknown)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn is_timed_out(&self) -> bool {
        self.state.lock().await.timed_out
    }

    pub async fn branch_count(&self) -> usize {
        self.state.lock().await.branches.len()
    }

    pub async fn resource_names(&self) -> Vec<String> {
        self.state.lock().await.resource_names()
    }

    /// Outcome of every branch, in enlistment order
    pub async fn branch_outcomes(&self) -> Vec<(Xid, BranchOutcome)> {
        self.state
            .lock()
            .await
            .branches
            .iter()
            .map(|b| (b.xid(), b.outcome))
            .collect()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().await
    }

    /// Must be called with the state lock held
    pub(crate) fn set_status(&self, _guard: &mut TxState, status: TransactionStatus) {
        let previous = self.status.swap(status.id(), Ordering::SeqCst);
        if previous != status.id() {
            debug!(gtrid = %self.gtrid, status = %status, "Transaction status changed");
        }
    }

    /// Journal `status` for this transaction; failures are logged, never raised
    pub(crate) fn journal(&self, status: TransactionStatus, resources: &[String]) {
        if let Err(e) = self.journal.log(self.gtrid, status, resources) {
            warn!(gtrid = %self.gtrid, status = %status, error = %e, "Journal write failed");
        }
    }

    pub(crate) fn set_timeout_task(&self, handle: TaskHandle) {
        *self.timeout_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub(crate) fn take_timeout_task(&self) -> Option<TaskHandle> {
        self.timeout_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // ========================================================================
    // Enlistment
    // ========================================================================

    /// Enlist `holder`, returning the branch it works on.
    ///
    /// A holder still attached to a branch of this transaction re-joins or
    /// resumes it; any other holder gets a new branch started with no flags.
    pub async fn enlist(&self, holder: Arc<dyn ResourceHolder>) -> Result<Xid, TransactionError> {
        let mut state = self.state.lock().await;
        let status = self.status();
        if status != TransactionStatus::Active {
            return Err(TransactionError::InvalidStatus {
                gtrid: self.gtrid,
                status,
                operation: "enlist a resource in",
            });
        }

        if let Some(xid) = holder.branch_id()
            && xid.gtrid == self.gtrid
            && let Some(branch) = state.branches.iter().find(|b| b.xid() == xid)
        {
            let flags = branch.state.flags();
            if flags.is_participating() {
                return Ok(xid);
            }
            let flag = if flags.suspended {
                StartFlag::Resume
            } else {
                StartFlag::Join
            };
            branch
                .state
                .start(flag)
                .await
                .map_err(|source| TransactionError::Enlist {
                    gtrid: self.gtrid,
                    resource: holder.unique_name().to_string(),
                    source,
                })?;
            holder.enlist(&branch.state);
            debug!(xid = %xid, resource = holder.unique_name(), ?flag, "Branch re-enlisted");
            return Ok(xid);
        }

        let xid = Xid::new(self.gtrid, state.next_bqual);
        let branch_state = HolderState::new(xid, holder.clone(), self.self_ref.clone());
        branch_state
            .start(StartFlag::NoFlags)
            .await
            .map_err(|source| TransactionError::Enlist {
                gtrid: self.gtrid,
                resource: holder.unique_name().to_string(),
                source,
            })?;

        state.next_bqual += 1;
        holder.enlist(&branch_state);
        state.branches.push(Branch {
            state: branch_state,
            outcome: BranchOutcome::Pending,
            voted: false,
        });

        if state.branches.len() == 1 {
            self.journal(TransactionStatus::Active, &state.resource_names());
        }
        info!(xid = %xid, resource = holder.unique_name(), "Resource enlisted");
        Ok(xid)
    }

    /// End `holder`'s association with its branch of this transaction.
    ///
    /// `EndFlag::Suspend` keeps the branch resumable through
    /// [`enlist`](Self::enlist).
    pub async fn delist(
        &self,
        holder: &Arc<dyn ResourceHolder>,
        flag: EndFlag,
    ) -> Result<(), TransactionError> {
        let state = self.state.lock().await;
        let Some(branch) = holder
            .branch_id()
            .and_then(|xid| state.branches.iter().find(|b| b.xid() == xid))
        else {
            return Ok(());
        };

        branch
            .state
            .end(flag)
            .await
            .map_err(|source| TransactionError::Enlist {
                gtrid: self.gtrid,
                resource: holder.unique_name().to_string(),
                source,
            })?;
        debug!(xid = %branch.xid(), ?flag, "Resource delisted");
        Ok(())
    }

    /// End branch `xid` if it is still associated with its connection.
    ///
    /// Runs under the state lock, so it never overlaps a phase or the timeout.
    /// Returns whether XA `end` was called.
    pub(crate) async fn end_branch(&self, xid: Xid, flag: EndFlag) -> XaResult<bool> {
        let state = self.state.lock().await;
        let Some(branch) = state.branches.iter().find(|b| b.xid() == xid) else {
            return Ok(false);
        };
        let flags = branch.state.flags();
        if !flags.started || flags.ended {
            return Ok(false);
        }
        branch.state.end(flag).await?;
        Ok(true)
    }
}
