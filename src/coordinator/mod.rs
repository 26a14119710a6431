//! Transaction Coordinator
//!
//! Drives two-phase commit over the branches of a [`Transaction`], journals
//! every status change and turns the per-branch results into one outcome.
//!
//! # Journal sequence
//!
//! ```text
//! ACTIVE ─► PREPARING ─► PREPARED ─► COMMITTING ───► COMMITTED | UNKNOWN
//!                │
//!                └─────► UNKNOWN ──► ROLLING_BACK ─► ROLLEDBACK | UNKNOWN
//! ```
//!
//! A rollback without prepare (requested, rollback-only, timeout) goes
//! straight from ACTIVE to ROLLING_BACK.
//!
//! # Phase 2 failures
//!
//! The caller gets the aggregate error as soon as phase 2 has visited every
//! branch. Branches that failed with a retryable error keep being retried on
//! the scheduler; the terminal status is journaled once they all resolve and
//! no other branch of the transaction was left in doubt.

pub mod transaction;

pub(crate) mod retry;
mod timeout;


use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::core_types::{Gtrid, Xid};
use crate::error::{
    FailureList, PartialOutcome, Phase, ResourceFailure, RollbackReason, SchedulerError,
    TransactionError,
};
use crate::journal::Journal;
use crate::manager::InFlight;
use crate::resource::XaResource;
use crate::scheduler::TaskScheduler;
use crate::status::{Decision, TransactionStatus};
use crate::xa::{EndFlag, ErrorClass, HeuristicKind, Vote, XA_HEURHAZ};

use retry::{BranchRetryTask, Completion, RetryGroup, complete_branch, forget};
use timeout::TransactionTimeoutTask;
use transaction::{Branch, TxState};

pub use transaction::{BranchOutcome, Transaction};

/// Result of phase 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Every branch voted; `to_commit` of them voted XA_OK
    Prepared { to_commit: usize },
    /// At least one branch failed to prepare
    MustRollback,
}

/// Branch handed over to the background retry
struct PendingRetry {
    resource: Arc<dyn XaResource>,
    unique_name: String,
    xid: Xid,
}

pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    journal: Arc<dyn Journal>,
    scheduler: TaskScheduler,
    retries: DashMap<Gtrid, RetryGroup>,
    self_ref: Weak<TransactionCoordinator>,
}

impl TransactionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        journal: Arc<dyn Journal>,
        scheduler: TaskScheduler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            journal,
            scheduler,
            retries: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Whether background retries are still running for `gtrid`
    pub fn has_pending_retries(&self, gtrid: Gtrid) -> bool {
        self.retries.contains_key(&gtrid)
    }

    /// Transactions with background retries still running
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    // ========================================================================
    // Application entry points
    // ========================================================================

    /// Commit `tx`: two-phase commit, or one-phase for a single branch when
    /// enabled. Rolls back instead when the transaction is rollback-only,
    /// timed out or cannot be prepared.
    pub async fn commit(&self, tx: &Arc<Transaction>) -> Result<(), TransactionError> {
        let mut state = tx.lock().await;
        self.cancel_timeout(tx);

        if state.timed_out {
            return Err(timeout_outcome(tx.gtrid(), &state));
        }
        match tx.status() {
            TransactionStatus::Active => {}
            TransactionStatus::MarkedRollback => {
                info!(gtrid = %tx.gtrid(), "Transaction is rollback-only, rolling back");
                self.end_branches(&mut state, EndFlag::Success).await;
                return self
                    .rollback_phase(tx, &mut state, Some(RollbackReason::RollbackOnly), Vec::new())
                    .await;
            }
            status => {
                return Err(TransactionError::InvalidStatus {
                    gtrid: tx.gtrid(),
                    status,
                    operation: "commit",
                });
            }
        }

        if state.branches.is_empty() {
            tx.set_status(&mut state, TransactionStatus::Committed);
            debug!(gtrid = %tx.gtrid(), "Transaction without resources committed");
            return Ok(());
        }

        let mut failures = self.delist(&mut state).await;
        if !failures.is_empty() {
            return self
                .rollback_phase(tx, &mut state, Some(RollbackReason::DelistFailed), failures)
                .await;
        }

        if self.config.one_phase_commit && state.branches.len() == 1 {
            return self.commit_one_phase(tx, &mut state).await;
        }

        match self.prepare(tx, &mut state, &mut failures).await {
            PrepareOutcome::Prepared { to_commit } => {
                debug!(gtrid = %tx.gtrid(), to_commit, "Transaction prepared");
                self.commit_phase(tx, &mut state, failures).await
            }
            PrepareOutcome::MustRollback => {
                self.rollback_phase(tx, &mut state, Some(RollbackReason::PrepareFailed), failures)
                    .await
            }
        }
    }

    /// Roll back `tx` on request of the application
    pub async fn rollback(&self, tx: &Arc<Transaction>) -> Result<(), TransactionError> {
        let mut state = tx.lock().await;
        self.cancel_timeout(tx);

        if state.timed_out {
            // Already rolled back by the timeout; only a dirty outcome is news
            return match timeout_outcome(tx.gtrid(), &state) {
                TransactionError::RolledBack { .. } => Ok(()),
                e => Err(e),
            };
        }
        match tx.status() {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {}
            status => {
                return Err(TransactionError::InvalidStatus {
                    gtrid: tx.gtrid(),
                    status,
                    operation: "roll back",
                });
            }
        }

        self.end_branches(&mut state, EndFlag::Success).await;
        self.rollback_phase(tx, &mut state, None, Vec::new()).await
    }

    pub async fn set_rollback_only(&self, tx: &Arc<Transaction>) -> Result<(), TransactionError> {
        let mut state = tx.lock().await;
        match tx.status() {
            TransactionStatus::Active => {
                tx.set_status(&mut state, TransactionStatus::MarkedRollback);
                info!(gtrid = %tx.gtrid(), "Transaction marked rollback-only");
                Ok(())
            }
            TransactionStatus::MarkedRollback => Ok(()),
            status => Err(TransactionError::InvalidStatus {
                gtrid: tx.gtrid(),
                status,
                operation: "mark rollback-only",
            }),
        }
    }

    // ========================================================================
    // Timeout
    // ========================================================================

    /// Schedule the rollback of `tx` at its deadline. A transaction the
    /// timeout rolls back is removed from `in_flight`.
    pub fn arm_timeout(
        &self,
        tx: &Arc<Transaction>,
        in_flight: &Arc<InFlight>,
    ) -> Result<(), SchedulerError> {
        let task = Box::new(TransactionTimeoutTask {
            tx: Arc::downgrade(tx),
            coordinator: self.self_ref.clone(),
            in_flight: Arc::downgrade(in_flight),
        });
        let handle = self.scheduler.schedule(tx.deadline(), task)?;
        tx.set_timeout_task(handle);
        Ok(())
    }

    fn cancel_timeout(&self, tx: &Transaction) {
        if let Some(handle) = tx.take_timeout_task() {
            self.scheduler.cancel(&handle);
        }
    }

    /// Roll back a transaction whose deadline passed while it was active.
    /// Returns whether it did.
    pub(crate) async fn time_out(&self, tx: &Arc<Transaction>) -> bool {
        let mut state = tx.lock().await;
        let status = tx.status();
        if state.timed_out
            || !matches!(
                status,
                TransactionStatus::Active | TransactionStatus::MarkedRollback
            )
        {
            return false;
        }

        warn!(
            gtrid = %tx.gtrid(),
            timeout_ms = tx.timeout().as_millis() as u64,
            branches = state.branches.len(),
            "Transaction timed out, rolling back"
        );
        tx.take_timeout_task();
        state.timed_out = true;
        self.end_branches(&mut state, EndFlag::Fail).await;
        let outcome = self
            .rollback_phase(tx, &mut state, Some(RollbackReason::Timeout), Vec::new())
            .await;
        state.timeout_outcome = outcome.err();
        true
    }

    // ========================================================================
    // Phases
    // ========================================================================

    /// End every branch still associated with its connection before prepare.
    /// Failures are collected; a rolled-back branch is aborted.
    async fn delist(&self, state: &mut TxState) -> Vec<ResourceFailure> {
        let mut failures = Vec::new();
        for branch in state.branches.iter_mut() {
            let flags = branch.state.flags();
            if !flags.started || flags.ended {
                continue;
            }
            if let Err(e) = branch.state.end(EndFlag::Success).await {
                warn!(xid = %branch.xid(), resource = branch.unique_name(), error = %e, "Delist failed");
                failures.push(ResourceFailure::reported(
                    branch.unique_name(),
                    branch.xid(),
                    Phase::Delist,
                    &e,
                ));
                if e.class() == ErrorClass::RolledBack {
                    branch.outcome = BranchOutcome::Aborted;
                }
            }
        }
        failures
    }

    /// End every open branch before a rollback; failures are only logged
    async fn end_branches(&self, state: &mut TxState, flag: EndFlag) {
        for branch in state.branches.iter_mut() {
            let flags = branch.state.flags();
            if !flags.started || flags.ended {
                continue;
            }
            if let Err(e) = branch.state.end(flag).await {
                warn!(xid = %branch.xid(), resource = branch.unique_name(), error = %e, "Ending branch failed");
                if e.class() == ErrorClass::RolledBack {
                    branch.outcome = BranchOutcome::Aborted;
                }
            }
        }
    }

    /// Phase 1. Asks every branch in order, never stopping at a failure.
    async fn prepare(
        &self,
        tx: &Transaction,
        state: &mut TxState,
        failures: &mut Vec<ResourceFailure>,
    ) -> PrepareOutcome {
        let names = state.resource_names();
        tx.set_status(state, TransactionStatus::Preparing);
        tx.journal(TransactionStatus::Preparing, &names);

        let mut failed = false;
        for branch in state.branches.iter_mut() {
            let xid = branch.xid();
            match branch.state.xa_resource().prepare(xid).await {
                Ok(Vote::Commit) => {
                    branch.outcome = BranchOutcome::Prepared;
                    branch.voted = true;
                }
                Ok(Vote::ReadOnly) => {
                    debug!(xid = %xid, resource = branch.unique_name(), "Branch voted read-only");
                    branch.outcome = BranchOutcome::ReadOnly;
                    branch.voted = true;
                }
                Err(e) => {
                    warn!(xid = %xid, resource = branch.unique_name(), error = %e, "Prepare failed");
                    failures.push(ResourceFailure::reported(
                        branch.unique_name(),
                        xid,
                        Phase::Prepare,
                        &e,
                    ));
                    branch.outcome = if e.class() == ErrorClass::RolledBack {
                        BranchOutcome::Aborted
                    } else {
                        BranchOutcome::InDoubt
                    };
                    failed = true;
                }
            }
        }

        if failed {
            tx.set_status(state, TransactionStatus::Unknown);
            tx.journal(TransactionStatus::Unknown, &names);
            return PrepareOutcome::MustRollback;
        }

        tx.set_status(state, TransactionStatus::Prepared);
        tx.journal(TransactionStatus::Prepared, &names);
        PrepareOutcome::Prepared {
            to_commit: state
                .branches
                .iter()
                .filter(|b| b.outcome == BranchOutcome::Prepared)
                .count(),
        }
    }

    /// Phase 2 after a clean prepare; read-only voters are skipped
    async fn commit_phase(
        &self,
        tx: &Transaction,
        state: &mut TxState,
        mut failures: Vec<ResourceFailure>,
    ) -> Result<(), TransactionError> {
        let names = state.resource_names();
        tx.set_status(state, TransactionStatus::Committing);
        tx.journal(TransactionStatus::Committing, &names);

        let mut retries = Vec::new();
        for branch in state
            .branches
            .iter_mut()
            .filter(|b| b.outcome == BranchOutcome::Prepared)
        {
            complete(branch, Decision::Commit, &mut failures, &mut retries).await;
        }

        self.finish(tx, state, Decision::Commit, None, failures, retries)
    }

    /// Roll back every branch that may still hold work: not yet prepared or
    /// voted XA_OK. Aborted, read-only and failed-prepare branches are skipped.
    async fn rollback_phase(
        &self,
        tx: &Transaction,
        state: &mut TxState,
        reason: Option<RollbackReason>,
        mut failures: Vec<ResourceFailure>,
    ) -> Result<(), TransactionError> {
        if state.branches.is_empty() {
            tx.set_status(state, TransactionStatus::RolledBack);
            return match reason {
                None => Ok(()),
                Some(reason) => Err(TransactionError::RolledBack {
                    gtrid: tx.gtrid(),
                    reason,
                    failures: FailureList(failures),
                }),
            };
        }

        let names = state.resource_names();
        tx.set_status(state, TransactionStatus::RollingBack);
        tx.journal(TransactionStatus::RollingBack, &names);

        let mut retries = Vec::new();
        for branch in state.branches.iter_mut().filter(|b| {
            matches!(b.outcome, BranchOutcome::Pending | BranchOutcome::Prepared)
        }) {
            complete(branch, Decision::Rollback, &mut failures, &mut retries).await;
        }

        self.finish(tx, state, Decision::Rollback, reason, failures, retries)
    }

    /// Commit the only branch with `one_phase` set, skipping prepare
    async fn commit_one_phase(
        &self,
        tx: &Transaction,
        state: &mut TxState,
    ) -> Result<(), TransactionError> {
        let names = state.resource_names();
        tx.set_status(state, TransactionStatus::Committing);
        tx.journal(TransactionStatus::Committing, &names);

        let mut failures = Vec::new();
        let mut decision = Decision::Commit;
        let mut reason = None;

        let branch = &mut state.branches[0];
        let xid = branch.xid();
        let resource = branch.state.xa_resource();
        match resource.commit(xid, true).await {
            Ok(()) => branch.outcome = BranchOutcome::Committed,
            Err(e) => match e.class() {
                ErrorClass::Heuristic(HeuristicKind::Commit) => {
                    forget(&resource, branch.unique_name(), xid).await;
                    branch.outcome = BranchOutcome::Committed;
                }
                ErrorClass::RolledBack => {
                    warn!(xid = %xid, error = %e, "One-phase commit rolled back");
                    failures.push(ResourceFailure::reported(
                        branch.unique_name(),
                        xid,
                        Phase::Commit,
                        &e,
                    ));
                    branch.outcome = BranchOutcome::RolledBack;
                    decision = Decision::Rollback;
                    reason = Some(RollbackReason::PrepareFailed);
                }
                class => {
                    warn!(xid = %xid, error = %e, "One-phase commit failed");
                    let code = match class {
                        ErrorClass::Heuristic(kind) => {
                            forget(&resource, branch.unique_name(), xid).await;
                            kind.code()
                        }
                        _ => XA_HEURHAZ,
                    };
                    failures.push(ResourceFailure::heuristic(
                        branch.unique_name(),
                        xid,
                        Phase::Commit,
                        code,
                        format!(
                            "resource reported {} when asked to commit transaction branch",
                            e.code_name()
                        ),
                    ));
                    branch.outcome = BranchOutcome::InDoubt;
                }
            },
        }

        self.finish(tx, state, decision, reason, failures, Vec::new())
    }

    /// Journal the phase-2 result, hand retryable branches to the scheduler,
    /// release the holders and compute the aggregate outcome.
    fn finish(
        &self,
        tx: &Transaction,
        state: &mut TxState,
        decision: Decision,
        reason: Option<RollbackReason>,
        failures: Vec<ResourceFailure>,
        retries: Vec<PendingRetry>,
    ) -> Result<(), TransactionError> {
        let gtrid = tx.gtrid();
        let names = state.resource_names();
        let in_doubt = state
            .branches
            .iter()
            .filter(|b| b.outcome == BranchOutcome::InDoubt)
            .count();

        if in_doubt == 0 {
            let status = decision.terminal_status();
            tx.set_status(state, status);
            tx.journal(status, &names);
        } else {
            tx.set_status(state, TransactionStatus::Unknown);
            tx.journal(TransactionStatus::Unknown, &names);
            error!(
                gtrid = %gtrid,
                in_doubt,
                retrying = retries.len(),
                %decision,
                "Transaction left in doubt"
            );
        }

        if !retries.is_empty() {
            self.schedule_retries(gtrid, decision, names, in_doubt, retries);
        }

        for branch in &state.branches {
            branch.state.mark_completed();
            branch.state.holder().transaction_completed(branch.xid());
        }

        let result = classify(gtrid, decision, reason, &state.branches, failures);
        match &result {
            Ok(()) => info!(gtrid = %gtrid, %decision, "Transaction completed"),
            Err(e) => warn!(gtrid = %gtrid, error = %e, "Transaction completed with failures"),
        }
        result
    }

    // ========================================================================
    // Background retries
    // ========================================================================

    fn schedule_retries(
        &self,
        gtrid: Gtrid,
        decision: Decision,
        resources: Vec<String>,
        in_doubt: usize,
        retries: Vec<PendingRetry>,
    ) {
        if self.config.max_retry_count == 0 {
            debug!(gtrid = %gtrid, "Retries disabled, branches stay in doubt");
            return;
        }

        self.retries.insert(
            gtrid,
            RetryGroup {
                decision,
                resources,
                pending: retries.len(),
                unresolved: in_doubt - retries.len(),
                unknown_logged: false,
            },
        );

        for retry in retries {
            let task = Box::new(BranchRetryTask {
                coordinator: self.self_ref.clone(),
                resource: retry.resource,
                unique_name: retry.unique_name,
                xid: retry.xid,
                decision,
                attempt: 1,
            });
            if let Err(e) = self.scheduler.schedule_in(self.config.retry_interval(), task) {
                error!(xid = %retry.xid, error = %e, "Cannot schedule retry, branch left in doubt");
                self.retry_abandoned(gtrid);
            }
        }
    }

    /// A retried branch reached the decided outcome
    pub(crate) fn retry_resolved(&self, gtrid: Gtrid) {
        let done = {
            let Some(mut group) = self.retries.get_mut(&gtrid) else {
                return;
            };
            group.pending -= 1;
            (group.pending == 0).then(|| group.clone())
        };
        let Some(group) = done else {
            return;
        };
        self.retries.remove(&gtrid);

        if group.unresolved == 0 {
            let status = group.decision.terminal_status();
            self.log(gtrid, status, &group.resources);
            info!(gtrid = %gtrid, status = %status, "Retries resolved every branch");
        } else {
            warn!(
                gtrid = %gtrid,
                in_doubt = group.unresolved,
                "Retries finished, branches remain in doubt"
            );
        }
    }

    /// A retried branch is given up and left in doubt
    pub(crate) fn retry_abandoned(&self, gtrid: Gtrid) {
        let (log_unknown, resources, done) = {
            let Some(mut group) = self.retries.get_mut(&gtrid) else {
                return;
            };
            group.pending -= 1;
            group.unresolved += 1;
            let log_unknown = !group.unknown_logged;
            group.unknown_logged = true;
            (log_unknown, group.resources.clone(), group.pending == 0)
        };

        if log_unknown {
            self.log(gtrid, TransactionStatus::Unknown, &resources);
        }
        if done {
            self.retries.remove(&gtrid);
        }
    }

    /// Forget every retry group once the scheduler has stopped and dropped
    /// their tasks. The journal already holds UNKNOWN for each of them, so
    /// recovery picks them up after a restart.
    pub fn abandon_retries(&self) -> usize {
        let gtrids: Vec<Gtrid> = self.retries.iter().map(|entry| *entry.key()).collect();
        for gtrid in &gtrids {
            self.retries.remove(gtrid);
            warn!(gtrid = %gtrid, "Retries abandoned at shutdown, branches left in doubt");
        }
        gtrids.len()
    }

    fn log(&self, gtrid: Gtrid, status: TransactionStatus, resources: &[String]) {
        if let Err(e) = self.journal.log(gtrid, status, resources) {
            warn!(gtrid = %gtrid, status = %status, error = %e, "Journal write failed");
        }
    }
}

/// Run one phase-2 call and fold its result into the branch
async fn complete(
    branch: &mut Branch,
    decision: Decision,
    failures: &mut Vec<ResourceFailure>,
    retries: &mut Vec<PendingRetry>,
) {
    let xid = branch.xid();
    let resource = branch.state.xa_resource();
    let completion = complete_branch(&resource, branch.unique_name(), xid, decision).await;
    match completion {
        Completion::Resolved { .. } => {
            branch.outcome = match decision {
                Decision::Commit => BranchOutcome::Committed,
                Decision::Rollback => BranchOutcome::RolledBack,
            };
        }
        Completion::Retry(failure) => {
            failures.push(failure);
            branch.outcome = BranchOutcome::InDoubt;
            retries.push(PendingRetry {
                resource,
                unique_name: branch.unique_name().to_string(),
                xid,
            });
        }
        Completion::Failed { failure, .. } => {
            failures.push(failure);
            branch.outcome = BranchOutcome::InDoubt;
        }
    }
}

fn timeout_outcome(gtrid: Gtrid, state: &TxState) -> TransactionError {
    state
        .timeout_outcome
        .clone()
        .unwrap_or(TransactionError::RolledBack {
            gtrid,
            reason: RollbackReason::Timeout,
            failures: FailureList::default(),
        })
}

/// Aggregate outcome from the branch outcomes
fn classify(
    gtrid: Gtrid,
    decision: Decision,
    reason: Option<RollbackReason>,
    branches: &[Branch],
    failures: Vec<ResourceFailure>,
) -> Result<(), TransactionError> {
    let in_doubt = branches
        .iter()
        .filter(|b| b.outcome == BranchOutcome::InDoubt)
        .count();
    let definite = branches
        .iter()
        .filter(|b| b.voted || b.outcome.is_definite())
        .count();
    let failures = FailureList(failures);

    if in_doubt == 0 {
        return match reason {
            None => Ok(()),
            Some(reason) => Err(TransactionError::RolledBack {
                gtrid,
                reason,
                failures,
            }),
        };
    }

    if definite == 0 {
        return Err(TransactionError::HeuristicHazard { gtrid, failures });
    }

    let outcome = match (decision, reason) {
        (Decision::Commit, _) => PartialOutcome::Committed,
        (Decision::Rollback, Some(RollbackReason::PrepareFailed)) => {
            PartialOutcome::PreparedRolledBack
        }
        (Decision::Rollback, _) => PartialOutcome::RolledBack,
    };
    Err(TransactionError::PartiallyResolved {
        gtrid,
        outcome,
        failures,
    })
}
