//! Phase-2 calls and their background retries
//!
//! A branch whose commit or rollback failed with a retryable error is handed
//! to a [`BranchRetryTask`]. Each attempt schedules the next one only after it
//! finished, so one branch never has two calls in flight.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::TransactionCoordinator;
use crate::core_types::{Gtrid, Xid};
use crate::error::{Phase, ResourceFailure, TmError};
use crate::resource::XaResource;
use crate::scheduler::Task;
use crate::status::Decision;
use crate::xa::{ErrorClass, HeuristicKind, XA_HEURHAZ, XA_HEURRB, XaError};

/// Result of one phase-2 call on one branch
#[derive(Debug)]
pub(crate) enum Completion {
    /// The branch reached the decided outcome. `heuristic` holds a matching
    /// heuristic report, already forgotten.
    Resolved { heuristic: Option<XaError> },
    /// Failed with a retryable error; the failure is already classified
    Retry(ResourceFailure),
    /// Failed for good. `forgotten` is set when the resource reported a
    /// conflicting heuristic outcome and was told to forget it.
    Failed {
        failure: ResourceFailure,
        forgotten: bool,
    },
}

/// Commit or roll back one branch and classify the result.
///
/// Heuristic outcomes matching the decision count as resolved. Every
/// heuristic reported by the resource is forgotten.
pub(crate) async fn complete_branch(
    resource: &Arc<dyn XaResource>,
    unique_name: &str,
    xid: Xid,
    decision: Decision,
) -> Completion {
    let result = match decision {
        Decision::Commit => resource.commit(xid, false).await,
        Decision::Rollback => resource.rollback(xid).await,
    };
    let error = match result {
        Ok(()) => {
            debug!(xid = %xid, resource = unique_name, %decision, "Branch completed");
            return Completion::Resolved { heuristic: None };
        }
        Err(e) => e,
    };

    let phase = match decision {
        Decision::Commit => Phase::Commit,
        Decision::Rollback => Phase::Rollback,
    };
    let classified = |code: i32| {
        ResourceFailure::heuristic(
            unique_name,
            xid,
            phase,
            code,
            format!(
                "resource reported {} when asked to {} transaction branch",
                error.code_name(),
                decision.verb()
            ),
        )
    };

    match (error.class(), decision) {
        (ErrorClass::Heuristic(HeuristicKind::Commit), Decision::Commit)
        | (ErrorClass::Heuristic(HeuristicKind::Rollback), Decision::Rollback) => {
            debug!(xid = %xid, resource = unique_name, code = error.code_name(), "Heuristic outcome matches decision");
            forget(resource, unique_name, xid).await;
            Completion::Resolved {
                heuristic: Some(error.clone()),
            }
        }
        (ErrorClass::RolledBack, Decision::Rollback) => Completion::Resolved { heuristic: None },
        (ErrorClass::Heuristic(kind), _) => {
            warn!(xid = %xid, resource = unique_name, error = %error, "Heuristic outcome");
            forget(resource, unique_name, xid).await;
            Completion::Failed {
                failure: classified(kind.code()),
                forgotten: true,
            }
        }
        (ErrorClass::RolledBack, Decision::Commit) => {
            warn!(xid = %xid, resource = unique_name, error = %error, "Prepared branch rolled back on commit");
            Completion::Failed {
                failure: classified(XA_HEURRB),
                forgotten: false,
            }
        }
        (class, _) if class.is_retryable() => {
            warn!(xid = %xid, resource = unique_name, error = %error, %decision, "Phase 2 failed, will retry");
            Completion::Retry(classified(XA_HEURHAZ))
        }
        _ => {
            warn!(xid = %xid, resource = unique_name, error = %error, %decision, "Phase 2 failed");
            Completion::Failed {
                failure: classified(XA_HEURHAZ),
                forgotten: false,
            }
        }
    }
}

/// `forget` a heuristically completed branch; failures are only logged
pub(crate) async fn forget(resource: &Arc<dyn XaResource>, unique_name: &str, xid: Xid) {
    if let Err(e) = resource.forget(xid).await {
        warn!(xid = %xid, resource = unique_name, error = %e, "Forget failed");
    }
}

/// Retries still owed to the branches of one transaction
#[derive(Debug, Clone)]
pub(crate) struct RetryGroup {
    pub decision: Decision,
    pub resources: Vec<String>,
    /// Branches with a retry scheduled or running
    pub pending: usize,
    /// In-doubt branches that will not be retried
    pub unresolved: usize,
    /// UNKNOWN was journaled for an abandoned retry
    pub unknown_logged: bool,
}

/// One scheduled phase-2 attempt for one branch
pub(crate) struct BranchRetryTask {
    pub coordinator: Weak<TransactionCoordinator>,
    pub resource: Arc<dyn XaResource>,
    pub unique_name: String,
    pub xid: Xid,
    pub decision: Decision,
    /// 1 for the first retry
    pub attempt: u32,
}

impl BranchRetryTask {
    fn gtrid(&self) -> Gtrid {
        self.xid.gtrid
    }
}

#[async_trait]
impl Task for BranchRetryTask {
    fn describe(&self) -> String {
        format!(
            "{} retry #{} of {} on {}",
            self.decision, self.attempt, self.xid, self.unique_name
        )
    }

    async fn execute(&self) -> Result<(), TmError> {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Ok(());
        };

        match complete_branch(&self.resource, &self.unique_name, self.xid, self.decision).await {
            Completion::Resolved { .. } => {
                info!(
                    xid = %self.xid,
                    resource = %self.unique_name,
                    attempt = self.attempt,
                    decision = %self.decision,
                    "Retry resolved branch"
                );
                coordinator.retry_resolved(self.gtrid());
            }
            Completion::Retry(_) if self.attempt < coordinator.config().max_retry_count => {
                let next = Box::new(BranchRetryTask {
                    coordinator: self.coordinator.clone(),
                    resource: self.resource.clone(),
                    unique_name: self.unique_name.clone(),
                    xid: self.xid,
                    decision: self.decision,
                    attempt: self.attempt + 1,
                });
                if let Err(e) = coordinator
                    .scheduler()
                    .schedule_in(coordinator.config().retry_interval(), next)
                {
                    error!(xid = %self.xid, error = %e, "Cannot schedule retry, branch left in doubt");
                    coordinator.retry_abandoned(self.gtrid());
                }
            }
            Completion::Retry(failure) | Completion::Failed { failure, .. } => {
                error!(
                    xid = %self.xid,
                    resource = %self.unique_name,
                    attempt = self.attempt,
                    failure = %failure,
                    "Branch left in doubt after retries"
                );
                coordinator.retry_abandoned(self.gtrid());
            }
        }
        Ok(())
    }
}
