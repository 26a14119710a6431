//! Recovery Manager
//!
//! Reconciles the branches resources still hold prepared with what the
//! journal knows.
//!
//! # Decision per branch
//!
//! | Branch                                   | Action                      |
//! |------------------------------------------|-----------------------------|
//! | gtrid from another server id             | reported, untouched         |
//! | transaction in flight or being retried   | skipped                     |
//! | commit decision journaled                | commit                      |
//! | rollback decision journaled              | rollback                    |
//! | no decision, older than safety margin    | rollback (presumed abort)   |
//! | no decision, younger                     | left in doubt               |

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::coordinator::TransactionCoordinator;
use crate::coordinator::retry::{Completion, complete_branch};
use crate::core_types::{Gtrid, Xid, now_ms};
use crate::error::{Phase, ResourceFailure, SchedulerError, TmError};
use crate::journal::Journal;
use crate::manager::{InFlight, Services};
use crate::resource::ResourcePool;
use crate::scheduler::Task;
use crate::status::Decision;

/// One branch reported by a resource's `recover`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBranch {
    pub resource: String,
    pub xid: Xid,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub committed: Vec<RecoveredBranch>,
    pub rolled_back: Vec<RecoveredBranch>,
    /// Heuristic outcomes found on the way, forgotten on the resource
    pub forgotten: Vec<ResourceFailure>,
    /// No decision yet and too young to presume abort
    pub in_doubt: Vec<RecoveredBranch>,
    /// In flight or still retried by the coordinator
    pub skipped: Vec<RecoveredBranch>,
    /// Created by another coordinator
    pub unresolvable: Vec<RecoveredBranch>,
    /// Dangling transactions whose terminal status got journaled
    pub completed: Vec<Gtrid>,
    /// Pools that could not be asked
    pub unreachable: Vec<String>,
    /// Commit or rollback calls that failed
    pub failures: Vec<ResourceFailure>,
}

impl RecoveryReport {
    /// Branches committed or rolled back by this run
    pub fn resolved(&self) -> usize {
        self.committed.len() + self.rolled_back.len()
    }

    /// Nothing left for an operator to look at
    pub fn is_clean(&self) -> bool {
        self.forgotten.is_empty()
            && self.in_doubt.is_empty()
            && self.unresolvable.is_empty()
            && self.unreachable.is_empty()
            && self.failures.is_empty()
    }
}

pub struct RecoveryManager {
    services: Arc<Services>,
    coordinator: Arc<TransactionCoordinator>,
    in_flight: Arc<InFlight>,
    /// One run at a time
    running: tokio::sync::Mutex<()>,
    self_ref: Weak<RecoveryManager>,
}

impl RecoveryManager {
    pub fn new(
        services: Arc<Services>,
        coordinator: Arc<TransactionCoordinator>,
        in_flight: Arc<InFlight>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            services,
            coordinator,
            in_flight,
            running: tokio::sync::Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    /// Run [`recover`](Self::recover) every `interval` on the scheduler
    pub fn schedule_background(&self, interval: Duration) -> Result<(), SchedulerError> {
        let task = Box::new(RecoveryTask {
            manager: self.self_ref.clone(),
            interval,
        });
        self.services.scheduler().schedule_in(interval, task)?;
        info!(interval_ms = interval.as_millis() as u64, "Background recovery armed");
        Ok(())
    }

    fn is_busy(&self, gtrid: Gtrid) -> bool {
        self.in_flight.contains_key(&gtrid) || self.coordinator.has_pending_retries(gtrid)
    }

    pub async fn recover(&self) -> Result<RecoveryReport, TmError> {
        let _run = self.running.lock().await;

        let dangling = self.services.journal().collect_dangling_records()?;
        let server_id = self.services.uid().server_id();
        let margin_ms = self.services.config().recovery_safety_margin().as_millis() as u64;
        let now = now_ms();

        let mut pools: Vec<Arc<ResourcePool>> = self
            .services
            .pools()
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        pools.sort_by(|a, b| a.unique_name().cmp(b.unique_name()));

        let mut report = RecoveryReport::default();
        // Gtrids with a branch this run could not finish
        let mut unfinished: FxHashSet<Gtrid> = FxHashSet::default();

        for pool in &pools {
            let name = pool.unique_name().to_string();
            let lease = match pool.recovery_lease().await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(resource = %name, error = %e, "No connection for recovery");
                    report.unreachable.push(name);
                    continue;
                }
            };
            let resource = lease.xa_resource();
            let xids = match resource.recover().await {
                Ok(xids) => xids,
                Err(e) => {
                    warn!(resource = %name, error = %e, "Recover call failed");
                    report.unreachable.push(name);
                    continue;
                }
            };
            debug!(resource = %name, branches = xids.len(), "Resource reported in-doubt branches");

            for xid in xids {
                let gtrid = xid.gtrid;
                let branch = RecoveredBranch {
                    resource: name.clone(),
                    xid,
                };

                if gtrid.server_id() != server_id {
                    debug!(xid = %xid, resource = %name, "Branch of another coordinator");
                    report.unresolvable.push(branch);
                    continue;
                }
                if self.is_busy(gtrid) {
                    report.skipped.push(branch);
                    unfinished.insert(gtrid);
                    continue;
                }

                let decision = match dangling.get(&gtrid).and_then(|record| record.decision) {
                    Some(decision) => decision,
                    None if gtrid.age_ms(now) >= margin_ms => Decision::Rollback,
                    None => {
                        report.in_doubt.push(branch);
                        unfinished.insert(gtrid);
                        continue;
                    }
                };

                match complete_branch(&resource, &name, xid, decision).await {
                    Completion::Resolved { heuristic } => {
                        if let Some(e) = heuristic {
                            let phase = match decision {
                                Decision::Commit => Phase::Commit,
                                Decision::Rollback => Phase::Rollback,
                            };
                            report
                                .forgotten
                                .push(ResourceFailure::reported(&name, xid, phase, &e));
                        }
                        info!(xid = %xid, resource = %name, %decision, "Recovered branch");
                        match decision {
                            Decision::Commit => report.committed.push(branch),
                            Decision::Rollback => report.rolled_back.push(branch),
                        }
                    }
                    Completion::Failed {
                        failure,
                        forgotten: true,
                    } => {
                        report.forgotten.push(failure);
                    }
                    Completion::Retry(failure) | Completion::Failed { failure, .. } => {
                        report.failures.push(failure);
                        unfinished.insert(gtrid);
                    }
                }
            }
        }

        // Terminate dangling transactions nothing is left of
        let registered: FxHashSet<&str> = pools.iter().map(|p| p.unique_name()).collect();
        let mut finished: Vec<_> = dangling.values().collect();
        finished.sort_by_key(|record| record.sequence);
        for record in finished {
            let gtrid = record.gtrid;
            if unfinished.contains(&gtrid) || self.is_busy(gtrid) {
                continue;
            }
            let reachable = record.resources.iter().all(|r| {
                registered.contains(r.as_str()) && !report.unreachable.contains(r)
            });
            if !reachable {
                continue;
            }
            let decision = match record.decision {
                Some(decision) => decision,
                None if gtrid.age_ms(now) >= margin_ms => Decision::Rollback,
                None => continue,
            };

            let status = decision.terminal_status();
            if let Err(e) = self
                .services
                .journal()
                .log(gtrid, status, &record.resources)
            {
                warn!(gtrid = %gtrid, error = %e, "Journal write failed");
                continue;
            }
            debug!(gtrid = %gtrid, status = %status, "Dangling transaction terminated");
            report.completed.push(gtrid);
        }

        info!(
            committed = report.committed.len(),
            rolled_back = report.rolled_back.len(),
            in_doubt = report.in_doubt.len(),
            skipped = report.skipped.len(),
            unresolvable = report.unresolvable.len(),
            completed = report.completed.len(),
            failures = report.failures.len(),
            "Recovery finished"
        );
        Ok(report)
    }
}

/// Periodic recovery; re-arms itself before each run
struct RecoveryTask {
    manager: Weak<RecoveryManager>,
    interval: Duration,
}

#[async_trait]
impl Task for RecoveryTask {
    fn describe(&self) -> String {
        "background recovery".to_string()
    }

    async fn execute(&self) -> Result<(), TmError> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        manager.schedule_background(self.interval)?;
        manager.recover().await?;
        Ok(())
    }
}
