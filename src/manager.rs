//! Services context and transaction manager
//!
//! [`Services`] owns everything shared by the coordinator, the pools and the
//! recovery manager: scheduler, journal, gtrid generator and registries. It is
//! built once with [`Services::init`] and stopped once with
//! [`Services::shutdown`].
//!
//! [`TransactionManager`] is the application-facing API on top of it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, CoordinatorConfig, PoolConfig};
use crate::coordinator::{Transaction, TransactionCoordinator};
use crate::core_types::{Gtrid, UidGenerator};
use crate::error::TmError;
use crate::journal::{Journal, open_journal};
use crate::management::ManagementRegistry;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::resource::{PoolRegistry, ResourcePool, XaResourceFactory};
use crate::scheduler::TaskScheduler;
use crate::status::TransactionStatus;

/// Transactions begun and not yet committed or rolled back
pub type InFlight = DashMap<Gtrid, Arc<Transaction>>;

pub struct Services {
    config: CoordinatorConfig,
    scheduler: TaskScheduler,
    journal: Arc<dyn Journal>,
    uid: UidGenerator,
    pools: Arc<PoolRegistry>,
    management: Arc<ManagementRegistry>,
    shut_down: AtomicBool,
}

impl Services {
    /// Build the context and start the scheduler on the current tokio runtime
    pub fn init(config: CoordinatorConfig, journal: Arc<dyn Journal>) -> Arc<Self> {
        let uid = UidGenerator::new(config.server_id);
        info!(server_id = config.server_id, "Transaction manager services starting");
        Arc::new(Self {
            config,
            scheduler: TaskScheduler::start(),
            journal,
            uid,
            pools: Arc::new(DashMap::new()),
            management: ManagementRegistry::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Open the configured journal and [`init`](Self::init)
    pub fn from_config(config: &AppConfig) -> Result<Arc<Self>, TmError> {
        let journal = open_journal(&config.journal)?;
        Ok(Self::init(config.coordinator.clone(), journal))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn uid(&self) -> &UidGenerator {
        &self.uid
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn management(&self) -> &Arc<ManagementRegistry> {
        &self.management
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close every pool, stop the scheduler and close the journal.
    ///
    /// Only the first call does anything; later calls return `false`. Must not
    /// be awaited from a scheduler task.
    pub async fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Services already shut down");
            return false;
        }

        let pools: Vec<Arc<ResourcePool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in &pools {
            pool.close().await;
        }

        self.scheduler.shutdown().await;

        if let Err(e) = self.journal.close() {
            warn!(error = %e, "Closing journal failed");
        }

        info!(pools = pools.len(), "Transaction manager services shut down");
        true
    }
}

/// Begin, commit and roll back transactions; register pools; run recovery
pub struct TransactionManager {
    services: Arc<Services>,
    coordinator: Arc<TransactionCoordinator>,
    recovery: Arc<RecoveryManager>,
    in_flight: Arc<InFlight>,
}

impl TransactionManager {
    /// Arms background recovery when the configuration asks for it
    pub fn new(services: Arc<Services>) -> Result<Arc<Self>, TmError> {
        let coordinator = TransactionCoordinator::new(
            services.config().clone(),
            services.journal().clone(),
            services.scheduler().clone(),
        );
        let in_flight = Arc::new(InFlight::new());
        let recovery = RecoveryManager::new(services.clone(), coordinator.clone(), in_flight.clone());

        if let Some(interval) = services.config().background_recovery_interval() {
            recovery.schedule_background(interval)?;
        }

        Ok(Arc::new(Self {
            services,
            coordinator,
            recovery,
            in_flight,
        }))
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Begin a transaction with the configured timeout
    pub fn begin(&self) -> Result<Arc<Transaction>, TmError> {
        self.begin_with_timeout(self.services.config().transaction_timeout())
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<Arc<Transaction>, TmError> {
        if self.services.is_shut_down() {
            return Err(TmError::ShutDown);
        }

        let gtrid = self.services.uid().generate();
        let tx = Transaction::new(gtrid, timeout, self.services.journal().clone());
        self.coordinator.arm_timeout(&tx, &self.in_flight)?;
        self.in_flight.insert(gtrid, tx.clone());

        debug!(gtrid = %gtrid, timeout_ms = timeout.as_millis() as u64, "Transaction begun");
        Ok(tx)
    }

    pub async fn commit(&self, tx: &Arc<Transaction>) -> Result<(), TmError> {
        let result = self.coordinator.commit(tx).await;
        self.release(tx);
        Ok(result?)
    }

    pub async fn rollback(&self, tx: &Arc<Transaction>) -> Result<(), TmError> {
        let result = self.coordinator.rollback(tx).await;
        self.release(tx);
        Ok(result?)
    }

    pub async fn set_rollback_only(&self, tx: &Arc<Transaction>) -> Result<(), TmError> {
        Ok(self.coordinator.set_rollback_only(tx).await?)
    }

    /// Forget a transaction once both phases are behind it
    fn release(&self, tx: &Transaction) {
        if !matches!(
            tx.status(),
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        ) {
            self.in_flight.remove(&tx.gtrid());
        }
    }

    pub fn transaction(&self, gtrid: Gtrid) -> Option<Arc<Transaction>> {
        self.in_flight.get(&gtrid).map(|entry| entry.value().clone())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Create, register and fill a pool
    pub async fn register_pool(
        &self,
        config: PoolConfig,
        factory: Arc<dyn XaResourceFactory>,
    ) -> Result<Arc<ResourcePool>, TmError> {
        if self.services.is_shut_down() {
            return Err(TmError::ShutDown);
        }

        let pool = ResourcePool::new(config, factory, &self.services)?;
        if let Err(e) = pool.init().await {
            pool.close().await;
            return Err(e.into());
        }
        Ok(pool)
    }

    pub fn pool(&self, unique_name: &str) -> Option<Arc<ResourcePool>> {
        self.services
            .pools()
            .get(unique_name)
            .map(|entry| entry.value().clone())
    }

    pub async fn recover(&self) -> Result<RecoveryReport, TmError> {
        self.recovery.recover().await
    }

    pub async fn shutdown(&self) -> bool {
        if !self.in_flight.is_empty() {
            warn!(in_flight = self.in_flight.len(), "Shutting down with transactions in flight");
        }
        if !self.services.shutdown().await {
            return false;
        }
        self.coordinator.abandon_retries();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::resource::mock::{EventLog, MockFactory};

    fn manager() -> Arc<TransactionManager> {
        let services = Services::init(CoordinatorConfig::default(), Arc::new(MemoryJournal::new()));
        TransactionManager::new(services).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_registers_in_flight() {
        let tm = manager();
        let tx = tm.begin().unwrap();

        assert_eq!(tx.status(), TransactionStatus::Active);
        assert_eq!(tx.gtrid().server_id(), 1);
        assert_eq!(tm.in_flight_count(), 1);
        assert!(tm.transaction(tx.gtrid()).is_some());
        // The timeout task is waiting on the timeline
        assert_eq!(tm.services().scheduler().scheduled_count(), 1);

        tm.commit(&tx).await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert_eq!(tm.in_flight_count(), 0);
        assert_eq!(tm.services().scheduler().scheduled_count(), 0);
        tm.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_once() {
        let tm = manager();
        let pool = tm
            .register_pool(PoolConfig::new("pds1", 1, 2), MockFactory::new("pds1", EventLog::new()))
            .await
            .unwrap();
        assert!(tm.pool("pds1").is_some());

        assert!(tm.shutdown().await);
        assert!(!tm.shutdown().await);
        assert!(!tm.services().scheduler().is_running());
        assert!(pool.is_closed());
        assert!(tm.pool("pds1").is_none());

        assert!(matches!(tm.begin(), Err(TmError::ShutDown)));
        assert!(matches!(
            tm.register_pool(PoolConfig::new("pds2", 0, 1), MockFactory::new("pds2", EventLog::new()))
                .await,
            Err(TmError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pool_init_is_deregistered() {
        let tm = manager();
        let factory = MockFactory::new("pds1", EventLog::new());
        factory.set_fail_open(true);

        let err = tm
            .register_pool(PoolConfig::new("pds1", 1, 1), factory)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "POOL_ERROR");
        assert!(tm.pool("pds1").is_none());
        tm.shutdown().await;
    }
}
