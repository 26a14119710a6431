//! Resource Pool
//!
//! Bounded set of [`PooledResource`]s for one resource. One mutex per pool
//! guards every size-affecting operation and is never held across an await.
//!
//! # Sizing
//!
//! ```text
//! total_pool_size = in_pool_size + acquired_size + in_recovery_size <= max_pool_size
//! ```
//!
//! `acquired_size` covers ACCESSIBLE and NOT_ACCESSIBLE members plus the
//! connections being opened for a caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{PooledResource, ResourceHolder, ResourceState, XaResource, XaResourceFactory};
use crate::config::PoolConfig;
use crate::coordinator::Transaction;
use crate::error::{PoolError, TmError};
use crate::management::ManagementRegistry;
use crate::manager::Services;
use crate::scheduler::{Task, TaskHandle, TaskScheduler};

/// Registered pools by unique name
pub type PoolRegistry = DashMap<String, Arc<ResourcePool>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSizes {
    pub in_pool: usize,
    pub acquired: usize,
    pub in_recovery: usize,
    pub total: usize,
    pub max: usize,
}

#[derive(Default)]
struct PoolState {
    members: Vec<Arc<PooledResource>>,
    /// IN_POOL members available for acquisition, oldest release first
    idle: VecDeque<Arc<PooledResource>>,
    /// Connections being opened
    opening: usize,
    /// Idle members lent to the recovery manager
    leased: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.members.len() + self.opening
    }

    fn contains(&self, resource: &Arc<PooledResource>) -> bool {
        self.members.iter().any(|m| Arc::ptr_eq(m, resource))
    }

    fn is_idle(&self, resource: &Arc<PooledResource>) -> bool {
        self.idle.iter().any(|m| Arc::ptr_eq(m, resource))
    }
}

enum Slot {
    Idle(Arc<PooledResource>),
    Open,
}

pub struct ResourcePool {
    config: PoolConfig,
    factory: Arc<dyn XaResourceFactory>,
    scheduler: TaskScheduler,
    management: Arc<ManagementRegistry>,
    registry: Weak<PoolRegistry>,
    self_ref: Weak<ResourcePool>,
    state: Mutex<PoolState>,
    available: Notify,
    next_id: AtomicU64,
    maintenance: Mutex<Option<TaskHandle>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("unique_name", &self.config.unique_name)
            .finish_non_exhaustive()
    }
}

impl ResourcePool {
    /// Create the pool and register it with `services`. Call [`init`](Self::init)
    /// before use.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn XaResourceFactory>,
        services: &Services,
    ) -> Result<Arc<Self>, TmError> {
        config.validate()?;

        let registry = services.pools();
        let pool = Arc::new_cyclic(|self_ref| Self {
            config,
            factory,
            scheduler: services.scheduler().clone(),
            management: services.management().clone(),
            registry: Arc::downgrade(registry),
            self_ref: self_ref.clone(),
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            maintenance: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        match registry.entry(pool.config.unique_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TmError::DuplicateResource(pool.config.unique_name.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(pool.clone());
            }
        }

        Ok(pool)
    }

    pub fn unique_name(&self) -> &str {
        &self.config.unique_name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sizes(&self) -> PoolSizes {
        let state = self.lock_state();
        let total = state.total();
        PoolSizes {
            in_pool: state.idle.len(),
            in_recovery: state.leased,
            acquired: total - state.idle.len() - state.leased,
            total,
            max: self.config.max_pool_size,
        }
    }

    /// Open `min_pool_size` connections and arm the maintenance task
    pub async fn init(&self) -> Result<(), PoolError> {
        self.fill_to_min().await?;
        self.arm_maintenance();
        info!(
            pool = %self.config.unique_name,
            min = self.config.min_pool_size,
            max = self.config.max_pool_size,
            "Resource pool initialized"
        );
        Ok(())
    }

    // ========================================================================
    // Acquire / release
    // ========================================================================

    /// Wait up to `acquisition_timeout` for an idle member or free capacity
    pub async fn acquire(&self) -> Result<Arc<PooledResource>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.config.acquisition_timeout();
        let mut test_failures = 0;

        loop {
            // Registered before the checks so a close or requeue in between is not missed
            let mut notified = std::pin::pin!(self.available.notified());
            notified.as_mut().enable();

            let slot = {
                let mut state = self.lock_state();
                if self.is_closed() {
                    return Err(PoolError::Closed(self.config.unique_name.clone()));
                }
                if let Some(resource) = state.idle.pop_front() {
                    Some(Slot::Idle(resource))
                } else if state.total() < self.config.max_pool_size {
                    state.opening += 1;
                    Some(Slot::Open)
                } else {
                    None
                }
            };

            let resource = match slot {
                Some(Slot::Idle(resource)) => resource,
                Some(Slot::Open) => self.open_member().await?,
                None => {
                    if Instant::now() >= deadline {
                        warn!(pool = %self.config.unique_name, "Resource pool exhausted");
                        return Err(PoolError::Exhausted {
                            name: self.config.unique_name.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                    continue;
                }
            };

            match resource.acquire().await {
                Ok(_) => {
                    debug!(pool = %self.config.unique_name, id = resource.id(), "Resource acquired");
                    return Ok(resource);
                }
                Err(e @ PoolError::TestFailed { .. }) => {
                    self.destroy(&resource);
                    test_failures += 1;
                    if test_failures > self.config.max_pool_size {
                        return Err(e);
                    }
                }
                Err(e) => {
                    if resource.state() == ResourceState::Closed {
                        self.destroy(&resource);
                    } else {
                        self.requeue(&resource);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Acquire a connection enlisted in `tx`.
    ///
    /// A NOT_ACCESSIBLE member still enlisted in `tx` is recycled and its
    /// branch re-joined; otherwise a fresh member is acquired and enlisted.
    pub async fn acquire_in(&self, tx: &Arc<Transaction>) -> Result<Arc<PooledResource>, TmError> {
        if let Some(resource) = self.find_recyclable(tx) {
            match resource.acquire().await {
                Ok(_) => {
                    let holder: Arc<dyn ResourceHolder> = resource.clone();
                    if let Err(e) = tx.enlist(holder).await {
                        self.release(&resource).await?;
                        return Err(e.into());
                    }
                    return Ok(resource);
                }
                Err(e) => {
                    debug!(id = resource.id(), error = %e, "Recycling lost a race, acquiring fresh");
                }
            }
        }

        let resource = self.acquire().await?;
        let holder: Arc<dyn ResourceHolder> = resource.clone();
        if let Err(e) = tx.enlist(holder).await {
            if let Err(release_err) = self.release(&resource).await {
                warn!(id = resource.id(), error = %release_err, "Release after failed enlist failed");
            }
            return Err(e.into());
        }
        Ok(resource)
    }

    fn find_recyclable(&self, tx: &Transaction) -> Option<Arc<PooledResource>> {
        let state = self.lock_state();
        state
            .members
            .iter()
            .find(|m| {
                m.state() == ResourceState::NotAccessible
                    && m.branch_id().is_some_and(|xid| xid.gtrid == tx.gtrid())
            })
            .cloned()
    }

    /// Return a connection; closed connections leave the pool
    pub async fn release(&self, resource: &Arc<PooledResource>) -> Result<(), PoolError> {
        match resource.release().await? {
            ResourceState::InPool => self.requeue(resource),
            ResourceState::Closed => self.destroy(resource),
            _ => {}
        }
        debug!(pool = %self.config.unique_name, id = resource.id(), state = %resource.state(), "Resource released");
        Ok(())
    }

    /// Make an IN_POOL member available again; idempotent
    pub(crate) fn requeue(&self, resource: &Arc<PooledResource>) {
        {
            let mut state = self.lock_state();
            if self.is_closed()
                || resource.state() != ResourceState::InPool
                || !state.contains(resource)
                || state.is_idle(resource)
            {
                return;
            }
            state.idle.push_back(resource.clone());
        }
        self.available.notify_one();
    }

    /// Drop a member from the pool; replacement is lazy
    fn destroy(&self, resource: &Arc<PooledResource>) {
        {
            let mut state = self.lock_state();
            state.members.retain(|m| !Arc::ptr_eq(m, resource));
            state.idle.retain(|m| !Arc::ptr_eq(m, resource));
        }
        debug!(pool = %self.config.unique_name, id = resource.id(), "Resource destroyed");
        self.available.notify_one();
    }

    /// Open one connection for a slot already counted in `opening`
    async fn open_member(&self) -> Result<Arc<PooledResource>, PoolError> {
        let driver = match self.factory.open().await {
            Ok(driver) => driver,
            Err(e) => {
                self.lock_state().opening -= 1;
                self.available.notify_one();
                warn!(pool = %self.config.unique_name, error = %e, "Cannot open connection");
                return Err(PoolError::Open {
                    name: self.config.unique_name.clone(),
                    source: e,
                });
            }
        };

        let resource = PooledResource::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            &self.config,
            driver,
            self.self_ref.clone(),
            self.management.clone(),
        );
        let admitted = {
            let mut state = self.lock_state();
            state.opening -= 1;
            let open = !self.is_closed();
            if open {
                state.members.push(resource.clone());
            }
            open
        };
        if !admitted {
            resource.close().await?;
            return Err(PoolError::Closed(self.config.unique_name.clone()));
        }

        debug!(pool = %self.config.unique_name, id = resource.id(), "Connection opened");
        Ok(resource)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn fill_to_min(&self) -> Result<(), PoolError> {
        loop {
            {
                let mut state = self.lock_state();
                if self.is_closed() || state.total() >= self.config.min_pool_size {
                    return Ok(());
                }
                state.opening += 1;
            }
            let resource = self.open_member().await?;
            self.requeue(&resource);
        }
    }

    /// Close idle members past `max_idle_time` while above `min_pool_size`
    async fn shrink(&self) {
        let max_idle = self.config.max_idle_time();
        let now = Instant::now();

        let expired: Vec<Arc<PooledResource>> = {
            let mut state = self.lock_state();
            let mut removable = state.total().saturating_sub(self.config.min_pool_size);
            let mut expired = Vec::new();
            state.idle.retain(|m| {
                if removable > 0 && m.idle_for(now) >= max_idle {
                    removable -= 1;
                    expired.push(m.clone());
                    false
                } else {
                    true
                }
            });
            state
                .members
                .retain(|m| !expired.iter().any(|e| Arc::ptr_eq(e, m)));
            expired
        };

        for resource in &expired {
            if let Err(e) = resource.close().await {
                warn!(id = resource.id(), error = %e, "Closing idle connection failed");
            }
        }
        if !expired.is_empty() {
            info!(
                pool = %self.config.unique_name,
                closed = expired.len(),
                "Idle connections closed"
            );
        }
    }

    fn arm_maintenance(&self) {
        let interval = self.config.max_idle_time();
        if self.is_closed() || interval.is_zero() {
            return;
        }

        let task = Box::new(PoolMaintenanceTask {
            pool: self.self_ref.clone(),
        });
        match self.scheduler.schedule_in(interval, task) {
            Ok(handle) => {
                *self.maintenance.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => debug!(pool = %self.config.unique_name, error = %e, "Maintenance not armed"),
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Lend an idle connection to the recovery manager until the lease drops
    pub async fn recovery_lease(&self) -> Result<RecoveryLease, PoolError> {
        let slot = {
            let mut state = self.lock_state();
            if self.is_closed() {
                return Err(PoolError::Closed(self.config.unique_name.clone()));
            }
            if let Some(resource) = state.idle.pop_front() {
                state.leased += 1;
                Some(Slot::Idle(resource))
            } else if state.total() < self.config.max_pool_size {
                state.opening += 1;
                Some(Slot::Open)
            } else {
                None
            }
        };

        let resource = match slot {
            Some(Slot::Idle(resource)) => resource,
            Some(Slot::Open) => {
                let resource = self.open_member().await?;
                self.lock_state().leased += 1;
                resource
            }
            None => {
                return Err(PoolError::Exhausted {
                    name: self.config.unique_name.clone(),
                    waited_ms: 0,
                });
            }
        };

        let pool = self
            .self_ref
            .upgrade()
            .ok_or_else(|| PoolError::Closed(self.config.unique_name.clone()))?;
        Ok(RecoveryLease { pool, resource })
    }

    fn end_lease(&self, resource: &Arc<PooledResource>) {
        {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
            if self.is_closed()
                || resource.state() != ResourceState::InPool
                || !state.contains(resource)
                || state.is_idle(resource)
            {
                return;
            }
            state.idle.push_back(resource.clone());
        }
        self.available.notify_one();
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close every member and deregister; only the first call does anything.
    ///
    /// Cancels maintenance but never starts the scheduler.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = maintenance {
            self.scheduler.cancel(&handle);
        }

        let members = {
            let mut state = self.lock_state();
            state.idle.clear();
            std::mem::take(&mut state.members)
        };
        for member in &members {
            if let Err(e) = member.close().await {
                warn!(id = member.id(), error = %e, "Closing pooled connection failed");
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.config.unique_name, |_, p| std::ptr::eq(Arc::as_ptr(p), self));
        }
        self.available.notify_waiters();

        info!(pool = %self.config.unique_name, closed = members.len(), "Resource pool closed");
        true
    }
}

/// Idle connection borrowed by the recovery manager
pub struct RecoveryLease {
    pool: Arc<ResourcePool>,
    resource: Arc<PooledResource>,
}

impl RecoveryLease {
    pub fn unique_name(&self) -> &str {
        self.pool.unique_name()
    }

    pub fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.resource.xa_resource()
    }
}

impl Drop for RecoveryLease {
    fn drop(&mut self) {
        self.pool.end_lease(&self.resource);
    }
}

struct PoolMaintenanceTask {
    pool: Weak<ResourcePool>,
}

#[async_trait]
impl Task for PoolMaintenanceTask {
    fn describe(&self) -> String {
        match self.pool.upgrade() {
            Some(pool) => format!("maintenance of pool {}", pool.unique_name()),
            None => "maintenance of a dropped pool".to_string(),
        }
    }

    async fn execute(&self) -> Result<(), TmError> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        if pool.is_closed() {
            return Ok(());
        }

        pool.arm_maintenance();
        pool.shrink().await;
        pool.fill_to_min().await?;
        Ok(())
    }
}
