//! Pooled Resource State Machine
//!
//! ```text
//!            acquire                release (keep open until after 2PC)
//! IN_POOL ───────────► ACCESSIBLE ─────────────────────► NOT_ACCESSIBLE
//!    ▲                  │    ▲                                  │  │
//!    └──── release ─────┘    └───── acquire (recycle) ──────────┘  │
//!    ▲                                                             │
//!    └──────────────── transaction completed ──────────────────────┘
//!
//! any state except CLOSED ──close──► CLOSED (terminal)
//! ```
//!
//! Every transition goes through [`PooledResource::transition`], which runs
//! the built-in reactions and the registered [`StateListener`]s around the
//! state change.

use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::pool::ResourcePool;
use super::{HolderState, ResourceHolder, XaResource};
use crate::config::PoolConfig;
use crate::core_types::Xid;
use crate::error::PoolError;
use crate::management::{ManagementRegistry, ResourceSnapshot};
use crate::xa::{EndFlag, XaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Idle, available for acquisition
    InPool,
    /// Exclusively owned by one caller
    Accessible,
    /// Released by its caller but still enlisted in an unfinished transaction
    NotAccessible,
    /// Terminal
    Closed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::InPool => "IN_POOL",
            ResourceState::Accessible => "ACCESSIBLE",
            ResourceState::NotAccessible => "NOT_ACCESSIBLE",
            ResourceState::Closed => "CLOSED",
        }
    }

    pub fn can_transition_to(&self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (*self, to),
            (InPool, Accessible)
                | (Accessible, InPool)
                | (Accessible, NotAccessible)
                | (NotAccessible, Accessible)
                | (NotAccessible, InPool)
                | (InPool | Accessible | NotAccessible, Closed)
        )
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of state transitions
///
/// Hooks run synchronously on the thread performing the transition. A hook
/// must not request another transition of the same resource.
pub trait StateListener: Send + Sync {
    /// Called before the state changes; an `Err` vetoes the transition.
    /// Vetoes of a transition to CLOSED are ignored.
    fn state_changing(
        &self,
        _resource: &PooledResource,
        _from: ResourceState,
        _to: ResourceState,
    ) -> Result<(), String> {
        Ok(())
    }

    fn state_changed(&self, _resource: &PooledResource, _from: ResourceState, _to: ResourceState) {}
}

struct Inner {
    state: ResourceState,
    acquired_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    /// Monotonic twin of `released_at`, drives idle eviction
    idle_since: Instant,
    branch: Option<Weak<HolderState>>,
    recycled: u64,
}

/// One physical XA connection owned by a pool
pub struct PooledResource {
    id: u64,
    unique_name: String,
    driver: Arc<dyn XaResource>,
    test_query: Option<String>,
    keep_open_until_after_2pc: bool,
    self_ref: Weak<PooledResource>,
    pool: Weak<ResourcePool>,
    management: Arc<ManagementRegistry>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
    transition_lock: Mutex<()>,
    hook_thread: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResource")
            .field("id", &self.id)
            .field("unique_name", &self.unique_name)
            .finish_non_exhaustive()
    }
}

impl PooledResource {
    /// Wrap a freshly opened connection; starts IN_POOL
    pub fn new(
        id: u64,
        config: &PoolConfig,
        driver: Arc<dyn XaResource>,
        pool: Weak<ResourcePool>,
        management: Arc<ManagementRegistry>,
    ) -> Arc<Self> {
        let resource = Arc::new_cyclic(|self_ref| Self {
            id,
            unique_name: config.unique_name.clone(),
            driver,
            test_query: config.test_query.clone(),
            keep_open_until_after_2pc: config.keep_connection_open_until_after_2pc,
            self_ref: self_ref.clone(),
            pool,
            management: management.clone(),
            inner: Mutex::new(Inner {
                state: ResourceState::InPool,
                acquired_at: None,
                released_at: Some(Utc::now()),
                idle_since: Instant::now(),
                branch: None,
                recycled: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            transition_lock: Mutex::new(()),
            hook_thread: Mutex::new(None),
        });
        management.register(&resource);
        resource
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ResourceState {
        self.lock_inner().state
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_branch(&self) -> Option<Arc<HolderState>> {
        self.lock_inner().branch.as_ref().and_then(Weak::upgrade)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let inner = self.lock_inner();
        ResourceSnapshot {
            id: self.id,
            unique_name: self.unique_name.clone(),
            state: inner.state,
            acquired_at: inner.acquired_at,
            released_at: inner.released_at,
            gtrid: inner
                .branch
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|b| b.xid().gtrid),
            recycled: inner.recycled,
        }
    }

    /// Time of the last return to IN_POOL
    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        self.lock_inner().released_at
    }

    /// How long the connection has been sitting in IN_POOL
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock_inner().idle_since)
    }

    // ========================================================================
    // Transition function
    // ========================================================================

    /// Move to `to`, returning the previous state
    pub fn transition(&self, to: ResourceState) -> Result<ResourceState, PoolError> {
        let me = std::thread::current().id();
        if *self.hook_thread.lock().unwrap_or_else(|e| e.into_inner()) == Some(me) {
            return Err(PoolError::ReentrantTransition { id: self.id });
        }

        let _serial = self.transition_lock.lock().unwrap_or_else(|e| e.into_inner());
        *self.hook_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(me);
        let result = self.run_transition(to);
        *self.hook_thread.lock().unwrap_or_else(|e| e.into_inner()) = None;
        result
    }

    fn run_transition(&self, to: ResourceState) -> Result<ResourceState, PoolError> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(PoolError::InvalidTransition {
                id: self.id,
                from,
                to,
            });
        }

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        self.before_change(from, to)?;
        for listener in &listeners {
            if let Err(reason) = listener.state_changing(self, from, to) {
                if to == ResourceState::Closed {
                    warn!(id = self.id, reason = %reason, "Ignoring veto of close");
                    continue;
                }
                return Err(PoolError::Vetoed {
                    id: self.id,
                    from,
                    to,
                    reason,
                });
            }
        }

        self.lock_inner().state = to;
        self.after_change(from, to);
        for listener in &listeners {
            listener.state_changed(self, from, to);
        }

        debug!(
            id = self.id,
            resource = %self.unique_name,
            from = %from,
            to = %to,
            "Pooled resource state changed"
        );
        Ok(from)
    }

    fn before_change(&self, from: ResourceState, to: ResourceState) -> Result<(), PoolError> {
        if to == ResourceState::InPool
            && let Err(e) = self.driver.reset_session()
        {
            return Err(PoolError::Vetoed {
                id: self.id,
                from,
                to,
                reason: format!("session reset failed: {}", e),
            });
        }
        Ok(())
    }

    fn after_change(&self, from: ResourceState, to: ResourceState) {
        match (from, to) {
            (_, ResourceState::InPool) => {
                let mut inner = self.lock_inner();
                inner.released_at = Some(Utc::now());
                inner.idle_since = Instant::now();
                inner.branch = None;
            }
            (ResourceState::InPool, ResourceState::Accessible) => {
                self.lock_inner().acquired_at = Some(Utc::now());
            }
            (ResourceState::NotAccessible, ResourceState::Accessible) => {
                let mut inner = self.lock_inner();
                inner.recycled += 1;
                debug!(
                    id = self.id,
                    resource = %self.unique_name,
                    gtrid = ?inner.branch.as_ref().and_then(Weak::upgrade).map(|b| b.xid().gtrid),
                    "Pooled resource recycled"
                );
            }
            (_, ResourceState::Closed) => {
                self.delist();
                self.management.unregister(self.id);
            }
            _ => {}
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Hand the connection to a caller, returning the previous state.
    ///
    /// The test query runs only when leaving IN_POOL. A failed test closes the
    /// connection.
    pub async fn acquire(&self) -> Result<ResourceState, PoolError> {
        let previous = self.transition(ResourceState::Accessible)?;

        if previous == ResourceState::InPool
            && let Some(query) = &self.test_query
            && let Err(e) = self.driver.test(query).await
        {
            warn!(
                id = self.id,
                resource = %self.unique_name,
                error = %e,
                "Test query failed, closing connection"
            );
            if let Err(close_err) = self.close().await {
                warn!(id = self.id, error = %close_err, "Close after failed test failed");
            }
            return Err(PoolError::TestFailed {
                name: self.unique_name.clone(),
                source: e,
            });
        }

        Ok(previous)
    }

    /// Give the connection back, returning the state it ended up in.
    ///
    /// Ends a still-open branch first. Releasing a connection that is not
    /// ACCESSIBLE does nothing.
    pub async fn release(&self) -> Result<ResourceState, PoolError> {
        let state = self.state();
        if state != ResourceState::Accessible {
            return Ok(state);
        }

        let branch = self.current_branch();
        if let Some(branch) = &branch
            && let Err(e) = end_on_release(branch).await
        {
            warn!(xid = %branch.xid(), error = %e, "Ending branch on release failed");
        }

        let target = match &branch {
            Some(b) if self.keep_open_until_after_2pc && !b.is_completed() => {
                ResourceState::NotAccessible
            }
            _ => ResourceState::InPool,
        };

        match self.transition(target) {
            Ok(_) => Ok(target),
            Err(PoolError::Vetoed { reason, .. }) => {
                warn!(id = self.id, reason = %reason, "Release vetoed, closing connection");
                self.close().await?;
                Ok(ResourceState::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Close the connection; idempotent
    pub async fn close(&self) -> Result<(), PoolError> {
        match self.transition(ResourceState::Closed) {
            Ok(_) => {}
            Err(PoolError::InvalidTransition { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.driver.close().await {
            warn!(id = self.id, resource = %self.unique_name, error = %e, "Driver close failed");
        }
        Ok(())
    }
}

/// End a still-open branch, through its transaction when it has one
async fn end_on_release(branch: &HolderState) -> XaResult<()> {
    match branch.transaction() {
        Some(tx) => {
            tx.end_branch(branch.xid(), EndFlag::Success).await?;
        }
        None => {
            let flags = branch.flags();
            if flags.started && !flags.ended {
                branch.end(EndFlag::Success).await?;
            }
        }
    }
    Ok(())
}

impl ResourceHolder for PooledResource {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.driver.clone()
    }

    fn enlist(&self, state: &Arc<HolderState>) {
        self.lock_inner().branch = Some(Arc::downgrade(state));
    }

    fn delist(&self) -> Option<Arc<HolderState>> {
        self.lock_inner().branch.take().and_then(|w| w.upgrade())
    }

    fn branch_id(&self) -> Option<Xid> {
        self.current_branch().map(|b| b.xid())
    }

    fn is_participating(&self) -> bool {
        self.current_branch().is_some_and(|b| b.is_participating())
    }

    fn transaction_completed(&self, xid: Xid) {
        if self.branch_id() != Some(xid) {
            return;
        }

        if self.state() != ResourceState::NotAccessible {
            // Still with its caller (or already idle): just forget the branch
            self.delist();
            return;
        }

        match self.transition(ResourceState::InPool) {
            Ok(_) => {
                if let (Some(pool), Some(me)) = (self.pool.upgrade(), self.self_ref.upgrade()) {
                    pool.requeue(&me);
                }
            }
            Err(e) => {
                warn!(id = self.id, error = %e, "Requeue after completion failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Gtrid;
    use crate::resource::mock::{EventLog, MockXaResource, Op};
    use crate::xa::{StartFlag, XAER_RMFAIL};

    fn config(test_query: Option<&str>, keep_open: bool) -> PoolConfig {
        let mut config = PoolConfig::new("pds1", 0, 2);
        config.test_query = test_query.map(str::to_string);
        config.keep_connection_open_until_after_2pc = keep_open;
        config
    }

    fn pooled(
        config: &PoolConfig,
    ) -> (Arc<PooledResource>, Arc<MockXaResource>, Arc<ManagementRegistry>) {
        let driver = MockXaResource::new("pds1", EventLog::new());
        let management = ManagementRegistry::new();
        let resource = PooledResource::new(1, config, driver.clone(), Weak::new(), management.clone());
        (resource, driver, management)
    }

    async fn enlist(resource: &Arc<PooledResource>) -> Arc<HolderState> {
        let holder: Arc<dyn ResourceHolder> = resource.clone();
        let state = HolderState::new(Xid::new(Gtrid::from_raw(77), 1), holder, Weak::new());
        state.start(StartFlag::NoFlags).await.unwrap();
        resource.enlist(&state);
        state
    }

    #[test]
    fn test_transition_table() {
        use ResourceState::*;
        assert!(InPool.can_transition_to(Accessible));
        assert!(NotAccessible.can_transition_to(InPool));
        assert!(!InPool.can_transition_to(NotAccessible));
        assert!(!Accessible.can_transition_to(Accessible));
        assert!(!Closed.can_transition_to(InPool));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (resource, _, _) = pooled(&config(None, false));
        let err = resource.transition(ResourceState::NotAccessible).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidTransition {
                from: ResourceState::InPool,
                to: ResourceState::NotAccessible,
                ..
            }
        ));
        assert_eq!(resource.state(), ResourceState::InPool);
    }

    #[tokio::test]
    async fn test_acquire_runs_test_query_once_from_in_pool() {
        let (resource, driver, _) = pooled(&config(Some("SELECT 1"), true));

        assert_eq!(resource.acquire().await.unwrap(), ResourceState::InPool);
        assert_eq!(driver.count(Op::Test), 1);
        assert!(resource.snapshot().acquired_at.is_some());

        let branch = enlist(&resource).await;
        assert_eq!(resource.release().await.unwrap(), ResourceState::NotAccessible);
        assert!(branch.flags().ended);

        // Recycled from NOT_ACCESSIBLE: no test
        assert_eq!(resource.acquire().await.unwrap(), ResourceState::NotAccessible);
        assert_eq!(driver.count(Op::Test), 1);
        assert_eq!(resource.snapshot().recycled, 1);
        assert_eq!(resource.snapshot().gtrid, Some(Gtrid::from_raw(77)));
    }

    #[tokio::test]
    async fn test_failed_test_query_closes() {
        let (resource, driver, management) = pooled(&config(Some("SELECT 1"), false));
        driver.fail_next(Op::Test, XAER_RMFAIL, 1);
        assert_eq!(management.len(), 1);

        let err = resource.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::TestFailed { .. }));
        assert_eq!(resource.state(), ResourceState::Closed);
        assert_eq!(driver.count(Op::Close), 1);
        assert!(management.is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_resets_session() {
        let (resource, driver, _) = pooled(&config(None, false));
        resource.acquire().await.unwrap();

        assert_eq!(resource.release().await.unwrap(), ResourceState::InPool);
        assert_eq!(resource.release().await.unwrap(), ResourceState::InPool);
        assert_eq!(driver.count(Op::Reset), 1);
        assert!(resource.released_at().is_some());
    }

    #[tokio::test]
    async fn test_failed_reset_closes_on_release() {
        let (resource, driver, _) = pooled(&config(None, false));
        resource.acquire().await.unwrap();
        driver.fail_next(Op::Reset, XAER_RMFAIL, 1);

        assert_eq!(resource.release().await.unwrap(), ResourceState::Closed);
        assert_eq!(resource.state(), ResourceState::Closed);
    }

    #[tokio::test]
    async fn test_completion_returns_not_accessible_to_pool() {
        let (resource, _, _) = pooled(&config(None, true));
        resource.acquire().await.unwrap();
        let branch = enlist(&resource).await;
        resource.release().await.unwrap();
        assert_eq!(resource.state(), ResourceState::NotAccessible);

        // Completion of another branch is ignored
        resource.transaction_completed(Xid::new(Gtrid::from_raw(1), 1));
        assert_eq!(resource.state(), ResourceState::NotAccessible);

        branch.mark_completed();
        resource.transaction_completed(branch.xid());
        assert_eq!(resource.state(), ResourceState::InPool);
        assert_eq!(resource.branch_id(), None);
    }

    #[tokio::test]
    async fn test_completion_and_close_delist_branch() {
        let (resource, _, _) = pooled(&config(None, false));
        resource.acquire().await.unwrap();
        let branch = enlist(&resource).await;

        // Completed while still with its caller: the branch is detached
        resource.transaction_completed(branch.xid());
        assert_eq!(resource.branch_id(), None);
        assert_eq!(resource.state(), ResourceState::Accessible);

        resource.enlist(&branch);
        resource.close().await.unwrap();
        assert_eq!(resource.branch_id(), None);
        assert!(resource.delist().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (resource, driver, management) = pooled(&config(None, false));
        resource.close().await.unwrap();
        resource.close().await.unwrap();
        assert_eq!(driver.count(Op::Close), 1);
        assert!(management.is_empty());
        assert!(resource.acquire().await.is_err());
    }

    struct Recorder {
        events: Mutex<Vec<String>>,
        veto: bool,
        reenter: bool,
        reentry_error: Mutex<Option<PoolError>>,
    }

    impl Recorder {
        fn new(veto: bool, reenter: bool) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                veto,
                reenter,
                reentry_error: Mutex::new(None),
            })
        }
    }

    impl StateListener for Recorder {
        fn state_changing(
            &self,
            resource: &PooledResource,
            from: ResourceState,
            to: ResourceState,
        ) -> Result<(), String> {
            assert_eq!(resource.state(), from);
            self.events.lock().unwrap().push(format!("changing {from}->{to}"));
            if self.reenter {
                *self.reentry_error.lock().unwrap() = resource.transition(ResourceState::Closed).err();
            }
            if self.veto && matches!(to, ResourceState::Accessible | ResourceState::Closed) {
                return Err("maintenance".to_string());
            }
            Ok(())
        }

        fn state_changed(&self, resource: &PooledResource, from: ResourceState, to: ResourceState) {
            assert_eq!(resource.state(), to);
            self.events.lock().unwrap().push(format!("changed {from}->{to}"));
        }
    }

    #[tokio::test]
    async fn test_listener_order() {
        let (resource, _, _) = pooled(&config(None, false));
        let recorder = Recorder::new(false, false);
        resource.add_listener(recorder.clone());

        resource.acquire().await.unwrap();
        resource.release().await.unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "changing IN_POOL->ACCESSIBLE",
                "changed IN_POOL->ACCESSIBLE",
                "changing ACCESSIBLE->IN_POOL",
                "changed ACCESSIBLE->IN_POOL",
            ]
        );
    }

    #[tokio::test]
    async fn test_listener_veto() {
        let (resource, _, _) = pooled(&config(None, false));
        resource.add_listener(Recorder::new(true, false));

        let err = resource.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Vetoed { reason, .. } if reason == "maintenance"));
        assert_eq!(resource.state(), ResourceState::InPool);

        // Close cannot be vetoed
        resource.close().await.unwrap();
        assert_eq!(resource.state(), ResourceState::Closed);
    }

    #[test]
    fn test_reentrant_transition_rejected() {
        let (resource, _, _) = pooled(&config(None, false));
        let recorder = Recorder::new(false, true);
        resource.add_listener(recorder.clone());

        resource.transition(ResourceState::Accessible).unwrap();
        assert!(matches!(
            recorder.reentry_error.lock().unwrap().take(),
            Some(PoolError::ReentrantTransition { id: 1 })
        ));
        assert_eq!(resource.state(), ResourceState::Accessible);
    }
}
