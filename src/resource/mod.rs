//! Resource Layer
//!
//! Driver boundary and pooled connections.
//!
//! - [`XaResource`] - one XA connection as exposed by a driver
//! - [`XaResourceFactory`] - opens new connections for a pool
//! - [`ResourceHolder`] - what the coordinator needs from an enlisted connection
//! - [`HolderState`] - one enlistment of a holder in a transaction branch
//! - [`PooledResource`] - a pooled connection and its state machine
//! - [`ResourcePool`] - bounded set of pooled connections

pub mod holder;
pub mod pool;
pub mod pooled;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core_types::Xid;
use crate::xa::{EndFlag, StartFlag, Vote, XaResult};

pub use holder::{BranchFlags, HolderState};
pub use pool::{PoolRegistry, PoolSizes, RecoveryLease, ResourcePool};
pub use pooled::{PooledResource, ResourceState, StateListener};

/// One XA connection
///
/// All methods fail with an [`XaError`](crate::xa::XaError) carrying the
/// resource manager's code.
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Associate the connection with a branch
    async fn start(&self, xid: Xid, flag: StartFlag) -> XaResult<()>;

    /// Dissociate the connection from a branch
    async fn end(&self, xid: Xid, flag: EndFlag) -> XaResult<()>;

    async fn prepare(&self, xid: Xid) -> XaResult<Vote>;

    async fn commit(&self, xid: Xid, one_phase: bool) -> XaResult<()>;

    async fn rollback(&self, xid: Xid) -> XaResult<()>;

    /// Discard the resource's memory of a heuristically completed branch
    async fn forget(&self, xid: Xid) -> XaResult<()>;

    /// Branches prepared on this resource and still waiting for a decision
    async fn recover(&self) -> XaResult<Vec<Xid>>;

    /// Run a connection test query
    async fn test(&self, query: &str) -> XaResult<()>;

    /// Restore the connection's local session defaults (auto-commit on)
    fn reset_session(&self) -> XaResult<()>;

    async fn close(&self) -> XaResult<()>;
}

/// Opens physical connections for a pool
#[async_trait]
pub trait XaResourceFactory: Send + Sync {
    async fn open(&self) -> XaResult<Arc<dyn XaResource>>;
}

/// Capabilities the coordinator relies on for an enlisted connection
pub trait ResourceHolder: Send + Sync {
    /// Name of the resource (pool) this connection belongs to
    fn unique_name(&self) -> &str;

    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// Attach the branch this holder now works for
    fn enlist(&self, state: &Arc<HolderState>);

    /// Detach the current branch, returning it if it is still alive
    fn delist(&self) -> Option<Arc<HolderState>>;

    /// Xid of the attached branch
    fn branch_id(&self) -> Option<Xid>;

    /// Whether the attached branch is started, not ended and not suspended
    fn is_participating(&self) -> bool;

    /// The transaction owning `xid` finished both phases
    fn transaction_completed(&self, xid: Xid);
}
