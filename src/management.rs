//! Read-only management view of pooled connections
//!
//! Pooled resources register on creation and deregister when they close.
//! External collaborators poll [`ManagementRegistry::snapshots`].

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core_types::Gtrid;
use crate::resource::{PooledResource, ResourceState};

/// Observable attributes of one pooled connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub id: u64,
    pub unique_name: String,
    pub state: ResourceState,
    pub acquired_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    /// Transaction the connection is currently enlisted in
    pub gtrid: Option<Gtrid>,
    /// Times the connection was taken back from NOT_ACCESSIBLE
    pub recycled: u64,
}

#[derive(Default)]
pub struct ManagementRegistry {
    resources: DashMap<u64, Weak<PooledResource>>,
}

impl ManagementRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, resource: &Arc<PooledResource>) {
        self.resources.insert(resource.id(), Arc::downgrade(resource));
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.resources.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Snapshots of every live registered resource, ordered by id
    pub fn snapshots(&self) -> Vec<ResourceSnapshot> {
        let live: Vec<Arc<PooledResource>> = self
            .resources
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        let mut snapshots: Vec<_> = live.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Snapshots of one pool's resources
    pub fn snapshots_of(&self, unique_name: &str) -> Vec<ResourceSnapshot> {
        self.snapshots()
            .into_iter()
            .filter(|s| s.unique_name == unique_name)
            .collect()
    }
}
