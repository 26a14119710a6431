//! Enlistment state of one branch
//!
//! ```text
//! start(NoFlags) ──► participating ──end(Suspend)──► suspended
//!                         │   ▲                           │
//!                         │   └──────start(Resume)────────┘
//!                    end(Success|Fail)
//!                         ▼
//!                       ended ──start(Join)──► participating
//! ```

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{ResourceHolder, XaResource};
use crate::coordinator::Transaction;
use crate::core_types::Xid;
use crate::xa::{EndFlag, ErrorClass, StartFlag, XAER_PROTO, XaError, XaResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchFlags {
    pub started: bool,
    pub ended: bool,
    pub suspended: bool,
    /// Both phases are over for this branch
    pub completed: bool,
}

impl BranchFlags {
    pub fn is_participating(&self) -> bool {
        self.started && !self.ended && !self.suspended
    }
}

/// One holder's participation in one branch
pub struct HolderState {
    xid: Xid,
    unique_name: String,
    holder: Arc<dyn ResourceHolder>,
    /// Owner of the branch; ending through it serializes with both phases
    transaction: Weak<Transaction>,
    flags: Mutex<BranchFlags>,
}

impl std::fmt::Debug for HolderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolderState")
            .field("xid", &self.xid)
            .field("unique_name", &self.unique_name)
            .field("flags", &self.flags())
            .finish()
    }
}

impl HolderState {
    pub fn new(
        xid: Xid,
        holder: Arc<dyn ResourceHolder>,
        transaction: Weak<Transaction>,
    ) -> Arc<Self> {
        Arc::new(Self {
            xid,
            unique_name: holder.unique_name().to_string(),
            holder,
            transaction,
            flags: Mutex::new(BranchFlags::default()),
        })
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn holder(&self) -> &Arc<dyn ResourceHolder> {
        &self.holder
    }

    pub fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.holder.xa_resource()
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.upgrade()
    }

    pub fn flags(&self) -> BranchFlags {
        *self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local commit/rollback on the connection is forbidden while this holds
    pub fn is_participating(&self) -> bool {
        self.flags().is_participating()
    }

    pub fn is_completed(&self) -> bool {
        self.flags().completed
    }

    pub(crate) fn mark_completed(&self) {
        self.flags.lock().unwrap_or_else(|e| e.into_inner()).completed = true;
    }

    fn update(&self, f: impl FnOnce(&mut BranchFlags)) {
        f(&mut self.flags.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// XA `start` with flag validation against the current flags
    pub async fn start(&self, flag: StartFlag) -> XaResult<()> {
        let flags = self.flags();
        let allowed = match flag {
            StartFlag::NoFlags => !flags.started,
            StartFlag::Join => flags.started && flags.ended && !flags.completed,
            StartFlag::Resume => flags.suspended && !flags.ended,
        };
        if !allowed {
            return Err(XaError::new(
                XAER_PROTO,
                format!("cannot start branch {} with {:?} from {:?}", self.xid, flag, flags),
            ));
        }

        self.xa_resource().start(self.xid, flag).await?;
        debug!(xid = %self.xid, resource = %self.unique_name, ?flag, "Branch started");

        self.update(|f| {
            f.started = true;
            f.ended = false;
            f.suspended = false;
        });
        Ok(())
    }

    /// XA `end`. A rollback-class failure still ends the association.
    pub async fn end(&self, flag: EndFlag) -> XaResult<()> {
        let flags = self.flags();
        let allowed = match flag {
            EndFlag::Success | EndFlag::Fail => flags.started && !flags.ended,
            EndFlag::Suspend => flags.is_participating(),
        };
        if !allowed {
            return Err(XaError::new(
                XAER_PROTO,
                format!("cannot end branch {} with {:?} from {:?}", self.xid, flag, flags),
            ));
        }

        match self.xa_resource().end(self.xid, flag).await {
            Ok(()) => {
                debug!(xid = %self.xid, resource = %self.unique_name, ?flag, "Branch ended");
                self.update(|f| match flag {
                    EndFlag::Suspend => f.suspended = true,
                    EndFlag::Success | EndFlag::Fail => {
                        f.ended = true;
                        f.suspended = false;
                    }
                });
                Ok(())
            }
            Err(e) => {
                if e.class() == ErrorClass::RolledBack {
                    self.update(|f| {
                        f.ended = true;
                        f.suspended = false;
                    });
                }
                Err(e)
            }
        }
    }
}
