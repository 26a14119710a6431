//! Scripted XA resources for tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use super::{HolderState, ResourceHolder, XaResource, XaResourceFactory};
use crate::core_types::Xid;
use crate::xa::{EndFlag, StartFlag, Vote, XAER_RMFAIL, XaError, XaResult, code_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Forget,
    Recover,
    Test,
    Reset,
    Close,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Start => "start",
            Op::End => "end",
            Op::Prepare => "prepare",
            Op::Commit => "commit",
            Op::Rollback => "rollback",
            Op::Forget => "forget",
            Op::Recover => "recover",
            Op::Test => "test",
            Op::Reset => "reset",
            Op::Close => "close",
        }
    }
}

/// Ordered record of calls across several resources
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    /// Events as `"<name> <op> <ok|CODE>"`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one operation, e.g. `"prepare"`
    pub fn of(&self, op: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.split(' ').nth(1) == Some(op))
            .collect()
    }
}

pub struct MockXaResource {
    name: String,
    log: Arc<EventLog>,
    calls: Mutex<HashMap<Op, usize>>,
    successes: Mutex<HashMap<Op, usize>>,
    failures: Mutex<HashMap<Op, VecDeque<XaError>>>,
    vote: Mutex<Vote>,
    in_doubt: Mutex<Vec<Xid>>,
    delays: Mutex<HashMap<Op, Duration>>,
    pub closed: AtomicBool,
}

impl MockXaResource {
    pub fn new(name: &str, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            calls: Mutex::new(HashMap::new()),
            successes: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            vote: Mutex::new(Vote::Commit),
            in_doubt: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail the next `times` calls of `op` with `code`
    pub fn fail_next(&self, op: Op, code: i32, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(XaError::new(
                code,
                format!("{} {} failed", self.name, op.as_str()),
            ));
        }
    }

    /// Every call of `op` takes `delay` before answering
    pub fn set_delay(&self, op: Op, delay: Duration) {
        self.delays.lock().unwrap().insert(op, delay);
    }

    async fn pause(&self, op: Op) {
        let delay = self.delays.lock().unwrap().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn set_vote(&self, vote: Vote) {
        *self.vote.lock().unwrap() = vote;
    }

    /// Branches reported by `recover`
    pub fn set_in_doubt(&self, xids: Vec<Xid>) {
        *self.in_doubt.lock().unwrap() = xids;
    }

    pub fn in_doubt(&self) -> Vec<Xid> {
        self.in_doubt.lock().unwrap().clone()
    }

    /// Calls of `op`, successful or not
    pub fn count(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn successes(&self, op: Op) -> usize {
        self.successes.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn call(&self, op: Op) -> XaResult<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(|q| q.pop_front());

        match scripted {
            Some(e) => {
                self.log
                    .push(format!("{} {} {}", self.name, op.as_str(), code_name(e.code)));
                Err(e)
            }
            None => {
                *self.successes.lock().unwrap().entry(op).or_default() += 1;
                self.log.push(format!("{} {} ok", self.name, op.as_str()));
                Ok(())
            }
        }
    }

    fn resolve(&self, xid: Xid) {
        self.in_doubt.lock().unwrap().retain(|x| *x != xid);
    }
}

#[async_trait]
impl XaResource for MockXaResource {
    async fn start(&self, _xid: Xid, _flag: StartFlag) -> XaResult<()> {
        self.call(Op::Start)
    }

    async fn end(&self, _xid: Xid, _flag: EndFlag) -> XaResult<()> {
        self.pause(Op::End).await;
        self.call(Op::End)
    }

    async fn prepare(&self, _xid: Xid) -> XaResult<Vote> {
        self.call(Op::Prepare)?;
        Ok(*self.vote.lock().unwrap())
    }

    async fn commit(&self, xid: Xid, _one_phase: bool) -> XaResult<()> {
        self.call(Op::Commit)?;
        self.resolve(xid);
        Ok(())
    }

    async fn rollback(&self, xid: Xid) -> XaResult<()> {
        self.call(Op::Rollback)?;
        self.resolve(xid);
        Ok(())
    }

    async fn forget(&self, xid: Xid) -> XaResult<()> {
        self.call(Op::Forget)?;
        self.resolve(xid);
        Ok(())
    }

    async fn recover(&self) -> XaResult<Vec<Xid>> {
        self.call(Op::Recover)?;
        Ok(self.in_doubt())
    }

    async fn test(&self, _query: &str) -> XaResult<()> {
        self.call(Op::Test)
    }

    fn reset_session(&self) -> XaResult<()> {
        self.call(Op::Reset)
    }

    async fn close(&self) -> XaResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.call(Op::Close)
    }
}

/// Factory handing out [`MockXaResource`]s named `<name>`
pub struct MockFactory {
    name: String,
    log: Arc<EventLog>,
    opened: Mutex<Vec<Arc<MockXaResource>>>,
    fail_open: AtomicBool,
    /// Test-query failures scripted on each newly opened connection
    test_failures: AtomicUsize,
}

impl MockFactory {
    pub fn new(name: &str, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            opened: Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
            test_failures: AtomicUsize::new(0),
        })
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// The next `count` connections fail their first test query
    pub fn fail_tests_on_open(&self, count: usize) {
        self.test_failures.store(count, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Arc<MockXaResource>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// The mock behind a driver handed out by this factory
    pub fn resource_of(&self, driver: &Arc<dyn XaResource>) -> Option<Arc<MockXaResource>> {
        let target = Arc::as_ptr(driver) as *const ();
        self.opened()
            .into_iter()
            .find(|r| Arc::as_ptr(r) as *const () == target)
    }
}

#[async_trait]
impl XaResourceFactory for MockFactory {
    async fn open(&self) -> XaResult<Arc<dyn XaResource>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(XaError::new(XAER_RMFAIL, format!("{} unreachable", self.name)));
        }

        let resource = MockXaResource::new(&self.name, self.log.clone());
        if self
            .test_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            resource.fail_next(Op::Test, XAER_RMFAIL, 1);
        }
        self.opened.lock().unwrap().push(resource.clone());
        Ok(resource)
    }
}

/// Minimal holder over a mock resource, without any pool
pub struct MockHolder {
    resource: Arc<MockXaResource>,
    branch: Mutex<Option<Weak<HolderState>>>,
    completed: Mutex<Vec<Xid>>,
}

impl MockHolder {
    pub fn new(resource: Arc<MockXaResource>) -> Arc<Self> {
        Arc::new(Self {
            resource,
            branch: Mutex::new(None),
            completed: Mutex::new(Vec::new()),
        })
    }

    pub fn completed(&self) -> Vec<Xid> {
        self.completed.lock().unwrap().clone()
    }

    fn current(&self) -> Option<Arc<HolderState>> {
        self.branch.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl ResourceHolder for MockHolder {
    fn unique_name(&self) -> &str {
        self.resource.name()
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.resource.clone()
    }

    fn enlist(&self, state: &Arc<HolderState>) {
        *self.branch.lock().unwrap() = Some(Arc::downgrade(state));
    }

    fn delist(&self) -> Option<Arc<HolderState>> {
        self.branch.lock().unwrap().take().and_then(|w| w.upgrade())
    }

    fn branch_id(&self) -> Option<Xid> {
        self.current().map(|s| s.xid())
    }

    fn is_participating(&self) -> bool {
        self.current().is_some_and(|s| s.is_participating())
    }

    fn transaction_completed(&self, xid: Xid) {
        self.completed.lock().unwrap().push(xid);
        if self.branch_id() == Some(xid) {
            self.delist();
        }
    }
}
