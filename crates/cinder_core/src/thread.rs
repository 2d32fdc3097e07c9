use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::fork::{ForkContext, ForkId};
use crate::graph::{NodeId, QueryGraph};
use crate::trx::{Driver, TrxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ThreadState {
    CommandWait,
    Running,
    Suspended,
    LockWait,
    ProcedureWait,
    SignalReplyWait,
    Completed,
}

impl ThreadState {
    /// Waiting on something that will resume it without a new command.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ThreadState::LockWait | ThreadState::ProcedureWait | ThreadState::SignalReplyWait
        )
    }
}

/// Where a thread continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Continuation {
    /// Arriving at the node from above.
    Enter(NodeId),
    /// Returning to the node after a child (or a wait) finished.
    Resume(NodeId),
}

impl Continuation {
    pub fn node(&self) -> NodeId {
        match self {
            Self::Enter(n) | Self::Resume(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub continuation: Continuation,
    /// Node executed by the previous step.
    pub prev: Option<NodeId>,
}

impl Cursor {
    pub fn start(thread_node: NodeId) -> Self {
        Cursor {
            continuation: Continuation::Enter(thread_node),
            prev: None,
        }
    }
}

#[derive(Debug)]
pub struct QueryThread {
    pub(crate) id: ThreadId,
    pub(crate) fork: ForkId,
    /// Thread boundary node in the fork's graph.
    pub(crate) node: NodeId,
    pub(crate) state: ThreadState,
    pub(crate) is_active: bool,
    /// Position as of the last check-in.
    pub(crate) cursor: Cursor,
    /// Lifetime steps.
    pub(crate) resource: u64,
    /// Callee fork to start once this thread is released.
    pub(crate) pending_call: Option<ForkId>,
}

/// Point in time view of a query thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub fork: ForkId,
    pub state: ThreadState,
    pub is_active: bool,
    /// Stale while the thread is active.
    pub cursor: Cursor,
    pub resource: u64,
}

impl QueryThread {
    pub(crate) fn new(id: ThreadId, fork: ForkId, node: NodeId) -> Self {
        QueryThread {
            id,
            fork,
            node,
            state: ThreadState::CommandWait,
            is_active: false,
            cursor: Cursor::start(node),
            resource: 0,
            pending_call: None,
        }
    }

    pub(crate) fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            fork: self.fork,
            state: self.state,
            is_active: self.is_active,
            cursor: self.cursor,
            resource: self.resource,
        }
    }
}

/// Ownership of a running query thread.
///
/// Exists exactly while the thread is active. Created when the thread is
/// moved to running and consumed by `Scheduler::release`. Dropping one
/// without releasing leaks the thread's active count and is a bug.
#[must_use]
pub struct ActiveThread {
    pub(crate) id: ThreadId,
    pub(crate) fork: ForkId,
    pub(crate) trx: TrxId,
    pub(crate) driver: Driver,
    pub(crate) graph: Arc<QueryGraph>,
    pub(crate) cursor: Cursor,
    pub(crate) ctx: ForkContext,
    pub(crate) resource: u64,
}

impl ActiveThread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn fork(&self) -> ForkId {
        self.fork
    }

    pub fn trx(&self) -> TrxId {
        self.trx
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn resource(&self) -> u64 {
        self.resource
    }

    pub fn var(&self, name: &str) -> Option<i64> {
        self.ctx.vars.get(name).copied()
    }
}

impl fmt::Debug for ActiveThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveThread")
            .field("id", &self.id)
            .field("fork", &self.fork)
            .field("trx", &self.trx)
            .field("graph", &self.graph.name())
            .field("cursor", &self.cursor)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}
