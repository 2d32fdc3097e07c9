use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::graph::QueryGraph;
use crate::graph::expr::Variables;
use crate::ops::{ReplySink, RowOpState};
use crate::thread::ThreadId;
use crate::trx::TrxId;
use crate::trx::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ForkId(pub u64);

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fork#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ForkKind {
    /// A statement submitted by a session.
    Statement,
    /// Instantiated by a procedure call node.
    Procedure,
    /// Runs the rollback graph on behalf of a rollback signal. Not suspended
    /// by pending signals.
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ForkState {
    /// Waiting for the next command. Running threads stop at their next check.
    CommandWait,
    Active,
}

/// Who gets told when every thread in the fork completes.
pub enum ForkOwner {
    /// Reply to a session.
    Session(Arc<dyn ReplySink>),
    /// Resume the calling thread of a procedure call.
    Caller(ThreadId),
    /// Finish handling a rollback signal.
    Signal(Signal),
}

impl fmt::Debug for ForkOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(_) => write!(f, "Session"),
            Self::Caller(thread) => f.debug_tuple("Caller").field(thread).finish(),
            Self::Signal(signal) => f.debug_tuple("Signal").field(&signal.kind).finish(),
        }
    }
}

/// Per-node execution state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeState {
    #[default]
    Idle,
    For {
        end: i64,
    },
    Row(RowOpState),
}

/// Mutable execution state shared by the threads of a fork.
///
/// Checked out into the `ActiveThread` while one of the fork's threads runs.
#[derive(Debug, Clone, Default)]
pub struct ForkContext {
    pub vars: Variables,
    pub(crate) node_states: Vec<NodeState>,
}

impl ForkContext {
    pub(crate) fn new(graph: &QueryGraph, vars: Variables) -> Self {
        ForkContext {
            vars,
            node_states: vec![NodeState::Idle; graph.num_nodes()],
        }
    }

    pub(crate) fn reset_node_states(&mut self) {
        self.node_states.fill(NodeState::Idle);
    }
}

#[derive(Debug)]
pub struct Fork {
    pub(crate) id: ForkId,
    pub(crate) kind: ForkKind,
    pub(crate) state: ForkState,
    pub(crate) trx: TrxId,
    pub(crate) graph: Arc<QueryGraph>,
    /// Threads in graph order.
    pub(crate) threads: Vec<ThreadId>,
    pub(crate) active_thread_count: usize,
    pub(crate) owner: ForkOwner,
    /// None while checked out by a running thread.
    pub(crate) ctx: Option<ForkContext>,
}

/// Point in time view of a fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkInfo {
    pub id: ForkId,
    pub kind: ForkKind,
    pub state: ForkState,
    pub trx: TrxId,
    pub graph: String,
    pub threads: Vec<ThreadId>,
    pub active_thread_count: usize,
}

impl Fork {
    pub(crate) fn info(&self) -> ForkInfo {
        ForkInfo {
            id: self.id,
            kind: self.kind,
            state: self.state,
            trx: self.trx,
            graph: self.graph.name().to_string(),
            threads: self.threads.clone(),
            active_thread_count: self.active_thread_count,
        }
    }
}
