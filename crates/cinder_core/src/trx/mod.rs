pub mod signal;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use cinder_error::DbError;
use serde::Serialize;
use signal::Signal;

use crate::fork::ForkId;
use crate::graph::QueryGraph;
use crate::ops::WaitId;
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrxId(pub u64);

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx#{}", self.0)
    }
}

/// What drives the transaction's threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Driver {
    /// Threads run on the worker pool through the task queue.
    Pool,
    /// Threads run inline on the client's OS thread.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxQueState {
    Running,
    LockWait { wait: WaitId, since: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrxErrorState {
    None,
    /// A lock wait is in progress. Recoverable.
    LockWait,
    LockWaitTimeout,
    Failed,
}

impl TrxErrorState {
    /// Threads of the transaction must stop and complete.
    pub fn is_failure(&self) -> bool {
        matches!(self, TrxErrorState::LockWaitTimeout | TrxErrorState::Failed)
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: TrxId,
    pub(crate) driver: Driver,
    pub(crate) state: TrxState,
    pub(crate) que_state: TrxQueState,
    pub(crate) error_state: TrxErrorState,
    /// Error reported with the next reply.
    pub(crate) error: Option<DbError>,
    pub(crate) active_thread_count: usize,
    pub(crate) signals: VecDeque<Signal>,
    pub(crate) handling_signals: bool,
    /// Fork currently bound.
    pub(crate) fork: Option<ForkId>,
    /// Fork that was bound before a rollback fork took over.
    pub(crate) suspended_fork: Option<ForkId>,
    /// Threads stopped on the current lock wait.
    pub(crate) wait_threads: Vec<ThreadId>,
    pub(crate) rollback_graph: Option<Arc<QueryGraph>>,
    pub(crate) signals_handled: u64,
}

/// Point in time view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionInfo {
    pub id: TrxId,
    pub driver: Driver,
    pub state: TrxState,
    pub in_lock_wait: bool,
    pub error_state: TrxErrorState,
    pub error: Option<String>,
    pub active_thread_count: usize,
    pub pending_signals: usize,
    pub handling_signals: bool,
    pub fork: Option<ForkId>,
    pub signals_handled: u64,
}

impl Transaction {
    pub(crate) fn new(id: TrxId, driver: Driver) -> Self {
        Transaction {
            id,
            driver,
            state: TrxState::Active,
            que_state: TrxQueState::Running,
            error_state: TrxErrorState::None,
            error: None,
            active_thread_count: 0,
            signals: VecDeque::new(),
            handling_signals: false,
            fork: None,
            suspended_fork: None,
            wait_threads: Vec::new(),
            rollback_graph: None,
            signals_handled: 0,
        }
    }

    pub(crate) fn in_lock_wait(&self) -> bool {
        matches!(self.que_state, TrxQueState::LockWait { .. })
    }

    /// Record a failure. The first error is kept.
    pub(crate) fn set_error(&mut self, error: DbError) {
        self.error_state = TrxErrorState::Failed;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            driver: self.driver,
            state: self.state,
            in_lock_wait: self.in_lock_wait(),
            error_state: self.error_state,
            error: self.error.as_ref().map(|e| e.get_msg().to_string()),
            active_thread_count: self.active_thread_count,
            pending_signals: self.signals.len(),
            handling_signals: self.handling_signals,
            fork: self.fork,
            signals_handled: self.signals_handled,
        }
    }
}
