//! Interfaces to the components surrounding the scheduler.
//!
//! Row execution, locking, and reply delivery are provided by the embedding
//! system. `testutil` has simple implementations of each.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use cinder_error::{DbError, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::fork::ForkId;
use crate::graph::RowOp;
use crate::graph::expr::Variables;
use crate::scheduler::Scheduler;
use crate::thread::ThreadId;
use crate::trx::TrxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Handle to a pending lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WaitId(pub u64);

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    /// The request was queued. The transaction is resumed through
    /// `Scheduler::end_lock_wait` once granted.
    WouldWait(WaitId),
}

/// Table level lock manager.
///
/// The scheduler calls into the lock manager while holding its global lock.
/// Implementations must never call back into the scheduler. Grants caused by
/// a release or cancel are returned to the scheduler instead.
pub trait LockManager: Debug + Sync + Send {
    fn try_acquire(&self, trx: TrxId, table: TableId, mode: LockMode) -> LockStatus;

    /// Release every lock and pending request held by `trx`.
    ///
    /// Returns the transactions whose waits were granted as a result.
    fn release_all(&self, trx: TrxId) -> Vec<TrxId>;

    /// Cancel a pending request.
    ///
    /// Returns None if the wait no longer exists (it was already granted or
    /// cancelled), otherwise the transactions granted as a result.
    fn cancel_wait(&self, wait: WaitId) -> Option<Vec<TrxId>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// Operation finished, move on to the next statement.
    Done,
    /// Operation has more work, step it again.
    Again,
    /// Operation can't make progress (e.g. waiting on a lock), release the
    /// thread.
    Stop,
}

/// Per-node state for a row operation, reset every time the node is entered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowOpState {
    pub rows_done: u64,
    pub lock_acquired: bool,
    pub calls: u64,
}

/// Executes leaf row operations.
pub trait RowOperator: Debug + Sync + Send {
    fn step(
        &self,
        op: &RowOp,
        state: &mut RowOpState,
        cx: &mut OperatorContext<'_>,
    ) -> Result<OpOutcome>;

    /// Called once when a thread's lifetime steps cross the parallelize limit.
    fn parallelize(&self, _thread: ThreadId, _op: Option<&RowOp>) {}
}

/// What a row operator may do with the thread it's running on.
pub struct OperatorContext<'a> {
    pub(crate) scheduler: &'a Scheduler,
    pub(crate) thread: ThreadId,
    pub(crate) trx: TrxId,
    pub(crate) vars: &'a Variables,
}

impl OperatorContext<'_> {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn trx(&self) -> TrxId {
        self.trx
    }

    pub fn var(&self, name: &str) -> Option<i64> {
        self.vars.get(name).copied()
    }

    /// Request a table lock for the transaction.
    ///
    /// On `WouldWait` the transaction is already in lock wait when this
    /// returns, the operator should return `OpOutcome::Stop`.
    pub fn acquire_lock(&mut self, table: TableId, mode: LockMode) -> LockStatus {
        self.scheduler.acquire_lock(self.trx, table, mode)
    }
}

impl Debug for OperatorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorContext")
            .field("thread", &self.thread)
            .field("trx", &self.trx)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum CommandOutcome {
    Completed,
    Failed(DbError),
}

impl CommandOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CommandOutcome::Failed(_))
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            CommandOutcome::Completed => Ok(()),
            CommandOutcome::Failed(e) => Err(e),
        }
    }
}

/// Receives the result of a command once every thread of its fork completes.
///
/// `command_finished` is called with the scheduler's global lock held.
/// Implementations must never call back into the scheduler.
pub trait ReplySink: Debug + Sync + Send {
    fn command_finished(&self, fork: ForkId, outcome: CommandOutcome);
}

/// Reply sink that queues outcomes for a waiting session.
#[derive(Debug, Default)]
pub struct CommandReply {
    outcomes: Mutex<VecDeque<CommandOutcome>>,
    cond: Condvar,
}

impl CommandReply {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until a command finishes.
    pub fn wait(&self) -> CommandOutcome {
        let mut outcomes = self.outcomes.lock();
        loop {
            if let Some(outcome) = outcomes.pop_front() {
                return outcome;
            }
            self.cond.wait(&mut outcomes);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<CommandOutcome> {
        let mut outcomes = self.outcomes.lock();
        if outcomes.is_empty() {
            let _ = self.cond.wait_while_for(&mut outcomes, |o| o.is_empty(), timeout);
        }
        outcomes.pop_front()
    }

    pub fn try_take(&self) -> Option<CommandOutcome> {
        self.outcomes.lock().pop_front()
    }
}

impl ReplySink for CommandReply {
    fn command_finished(&self, _fork: ForkId, outcome: CommandOutcome) {
        self.outcomes.lock().push_back(outcome);
        self.cond.notify_all();
    }
}

/// One unit of background work run by a utility thread.
pub trait UtilityTask: Debug + Sync + Send {
    /// Returns the amount of work done, subtracted from the thread type's
    /// meter. Zero means there's nothing to do right now.
    fn run_once(&self) -> Result<u32>;
}
