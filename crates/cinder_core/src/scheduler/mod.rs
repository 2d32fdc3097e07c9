//! Query thread scheduling.
//!
//! All structural state (forks, threads, transactions, slots, meters) lives
//! in a single `SchedulerState` behind one mutex. Query threads are stepped
//! without holding it, the lock is only taken for stop checks, releases, and
//! the operations below.

mod coordinator;
mod run;
mod stepper;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use cinder_error::{DbError, OptionExt, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
pub use stepper::Step;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::fork::{Fork, ForkId, ForkInfo, ForkKind, ForkOwner, ForkState};
use crate::graph::QueryGraph;
use crate::graph::expr::Variables;
use crate::ops::{LockManager, ReplySink, RowOperator};
use crate::server::SlotTable;
use crate::thread::{ActiveThread, QueryThread, ThreadId, ThreadInfo};
use crate::trx::signal::{Signal, SignalHandler, SignalKind};
use crate::trx::{Driver, Transaction, TransactionInfo, TrxId, TrxState};

/// External components the scheduler drives.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub row_operator: Arc<dyn RowOperator>,
    pub lock_manager: Arc<dyn LockManager>,
    pub signal_handler: Arc<dyn SignalHandler>,
}

/// Counters describing what the scheduler has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub threads_activated: u64,
    pub threads_released: u64,
    /// Releases where the reason to stop went away before the lock was taken.
    pub release_reruns: u64,
    pub signals_dispatched: u64,
    pub round_robins: u64,
    pub lock_wait_timeouts: u64,
    pub priority_boosts: u64,
    pub tasks_enqueued: u64,
}

/// Everything protected by the global scheduler lock.
#[derive(Debug)]
pub(crate) struct SchedulerState {
    next_id: u64,
    pub(crate) forks: HashMap<ForkId, Fork>,
    pub(crate) threads: HashMap<ThreadId, QueryThread>,
    pub(crate) trxs: HashMap<TrxId, Transaction>,
    /// Runnable pool-driven threads.
    pub(crate) tasks: VecDeque<ActiveThread>,
    /// Resumed client-driven threads waiting for their caller to pick them up.
    pub(crate) client_ready: HashMap<TrxId, ActiveThread>,
    pub(crate) slots: SlotTable,
    pub(crate) stats: SchedulerStats,
    pub(crate) shutdown: bool,
}

impl SchedulerState {
    fn new() -> Self {
        SchedulerState {
            next_id: 1,
            forks: HashMap::new(),
            threads: HashMap::new(),
            trxs: HashMap::new(),
            tasks: VecDeque::new(),
            client_ready: HashMap::new(),
            slots: SlotTable::default(),
            stats: SchedulerStats::default(),
            shutdown: false,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn fork(&self, id: ForkId) -> &Fork {
        self.forks.get(&id).expect("fork to exist")
    }

    pub(crate) fn fork_mut(&mut self, id: ForkId) -> &mut Fork {
        self.forks.get_mut(&id).expect("fork to exist")
    }

    pub(crate) fn thread(&self, id: ThreadId) -> &QueryThread {
        self.threads.get(&id).expect("thread to exist")
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut QueryThread {
        self.threads.get_mut(&id).expect("thread to exist")
    }

    pub(crate) fn trx(&self, id: TrxId) -> &Transaction {
        self.trxs.get(&id).expect("transaction to exist")
    }

    pub(crate) fn trx_mut(&mut self, id: TrxId) -> &mut Transaction {
        self.trxs.get_mut(&id).expect("transaction to exist")
    }

    fn try_fork(&self, id: ForkId) -> Result<&Fork> {
        self.forks
            .get(&id)
            .ok_or_else(|| DbError::new("Unknown fork").with_field("fork", id))
    }

    fn try_trx(&self, id: TrxId) -> Result<&Transaction> {
        self.trxs
            .get(&id)
            .ok_or_else(|| DbError::new("Unknown transaction").with_field("trx", id))
    }
}

/// Scheduler context shared by every OS thread driving query threads.
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    pub(crate) row_operator: Arc<dyn RowOperator>,
    pub(crate) lock_manager: Arc<dyn LockManager>,
    pub(crate) signal_handler: Arc<dyn SignalHandler>,
    state: Mutex<SchedulerState>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn try_new(config: SchedulerConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Scheduler {
            config,
            row_operator: collaborators.row_operator,
            lock_manager: collaborators.lock_manager,
            signal_handler: collaborators.signal_handler,
            state: Mutex::new(SchedulerState::new()),
        }))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Acquire the global scheduler lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock()
    }

    pub fn begin_transaction(&self, driver: Driver) -> TrxId {
        let mut state = self.lock();
        let id = TrxId(state.next_id());
        state.trxs.insert(id, Transaction::new(id, driver));
        debug!(trx = %id, ?driver, "began transaction");
        id
    }

    /// Graph run in a rollback fork when the transaction is rolled back.
    pub fn set_rollback_graph(&self, trx: TrxId, graph: Arc<QueryGraph>) -> Result<()> {
        let mut state = self.lock();
        state.try_trx(trx)?;
        state.trx_mut(trx).rollback_graph = Some(graph);
        Ok(())
    }

    /// Remove a transaction. All of its forks must have been freed.
    ///
    /// Locks still held by a transaction that never committed or rolled back
    /// are released, resuming anyone waiting on them.
    pub fn end_transaction(&self, trx: TrxId) -> Result<()> {
        let mut state = self.lock();
        let t = state.try_trx(trx)?;
        if t.active_thread_count != 0 || t.handling_signals || !t.signals.is_empty() {
            return Err(DbError::new("Transaction is still executing").with_field("trx", trx));
        }
        let trx_state = t.state;
        if state.forks.values().any(|f| f.trx == trx) {
            return Err(DbError::new("Transaction still has forks").with_field("trx", trx));
        }
        if trx_state == TrxState::Active {
            debug!(%trx, "ending open transaction, releasing its locks");
            self.release_trx_locks(&mut state, trx);
        }
        state.trxs.remove(&trx);
        debug!(%trx, "ended transaction");
        Ok(())
    }

    /// Create a statement fork for `graph`, replying to `reply` whenever a
    /// command on it finishes.
    pub fn create_fork(
        &self,
        trx: TrxId,
        graph: Arc<QueryGraph>,
        reply: Arc<dyn ReplySink>,
    ) -> Result<ForkId> {
        let mut state = self.lock();
        state.try_trx(trx)?;
        Ok(self.create_fork_locked(
            &mut state,
            trx,
            graph,
            ForkKind::Statement,
            ForkOwner::Session(reply),
            Variables::new(),
        ))
    }

    /// Set a variable in an idle fork.
    pub fn set_var(&self, fork: ForkId, name: impl Into<String>, value: i64) -> Result<()> {
        let mut state = self.lock();
        state.try_fork(fork)?;
        let ctx = state
            .fork_mut(fork)
            .ctx
            .as_mut()
            .required("idle fork context")?;
        ctx.vars.insert(name.into(), value);
        Ok(())
    }

    /// Start the next command on a fork, returning the thread to run.
    ///
    /// Binds the fork to its transaction. Resumes a suspended thread if there
    /// is one, otherwise restarts the fork from the top.
    pub fn start_command(&self, fork: ForkId) -> Result<ActiveThread> {
        let mut state = self.lock();
        self.start_command_locked(&mut state, fork)
    }

    /// Start the next command on a pool-driven fork and queue it for the
    /// worker pool.
    pub fn submit(&self, fork: ForkId) -> Result<()> {
        let mut state = self.lock();
        let trx = state.try_fork(fork)?.trx;
        if state.trx(trx).driver != Driver::Pool {
            return Err(DbError::new("Only pool-driven forks can be submitted")
                .with_field("fork", fork));
        }
        let thread = self.start_command_locked(&mut state, fork)?;
        self.enqueue_task_locked(&mut state, thread);
        Ok(())
    }

    /// Put a fork into command wait. Its running thread suspends at the next
    /// stop check.
    pub fn stop_fork(&self, fork: ForkId) -> Result<()> {
        let mut state = self.lock();
        state.try_fork(fork)?;
        state.fork_mut(fork).state = ForkState::CommandWait;
        Ok(())
    }

    /// Unbind the transaction's current fork.
    pub fn detach_fork(&self, trx: TrxId) -> Result<()> {
        let mut state = self.lock();
        let Some(fork) = state.try_trx(trx)?.fork else {
            return Ok(());
        };
        self.check_fork_idle(&state, fork)?;
        state.trx_mut(trx).fork = None;
        Ok(())
    }

    /// Destroy a fork. The fork must be idle and unbound.
    pub fn free_fork(&self, fork: ForkId) -> Result<()> {
        let mut state = self.lock();
        let trx = state.try_fork(fork)?.trx;
        self.check_fork_idle(&state, fork)?;
        if state.trx(trx).fork == Some(fork) || state.trx(trx).suspended_fork == Some(fork) {
            return Err(DbError::new("Fork is still bound to its transaction")
                .with_field("fork", fork)
                .with_field("trx", trx));
        }
        self.remove_fork(&mut state, fork);
        Ok(())
    }

    fn check_fork_idle(&self, state: &SchedulerState, fork: ForkId) -> Result<()> {
        let f = state.fork(fork);
        let waiting = f.threads.iter().any(|t| state.thread(*t).state.is_waiting());
        if f.active_thread_count != 0 || waiting {
            return Err(DbError::new("Fork has running or waiting threads").with_field("fork", fork));
        }
        Ok(())
    }

    /// Send a signal to a transaction from outside any query thread.
    ///
    /// Dispatched right away if the transaction has no active threads.
    pub fn send_signal(&self, trx: TrxId, kind: SignalKind) -> Result<()> {
        let mut state = self.lock();
        state.try_trx(trx)?;
        let mut next = None;
        self.send_signal_locked(&mut state, trx, Signal::new(kind, None), &mut next)?;
        if let Some(thread) = next {
            self.schedule_resumed(&mut state, thread);
        }
        Ok(())
    }

    /// Put the transaction in the failed state and queue the error for its
    /// next reply.
    pub fn record_error(&self, trx: TrxId, error: DbError) {
        let mut state = self.lock();
        let mut next = None;
        if let Err(e) = self.send_signal_locked(&mut state, trx, Signal::error(error), &mut next) {
            // Error signals are always accepted.
            panic!("failed to queue error signal: {e}");
        }
        if let Some(thread) = next {
            self.schedule_resumed(&mut state, thread);
        }
    }

    /// Resume a transaction whose lock request was granted.
    pub fn end_lock_wait(&self, trx: TrxId) {
        let mut state = self.lock();
        self.end_lock_wait_locked(&mut state, trx);
    }

    pub fn thread_info(&self, thread: ThreadId) -> Option<ThreadInfo> {
        self.lock().threads.get(&thread).map(|t| t.info())
    }

    pub fn fork_info(&self, fork: ForkId) -> Option<ForkInfo> {
        self.lock().forks.get(&fork).map(|f| f.info())
    }

    pub fn transaction_info(&self, trx: TrxId) -> Option<TransactionInfo> {
        self.lock().trxs.get(&trx).map(|t| t.info())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.lock().stats
    }

    /// Check active thread accounting across every fork and transaction.
    pub fn validate(&self) -> Result<()> {
        let state = self.lock();

        for fork in state.forks.values() {
            let active = fork
                .threads
                .iter()
                .filter(|t| state.thread(**t).is_active)
                .count();
            if active != fork.active_thread_count {
                return Err(DbError::new("Fork active count mismatch")
                    .with_field("fork", fork.id)
                    .with_field("counted", fork.active_thread_count)
                    .with_field("active", active));
            }
            if fork.ctx.is_some() == (active > 0) {
                return Err(DbError::new("Fork context checked out by the wrong number of threads")
                    .with_field("fork", fork.id)
                    .with_field("active", active));
            }
            let bound = state.trx(fork.trx).fork == Some(fork.id);
            if !bound && active != 0 {
                return Err(DbError::new("Unbound fork has active threads")
                    .with_field("fork", fork.id));
            }
        }

        for trx in state.trxs.values() {
            let expected = trx
                .fork
                .map(|f| state.fork(f).active_thread_count)
                .unwrap_or(0);
            if expected != trx.active_thread_count {
                return Err(DbError::new("Transaction active count mismatch")
                    .with_field("trx", trx.id)
                    .with_field("counted", trx.active_thread_count)
                    .with_field("bound_fork_active", expected));
            }
        }

        Ok(())
    }

    /// Transaction is still open (not committed or rolled back).
    pub fn is_transaction_active(&self, trx: TrxId) -> bool {
        self.lock()
            .trxs
            .get(&trx)
            .is_some_and(|t| t.state == TrxState::Active)
    }
}
