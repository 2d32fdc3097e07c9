use std::sync::Arc;
use std::time::Instant;

use cinder_error::{DbError, Result};
use tracing::{debug, trace};

use super::{Scheduler, SchedulerState};
use crate::fork::{Fork, ForkContext, ForkId, ForkKind, ForkOwner, ForkState};
use crate::graph::QueryGraph;
use crate::graph::expr::Variables;
use crate::ops::{CommandOutcome, LockMode, LockStatus, ReplySink, TableId};
use crate::thread::{ActiveThread, Continuation, Cursor, QueryThread, ThreadId, ThreadState};
use crate::trx::signal::{self, Signal, SignalContext, SignalKind};
use crate::trx::{Transaction, TrxErrorState, TrxId, TrxQueState, TrxState};

impl Transaction {
    /// Outcome for the reply of a finished command. Resets the error state.
    fn take_outcome(&mut self) -> CommandOutcome {
        let outcome = match self.error_state {
            TrxErrorState::None | TrxErrorState::LockWait => CommandOutcome::Completed,
            TrxErrorState::LockWaitTimeout => CommandOutcome::Failed(
                self.error
                    .take()
                    .unwrap_or_else(|| DbError::new("Lock wait timeout exceeded")),
            ),
            TrxErrorState::Failed => CommandOutcome::Failed(
                self.error
                    .take()
                    .unwrap_or_else(|| DbError::new("Transaction failed")),
            ),
        };
        self.error_state = TrxErrorState::None;
        self.error = None;
        outcome
    }
}

impl Scheduler {
    /// Decide if a running thread has to stop, updating its state if so.
    ///
    /// Reasons are checked in order: the fork is waiting for a command, the
    /// transaction has a pending signal (unless this is the rollback fork),
    /// the transaction is in a lock wait, the transaction has failed.
    pub(crate) fn stop_predicate(&self, state: &mut SchedulerState, thread: ThreadId) -> bool {
        let t = state.thread(thread);
        assert_eq!(
            ThreadState::Running,
            t.state,
            "stop check on a thread that isn't running: {thread}"
        );
        let fork = state.fork(t.fork);
        let trx = state.trx(fork.trx);

        let new_state = if fork.state == ForkState::CommandWait {
            ThreadState::Suspended
        } else if !trx.signals.is_empty() && fork.kind != ForkKind::Rollback {
            ThreadState::Suspended
        } else if trx.in_lock_wait() {
            ThreadState::LockWait
        } else if trx.error_state.is_failure() {
            ThreadState::Completed
        } else {
            return false;
        };

        let trx_id = fork.trx;
        if new_state == ThreadState::LockWait {
            let trx = state.trx_mut(trx_id);
            if !trx.wait_threads.contains(&thread) {
                trx.wait_threads.push(thread);
            }
        }
        state.thread_mut(thread).state = new_state;
        debug!(%thread, ?new_state, "thread stopping");

        true
    }

    /// Read only variant of the stop predicate used by the run loop.
    pub fn peek_stop(&self, thread: &ActiveThread) -> bool {
        let state = self.lock();
        let t = state.thread(thread.id);
        let fork = state.fork(thread.fork);
        let trx = state.trx(thread.trx);

        t.state != ThreadState::Running
            || fork.state == ForkState::CommandWait
            || (!trx.signals.is_empty() && fork.kind != ForkKind::Rollback)
            || trx.in_lock_wait()
            || trx.error_state.is_failure()
    }

    /// The only way a thread becomes Running.
    ///
    /// Returns the thread's token if it was inactive. An already active thread
    /// is owned by whoever holds its token, so nothing is returned.
    pub(crate) fn move_to_running(
        &self,
        state: &mut SchedulerState,
        thread: ThreadId,
    ) -> Option<ActiveThread> {
        let t = state.thread_mut(thread);
        let was_active = t.is_active;
        t.state = ThreadState::Running;
        if was_active {
            return None;
        }
        t.is_active = true;
        let fork_id = t.fork;

        let fork = state.fork_mut(fork_id);
        assert_eq!(
            0, fork.active_thread_count,
            "fork active count before move to running: {fork_id}"
        );
        fork.active_thread_count = 1;
        let trx_id = fork.trx;

        let trx = state.trx_mut(trx_id);
        assert_eq!(
            0, trx.active_thread_count,
            "transaction active count before move to running: {trx_id}"
        );
        assert_eq!(
            Some(fork_id),
            trx.fork,
            "{thread} activated in a fork not bound to {trx_id}"
        );
        trx.active_thread_count = 1;

        state.stats.threads_activated += 1;
        trace!(%thread, fork = %fork_id, trx = %trx_id, "moved to running");

        Some(self.check_out(state, thread))
    }

    fn check_out(&self, state: &mut SchedulerState, thread: ThreadId) -> ActiveThread {
        let t = state.thread(thread);
        let (cursor, resource, fork_id) = (t.cursor, t.resource, t.fork);
        let fork = state.fork_mut(fork_id);
        let ctx = fork
            .ctx
            .take()
            .unwrap_or_else(|| panic!("{fork_id} context already checked out"));
        let (trx, graph) = (fork.trx, fork.graph.clone());
        let driver = state.trx(trx).driver;

        ActiveThread {
            id: thread,
            fork: fork_id,
            trx,
            driver,
            graph,
            cursor,
            ctx,
            resource,
        }
    }

    fn check_in(&self, state: &mut SchedulerState, thread: ActiveThread) {
        let ActiveThread {
            id,
            fork,
            cursor,
            ctx,
            resource,
            ..
        } = thread;
        let t = state.thread_mut(id);
        t.cursor = cursor;
        t.resource = resource;
        let prev = state.fork_mut(fork).ctx.replace(ctx);
        assert!(prev.is_none(), "{fork} context checked in twice");
    }

    /// Release a thread that stepped to a stop.
    ///
    /// Returns the next thread to run on this OS thread, which is the same
    /// thread if its reason to stop has already gone away.
    pub fn release(&self, thread: ActiveThread) -> Option<ActiveThread> {
        let mut state = self.lock();
        self.release_locked(&mut state, thread)
    }

    fn release_locked(
        &self,
        state: &mut SchedulerState,
        thread: ActiveThread,
    ) -> Option<ActiveThread> {
        let thread_id = thread.id;
        if state.thread(thread_id).state == ThreadState::Running
            && !self.stop_predicate(state, thread_id)
        {
            state.stats.release_reruns += 1;
            debug!(thread = %thread_id, "reason to stop went away, continuing");
            return Some(thread);
        }

        let (fork_id, trx_id) = (thread.fork, thread.trx);
        self.check_in(state, thread);

        let t = state.thread_mut(thread_id);
        t.is_active = false;
        let thread_state = t.state;
        let pending_call = match thread_state {
            ThreadState::ProcedureWait => t.pending_call.take(),
            _ => None,
        };

        let fork = state.fork_mut(fork_id);
        assert_eq!(
            1, fork.active_thread_count,
            "fork active count before release: {fork_id}"
        );
        fork.active_thread_count = 0;
        let trx = state.trx_mut(trx_id);
        assert_eq!(
            1, trx.active_thread_count,
            "transaction active count before release: {trx_id}"
        );
        trx.active_thread_count = 0;
        state.stats.threads_released += 1;
        debug!(thread = %thread_id, state = ?thread_state, "released thread");

        let mut next = None;

        if let Some(callee) = pending_call {
            state.trx_mut(trx_id).fork = Some(callee);
            let thread = self
                .activate_fork(state, callee)
                .expect("new procedure fork to have a thread to start");
            self.offer(state, trx_id, thread, &mut next);
        }

        if thread_state == ThreadState::Completed {
            self.continue_fork(state, fork_id, &mut next);
        }

        self.dispatch_signals(state, trx_id, &mut next);

        next
    }

    /// Run the next thread of a fork after one completes, or finish the fork
    /// if all are done.
    fn continue_fork(
        &self,
        state: &mut SchedulerState,
        fork_id: ForkId,
        next: &mut Option<ActiveThread>,
    ) {
        let fork = state.fork(fork_id);
        if fork.active_thread_count != 0 || fork.state != ForkState::Active {
            return;
        }
        let trx = state.trx(fork.trx);
        let failed = trx.error_state.is_failure();
        let has_signals = !trx.signals.is_empty();

        let waiting: Vec<ThreadId> = fork
            .threads
            .iter()
            .copied()
            .filter(|t| state.thread(*t).state == ThreadState::CommandWait)
            .collect();

        if let Some(first) = waiting.first() {
            if failed {
                // Threads that never ran for this command complete with the rest.
                for t in &waiting {
                    state.thread_mut(*t).state = ThreadState::Completed;
                }
            } else if has_signals {
                // Left in command wait, the next command picks them up.
                return;
            } else {
                let trx_id = state.fork(fork_id).trx;
                if let Some(thread) = self.move_to_running(state, *first) {
                    self.offer(state, trx_id, thread, next);
                }
                return;
            }
        }

        let fork = state.fork(fork_id);
        if fork
            .threads
            .iter()
            .all(|t| state.thread(*t).state == ThreadState::Completed)
        {
            self.fork_finished(state, fork_id, next);
        }
    }

    fn fork_finished(
        &self,
        state: &mut SchedulerState,
        fork_id: ForkId,
        next: &mut Option<ActiveThread>,
    ) {
        enum Finish {
            Reply(Arc<dyn ReplySink>),
            ResumeCaller(ThreadId),
            Rollback,
        }

        let fork = state.fork_mut(fork_id);
        fork.state = ForkState::CommandWait;
        let trx_id = fork.trx;
        debug!(fork = %fork_id, trx = %trx_id, owner = ?fork.owner, "fork finished");

        let finish = match &fork.owner {
            ForkOwner::Session(reply) => Finish::Reply(reply.clone()),
            ForkOwner::Caller(caller) => Finish::ResumeCaller(*caller),
            ForkOwner::Signal(_) => Finish::Rollback,
        };

        match finish {
            Finish::Reply(reply) => {
                let outcome = state.trx_mut(trx_id).take_outcome();
                reply.command_finished(fork_id, outcome);
            }
            Finish::ResumeCaller(caller) => {
                self.remove_fork(state, fork_id);
                let caller_fork = state.thread(caller).fork;
                state.trx_mut(trx_id).fork = Some(caller_fork);
                if let Some(thread) = self.end_wait(state, caller) {
                    self.offer(state, trx_id, thread, next);
                }
            }
            Finish::Rollback => {
                let fork = self.remove_fork(state, fork_id);
                let trx = state.trx_mut(trx_id);
                trx.fork = trx.suspended_fork.take();
                let ForkOwner::Signal(signal) = fork.owner else {
                    unreachable!("owner checked above")
                };
                let mut cx = SignalContext {
                    scheduler: self,
                    state: &mut *state,
                    trx: trx_id,
                    next: &mut *next,
                };
                self.signal_handler.rollback_finished(&mut cx, signal);
            }
        }
    }

    /// Dispatch queued signals while the transaction has no active threads.
    ///
    /// Handlers that produce a thread to run end the dispatch, the rest of the
    /// queue waits for that thread to stop.
    pub(crate) fn dispatch_signals(
        &self,
        state: &mut SchedulerState,
        trx_id: TrxId,
        next: &mut Option<ActiveThread>,
    ) {
        loop {
            let trx = state.trx_mut(trx_id);
            if trx.active_thread_count != 0 {
                break;
            }
            let Some(signal) = trx.signals.pop_front() else {
                break;
            };
            trx.handling_signals = true;
            trx.signals_handled += 1;
            state.stats.signals_dispatched += 1;
            debug!(trx = %trx_id, kind = ?signal.kind, "dispatching signal");

            let mut cx = SignalContext {
                scheduler: self,
                state: &mut *state,
                trx: trx_id,
                next: &mut *next,
            };
            match signal.kind {
                SignalKind::CommitRequested => self.signal_handler.handle_commit(&mut cx, signal),
                SignalKind::RollbackRequested => {
                    self.signal_handler.handle_rollback(&mut cx, signal)
                }
                SignalKind::ErrorOccurred => self.signal_handler.handle_error(&mut cx, signal),
                SignalKind::BreakExecution => self.signal_handler.handle_break(&mut cx, signal),
            }
        }

        let trx = state.trx_mut(trx_id);
        if trx.handling_signals && trx.signals.is_empty() {
            trx.handling_signals = false;
            // A forced completion stopped by a later signal is finished here.
            if trx.active_thread_count == 0 && trx.error_state.is_failure() {
                if let Some(thread) = self.fork_error_handle(state, trx_id) {
                    debug!(trx = %trx_id, "resuming error handling after signals");
                    self.offer(state, trx_id, thread, next);
                }
            }
        }
    }

    /// Queue a signal, dispatching it right away if the transaction is idle.
    pub(crate) fn send_signal_locked(
        &self,
        state: &mut SchedulerState,
        trx_id: TrxId,
        signal: Signal,
        next: &mut Option<ActiveThread>,
    ) -> Result<()> {
        let trx = state.trx_mut(trx_id);
        let kind = signal.kind;
        if matches!(
            kind,
            SignalKind::CommitRequested | SignalKind::RollbackRequested
        ) && trx.state != TrxState::Active
        {
            return Err(DbError::new("Transaction has already ended")
                .with_field("trx", trx_id)
                .with_field("state", format!("{:?}", trx.state)));
        }
        if !signal::is_compatible(&trx.signals, kind) {
            return Err(DbError::new("Transaction already has a pending commit or rollback")
                .with_field("trx", trx_id)
                .with_field("signal", format!("{kind:?}")));
        }
        if kind == SignalKind::ErrorOccurred {
            if trx.error_state == TrxErrorState::Failed
                && trx
                    .signals
                    .iter()
                    .any(|s| s.kind == SignalKind::ErrorOccurred)
            {
                debug!(trx = %trx_id, "error already pending, dropping");
                return Ok(());
            }
            trx.error_state = TrxErrorState::Failed;
        }

        trx.signals.push_back(signal);
        debug!(trx = %trx_id, ?kind, "queued signal");

        if trx.active_thread_count == 0 {
            self.dispatch_signals(state, trx_id, next);
        }
        Ok(())
    }

    /// Resume a waiting thread.
    ///
    /// Returns the thread's token only if it wasn't active. Completed threads
    /// are left alone.
    pub(crate) fn end_wait(
        &self,
        state: &mut SchedulerState,
        thread: ThreadId,
    ) -> Option<ActiveThread> {
        let t = state.threads.get(&thread)?;
        if t.is_active {
            return None;
        }
        let thread_state = t.state;
        match thread_state {
            ThreadState::Completed | ThreadState::CommandWait => {
                debug!(%thread, state = ?thread_state, "not resuming idle thread");
                None
            }
            _ => self.move_to_running(state, thread),
        }
    }

    /// Hand a resumed thread to the releasing OS thread if it belongs to the
    /// transaction being released, otherwise schedule it.
    pub(crate) fn offer(
        &self,
        state: &mut SchedulerState,
        trx: TrxId,
        thread: ActiveThread,
        next: &mut Option<ActiveThread>,
    ) {
        if next.is_none() && thread.trx == trx {
            *next = Some(thread);
        } else {
            self.schedule_resumed(state, thread);
        }
    }

    pub(crate) fn acquire_lock(&self, trx_id: TrxId, table: TableId, mode: LockMode) -> LockStatus {
        let mut state = self.lock();
        let status = self.lock_manager.try_acquire(trx_id, table, mode);
        if let LockStatus::WouldWait(wait) = status {
            let trx = state.trx_mut(trx_id);
            trx.que_state = TrxQueState::LockWait {
                wait,
                since: Instant::now(),
            };
            if trx.error_state == TrxErrorState::None {
                trx.error_state = TrxErrorState::LockWait;
            }
            debug!(trx = %trx_id, %table, ?mode, %wait, "waiting for lock");
        }
        status
    }

    pub(crate) fn end_lock_wait_locked(&self, state: &mut SchedulerState, trx_id: TrxId) {
        let Some(trx) = state.trxs.get_mut(&trx_id) else {
            return;
        };
        if !trx.in_lock_wait() {
            return;
        }
        trx.que_state = TrxQueState::Running;
        if trx.error_state == TrxErrorState::LockWait {
            trx.error_state = TrxErrorState::None;
        }
        let threads = std::mem::take(&mut trx.wait_threads);
        debug!(trx = %trx_id, num_threads = threads.len(), "lock wait ended");

        for thread in threads {
            if let Some(thread) = self.end_wait(state, thread) {
                self.schedule_resumed(state, thread);
            }
        }
    }

    /// Cancel the transaction's own lock request. Threads stopped on it are
    /// left suspended.
    pub(crate) fn cancel_own_lock_wait(&self, state: &mut SchedulerState, trx_id: TrxId) {
        let trx = state.trx_mut(trx_id);
        let TrxQueState::LockWait { wait, .. } = trx.que_state else {
            return;
        };
        trx.que_state = TrxQueState::Running;
        if trx.error_state == TrxErrorState::LockWait {
            trx.error_state = TrxErrorState::None;
        }
        let threads = std::mem::take(&mut trx.wait_threads);
        for thread in threads {
            state.thread_mut(thread).state = ThreadState::Suspended;
        }

        let granted = self.lock_manager.cancel_wait(wait).unwrap_or_default();
        for other in granted {
            self.end_lock_wait_locked(state, other);
        }
    }

    pub(crate) fn release_trx_locks(&self, state: &mut SchedulerState, trx_id: TrxId) {
        self.cancel_own_lock_wait(state, trx_id);
        let granted = self.lock_manager.release_all(trx_id);
        for other in granted {
            if other != trx_id {
                self.end_lock_wait_locked(state, other);
            }
        }
    }

    /// Force every thread of the transaction's bound fork to complete at its
    /// boundary, returning one of them to run so the fork finishes.
    pub(crate) fn fork_error_handle(
        &self,
        state: &mut SchedulerState,
        trx_id: TrxId,
    ) -> Option<ActiveThread> {
        let fork_id = state.trx(trx_id).fork?;
        if !self.has_running_command(state, trx_id) {
            return None;
        }
        let fork = state.fork_mut(fork_id);
        assert_eq!(
            0, fork.active_thread_count,
            "fork error handling with active threads: {fork_id}"
        );
        fork.state = ForkState::Active;
        let threads = fork.threads.clone();

        for id in &threads {
            let t = state.thread_mut(*id);
            t.state = ThreadState::Completed;
            t.pending_call = None;
            t.cursor = Cursor {
                continuation: Continuation::Resume(t.node),
                prev: None,
            };
        }
        debug!(fork = %fork_id, trx = %trx_id, "forcing fork threads to complete");

        self.move_to_running(state, threads[0])
    }

    /// The transaction's bound fork is in the middle of a command.
    pub(crate) fn has_running_command(&self, state: &SchedulerState, trx_id: TrxId) -> bool {
        let Some(fork_id) = state.trx(trx_id).fork else {
            return false;
        };
        let fork = state.fork(fork_id);
        let idle = fork.threads.iter().all(|t| {
            matches!(
                state.thread(*t).state,
                ThreadState::CommandWait | ThreadState::Completed
            )
        });
        !(fork.state == ForkState::CommandWait && idle)
    }

    pub(crate) fn create_fork_locked(
        &self,
        state: &mut SchedulerState,
        trx: TrxId,
        graph: Arc<QueryGraph>,
        kind: ForkKind,
        owner: ForkOwner,
        vars: Variables,
    ) -> ForkId {
        let id = ForkId(state.next_id());
        let mut threads = Vec::with_capacity(graph.threads().len());
        for node in graph.threads() {
            let thread = ThreadId(state.next_id());
            state
                .threads
                .insert(thread, QueryThread::new(thread, id, *node));
            threads.push(thread);
        }
        let ctx = ForkContext::new(&graph, vars);
        debug!(fork = %id, %trx, graph = graph.name(), ?kind, "created fork");

        state.forks.insert(
            id,
            Fork {
                id,
                kind,
                state: ForkState::CommandWait,
                trx,
                graph,
                threads,
                active_thread_count: 0,
                owner,
                ctx: Some(ctx),
            },
        );
        id
    }

    pub(crate) fn remove_fork(&self, state: &mut SchedulerState, fork_id: ForkId) -> Fork {
        let fork = state
            .forks
            .remove(&fork_id)
            .expect("fork to exist");
        assert_eq!(0, fork.active_thread_count, "freeing {fork_id} with active threads");
        for thread in &fork.threads {
            state.threads.remove(thread);
        }
        debug!(fork = %fork_id, "freed fork");
        fork
    }

    /// Bind a fork to its transaction. The previously bound fork must be idle.
    fn bind_fork(&self, state: &mut SchedulerState, fork_id: ForkId) -> Result<()> {
        let trx_id = state.fork(fork_id).trx;
        let trx = state.trx(trx_id);
        if trx.state != TrxState::Active {
            return Err(DbError::new("Transaction has already ended").with_field("trx", trx_id));
        }
        match trx.fork {
            Some(bound) if bound == fork_id => return Ok(()),
            Some(bound) => {
                let other = state.fork(bound);
                let busy = other.active_thread_count != 0
                    || other
                        .threads
                        .iter()
                        .any(|t| state.thread(*t).state.is_waiting());
                if busy || trx.suspended_fork.is_some() {
                    return Err(DbError::new("Transaction is busy with another fork")
                        .with_field("trx", trx_id)
                        .with_field("fork", bound));
                }
            }
            None => (),
        }
        state.trx_mut(trx_id).fork = Some(fork_id);
        Ok(())
    }

    /// Pick the thread to run for a new command and move it to running.
    ///
    /// Resumes the first suspended thread. If every thread is idle the fork
    /// is restarted from the top.
    fn activate_fork(&self, state: &mut SchedulerState, fork_id: ForkId) -> Option<ActiveThread> {
        let fork = state.fork(fork_id);
        let suspended = fork
            .threads
            .iter()
            .copied()
            .find(|t| state.thread(*t).state == ThreadState::Suspended);

        let thread = match suspended {
            Some(thread) => thread,
            None => {
                let idle = fork.threads.iter().all(|t| {
                    matches!(
                        state.thread(*t).state,
                        ThreadState::CommandWait | ThreadState::Completed
                    )
                });
                if !idle {
                    return None;
                }
                let threads = fork.threads.clone();
                for t in &threads {
                    let t = state.thread_mut(*t);
                    t.state = ThreadState::CommandWait;
                    t.cursor = Cursor::start(t.node);
                    t.pending_call = None;
                }
                state
                    .fork_mut(fork_id)
                    .ctx
                    .as_mut()
                    .expect("idle fork to have its context")
                    .reset_node_states();
                threads[0]
            }
        };

        state.fork_mut(fork_id).state = ForkState::Active;
        self.move_to_running(state, thread)
    }

    pub(crate) fn start_command_locked(
        &self,
        state: &mut SchedulerState,
        fork_id: ForkId,
    ) -> Result<ActiveThread> {
        let fork = state.try_fork(fork_id)?;
        if fork.active_thread_count != 0 {
            return Err(DbError::new("Fork is already running").with_field("fork", fork_id));
        }
        self.bind_fork(state, fork_id)?;
        self.activate_fork(state, fork_id).ok_or_else(|| {
            DbError::new("Fork has waiting threads and cannot start a command")
                .with_field("fork", fork_id)
        })
    }

    /// Restart an idle thread.
    pub(crate) fn restart_thread(
        &self,
        state: &mut SchedulerState,
        thread: ThreadId,
    ) -> Result<ActiveThread> {
        let t = state
            .threads
            .get(&thread)
            .ok_or_else(|| DbError::new("Unknown thread").with_field("thread", thread))?;
        if t.is_active {
            return Err(DbError::new("Thread is already running").with_field("thread", thread));
        }
        match t.state {
            ThreadState::Completed => {
                return Err(DbError::new("Thread already completed").with_field("thread", thread));
            }
            s if s.is_waiting() => {
                return Err(DbError::new("Thread is waiting")
                    .with_field("thread", thread)
                    .with_field("state", format!("{s:?}")));
            }
            _ => (),
        }
        let fork_id = t.fork;
        if state.fork(fork_id).active_thread_count != 0 {
            return Err(DbError::new("Fork is already running").with_field("fork", fork_id));
        }
        if t.state == ThreadState::CommandWait {
            let t = state.thread_mut(thread);
            t.cursor = Cursor::start(t.node);
        }
        self.bind_fork(state, fork_id)?;
        state.fork_mut(fork_id).state = ForkState::Active;
        Ok(self
            .move_to_running(state, thread)
            .expect("inactive thread to produce a token"))
    }

    /// Create and start a procedure call's fork. Called by the stepper, the
    /// callee starts once the caller is released.
    pub(crate) fn prepare_call(
        &self,
        caller: &ActiveThread,
        procedure: Arc<QueryGraph>,
        args: Variables,
    ) {
        let mut state = self.lock();
        let callee = self.create_fork_locked(
            &mut state,
            caller.trx,
            procedure,
            ForkKind::Procedure,
            ForkOwner::Caller(caller.id),
            args,
        );
        let t = state.thread_mut(caller.id);
        t.state = ThreadState::ProcedureWait;
        t.pending_call = Some(callee);
    }

    /// Queue a signal sent by a running thread, which then waits for the reply.
    pub(crate) fn send_signal_from(&self, sender: &ActiveThread, kind: SignalKind) -> Result<()> {
        let mut state = self.lock();
        let mut next = None;
        self.send_signal_locked(
            &mut state,
            sender.trx,
            Signal::new(kind, Some(sender.id)),
            &mut next,
        )?;
        assert!(next.is_none(), "signal dispatched while its sender is active");
        state.thread_mut(sender.id).state = ThreadState::SignalReplyWait;
        Ok(())
    }

    /// Bind a rollback fork for `graph` in place of the current fork and
    /// start it.
    pub(crate) fn start_rollback_fork(
        &self,
        state: &mut SchedulerState,
        trx_id: TrxId,
        graph: Arc<QueryGraph>,
        signal: Signal,
    ) -> ActiveThread {
        let trx = state.trx_mut(trx_id);
        // Errors before the rollback were either reported or are superseded by it.
        trx.error_state = TrxErrorState::None;
        trx.error = None;
        trx.suspended_fork = trx.fork.take();

        let fork = self.create_fork_locked(
            state,
            trx_id,
            graph,
            ForkKind::Rollback,
            ForkOwner::Signal(signal),
            Variables::new(),
        );
        state.trx_mut(trx_id).fork = Some(fork);
        self.activate_fork(state, fork)
            .expect("new rollback fork to have a thread to start")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::graph::expr::Expr;
    use crate::graph::{GraphBuilder, NodeId, NodeKind, RowOp, RowOpKind};
    use crate::ops::CommandReply;
    use crate::scheduler::Step;
    use crate::server::Server;
    use crate::testutil::{
        RecordingRowOperator,
        TestCollaborators,
        counting_loop_graph,
        insert_commit_graph,
        lock_update_graph,
        new_test_scheduler,
        new_test_scheduler_with_config,
        row_ops_graph,
        test_collaborators,
        test_config,
    };
    use crate::trx::Driver;

    const T1: TableId = TableId(1);
    const T2: TableId = TableId(2);
    const T3: TableId = TableId(3);

    fn new_statement(
        scheduler: &Scheduler,
        graph: Arc<QueryGraph>,
    ) -> (TrxId, ForkId, Arc<CommandReply>) {
        let trx = scheduler.begin_transaction(Driver::Pool);
        let reply = CommandReply::new();
        let fork = scheduler.create_fork(trx, graph, reply.clone()).unwrap();
        (trx, fork, reply)
    }

    fn first_statement(graph: &QueryGraph) -> NodeId {
        match graph.node(graph.threads()[0]).kind {
            NodeKind::Thread { body: Some(first) } => first,
            _ => panic!("thread has no statements"),
        }
    }

    fn run_queued(scheduler: &Scheduler) {
        while scheduler.run_next_task() {}
    }

    /// Step a thread until it asks to be released.
    fn step_until_release(scheduler: &Scheduler, thread: &mut ActiveThread) {
        for _ in 0..1000 {
            if scheduler.step(thread) == Step::Release {
                return;
            }
        }
        panic!("thread never asked to be released");
    }

    #[test]
    fn insert_runs_once() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let graph = row_ops_graph("insert", [RowOp::new(RowOpKind::Insert, T1, 25)]);
        let (trx, fork, reply) = new_statement(&scheduler, graph);

        let thread = scheduler.start_command(fork).unwrap();
        let thread_id = thread.id();
        scheduler.run_threads(thread);

        let stats = scheduler.stats();
        assert_eq!(1, stats.threads_activated);
        assert_eq!(1, stats.threads_released);
        assert_eq!(0, stats.signals_dispatched);
        assert_eq!(
            ThreadState::Completed,
            scheduler.thread_info(thread_id).unwrap().state
        );
        reply.try_take().unwrap().into_result().unwrap();
        assert!(reply.try_take().is_none());
        assert_eq!(25, collab.operator.rows_for(trx));
        assert_eq!(3, collab.operator.num_calls());
        scheduler.validate().unwrap();
    }

    #[test]
    fn insert_commit_dispatches_once() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let (trx, fork, reply) = new_statement(&scheduler, insert_commit_graph(T1, 5));

        let thread = scheduler.start_command(fork).unwrap();
        let thread_id = thread.id();
        scheduler.run_threads(thread);

        reply.try_take().unwrap().into_result().unwrap();
        let stats = scheduler.stats();
        assert_eq!(1, stats.signals_dispatched);
        assert_eq!(1, collab.signals.counts().commits);
        // Once for the statement, once more after the commit reply.
        assert_eq!(2, stats.threads_activated);
        assert_eq!(2, stats.threads_released);
        assert_eq!(
            ThreadState::Completed,
            scheduler.thread_info(thread_id).unwrap().state
        );
        assert!(!scheduler.is_transaction_active(trx));
        assert_eq!(None, collab.locks.held_mode(trx, T1));

        // Transaction already ended.
        scheduler.start_command(fork).unwrap_err();
        scheduler.send_signal(trx, SignalKind::CommitRequested).unwrap_err();
        scheduler.validate().unwrap();
    }

    #[test]
    fn threads_of_fork_run_in_order() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let mut b = GraphBuilder::new("two_threads");
        let first = b.add_thread();
        b.push(
            first,
            NodeKind::RowOperation(RowOp::new(RowOpKind::Insert, T1, 3)),
        )
        .unwrap();
        let second = b.add_thread();
        b.push(
            second,
            NodeKind::RowOperation(RowOp::new(RowOpKind::Insert, T2, 3)),
        )
        .unwrap();
        b.push(second, NodeKind::Commit).unwrap();
        let (trx, fork, reply) = new_statement(&scheduler, b.build().unwrap());

        scheduler.run_threads(scheduler.start_command(fork).unwrap());

        reply.try_take().unwrap().into_result().unwrap();
        assert!(reply.try_take().is_none());
        let tables: Vec<_> = collab.operator.log().iter().map(|r| r.table).collect();
        assert_eq!(vec![T1, T2], tables);
        assert_eq!(1, scheduler.stats().signals_dispatched);
        assert_eq!(3, scheduler.stats().threads_activated);
        assert!(!scheduler.is_transaction_active(trx));

        let info = scheduler.fork_info(fork).unwrap();
        assert_eq!(ForkState::CommandWait, info.state);
        for thread in info.threads {
            assert_eq!(
                ThreadState::Completed,
                scheduler.thread_info(thread).unwrap().state
            );
        }
    }

    #[test]
    fn lock_wait_resumes_at_previous_position() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let (trx1, fork1, reply1) =
            new_statement(&scheduler, lock_update_graph(T1, LockMode::Exclusive, 5));
        scheduler.run_threads(scheduler.start_command(fork1).unwrap());
        reply1.try_take().unwrap().into_result().unwrap();

        let graph = lock_update_graph(T1, LockMode::Exclusive, 5);
        let lock_node = first_statement(&graph);
        let (trx2, fork2, reply2) = new_statement(&scheduler, graph);
        let thread = scheduler.start_command(fork2).unwrap();
        let thread_id = thread.id();
        scheduler.run_threads(thread);

        let info = scheduler.thread_info(thread_id).unwrap();
        assert_eq!(ThreadState::LockWait, info.state);
        assert!(!info.is_active);
        assert_eq!(Continuation::Resume(lock_node), info.cursor.continuation);
        assert_eq!(Some(lock_node), info.cursor.prev);
        assert!(scheduler.transaction_info(trx2).unwrap().in_lock_wait);
        assert_eq!(2, scheduler.stats().threads_activated);
        assert!(reply2.try_take().is_none());

        // Commit releases the lock, the waiter is queued as a task.
        scheduler
            .send_signal(trx1, SignalKind::CommitRequested)
            .unwrap();
        assert_eq!(3, scheduler.stats().threads_activated);
        assert_eq!(1, scheduler.num_queued_tasks());
        scheduler.validate().unwrap();

        run_queued(&scheduler);
        reply2.try_take().unwrap().into_result().unwrap();
        assert_eq!(3, scheduler.stats().threads_activated);
        assert_eq!(5, collab.operator.rows_for(trx2));
        assert_eq!(Some(LockMode::Exclusive), collab.locks.held_mode(trx2, T1));
        assert!(!scheduler.transaction_info(trx2).unwrap().in_lock_wait);
        scheduler.validate().unwrap();
    }

    #[test]
    fn ending_open_transaction_releases_locks() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let (trx1, fork1, reply1) =
            new_statement(&scheduler, lock_update_graph(T1, LockMode::Exclusive, 2));
        scheduler.run_threads(scheduler.start_command(fork1).unwrap());
        reply1.try_take().unwrap().into_result().unwrap();

        let (trx2, fork2, reply2) =
            new_statement(&scheduler, lock_update_graph(T1, LockMode::Exclusive, 2));
        scheduler.run_threads(scheduler.start_command(fork2).unwrap());
        assert!(scheduler.transaction_info(trx2).unwrap().in_lock_wait);

        // Never committed or rolled back.
        scheduler.detach_fork(trx1).unwrap();
        scheduler.free_fork(fork1).unwrap();
        scheduler.end_transaction(trx1).unwrap();
        assert!(scheduler.transaction_info(trx1).is_none());
        assert_eq!(None, collab.locks.held_mode(trx1, T1));
        assert_eq!(1, scheduler.num_queued_tasks());

        run_queued(&scheduler);
        reply2.try_take().unwrap().into_result().unwrap();
        assert_eq!(Some(LockMode::Exclusive), collab.locks.held_mode(trx2, T1));
        assert_eq!(2, collab.operator.rows_for(trx2));
        scheduler.validate().unwrap();
    }

    #[test]
    fn release_reruns_when_reason_went_away() {
        let (scheduler, _collab) = new_test_scheduler(test_collaborators());
        let (trx1, fork1, _reply1) =
            new_statement(&scheduler, lock_update_graph(T1, LockMode::Exclusive, 1));
        scheduler.run_threads(scheduler.start_command(fork1).unwrap());

        let (_trx2, fork2, reply2) =
            new_statement(&scheduler, lock_update_graph(T1, LockMode::Exclusive, 1));
        let mut thread = scheduler.start_command(fork2).unwrap();
        let thread_id = thread.id();
        step_until_release(&scheduler, &mut thread);
        assert!(scheduler.peek_stop(&thread));

        // Lock granted between the stop decision and the release.
        scheduler
            .send_signal(trx1, SignalKind::CommitRequested)
            .unwrap();
        assert!(!scheduler.peek_stop(&thread));

        let thread = scheduler.release(thread).unwrap();
        assert_eq!(thread_id, thread.id());
        assert_eq!(1, scheduler.stats().release_reruns);
        assert_eq!(
            ThreadState::Running,
            scheduler.thread_info(thread_id).unwrap().state
        );

        scheduler.run_threads(thread);
        reply2.try_take().unwrap().into_result().unwrap();
        assert_eq!(0, scheduler.num_queued_tasks());
        scheduler.validate().unwrap();
    }

    #[test]
    fn procedure_call_resumes_caller() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());

        let mut b = GraphBuilder::new("proc");
        let thread = b.add_thread();
        let lp = b
            .push(
                thread,
                NodeKind::For {
                    var: "i".to_string(),
                    from: Expr::lit(1),
                    to: Expr::var("n"),
                    body: None,
                },
            )
            .unwrap();
        b.push(
            lp,
            NodeKind::RowOperation(RowOp::new(RowOpKind::Insert, T2, 1)),
        )
        .unwrap();
        let procedure = b.build().unwrap();

        let mut b = GraphBuilder::new("caller");
        let thread = b.add_thread();
        b.push(
            thread,
            NodeKind::ProcedureCall {
                procedure,
                args: vec![("n".to_string(), Expr::lit(3))],
            },
        )
        .unwrap();
        b.push(
            thread,
            NodeKind::RowOperation(RowOp::new(RowOpKind::Insert, T3, 2)),
        )
        .unwrap();
        let (trx, fork, reply) = new_statement(&scheduler, b.build().unwrap());

        let thread = scheduler.start_command(fork).unwrap();
        let caller = thread.id();
        scheduler.run_threads(thread);

        reply.try_take().unwrap().into_result().unwrap();
        let log = collab.operator.log();
        let tables: Vec<_> = log.iter().map(|r| r.table).collect();
        assert_eq!(vec![T2, T2, T2, T3], tables);
        assert_ne!(caller, log[0].thread);
        assert_eq!(caller, log[3].thread);
        assert_eq!(5, collab.operator.rows_for(trx));
        // Caller, callee, caller again.
        assert_eq!(3, scheduler.stats().threads_activated);
        assert_eq!(Some(fork), scheduler.transaction_info(trx).unwrap().fork);
        // Callee fork ids are allocated right before their threads.
        assert!(scheduler.fork_info(ForkId(log[0].thread.0 - 1)).is_none());
        scheduler.validate().unwrap();
    }

    #[test]
    fn rollback_fork_ignores_pending_signals() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let mut b = GraphBuilder::new("insert_rollback");
        let thread = b.add_thread();
        b.push(
            thread,
            NodeKind::RowOperation(RowOp::new(RowOpKind::Insert, T1, 5)),
        )
        .unwrap();
        b.push(thread, NodeKind::Rollback).unwrap();
        let (trx, fork, reply) = new_statement(&scheduler, b.build().unwrap());
        scheduler
            .set_rollback_graph(
                trx,
                row_ops_graph("undo", [RowOp::new(RowOpKind::Delete, T1, 3)]),
            )
            .unwrap();

        let mut thread = scheduler.start_command(fork).unwrap();
        step_until_release(&scheduler, &mut thread);
        let rollback = scheduler.release(thread).unwrap();
        assert_ne!(fork, rollback.fork());
        assert_eq!(1, collab.signals.counts().rollbacks);

        // Queued behind the rollback, which keeps running.
        scheduler
            .send_signal(trx, SignalKind::BreakExecution)
            .unwrap();
        assert!(!scheduler.peek_stop(&rollback));
        let rollback_fork = rollback.fork();

        scheduler.run_threads(rollback);

        let counts = collab.signals.counts();
        assert_eq!(1, counts.rollbacks_finished);
        assert_eq!(1, counts.breaks);
        assert!(scheduler.fork_info(rollback_fork).is_none());
        assert_eq!(
            TrxState::RolledBack,
            scheduler.transaction_info(trx).unwrap().state
        );
        assert_eq!(None, collab.locks.held_mode(trx, T1));
        assert_eq!(8, collab.operator.rows_for(trx));

        // The break arrived while the statement waited for the rollback.
        let err = reply.try_take().unwrap().into_result().unwrap_err();
        assert_eq!("Query execution canceled", err.get_msg());
        assert!(reply.try_take().is_none());
        scheduler.validate().unwrap();
    }

    #[test]
    fn break_cancels_running_statement() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let graph = counting_loop_graph("i", 50);
        let (trx, fork, reply) = new_statement(&scheduler, graph);

        let mut thread = scheduler.start_command(fork).unwrap();
        for _ in 0..10 {
            assert_eq!(Step::Continue, scheduler.step(&mut thread));
        }
        scheduler
            .send_signal(trx, SignalKind::BreakExecution)
            .unwrap();
        // Not dispatched while the thread is active.
        assert_eq!(0, scheduler.stats().signals_dispatched);

        scheduler.run_threads(thread);
        let err = reply.try_take().unwrap().into_result().unwrap_err();
        assert_eq!("Query execution canceled", err.get_msg());
        assert_eq!(1, collab.signals.counts().breaks);

        // Error state was reset with the reply, the next command runs.
        scheduler.run_threads(scheduler.start_command(fork).unwrap());
        reply.try_take().unwrap().into_result().unwrap();

        // Nothing to cancel on an idle fork.
        scheduler
            .send_signal(trx, SignalKind::BreakExecution)
            .unwrap();
        assert_eq!(2, collab.signals.counts().breaks);
        assert!(reply.try_take().is_none());
        assert!(scheduler.is_transaction_active(trx));
        scheduler.validate().unwrap();
    }

    #[test]
    fn commit_queued_behind_error_still_replies() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let (trx, fork, reply) = new_statement(&scheduler, counting_loop_graph("i", 50));

        let mut thread = scheduler.start_command(fork).unwrap();
        for _ in 0..5 {
            assert_eq!(Step::Continue, scheduler.step(&mut thread));
        }
        scheduler.record_error(trx, DbError::new("row failed"));
        scheduler
            .send_signal(trx, SignalKind::CommitRequested)
            .unwrap();
        assert_eq!(2, scheduler.transaction_info(trx).unwrap().pending_signals);

        // The error forces completion, which stops again for the commit.
        scheduler.run_threads(thread);

        let err = reply.try_take().unwrap().into_result().unwrap_err();
        assert_eq!("row failed", err.get_msg());
        assert!(reply.try_take().is_none());
        let counts = collab.signals.counts();
        assert_eq!(1, counts.errors);
        assert_eq!(1, counts.commits);
        let info = scheduler.transaction_info(trx).unwrap();
        assert_eq!(TrxState::Committed, info.state);
        assert_eq!(2, info.signals_handled);
        assert_eq!(0, info.active_thread_count);
        scheduler.validate().unwrap();
    }

    #[test]
    fn concurrent_signals_dispatch_once() {
        const SENDERS: usize = 4;

        for round in 0..16 {
            let (scheduler, collab) = new_test_scheduler(test_collaborators());
            let (trx, fork, reply) = new_statement(&scheduler, counting_loop_graph("i", 200));
            let mut thread = scheduler.start_command(fork).unwrap();
            for _ in 0..5 {
                assert_eq!(Step::Continue, scheduler.step(&mut thread));
            }

            let barrier = Barrier::new(SENDERS + 1);
            let commits_accepted = AtomicUsize::new(0);
            thread::scope(|s| {
                for idx in 0..SENDERS {
                    let (scheduler, barrier) = (&scheduler, &barrier);
                    let commits_accepted = &commits_accepted;
                    s.spawn(move || {
                        barrier.wait();
                        if scheduler.send_signal(trx, SignalKind::CommitRequested).is_ok() {
                            commits_accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        scheduler.record_error(trx, DbError::new(format!("sender {idx} failed")));
                    });
                }
                let (scheduler, barrier) = (&scheduler, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    scheduler.run_threads(thread);
                });
            });
            // Forced completion started by a sender is queued, not run inline.
            run_queued(&scheduler);

            let info = scheduler.transaction_info(trx).unwrap();
            assert_eq!(0, info.active_thread_count, "round {round}");
            assert_eq!(0, info.pending_signals, "round {round}");
            assert!(!info.handling_signals, "round {round}");
            assert_eq!(TrxState::Committed, info.state, "round {round}");

            let counts = collab.signals.counts();
            let dispatched = scheduler.stats().signals_dispatched;
            assert_eq!(1, commits_accepted.load(Ordering::SeqCst), "round {round}");
            assert_eq!(1, counts.commits, "round {round}");
            assert!(counts.errors >= 1 && counts.errors <= SENDERS, "round {round}");
            assert_eq!(counts.total() as u64, dispatched, "round {round}");
            assert_eq!(dispatched, info.signals_handled, "round {round}");

            // One reply for the one command, whichever side won.
            assert!(reply.try_take().is_some(), "round {round}");
            assert!(reply.try_take().is_none(), "round {round}");
            scheduler.validate().unwrap();
        }
    }

    #[test]
    fn row_failure_reaches_reply() {
        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        collab.operator.fail_table(T2);
        let graph = row_ops_graph(
            "failing",
            [
                RowOp::new(RowOpKind::Insert, T1, 5),
                RowOp::new(RowOpKind::Insert, T2, 5),
                RowOp::new(RowOpKind::Insert, T3, 5),
            ],
        );
        let (trx, fork, reply) = new_statement(&scheduler, graph);

        scheduler.run_threads(scheduler.start_command(fork).unwrap());

        let err = reply.try_take().unwrap().into_result().unwrap_err();
        assert_eq!("Injected row operation failure", err.get_msg());
        assert!(err.get_field("node").is_some());
        assert_eq!(1, collab.signals.counts().errors);
        assert_eq!(5, collab.operator.rows_for(trx));
        let info = scheduler.transaction_info(trx).unwrap();
        assert_eq!(TrxErrorState::None, info.error_state);
        assert_eq!(TrxState::Active, info.state);
        scheduler.validate().unwrap();
    }

    #[test]
    fn run_thread_rejects_completed() {
        let (scheduler, _collab) = new_test_scheduler(test_collaborators());
        let graph = row_ops_graph("insert", [RowOp::new(RowOpKind::Insert, T1, 1)]);
        let (_trx, fork, reply) = new_statement(&scheduler, graph);
        let thread = scheduler.fork_info(fork).unwrap().threads[0];

        scheduler.run_thread(thread).unwrap();
        reply.try_take().unwrap().into_result().unwrap();

        let stats = scheduler.stats();
        scheduler.run_thread(thread).unwrap_err();
        scheduler.run_thread(ThreadId(9999)).unwrap_err();
        assert_eq!(stats, scheduler.stats());
        scheduler.validate().unwrap();
    }

    #[test]
    fn fork_lifecycle() {
        let (scheduler, _collab) = new_test_scheduler(test_collaborators());
        let graph = row_ops_graph("insert", [RowOp::new(RowOpKind::Insert, T1, 1)]);
        let (trx, fork, reply) = new_statement(&scheduler, graph.clone());

        scheduler.set_var(fork, "x", 4).unwrap();
        scheduler.run_threads(scheduler.start_command(fork).unwrap());
        reply.try_take().unwrap().into_result().unwrap();

        // Still bound.
        scheduler.free_fork(fork).unwrap_err();
        scheduler.end_transaction(trx).unwrap_err();

        let other = scheduler.create_fork(trx, graph, reply.clone()).unwrap();
        scheduler.run_threads(scheduler.start_command(other).unwrap());
        reply.try_take().unwrap().into_result().unwrap();
        assert_eq!(Some(other), scheduler.transaction_info(trx).unwrap().fork);

        scheduler.free_fork(fork).unwrap();
        scheduler.detach_fork(trx).unwrap();
        scheduler.free_fork(other).unwrap();
        scheduler.end_transaction(trx).unwrap();
        assert!(scheduler.transaction_info(trx).is_none());
        scheduler.validate().unwrap();
    }

    #[test]
    fn stop_fork_suspends_and_resumes() {
        let (scheduler, _collab) = new_test_scheduler(test_collaborators());
        let (_trx, fork, reply) =
            new_statement(&scheduler, counting_loop_graph("i", 100));

        let mut thread = scheduler.start_command(fork).unwrap();
        let thread_id = thread.id();
        for _ in 0..5 {
            scheduler.step(&mut thread);
        }
        scheduler.stop_fork(fork).unwrap();
        scheduler.run_threads(thread);
        assert_eq!(
            ThreadState::Suspended,
            scheduler.thread_info(thread_id).unwrap().state
        );
        assert!(reply.try_take().is_none());

        // Next command picks up the suspended thread where it stopped.
        let thread = scheduler.start_command(fork).unwrap();
        assert_eq!(thread_id, thread.id());
        assert!(thread.var("i").is_some());
        scheduler.run_threads(thread);
        reply.try_take().unwrap().into_result().unwrap();
        scheduler.validate().unwrap();
    }

    #[test]
    fn randomized_conservation() {
        logutil::configure_test_logger();

        let config = SchedulerConfig {
            lock_wait_timeout: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(5),
            check_interval: 3,
            round_robin_limit: 16,
            ..test_config()
        };
        let (scheduler, collab) = new_test_scheduler_with_config(
            config,
            TestCollaborators::new(RecordingRowOperator::new(4)),
        );
        let server = Server::new(scheduler.clone());
        server.create_worker_pool(3).unwrap();
        server.start_lock_wait_monitor().unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(0xC1DE);
        let mut statements = Vec::new();
        for idx in 0..12 {
            let mut b = GraphBuilder::new(format!("random_{idx}"));
            let thread = b.add_thread();
            for _ in 0..rng.random_range(1..4) {
                let kind = if rng.random_bool(0.5) {
                    RowOpKind::Select
                } else {
                    RowOpKind::Update
                };
                let table = TableId(rng.random_range(0..3));
                let op = RowOp::new(kind, table, rng.random_range(0..20));
                b.push(thread, NodeKind::RowOperation(op)).unwrap();
            }
            let commits = rng.random_bool(0.7);
            if commits {
                b.push(thread, NodeKind::Commit).unwrap();
            }

            let trx = scheduler.begin_transaction(Driver::Pool);
            let reply = CommandReply::new();
            let fork = scheduler
                .create_fork(trx, b.build().unwrap(), reply.clone())
                .unwrap();
            scheduler.submit(fork).unwrap();
            statements.push((trx, commits, reply));
        }

        for (trx, commits, reply) in &statements {
            let outcome = reply
                .wait_timeout(Duration::from_secs(30))
                .unwrap_or_else(|| panic!("no reply for {trx}"));
            let info = scheduler.transaction_info(*trx).unwrap();
            if *commits && !outcome.is_failed() {
                assert_eq!(TrxState::Committed, info.state);
            }
            assert_eq!(0, info.active_thread_count);
        }
        scheduler.validate().unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.threads_activated, stats.threads_released);
        assert_eq!(
            stats.signals_dispatched,
            collab.signals.counts().total() as u64
        );

        server.shutdown();
        for (_, _, reply) in &statements {
            assert!(reply.try_take().is_none());
        }
    }
}
