use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;

use cinder_error::DbError;
use serde::Serialize;
use tracing::debug;

use super::{TrxId, TrxState};
use crate::graph::QueryGraph;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::thread::{ActiveThread, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignalKind {
    CommitRequested,
    RollbackRequested,
    ErrorOccurred,
    BreakExecution,
}

impl SignalKind {
    fn ends_transaction(&self) -> bool {
        matches!(self, Self::CommitRequested | Self::RollbackRequested)
    }
}

/// A queued request to interrupt a transaction.
#[derive(Debug)]
pub struct Signal {
    pub kind: SignalKind,
    /// Thread waiting in `SignalReplyWait` for this signal to be handled.
    pub sender: Option<ThreadId>,
    /// Error carried by `ErrorOccurred`.
    pub error: Option<DbError>,
}

impl Signal {
    pub fn new(kind: SignalKind, sender: Option<ThreadId>) -> Self {
        Signal {
            kind,
            sender,
            error: None,
        }
    }

    pub fn error(error: DbError) -> Self {
        Signal {
            kind: SignalKind::ErrorOccurred,
            sender: None,
            error: Some(error),
        }
    }
}

/// If a signal of this kind may be queued behind the given signals.
///
/// Only one commit or rollback may be pending at a time. Errors and breaks
/// are always accepted.
pub(crate) fn is_compatible(queue: &VecDeque<Signal>, kind: SignalKind) -> bool {
    if !kind.ends_transaction() {
        return true;
    }
    !queue.iter().any(|s| s.kind.ends_transaction())
}

/// Handles signals once their transaction has no active threads.
///
/// Called with the global lock held. Any thread the handler wants to run is
/// handed back through the context.
pub trait SignalHandler: Debug + Sync + Send {
    fn handle_commit(&self, cx: &mut SignalContext<'_>, signal: Signal);
    fn handle_rollback(&self, cx: &mut SignalContext<'_>, signal: Signal);
    fn handle_error(&self, cx: &mut SignalContext<'_>, signal: Signal);
    fn handle_break(&self, cx: &mut SignalContext<'_>, signal: Signal);

    /// The rollback fork started for `signal` completed.
    fn rollback_finished(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        cx.release_locks();
        cx.set_trx_state(TrxState::RolledBack);
        cx.reply(&signal);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardSignalHandler;

impl SignalHandler for StandardSignalHandler {
    fn handle_commit(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        cx.release_locks();
        cx.set_trx_state(TrxState::Committed);
        cx.reply(&signal);
    }

    fn handle_rollback(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        match cx.take_rollback_graph() {
            Some(graph) => cx.start_rollback_fork(graph, signal),
            None => self.rollback_finished(cx, signal),
        }
    }

    fn handle_error(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        let error = signal
            .error
            .unwrap_or_else(|| DbError::new("Transaction error"));
        cx.cancel_lock_wait();
        cx.set_error(error);
        cx.fork_error_handle();
    }

    fn handle_break(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        // Nothing to cancel once the command finished.
        if cx.has_running_command() {
            cx.cancel_lock_wait();
            cx.set_error(DbError::new("Query execution canceled"));
            cx.fork_error_handle();
        }
        cx.reply(&signal);
    }
}

/// Kernel operations available to signal handlers.
pub struct SignalContext<'a> {
    pub(crate) scheduler: &'a Scheduler,
    pub(crate) state: &'a mut SchedulerState,
    pub(crate) trx: TrxId,
    /// Thread to run on the releasing OS thread.
    pub(crate) next: &'a mut Option<ActiveThread>,
}

impl SignalContext<'_> {
    pub fn trx(&self) -> TrxId {
        self.trx
    }

    pub fn trx_state(&self) -> TrxState {
        self.state.trx(self.trx).state
    }

    pub fn set_trx_state(&mut self, state: TrxState) {
        debug!(trx = %self.trx, ?state, "transaction state changed");
        self.state.trx_mut(self.trx).state = state;
    }

    /// Mark the transaction failed. The error is reported with the next reply.
    pub fn set_error(&mut self, error: DbError) {
        self.state.trx_mut(self.trx).set_error(error);
    }

    /// Release every lock held by the transaction, resuming transactions
    /// granted as a result.
    pub fn release_locks(&mut self) {
        self.scheduler.release_trx_locks(self.state, self.trx);
    }

    /// Cancel the transaction's pending lock request, if any, leaving its
    /// waiting threads suspended.
    pub fn cancel_lock_wait(&mut self) {
        self.scheduler.cancel_own_lock_wait(self.state, self.trx);
    }

    /// Resume the signal's sender.
    pub fn reply(&mut self, signal: &Signal) {
        let Some(sender) = signal.sender else {
            return;
        };
        if let Some(thread) = self.scheduler.end_wait(self.state, sender) {
            self.scheduler.offer(self.state, self.trx, thread, self.next);
        }
    }

    /// Force every thread of the bound fork to complete, running one of them
    /// so the failure reaches the fork's owner.
    pub fn fork_error_handle(&mut self) {
        if let Some(thread) = self.scheduler.fork_error_handle(self.state, self.trx) {
            self.scheduler.offer(self.state, self.trx, thread, self.next);
        }
    }

    pub fn take_rollback_graph(&mut self) -> Option<Arc<QueryGraph>> {
        self.state.trx_mut(self.trx).rollback_graph.take()
    }

    /// Run `graph` in a rollback fork. The handler's `rollback_finished` is
    /// called with `signal` once the fork completes.
    pub fn start_rollback_fork(&mut self, graph: Arc<QueryGraph>, signal: Signal) {
        debug!(trx = %self.trx, graph = graph.name(), "starting rollback fork");
        let thread = self
            .scheduler
            .start_rollback_fork(self.state, self.trx, graph, signal);
        self.scheduler.offer(self.state, self.trx, thread, self.next);
    }

    /// The bound fork is in the middle of a command.
    pub fn has_running_command(&self) -> bool {
        self.scheduler.has_running_command(self.state, self.trx)
    }
}

impl fmt::Debug for SignalContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalContext")
            .field("trx", &self.trx)
            .field("has_next", &self.next.is_some())
            .finish_non_exhaustive()
    }
}
