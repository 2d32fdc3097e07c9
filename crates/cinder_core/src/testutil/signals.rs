use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::trx::signal::{Signal, SignalContext, SignalHandler, StandardSignalHandler};

/// Number of signals handled, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalCounts {
    pub commits: usize,
    pub rollbacks: usize,
    pub errors: usize,
    pub breaks: usize,
    pub rollbacks_finished: usize,
}

impl SignalCounts {
    pub fn total(&self) -> usize {
        self.commits + self.rollbacks + self.errors + self.breaks
    }
}

/// Standard signal handling that counts every dispatch.
#[derive(Debug, Default)]
pub struct CountingSignalHandler {
    inner: StandardSignalHandler,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    errors: AtomicUsize,
    breaks: AtomicUsize,
    rollbacks_finished: AtomicUsize,
}

impl CountingSignalHandler {
    pub fn counts(&self) -> SignalCounts {
        SignalCounts {
            commits: self.commits.load(Ordering::SeqCst),
            rollbacks: self.rollbacks.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            breaks: self.breaks.load(Ordering::SeqCst),
            rollbacks_finished: self.rollbacks_finished.load(Ordering::SeqCst),
        }
    }
}

impl SignalHandler for CountingSignalHandler {
    fn handle_commit(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.handle_commit(cx, signal)
    }

    fn handle_rollback(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        match cx.take_rollback_graph() {
            Some(graph) => cx.start_rollback_fork(graph, signal),
            None => self.rollback_finished(cx, signal),
        }
    }

    fn handle_error(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.inner.handle_error(cx, signal)
    }

    fn handle_break(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        self.breaks.fetch_add(1, Ordering::SeqCst);
        self.inner.handle_break(cx, signal)
    }

    fn rollback_finished(&self, cx: &mut SignalContext<'_>, signal: Signal) {
        self.rollbacks_finished.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback_finished(cx, signal)
    }
}
