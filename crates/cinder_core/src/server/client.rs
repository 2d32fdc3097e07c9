use std::sync::Arc;

use cinder_error::{DbError, Result};
use tracing::{debug, trace};

use super::event::WaitEvent;
use super::{SlotId, SlotTable, ThreadType};
use crate::fork::ForkId;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::thread::{ActiveThread, ThreadId};
use crate::trx::{Driver, TrxId};

impl SlotTable {
    /// Park a client slot until `thread` of `trx` is resumed.
    fn suspend_client(&mut self, slot: SlotId, trx: TrxId, thread: ThreadId) -> Arc<WaitEvent> {
        let s = &mut self.slots[slot.0];
        assert!(
            s.in_use && s.thread_type == ThreadType::Client,
            "{slot} isn't a reserved client slot"
        );
        s.waiting_trx = Some(trx);
        s.waiting_thread = Some(thread);
        s.boosted = false;
        self.mark_suspended(slot)
    }

    fn wake_client(&mut self, trx: TrxId) -> bool {
        let idx = self.slots.iter().position(|s| {
            s.in_use
                && s.suspended
                && s.thread_type == ThreadType::Client
                && s.waiting_trx == Some(trx)
        });
        match idx {
            Some(idx) => {
                self.wake(idx);
                true
            }
            None => false,
        }
    }
}

impl Scheduler {
    /// Run a command on a client-driven fork using the calling OS thread.
    ///
    /// Returns once the transaction has nothing left for this caller to run.
    /// Lock and signal waits park the caller on its own client slot.
    pub fn execute_for_client(&self, fork: ForkId) -> Result<()> {
        let (slot, trx, thread) = {
            let mut state = self.lock();
            let trx = state
                .forks
                .get(&fork)
                .map(|f| f.trx)
                .ok_or_else(|| DbError::new("Unknown fork").with_field("fork", fork))?;
            if state.trx(trx).driver != Driver::Client {
                return Err(DbError::new("Fork is not client-driven")
                    .with_field("fork", fork)
                    .with_field("trx", trx));
            }
            let slot = state.slots.reserve(ThreadType::Client)?;
            match self.start_command_locked(&mut state, fork) {
                Ok(thread) => (slot, trx, thread),
                Err(e) => {
                    state.slots.free(slot)?;
                    return Err(e);
                }
            }
        };
        debug!(%fork, %trx, %slot, "executing for client");

        let mut thread = thread;
        loop {
            self.run_threads(thread);
            match self.wait_for_client_resume(slot, trx) {
                Some(resumed) => thread = resumed,
                None => break,
            }
        }

        self.lock().slots.free(slot)
    }

    /// Block until a thread of `trx` is handed back to the caller, or return
    /// None if nothing of the transaction is waiting anymore.
    fn wait_for_client_resume(&self, slot: SlotId, trx: TrxId) -> Option<ActiveThread> {
        loop {
            let event = {
                let mut state = self.lock();
                if let Some(thread) = state.client_ready.remove(&trx) {
                    return Some(thread);
                }
                let waiting = waiting_thread(&state, trx)?;
                trace!(%trx, thread = %waiting, %slot, "client waiting");
                state.slots.suspend_client(slot, trx, waiting)
            };
            event.wait();
        }
    }

    /// Give a resumed client-driven thread to its caller.
    pub(crate) fn hand_to_client(&self, state: &mut SchedulerState, thread: ActiveThread) {
        let trx = thread.trx;
        let id = thread.id;
        let prev = state.client_ready.insert(trx, thread);
        assert!(prev.is_none(), "{trx} resumed two client threads");
        let woke = state.slots.wake_client(trx);
        trace!(%trx, thread = %id, woke, "handed thread to client");
    }
}

/// First thread of the transaction waiting to be resumed, if any.
fn waiting_thread(state: &SchedulerState, trx: TrxId) -> Option<ThreadId> {
    state
        .forks
        .values()
        .filter(|f| f.trx == trx)
        .flat_map(|f| f.threads.iter().copied())
        .find(|t| state.thread(*t).state.is_waiting())
}
