//! Server thread governor.
//!
//! Tracks the OS threads driving the scheduler. Each thread reserves a slot
//! with its own wait event and parks on it when it has nothing to do.

mod bootstrap;
mod client;
pub mod event;
mod meter;
mod monitor;

pub use bootstrap::Server;
pub use meter::compute_max_allowed;

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId as OsThreadId;
use std::time::Instant;

use cinder_error::{DbError, Result};
use event::WaitEvent;
use serde::Serialize;
use tracing::{debug, error};

use crate::scheduler::{Scheduler, SchedulerState};
use crate::thread::{ActiveThread, ThreadId};
use crate::trx::{Driver, TrxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ThreadType {
    /// Runs query threads from the task queue.
    Worker,
    Communication,
    /// Background recovery work.
    Recovery,
    Console,
    /// Background maintenance work.
    Master,
    /// A caller driving its own query threads.
    Client,
}

impl ThreadType {
    pub const ALL: [ThreadType; 6] = [
        ThreadType::Worker,
        ThreadType::Communication,
        ThreadType::Recovery,
        ThreadType::Console,
        ThreadType::Master,
        ThreadType::Client,
    ];

    pub const UTILITY: [ThreadType; 2] = [ThreadType::Recovery, ThreadType::Master];

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Worker => 0,
            Self::Communication => 1,
            Self::Recovery => 2,
            Self::Console => 3,
            Self::Master => 4,
            Self::Client => 5,
        }
    }

    /// Thread may park itself through `suspend_thread`.
    pub fn can_suspend(&self) -> bool {
        matches!(self, Self::Worker | Self::Recovery | Self::Master)
    }

    pub fn is_utility(&self) -> bool {
        matches!(self, Self::Recovery | Self::Master)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Slot {
    thread_type: ThreadType,
    os_thread: OsThreadId,
    in_use: bool,
    suspended: bool,
    suspended_since: Option<Instant>,
    event: Arc<WaitEvent>,
    /// Client slots only, transaction the caller is waiting on.
    waiting_trx: Option<TrxId>,
    /// Client slots only, query thread the caller is waiting to resume.
    waiting_thread: Option<ThreadId>,
    /// Long wait already triggered a boost.
    boosted: bool,
}

/// Point in time view of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub id: SlotId,
    pub thread_type: ThreadType,
    pub suspended: bool,
    pub waiting_trx: Option<TrxId>,
    pub waiting_thread: Option<ThreadId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadCounts {
    /// Slots reserved.
    pub created: usize,
    /// Reserved and not suspended.
    pub active: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    created: [usize; 6],
    active: [usize; 6],
    pub(crate) meters: [u32; 6],
}

impl SlotTable {
    pub(crate) fn counts(&self, ty: ThreadType) -> ThreadCounts {
        ThreadCounts {
            created: self.created[ty.index()],
            active: self.active[ty.index()],
        }
    }

    fn get_mut(&mut self, slot: SlotId) -> Result<&mut Slot> {
        match self.slots.get_mut(slot.0) {
            Some(s) if s.in_use => Ok(s),
            _ => Err(DbError::new("Slot not in use").with_field("slot", slot)),
        }
    }

    /// Reserve a slot for the calling OS thread. Reserving again with the same
    /// type returns the same slot.
    pub(crate) fn reserve(&mut self, ty: ThreadType) -> Result<SlotId> {
        let os_thread = std::thread::current().id();
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.in_use && s.os_thread == os_thread)
        {
            let existing = self.slots[idx].thread_type;
            if existing != ty {
                return Err(DbError::new("OS thread already has a slot of another type")
                    .with_field("slot", SlotId(idx))
                    .with_field("existing", format!("{existing:?}"))
                    .with_field("requested", format!("{ty:?}")));
            }
            return Ok(SlotId(idx));
        }

        let slot = Slot {
            thread_type: ty,
            os_thread,
            in_use: true,
            suspended: false,
            suspended_since: None,
            event: Arc::new(WaitEvent::new()),
            waiting_trx: None,
            waiting_thread: None,
            boosted: false,
        };
        let id = match self.slots.iter().position(|s| !s.in_use) {
            Some(idx) => {
                self.slots[idx] = slot;
                SlotId(idx)
            }
            None => {
                self.slots.push(slot);
                SlotId(self.slots.len() - 1)
            }
        };
        self.created[ty.index()] += 1;
        self.active[ty.index()] += 1;
        debug!(slot = %id, ?ty, "reserved slot");
        Ok(id)
    }

    pub(crate) fn free(&mut self, slot: SlotId) -> Result<()> {
        let s = self.get_mut(slot)?;
        if s.suspended {
            return Err(DbError::new("Cannot free a suspended slot").with_field("slot", slot));
        }
        s.in_use = false;
        let ty = s.thread_type;
        self.created[ty.index()] -= 1;
        self.active[ty.index()] -= 1;
        debug!(%slot, ?ty, "freed slot");
        Ok(())
    }

    /// Mark a slot suspended, returning the event to wait on.
    fn suspend(&mut self, slot: SlotId) -> Result<Arc<WaitEvent>> {
        let s = self.get_mut(slot)?;
        if !s.thread_type.can_suspend() {
            return Err(DbError::new("Thread type cannot be suspended")
                .with_field("slot", slot)
                .with_field("type", format!("{:?}", s.thread_type)));
        }
        if s.suspended {
            return Err(DbError::new("Slot is already suspended").with_field("slot", slot));
        }
        Ok(self.mark_suspended(slot))
    }

    fn mark_suspended(&mut self, slot: SlotId) -> Arc<WaitEvent> {
        let s = &mut self.slots[slot.0];
        s.suspended = true;
        s.suspended_since = Some(Instant::now());
        s.event.reset();
        let event = s.event.clone();
        let ty = s.thread_type;
        self.active[ty.index()] -= 1;
        event
    }

    fn wake(&mut self, idx: usize) {
        let s = &mut self.slots[idx];
        s.suspended = false;
        s.suspended_since = None;
        s.waiting_trx = None;
        s.waiting_thread = None;
        s.boosted = false;
        s.event.set();
        let ty = s.thread_type;
        self.active[ty.index()] += 1;
    }

    /// Wake up to `n` suspended threads of a type.
    pub(crate) fn release(&mut self, ty: ThreadType, n: usize) -> usize {
        let mut released = 0;
        for idx in 0..self.slots.len() {
            if released == n {
                break;
            }
            let s = &self.slots[idx];
            if s.in_use && s.suspended && s.thread_type == ty {
                self.wake(idx);
                released += 1;
            }
        }
        released
    }

    pub(crate) fn info(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(idx, s)| SlotInfo {
                id: SlotId(idx),
                thread_type: s.thread_type,
                suspended: s.suspended,
                waiting_trx: s.waiting_trx,
                waiting_thread: s.waiting_thread,
            })
            .collect()
    }
}

impl Scheduler {
    /// Reserve a slot for the calling OS thread.
    pub fn reserve_slot(&self, ty: ThreadType) -> Result<SlotId> {
        if ty == ThreadType::Client {
            return Err(DbError::new("Client slots are reserved by execute_for_client"));
        }
        self.lock().slots.reserve(ty)
    }

    pub fn free_slot(&self, slot: SlotId) -> Result<()> {
        self.lock().slots.free(slot)
    }

    /// Park the calling OS thread until its slot is released.
    ///
    /// Returns right away once shutdown has begun.
    pub fn suspend_thread(&self, slot: SlotId) -> Result<()> {
        let event = {
            let mut state = self.lock();
            if state.shutdown {
                return Ok(());
            }
            state.slots.suspend(slot)?
        };
        event.wait();
        Ok(())
    }

    /// Wake up to `n` suspended threads of `ty`, returning how many woke.
    pub fn release_threads(&self, ty: ThreadType, n: usize) -> usize {
        self.lock().slots.release(ty, n)
    }

    pub fn thread_counts(&self, ty: ThreadType) -> ThreadCounts {
        self.lock().slots.counts(ty)
    }

    pub fn slot_info(&self) -> Vec<SlotInfo> {
        self.lock().slots.info()
    }

    /// Queue a running pool-driven thread and wake a worker for it.
    pub fn enqueue_task(&self, thread: ActiveThread) {
        let mut state = self.lock();
        self.enqueue_task_locked(&mut state, thread);
    }

    pub(crate) fn enqueue_task_locked(&self, state: &mut SchedulerState, thread: ActiveThread) {
        debug_assert_eq!(Driver::Pool, thread.driver);
        state.tasks.push_back(thread);
        state.stats.tasks_enqueued += 1;
        state.slots.release(ThreadType::Worker, 1);
    }

    pub fn num_queued_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Pop the next task, or park the worker until one is queued.
    ///
    /// Checking the queue and marking the slot suspended happen under the
    /// same lock acquisition, so an enqueue can't slip in between. Returns
    /// None on shutdown.
    pub fn next_task_or_suspend(&self, slot: SlotId) -> Option<ActiveThread> {
        loop {
            let event = {
                let mut state = self.lock();
                if let Some(task) = state.tasks.pop_front() {
                    return Some(task);
                }
                if state.shutdown {
                    return None;
                }
                match state.slots.suspend(slot) {
                    Ok(event) => event,
                    Err(e) => {
                        error!(%slot, %e, "failed to suspend worker");
                        return None;
                    }
                }
            };
            event.wait();
        }
    }

    /// Schedule a thread that was resumed away from its driver.
    pub(crate) fn schedule_resumed(&self, state: &mut SchedulerState, thread: ActiveThread) {
        match thread.driver {
            Driver::Pool => self.enqueue_task_locked(state, thread),
            Driver::Client => self.hand_to_client(state, thread),
        }
    }

    /// Stop accepting work and wake every parked pool thread.
    pub fn begin_shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        for ty in ThreadType::ALL {
            if ty.can_suspend() {
                state.slots.release(ty, usize::MAX);
            }
        }
        debug!("scheduler shutting down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}
