use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cinder_error::{DbError, Result, ResultExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::event::WaitEvent;
use super::{SlotId, ThreadType};
use crate::ops::UtilityTask;
use crate::scheduler::Scheduler;

/// OS threads driving a scheduler.
#[derive(Debug)]
pub struct Server {
    scheduler: Arc<Scheduler>,
    /// Stops the lock wait monitor.
    stop: Arc<WaitEvent>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Server {
            scheduler,
            stop: Arc::new(WaitEvent::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn spawn<F>(&self, name: String, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(f)
            .context("Failed to spawn server thread")?;
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Spawn `num_threads` workers running queued query threads.
    pub fn create_worker_pool(&self, num_threads: usize) -> Result<()> {
        info!(num_threads, "creating worker pool");
        for idx in 0..num_threads {
            let scheduler = self.scheduler.clone();
            self.spawn(format!("cinder_worker_{idx}"), move || {
                worker_main(&scheduler)
            })?;
        }
        Ok(())
    }

    /// Spawn a utility thread of `ty` that runs `task` while the category's
    /// meter admits it.
    pub fn create_utility_thread(&self, ty: ThreadType, task: Arc<dyn UtilityTask>) -> Result<()> {
        if !ty.is_utility() {
            return Err(DbError::new("Not a utility thread type").with_field("type", format!("{ty:?}")));
        }
        let scheduler = self.scheduler.clone();
        let name = format!("cinder_{}", format!("{ty:?}").to_lowercase());
        info!(?ty, "creating utility thread");
        self.spawn(name, move || utility_main(&scheduler, ty, task.as_ref()))
    }

    /// Reserve the master slot for the calling OS thread.
    pub fn reserve_master_slot(&self) -> Result<SlotId> {
        self.scheduler.reserve_slot(ThreadType::Master)
    }

    /// Spawn the thread cancelling lock waits past their timeout.
    pub fn start_lock_wait_monitor(&self) -> Result<()> {
        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        self.spawn("cinder_lock_monitor".to_string(), move || {
            scheduler.run_lock_wait_monitor(&stop)
        })
    }

    /// Stop every server thread and wait for them to exit.
    ///
    /// Workers finish the tasks still queued before exiting.
    pub fn shutdown(&self) {
        self.scheduler.begin_shutdown();
        self.stop.set();

        let handles = std::mem::take(&mut *self.handles.lock());
        let num_threads = handles.len();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!(%name, "server thread panicked");
            }
        }
        info!(num_threads, "server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.handles.get_mut().is_empty() {
            self.shutdown();
        }
    }
}

fn worker_main(scheduler: &Scheduler) {
    let slot = match scheduler.reserve_slot(ThreadType::Worker) {
        Ok(slot) => slot,
        Err(e) => {
            error!(%e, "failed to reserve worker slot");
            return;
        }
    };
    debug!(%slot, "worker started");

    while let Some(thread) = scheduler.next_task_or_suspend(slot) {
        scheduler.run_threads(thread);
    }

    if let Err(e) = scheduler.free_slot(slot) {
        warn!(%e, "failed to free worker slot");
    }
    debug!(%slot, "worker stopped");
}

fn utility_main(scheduler: &Scheduler, ty: ThreadType, task: &dyn UtilityTask) {
    let slot = match scheduler.reserve_slot(ty) {
        Ok(slot) => slot,
        Err(e) => {
            error!(%e, ?ty, "failed to reserve utility slot");
            return;
        }
    };
    debug!(%slot, ?ty, "utility thread started");

    while !scheduler.is_shutdown() {
        let idle = if scheduler.utility_may_run(ty) {
            match task.run_once() {
                Ok(0) => true,
                Ok(done) => {
                    if let Err(e) = scheduler.decrement_meter(ty, done) {
                        error!(%e, ?ty, "failed to decrement meter");
                    }
                    false
                }
                Err(e) => {
                    error!(%e, ?ty, "utility task failed");
                    true
                }
            }
        } else {
            true
        };

        if idle {
            if let Err(e) = scheduler.utility_idle_or_suspend(slot, ty) {
                error!(%e, ?ty, "failed to suspend utility thread");
                break;
            }
        }
    }

    if let Err(e) = scheduler.free_slot(slot) {
        warn!(%e, "failed to free utility slot");
    }
    debug!(%slot, ?ty, "utility thread stopped");
}
