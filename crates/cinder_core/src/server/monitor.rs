use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_error::DbError;
use tracing::{debug, warn};

use super::event::WaitEvent;
use super::{SlotTable, ThreadType};
use crate::scheduler::Scheduler;
use crate::trx::{TrxErrorState, TrxQueState};

impl SlotTable {
    /// Flag client slots parked longer than `after`. Returns true if any slot
    /// was newly flagged.
    fn mark_long_client_waits(&mut self, now: Instant, after: Duration) -> bool {
        let mut any = false;
        for s in self.slots.iter_mut() {
            if !(s.in_use && s.suspended && s.thread_type == ThreadType::Client) || s.boosted {
                continue;
            }
            let waited = s
                .suspended_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default();
            if waited >= after {
                s.boosted = true;
                any = true;
            }
        }
        any
    }
}

impl Scheduler {
    /// Cancel every lock wait older than the configured timeout.
    ///
    /// Timed out transactions fail with a lock wait timeout error and their
    /// waiting threads are resumed so the failure reaches the caller. Also
    /// boosts background threads when a client has been parked too long.
    /// Returns the number of cancelled waits.
    pub fn check_lock_wait_timeouts(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let timeout = self.config.lock_wait_timeout;

        let expired: Vec<_> = state
            .trxs
            .values()
            .filter_map(|t| match t.que_state {
                TrxQueState::LockWait { wait, since }
                    if now.saturating_duration_since(since) >= timeout =>
                {
                    Some((t.id, wait, now.saturating_duration_since(since)))
                }
                _ => None,
            })
            .collect();

        let mut cancelled = 0;
        for (trx_id, wait, waited) in expired {
            // Already granted, the grant resumes the transaction.
            let Some(granted) = self.lock_manager.cancel_wait(wait) else {
                debug!(trx = %trx_id, %wait, "expired wait already granted");
                continue;
            };
            warn!(trx = %trx_id, %wait, waited_ms = waited.as_millis() as u64, "lock wait timed out");

            let trx = state.trx_mut(trx_id);
            if !trx.error_state.is_failure() {
                trx.error_state = TrxErrorState::LockWaitTimeout;
                trx.error = Some(
                    DbError::new("Lock wait timeout exceeded")
                        .with_field("trx", trx_id)
                        .with_field("timeout_ms", timeout.as_millis()),
                );
            }
            state.stats.lock_wait_timeouts += 1;
            self.end_lock_wait_locked(&mut state, trx_id);
            for other in granted {
                self.end_lock_wait_locked(&mut state, other);
            }
            cancelled += 1;
        }

        if state
            .slots
            .mark_long_client_waits(now, self.config.priority_boost_after)
        {
            self.boost_background_locked(&mut state);
        }

        cancelled
    }

    /// Run lock wait checks every monitor interval until `stop` is set.
    pub(crate) fn run_lock_wait_monitor(&self, stop: &Arc<WaitEvent>) {
        let interval = self.config.monitor_interval;
        debug!(?interval, "lock wait monitor started");
        while !stop.wait_timeout(interval) {
            let cancelled = self.check_lock_wait_timeouts();
            if cancelled > 0 {
                debug!(cancelled, "cancelled lock waits");
            }
        }
        debug!("lock wait monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::ops::{CommandReply, LockMode, TableId};
    use crate::testutil::{
        lock_update_graph,
        new_test_scheduler_with_config,
        test_collaborators,
        test_config,
    };
    use crate::thread::ThreadState;
    use crate::trx::signal::SignalKind;
    use crate::trx::{Driver, TrxId};

    const T1: TableId = TableId(1);

    fn start_lock_update(
        scheduler: &Scheduler,
        driver: Driver,
    ) -> (TrxId, Arc<CommandReply>) {
        let trx = scheduler.begin_transaction(driver);
        let reply = CommandReply::new();
        let fork = scheduler
            .create_fork(
                trx,
                lock_update_graph(T1, LockMode::Exclusive, 3),
                reply.clone(),
            )
            .unwrap();
        scheduler.run_threads(scheduler.start_command(fork).unwrap());
        (trx, reply)
    }

    #[test]
    fn timed_out_wait_fails_command() {
        let mut config = test_config();
        config.lock_wait_timeout = Duration::from_millis(1);
        let (scheduler, collab) = new_test_scheduler_with_config(config, test_collaborators());

        let (holder, holder_reply) = start_lock_update(&scheduler, Driver::Pool);
        holder_reply.try_take().unwrap().into_result().unwrap();
        let (waiter, reply) = start_lock_update(&scheduler, Driver::Pool);
        assert!(reply.try_take().is_none());
        assert!(scheduler.transaction_info(waiter).unwrap().in_lock_wait);
        assert_eq!(1, collab.locks.num_waiters(T1));

        thread::sleep(Duration::from_millis(5));
        assert_eq!(1, scheduler.check_lock_wait_timeouts());
        assert_eq!(0, collab.locks.num_waiters(T1));
        assert_eq!(1, scheduler.num_queued_tasks());

        assert!(scheduler.run_next_task());
        let err = reply.try_take().unwrap().into_result().unwrap_err();
        assert_eq!("Lock wait timeout exceeded", err.get_msg());
        assert_eq!(Some(waiter.to_string().as_str()), err.get_field("trx"));
        assert_eq!(0, collab.operator.rows_for(waiter));
        assert_eq!(1, scheduler.stats().lock_wait_timeouts);

        // Nothing left to time out.
        assert_eq!(0, scheduler.check_lock_wait_timeouts());
        assert_eq!(Some(LockMode::Exclusive), collab.locks.held_mode(holder, T1));
        scheduler.validate().unwrap();
    }

    #[test]
    fn fresh_waits_are_kept() {
        let (scheduler, collab) = new_test_scheduler_with_config(test_config(), test_collaborators());

        let (holder, _) = start_lock_update(&scheduler, Driver::Pool);
        let (waiter, reply) = start_lock_update(&scheduler, Driver::Pool);

        assert_eq!(0, scheduler.check_lock_wait_timeouts());
        assert!(scheduler.transaction_info(waiter).unwrap().in_lock_wait);
        assert_eq!(1, collab.locks.num_waiters(T1));

        scheduler
            .send_signal(holder, SignalKind::CommitRequested)
            .unwrap();
        assert!(scheduler.run_next_task());
        reply.try_take().unwrap().into_result().unwrap();
        assert_eq!(3, collab.operator.rows_for(waiter));
        assert_eq!(0, scheduler.stats().lock_wait_timeouts);
    }

    #[test]
    fn long_client_wait_boosts_once() {
        let mut config = test_config();
        config.priority_boost_after = Duration::from_millis(1);
        let (scheduler, _collab) = new_test_scheduler_with_config(config, test_collaborators());

        let (holder, _) = start_lock_update(&scheduler, Driver::Pool);

        let trx = scheduler.begin_transaction(Driver::Client);
        let reply = CommandReply::new();
        let fork = scheduler
            .create_fork(trx, lock_update_graph(T1, LockMode::Exclusive, 2), reply.clone())
            .unwrap();
        let thread_id = scheduler.fork_info(fork).unwrap().threads[0];
        let handle = thread::spawn({
            let scheduler = scheduler.clone();
            move || scheduler.execute_for_client(fork)
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while !scheduler
            .slot_info()
            .iter()
            .any(|s| s.suspended && s.waiting_thread == Some(thread_id))
        {
            assert!(Instant::now() < deadline, "client never parked");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            ThreadState::LockWait,
            scheduler.thread_info(thread_id).unwrap().state
        );

        thread::sleep(Duration::from_millis(5));
        scheduler.check_lock_wait_timeouts();
        scheduler.check_lock_wait_timeouts();
        assert_eq!(1, scheduler.stats().priority_boosts);

        scheduler
            .send_signal(holder, SignalKind::CommitRequested)
            .unwrap();
        handle.join().unwrap().unwrap();
        reply.try_take().unwrap().into_result().unwrap();
    }
}
