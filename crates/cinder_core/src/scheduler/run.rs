use cinder_error::Result;
use tracing::trace;

use super::{Scheduler, Step};
use crate::graph::NodeKind;
use crate::thread::{ActiveThread, ThreadId};
use crate::trx::Driver;

/// Step counters for the current turn of a thread.
#[derive(Debug, Default)]
struct Turn {
    steps: u64,
    since_check: u64,
}

impl Scheduler {
    /// Run query threads until there's nothing left for this OS thread.
    ///
    /// Starts with `thread` and follows whatever each release hands back.
    pub fn run_threads(&self, thread: ActiveThread) {
        let mut thread = thread;
        let mut turn = Turn::default();
        let mut check_now = true;

        loop {
            if check_now || turn.since_check >= self.config.check_interval {
                check_now = false;
                turn.since_check = 0;

                if self.peek_stop(&thread) {
                    let id = thread.id;
                    match self.release(thread) {
                        Some(next) => {
                            if next.id != id {
                                check_now = true;
                                turn = Turn::default();
                            }
                            thread = next;
                            continue;
                        }
                        None => return,
                    }
                }
            }

            if turn.steps >= self.config.round_robin_limit {
                let id = thread.id;
                thread = self.round_robin(thread);
                turn = Turn::default();
                check_now = thread.id != id;
                if check_now {
                    continue;
                }
            }

            let step = self.step(&mut thread);
            turn.steps += 1;
            turn.since_check += 1;

            if thread.resource == self.config.parallelize_limit {
                let op = match &thread.graph.node(thread.cursor.continuation.node()).kind {
                    NodeKind::RowOperation(op) => Some(op),
                    _ => None,
                };
                trace!(thread = %thread.id, "parallelize limit reached");
                self.row_operator.parallelize(thread.id, op);
            }

            match step {
                Step::Continue => (),
                Step::Release => {
                    let id = thread.id;
                    match self.release(thread) {
                        Some(next) => {
                            if next.id != id {
                                check_now = true;
                                turn = Turn::default();
                            }
                            thread = next;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Hand the thread back to the task queue if other pool work is waiting,
    /// returning the thread to continue with.
    fn round_robin(&self, thread: ActiveThread) -> ActiveThread {
        if thread.driver != Driver::Pool {
            return thread;
        }
        let mut state = self.lock();
        let Some(next) = state.tasks.pop_front() else {
            return thread;
        };
        trace!(from = %thread.id, to = %next.id, "round robin");
        state.tasks.push_back(thread);
        state.stats.round_robins += 1;
        next
    }

    /// Restart an idle thread and run it on the calling OS thread.
    ///
    /// Completed, running, and waiting threads can't be restarted.
    pub fn run_thread(&self, thread: ThreadId) -> Result<()> {
        let thread = {
            let mut state = self.lock();
            self.restart_thread(&mut state, thread)?
        };
        self.run_threads(thread);
        Ok(())
    }

    /// Run the next queued task on the calling OS thread. Returns false if the
    /// queue was empty.
    pub fn run_next_task(&self) -> bool {
        let task = self.lock().tasks.pop_front();
        match task {
            Some(thread) => {
                self.run_threads(thread);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::graph::{RowOp, RowOpKind};
    use crate::ops::{CommandReply, TableId};
    use crate::testutil::{
        RecordingRowOperator,
        TestCollaborators,
        new_test_scheduler_with_config,
        row_ops_graph,
        test_config,
    };
    use crate::trx::{Driver, TrxId};

    fn longest_run(trxs: &[TrxId]) -> usize {
        let mut longest = 0;
        let mut run = 0;
        let mut prev = None;
        for trx in trxs {
            if Some(trx) == prev {
                run += 1;
            } else {
                run = 1;
                prev = Some(trx);
            }
            longest = longest.max(run);
        }
        longest
    }

    #[test]
    fn round_robin_bounds_turns() {
        let config = SchedulerConfig {
            check_interval: 2,
            round_robin_limit: 8,
            ..test_config()
        };
        let (scheduler, collab) = new_test_scheduler_with_config(
            config,
            TestCollaborators::new(RecordingRowOperator::new(1)),
        );

        let mut trxs = Vec::new();
        let mut forks = Vec::new();
        for table in [TableId(1), TableId(2)] {
            let trx = scheduler.begin_transaction(Driver::Pool);
            let graph = row_ops_graph("scan", [RowOp::new(RowOpKind::Select, table, 40)]);
            forks.push(scheduler.create_fork(trx, graph, CommandReply::new()).unwrap());
            trxs.push(trx);
        }

        let first = scheduler.start_command(forks[0]).unwrap();
        scheduler.submit(forks[1]).unwrap();
        scheduler.run_threads(first);
        while scheduler.run_next_task() {}

        let log: Vec<_> = collab.operator.log().iter().map(|r| r.trx).collect();
        assert_eq!(80, log.len());
        // Only while both were runnable.
        let last_a = log.iter().rposition(|t| *t == trxs[0]).unwrap();
        let last_b = log.iter().rposition(|t| *t == trxs[1]).unwrap();
        let both = &log[..=last_a.min(last_b)];
        assert!(longest_run(both) <= 8, "longest run: {}", longest_run(both));
        assert!(scheduler.stats().round_robins >= 5);
        scheduler.validate().unwrap();
    }

    #[test]
    fn client_threads_are_not_rotated() {
        let config = SchedulerConfig {
            round_robin_limit: 4,
            ..test_config()
        };
        let (scheduler, _collab) = new_test_scheduler_with_config(
            config,
            TestCollaborators::new(RecordingRowOperator::new(1)),
        );

        let pool_trx = scheduler.begin_transaction(Driver::Pool);
        let graph = row_ops_graph("scan", [RowOp::new(RowOpKind::Select, TableId(1), 10)]);
        let pool_fork = scheduler
            .create_fork(pool_trx, graph.clone(), CommandReply::new())
            .unwrap();
        scheduler.submit(pool_fork).unwrap();

        let client_trx = scheduler.begin_transaction(Driver::Client);
        let client_fork = scheduler
            .create_fork(client_trx, graph, CommandReply::new())
            .unwrap();
        scheduler.run_threads(scheduler.start_command(client_fork).unwrap());

        assert_eq!(0, scheduler.stats().round_robins);
        assert_eq!(1, scheduler.num_queued_tasks());
        while scheduler.run_next_task() {}
    }

    #[test]
    fn parallelize_hook_fires_once() {
        let config = SchedulerConfig {
            parallelize_limit: 5,
            ..test_config()
        };
        let (scheduler, collab) = new_test_scheduler_with_config(
            config,
            TestCollaborators::new(RecordingRowOperator::new(1)),
        );
        let trx = scheduler.begin_transaction(Driver::Pool);
        let graph = row_ops_graph("scan", [RowOp::new(RowOpKind::Select, TableId(1), 20)]);
        let fork = scheduler.create_fork(trx, graph, CommandReply::new()).unwrap();

        let thread = scheduler.start_command(fork).unwrap();
        let id = thread.id();
        scheduler.run_threads(thread);

        assert_eq!(vec![id], collab.operator.parallelized());
        assert!(scheduler.thread_info(id).unwrap().resource > 5);
    }

    #[test]
    fn run_next_task_on_empty_queue() {
        let config = test_config();
        let (scheduler, _) = new_test_scheduler_with_config(
            config,
            TestCollaborators::new(RecordingRowOperator::default()),
        );
        assert!(!scheduler.run_next_task());
    }
}
