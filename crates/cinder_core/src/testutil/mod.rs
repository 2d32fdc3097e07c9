//! Collaborators and graph builders for driving the scheduler in tests and
//! benchmarks.

mod locks;
mod operator;
mod signals;

use std::sync::Arc;

pub use locks::TableLockManager;
pub use operator::{RecordingRowOperator, StepRecord};
pub use signals::{CountingSignalHandler, SignalCounts};

use crate::config::SchedulerConfig;
use crate::graph::expr::Expr;
use crate::graph::{GraphBuilder, NodeKind, QueryGraph, RowOp, RowOpKind};
use crate::ops::{LockMode, TableId};
use crate::scheduler::{Collaborators, Scheduler};

/// Test doubles kept around so tests can inspect them.
#[derive(Debug, Clone)]
pub struct TestCollaborators {
    pub operator: Arc<RecordingRowOperator>,
    pub locks: Arc<TableLockManager>,
    pub signals: Arc<CountingSignalHandler>,
}

impl TestCollaborators {
    pub fn new(operator: RecordingRowOperator) -> Self {
        TestCollaborators {
            operator: Arc::new(operator),
            locks: Arc::new(TableLockManager::new()),
            signals: Arc::new(CountingSignalHandler::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            row_operator: self.operator.clone(),
            lock_manager: self.locks.clone(),
            signal_handler: self.signals.clone(),
        }
    }
}

pub fn test_collaborators() -> TestCollaborators {
    TestCollaborators::new(RecordingRowOperator::default())
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_threads: 2,
        ..Default::default()
    }
}

pub fn new_test_scheduler(collab: TestCollaborators) -> (Arc<Scheduler>, TestCollaborators) {
    new_test_scheduler_with_config(test_config(), collab)
}

pub fn new_test_scheduler_with_config(
    config: SchedulerConfig,
    collab: TestCollaborators,
) -> (Arc<Scheduler>, TestCollaborators) {
    let scheduler = Scheduler::try_new(config, collab.collaborators()).unwrap();
    (scheduler, collab)
}

/// Single thread graph running each row operation in order.
pub fn row_ops_graph(name: &str, ops: impl IntoIterator<Item = RowOp>) -> Arc<QueryGraph> {
    let mut b = GraphBuilder::new(name);
    let thread = b.add_thread();
    for op in ops {
        b.push(thread, NodeKind::RowOperation(op)).unwrap();
    }
    b.build().unwrap()
}

/// Insert into `table` followed by a commit.
pub fn insert_commit_graph(table: TableId, rows: u64) -> Arc<QueryGraph> {
    let mut b = GraphBuilder::new("insert_commit");
    let thread = b.add_thread();
    b.push(
        thread,
        NodeKind::RowOperation(RowOp::new(RowOpKind::Insert, table, rows)),
    )
    .unwrap();
    b.push(thread, NodeKind::Commit).unwrap();
    b.build().unwrap()
}

/// Lock `table`, then update `rows` rows in it.
pub fn lock_update_graph(table: TableId, mode: LockMode, rows: u64) -> Arc<QueryGraph> {
    let mut b = GraphBuilder::new("lock_update");
    let thread = b.add_thread();
    b.push(thread, NodeKind::Lock { table, mode }).unwrap();
    b.push(
        thread,
        NodeKind::RowOperation(RowOp::new(RowOpKind::Update, table, rows)),
    )
    .unwrap();
    b.build().unwrap()
}

/// Graph counting `var` up to `n` in a while loop, `n` steps per iteration.
pub fn counting_loop_graph(var: &str, n: i64) -> Arc<QueryGraph> {
    let mut b = GraphBuilder::new("counting_loop");
    let thread = b.add_thread();
    b.push(
        thread,
        NodeKind::Assignment {
            var: var.to_string(),
            expr: Expr::lit(0),
        },
    )
    .unwrap();
    let lp = b
        .push(
            thread,
            NodeKind::While {
                cond: Expr::var(var).lt(Expr::lit(n)),
                body: None,
            },
        )
        .unwrap();
    b.push(
        lp,
        NodeKind::Assignment {
            var: var.to_string(),
            expr: Expr::var(var).add(Expr::lit(1)),
        },
    )
    .unwrap();
    b.build().unwrap()
}
