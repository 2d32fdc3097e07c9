use std::collections::{HashMap, HashSet};

use cinder_error::{DbError, Result};
use parking_lot::Mutex;
use serde::Serialize;

use crate::graph::{RowOp, RowOpKind};
use crate::ops::{
    LockMode,
    LockStatus,
    OpOutcome,
    OperatorContext,
    RowOpState,
    RowOperator,
    TableId,
};
use crate::thread::ThreadId;
use crate::trx::TrxId;

/// A single call into the row operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub thread: ThreadId,
    pub trx: TrxId,
    pub kind: RowOpKind,
    pub table: TableId,
    /// Rows processed so far, including this call.
    pub rows_done: u64,
}

/// Row operator that processes rows in fixed size batches and records every
/// call.
///
/// Each operation first locks its table, shared for selects and exclusive
/// otherwise. Tables can be marked to fail.
#[derive(Debug)]
pub struct RecordingRowOperator {
    batch_size: u64,
    lock_tables: bool,
    inner: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    log: Vec<StepRecord>,
    fail_tables: HashSet<TableId>,
    rows: HashMap<TrxId, u64>,
    parallelized: Vec<ThreadId>,
}

impl Default for RecordingRowOperator {
    fn default() -> Self {
        Self::new(10)
    }
}

impl RecordingRowOperator {
    pub fn new(batch_size: u64) -> Self {
        RecordingRowOperator {
            batch_size: batch_size.max(1),
            lock_tables: true,
            inner: Mutex::new(RecordingState::default()),
        }
    }

    /// Skip locking tables before touching rows.
    pub fn without_locks(mut self) -> Self {
        self.lock_tables = false;
        self
    }

    /// Fail every subsequent operation on `table`.
    pub fn fail_table(&self, table: TableId) {
        self.inner.lock().fail_tables.insert(table);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().fail_tables.clear();
    }

    pub fn log(&self) -> Vec<StepRecord> {
        self.inner.lock().log.clone()
    }

    pub fn num_calls(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Rows processed by a transaction over every call.
    pub fn rows_for(&self, trx: TrxId) -> u64 {
        self.inner.lock().rows.get(&trx).copied().unwrap_or(0)
    }

    /// Threads that hit the parallelize limit.
    pub fn parallelized(&self) -> Vec<ThreadId> {
        self.inner.lock().parallelized.clone()
    }
}

impl RowOperator for RecordingRowOperator {
    fn step(
        &self,
        op: &RowOp,
        state: &mut RowOpState,
        cx: &mut OperatorContext<'_>,
    ) -> Result<OpOutcome> {
        if self.lock_tables && !state.lock_acquired {
            let mode = match op.kind {
                RowOpKind::Select => LockMode::Shared,
                _ => LockMode::Exclusive,
            };
            match cx.acquire_lock(op.table, mode) {
                LockStatus::Granted => state.lock_acquired = true,
                LockStatus::WouldWait(_) => return Ok(OpOutcome::Stop),
            }
        }

        let mut inner = self.inner.lock();
        if inner.fail_tables.contains(&op.table) {
            return Err(DbError::new("Injected row operation failure")
                .with_field("table", op.table)
                .with_field("kind", format!("{:?}", op.kind)));
        }

        let batch = op.rows.saturating_sub(state.rows_done).min(self.batch_size);
        state.rows_done += batch;
        *inner.rows.entry(cx.trx()).or_default() += batch;
        inner.log.push(StepRecord {
            thread: cx.thread(),
            trx: cx.trx(),
            kind: op.kind,
            table: op.table,
            rows_done: state.rows_done,
        });

        if state.rows_done >= op.rows {
            Ok(OpOutcome::Done)
        } else {
            Ok(OpOutcome::Again)
        }
    }

    fn parallelize(&self, thread: ThreadId, _op: Option<&RowOp>) {
        self.inner.lock().parallelized.push(thread);
    }
}
