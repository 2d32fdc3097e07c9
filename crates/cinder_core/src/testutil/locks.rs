use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::ops::{LockManager, LockMode, LockStatus, TableId, WaitId};
use crate::trx::TrxId;

/// Table locks granted in FIFO order.
///
/// Shared locks are compatible with each other, exclusive locks with nothing.
/// A transaction holding a shared lock may upgrade once it's the only holder.
#[derive(Debug, Default)]
pub struct TableLockManager {
    inner: Mutex<LockTable>,
}

#[derive(Debug, Default)]
struct LockTable {
    next_wait: u64,
    tables: HashMap<TableId, TableLocks>,
}

#[derive(Debug, Default)]
struct TableLocks {
    holders: Vec<(TrxId, LockMode)>,
    queue: VecDeque<LockRequest>,
}

#[derive(Debug)]
struct LockRequest {
    wait: WaitId,
    trx: TrxId,
    mode: LockMode,
}

impl TableLocks {
    fn held_by(&self, trx: TrxId) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(holder, _)| *holder == trx)
            .map(|(_, mode)| *mode)
    }

    fn can_grant(&self, trx: TrxId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|(holder, _)| *holder != trx)
            .all(|(_, held)| held.is_compatible(&mode))
    }

    fn grant(&mut self, trx: TrxId, mode: LockMode) {
        match self.holders.iter_mut().find(|(holder, _)| *holder == trx) {
            Some((_, held)) => {
                if mode == LockMode::Exclusive {
                    *held = LockMode::Exclusive;
                }
            }
            None => self.holders.push((trx, mode)),
        }
    }

    /// Grant queued requests from the front until one conflicts.
    fn grant_waiters(&mut self, granted: &mut Vec<TrxId>) {
        while let Some(req) = self.queue.front() {
            if !self.can_grant(req.trx, req.mode) {
                break;
            }
            let (trx, mode) = (req.trx, req.mode);
            self.queue.pop_front();
            self.grant(trx, mode);
            if !granted.contains(&trx) {
                granted.push(trx);
            }
        }
    }
}

impl TableLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode of the lock `trx` holds on `table`.
    pub fn held_mode(&self, trx: TrxId, table: TableId) -> Option<LockMode> {
        self.inner.lock().tables.get(&table)?.held_by(trx)
    }

    pub fn num_waiters(&self, table: TableId) -> usize {
        self.inner
            .lock()
            .tables
            .get(&table)
            .map(|t| t.queue.len())
            .unwrap_or(0)
    }
}

impl LockManager for TableLockManager {
    fn try_acquire(&self, trx: TrxId, table: TableId, mode: LockMode) -> LockStatus {
        let mut inner = self.inner.lock();
        let LockTable { next_wait, tables } = &mut *inner;
        let locks = tables.entry(table).or_default();

        match locks.held_by(trx) {
            Some(LockMode::Exclusive) => return LockStatus::Granted,
            Some(LockMode::Shared) if mode == LockMode::Shared => return LockStatus::Granted,
            _ => (),
        }
        if let Some(req) = locks.queue.iter().find(|r| r.trx == trx) {
            return LockStatus::WouldWait(req.wait);
        }

        if locks.queue.is_empty() && locks.can_grant(trx, mode) {
            locks.grant(trx, mode);
            return LockStatus::Granted;
        }

        *next_wait += 1;
        let wait = WaitId(*next_wait);
        locks.queue.push_back(LockRequest { wait, trx, mode });
        LockStatus::WouldWait(wait)
    }

    fn release_all(&self, trx: TrxId) -> Vec<TrxId> {
        let mut inner = self.inner.lock();
        let mut granted = Vec::new();
        for locks in inner.tables.values_mut() {
            let before = (locks.holders.len(), locks.queue.len());
            locks.holders.retain(|(holder, _)| *holder != trx);
            locks.queue.retain(|r| r.trx != trx);
            if before != (locks.holders.len(), locks.queue.len()) {
                locks.grant_waiters(&mut granted);
            }
        }
        granted
    }

    fn cancel_wait(&self, wait: WaitId) -> Option<Vec<TrxId>> {
        let mut inner = self.inner.lock();
        for locks in inner.tables.values_mut() {
            if let Some(idx) = locks.queue.iter().position(|r| r.wait == wait) {
                locks.queue.remove(idx);
                let mut granted = Vec::new();
                locks.grant_waiters(&mut granted);
                return Some(granted);
            }
        }
        None
    }
}
