//! Mutual-exclusion locks.
//!
//! A lock has at most one holder and an ordered list of waiters.  Releasing a
//! lock wakes **every** waiter at once; they race for it on their next slice
//! and the losers block again.  There is no FIFO handoff.
//!
//! A handle whose lock has been destroyed behaves as a lock that is always
//! free: `acquire` and `release` on it succeed immediately.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::process::{ProcessTable, TaskId, WakeInto};
use crate::program::Blockable;

/// Opaque lock handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(Uuid);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock-{}", self.0.simple())
    }
}

#[derive(Debug, Default)]
struct Lock {
    holder: Option<TaskId>,
    waiters: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    locks: HashMap<LockId, Lock>,
}

impl LockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&mut self) -> LockId {
        let id = LockId(Uuid::now_v7());
        self.locks.insert(id, Lock::default());
        tracing::debug!(lock_id = %id, "lock created");
        id
    }

    /// Wake every waiter, then drop the lock.
    pub(crate) fn destroy(&mut self, id: LockId, procs: &mut ProcessTable) -> Result<()> {
        let lock = self
            .locks
            .remove(&id)
            .ok_or(KernelError::LockNotFound { lock_id: id })?;

        for waiter in lock.waiters {
            procs.wake(waiter, WakeInto::NextPass)?;
        }
        tracing::debug!(lock_id = %id, "lock destroyed");
        Ok(())
    }

    pub(crate) fn acquire(&mut self, id: LockId, task: TaskId) -> Result<Blockable> {
        let Some(lock) = self.locks.get_mut(&id) else {
            return Ok(Blockable::Continue);
        };

        match lock.holder {
            None => {
                lock.holder = Some(task);
                tracing::trace!(lock_id = %id, task_id = %task, "lock acquired");
                Ok(Blockable::Continue)
            }
            // A task restarted by an `Error` disposition may acquire again
            // before reaching its release.
            Some(holder) if holder == task => Ok(Blockable::Continue),
            Some(_) => {
                if lock.waiters.contains(&task) {
                    return Err(KernelError::DuplicateWaiter {
                        task_id: task,
                        resource: id.to_string(),
                    });
                }
                lock.waiters.push(task);
                tracing::trace!(lock_id = %id, task_id = %task, "lock contended");
                Ok(Blockable::Block)
            }
        }
    }

    pub(crate) fn release(
        &mut self,
        id: LockId,
        task: TaskId,
        procs: &mut ProcessTable,
    ) -> Result<Blockable> {
        let Some(lock) = self.locks.get_mut(&id) else {
            return Ok(Blockable::Continue);
        };

        if lock.holder != Some(task) {
            return Err(KernelError::NotLockHolder {
                lock_id: id,
                task_id: task,
                holder: lock.holder,
            });
        }

        lock.holder = None;
        for waiter in std::mem::take(&mut lock.waiters) {
            procs.wake(waiter, WakeInto::NextPass)?;
        }
        tracing::trace!(lock_id = %id, task_id = %task, "lock released");
        Ok(Blockable::Continue)
    }

    pub(crate) fn holder(&self, id: LockId) -> Result<Option<TaskId>> {
        self.locks
            .get(&id)
            .map(|lock| lock.holder)
            .ok_or(KernelError::LockNotFound { lock_id: id })
    }

    pub(crate) fn waiters(&self, id: LockId) -> Result<Vec<TaskId>> {
        self.locks
            .get(&id)
            .map(|lock| lock.waiters.clone())
            .ok_or(KernelError::LockNotFound { lock_id: id })
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
