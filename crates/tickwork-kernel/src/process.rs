//! Process table.
//!
//! Owns every task, the bounded task-id pool and the four run-state
//! collections.  The scheduler and the synchronization primitives only move
//! tasks between these collections through [`ProcessTable`] methods, so the
//! invariant "a task sits in exactly the collection matching its state"
//! is kept in one place.
//!
//! # Task lifecycle
//!
//! ```text
//!             create            create(sleep)
//!               |                    |
//!               v       wake         v
//!   +------> Ready <------------- Sleeping
//!   |         |  ^  \                ^
//!   | yield   |  |   \ block         | Sleep
//!   |         v  |    v              |
//!   +------ Running --+-----------> (end of program: destroyed)
//!              |      |
//!        Block |      | wake
//!              v      |
//!            Blocked -+
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::program::TaskBody;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Small integer task handle drawn from a bounded pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(u32);

impl TaskId {
    /// The raw pool index.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Queued to run in a pass.
    Ready,
    /// Currently executing.  At most one task is ever in this state.
    Running,
    /// Waiting on a lock or signal.
    Blocked,
    /// Waiting for an explicit wake or a watch.
    Sleeping,
}

/// Snapshot of a task visible to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub description: String,
    pub state: RunState,
    /// Index of the next step to execute.
    pub cursor: usize,
    pub program_len: usize,
    pub created_at: DateTime<Utc>,
    /// Wall-clock duration of the most recent slice, when profiled.
    pub last_slice: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

pub(crate) struct Process {
    pub(crate) description: String,
    /// `None` only while the task's slice is executing.
    pub(crate) body: Option<Box<dyn TaskBody>>,
    pub(crate) program_len: usize,
    pub(crate) cursor: usize,
    pub(crate) state: RunState,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_slice: Option<Duration>,
}

impl Process {
    fn info(&self, id: TaskId) -> TaskInfo {
        TaskInfo {
            id,
            description: self.description.clone(),
            state: self.state,
            cursor: self.cursor,
            program_len: self.program_len,
            created_at: self.created_at,
            last_slice: self.last_slice,
        }
    }
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

/// Where a woken task is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeInto {
    /// The queue that will be drained by the next pass.
    NextPass,
    /// The tail of the queue the current pass is draining.
    CurrentPass,
}

pub(crate) struct ProcessTable {
    tasks: HashMap<TaskId, Process>,
    /// Tasks for the next pass; during a pass, yields and wakes land here.
    ready: VecDeque<TaskId>,
    /// The queue the current pass is draining.
    draining: VecDeque<TaskId>,
    blocked: BTreeSet<TaskId>,
    sleeping: BTreeSet<TaskId>,
    free_ids: VecDeque<u32>,
    capacity: u32,
    current: Option<TaskId>,
    /// Set when the running task is cancelled from inside its own slice.
    current_cancelled: bool,
}

impl ProcessTable {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            draining: VecDeque::new(),
            blocked: BTreeSet::new(),
            sleeping: BTreeSet::new(),
            free_ids: (0..capacity).collect(),
            capacity,
            current: None,
            current_cancelled: false,
        }
    }

    /// Register a new task in the `Ready` (or `Sleeping`) collection.
    pub(crate) fn insert(
        &mut self,
        description: String,
        body: Box<dyn TaskBody>,
        sleep: bool,
    ) -> Result<TaskId> {
        let id = self
            .free_ids
            .pop_front()
            .map(TaskId)
            .ok_or(KernelError::TaskIdsExhausted {
                capacity: self.capacity,
            })?;

        let state = if sleep {
            self.sleeping.insert(id);
            RunState::Sleeping
        } else {
            self.ready.push_back(id);
            RunState::Ready
        };

        self.tasks.insert(
            id,
            Process {
                description,
                program_len: body.len(),
                body: Some(body),
                cursor: 0,
                state,
                created_at: Utc::now(),
                last_slice: None,
            },
        );

        Ok(id)
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&Process> {
        self.tasks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Process> {
        self.tasks.get_mut(&id)
    }

    pub(crate) fn state(&self, id: TaskId) -> Option<RunState> {
        self.tasks.get(&id).map(|p| p.state)
    }

    pub(crate) fn info(&self, id: TaskId) -> Result<TaskInfo> {
        self.tasks
            .get(&id)
            .map(|p| p.info(id))
            .ok_or(KernelError::TaskNotFound { task_id: id })
    }

    /// Snapshot of every task, ordered by id.
    pub(crate) fn infos(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self.tasks.iter().map(|(id, p)| p.info(*id)).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub(crate) fn current_cancelled(&self) -> bool {
        self.current_cancelled
    }

    // -- State transitions --------------------------------------------------

    /// Move a task to `Ready`.
    ///
    /// Waking an already `Ready` task is a no-op and waking a task that no
    /// longer exists is tolerated, since several wake sources may race for
    /// the same task.  Returns whether the task changed state.
    pub(crate) fn wake(&mut self, id: TaskId, into: WakeInto) -> Result<bool> {
        let Some(process) = self.tasks.get_mut(&id) else {
            tracing::trace!(task_id = %id, "wake ignored for destroyed task");
            return Ok(false);
        };

        match process.state {
            RunState::Ready => return Ok(false),
            RunState::Running => return Err(KernelError::WakeRunningTask { task_id: id }),
            RunState::Blocked => {
                self.blocked.remove(&id);
            }
            RunState::Sleeping => {
                self.sleeping.remove(&id);
            }
        }

        process.state = RunState::Ready;
        match into {
            WakeInto::NextPass => self.ready.push_back(id),
            WakeInto::CurrentPass => self.draining.push_back(id),
        }
        tracing::debug!(task_id = %id, description = %process.description, "task woken");
        Ok(true)
    }

    /// Move a `Ready` or `Running` task to `Blocked`.
    pub(crate) fn block(&mut self, id: TaskId) -> Result<()> {
        let process = self
            .tasks
            .get_mut(&id)
            .ok_or(KernelError::TaskNotFound { task_id: id })?;

        match process.state {
            RunState::Ready => {
                self.ready.retain(|t| *t != id);
                self.draining.retain(|t| *t != id);
            }
            RunState::Running => {
                self.current = None;
            }
            state @ (RunState::Blocked | RunState::Sleeping) => {
                return Err(KernelError::InvalidBlock { task_id: id, state });
            }
        }

        process.state = RunState::Blocked;
        self.blocked.insert(id);
        Ok(())
    }

    /// Remove a task from whatever collection holds it and return its id to
    /// the pool.
    pub(crate) fn destroy(&mut self, id: TaskId) -> Result<Process> {
        let process = self
            .tasks
            .remove(&id)
            .ok_or(KernelError::TaskNotFound { task_id: id })?;

        match process.state {
            RunState::Ready => {
                self.ready.retain(|t| *t != id);
                self.draining.retain(|t| *t != id);
            }
            RunState::Running => {
                self.current = None;
                self.current_cancelled = true;
            }
            RunState::Blocked => {
                self.blocked.remove(&id);
            }
            RunState::Sleeping => {
                self.sleeping.remove(&id);
            }
        }

        self.free_ids.push_back(id.0);
        Ok(process)
    }

    // -- Pass bookkeeping ---------------------------------------------------

    /// Swap the ready queue for a fresh one; the old queue becomes the one
    /// this pass drains.
    pub(crate) fn begin_pass(&mut self) -> usize {
        self.draining = std::mem::take(&mut self.ready);
        self.draining.len()
    }

    /// Pop the next task to run in this pass.
    pub(crate) fn next_draining(&mut self) -> Option<TaskId> {
        self.draining.pop_front()
    }

    /// Remove `id` from the draining queue so it can run out of turn.
    pub(crate) fn take_from_draining(&mut self, id: TaskId) -> bool {
        match self.draining.iter().position(|t| *t == id) {
            Some(index) => self.draining.remove(index).is_some(),
            None => false,
        }
    }

    /// Put back everything a faulted pass did not get to, ahead of the tasks
    /// that were rescheduled during it.
    pub(crate) fn abort_pass(&mut self) {
        let mut remaining = std::mem::take(&mut self.draining);
        remaining.append(&mut self.ready);
        self.ready = remaining;
        self.current = None;
        self.current_cancelled = false;
    }

    /// Mark a `Ready` task as the running one and take its body out so the
    /// step functions can borrow the kernel mutably.
    pub(crate) fn start_slice(&mut self, id: TaskId) -> Option<Box<dyn TaskBody>> {
        let process = self.tasks.get_mut(&id)?;
        debug_assert_eq!(process.state, RunState::Ready);
        debug_assert!(self.current.is_none(), "two tasks running at once");
        process.state = RunState::Running;
        self.current = Some(id);
        self.current_cancelled = false;
        process.body.take()
    }

    /// Give a task its body back after its slice, if it still exists.
    pub(crate) fn finish_slice(
        &mut self,
        id: TaskId,
        body: Box<dyn TaskBody>,
        elapsed: Option<Duration>,
    ) {
        if let Some(process) = self.tasks.get_mut(&id) {
            process.body = Some(body);
            if elapsed.is_some() {
                process.last_slice = elapsed;
            }
        }
        self.current = None;
        self.current_cancelled = false;
    }

    /// `Running` -> `Ready`, queued for the next pass.
    pub(crate) fn reschedule(&mut self, id: TaskId, front: bool) {
        if let Some(process) = self.tasks.get_mut(&id) {
            process.state = RunState::Ready;
            if front {
                self.ready.push_front(id);
            } else {
                self.ready.push_back(id);
            }
        }
    }

    /// `Running` -> `Sleeping`.
    pub(crate) fn sleep(&mut self, id: TaskId) {
        if let Some(process) = self.tasks.get_mut(&id) {
            process.state = RunState::Sleeping;
            self.sleeping.insert(id);
        }
    }

    /// Tasks currently in a state.  Ready tasks come in queue order.
    pub(crate) fn ids_in(&self, state: RunState) -> Vec<TaskId> {
        match state {
            RunState::Ready => self.draining.iter().chain(self.ready.iter()).copied().collect(),
            RunState::Running => self.current.into_iter().collect(),
            RunState::Blocked => self.blocked.iter().copied().collect(),
            RunState::Sleeping => self.sleeping.iter().copied().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
