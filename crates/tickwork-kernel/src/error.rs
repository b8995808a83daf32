//! Kernel error types.
//!
//! Every variant of [`KernelError`] is a programming invariant violation: a
//! defect in how a task program was built or how the host drives the kernel.
//! They abort the surrounding pass instead of being retried.  Task-local
//! recoverable failures are not errors at all; they travel as
//! [`Disposition::Error`](crate::program::Disposition::Error) values.

use crate::lock::LockId;
use crate::process::{RunState, TaskId};
use crate::signal::SignalId;

/// Unified error type for the tickwork kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Program errors -----------------------------------------------------
    /// A program failed validation at task-creation time.
    #[error("malformed program `{description}`: {reason}")]
    MalformedProgram { description: String, reason: String },

    /// A step asked to resume at a label its program does not define.
    #[error("task {task_id} has no label `{label}`")]
    UnknownLabel { task_id: TaskId, label: String },

    // -- Process table errors -----------------------------------------------
    /// Every id in the task-id pool is in use.
    #[error("task id pool exhausted ({capacity} ids)")]
    TaskIdsExhausted { capacity: u32 },

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// A task tried to wake the task that is currently executing.
    #[error("cannot wake task {task_id}: it is running")]
    WakeRunningTask { task_id: TaskId },

    /// Blocking is only legal from `Ready` or `Running`.
    #[error("cannot block task {task_id} in state {state:?}")]
    InvalidBlock { task_id: TaskId, state: RunState },

    /// The resident timer task lives as long as the kernel.
    #[error("task {task_id} is resident and cannot be cancelled")]
    ResidentTask { task_id: TaskId },

    // -- Scheduler errors ---------------------------------------------------
    /// `run_one_pass` was called twice for the same host tick.
    #[error("scheduler pass already ran at tick {tick}")]
    PassAlreadyRun { tick: u64 },

    /// `run_one_pass` was called from inside a running step.
    #[error("scheduler pass re-entered from task {task_id}")]
    PassReentered { task_id: TaskId },

    /// The host clock reported a tick older than the previous pass.
    #[error("host tick went backwards: {tick} < {previous}")]
    TickWentBackwards { tick: u64, previous: u64 },

    // -- Lock errors --------------------------------------------------------
    /// The lock handle does not exist (only raised by `destroy_lock`).
    #[error("lock not found: {lock_id}")]
    LockNotFound { lock_id: LockId },

    /// A task released a lock it does not hold.
    #[error("task {task_id} released lock {lock_id} held by {holder:?}")]
    NotLockHolder {
        lock_id: LockId,
        task_id: TaskId,
        holder: Option<TaskId>,
    },

    // -- Signal errors ------------------------------------------------------
    /// The signal handle does not exist (raised by `destroy_signal` and
    /// `signal_value`, never by the atomic operations).
    #[error("signal not found: {signal_id}")]
    SignalNotFound { signal_id: SignalId },

    // -- Shared waiter errors -----------------------------------------------
    /// A task tried to join a waiter set it already belongs to.
    #[error("task {task_id} is already waiting on {resource}")]
    DuplicateWaiter { task_id: TaskId, resource: String },

    // -- Timer errors -------------------------------------------------------
    /// Timer entries must be due strictly after the current tick.
    #[error("timer `{description}` due at {due_tick} is not after current tick {current_tick}")]
    TimerNotInFuture {
        description: String,
        due_tick: u64,
        current_tick: u64,
    },
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
