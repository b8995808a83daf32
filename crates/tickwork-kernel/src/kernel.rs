//! Kernel facade.
//!
//! [`Kernel`] composes the process table, the lock and signal registries, the
//! timer and the watch registry into one explicitly constructed instance.  The
//! host builds it once, hands `&mut Kernel` to every subsystem that needs to
//! create tasks or primitives, and calls
//! [`run_one_pass`](Kernel::run_one_pass) exactly once per invocation.
//!
//! Operations that act on "the currently running task" (acquire, release,
//! wait, signal) live on [`Context`], which only exists while a step is
//! executing.

use tracing::{debug, info};

use crate::clock::TickSource;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::lock::{LockId, LockRegistry};
use crate::process::{ProcessTable, RunState, TaskId, TaskInfo, WakeInto};
use crate::program::{Blockable, Disposition, Program};
use crate::signal::{SignalId, SignalRegistry, SignalRequest, WaitRequest};
use crate::timer::{Timer, TimerControl, TimerEntry, TimerInfo};
use crate::watch::WatchRegistry;

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// The cooperative micro-kernel.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    clock: Box<dyn TickSource>,
    pub(crate) procs: ProcessTable,
    pub(crate) locks: LockRegistry,
    pub(crate) signals: SignalRegistry,
    pub(crate) timer: Timer,
    pub(crate) watches: WatchRegistry,
    /// The resident task that advances the timer at the start of each pass.
    pub(crate) timer_task: TaskId,
    /// Tick of the most recent pass.
    pub(crate) last_pass: Option<u64>,
    /// Number of timer entries fired since the last pass report.
    pub(crate) timers_fired: usize,
    /// Number of overdue timer entries dropped since the last pass report.
    pub(crate) timers_dropped: usize,
}

impl Kernel {
    /// Create a kernel with default configuration.
    pub fn new(clock: impl TickSource + 'static) -> Result<Self> {
        Self::with_config(KernelConfig::default(), clock)
    }

    /// Create a kernel and install its resident timer task.
    pub fn with_config(config: KernelConfig, clock: impl TickSource + 'static) -> Result<Self> {
        let mut procs = ProcessTable::new(config.max_tasks);

        let timer_program = Program::<()>::new().op(|cx: &mut Context<'_>, _: &mut ()| {
            cx.kernel().advance_timers();
            Disposition::StopKeepCursor
        });
        let description = config.timer_task_description.clone();
        let body = timer_program.load((), &description)?;
        let timer_task = procs.insert(description, Box::new(body), false)?;

        info!(max_tasks = config.max_tasks, timer_task = %timer_task, "kernel initialized");

        Ok(Self {
            config,
            clock: Box::new(clock),
            procs,
            locks: LockRegistry::new(),
            signals: SignalRegistry::new(),
            timer: Timer::new(),
            watches: WatchRegistry::new(),
            timer_task,
            last_pass: None,
            timers_fired: 0,
            timers_dropped: 0,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The host tick as reported by the clock.
    pub fn current_tick(&self) -> u64 {
        self.clock.current_tick()
    }

    // -- Tasks --------------------------------------------------------------

    /// Create a task without a task-local store.
    pub fn create_task(
        &mut self,
        program: Program<()>,
        description: impl Into<String>,
        sleep: bool,
    ) -> Result<TaskId> {
        self.create_task_with_store(program, (), description, sleep)
    }

    /// Create a task whose steps share `store`.
    ///
    /// Fails with [`KernelError::MalformedProgram`] when a jump targets an
    /// undefined label, before anything is queued.
    pub fn create_task_with_store<S: 'static>(
        &mut self,
        program: Program<S>,
        store: S,
        description: impl Into<String>,
        sleep: bool,
    ) -> Result<TaskId> {
        let description = description.into();
        let body = program.load(store, &description)?;
        let id = self.procs.insert(description.clone(), Box::new(body), sleep)?;
        debug!(task_id = %id, description = %description, sleep, "task created");
        Ok(id)
    }

    /// Destroy a task wherever it is queued.
    ///
    /// Locks and signals the task still holds or waits on are not released;
    /// that remains the caller's job.  Cancelling the running task ends its
    /// slice as soon as the current step returns.
    pub fn cancel_task(&mut self, id: TaskId) -> Result<()> {
        if id == self.timer_task {
            return Err(KernelError::ResidentTask { task_id: id });
        }
        let process = self.procs.destroy(id)?;
        info!(task_id = %id, description = %process.description, "task cancelled");
        Ok(())
    }

    /// Wake a sleeping or blocked task into the next pass.
    ///
    /// Waking a `Ready` task or one that no longer exists does nothing.
    pub fn wake_task(&mut self, id: TaskId) -> Result<()> {
        self.procs.wake(id, WakeInto::NextPass).map(|_| ())
    }

    /// Whether a task with this id currently exists.
    pub fn contains_task(&self, id: TaskId) -> bool {
        self.procs.contains(id)
    }

    /// Snapshot of one task.
    pub fn task_info(&self, id: TaskId) -> Result<TaskInfo> {
        self.procs.info(id)
    }

    /// Snapshot of every task, ordered by id.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.procs.infos()
    }

    /// Ids of the tasks in `state`.  Ready tasks are listed in queue order,
    /// the others by id.
    pub fn tasks_in(&self, state: RunState) -> Vec<TaskId> {
        self.procs.ids_in(state)
    }

    /// Number of live tasks, including the resident timer task.
    pub fn task_count(&self) -> usize {
        self.procs.len()
    }

    /// Id of the resident timer task.
    pub fn timer_task(&self) -> TaskId {
        self.timer_task
    }

    /// The task whose step is executing right now, if any.
    pub fn running_task(&self) -> Option<TaskId> {
        self.procs.current()
    }

    // -- Locks --------------------------------------------------------------

    pub fn create_lock(&mut self) -> LockId {
        self.locks.create()
    }

    /// Wake every waiter and remove the lock.  Waiters then find the handle
    /// gone and their `acquire` succeeds at once.
    pub fn destroy_lock(&mut self, id: LockId) -> Result<()> {
        self.locks.destroy(id, &mut self.procs)
    }

    pub fn lock_holder(&self, id: LockId) -> Result<Option<TaskId>> {
        self.locks.holder(id)
    }

    pub fn lock_waiters(&self, id: LockId) -> Result<Vec<TaskId>> {
        self.locks.waiters(id)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // -- Signals ------------------------------------------------------------

    pub fn create_signal(&mut self, initial_value: i64) -> SignalId {
        self.signals.create(initial_value)
    }

    /// Wake every waiter and remove the signal.
    pub fn destroy_signal(&mut self, id: SignalId) -> Result<()> {
        self.signals.destroy(id, &mut self.procs)
    }

    pub fn signal_value(&self, id: SignalId) -> Result<i64> {
        self.signals.value(id)
    }

    pub fn signal_waiters(&self, id: SignalId) -> Result<Vec<TaskId>> {
        self.signals.waiters(id)
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    // -- Timer --------------------------------------------------------------

    /// Run `callable(kernel, &args)` at `due_tick`, and every `period` ticks
    /// after that until it returns [`TimerControl::Stop`].
    ///
    /// `due_tick` must be strictly after the current tick.
    pub fn schedule<A, F>(
        &mut self,
        due_tick: u64,
        mut callable: F,
        args: A,
        description: impl Into<String>,
        period: Option<u64>,
    ) -> Result<()>
    where
        A: 'static,
        F: FnMut(&mut Kernel, &A) -> TimerControl + 'static,
    {
        let description = description.into();
        let current_tick = self.current_tick();
        if due_tick <= current_tick {
            return Err(KernelError::TimerNotInFuture {
                description,
                due_tick,
                current_tick,
            });
        }

        debug!(due_tick, ?period, description = %description, "timer entry scheduled");
        self.timer.insert(
            due_tick,
            TimerEntry {
                description,
                callback: Box::new(move |kernel: &mut Kernel| callable(kernel, &args)),
                period,
                last_cost: None,
            },
        );
        Ok(())
    }

    /// Pending timer entries, ordered by due tick.
    pub fn timers(&self) -> Vec<TimerInfo> {
        self.timer.infos()
    }

    pub fn next_timer_due(&self) -> Option<u64> {
        self.timer.next_due()
    }

    // -- Watches ------------------------------------------------------------

    /// Wake the `Sleeping` tasks in `wake_list` whenever `predicate` turns
    /// from false to true.  The first evaluation happens on the next pass.
    pub fn register_watch<P>(&mut self, predicate: P, wake_list: Vec<TaskId>)
    where
        P: FnMut(&Kernel) -> bool + 'static,
    {
        debug!(wake_list = ?wake_list, "watch registered");
        self.watches
            .register(Box::new(predicate), wake_list, self.last_pass);
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("tick", &self.current_tick())
            .field("last_pass", &self.last_pass)
            .field("tasks", &self.procs.len())
            .field("ready", &self.procs.ready_len())
            .field("locks", &self.locks.len())
            .field("signals", &self.signals.len())
            .field("timers", &self.timer.pending())
            .field("watches", &self.watches.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A running step's view of the kernel.
///
/// Handed to every step and jump predicate.  The blocking primitives use the
/// context's task as "the caller", so they cannot be invoked from outside the
/// scheduler loop.
pub struct Context<'k> {
    kernel: &'k mut Kernel,
    task_id: TaskId,
}

impl<'k> Context<'k> {
    pub(crate) fn new(kernel: &'k mut Kernel, task_id: TaskId) -> Self {
        Self { kernel, task_id }
    }

    /// The task executing this step.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The host tick of the pass in progress.
    pub fn tick(&self) -> u64 {
        self.kernel.current_tick()
    }

    /// Full kernel access, e.g. to create tasks, primitives, timers or
    /// watches from inside a step.
    pub fn kernel(&mut self) -> &mut Kernel {
        &mut *self.kernel
    }

    /// Take `lock`, or register as a waiter and block if another task holds
    /// it.  A destroyed lock is granted immediately.
    pub fn acquire(&mut self, lock: LockId) -> Result<Blockable> {
        self.kernel.locks.acquire(lock, self.task_id)
    }

    /// Release `lock` and wake every waiter.  Only the holder may release.
    pub fn release(&mut self, lock: LockId) -> Result<Blockable> {
        let kernel = &mut *self.kernel;
        kernel.locks.release(lock, self.task_id, &mut kernel.procs)
    }

    /// All-or-nothing wait on a set of signals.
    ///
    /// Nothing is consumed unless every bound is met.  A signal named more
    /// than once must cover the bounds of each request after the amounts of
    /// the earlier ones.  An `amount` larger than its `lower_bound` can still
    /// take a value below zero.
    pub fn wait(&mut self, requests: &[WaitRequest]) -> Result<Blockable> {
        self.kernel.signals.wait(requests, self.task_id)
    }

    /// Add to a set of signals, waking waiters whose bound is now met.
    pub fn signal(&mut self, requests: &[SignalRequest]) -> Result<Blockable> {
        let kernel = &mut *self.kernel;
        kernel.signals.signal(requests, &mut kernel.procs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn kernel_starts_with_resident_timer_task() {
        let kernel = Kernel::new(ManualClock::new(0)).expect("kernel");
        assert_eq!(kernel.task_count(), 1);
        let info = kernel.task_info(kernel.timer_task()).expect("timer task");
        assert_eq!(info.description, "timer");
        assert!(kernel.running_task().is_none());
    }

    #[test]
    fn zero_capacity_kernel_cannot_boot() {
        let result = Kernel::with_config(KernelConfig::new().with_max_tasks(0), ManualClock::new(0));
        assert!(matches!(
            result,
            Err(KernelError::TaskIdsExhausted { capacity: 0 })
        ));
    }

    #[test]
    fn resident_timer_task_cannot_be_cancelled() {
        let mut kernel = Kernel::new(ManualClock::new(0)).expect("kernel");
        let timer = kernel.timer_task();
        assert!(matches!(
            kernel.cancel_task(timer),
            Err(KernelError::ResidentTask { .. })
        ));
        assert!(kernel.contains_task(timer));
    }

    #[test]
    fn schedule_rejects_present_and_past_ticks() {
        let clock = ManualClock::new(10);
        let mut kernel = Kernel::new(clock.clone()).expect("kernel");

        for due in [9, 10] {
            let err = kernel
                .schedule(due, |_, _: &()| TimerControl::Stop, (), "late", None)
                .unwrap_err();
            assert!(matches!(
                err,
                KernelError::TimerNotInFuture { current_tick: 10, .. }
            ));
        }
        kernel
            .schedule(11, |_, _: &()| TimerControl::Stop, (), "ok", None)
            .expect("future tick is accepted");
        assert_eq!(kernel.next_timer_due(), Some(11));
    }

    #[test]
    fn cancel_unknown_task_fails() {
        let mut kernel = Kernel::new(ManualClock::new(0)).expect("kernel");
        let id = kernel
            .create_task(Program::<()>::new().op(|_, _| Disposition::Continue), "t", false)
            .unwrap();
        kernel.cancel_task(id).unwrap();
        assert!(!kernel.contains_task(id));
        assert!(matches!(
            kernel.cancel_task(id),
            Err(KernelError::TaskNotFound { .. })
        ));
    }
}
