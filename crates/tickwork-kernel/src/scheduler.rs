//! Round-robin scheduler pass.
//!
//! One call to [`Kernel::run_one_pass`] per host invocation:
//!
//! 1. Swap the ready queue for an empty one.  The old queue is drained by
//!    this pass; yields, wakes and newly created tasks go to the new queue and
//!    run on the next pass.
//! 2. Run the resident timer task, which fires every timer entry due at the
//!    current tick.
//! 3. Evaluate every watch.  Sleeping tasks woken by a rising edge join the
//!    tail of the queue being drained, so they still run this pass.
//! 4. Drain the rest of the queue.  Each task runs steps until one of them
//!    returns a disposition that ends the slice.
//!
//! # Step dispositions
//!
//! | Disposition         | New state                  | Cursor              |
//! |---------------------|----------------------------|---------------------|
//! | `Continue`          | keeps running              | +1                  |
//! | `StopKeepCursor`    | Ready                      | unchanged           |
//! | `StopAdvanceCursor` | Ready, or destroyed at end | +1                  |
//! | `StopToLabel(l)`    | Ready                      | index of `l`        |
//! | `Sleep`             | Sleeping                   | 0                   |
//! | `Block`             | Blocked                    | unchanged           |
//! | `Error(msg)`        | Ready (logged)             | 0                   |
//!
//! A conditional jump never ends a slice.  Running past the last step
//! destroys the task.
//!
//! A step that returns `Err` aborts the pass: the task is put back on the
//! ready queue at the same cursor, tasks that had not run yet keep their
//! place, and the error is returned to the host.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::error::{KernelError, Result};
use crate::kernel::{Context, Kernel};
use crate::process::{RunState, TaskId, WakeInto};
use crate::program::{Disposition, Executed, TaskBody};
use crate::timer::TimerControl;
use crate::watch::WatchEntry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A task that returned [`Disposition::Error`] during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFault {
    pub task_id: TaskId,
    pub description: String,
    pub message: String,
}

/// Summary of one scheduler pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassReport {
    pub tick: u64,
    /// Number of task slices executed, the timer task included.
    pub slices: usize,
    /// Tasks that ran past the end of their program.
    pub destroyed: Vec<TaskId>,
    /// Tasks that restarted after an `Error` disposition.
    pub faults: Vec<TaskFault>,
    /// Watches that saw a rising edge.
    pub watches_fired: usize,
    /// Timer entries that ran.
    pub timers_fired: usize,
    /// Timer entries dropped because the host skipped their tick.
    pub timers_dropped: usize,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Slice outcomes
// ---------------------------------------------------------------------------

enum SliceEnd {
    /// The cursor ran past the last step.
    Finished,
    /// The task was cancelled by one of its own steps.
    Cancelled,
    Yield,
    Sleep,
    Block,
    Fault(String),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

impl Kernel {
    /// Run one scheduling pass for the current host tick.
    ///
    /// Must be called at most once per tick and never from inside a step.
    pub fn run_one_pass(&mut self) -> Result<PassReport> {
        if let Some(task_id) = self.procs.current() {
            return Err(KernelError::PassReentered { task_id });
        }

        let tick = self.current_tick();
        match self.last_pass {
            Some(previous) if tick == previous => {
                return Err(KernelError::PassAlreadyRun { tick });
            }
            Some(previous) if tick < previous => {
                return Err(KernelError::TickWentBackwards { tick, previous });
            }
            _ => {}
        }
        self.last_pass = Some(tick);

        let started = Instant::now();
        let mut report = PassReport {
            tick,
            ..PassReport::default()
        };

        let queued = self.procs.begin_pass();
        info!(tick, queued, watches = self.watches.len(), "scheduler pass started");

        if self.procs.take_from_draining(self.timer_task) {
            let timer_task = self.timer_task;
            self.run_slice(timer_task, &mut report)
                .inspect_err(|_| self.procs.abort_pass())?;
        }

        report.watches_fired = self
            .evaluate_watches(tick)
            .inspect_err(|_| self.procs.abort_pass())?;

        while let Some(id) = self.procs.next_draining() {
            self.run_slice(id, &mut report)
                .inspect_err(|_| self.procs.abort_pass())?;
        }

        report.timers_fired = std::mem::take(&mut self.timers_fired);
        report.timers_dropped = std::mem::take(&mut self.timers_dropped);
        report.elapsed = started.elapsed();
        info!(
            tick,
            slices = report.slices,
            destroyed = report.destroyed.len(),
            faults = report.faults.len(),
            ready = self.procs.ready_len(),
            "scheduler pass finished"
        );
        Ok(report)
    }

    /// Run one task until a step ends its slice.
    fn run_slice(&mut self, id: TaskId, report: &mut PassReport) -> Result<()> {
        let Some(mut body) = self.procs.start_slice(id) else {
            return Ok(());
        };
        report.slices += 1;

        let started = self.config.profile_slices.then(Instant::now);
        let outcome = self.execute(id, &mut *body);
        let elapsed = started.map(|s| s.elapsed());

        let description = self
            .procs
            .get(id)
            .map(|p| p.description.clone())
            .unwrap_or_default();
        if let Some(elapsed) = elapsed {
            trace!(
                task_id = %id,
                description = %description,
                elapsed_us = elapsed.as_micros() as u64,
                "task slice finished"
            );
        }

        let end = match outcome {
            Ok(end) => end,
            Err(err) => {
                self.procs.finish_slice(id, body, elapsed);
                self.procs.reschedule(id, false);
                error!(task_id = %id, description = %description, error = %err, "pass aborted");
                return Err(err);
            }
        };

        match end {
            SliceEnd::Cancelled => {
                self.procs.finish_slice(id, body, elapsed);
                debug!(task_id = %id, "slice ended by cancellation");
            }
            SliceEnd::Finished => {
                self.procs.destroy(id)?;
                self.procs.finish_slice(id, body, elapsed);
                report.destroyed.push(id);
                debug!(task_id = %id, description = %description, "task finished");
            }
            SliceEnd::Yield => {
                self.procs.finish_slice(id, body, elapsed);
                self.procs.reschedule(id, id == self.timer_task);
            }
            SliceEnd::Sleep => {
                self.procs.finish_slice(id, body, elapsed);
                self.procs.sleep(id);
            }
            SliceEnd::Block => {
                self.procs.finish_slice(id, body, elapsed);
                self.procs.block(id)?;
            }
            SliceEnd::Fault(message) => {
                self.procs.finish_slice(id, body, elapsed);
                self.procs.reschedule(id, false);
                error!(task_id = %id, description = %description, error = %message, "task failed, restarting");
                report.faults.push(TaskFault {
                    task_id: id,
                    description,
                    message,
                });
            }
        }
        Ok(())
    }

    /// Execute steps from the task's cursor until the slice ends.
    fn execute(&mut self, id: TaskId, body: &mut dyn TaskBody) -> Result<SliceEnd> {
        loop {
            let cursor = self.cursor(id);
            if cursor >= body.len() {
                return Ok(SliceEnd::Finished);
            }

            let executed = body.execute(cursor, &mut Context::new(self, id));
            if self.procs.current_cancelled() {
                return Ok(SliceEnd::Cancelled);
            }

            let disposition = match executed {
                Executed::Jump(Some(target)) => {
                    self.set_cursor(id, target);
                    continue;
                }
                Executed::Jump(None) => {
                    self.set_cursor(id, cursor + 1);
                    continue;
                }
                Executed::Atomic(result) => result?,
            };

            match disposition {
                Disposition::Continue => self.set_cursor(id, cursor + 1),
                Disposition::StopKeepCursor => return Ok(SliceEnd::Yield),
                Disposition::StopAdvanceCursor => {
                    self.set_cursor(id, cursor + 1);
                    if cursor + 1 >= body.len() {
                        return Ok(SliceEnd::Finished);
                    }
                    return Ok(SliceEnd::Yield);
                }
                Disposition::StopToLabel(label) => {
                    let target = body
                        .label_index(&label)
                        .ok_or(KernelError::UnknownLabel { task_id: id, label })?;
                    self.set_cursor(id, target);
                    return Ok(SliceEnd::Yield);
                }
                Disposition::Sleep => {
                    self.set_cursor(id, 0);
                    return Ok(SliceEnd::Sleep);
                }
                Disposition::Block => return Ok(SliceEnd::Block),
                Disposition::Error(message) => {
                    self.set_cursor(id, 0);
                    return Ok(SliceEnd::Fault(message));
                }
            }
        }
    }

    fn cursor(&self, id: TaskId) -> usize {
        self.procs.get(id).map_or(0, |p| p.cursor)
    }

    fn set_cursor(&mut self, id: TaskId, cursor: usize) {
        if let Some(process) = self.procs.get_mut(id) {
            process.cursor = cursor;
        }
    }

    /// Fire every timer entry due at the current tick.  Called by the
    /// resident timer task.
    ///
    /// Entries due at ticks the host skipped are dropped, periodic ones
    /// included.
    pub(crate) fn advance_timers(&mut self) -> usize {
        let tick = self.current_tick();
        for (due_tick, entry) in self.timer.take_overdue(tick) {
            warn!(
                tick,
                due_tick,
                description = %entry.description,
                period = ?entry.period,
                "dropping timer entry for skipped tick"
            );
            self.timers_dropped += 1;
        }

        let due = self.timer.take_due(tick);
        if due.is_empty() {
            return 0;
        }

        info!(tick, entries = due.len(), "running timer entries");
        let fired = due.len();
        for mut entry in due {
            let started = Instant::now();
            let control = (entry.callback)(self);
            let cost = started.elapsed();
            entry.last_cost = Some(cost);
            trace!(
                description = %entry.description,
                cost_us = cost.as_micros() as u64,
                ?control,
                "timer entry finished"
            );

            if control == TimerControl::Stop {
                continue;
            }
            if let Some(next) = entry.rearm_at(tick) {
                self.timer.insert(next, entry);
            }
        }

        self.timers_fired += fired;
        fired
    }

    /// Evaluate every watch once and wake sleeping tasks on rising edges.
    fn evaluate_watches(&mut self, tick: u64) -> Result<usize> {
        let mut entries = std::mem::take(&mut self.watches.entries);
        let outcome = self.fire_watches(&mut entries, tick);
        // Predicates only see `&Kernel`, so nothing was registered meanwhile.
        self.watches.entries = entries;
        outcome
    }

    fn fire_watches(&mut self, entries: &mut [WatchEntry], tick: u64) -> Result<usize> {
        let mut fired = 0;
        for entry in entries {
            if entry.last_tick == Some(tick) {
                continue;
            }
            let value = (entry.predicate)(&*self);
            let previous = entry.last_value;
            if !entry.observe(tick, value) {
                trace!(previous, value, "watch unchanged");
                continue;
            }

            fired += 1;
            entry.wake_list.retain(|id| self.procs.contains(*id));
            debug!(wake_list = ?entry.wake_list, "watch fired");
            for id in &entry.wake_list {
                if self.procs.state(*id) == Some(RunState::Sleeping) {
                    self.procs.wake(*id, WakeInto::CurrentPass)?;
                }
            }
        }
        Ok(fired)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::program::{Program, StepResult};

    fn kernel() -> (Kernel, ManualClock) {
        let clock = ManualClock::new(1);
        let kernel = Kernel::new(clock.clone()).expect("kernel");
        (kernel, clock)
    }

    fn log() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn continue_runs_the_whole_program_in_one_slice() {
        let (mut kernel, _clock) = kernel();
        let seen = log();
        let (a, b) = (seen.clone(), seen.clone());
        let id = kernel
            .create_task(
                Program::new()
                    .op(move |_, _| {
                        a.borrow_mut().push("first");
                        Disposition::Continue
                    })
                    .op(move |_, _| {
                        b.borrow_mut().push("second");
                        Disposition::Continue
                    }),
                "straight",
                false,
            )
            .unwrap();

        let report = kernel.run_one_pass().unwrap();
        assert_eq!(*seen.borrow(), ["first", "second"]);
        assert_eq!(report.destroyed, vec![id]);
        assert_eq!(report.slices, 2, "timer task plus one task");
        assert!(!kernel.contains_task(id));
    }

    #[test]
    fn stop_advance_cursor_resumes_at_next_step() {
        let (mut kernel, clock) = kernel();
        let id = kernel
            .create_task(
                Program::new()
                    .op(|_, _| Disposition::StopAdvanceCursor)
                    .op(|_, _| Disposition::StopAdvanceCursor),
                "two-passes",
                false,
            )
            .unwrap();

        kernel.run_one_pass().unwrap();
        assert_eq!(kernel.task_info(id).unwrap().cursor, 1);
        assert_eq!(kernel.task_info(id).unwrap().state, RunState::Ready);

        clock.advance();
        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.destroyed, vec![id]);
    }

    #[test]
    fn conditional_jump_does_not_end_the_slice() {
        let (mut kernel, _clock) = kernel();
        let id = kernel
            .create_task_with_store(
                Program::<u32>::new()
                    .tagged("loop", |_, n| {
                        *n += 1;
                        Disposition::Continue
                    })
                    .jump_if("loop", |_, n| *n < 5)
                    .op(|_, n| {
                        assert_eq!(*n, 5);
                        Disposition::Continue
                    }),
                0,
                "looper",
                false,
            )
            .unwrap();

        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.destroyed, vec![id]);
    }

    #[test]
    fn unknown_resume_label_aborts_the_pass() {
        let (mut kernel, _clock) = kernel();
        let id = kernel
            .create_task(
                Program::new().op(|_, _| Disposition::StopToLabel("nowhere".into())),
                "lost",
                false,
            )
            .unwrap();

        let err = kernel.run_one_pass().unwrap_err();
        assert!(matches!(err, KernelError::UnknownLabel { task_id, .. } if task_id == id));
        assert_eq!(kernel.task_info(id).unwrap().state, RunState::Ready);
        assert!(kernel.running_task().is_none());
    }

    #[test]
    fn yielded_and_created_tasks_wait_for_next_pass() {
        let (mut kernel, clock) = kernel();
        let runs = Rc::new(RefCell::new(0u32));
        let counter = runs.clone();
        kernel
            .create_task(
                Program::new().op(move |cx: &mut Context<'_>, _: &mut ()| -> StepResult {
                    *counter.borrow_mut() += 1;
                    cx.kernel()
                        .create_task(Program::new().op(|_, _| Disposition::StopKeepCursor), "child", false)?;
                    Ok(Disposition::StopKeepCursor)
                }),
                "spawner",
                false,
            )
            .unwrap();

        let report = kernel.run_one_pass().unwrap();
        assert_eq!(*runs.borrow(), 1);
        assert_eq!(report.slices, 2);
        assert_eq!(kernel.task_count(), 3);

        clock.advance();
        let report = kernel.run_one_pass().unwrap();
        assert_eq!(*runs.borrow(), 2);
        assert_eq!(report.slices, 3);
    }

    #[test]
    fn timer_task_stays_at_the_head_of_the_queue() {
        let (mut kernel, clock) = kernel();
        let task = kernel
            .create_task(Program::new().op(|_, _| Disposition::StopKeepCursor), "worker", false)
            .unwrap();

        for _ in 0..3 {
            kernel.run_one_pass().unwrap();
            clock.advance();
            assert_eq!(kernel.tasks_in(RunState::Ready), vec![kernel.timer_task(), task]);
        }
    }

    #[test]
    fn watch_wakes_sleeper_into_the_current_pass() {
        let (mut kernel, clock) = kernel();
        let flag = Rc::new(RefCell::new(false));
        let ran = Rc::new(RefCell::new(Vec::new()));

        let ran_in = ran.clone();
        let sleeper = kernel
            .create_task(
                Program::new().op(move |cx: &mut Context<'_>, _: &mut ()| {
                    ran_in.borrow_mut().push(cx.tick());
                    Disposition::Sleep
                }),
                "sleeper",
                true,
            )
            .unwrap();
        let seen = flag.clone();
        kernel.register_watch(move |_| *seen.borrow(), vec![sleeper]);

        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.watches_fired, 0);
        assert!(ran.borrow().is_empty());

        *flag.borrow_mut() = true;
        clock.advance();
        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.watches_fired, 1);
        assert_eq!(*ran.borrow(), [2]);
        assert_eq!(kernel.task_info(sleeper).unwrap().state, RunState::Sleeping);

        clock.advance();
        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.watches_fired, 0, "level stays high, no new edge");
        assert_eq!(*ran.borrow(), [2]);
    }

    #[test]
    fn watch_compacts_destroyed_tasks_from_its_wake_list() {
        let (mut kernel, _clock) = kernel();
        let gone = kernel
            .create_task(Program::new().op(|_, _| Disposition::Sleep), "gone", true)
            .unwrap();
        kernel.register_watch(|_| true, vec![gone]);
        kernel.cancel_task(gone).unwrap();

        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.watches_fired, 1);
        assert!(kernel.watches.entries[0].wake_list.is_empty());
    }

    #[test]
    fn timers_fire_before_watches_are_evaluated() {
        let (mut kernel, clock) = kernel();
        let flag = Rc::new(RefCell::new(false));
        let ran = Rc::new(RefCell::new(false));

        let ran_in = ran.clone();
        let sleeper = kernel
            .create_task(
                Program::new().op(move |_, _| {
                    *ran_in.borrow_mut() = true;
                    Disposition::Sleep
                }),
                "sleeper",
                true,
            )
            .unwrap();
        let seen = flag.clone();
        kernel.register_watch(move |_| *seen.borrow(), vec![sleeper]);
        kernel
            .schedule(
                2,
                |_, flag: &Rc<RefCell<bool>>| {
                    *flag.borrow_mut() = true;
                    TimerControl::Stop
                },
                flag.clone(),
                "raise flag",
                None,
            )
            .unwrap();

        kernel.run_one_pass().unwrap();
        clock.advance();
        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.timers_fired, 1);
        assert_eq!(report.watches_fired, 1);
        assert!(*ran.borrow());
    }

    #[test]
    fn skipped_ticks_drop_their_timer_entries() {
        let (mut kernel, clock) = kernel();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let record = |kernel: &mut Kernel, log: &Rc<RefCell<Vec<u64>>>| {
            log.borrow_mut().push(kernel.current_tick());
            TimerControl::Keep
        };
        kernel
            .schedule(3, record, fired.clone(), "every tick", Some(1))
            .unwrap();
        kernel
            .schedule(4, record, fired.clone(), "on time", None)
            .unwrap();

        kernel.run_one_pass().unwrap();
        clock.set(4);
        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.timers_dropped, 1);
        assert_eq!(report.timers_fired, 1);
        assert_eq!(*fired.borrow(), [4]);

        for _ in 5..20 {
            clock.advance();
            let report = kernel.run_one_pass().unwrap();
            assert_eq!(report.timers_dropped, 0);
        }
        assert_eq!(*fired.borrow(), [4]);
        assert!(kernel.timers().is_empty());
        assert_eq!(kernel.next_timer_due(), None);
    }

    #[test]
    fn error_disposition_restarts_from_first_step() {
        let (mut kernel, clock) = kernel();
        let id = kernel
            .create_task_with_store(
                Program::<u32>::new()
                    .op(|_, attempts| {
                        *attempts += 1;
                        Disposition::Continue
                    })
                    .op(|_, attempts| {
                        if *attempts < 2 {
                            Disposition::Error(format!("attempt {attempts} failed"))
                        } else {
                            Disposition::StopKeepCursor
                        }
                    }),
                0,
                "flaky",
                false,
            )
            .unwrap();

        let report = kernel.run_one_pass().unwrap();
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].task_id, id);
        assert_eq!(report.faults[0].message, "attempt 1 failed");
        assert_eq!(kernel.task_info(id).unwrap().cursor, 0);

        clock.advance();
        let report = kernel.run_one_pass().unwrap();
        assert!(report.faults.is_empty());
        assert_eq!(kernel.task_info(id).unwrap().cursor, 1);
    }

    #[test]
    fn slice_profiling_can_be_disabled() {
        let config = crate::config::KernelConfig::new().with_profile_slices(false);
        let mut kernel = Kernel::with_config(config, ManualClock::new(1)).unwrap();
        let id = kernel
            .create_task(Program::new().op(|_, _| Disposition::StopKeepCursor), "quiet", false)
            .unwrap();
        kernel.run_one_pass().unwrap();
        assert!(kernel.task_info(id).unwrap().last_slice.is_none());
    }
}
