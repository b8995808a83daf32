//! tickwork micro-kernel.
//!
//! A cooperative, single-threaded kernel for hosts that hand out short,
//! discrete invocations ("ticks").  Nothing survives between invocations
//! except what the kernel keeps explicitly, so task code is a flat vector of
//! steps plus a cursor rather than a stack:
//!
//! - **[`program`]** -- Step vectors with labels and conditional jumps, and
//!   the [`Disposition`] each step returns.
//! - **[`process`]** -- Process table, bounded task-id pool and the
//!   ready/blocked/sleeping collections.
//! - **[`scheduler`]** -- One round-robin pass per tick via
//!   [`Kernel::run_one_pass`].
//! - **[`lock`]** -- Mutual exclusion with thundering-herd release.
//! - **[`signal`]** -- Counting signals with all-or-nothing multi-wait.
//! - **[`timer`]** -- Deferred and periodic callables keyed by tick.
//! - **[`watch`]** -- Edge-triggered wake-ups and the [`watch::after`] hook.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! Everything is `!Send`: the kernel is owned by the host loop that drives it.
//!
//! ```rust
//! use tickwork_kernel::{Context, Disposition, Kernel, ManualClock, Program, SignalRequest, WaitRequest};
//!
//! let clock = ManualClock::new(1);
//! let mut kernel = Kernel::new(clock.clone())?;
//! let ready = kernel.create_signal(0);
//!
//! let consumer = kernel.create_task(
//!     Program::new().tagged("wait", move |cx: &mut Context<'_>, _: &mut ()| {
//!         cx.wait(&[WaitRequest::take(ready, 1)])
//!     }),
//!     "consumer",
//!     false,
//! )?;
//! kernel.create_task(
//!     Program::new().op(move |cx: &mut Context<'_>, _: &mut ()| cx.signal(&[SignalRequest::new(ready, 1)])),
//!     "producer",
//!     false,
//! )?;
//!
//! kernel.run_one_pass()?;
//! clock.advance();
//! let report = kernel.run_one_pass()?;
//!
//! assert_eq!(report.destroyed, vec![consumer]);
//! assert_eq!(kernel.signal_value(ready)?, 0);
//! # Ok::<(), tickwork_kernel::KernelError>(())
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod kernel;
pub mod lock;
pub mod process;
pub mod program;
pub mod scheduler;
pub mod signal;
pub mod timer;
pub mod watch;

// Re-export the most commonly used types at the crate root for convenience.
pub use clock::{ManualClock, TickSource};
pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use kernel::{Context, Kernel};
pub use lock::LockId;
pub use process::{RunState, TaskId, TaskInfo};
pub use program::{Blockable, Disposition, IntoStepResult, Program, StepResult};
pub use scheduler::{PassReport, TaskFault};
pub use signal::{SignalId, SignalRequest, WaitRequest};
pub use timer::{TimerControl, TimerInfo};
