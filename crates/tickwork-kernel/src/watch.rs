//! Edge-triggered wake-ups.
//!
//! A watch pairs a predicate with a list of tasks.  Predicates are evaluated
//! once per pass, always in registration order.  When one goes from `false`
//! to `true` every listed task that is `Sleeping` is woken into the current
//! pass; `Ready` and `Blocked` tasks are left alone.  A condition that stays
//! true across many passes fires once.
//!
//! The last observed value starts out `false`, so a predicate that is already
//! true the first time it is evaluated fires immediately.

use crate::kernel::Kernel;
use crate::process::TaskId;

pub(crate) type WatchFn = Box<dyn FnMut(&Kernel) -> bool>;

pub(crate) struct WatchEntry {
    pub(crate) predicate: WatchFn,
    pub(crate) last_value: bool,
    /// Tick of the most recent evaluation (or of registration).
    pub(crate) last_tick: Option<u64>,
    pub(crate) wake_list: Vec<TaskId>,
}

impl WatchEntry {
    /// Record this pass's value and report whether it is a rising edge.
    pub(crate) fn observe(&mut self, tick: u64, value: bool) -> bool {
        let previous = std::mem::replace(&mut self.last_value, value);
        self.last_tick = Some(tick);
        !previous && value
    }
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    pub(crate) entries: Vec<WatchEntry>,
}

impl WatchRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, predicate: WatchFn, wake_list: Vec<TaskId>, tick: Option<u64>) {
        self.entries.push(WatchEntry {
            predicate,
            last_value: false,
            last_tick: tick,
            wake_list,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Wrap `f` so that `hook` runs after every call with the return value and
/// the arguments.
///
/// The hook gets the kernel too, so it can register watches or wake tasks in
/// response to the call.
///
/// ```rust
/// # use tickwork_kernel::{watch, Kernel, ManualClock};
/// let mut kernel = Kernel::new(ManualClock::new(0)).unwrap();
/// let mut deposits = Vec::new();
/// let mut deposit = watch::after(
///     |_k: &mut Kernel, amount: &u32| *amount * 2,
///     move |_k: &mut Kernel, doubled: &u32, amount: &u32| deposits.push((*amount, *doubled)),
/// );
/// assert_eq!(deposit(&mut kernel, &21), 42);
/// ```
pub fn after<A, R, F, H>(mut f: F, mut hook: H) -> impl FnMut(&mut Kernel, &A) -> R
where
    F: FnMut(&mut Kernel, &A) -> R,
    H: FnMut(&mut Kernel, &R, &A),
{
    move |kernel: &mut Kernel, args: &A| {
        let value = f(kernel, args);
        hook(kernel, &value, args);
        value
    }
}
