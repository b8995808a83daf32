//! Host tick source.
//!
//! The kernel never advances time on its own: the host owns the notion of an
//! invocation ("tick") and the kernel reads it through [`TickSource`].

use std::cell::Cell;
use std::rc::Rc;

/// Something that knows the current host tick.
pub trait TickSource {
    /// The tick of the invocation currently in progress.
    fn current_tick(&self) -> u64;
}

/// A clock the host (or a test) steps by hand.
///
/// Clones share the same counter, so the host can keep one handle and give
/// another to the kernel.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    tick: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Create a clock starting at `tick`.
    #[must_use]
    pub fn new(tick: u64) -> Self {
        Self {
            tick: Rc::new(Cell::new(tick)),
        }
    }

    /// Jump to an absolute tick.
    pub fn set(&self, tick: u64) {
        self.tick.set(tick);
    }

    /// Move forward by one tick and return the new value.
    pub fn advance(&self) -> u64 {
        let next = self.tick.get() + 1;
        self.tick.set(next);
        next
    }
}

impl TickSource for ManualClock {
    fn current_tick(&self) -> u64 {
        self.tick.get()
    }
}
