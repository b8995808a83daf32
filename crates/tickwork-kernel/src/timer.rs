//! Deferred and periodic callables, indexed by the tick they are due.
//!
//! The timer is advanced by a resident system task that the kernel creates
//! first and keeps at the head of the ready queue, so due entries run at the
//! very start of each pass.  Entries due at the current tick are taken out of
//! the map before any of them runs; a periodic entry is put back `period`
//! ticks later unless it returned [`TimerControl::Stop`].
//!
//! Entries only fire at their exact tick.  When the host skips ticks, the
//! entries due in the gap are dropped (and logged) at the next pass.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;

/// Returned by a timer callable to decide whether a periodic entry re-arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerControl {
    /// Re-arm if periodic.
    Keep,
    /// Never run again, even if periodic.
    Stop,
}

pub(crate) type TimerFn = Box<dyn FnMut(&mut Kernel) -> TimerControl>;

pub(crate) struct TimerEntry {
    pub(crate) description: String,
    pub(crate) callback: TimerFn,
    pub(crate) period: Option<u64>,
    pub(crate) last_cost: Option<Duration>,
}

impl TimerEntry {
    /// Next due tick after `tick`, when the entry is periodic.
    pub(crate) fn rearm_at(&self, tick: u64) -> Option<u64> {
        self.period.filter(|p| *p > 0).map(|p| tick + p)
    }
}

/// Snapshot of a pending timer entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub due_tick: u64,
    pub description: String,
    pub period: Option<u64>,
    /// Execution time of the previous firing, for periodic entries.
    pub last_cost: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct Timer {
    entries: BTreeMap<u64, Vec<TimerEntry>>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, due_tick: u64, entry: TimerEntry) {
        self.entries.entry(due_tick).or_default().push(entry);
    }

    /// Remove and return every entry due exactly at `tick`.
    pub(crate) fn take_due(&mut self, tick: u64) -> Vec<TimerEntry> {
        self.entries.remove(&tick).unwrap_or_default()
    }

    /// Remove and return every entry due strictly before `tick`.  These are
    /// left behind when the host skips ticks.
    pub(crate) fn take_overdue(&mut self, tick: u64) -> Vec<(u64, TimerEntry)> {
        let current = self.entries.split_off(&tick);
        std::mem::replace(&mut self.entries, current)
            .into_iter()
            .flat_map(|(due, entries)| entries.into_iter().map(move |entry| (due, entry)))
            .collect()
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub(crate) fn next_due(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub(crate) fn infos(&self) -> Vec<TimerInfo> {
        self.entries
            .iter()
            .flat_map(|(due, entries)| {
                entries.iter().map(move |entry| TimerInfo {
                    due_tick: *due,
                    description: entry.description.clone(),
                    period: entry.period,
                    last_cost: entry.last_cost,
                })
            })
            .collect()
    }
}
