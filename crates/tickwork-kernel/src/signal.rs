//! Counting semaphores with multi-resource, all-or-nothing waits.
//!
//! A wait names several signals, each with a lower bound and an amount.  The
//! wait succeeds only when every named signal is at or above its lower bound,
//! and only then is each amount subtracted.  Otherwise the caller is parked on
//! the first signal that falls short and nothing is consumed.  Separating the
//! bound from the amount allows "wait until at least N, then take M".
//!
//! Signalling adds to a value and wakes every waiter whose bound is now met,
//! then forgets the whole waiter list: woken tasks re-evaluate their wait from
//! scratch on their next slice.
//!
//! Signals that have been destroyed are treated as satisfied and skipped.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::process::{ProcessTable, TaskId, WakeInto};
use crate::program::Blockable;

/// Opaque signal handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalId(Uuid);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal-{}", self.0.simple())
    }
}

/// One entry of a [`wait`](crate::Context::wait) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRequest {
    pub signal: SignalId,
    /// The value must be at least this for the wait to proceed.
    pub lower_bound: i64,
    /// How much is subtracted once every bound in the request is met.
    pub amount: i64,
}

impl WaitRequest {
    pub fn new(signal: SignalId, lower_bound: i64, amount: i64) -> Self {
        Self {
            signal,
            lower_bound,
            amount,
        }
    }

    /// Wait for `amount` and take exactly that much.
    pub fn take(signal: SignalId, amount: i64) -> Self {
        Self::new(signal, amount, amount)
    }
}

/// One entry of a [`signal`](crate::Context::signal) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal: SignalId,
    pub amount: i64,
}

impl SignalRequest {
    pub fn new(signal: SignalId, amount: i64) -> Self {
        Self { signal, amount }
    }
}

#[derive(Debug)]
struct Signal {
    value: i64,
    /// `(task, lower bound)`; a task appears at most once.
    waiters: Vec<(TaskId, i64)>,
}

#[derive(Debug, Default)]
pub(crate) struct SignalRegistry {
    signals: HashMap<SignalId, Signal>,
}

impl SignalRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&mut self, value: i64) -> SignalId {
        let id = SignalId(Uuid::now_v7());
        self.signals.insert(
            id,
            Signal {
                value,
                waiters: Vec::new(),
            },
        );
        tracing::debug!(signal_id = %id, value, "signal created");
        id
    }

    /// Wake every waiter, then drop the signal.
    pub(crate) fn destroy(&mut self, id: SignalId, procs: &mut ProcessTable) -> Result<()> {
        let signal = self
            .signals
            .remove(&id)
            .ok_or(KernelError::SignalNotFound { signal_id: id })?;

        for (waiter, _) in signal.waiters {
            procs.wake(waiter, WakeInto::NextPass)?;
        }
        tracing::debug!(signal_id = %id, "signal destroyed");
        Ok(())
    }

    /// Requests are checked in order as if each earlier one had already
    /// consumed its amount, so naming a signal twice needs the sum.
    pub(crate) fn wait(&mut self, requests: &[WaitRequest], task: TaskId) -> Result<Blockable> {
        let mut claimed: HashMap<SignalId, i64> = HashMap::new();
        for request in requests {
            let Some(signal) = self.signals.get_mut(&request.signal) else {
                continue;
            };
            let earlier = claimed.entry(request.signal).or_default();
            // Threshold on the raw value once earlier requests are counted.
            let threshold = request.lower_bound + *earlier;
            if signal.value < threshold {
                if signal.waiters.iter().any(|(t, _)| *t == task) {
                    return Err(KernelError::DuplicateWaiter {
                        task_id: task,
                        resource: request.signal.to_string(),
                    });
                }
                signal.waiters.push((task, threshold));
                tracing::trace!(
                    signal_id = %request.signal,
                    task_id = %task,
                    value = signal.value,
                    threshold,
                    "signal wait blocked"
                );
                return Ok(Blockable::Block);
            }
            *earlier += request.amount;
        }

        for request in requests {
            if let Some(signal) = self.signals.get_mut(&request.signal) {
                signal.value -= request.amount;
            }
        }
        Ok(Blockable::Continue)
    }

    pub(crate) fn signal(
        &mut self,
        requests: &[SignalRequest],
        procs: &mut ProcessTable,
    ) -> Result<Blockable> {
        for request in requests {
            let Some(signal) = self.signals.get_mut(&request.signal) else {
                continue;
            };
            signal.value += request.amount;
            for (waiter, lower_bound) in std::mem::take(&mut signal.waiters) {
                if signal.value >= lower_bound {
                    procs.wake(waiter, WakeInto::NextPass)?;
                }
            }
            tracing::trace!(signal_id = %request.signal, value = signal.value, "signal raised");
        }
        Ok(Blockable::Continue)
    }

    pub(crate) fn value(&self, id: SignalId) -> Result<i64> {
        self.signals
            .get(&id)
            .map(|signal| signal.value)
            .ok_or(KernelError::SignalNotFound { signal_id: id })
    }

    pub(crate) fn waiters(&self, id: SignalId) -> Result<Vec<TaskId>> {
        self.signals
            .get(&id)
            .map(|signal| signal.waiters.iter().map(|(t, _)| *t).collect())
            .ok_or(KernelError::SignalNotFound { signal_id: id })
    }

    pub(crate) fn len(&self) -> usize {
        self.signals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RunState;
    use crate::program::{Disposition, Program};

    fn table_with(n: usize) -> (ProcessTable, Vec<TaskId>) {
        let mut table = ProcessTable::new(16);
        let ids = (0..n)
            .map(|i| {
                let body = Program::<()>::new()
                    .op(|_, _| Disposition::Continue)
                    .load((), "t")
                    .expect("load");
                table.insert(format!("t{i}"), Box::new(body), false).unwrap()
            })
            .collect();
        (table, ids)
    }

    #[test]
    fn wait_is_all_or_nothing() {
        let (_procs, ids) = table_with(1);
        let mut signals = SignalRegistry::new();
        let s1 = signals.create(0);
        let s2 = signals.create(5);

        let outcome = signals
            .wait(&[WaitRequest::new(s1, 1, 1), WaitRequest::new(s2, 1, 1)], ids[0])
            .unwrap();
        assert_eq!(outcome, Blockable::Block);
        assert_eq!(signals.value(s1).unwrap(), 0);
        assert_eq!(signals.value(s2).unwrap(), 5);
        assert_eq!(signals.waiters(s1).unwrap(), vec![ids[0]]);
        assert!(signals.waiters(s2).unwrap().is_empty());
    }

    #[test]
    fn lower_bound_is_independent_of_amount() {
        let (_procs, ids) = table_with(1);
        let mut signals = SignalRegistry::new();
        let s = signals.create(4);

        let outcome = signals.wait(&[WaitRequest::new(s, 5, 2)], ids[0]).unwrap();
        assert_eq!(outcome, Blockable::Block);

        let mut signals = SignalRegistry::new();
        let s = signals.create(5);
        let outcome = signals.wait(&[WaitRequest::new(s, 5, 2)], ids[0]).unwrap();
        assert_eq!(outcome, Blockable::Continue);
        assert_eq!(signals.value(s).unwrap(), 3);
    }

    #[test]
    fn signal_wakes_only_satisfied_waiters_and_clears_list() {
        let (mut procs, ids) = table_with(2);
        let mut signals = SignalRegistry::new();
        let s = signals.create(0);

        signals.wait(&[WaitRequest::take(s, 1)], ids[0]).unwrap();
        signals.wait(&[WaitRequest::take(s, 3)], ids[1]).unwrap();
        procs.block(ids[0]).unwrap();
        procs.block(ids[1]).unwrap();

        signals.signal(&[SignalRequest::new(s, 2)], &mut procs).unwrap();
        assert_eq!(signals.value(s).unwrap(), 2);
        assert_eq!(procs.state(ids[0]), Some(RunState::Ready));
        assert_eq!(procs.state(ids[1]), Some(RunState::Blocked));
        assert!(signals.waiters(s).unwrap().is_empty());
    }

    #[test]
    fn repeated_signal_in_one_wait_needs_the_sum() {
        let (mut procs, ids) = table_with(1);
        let mut signals = SignalRegistry::new();
        let s = signals.create(1);

        let twice = [WaitRequest::take(s, 1), WaitRequest::take(s, 1)];
        assert_eq!(signals.wait(&twice, ids[0]).unwrap(), Blockable::Block);
        assert_eq!(signals.value(s).unwrap(), 1);
        procs.block(ids[0]).unwrap();

        signals.signal(&[SignalRequest::new(s, 1)], &mut procs).unwrap();
        assert_eq!(procs.state(ids[0]), Some(RunState::Ready));
        assert_eq!(signals.wait(&twice, ids[0]).unwrap(), Blockable::Continue);
        assert_eq!(signals.value(s).unwrap(), 0);
    }

    #[test]
    fn duplicate_waiter_is_fatal() {
        let (_procs, ids) = table_with(1);
        let mut signals = SignalRegistry::new();
        let s = signals.create(0);

        signals.wait(&[WaitRequest::take(s, 1)], ids[0]).unwrap();
        let err = signals.wait(&[WaitRequest::take(s, 1)], ids[0]).unwrap_err();
        assert!(matches!(err, KernelError::DuplicateWaiter { .. }));
    }

    #[test]
    fn destroyed_signal_is_skipped() {
        let (mut procs, ids) = table_with(2);
        let mut signals = SignalRegistry::new();
        let gone = signals.create(0);
        let live = signals.create(3);

        signals.wait(&[WaitRequest::take(gone, 1)], ids[1]).unwrap();
        procs.block(ids[1]).unwrap();
        signals.destroy(gone, &mut procs).unwrap();
        assert_eq!(procs.state(ids[1]), Some(RunState::Ready));

        let outcome = signals
            .wait(&[WaitRequest::take(gone, 10), WaitRequest::take(live, 2)], ids[0])
            .unwrap();
        assert_eq!(outcome, Blockable::Continue);
        assert_eq!(signals.value(live).unwrap(), 1);

        signals
            .signal(&[SignalRequest::new(gone, 1)], &mut procs)
            .expect("signalling a destroyed signal is a no-op");
        assert!(matches!(
            signals.value(gone),
            Err(KernelError::SignalNotFound { .. })
        ));
        assert_eq!(signals.len(), 1);
    }
}
