//! Task programs.
//!
//! A program is a fixed vector of steps.  Each step is either an atomic
//! operation (optionally carrying a label) or a conditional jump to a label.
//! The only state that has to survive a suspension is the task's cursor, an
//! index into this vector; everything else a task needs lives in its
//! task-local store `S`, which every step receives by `&mut`.
//!
//! ```text
//!  cursor ─┐
//!          v
//!   [ op ][ "w": op ][ jump_if(pred, "w") ][ op ]
//! ```
//!
//! Labels are resolved into a `label -> index` map once, when the task is
//! created.  A jump to an undefined label fails task creation rather than
//! surfacing at jump time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::kernel::Context;

// ---------------------------------------------------------------------------
// Return codes
// ---------------------------------------------------------------------------

/// What the scheduler should do after an atomic operation returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    /// Advance the cursor and keep running this task.
    Continue,
    /// Yield; resume at this same step next pass.
    StopKeepCursor,
    /// Yield; resume at the following step next pass.
    StopAdvanceCursor,
    /// Yield; resume at the step carrying this label next pass.
    StopToLabel(String),
    /// Go to sleep with the cursor reset to the first step.
    Sleep,
    /// Park on the blocked queue until a lock or signal wakes the task.
    Block,
    /// Recoverable failure: log it and restart the task from its first step
    /// next pass.
    Error(String),
}

/// The two outcomes a blocking primitive can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Blockable {
    /// The resource was granted (or no longer exists).
    Continue,
    /// The caller has been registered as a waiter and must block.
    Block,
}

impl From<Blockable> for Disposition {
    fn from(value: Blockable) -> Self {
        match value {
            Blockable::Continue => Disposition::Continue,
            Blockable::Block => Disposition::Block,
        }
    }
}

/// What a step produces: a disposition, or a fatal kernel error.
pub type StepResult = Result<Disposition>;

/// Anything a step closure may return.
pub trait IntoStepResult {
    fn into_step_result(self) -> StepResult;
}

impl IntoStepResult for Disposition {
    fn into_step_result(self) -> StepResult {
        Ok(self)
    }
}

impl IntoStepResult for Blockable {
    fn into_step_result(self) -> StepResult {
        Ok(self.into())
    }
}

impl IntoStepResult for Result<Disposition> {
    fn into_step_result(self) -> StepResult {
        self
    }
}

impl IntoStepResult for Result<Blockable> {
    fn into_step_result(self) -> StepResult {
        self.map(Disposition::from)
    }
}

// ---------------------------------------------------------------------------
// Program builder
// ---------------------------------------------------------------------------

type StepFn<S> = Box<dyn FnMut(&mut Context<'_>, &mut S) -> StepResult>;
type PredicateFn<S> = Box<dyn FnMut(&mut Context<'_>, &mut S) -> bool>;

enum Step<S> {
    Op(StepFn<S>),
    Tagged(String, StepFn<S>),
    JumpIf(PredicateFn<S>, String),
}

/// An ordered list of steps operating on a task-local store `S`.
///
/// ```rust
/// # use tickwork_kernel::{Disposition, Program};
/// let program = Program::<u32>::new()
///     .tagged("count", |_cx, n| {
///         *n += 1;
///         Disposition::Continue
///     })
///     .jump_if("count", |_cx, n| *n < 3)
///     .op(|_cx, _n| Disposition::StopAdvanceCursor);
/// assert_eq!(program.len(), 3);
/// ```
pub struct Program<S = ()> {
    steps: Vec<Step<S>>,
}

impl<S: 'static> Program<S> {
    /// Create an empty program.
    #[must_use]
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append an unlabeled atomic operation.
    #[must_use]
    pub fn op<F, R>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Context<'_>, &mut S) -> R + 'static,
        R: IntoStepResult,
    {
        self.steps.push(Step::Op(erase(f)));
        self
    }

    /// Append an atomic operation that can be jumped or resumed to by `label`.
    #[must_use]
    pub fn tagged<F, R>(mut self, label: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut Context<'_>, &mut S) -> R + 'static,
        R: IntoStepResult,
    {
        self.steps.push(Step::Tagged(label.into(), erase(f)));
        self
    }

    /// Append a conditional jump: when `predicate` holds, continue at `label`,
    /// otherwise fall through to the next step.
    #[must_use]
    pub fn jump_if<P>(mut self, label: impl Into<String>, predicate: P) -> Self
    where
        P: FnMut(&mut Context<'_>, &mut S) -> bool + 'static,
    {
        self.steps.push(Step::JumpIf(Box::new(predicate), label.into()));
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the program has no steps at all.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve labels, validate jump targets and bind the program to its
    /// task-local store.
    pub(crate) fn load(self, store: S, description: &str) -> Result<LoadedProgram<S>> {
        let mut labels = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if let Step::Tagged(label, _) = step {
                if labels.insert(label.clone(), index).is_some() {
                    return Err(KernelError::MalformedProgram {
                        description: description.to_string(),
                        reason: format!("label `{label}` is defined more than once"),
                    });
                }
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            if let Step::JumpIf(_, target) = step {
                if !labels.contains_key(target) {
                    return Err(KernelError::MalformedProgram {
                        description: description.to_string(),
                        reason: format!("step {index} jumps to undefined label `{target}`"),
                    });
                }
            }
        }

        Ok(LoadedProgram {
            steps: self.steps,
            labels,
            store,
        })
    }
}

impl<S: 'static> Default for Program<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn erase<S, F, R>(mut f: F) -> StepFn<S>
where
    F: FnMut(&mut Context<'_>, &mut S) -> R + 'static,
    R: IntoStepResult,
{
    Box::new(move |cx: &mut Context<'_>, store: &mut S| f(cx, store).into_step_result())
}

// ---------------------------------------------------------------------------
// Loaded programs
// ---------------------------------------------------------------------------

/// Result of executing the step under the cursor.
pub(crate) enum Executed {
    /// A conditional jump was evaluated; `Some(index)` when taken.
    Jump(Option<usize>),
    /// An atomic operation ran.
    Atomic(StepResult),
}

/// A validated program bound to its store, with the store type erased so the
/// process table can hold programs of any store type.
pub(crate) trait TaskBody {
    fn len(&self) -> usize;

    fn label_index(&self, label: &str) -> Option<usize>;

    fn execute(&mut self, cursor: usize, cx: &mut Context<'_>) -> Executed;
}

pub(crate) struct LoadedProgram<S> {
    steps: Vec<Step<S>>,
    labels: HashMap<String, usize>,
    store: S,
}

impl<S> TaskBody for LoadedProgram<S> {
    fn len(&self) -> usize {
        self.steps.len()
    }

    fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    fn execute(&mut self, cursor: usize, cx: &mut Context<'_>) -> Executed {
        match &mut self.steps[cursor] {
            Step::JumpIf(predicate, target) => {
                if predicate(cx, &mut self.store) {
                    Executed::Jump(self.labels.get(target.as_str()).copied())
                } else {
                    Executed::Jump(None)
                }
            }
            Step::Op(f) | Step::Tagged(_, f) => Executed::Atomic(f(cx, &mut self.store)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_indexed_at_load() {
        let loaded = Program::<()>::new()
            .op(|_, _| Disposition::Continue)
            .tagged("second", |_, _| Disposition::Continue)
            .jump_if("second", |_, _| false)
            .load((), "labels")
            .expect("program should load");

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.label_index("second"), Some(1));
        assert_eq!(loaded.label_index("missing"), None);
    }

    #[test]
    fn undefined_jump_target_is_rejected() {
        let result = Program::<()>::new()
            .op(|_, _| Disposition::Continue)
            .jump_if("nonexistent", |_, _| true)
            .load((), "bad-jump");

        match result {
            Err(KernelError::MalformedProgram { description, reason }) => {
                assert_eq!(description, "bad-jump");
                assert!(reason.contains("nonexistent"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("program with a dangling jump must not load"),
        }
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let result = Program::<()>::new()
            .tagged("x", |_, _| Disposition::Continue)
            .tagged("x", |_, _| Disposition::Continue)
            .load((), "dup");
        assert!(matches!(result, Err(KernelError::MalformedProgram { .. })));
    }

    #[test]
    fn blockable_converts_into_disposition() {
        assert_eq!(Disposition::from(Blockable::Continue), Disposition::Continue);
        assert_eq!(Disposition::from(Blockable::Block), Disposition::Block);
        assert_eq!(
            Ok::<_, KernelError>(Blockable::Block)
                .into_step_result()
                .expect("ok"),
            Disposition::Block
        );
    }

    #[test]
    fn empty_program() {
        let program = Program::<()>::default();
        assert!(program.is_empty());
        assert_eq!(program.len(), 0);
    }
}
