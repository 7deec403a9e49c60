//! Task lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskState はタスクの状態を表現
///
/// States are ordered; a task only ever moves forward:
/// - Initialized -> Pending (admitted to a queue)
/// - Pending -> EvaluatingConditions -> Ready
/// - Ready -> Executing -> Finishing -> Finished
/// - Ready -> Finishing (cancelled or a condition failed)
///
/// Cancellation is a separate flag on the task, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Initialized,
    Pending,
    EvaluatingConditions,
    Ready,
    Executing,
    Finishing,
    Finished,
}

impl TaskState {
    /// Is `self -> target` in the legal transition table?
    pub fn can_transition_to(self, target: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (Initialized, Pending)
                | (Pending, EvaluatingConditions)
                | (EvaluatingConditions, Ready)
                | (Ready, Executing)
                | (Ready, Finishing)
                | (Executing, Finishing)
                | (Finishing, Finished)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Initialized => "initialized",
            TaskState::Pending => "pending",
            TaskState::EvaluatingConditions => "evaluating_conditions",
            TaskState::Ready => "ready",
            TaskState::Executing => "executing",
            TaskState::Finishing => "finishing",
            TaskState::Finished => "finished",
        };
        f.write_str(s)
    }
}
