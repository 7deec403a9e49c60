//! Condition - 実行前提条件
//!
//! A condition may inject a dependency the first time its task is admitted
//! to a queue, and is evaluated once every dependency has finished.

use async_trait::async_trait;

use super::Task;
use crate::domain::TaskError;

/// Outcome of one evaluation. A failure may carry the reason, which is
/// recorded right after the `ConditionFailed` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionResult {
    Satisfied,
    Failed(Option<TaskError>),
}

impl ConditionResult {
    pub fn from_bool(satisfied: bool) -> Self {
        if satisfied {
            ConditionResult::Satisfied
        } else {
            ConditionResult::Failed(None)
        }
    }

    pub fn failed(error: TaskError) -> Self {
        ConditionResult::Failed(Some(error))
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, ConditionResult::Satisfied)
    }
}

/// Readiness predicate attached to a task.
///
/// A failed evaluation is recorded on the task as
/// `TaskError::ConditionFailed` tagged with `name()`, followed by the
/// failure's own error if it has one, and the task then finishes without
/// executing.
#[async_trait]
pub trait Condition: Send + Sync {
    fn name(&self) -> &str;

    /// At most one task gated by a mutually exclusive condition of a given
    /// name executes at a time, process-wide.
    fn is_mutually_exclusive(&self) -> bool {
        false
    }

    /// Asked once, when `task` is admitted to a queue.
    fn dependency_for(&self, _task: &Task) -> Option<Task> {
        None
    }

    async fn evaluate(&self, task: &Task) -> ConditionResult;
}

/// Always satisfied; only serializes tasks that share `name`.
#[derive(Debug, Clone)]
pub struct MutuallyExclusive {
    name: String,
}

impl MutuallyExclusive {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Condition for MutuallyExclusive {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_mutually_exclusive(&self) -> bool {
        true
    }

    async fn evaluate(&self, _task: &Task) -> ConditionResult {
        ConditionResult::Satisfied
    }
}
