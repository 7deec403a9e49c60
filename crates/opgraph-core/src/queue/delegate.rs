//! QueueDelegate - キューへの追加・完了の通知

use crate::domain::TaskError;
use crate::task::Task;

use super::TaskQueue;

/// Queue-level hooks. Both default to no-ops.
pub trait QueueDelegate: Send + Sync {
    /// `task` is about to be scheduled; dependencies added here still count.
    fn will_add_task(&self, _queue: &TaskQueue, _task: &Task) {}

    fn did_finish_task(&self, _queue: &TaskQueue, _task: &Task, _errors: &[TaskError]) {}
}
