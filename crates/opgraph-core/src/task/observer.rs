//! Observer - タスクのライフサイクル通知

use super::Task;
use crate::domain::TaskError;

/// Lifecycle listener. All methods default to no-ops.
///
/// Callbacks run on whatever thread drives the task and never while the
/// task's state lock is held, so they may query the task freely.
pub trait Observer: Send + Sync {
    fn task_did_start(&self, _task: &Task) {}

    /// `task` handed `produced` to whoever is listening (usually its queue).
    fn task_did_produce(&self, _task: &Task, _produced: &Task) {}

    fn task_did_finish(&self, _task: &Task, _errors: &[TaskError]) {}
}

type StartFn = dyn Fn(&Task) + Send + Sync;
type ProduceFn = dyn Fn(&Task, &Task) + Send + Sync;
type FinishFn = dyn Fn(&Task, &[TaskError]) + Send + Sync;

/// Observer made of closures.
#[derive(Default)]
pub struct BlockObserver {
    on_start: Option<Box<StartFn>>,
    on_produce: Option<Box<ProduceFn>>,
    on_finish: Option<Box<FinishFn>>,
}

impl BlockObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_produce(mut self, f: impl Fn(&Task, &Task) + Send + Sync + 'static) -> Self {
        self.on_produce = Some(Box::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl Fn(&Task, &[TaskError]) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }
}

impl Observer for BlockObserver {
    fn task_did_start(&self, task: &Task) {
        if let Some(f) = &self.on_start {
            f(task);
        }
    }

    fn task_did_produce(&self, task: &Task, produced: &Task) {
        if let Some(f) = &self.on_produce {
            f(task, produced);
        }
    }

    fn task_did_finish(&self, task: &Task, errors: &[TaskError]) {
        if let Some(f) = &self.on_finish {
            f(task, errors);
        }
    }
}
