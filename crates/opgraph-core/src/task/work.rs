//! Work - タスク本体の振る舞い
//!
//! A `Task` is the state machine; what it actually does is a `Work`. Stage
//! types, group tasks and closures all plug in here instead of subclassing.

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::Task;
use crate::domain::TaskError;

/// The body of a task.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// Run the task. Must lead to exactly one `task.finish(..)`, either before
    /// returning or later from whatever completes the work.
    async fn execute(&self, task: &Task);

    /// Runs instead of `execute` when the task was cancelled or carries
    /// errors (a failed condition) by the time it is started.
    async fn skip(&self, task: &Task) {
        task.finish(Vec::new());
    }

    /// Called once from `finish`, before observers hear about it.
    fn finished(&self, _task: &Task, _errors: &[TaskError]) {}

    /// Called the first time the task is cancelled.
    fn cancelled(&self, _task: &Task) {}
}

type BlockFn = dyn Fn(Task) -> BoxFuture<'static, Vec<TaskError>> + Send + Sync;

/// Work backed by an async closure. The closure's errors are passed to
/// `finish`.
pub struct BlockWork {
    block: Box<BlockFn>,
}

impl BlockWork {
    pub fn new<F, Fut>(block: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<TaskError>> + Send + 'static,
    {
        Self {
            block: Box::new(move |task| Box::pin(block(task))),
        }
    }
}

#[async_trait]
impl Work for BlockWork {
    async fn execute(&self, task: &Task) {
        let errors = (self.block)(task.clone()).await;
        task.finish(errors);
    }
}

/// Finishes immediately without errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWork;

#[async_trait]
impl Work for NoopWork {
    async fn execute(&self, task: &Task) {
        task.finish(Vec::new());
    }
}
