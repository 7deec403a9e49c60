//! GroupTask - 子タスクを内部キューで実行する複合タスク
//!
//! The internal queue starts suspended with a "starting" sentinel in it.
//! Every child admitted afterwards depends on the starting sentinel, and the
//! "finishing" sentinel depends on every child. Executing the group resumes
//! the queue and admits the finishing sentinel; when that finishes, the group
//! finishes with the errors its children reported.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{TaskError, TaskState};
use crate::queue::{QueueDelegate, TaskQueue};
use crate::task::{Task, WeakTask, Work};

struct GroupShared {
    queue: TaskQueue,
    starting: Task,
    finishing: Task,
    group: OnceLock<WeakTask>,
    errors: Mutex<Vec<TaskError>>,
}

impl GroupShared {
    fn cancel_children(&self) {
        for child in self.queue.tasks() {
            if child != self.finishing {
                child.cancel();
            }
        }
    }

    fn run(&self) {
        self.queue.set_suspended(false);
        self.queue.add_task(self.finishing.clone());
    }
}

impl QueueDelegate for GroupShared {
    fn will_add_task(&self, _queue: &TaskQueue, task: &Task) {
        if *task != self.finishing {
            assert!(
                self.finishing.state() < TaskState::Executing,
                "cannot add '{}' to a group that has already finished",
                task.name()
            );
            self.finishing.add_dependency(task);
        }
        if *task != self.starting {
            task.add_dependency(&self.starting);
        }
    }

    fn did_finish_task(&self, queue: &TaskQueue, task: &Task, errors: &[TaskError]) {
        if *task == self.finishing {
            queue.set_suspended(true);
            let aggregated = std::mem::take(&mut *self.errors.lock());
            if let Some(group) = self.group.get().and_then(WeakTask::upgrade) {
                debug!(group = %group.name(), errors = aggregated.len(), "group drained");
                group.finish(aggregated);
            }
        } else if *task != self.starting {
            self.errors.lock().extend_from_slice(errors);
        }
    }
}

struct GroupWork {
    shared: Arc<GroupShared>,
}

#[async_trait]
impl Work for GroupWork {
    async fn execute(&self, _task: &Task) {
        self.shared.run();
    }

    // A group that may not execute still drains its children before it
    // finishes.
    async fn skip(&self, _task: &Task) {
        self.shared.cancel_children();
        self.shared.run();
    }

    fn cancelled(&self, _task: &Task) {
        self.shared.cancel_children();
    }
}

/// A task made of child tasks.
#[derive(Clone)]
pub struct GroupTask {
    task: Task,
    shared: Arc<GroupShared>,
}

impl GroupTask {
    /// `max_concurrent` bounds the internal queue (`None` = unbounded).
    pub fn new(name: impl Into<String>, max_concurrent: Option<usize>) -> Self {
        let name = name.into();
        let queue = TaskQueue::new(format!("{name}.children"), max_concurrent);
        queue.set_suspended(true);

        let shared = Arc::new(GroupShared {
            queue: queue.clone(),
            starting: Task::noop(format!("{name}.starting")),
            finishing: Task::noop(format!("{name}.finishing")),
            group: OnceLock::new(),
            errors: Mutex::new(Vec::new()),
        });
        let delegate: Weak<GroupShared> = Arc::downgrade(&shared);
        queue.set_delegate(delegate);

        let task = Task::new(
            name,
            GroupWork {
                shared: shared.clone(),
            },
        );
        let _ = shared.group.set(task.downgrade());
        queue.add_task(shared.starting.clone());

        Self { task, shared }
    }

    pub fn with_children(
        name: impl Into<String>,
        max_concurrent: Option<usize>,
        children: impl IntoIterator<Item = Task>,
    ) -> Self {
        let group = Self::new(name, max_concurrent);
        for child in children {
            group.add_task(child);
        }
        group
    }

    /// The group as a schedulable task.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn add_task(&self, child: Task) {
        self.shared.queue.add_task(child);
    }

    /// Unfinished children, sentinels excluded.
    pub fn children(&self) -> Vec<Task> {
        self.shared
            .queue
            .tasks()
            .into_iter()
            .filter(|t| *t != self.shared.starting && *t != self.shared.finishing)
            .collect()
    }

    pub fn is_sentinel(&self, task: &Task) -> bool {
        *task == self.shared.starting || *task == self.shared.finishing
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub async fn wait(&self) -> Vec<TaskError> {
        self.task.wait().await
    }
}

impl std::fmt::Debug for GroupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTask")
            .field("task", &self.task)
            .field("queue", &self.shared.queue)
            .finish()
    }
}
