//! Task - 状態機械を持つ作業単位
//!
//! A `Task` is a cheap, clonable handle. Clones share one state machine;
//! equality is by `TaskId`.
//!
//! Lifecycle (see `TaskState`): a queue admits the task (`Initialized ->
//! Pending`), asks `is_ready()` until dependencies are done and conditions
//! have been evaluated, then calls `start()`. The work calls `finish()`
//! exactly once; further calls are ignored.
//!
//! State changes are published to watchers (`tokio::sync::Notify`) after
//! the state lock is released. Observers are also called outside every lock.

mod condition;
mod observer;
mod work;

pub use self::condition::{Condition, ConditionResult, MutuallyExclusive};
pub use self::observer::{BlockObserver, Observer};
pub use self::work::{BlockWork, NoopWork, Work};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{debug, trace};

use crate::domain::{TaskError, TaskId, TaskState};

struct TaskInner {
    id: TaskId,
    name: String,
    state: Mutex<TaskState>,
    cancelled: AtomicBool,
    finished_already: AtomicBool,
    conditions: Mutex<Vec<Arc<dyn Condition>>>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    dependencies: Mutex<Vec<Task>>,
    errors: Mutex<Vec<TaskError>>,
    watchers: Mutex<Vec<Arc<Notify>>>,
    outcome: watch::Sender<Option<Vec<TaskError>>>,
    work: Arc<dyn Work>,
}

/// Handle to a schedulable unit of work.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

/// Non-owning task handle.
#[derive(Clone)]
pub struct WeakTask {
    inner: Weak<TaskInner>,
}

impl WeakTask {
    pub fn upgrade(&self) -> Option<Task> {
        self.inner.upgrade().map(|inner| Task { inner })
    }
}

/// TaskBuilder はタスクを完全な状態で構築する
pub struct TaskBuilder {
    name: String,
    conditions: Vec<Arc<dyn Condition>>,
    observers: Vec<Arc<dyn Observer>>,
    dependencies: Vec<Task>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            observers: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn condition(mut self, condition: impl Condition + 'static) -> Self {
        self.conditions.push(Arc::new(condition));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn dependency(mut self, task: Task) -> Self {
        if !self.dependencies.contains(&task) {
            self.dependencies.push(task);
        }
        self
    }

    pub fn build(self, work: impl Work) -> Task {
        let inner = Arc::new(TaskInner {
            id: TaskId::generate(),
            name: self.name,
            state: Mutex::new(TaskState::Initialized),
            cancelled: AtomicBool::new(false),
            finished_already: AtomicBool::new(false),
            conditions: Mutex::new(self.conditions),
            observers: Mutex::new(self.observers),
            dependencies: Mutex::new(self.dependencies),
            errors: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            outcome: watch::Sender::new(None),
            work: Arc::new(work),
        });
        Task { inner }
    }
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn new(name: impl Into<String>, work: impl Work) -> Self {
        TaskBuilder::new(name).build(work)
    }

    /// A task whose body is an async closure returning its errors.
    pub fn from_fn<F, Fut>(name: impl Into<String>, block: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<TaskError>> + Send + 'static,
    {
        Self::new(name, BlockWork::new(block))
    }

    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, NoopWork)
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downgrade(&self) -> WeakTask {
        WeakTask {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================
    // 状態
    // ========================================

    pub fn state(&self) -> TaskState {
        *self.inner.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Errors recorded so far (cancellation and condition failures).
    pub fn errors(&self) -> Vec<TaskError> {
        self.inner.errors.lock().clone()
    }

    /// Move to `target`. Ignored once finished; panics on an illegal move.
    fn transition(&self, target: TaskState) {
        let from = {
            let mut state = self.inner.state.lock();
            if *state == TaskState::Finished {
                return;
            }
            assert!(
                state.can_transition_to(target),
                "invalid state transition {} -> {} for task '{}'",
                *state,
                target,
                self.inner.name
            );
            std::mem::replace(&mut *state, target)
        };
        trace!(task = %self.inner.name, task_id = %self.inner.id, %from, to = %target, "state transition");
        self.notify_watchers();
    }

    /// Move `from -> to` only if the task is currently in `from`.
    fn try_transition(&self, from: TaskState, to: TaskState) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != from {
                return false;
            }
            assert!(from.can_transition_to(to));
            *state = to;
        }
        trace!(task = %self.inner.name, task_id = %self.inner.id, %from, %to, "state transition");
        self.notify_watchers();
        true
    }

    // ========================================
    // 条件・オブザーバー・依存関係
    // ========================================

    pub fn add_condition(&self, condition: Arc<dyn Condition>) {
        let state = self.state();
        assert!(
            state < TaskState::EvaluatingConditions,
            "cannot add conditions to task '{}' in state {state}",
            self.inner.name
        );
        self.inner.conditions.lock().push(condition);
    }

    pub fn conditions(&self) -> Vec<Arc<dyn Condition>> {
        self.inner.conditions.lock().clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        let state = self.state();
        assert!(
            state < TaskState::Executing,
            "cannot add observers to task '{}' in state {state}",
            self.inner.name
        );
        self.inner.observers.lock().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn Observer>> {
        self.inner.observers.lock().clone()
    }

    /// `self` will not become ready before `dependency` finishes.
    pub fn add_dependency(&self, dependency: &Task) {
        let state = self.state();
        assert!(
            state < TaskState::Executing,
            "cannot add dependencies to task '{}' in state {state}",
            self.inner.name
        );
        {
            let mut dependencies = self.inner.dependencies.lock();
            if dependencies.contains(dependency) {
                return;
            }
            dependencies.push(dependency.clone());
        }
        self.notify_watchers();
    }

    /// Current dependencies. A finished task has released its list.
    pub fn dependencies(&self) -> Vec<Task> {
        self.inner.dependencies.lock().clone()
    }

    fn dependencies_finished(&self) -> bool {
        self.inner
            .dependencies
            .lock()
            .iter()
            .all(|dependency| dependency.is_finished())
    }

    /// Wake `notify` on every state change, cancellation and new dependency.
    pub fn watch(&self, notify: &Arc<Notify>) {
        let mut watchers = self.inner.watchers.lock();
        if !watchers.iter().any(|w| Arc::ptr_eq(w, notify)) {
            watchers.push(notify.clone());
        }
    }

    fn notify_watchers(&self) {
        let watchers = self.inner.watchers.lock().clone();
        for watcher in watchers {
            watcher.notify_one();
        }
    }

    // ========================================
    // 実行
    // ========================================

    /// Admission to a queue: `Initialized -> Pending`.
    pub fn will_enqueue(&self) {
        self.transition(TaskState::Pending);
    }

    /// A cancelled task still lets admitted dependencies finish first.
    /// Dependencies no queue ever admitted are not waited for.
    fn admitted_dependencies_finished(&self) -> bool {
        self.inner.dependencies.lock().iter().all(|dependency| {
            matches!(
                dependency.state(),
                TaskState::Initialized | TaskState::Finished
            )
        })
    }

    /// Readiness query used by queues.
    ///
    /// A pending task whose dependencies have all finished starts evaluating
    /// its conditions as a side effect and still answers `false`. A cancelled
    /// pending task skips evaluation but keeps its place behind running
    /// dependencies, unless it already carries an error (a cycle member
    /// would otherwise wait forever).
    pub fn is_ready(&self) -> bool {
        match self.state() {
            TaskState::Initialized => self.is_cancelled(),
            TaskState::Pending => {
                if self.is_cancelled() {
                    return !self.inner.errors.lock().is_empty()
                        || self.admitted_dependencies_finished();
                }
                if self.dependencies_finished() {
                    self.evaluate_conditions();
                }
                false
            }
            TaskState::Ready => self.dependencies_finished() || self.is_cancelled(),
            _ => false,
        }
    }

    fn evaluate_conditions(&self) {
        if !self.try_transition(TaskState::Pending, TaskState::EvaluatingConditions) {
            return;
        }
        let conditions = self.conditions();
        if conditions.is_empty() {
            self.try_transition(TaskState::EvaluatingConditions, TaskState::Ready);
            return;
        }

        let task = self.clone();
        tokio::spawn(async move {
            let results = join_all(conditions.iter().map(|c| c.evaluate(&task))).await;
            let mut failures = Vec::new();
            for (condition, result) in conditions.iter().zip(results) {
                if let ConditionResult::Failed(reason) = result {
                    failures.push(TaskError::condition_failed(condition.name()));
                    failures.extend(reason);
                }
            }
            debug!(task = %task.name(), failed = failures.len(), "conditions evaluated");
            if !failures.is_empty() {
                task.inner.errors.lock().extend(failures);
            }
            task.try_transition(TaskState::EvaluatingConditions, TaskState::Ready);
        });
    }

    /// Walk a cancelled task forward to `Ready` through legal transitions.
    fn advance_cancelled(&self) {
        loop {
            let state = self.state();
            let next = match state {
                TaskState::Initialized => TaskState::Pending,
                TaskState::Pending => TaskState::EvaluatingConditions,
                TaskState::EvaluatingConditions => TaskState::Ready,
                _ => return,
            };
            self.try_transition(state, next);
        }
    }

    /// Run the task. Queues call this once the task reports ready.
    ///
    /// Executes the work if nothing went wrong so far, otherwise lets the
    /// work skip straight to `finish`.
    pub async fn start(&self) {
        if self.is_cancelled() {
            self.advance_cancelled();
        }
        let state = self.state();
        if state == TaskState::Finished {
            return;
        }
        assert!(
            state == TaskState::Ready,
            "task '{}' started in state {state}; run tasks through a queue",
            self.inner.name
        );

        let clean = self.inner.errors.lock().is_empty() && !self.is_cancelled();
        if clean {
            self.transition(TaskState::Executing);
            for observer in self.observers() {
                observer.task_did_start(self);
            }
            self.inner.work.execute(self).await;
        } else {
            self.inner.work.skip(self).await;
        }
    }

    /// Finish with `errors` merged after the recorded ones. Only the first
    /// call has any effect.
    pub fn finish(&self, errors: Vec<TaskError>) {
        if self.inner.finished_already.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transition(TaskState::Finishing);

        let mut combined = self.errors();
        combined.extend(errors);

        self.inner.work.finished(self, &combined);
        for observer in self.observers() {
            observer.task_did_finish(self, &combined);
        }

        self.transition(TaskState::Finished);
        self.inner.dependencies.lock().clear();
        self.inner.outcome.send_replace(Some(combined));
    }

    /// Hand `task` to this task's observers (a queue admits it).
    pub fn produce(&self, task: Task) {
        for observer in self.observers() {
            observer.task_did_produce(self, &task);
        }
    }

    pub fn cancel(&self) {
        self.cancel_with(None);
    }

    pub fn cancel_with_error(&self, error: TaskError) {
        self.cancel_with(Some(error));
    }

    /// Cooperative: sets the flag (recording `error` if given) and lets
    /// readiness checks and `start` react. Running work is not interrupted.
    pub fn cancel_with(&self, error: Option<TaskError>) {
        if self.is_finished() {
            return;
        }
        if let Some(error) = error {
            self.inner.errors.lock().push(error);
        }
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            debug!(task = %self.inner.name, task_id = %self.inner.id, "task cancelled");
            self.inner.work.cancelled(self);
        }
        self.notify_watchers();
    }

    /// Resolve with the combined error list once the task has finished.
    pub async fn wait(&self) -> Vec<TaskError> {
        let mut outcome = self.inner.outcome.subscribe();
        match outcome.wait_for(Option::is_some).await {
            Ok(errors) => errors.clone().unwrap_or_default(),
            Err(_) => self.errors(),
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
