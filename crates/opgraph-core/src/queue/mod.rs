//! TaskQueue - 並行数制限付きスケジューラ
//!
//! # 実装詳細
//! - タスクは追加順に保持し、ready になったものから tokio::spawn で実行
//! - 1 つのドライバタスクが `Notify` で起こされるたびに pump する
//! - タスクの状態変化・依存追加・キャンセルはすべて `Notify` 経由で届く
//!
//! The driver holds only a `Weak` reference, so dropping the last
//! `TaskQueue` handle stops it.

mod delegate;
mod dependency;
mod exclusivity;

pub use self::delegate::QueueDelegate;
pub use self::dependency::DependencyGraph;
pub use self::exclusivity::ExclusivityController;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::domain::{TaskError, TaskId, TaskState};
use crate::observability::QueueCounts;
use crate::task::{BlockObserver, Observer, Task};

struct QueueState {
    /// Admitted, unfinished tasks in admission order.
    tasks: Vec<Task>,
    admitted: HashSet<TaskId>,
    dispatched: HashSet<TaskId>,
    graph: DependencyGraph,
}

struct QueueInner {
    name: String,
    max_concurrent: Option<usize>,
    suspended: AtomicBool,
    delegate: Mutex<Option<Weak<dyn QueueDelegate>>>,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
}

/// Handle to a queue. Clones share the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue and spawn its driver.
    ///
    /// `max_concurrent = None` means unbounded.
    ///
    /// # Panics
    /// Outside a Tokio runtime.
    pub fn new(name: impl Into<String>, max_concurrent: Option<usize>) -> Self {
        let inner = Arc::new(QueueInner {
            name: name.into(),
            max_concurrent,
            suspended: AtomicBool::new(false),
            delegate: Mutex::new(None),
            state: Mutex::new(QueueState {
                tasks: Vec::new(),
                admitted: HashSet::new(),
                dispatched: HashSet::new(),
                graph: DependencyGraph::new(),
            }),
            wake: Arc::new(Notify::new()),
        });
        tokio::spawn(drive(Arc::downgrade(&inner), inner.wake.clone()));
        Self { inner }
    }

    fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.inner.max_concurrent
    }

    /// The delegate is held weakly; it usually owns the queue.
    pub fn set_delegate(&self, delegate: Weak<dyn QueueDelegate>) {
        *self.inner.delegate.lock() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn QueueDelegate>> {
        self.inner.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Pause or resume dispatch. Running tasks are unaffected.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.suspended.store(suspended, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Admit `task`.
    ///
    /// Order of effects: the queue starts observing the task, dependencies
    /// synthesized by its conditions are attached and admitted first, the
    /// task is chained behind earlier tasks sharing a mutually exclusive
    /// condition, it moves to `Pending`, and the delegate hears about it.
    /// A task whose admission closes a dependency cycle is cancelled with
    /// `DependencyCycle`.
    ///
    /// Tasks that are already queued (here or elsewhere) are ignored.
    pub fn add_task(&self, task: Task) {
        {
            let mut state = self.inner.state.lock();
            if task.state() != TaskState::Initialized
                || !state.admitted.insert(task.id())
            {
                trace!(queue = %self.inner.name, task = %task.name(), "task already admitted");
                return;
            }
        }

        task.add_observer(Arc::new(QueueObserver {
            queue: Arc::downgrade(&self.inner),
        }));

        let conditions = task.conditions();
        let synthesized: Vec<Task> = conditions
            .iter()
            .filter_map(|condition| condition.dependency_for(&task))
            .collect();
        for dependency in synthesized {
            task.add_dependency(&dependency);
            self.add_task(dependency);
        }

        let categories: Vec<String> = conditions
            .iter()
            .filter(|condition| condition.is_mutually_exclusive())
            .map(|condition| condition.name().to_string())
            .collect();
        if !categories.is_empty() {
            let controller = ExclusivityController::shared();
            controller.add(&task, &categories);
            task.add_observer(Arc::new(BlockObserver::new().on_finish(move |task, _| {
                ExclusivityController::shared().remove(task, &categories);
            })));
        }

        task.will_enqueue();
        if let Some(delegate) = self.delegate() {
            delegate.will_add_task(self, &task);
        }

        let cycle = {
            let mut state = self.inner.state.lock();
            for dependency in task.dependencies() {
                state.graph.add_dependency(task.id(), dependency.id());
            }
            state.tasks.push(task.clone());
            state.graph.detect_cycle_from(task.id())
        };
        if let Some(cycle) = cycle {
            warn!(queue = %self.inner.name, task = %task.name(), length = cycle.len() - 1, "dependency cycle detected");
            task.cancel_with_error(TaskError::DependencyCycle { task: task.id() });
        }

        debug!(queue = %self.inner.name, task = %task.name(), task_id = %task.id(), "task admitted");
        task.watch(&self.inner.wake);
        self.inner.wake.notify_one();
    }

    /// Cancel every task currently in the queue.
    pub fn cancel_all(&self) {
        for task in self.tasks() {
            task.cancel();
        }
    }

    /// Unfinished tasks, in admission order.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.state.lock().tasks.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for task in self.tasks() {
            counts.record(task.state(), task.is_cancelled());
        }
        counts
    }

    /// Wait for every task queued at the time of the call.
    pub async fn wait_all(&self) {
        for task in self.tasks() {
            task.wait().await;
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("suspended", &self.is_suspended())
            .field("len", &self.len())
            .finish()
    }
}

impl QueueInner {
    /// Forget finished tasks, then dispatch whatever is ready.
    fn pump(&self) {
        let (tasks, dispatched) = {
            let mut state = self.state.lock();
            let finished: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|task| task.is_finished())
                .map(Task::id)
                .collect();
            if !finished.is_empty() {
                state.tasks.retain(|task| !finished.contains(&task.id()));
                for id in &finished {
                    state.admitted.remove(id);
                    state.dispatched.remove(id);
                    state.graph.remove_task(*id);
                }
            }
            (state.tasks.clone(), state.dispatched.clone())
        };

        for task in &tasks {
            for dependency in task.dependencies() {
                dependency.watch(&self.wake);
            }
        }

        if self.suspended.load(Ordering::SeqCst) {
            return;
        }

        let mut running = dispatched.len();
        for task in tasks {
            if dispatched.contains(&task.id()) {
                continue;
            }
            if self.max_concurrent.is_some_and(|max| running >= max) {
                break;
            }
            if task.is_ready() {
                self.state.lock().dispatched.insert(task.id());
                running += 1;
                trace!(queue = %self.name, task = %task.name(), "dispatching task");
                tokio::spawn(async move { task.start().await });
            }
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

async fn drive(queue: Weak<QueueInner>, wake: Arc<Notify>) {
    loop {
        let Some(inner) = queue.upgrade() else {
            break;
        };
        inner.pump();
        drop(inner);
        wake.notified().await;
    }
}

/// Installed on every admitted task: admits produced tasks and forwards
/// completion to the delegate.
struct QueueObserver {
    queue: Weak<QueueInner>,
}

impl Observer for QueueObserver {
    fn task_did_produce(&self, _task: &Task, produced: &Task) {
        if let Some(inner) = self.queue.upgrade() {
            TaskQueue::from_inner(inner).add_task(produced.clone());
        }
    }

    fn task_did_finish(&self, task: &Task, errors: &[TaskError]) {
        if let Some(inner) = self.queue.upgrade() {
            let queue = TaskQueue::from_inner(inner);
            if let Some(delegate) = queue.delegate() {
                delegate.did_finish_task(&queue, task, errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Condition, ConditionResult, MutuallyExclusive, NoopWork};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn recording(name: &str, log: Arc<Mutex<Vec<String>>>) -> Task {
        let label = name.to_string();
        Task::from_fn(name, move |_| {
            let log = log.clone();
            let label = label.clone();
            async move {
                log.lock().push(label);
                Vec::new()
            }
        })
    }

    #[tokio::test]
    async fn runs_dependencies_first() {
        let queue = TaskQueue::new("test", None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recording("a", log.clone());
        let b = recording("b", log.clone());
        let c = recording("c", log.clone());
        c.add_dependency(&b);
        b.add_dependency(&a);

        queue.add_task(c.clone());
        queue.add_task(b);
        queue.add_task(a);
        c.wait().await;

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn respects_max_concurrent() {
        let queue = TaskQueue::new("serial", Some(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(Task::from_fn(format!("t{i}"), move |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Vec::new()
                }
            }));
        }
        for task in &tasks {
            queue.add_task(task.clone());
        }
        for task in &tasks {
            task.wait().await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspended_queue_does_not_dispatch() {
        let queue = TaskQueue::new("paused", None);
        queue.set_suspended(true);
        let task = Task::noop("held");
        queue.add_task(task.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert_eq!(queue.len(), 1);

        queue.set_suspended(false);
        task.wait().await;
        assert!(task.is_finished());
    }

    struct SynthesizesPrerequisite {
        created: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Condition for SynthesizesPrerequisite {
        fn name(&self) -> &str {
            "Prerequisite"
        }

        fn dependency_for(&self, _task: &Task) -> Option<Task> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Some(Task::noop("prerequisite"))
        }

        async fn evaluate(&self, task: &Task) -> ConditionResult {
            ConditionResult::from_bool(task.dependencies().iter().all(Task::is_finished))
        }
    }

    #[tokio::test]
    async fn condition_dependencies_are_admitted_once() {
        let queue = TaskQueue::new("conditions", None);
        let created = Arc::new(AtomicUsize::new(0));
        let task = Task::builder("gated")
            .condition(SynthesizesPrerequisite {
                created: created.clone(),
            })
            .build(NoopWork);

        queue.add_task(task.clone());
        queue.add_task(task.clone());
        let prerequisite = task.dependencies()[0].clone();

        assert!(task.wait().await.is_empty());
        assert!(prerequisite.is_finished());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn produced_tasks_are_admitted() {
        let queue = TaskQueue::new("produce", None);
        let child = Task::noop("child");
        let handle = child.clone();
        let parent = Task::from_fn("parent", move |task| {
            let child = handle.clone();
            async move {
                task.produce(child);
                Vec::new()
            }
        });

        queue.add_task(parent);
        assert!(child.wait().await.is_empty());
    }

    #[derive(Default)]
    struct RecordingDelegate {
        added: Mutex<Vec<String>>,
        finished: Mutex<Vec<(String, usize)>>,
    }

    impl QueueDelegate for RecordingDelegate {
        fn will_add_task(&self, _queue: &TaskQueue, task: &Task) {
            self.added.lock().push(task.name().to_string());
        }

        fn did_finish_task(&self, _queue: &TaskQueue, task: &Task, errors: &[TaskError]) {
            self.finished
                .lock()
                .push((task.name().to_string(), errors.len()));
        }
    }

    #[tokio::test]
    async fn delegate_hears_admission_and_completion() {
        let queue = TaskQueue::new("delegated", None);
        let delegate = Arc::new(RecordingDelegate::default());
        let weak: Weak<RecordingDelegate> = Arc::downgrade(&delegate);
        queue.set_delegate(weak);

        let failing = Task::from_fn("failing", |_| async {
            vec![TaskError::Other("boom".into())]
        });
        queue.add_task(failing.clone());
        failing.wait().await;

        assert_eq!(*delegate.added.lock(), vec!["failing".to_string()]);
        assert_eq!(
            *delegate.finished.lock(),
            vec![("failing".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn cycle_is_cancelled_instead_of_deadlocking() {
        let queue = TaskQueue::new("cycles", None);
        let a = Task::noop("a");
        let b = Task::noop("b");
        a.add_dependency(&b);
        b.add_dependency(&a);

        queue.add_task(a.clone());
        queue.add_task(b.clone());

        assert_eq!(
            b.wait().await,
            vec![TaskError::DependencyCycle { task: b.id() }]
        );
        assert!(a.wait().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_drains_blocked_tasks() {
        let queue = TaskQueue::new("cancel", None);
        let never = Task::noop("never-admitted");
        let blocked = Task::noop("blocked");
        blocked.add_dependency(&never);
        queue.add_task(blocked.clone());

        queue.cancel_all();
        assert!(blocked.wait().await.is_empty());
        assert!(!never.is_finished());
    }

    #[tokio::test]
    async fn mutually_exclusive_tasks_never_overlap() {
        let queue = TaskQueue::new("exclusive", None);
        let gate = Arc::new(Semaphore::new(1));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let overlaps = overlaps.clone();
            let task = Task::builder(format!("exclusive-{i}"))
                .condition(MutuallyExclusive::new("queue-test-exclusive"))
                .build(crate::task::BlockWork::new(move |_| {
                    let gate = gate.clone();
                    let overlaps = overlaps.clone();
                    async move {
                        match gate.try_acquire() {
                            Ok(_permit) => tokio::time::sleep(Duration::from_millis(5)).await,
                            Err(_) => {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        Vec::new()
                    }
                }));
            tasks.push(task);
        }
        for task in &tasks {
            queue.add_task(task.clone());
        }
        for task in &tasks {
            task.wait().await;
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(
            ExclusivityController::shared().len("queue-test-exclusive"),
            0
        );
    }

    #[tokio::test]
    async fn finished_tasks_leave_the_queue() {
        let queue = TaskQueue::new("drain", None);
        let task = Task::noop("quick");
        queue.add_task(task.clone());
        task.wait().await;

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(queue.is_empty());
        assert_eq!(queue.counts().total(), 0);
    }
}
