//! Transaction - 1 つのストアリクエストを表すグループタスク
//!
//! A fetch becomes one partition; a save becomes up to three (inserted,
//! updated and deleted objects). Each partition is a four-stage chain
//! (see `partition`). The transaction works in a child of the workspace it
//! was given and commits into it when it finishes.

mod partition;
mod stages;

pub use self::partition::{Partition, PartitionProgress, Stage, StageCondition};
pub use self::stages::{ConditionDataWork, ConstructWork, FetchBytesWork, ValidateWork};

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::FulfillmentCache;
use crate::domain::{
    Operation, RequestComponents, StoreRequest, TaskError, TransactionId,
};
use crate::group::GroupTask;
use crate::ports::{Collaborators, Workspace};
use crate::task::{BlockObserver, Task};

/// Split a request into the components of its partitions.
pub fn partition_request(request: &StoreRequest) -> Vec<RequestComponents> {
    match request {
        StoreRequest::Fetch(fetch) => vec![RequestComponents::fetch(fetch)],
        StoreRequest::Save(save) => [
            (Operation::Insert, &save.inserted),
            (Operation::Update, &save.updated),
            (Operation::Delete, &save.deleted),
        ]
        .into_iter()
        .filter(|(_, objects)| !objects.is_empty())
        .map(|(operation, objects)| RequestComponents::save(save, operation, objects.clone()))
        .collect(),
    }
}

/// What a transaction needs from its manager.
#[derive(Clone)]
pub struct TransactionContext {
    pub collaborators: Collaborators,
    pub cache: Arc<FulfillmentCache>,
    /// Parent of the transaction's workspace.
    pub workspace: Arc<dyn Workspace>,
    /// Bound on partitions running at once (`None` = unbounded).
    pub partition_concurrency: Option<usize>,
}

#[derive(Clone)]
pub struct Transaction {
    id: TransactionId,
    request: Arc<StoreRequest>,
    group: GroupTask,
    partitions: Vec<Arc<Partition>>,
    workspace: Arc<dyn Workspace>,
}

impl Transaction {
    /// Build the transaction and every partition chain. Nothing runs until
    /// the transaction's task is admitted to a queue and started.
    pub fn new(request: StoreRequest, context: &TransactionContext) -> Self {
        let id = TransactionId::generate();
        let workspace = context.workspace.child();
        let group = GroupTask::new(id.to_string(), context.partition_concurrency);

        let partitions: Vec<Arc<Partition>> = partition_request(&request)
            .into_iter()
            .map(|components| {
                Arc::new(Partition::new(
                    id,
                    components,
                    workspace.child(),
                    context.collaborators.clone(),
                    context.cache.clone(),
                ))
            })
            .collect();
        for partition in &partitions {
            group.add_task(partition.entry_task());
        }

        let commit_to = workspace.clone();
        group
            .task()
            .add_observer(Arc::new(BlockObserver::new().on_finish(move |task, errors| {
                if commit_to.has_changes() {
                    if let Err(error) = commit_to.commit() {
                        warn!(transaction = %task.name(), %error, "transaction workspace commit failed");
                    }
                }
                info!(transaction = %task.name(), errors = errors.len(), "transaction finished");
            })));

        Self {
            id,
            request: Arc::new(request),
            group,
            partitions,
            workspace,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn request(&self) -> &StoreRequest {
        &self.request
    }

    /// The transaction as a schedulable task.
    pub fn task(&self) -> &Task {
        self.group.task()
    }

    pub fn group(&self) -> &GroupTask {
        &self.group
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.workspace
    }

    pub fn cancel(&self) {
        self.group.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task().is_finished()
    }

    /// Combined errors of every partition, once the transaction finished.
    pub async fn wait(&self) -> Vec<TaskError> {
        self.group.wait().await
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("task", self.task())
            .field("partitions", &self.partitions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FetchSignature, FulfillmentStatus};
    use crate::domain::{
        EntityDescription, FetchRequest, ManagedObject, Method, ObjectId, PayloadKind, Predicate,
        SaveRequest, TaskState,
    };
    use crate::impls::{
        InMemoryWorkspace, JsonDecoder, MetadataTtlPolicy, StaticTransport, TemplateRequestBuilder,
    };
    use crate::ports::{Clock, CommitError, FixedClock};
    use crate::queue::TaskQueue;
    use chrono::{Duration, TimeZone, Utc};
    use parking_lot::Mutex;
    use url::Url;

    const WIDGET_1: &str = "https://store.test/api/widget?id=1";

    struct Fixture {
        transport: Arc<StaticTransport>,
        root: Arc<InMemoryWorkspace>,
        clock: Arc<FixedClock>,
        context: TransactionContext,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(StaticTransport::new());
        let root = Arc::new(InMemoryWorkspace::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let base = Url::parse("https://store.test/api/").unwrap();
        let collaborators = Collaborators {
            clock: clock.clone(),
            transport: transport.clone(),
            decoder: Arc::new(JsonDecoder),
            request_builder: Arc::new(TemplateRequestBuilder::new(base)),
            ttl: Arc::new(MetadataTtlPolicy::new(Duration::zero())),
        };
        let context = TransactionContext {
            collaborators,
            cache: Arc::new(FulfillmentCache::new()),
            workspace: root.clone(),
            partition_concurrency: None,
        };
        Fixture {
            transport,
            root,
            clock,
            context,
        }
    }

    fn widget() -> EntityDescription {
        EntityDescription::new("Widget").with_metadata("timeToLive", "60")
    }

    fn fetch_widget() -> StoreRequest {
        FetchRequest::new(widget())
            .predicate(Predicate::eq("id", "1"))
            .into()
    }

    /// Rejects objects carrying an `invalid` field, naming them.
    fn reject_invalid(objects: &[ManagedObject]) -> Result<(), CommitError> {
        let bad: Vec<ObjectId> = objects
            .iter()
            .filter(|o| o.fields.contains_key("invalid"))
            .map(|o| o.id.clone())
            .collect();
        if bad.is_empty() {
            Ok(())
        } else {
            Err(CommitError::new("invalid objects", bad))
        }
    }

    async fn run(transaction: &Transaction) -> Vec<TaskError> {
        let queue = TaskQueue::new("test", Some(1));
        queue.add_task(transaction.task().clone());
        transaction.wait().await
    }

    #[tokio::test]
    async fn fetch_builds_one_chain_of_four_stages() {
        let fx = fixture();
        let transaction = Transaction::new(fetch_widget(), &fx.context);
        assert_eq!(transaction.partitions().len(), 1);

        let partition = &transaction.partitions()[0];
        let stages: Vec<Task> = Stage::ALL
            .iter()
            .map(|stage| partition.stage(*stage).unwrap())
            .collect();

        let mut edges = 0;
        for (i, stage) in stages.iter().enumerate() {
            assert_eq!(stage.state(), TaskState::Pending);
            let deps: Vec<Task> = stage
                .dependencies()
                .into_iter()
                .filter(|t| !transaction.group().is_sentinel(t))
                .collect();
            if i == 0 {
                assert!(deps.is_empty());
            } else {
                assert_eq!(deps, vec![stages[i - 1].clone()]);
            }
            edges += deps.len();
        }
        assert_eq!(edges, 3);
        assert_eq!(transaction.group().children().len(), 4);
    }

    #[tokio::test]
    async fn widget_fetch_runs_every_stage_and_fulfills() {
        let fx = fixture();
        fx.transport.respond(
            WIDGET_1,
            br#"[{"id": "w-1", "name": "gear"}]"#.to_vec(),
        );
        let transaction = Transaction::new(fetch_widget(), &fx.context);
        let signature = FetchSignature::new("Widget", "id=1");

        let queue = TaskQueue::new("test", Some(1));
        queue.add_task(transaction.task().clone());
        let partition = transaction.partitions()[0].clone();
        let validate = partition.stage(Stage::Validate).unwrap();
        validate.wait().await;
        assert!(fx.context.cache.get(&signature).is_some());

        assert!(transaction.wait().await.is_empty());
        assert_eq!(fx.transport.calls(), 1);

        let progress = partition.progress();
        assert!(progress.validated && progress.constructed);
        assert!(progress.data_retrieved && progress.committed);

        let entry = fx.context.cache.get(&signature).unwrap();
        assert_eq!(entry.status, FulfillmentStatus::Fulfilled);
        assert_eq!(entry.expires_at, fx.clock.now() + Duration::seconds(60));
        assert!(fx.root.get(&ObjectId::new("w-1")).is_some());
    }

    #[tokio::test]
    async fn duplicate_fetch_while_pending_short_circuits() {
        let fx = fixture();
        fx.transport.respond(WIDGET_1, b"[]".to_vec());
        let gate = fx.transport.hold();

        let first = Transaction::new(fetch_widget(), &fx.context);
        let second = Transaction::new(fetch_widget(), &fx.context);
        let queue = TaskQueue::new("test", None);
        queue.add_task(first.task().clone());
        fx.transport.wait_for_calls(1).await;
        queue.add_task(second.task().clone());

        assert!(second.wait().await.is_empty());
        let progress = second.partitions()[0].progress();
        assert!(!progress.validated);
        assert!(!progress.constructed);
        assert_eq!(fx.transport.calls(), 1);

        gate.release();
        assert!(first.wait().await.is_empty());
        assert_eq!(fx.transport.calls(), 1);
    }

    #[tokio::test]
    async fn separators_in_predicate_values_make_a_distinct_fetch() {
        let fx = fixture();
        fx.transport.respond("https://store.test/api/widget?a=1&b=2", b"[]".to_vec());
        fx.transport.respond("https://store.test/api/widget?a=1%26b%3D2", b"[]".to_vec());
        let gate = fx.transport.hold();

        let split = FetchRequest::new(widget()).predicate(Predicate::eq("a", "1").and("b", "2"));
        let joined = FetchRequest::new(widget()).predicate(Predicate::eq("a", "1&b=2"));
        let first = Transaction::new(split.into(), &fx.context);
        let second = Transaction::new(joined.into(), &fx.context);
        let queue = TaskQueue::new("test", None);
        queue.add_task(first.task().clone());
        fx.transport.wait_for_calls(1).await;
        queue.add_task(second.task().clone());
        fx.transport.wait_for_calls(2).await;

        assert!(second.partitions()[0].progress().validated);
        gate.release();
        assert!(first.wait().await.is_empty());
        assert!(second.wait().await.is_empty());
        assert_eq!(fx.transport.calls(), 2);
        assert_eq!(fx.context.cache.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_fetch_keeps_its_claim_until_the_request_returns() {
        let fx = fixture();
        fx.transport.respond(WIDGET_1, br#"[{"id": "w-1"}]"#.to_vec());
        let signature = FetchSignature::new("Widget", "id=1");
        let gate = fx.transport.hold();

        let first = Transaction::new(fetch_widget(), &fx.context);
        let queue = TaskQueue::new("test", None);
        queue.add_task(first.task().clone());
        fx.transport.wait_for_calls(1).await;

        first.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        let data = first.partitions()[0].stage(Stage::ConditionData).unwrap();
        assert!(!data.is_finished());
        assert_eq!(
            fx.context.cache.get(&signature).unwrap().status,
            FulfillmentStatus::Pending
        );

        let second = Transaction::new(fetch_widget(), &fx.context);
        queue.add_task(second.task().clone());
        assert!(second.wait().await.is_empty());
        assert!(!second.partitions()[0].progress().validated);
        assert_eq!(fx.transport.calls(), 1);

        gate.release();
        assert!(first.wait().await.is_empty());
        assert!(fx.context.cache.is_empty());
        assert!(fx.root.get(&ObjectId::new("w-1")).is_none());
    }

    #[tokio::test]
    async fn short_circuited_stages_finish_after_validate() {
        let fx = fixture();
        fx.transport.respond(WIDGET_1, b"[]".to_vec());
        let first = Transaction::new(fetch_widget(), &fx.context);
        assert!(run(&first).await.is_empty());

        let second = Transaction::new(fetch_widget(), &fx.context);
        let partition = second.partitions()[0].clone();
        let validate = partition.stage(Stage::Validate).unwrap().downgrade();
        let order = Arc::new(Mutex::new(Vec::new()));
        for stage in Stage::ALL {
            let order = order.clone();
            let validate = validate.clone();
            partition
                .stage(stage)
                .unwrap()
                .add_observer(Arc::new(BlockObserver::new().on_finish(move |_, _| {
                    let validate_finished = validate.upgrade().map_or(true, |v| v.is_finished());
                    order.lock().push((stage, validate_finished));
                })));
        }

        assert!(run(&second).await.is_empty());
        assert_eq!(fx.transport.calls(), 1);
        let order = order.lock().clone();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], (Stage::Validate, false));
        for (stage, validate_finished) in &order[1..] {
            assert!(*validate_finished, "{stage} finished before validate");
        }
    }

    #[tokio::test]
    async fn transport_failure_ends_the_chain_and_releases_the_claim() {
        let fx = fixture();
        let transaction = Transaction::new(fetch_widget(), &fx.context);

        let errors = run(&transaction).await;

        assert!(matches!(errors[0], TaskError::TransportFailure(_)));
        assert_eq!(errors[1], TaskError::condition_failed("RequestData"));
        assert!(fx.context.cache.is_empty());
    }

    #[tokio::test]
    async fn missing_entity_is_reported() {
        let fx = fixture();
        let transaction = Transaction::new(FetchRequest::default().into(), &fx.context);

        let errors = run(&transaction).await;

        assert_eq!(
            errors[0],
            TaskError::MissingRequestComponent(crate::domain::RequestComponent::Entity)
        );
        assert_eq!(fx.transport.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_payload_is_reported() {
        let fx = fixture();
        fx.transport.respond(WIDGET_1, b"...".to_vec());
        let request = FetchRequest::new(widget())
            .predicate(Predicate::eq("id", "1"))
            .payload(PayloadKind::Other("video".into()));
        let transaction = Transaction::new(request.into(), &fx.context);

        let errors = run(&transaction).await;
        assert_eq!(errors, vec![TaskError::UnsupportedPayloadType("video".into())]);
    }

    #[tokio::test]
    async fn save_with_inserts_and_updates_builds_two_chains() {
        let fx = fixture();
        fx.transport.respond("https://store.test/api/widget", br#"{"id": "w-2"}"#.to_vec());
        fx.transport.respond("https://store.test/api/widget/w-1", br#"{"id": "w-1"}"#.to_vec());
        let save = SaveRequest::new(widget())
            .insert(ManagedObject::new("w-2", "Widget"))
            .update(ManagedObject::new("w-1", "Widget"));
        let transaction = Transaction::new(save.into(), &fx.context);

        let operations: Vec<Operation> =
            transaction.partitions().iter().map(|p| p.operation()).collect();
        assert_eq!(operations, vec![Operation::Insert, Operation::Update]);
        assert!(!transaction.partitions()[0].workspace().has_changes());

        assert!(run(&transaction).await.is_empty());
        assert_eq!(fx.transport.calls(), 2);
        assert!(fx.context.cache.is_empty());
        assert!(fx.root.get(&ObjectId::new("w-1")).is_some());
        assert!(fx.root.get(&ObjectId::new("w-2")).is_some());
    }

    #[tokio::test]
    async fn commit_failure_is_repaired_once() {
        let fx = fixture();
        fx.transport.respond(
            WIDGET_1,
            br#"[{"id": "ok"}, {"id": "bad", "invalid": true}]"#.to_vec(),
        );
        fx.root.set_validator(reject_invalid);
        let transaction = Transaction::new(fetch_widget(), &fx.context);

        assert!(run(&transaction).await.is_empty());
        assert!(fx.root.get(&ObjectId::new("ok")).is_some());
        assert!(fx.root.get(&ObjectId::new("bad")).is_none());
    }

    #[tokio::test]
    async fn save_repairs_one_partition_and_leaves_the_other_alone() {
        let fx = fixture();
        fx.transport.respond("https://store.test/api/widget", br#"{"id": "n-1"}"#.to_vec());
        fx.transport.respond(
            "https://store.test/api/widget/w-1",
            br#"{"id": "w-1", "invalid": true}"#.to_vec(),
        );
        fx.root.set_validator(reject_invalid);
        let save = SaveRequest::new(widget())
            .insert(ManagedObject::new("n-1", "Widget"))
            .update(ManagedObject::new("w-1", "Widget"));
        let transaction = Transaction::new(save.into(), &fx.context);

        assert!(run(&transaction).await.is_empty());
        assert_eq!(fx.transport.calls(), 2);
        for partition in transaction.partitions() {
            assert!(partition.progress().committed, "{partition:?}");
        }
        assert!(transaction.partitions()[0].progress().dirty);
        assert!(fx.root.get(&ObjectId::new("n-1")).is_some());
        assert!(fx.root.get(&ObjectId::new("w-1")).is_none());
    }

    #[tokio::test]
    async fn delete_removes_only_the_addressed_object() {
        let fx = fixture();
        fx.root.write(ManagedObject::new("w-1", "Widget"));
        fx.root.write(ManagedObject::new("w-2", "Widget"));
        fx.root.commit().unwrap();
        fx.transport.respond("https://store.test/api/widget/w-1", Vec::new());
        let save = SaveRequest::new(widget())
            .delete(ManagedObject::new("w-1", "Widget"))
            .delete(ManagedObject::new("w-2", "Widget"));
        let transaction = Transaction::new(save.into(), &fx.context);

        let errors = run(&transaction).await;

        assert_eq!(
            errors,
            vec![TaskError::Unaddressed {
                objects: vec![ObjectId::new("w-2")]
            }]
        );
        assert_eq!(
            fx.transport.requests(),
            vec![(Method::Delete, "https://store.test/api/widget/w-1".to_string())]
        );
        assert!(fx.root.get(&ObjectId::new("w-1")).is_none());
        assert!(fx.root.get(&ObjectId::new("w-2")).is_some());
    }

    #[tokio::test]
    async fn commit_failure_without_offenders_is_surfaced() {
        let fx = fixture();
        fx.transport.respond(
            WIDGET_1,
            br#"[{"id": "w-1"}]"#.to_vec(),
        );
        fx.root
            .set_validator(|_| Err(CommitError::new("store is read-only", Vec::new())));
        let transaction = Transaction::new(fetch_widget(), &fx.context);

        let errors = run(&transaction).await;
        assert_eq!(errors, vec![TaskError::CommitFailure { affected: vec![] }]);
        assert!(fx.context.cache.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_start_finishes_everything_cleanly() {
        let fx = fixture();
        let transaction = Transaction::new(fetch_widget(), &fx.context);
        let stages: Vec<Task> = Stage::ALL
            .iter()
            .filter_map(|stage| transaction.partitions()[0].stage(*stage))
            .collect();

        transaction.cancel();
        let errors = run(&transaction).await;

        assert!(errors.is_empty());
        assert!(transaction.is_finished());
        for stage in stages {
            assert!(stage.is_finished());
        }
        assert_eq!(fx.transport.calls(), 0);
    }

    #[test]
    fn empty_save_has_no_partitions() {
        let request: StoreRequest = SaveRequest::new(widget()).into();
        assert!(partition_request(&request).is_empty());
    }

    #[test]
    fn save_partitions_follow_object_kinds() {
        let request: StoreRequest = SaveRequest::new(widget())
            .update(ManagedObject::new("a", "Widget"))
            .delete(ManagedObject::new("b", "Widget"))
            .into();
        let parts = partition_request(&request);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].operation, Operation::Update);
        assert_eq!(parts[1].operation, Operation::Delete);
        assert_eq!(parts[1].objects[0].id, ObjectId::new("b"));
    }
}
