//! Partition - 1 つのサブリクエストの 4 段チェーン
//!
//! Only the last stage (ConditionData) is handed to the transaction's
//! queue. Admitting it asks its condition for a dependency, which creates
//! FetchBytes, whose condition creates Construct, whose condition creates
//! Validate. Each condition also checks the success flag the prior stage
//! left in `PartitionProgress`.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;

use crate::cache::{FetchSignature, FulfillmentCache};
use crate::domain::{
    Operation, PartitionId, RequestComponents, RequestDescriptor, TransactionId,
};
use crate::ports::{Collaborators, Workspace};
use crate::task::{Condition, ConditionResult, Task, WeakTask};

use super::stages::{ConditionDataWork, ConstructWork, FetchBytesWork, ValidateWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Validate,
    Construct,
    FetchBytes,
    ConditionData,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Validate,
        Stage::Construct,
        Stage::FetchBytes,
        Stage::ConditionData,
    ];

    /// The stage this one depends on.
    pub fn prior(self) -> Option<Stage> {
        match self {
            Stage::Validate => None,
            Stage::Construct => Some(Stage::Validate),
            Stage::FetchBytes => Some(Stage::Construct),
            Stage::ConditionData => Some(Stage::FetchBytes),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::Construct => "construct",
            Stage::FetchBytes => "fetch-bytes",
            Stage::ConditionData => "condition-data",
        };
        f.write_str(s)
    }
}

/// What each stage has accomplished so far.
#[derive(Debug, Clone, Default)]
pub struct PartitionProgress {
    /// Validate: the request may go to the network.
    pub validated: bool,
    /// Pending cache entry claimed by Validate, until ConditionData settles it.
    pub claimed: Option<FetchSignature>,
    /// Construct: a descriptor was built.
    pub constructed: bool,
    pub descriptor: Option<RequestDescriptor>,
    /// FetchBytes: the transport answered.
    pub data_retrieved: bool,
    pub bytes: Option<Vec<u8>>,
    /// ConditionData: the workspace received changes.
    pub dirty: bool,
    /// ConditionData: changes were committed.
    pub committed: bool,
}

pub struct Partition {
    id: PartitionId,
    transaction: TransactionId,
    components: RequestComponents,
    workspace: Arc<dyn Workspace>,
    collaborators: Collaborators,
    cache: Arc<FulfillmentCache>,
    progress: Mutex<PartitionProgress>,
    stages: Mutex<[Option<WeakTask>; 4]>,
}

impl Partition {
    pub fn new(
        transaction: TransactionId,
        components: RequestComponents,
        workspace: Arc<dyn Workspace>,
        collaborators: Collaborators,
        cache: Arc<FulfillmentCache>,
    ) -> Self {
        Self {
            id: PartitionId::generate(),
            transaction,
            components,
            workspace,
            collaborators,
            cache,
            progress: Mutex::new(PartitionProgress::default()),
            stages: Mutex::new([None, None, None, None]),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// The owning transaction (lookup only).
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn operation(&self) -> Operation {
        self.components.operation
    }

    pub fn components(&self) -> &RequestComponents {
        &self.components
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.workspace
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub(crate) fn cache(&self) -> &FulfillmentCache {
        &self.cache
    }

    pub fn progress(&self) -> PartitionProgress {
        self.progress.lock().clone()
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut PartitionProgress) -> R) -> R {
        f(&mut self.progress.lock())
    }

    /// Freshness window for this partition's entity.
    pub(crate) fn ttl(&self) -> Duration {
        self.components
            .entity
            .as_ref()
            .map(|entity| self.collaborators.ttl.ttl_for(entity))
            .unwrap_or_else(Duration::zero)
    }

    /// The stage task, once it has been created and while it is alive.
    pub fn stage(&self, stage: Stage) -> Option<Task> {
        self.stages.lock()[stage.index()]
            .as_ref()
            .and_then(WeakTask::upgrade)
    }

    /// Build the last stage; admitting it to a queue builds the rest.
    pub fn entry_task(self: &Arc<Self>) -> Task {
        self.create_stage(Stage::ConditionData)
    }

    fn create_stage(self: &Arc<Self>, stage: Stage) -> Task {
        let name = format!("{}/{}/{}", self.transaction, self.components.operation, stage);
        let mut builder = Task::builder(name);
        if let Some(prior) = stage.prior() {
            builder = builder.condition(StageCondition::new(self.clone(), prior));
        }
        let partition = self.clone();
        let task = match stage {
            Stage::Validate => builder.build(ValidateWork::new(partition)),
            Stage::Construct => builder.build(ConstructWork::new(partition)),
            Stage::FetchBytes => builder.build(FetchBytesWork::new(partition)),
            Stage::ConditionData => builder.build(ConditionDataWork::new(partition)),
        };
        self.stages.lock()[stage.index()] = Some(task.downgrade());
        task
    }

    /// Cancel every stage after `stage` (a short-circuited chain).
    pub(crate) fn cancel_after(&self, stage: Stage) {
        for later in Stage::ALL.into_iter().filter(|s| *s > stage) {
            if let Some(task) = self.stage(later) {
                task.cancel();
            }
        }
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("transaction", &self.transaction)
            .field("operation", &self.components.operation)
            .field("progress", &self.progress())
            .finish()
    }
}

/// Gate between two stages of one partition.
///
/// Creates the prior stage as a dependency the first time it is asked, and
/// is satisfied only if that stage recorded success.
pub struct StageCondition {
    name: &'static str,
    prior: Stage,
    partition: Arc<Partition>,
    created: OnceLock<()>,
}

impl StageCondition {
    pub fn new(partition: Arc<Partition>, prior: Stage) -> Self {
        let name = match prior {
            Stage::Validate => "RequestValidation",
            Stage::Construct => "RequestConstruction",
            Stage::FetchBytes | Stage::ConditionData => "RequestData",
        };
        Self {
            name,
            prior,
            partition,
            created: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Condition for StageCondition {
    fn name(&self) -> &str {
        self.name
    }

    fn dependency_for(&self, _task: &Task) -> Option<Task> {
        self.created.set(()).ok()?;
        Some(self.partition.create_stage(self.prior))
    }

    async fn evaluate(&self, _task: &Task) -> ConditionResult {
        let progress = self.partition.progress.lock();
        let satisfied = match self.prior {
            Stage::Validate => progress.validated,
            Stage::Construct => progress.constructed,
            Stage::FetchBytes => progress.data_retrieved,
            Stage::ConditionData => progress.committed,
        };
        ConditionResult::from_bool(satisfied)
    }
}
