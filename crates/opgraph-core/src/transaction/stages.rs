//! The four stage works of a partition chain.
//!
//! Every stage records failures as `TaskError`s on its own task and
//! finishes; nothing is returned across the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{FetchSignature, Validation};
use crate::domain::{ObjectId, Operation, TaskError};
use crate::ports::Workspace;
use crate::task::{Task, Work};

use super::partition::{Partition, Stage};

/// Decides whether the request needs to go to the network at all.
pub struct ValidateWork {
    partition: Arc<Partition>,
}

impl ValidateWork {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl Work for ValidateWork {
    async fn execute(&self, task: &Task) {
        let partition = &self.partition;
        let signature = match partition.operation() {
            Operation::Fetch => FetchSignature::of(partition.components()),
            // Saves always go out.
            _ => None,
        };

        let validated = match signature {
            Some(signature) => {
                let now = partition.collaborators().clock.now();
                let validation = partition.cache().validate(&signature, partition.ttl(), now);
                debug!(partition = %partition.id(), %signature, ?validation, "request validated");
                if validation.should_fetch() {
                    partition.update(|p| p.claimed = Some(signature));
                }
                validation == Validation::Proceed
            }
            None => true,
        };

        partition.update(|p| p.validated = validated);
        task.finish(Vec::new());
    }

    // Later stages are cancelled while this one is finishing; they drain
    // once it has reached `Finished`.
    fn finished(&self, _task: &Task, _errors: &[TaskError]) {
        if !self.partition.progress().validated {
            self.partition.cancel_after(Stage::Validate);
        }
    }
}

/// Resolves the partition's components into a request descriptor.
pub struct ConstructWork {
    partition: Arc<Partition>,
}

impl ConstructWork {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl Work for ConstructWork {
    async fn execute(&self, task: &Task) {
        let partition = &self.partition;
        let built = partition
            .collaborators()
            .request_builder
            .build(partition.components());
        match built {
            Ok(descriptor) => {
                debug!(partition = %partition.id(), method = %descriptor.method, url = %descriptor.url, "request constructed");
                partition.update(|p| {
                    p.descriptor = Some(descriptor);
                    p.constructed = true;
                });
                task.finish(Vec::new());
            }
            Err(error) => {
                warn!(partition = %partition.id(), %error, "request construction failed");
                task.finish(vec![error]);
            }
        }
    }
}

/// Sends the request. No retries.
pub struct FetchBytesWork {
    partition: Arc<Partition>,
}

impl FetchBytesWork {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl Work for FetchBytesWork {
    async fn execute(&self, task: &Task) {
        let partition = &self.partition;
        let Some(descriptor) = partition.progress().descriptor else {
            task.finish(vec![TaskError::Other("no request descriptor".into())]);
            return;
        };

        match partition.collaborators().transport.send(&descriptor).await {
            Ok(bytes) => {
                debug!(partition = %partition.id(), bytes = bytes.len(), "data retrieved");
                partition.update(|p| {
                    p.bytes = Some(bytes);
                    p.data_retrieved = true;
                });
                task.finish(Vec::new());
            }
            Err(error) => {
                warn!(partition = %partition.id(), url = %descriptor.url, %error, "transport failure");
                task.finish(vec![TaskError::TransportFailure(error.to_string())]);
            }
        }
    }
}

/// Decodes the response into the partition workspace and commits it.
pub struct ConditionDataWork {
    partition: Arc<Partition>,
}

impl ConditionDataWork {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }

    fn apply(&self) -> Result<(), TaskError> {
        let partition = &self.partition;
        let progress = partition.progress();
        let workspace = partition.workspace();

        let objects = &partition.components().objects;
        // Updates and deletes address the first object only.
        let unaddressed: Vec<ObjectId> = match partition.operation() {
            Operation::Update | Operation::Delete => {
                objects.iter().skip(1).map(|o| o.id.clone()).collect()
            }
            _ => Vec::new(),
        };

        match partition.operation() {
            Operation::Delete => {
                if let Some(object) = objects.first() {
                    workspace.remove(&object.id);
                }
            }
            _ => {
                let (Some(bytes), Some(descriptor)) = (&progress.bytes, &progress.descriptor)
                else {
                    return Err(TaskError::Other("no data to condition".into()));
                };
                let written = partition
                    .collaborators()
                    .decoder
                    .decode(bytes, descriptor, workspace.as_ref())?;
                debug!(partition = %partition.id(), objects = written.len(), "payload decoded");
            }
        }

        partition.update(|p| p.dirty = workspace.has_changes());
        commit_with_repair(workspace.as_ref(), partition)?;
        partition.update(|p| p.committed = true);

        if !unaddressed.is_empty() {
            warn!(partition = %partition.id(), count = unaddressed.len(), "objects left out of the request");
            return Err(TaskError::Unaddressed {
                objects: unaddressed,
            });
        }
        Ok(())
    }
}

/// Commit, and on a failure attributed to particular objects drop those
/// objects and commit once more.
fn commit_with_repair(workspace: &dyn Workspace, partition: &Partition) -> Result<(), TaskError> {
    let error = match workspace.commit() {
        Ok(()) => return Ok(()),
        Err(error) => error,
    };
    if !error.is_repairable() {
        warn!(partition = %partition.id(), %error, "commit failed");
        return Err(TaskError::CommitFailure {
            affected: error.affected,
        });
    }

    warn!(partition = %partition.id(), %error, "commit failed, discarding offending objects");
    workspace.discard(&error.affected);
    workspace.commit().map_err(|error| {
        warn!(partition = %partition.id(), %error, "commit failed after repair");
        TaskError::CommitFailure {
            affected: error.affected,
        }
    })
}

#[async_trait]
impl Work for ConditionDataWork {
    async fn execute(&self, task: &Task) {
        let errors = match self.apply() {
            Ok(()) => Vec::new(),
            Err(error) => vec![error],
        };
        task.finish(errors);
    }

    // The chain ends here whatever happened upstream, and never before
    // FetchBytes has settled: settle the claimed cache entry.
    fn finished(&self, _task: &Task, errors: &[TaskError]) {
        let partition = &self.partition;
        let (claimed, committed) = partition.update(|p| (p.claimed.take(), p.committed));
        let Some(signature) = claimed else {
            return;
        };
        if committed && errors.is_empty() {
            let now = partition.collaborators().clock.now();
            partition
                .cache()
                .fulfill(&signature, partition.ttl(), now);
            debug!(partition = %partition.id(), %signature, "fetch fulfilled");
        } else if partition.cache().release(&signature) {
            debug!(partition = %partition.id(), %signature, "pending fetch released");
        }
    }
}
