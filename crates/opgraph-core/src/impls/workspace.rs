//! InMemoryWorkspace - メモリ上のスコープ付き書き込み領域
//!
//! A root keeps its committed objects in memory. Children stage changes and
//! commit them into their parent's staging area. All workspaces derived from
//! one root share the root's commit validator.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::domain::{ManagedObject, ObjectId};
use crate::ports::{CommitError, Workspace};

type Validator = dyn Fn(&[ManagedObject]) -> Result<(), CommitError> + Send + Sync;

#[derive(Debug, Clone)]
enum Change {
    Write(ManagedObject),
    Remove,
}

struct Node {
    parent: Option<Arc<Node>>,
    staged: Mutex<BTreeMap<ObjectId, Change>>,
    /// Only used by the root.
    committed: Mutex<BTreeMap<ObjectId, ManagedObject>>,
    validator: Arc<RwLock<Option<Arc<Validator>>>>,
}

impl Node {
    fn get(&self, id: &ObjectId) -> Option<ManagedObject> {
        match self.staged.lock().get(id) {
            Some(Change::Write(object)) => return Some(object.clone()),
            Some(Change::Remove) => return None,
            None => {}
        }
        match &self.parent {
            Some(parent) => parent.get(id),
            None => self.committed.lock().get(id).cloned(),
        }
    }

    fn stage(&self, id: ObjectId, change: Change) {
        self.staged.lock().insert(id, change);
    }
}

/// Workspace backed by in-process maps.
#[derive(Clone)]
pub struct InMemoryWorkspace {
    node: Arc<Node>,
}

impl InMemoryWorkspace {
    /// A new root workspace.
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                staged: Mutex::new(BTreeMap::new()),
                committed: Mutex::new(BTreeMap::new()),
                validator: Arc::new(RwLock::new(None)),
            }),
        }
    }

    /// Install a check run on the objects written by every commit in this
    /// workspace family.
    pub fn set_validator(
        &self,
        validator: impl Fn(&[ManagedObject]) -> Result<(), CommitError> + Send + Sync + 'static,
    ) {
        *self.node.validator.write() = Some(Arc::new(validator));
    }

    /// Every visible object, staged changes applied.
    pub fn objects(&self) -> Vec<ManagedObject> {
        let mut visible = match &self.node.parent {
            Some(_) => BTreeMap::new(),
            None => self.node.committed.lock().clone(),
        };
        for (id, change) in self.node.staged.lock().iter() {
            match change {
                Change::Write(object) => {
                    visible.insert(id.clone(), object.clone());
                }
                Change::Remove => {
                    visible.remove(id);
                }
            }
        }
        visible.into_values().collect()
    }
}

impl Default for InMemoryWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace for InMemoryWorkspace {
    fn child(&self) -> Arc<dyn Workspace> {
        Arc::new(Self {
            node: Arc::new(Node {
                parent: Some(self.node.clone()),
                staged: Mutex::new(BTreeMap::new()),
                committed: Mutex::new(BTreeMap::new()),
                validator: self.node.validator.clone(),
            }),
        })
    }

    fn write(&self, object: ManagedObject) {
        self.node.stage(object.id.clone(), Change::Write(object));
    }

    fn remove(&self, id: &ObjectId) {
        self.node.stage(id.clone(), Change::Remove);
    }

    fn get(&self, id: &ObjectId) -> Option<ManagedObject> {
        self.node.get(id)
    }

    fn has_changes(&self) -> bool {
        !self.node.staged.lock().is_empty()
    }

    fn commit(&self) -> Result<(), CommitError> {
        let mut staged = self.node.staged.lock();
        if staged.is_empty() {
            return Ok(());
        }

        let written: Vec<ManagedObject> = staged
            .values()
            .filter_map(|change| match change {
                Change::Write(object) => Some(object.clone()),
                Change::Remove => None,
            })
            .collect();
        let validator = self.node.validator.read().clone();
        if let Some(validator) = validator {
            validator(&written)?;
        }

        let changes = std::mem::take(&mut *staged);
        drop(staged);
        debug!(changes = changes.len(), root = self.node.parent.is_none(), "workspace committed");
        match &self.node.parent {
            Some(parent) => {
                for (id, change) in changes {
                    parent.stage(id, change);
                }
            }
            None => {
                let mut committed = self.node.committed.lock();
                for (id, change) in changes {
                    match change {
                        Change::Write(object) => {
                            committed.insert(id, object);
                        }
                        Change::Remove => {
                            committed.remove(&id);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn discard(&self, ids: &[ObjectId]) {
        let mut staged = self.node.staged.lock();
        for id in ids {
            staged.remove(id);
        }
    }

    fn reset(&self) {
        self.node.staged.lock().clear();
    }
}

impl std::fmt::Debug for InMemoryWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWorkspace")
            .field("root", &self.node.parent.is_none())
            .field("staged", &self.node.staged.lock().len())
            .finish()
    }
}
