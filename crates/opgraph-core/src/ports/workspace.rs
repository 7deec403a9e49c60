//! Workspace port - スコープ付きの書き込み領域
//!
//! A workspace buffers writes until `commit`, which pushes them into the
//! parent (or into the store, for a root workspace). The manager owns the
//! root; each transaction works in a child, and each partition in a child
//! of the transaction's workspace.

use std::sync::Arc;

use thiserror::Error;

use crate::domain::{ManagedObject, ObjectId};

/// A commit was rejected.
///
/// `affected` lists the written objects that caused the rejection; an empty
/// list means the failure is not attributable to particular objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("commit rejected ({reason}); {} object(s) affected", affected.len())]
pub struct CommitError {
    pub affected: Vec<ObjectId>,
    pub reason: String,
}

impl CommitError {
    pub fn new(reason: impl Into<String>, affected: Vec<ObjectId>) -> Self {
        Self {
            affected,
            reason: reason.into(),
        }
    }

    /// Can a repair pass drop the offenders and try again?
    pub fn is_repairable(&self) -> bool {
        !self.affected.is_empty()
    }
}

/// Workspace は変更をまとめてコミットする単位
pub trait Workspace: Send + Sync {
    /// Derive a child whose commits land in `self`.
    fn child(&self) -> Arc<dyn Workspace>;

    /// Stage an insert or replacement.
    fn write(&self, object: ManagedObject);

    /// Stage a removal.
    fn remove(&self, id: &ObjectId);

    /// Look an object up, seeing staged changes first.
    fn get(&self, id: &ObjectId) -> Option<ManagedObject>;

    fn has_changes(&self) -> bool;

    /// Validate staged changes and push them to the parent.
    fn commit(&self) -> Result<(), CommitError>;

    /// Drop staged changes for the given objects only.
    fn discard(&self, ids: &[ObjectId]);

    /// Drop every staged change.
    fn reset(&self);
}
