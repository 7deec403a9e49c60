//! Snapshot views for logging and inspection.

use serde::{Deserialize, Serialize};

use crate::domain::TaskState;

/// Tasks held by a queue, by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub evaluating: usize,
    pub ready: usize,
    pub executing: usize,
    pub finishing: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn record(&mut self, state: TaskState, cancelled: bool) {
        match state {
            TaskState::Initialized | TaskState::Pending => self.pending += 1,
            TaskState::EvaluatingConditions => self.evaluating += 1,
            TaskState::Ready => self.ready += 1,
            TaskState::Executing => self.executing += 1,
            TaskState::Finishing | TaskState::Finished => self.finishing += 1,
        }
        if cancelled {
            self.cancelled += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.evaluating + self.ready + self.executing + self.finishing
    }
}

/// Transaction counters kept by the graph manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub submitted: u64,
    pub finished: u64,
    pub failed: u64,
}

impl ManagerStats {
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.finished)
    }
}
