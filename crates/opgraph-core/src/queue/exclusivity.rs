//! ExclusivityController - 相互排他カテゴリの直列化
//!
//! Every task gated by a mutually exclusive condition is chained behind the
//! previous task of the same category, so at most one of them executes at a
//! time across all queues in the process.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::task::Task;

#[derive(Default)]
pub struct ExclusivityController {
    categories: Mutex<HashMap<String, Vec<Task>>>,
}

static SHARED: OnceLock<ExclusivityController> = OnceLock::new();

impl ExclusivityController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide controller used by every `TaskQueue`.
    pub fn shared() -> &'static ExclusivityController {
        SHARED.get_or_init(ExclusivityController::new)
    }

    /// Make `task` wait for the last registered task of each category.
    pub fn add(&self, task: &Task, categories: &[String]) {
        let mut map = self.categories.lock();
        for category in categories {
            let chain = map.entry(category.clone()).or_default();
            if let Some(last) = chain.last() {
                task.add_dependency(last);
            }
            chain.push(task.clone());
        }
    }

    pub fn remove(&self, task: &Task, categories: &[String]) {
        let mut map = self.categories.lock();
        for category in categories {
            if let Some(chain) = map.get_mut(category) {
                chain.retain(|t| t != task);
                if chain.is_empty() {
                    map.remove(category);
                }
            }
        }
    }

    pub fn len(&self, category: &str) -> usize {
        self.categories
            .lock()
            .get(category)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
