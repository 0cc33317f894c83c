//! Running-task registry: every popped task that has not finished yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::task::Task;

#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl TaskRegistry {
    /// Registers a task. Returns false if the id is already present.
    pub(crate) fn insert(&self, task: Arc<Task>) -> bool {
        let mut tasks = self.tasks.lock().expect("lock not poisoned");
        if tasks.contains_key(task.id()) {
            return false;
        }
        tasks.insert(task.id().to_string(), task);
        true
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().expect("lock not poisoned").remove(id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().expect("lock not poisoned").get(id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().expect("lock not poisoned").len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits tasks under the registry lock until `visit` returns false.
    ///
    /// `visit` must not call [`Task::cancel`]: cancel removes the task from
    /// this registry and would deadlock on the lock held here.
    pub(crate) fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Task) -> bool,
    {
        let tasks = self.tasks.lock().expect("lock not poisoned");
        for task in tasks.values() {
            if !visit(task) {
                break;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<String> {
        self.tasks
            .lock()
            .expect("lock not poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
