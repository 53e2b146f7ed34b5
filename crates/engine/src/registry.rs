//! Arena of live transfer tasks.
//!
//! Tasks are addressed by their stable [`TransferId`], with a
//! secondary index from OS handle id to task for callback routing.
//! All mutation goes through methods on one mutex-guarded inner — no
//! shared maps are touched directly from callback contexts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stowage_protocol::{HandleId, TransferId};

use crate::task::TransferTask;

/// Thread-safe registry of live tasks and their handle bindings.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<TransferId, Arc<TransferTask>>,
    by_handle: HashMap<HandleId, TransferId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task to the arena.
    pub fn register(&self, task: Arc<TransferTask>) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.id().clone(), task);
    }

    /// Removes a task and any handle bindings pointing at it.
    pub fn remove(&self, id: &TransferId) -> Option<Arc<TransferTask>> {
        let mut inner = self.inner.lock().unwrap();
        inner.by_handle.retain(|_, task_id| task_id != id);
        inner.tasks.remove(id)
    }

    /// Routes a handle id to a task.
    pub fn bind_handle(&self, handle: HandleId, id: &TransferId) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_handle.insert(handle, id.clone());
    }

    /// Drops a handle binding (the task itself stays registered).
    pub fn unbind_handle(&self, handle: HandleId) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_handle.remove(&handle);
    }

    pub fn get(&self, id: &TransferId) -> Option<Arc<TransferTask>> {
        let inner = self.inner.lock().unwrap();
        inner.tasks.get(id).cloned()
    }

    /// Finds the task last bound to `handle`.
    pub fn task_for_handle(&self, handle: HandleId) -> Option<Arc<TransferTask>> {
        let inner = self.inner.lock().unwrap();
        let id = inner.by_handle.get(&handle)?;
        inner.tasks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
