//! The dispatcher's `pending`/`inflight` bookkeeping, guarded by one mutex
//! held only for short critical sections (distilled spec §4.3/§5: "the
//! tasks lock guards `pending` and `inflight`"). A `RequestTask` itself is
//! single-owner and moves into the reactor's per-task future; this map
//! holds only what shutdown needs to call `TaskHandler::retry` on whatever
//! never reached a terminal transition.
//!
//! `pending` and `inflight` are two fields of one locked struct rather than
//! two independent mutexes so that `move_to_inflight` is atomic: with
//! separate locks there is a window, between releasing the pending lock and
//! acquiring the inflight lock, where a task belongs to neither map and
//! `is_idle()` observes a spurious idle state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dispatcher_common::task::TaskHandler;

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Arc<dyn TaskHandler>>,
    inflight: HashMap<String, Arc<dyn TaskHandler>>,
}

pub struct TasksState {
    inner: Mutex<Inner>,
}

impl Default for TasksState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl TasksState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&self, task_id: String, handler: Arc<dyn TaskHandler>) {
        self.inner.lock().expect("poisoned mutex").pending.insert(task_id, handler);
    }

    pub fn move_to_inflight(&self, task_id: &str, handler: Arc<dyn TaskHandler>) {
        let mut inner = self.inner.lock().expect("poisoned mutex");
        inner.pending.remove(task_id);
        inner.inflight.insert(task_id.to_owned(), handler);
    }

    pub fn remove(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("poisoned mutex");
        inner.pending.remove(task_id);
        inner.inflight.remove(task_id);
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.lock().expect("poisoned mutex").inflight.len()
    }

    pub fn inflight_ids(&self) -> Vec<String> {
        self.inner.lock().expect("poisoned mutex").inflight.keys().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("poisoned mutex").pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().expect("poisoned mutex");
        inner.pending.is_empty() && inner.inflight.is_empty()
    }

    /// Snapshot and clear both maps, returning every handler that never
    /// reached a terminal transition.
    pub fn drain_for_shutdown(&self) -> Vec<Arc<dyn TaskHandler>> {
        let mut inner = self.inner.lock().expect("poisoned mutex");
        inner.pending.drain().chain(inner.inflight.drain()).map(|(_, h)| h).collect()
    }
}
