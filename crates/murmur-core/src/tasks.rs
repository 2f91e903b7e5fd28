//! Ownership for short-lived background work (transmissions, receipts).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Tracks spawned tasks until they finish so they can all be aborted at
/// shutdown. Finished tasks remove themselves.
#[derive(Default)]
pub struct TaskSet {
    next_id: AtomicU64,
    handles: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handles = self.handles.clone();

        // Register before the task can finish and deregister itself.
        let mut registry = self.handles.lock().await;
        let handle = tokio::spawn(async move {
            task.await;
            handles.lock().await.remove(&id);
        });
        registry.insert(id, handle.abort_handle());
    }

    pub async fn abort_all(&self) {
        for (_, handle) in self.handles.lock().await.drain() {
            handle.abort();
        }
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}
