//! Bounded blocking pool in front of the store.
//!
//! redb transactions block, so async callers hand them to `spawn_blocking`.
//! A semaphore caps how many run at once; callers beyond that wait for a
//! permit instead of piling threads onto the blocking pool.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{StoreError, StoreResult};
use crate::store::MetricStore;

#[derive(Clone)]
pub struct StorePool {
    store: MetricStore,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl StorePool {
    pub fn new(store: MetricStore, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers not currently running a storage operation.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking store operation on the worker pool.
    pub async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&MetricStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op(&store)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage worker failed: {e}")))?
    }
}
