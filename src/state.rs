//! Shared application state: the current configuration snapshot and the database executor.

use crate::config::Snapshot;
use crate::service::SqlExecutor;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    /// Swapped whole by the refresh task; requests clone the inner `Arc` once.
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
    pub executor: Arc<dyn SqlExecutor>,
}

impl AppState {
    pub fn new(initial: Snapshot, executor: Arc<dyn SqlExecutor>) -> Self {
        AppState {
            snapshot: Arc::new(RwLock::new(Arc::new(initial))),
            executor,
        }
    }

    /// The snapshot to use for one request.
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the snapshot, returning the previous one.
    pub fn install(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(snapshot))
    }
}
