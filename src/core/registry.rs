//! Registry of per-account workers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::core::account::BackendTable;
use crate::core::audit::OutcomeSink;
use crate::core::worker::{StructuralPermits, Worker, WorkerContext};
use crate::core::AccountError;

/// Default worker thread stack size (256 KiB); workers only drive backend calls.
pub const DEFAULT_WORKER_STACK_SIZE: usize = 256 * 1024;

/// Map from account name to its worker, creating workers on first use.
///
/// Workers live for the lifetime of the registry. All workers share the
/// registry's [`BackendTable`], [`StructuralPermits`], and outcome sink.
pub struct AccountRegistry {
    context: WorkerContext,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
}

impl AccountRegistry {
    /// Create a registry over a backend table.
    pub fn new(backends: BackendTable) -> Self {
        Self {
            context: WorkerContext {
                backends: Arc::new(backends),
                permits: Arc::new(StructuralPermits::new()),
                sink: None,
                stack_size: DEFAULT_WORKER_STACK_SIZE,
            },
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Report every finished operation to `sink`.
    #[must_use]
    pub fn with_outcome_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.context.sink = Some(sink);
        self
    }

    /// Stack size for worker threads spawned from now on.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.context.stack_size = bytes;
        self
    }

    /// Worker for `name`, spawning it if this is the first request.
    ///
    /// Concurrent callers for the same name always receive the same worker.
    ///
    /// # Errors
    ///
    /// `AccountError::Spawn` if the worker thread could not be started.
    pub fn get(&self, name: &str) -> Result<Arc<Worker>, AccountError> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(name) {
            return Ok(Arc::clone(worker));
        }
        let worker = Arc::new(Worker::spawn(name, self.context.clone())?);
        workers.insert(name.to_owned(), Arc::clone(&worker));
        info!(account = name, workers = workers.len(), "registered account worker");
        Ok(worker)
    }

    /// Names of host accounts owned by any registered backend.
    ///
    /// # Errors
    ///
    /// `AccountError::Probe` if the host database cannot be read.
    pub fn live_accounts(&self) -> Result<Vec<String>, AccountError> {
        self.context.backends.live_accounts()
    }

    /// Names with a worker, sorted.
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shared backend table.
    pub fn backends(&self) -> &BackendTable {
        &self.context.backends
    }
}

impl std::fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRegistry")
            .field("backends", &self.context.backends)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}
