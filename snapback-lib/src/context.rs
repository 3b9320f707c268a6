//! Run-scoped context: the collaborator handle plus run options, threaded
//! explicitly into every call instead of living in process-wide state.

use std::sync::Arc;

use snapback_common::CloudInventory;
use snapback_engine::retry::RetryPolicy;

#[derive(Clone)]
pub struct BackupContext {
    pub backend: Arc<dyn CloudInventory>,
    pub options: RunOptions,
}

impl BackupContext {
    pub fn new(backend: Arc<dyn CloudInventory>, options: RunOptions) -> Self {
        Self { backend, options }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Regions to process; empty means every region the backend reports.
    pub regions: Vec<String>,
    /// Bound on concurrently processed instance pipelines.
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            parallelism: 4,
            retry: RetryPolicy::default(),
        }
    }
}
