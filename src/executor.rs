//! # Task Executor
//!
//! Semaphore-bounded wrapper over the Tokio runtime. Step executions (route
//! submissions, multicast branches) go through [`TaskExecutor::spawn_bounded`]
//! so one fan-out cannot exhaust the pool, while lightweight coordinators and
//! timers use [`TaskExecutor::spawn`] and never hold a permit — a coordinator
//! waiting on its branches must not starve the branches of permits.

use crate::constants::defaults;
use crate::error::{RelayError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct TaskExecutor {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TaskExecutor {
    /// Create an executor bound to the current Tokio runtime.
    pub fn new(max_concurrent: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| RelayError::Executor(format!("no tokio runtime available: {e}")))?;
        Ok(Self::with_handle(handle, max_concurrent))
    }

    pub fn with_handle(handle: Handle, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Spawn an unbounded coordinator/timer task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Spawn a unit of step work. The task waits for a pool permit before
    /// running and releases it when done; excess submissions queue rather
    /// than error.
    pub fn spawn_bounded<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            future.await;
        })
    }

    /// Acquire a pool permit directly, for callers that run step work on
    /// their own task (e.g. sequential multicast branches).
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| RelayError::Executor(format!("executor permits closed: {e}")))
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for TaskExecutor {
    /// Bound to the current runtime with the default pool size. Panics
    /// outside a Tokio runtime; use [`TaskExecutor::new`] to handle that
    /// case gracefully.
    fn default() -> Self {
        Self::with_handle(Handle::current(), defaults::MAX_CONCURRENT_TASKS)
    }
}
