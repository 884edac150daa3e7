//! Task executor for message processing.
//!
//! Sinks spawn processing work through a [`TaskExecutor`]: a runtime handle
//! plus a [`TaskTracker`] so the container can wait for in-flight work, and a
//! [`CancellationToken`] so it can abandon whatever is still running when the
//! shutdown timeout elapses. A cancelled task is dropped at its next await
//! point, which drops the message's acknowledgement ticket and records it as
//! abandoned.

use crate::error::ContainerError;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;

/// Spawns and tracks processing tasks
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    handle: Handle,
    tracker: TaskTracker,
    cancellation: CancellationToken,
}

impl TaskExecutor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Executor on the runtime the caller is running in
    pub fn current() -> Result<Self, ContainerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| ContainerError::NoRuntime)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a processing task. It stops at its next await point once the
    /// executor is abandoned.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancellation = self.cancellation.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancellation.cancelled() => {}
                    _ = task => {}
                }
            },
            &self.handle,
        );
    }

    /// Tasks spawned and not yet finished
    pub fn in_flight_tasks(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_abandoned(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait up to `timeout` for running tasks. Returns `true` when everything
    /// finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        debug!(
            drained,
            remaining = self.tracker.len(),
            "Processing drain finished"
        );
        drained
    }

    /// Cancel every task still running
    pub fn abandon(&self) {
        self.cancellation.cancel();
    }

    /// Wait for all tracked tasks to exit
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
