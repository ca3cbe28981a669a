//! Storage driver abstraction
//!
//! A driver is the sole source of truth for enqueued jobs. The manager
//! and workers only ever talk to the queue through this trait, so
//! storage backends are swappable without touching the execution path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::QueueError;
use crate::job::Job;
use crate::memory::MemoryDriver;

/// Storage and transport for jobs.
///
/// Cancellation is structural: dropping a pending future abandons the
/// operation. Implementations must be internally thread-safe, the handle
/// is shared across the dispatcher and every worker.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Persist a job for later retrieval. Jobs that are not yet
    /// available go to the queue's delayed set; ready jobs are appended
    /// to the tail of the active list (FIFO within a queue).
    async fn push(&self, job: &Job) -> Result<(), QueueError>;

    /// Promote due delayed jobs, then remove and return the head of the
    /// active list. `Ok(None)` means no ready job exists. Never returns
    /// a job whose `available_at` is still in the future.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    /// Best-effort removal by id. Idempotent: deleting an absent job
    /// succeeds.
    async fn delete(&self, job_id: &str) -> Result<(), QueueError>;

    /// Re-push a job whose retry has been scheduled by the caller.
    async fn retry(&self, job: &Job) -> Result<(), QueueError>;

    /// Append a job to the failed sink.
    async fn failed(&self, job: &Job) -> Result<(), QueueError>;

    /// Look up a job by id. Drivers without an id index return
    /// [`QueueError::Unsupported`].
    async fn get(&self, job_id: &str) -> Result<Job, QueueError>;

    /// Number of jobs pending on a queue, counting both the active list
    /// and the delayed set.
    async fn size(&self, queue: &str) -> Result<u64, QueueError>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Boxed future returned by a [`DriverFactory`].
pub type DriverFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn Driver>, QueueError>> + Send>>;

/// Factory producing a driver from configuration.
pub type DriverFactory = Box<dyn Fn(&Config) -> DriverFuture + Send + Sync>;

/// Registry of driver factories for config-driven construction.
///
/// Owned by whoever builds the manager rather than living in process
/// globals, which keeps construction testable.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `memory` driver registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_config| -> DriverFuture {
            Box::pin(async { Ok(Arc::new(MemoryDriver::new()) as Arc<dyn Driver>) })
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> DriverFuture + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Build the driver named by `config.driver`.
    pub async fn make(&self, config: &Config) -> Result<Arc<dyn Driver>, QueueError> {
        let factory = self
            .factories
            .get(&config.driver)
            .ok_or_else(|| QueueError::DriverNotFound(config.driver.clone()))?;
        factory(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_builds_memory_driver() {
        let registry = DriverRegistry::with_defaults();
        let driver = registry.make(&Config::default()).await.unwrap();
        assert_eq!(driver.size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn registry_unknown_driver() {
        let registry = DriverRegistry::with_defaults();
        let config = Config {
            driver: "postgres".to_string(),
            ..Config::default()
        };
        match registry.make(&config).await {
            Err(QueueError::DriverNotFound(name)) => assert_eq!(name, "postgres"),
            Ok(_) => panic!("expected DriverNotFound, got Ok"),
            Err(other) => panic!("expected DriverNotFound, got {other:?}"),
        }
    }
}
