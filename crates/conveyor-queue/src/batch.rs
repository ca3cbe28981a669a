//! Bulk dispatch helper
//!
//! A thin producer layered on the manager's dispatch API: it chunks a
//! list of items into individual dispatch calls with progress
//! reporting and optional rate limiting. The returned status handle is
//! updated concurrently by the producer task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{JobError, QueueError};
use crate::manager::Manager;

pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;
pub type BatchErrorFn = Arc<dyn Fn(&serde_json::Value, &QueueError) + Send + Sync>;
pub type BatchMapper =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, JobError> + Send + Sync>;

/// Configuration for one batch run.
#[derive(Clone)]
pub struct BatchConfig {
    /// Items dispatched between rate-limit pauses
    pub chunk_size: usize,
    /// Keep dispatching after an item fails
    pub continue_on_error: bool,
    /// Items per second; 0 means unbounded
    pub rate_limit: u32,
    pub on_progress: Option<ProgressFn>,
    pub on_error: Option<BatchErrorFn>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            continue_on_error: true,
            rate_limit: 0,
            on_progress: None,
            on_error: None,
        }
    }
}

/// Shared view of a running (or finished) batch.
pub struct BatchStatus {
    total: u64,
    processed: AtomicU64,
    failed: AtomicU64,
    job_ids: Mutex<Vec<String>>,
    started_at: DateTime<Utc>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    in_progress: AtomicBool,
}

impl BatchStatus {
    fn new(total: u64) -> Self {
        Self {
            total,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            job_ids: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            completed_at: RwLock::new(None),
            in_progress: AtomicBool::new(true),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.job_ids.lock().expect("batch lock poisoned").clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read().expect("batch lock poisoned")
    }

    /// Progress percentage in `[0, 100]`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed() as f64 / self.total as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        !self.in_progress.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        *self.completed_at.write().expect("batch lock poisoned") = Some(Utc::now());
        self.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Batch producer bound to a manager.
pub struct Batch {
    manager: Arc<Manager>,
}

impl Batch {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Dispatch every item as an individual job, asynchronously. The
    /// returned handle reflects live progress.
    pub fn dispatch(
        &self,
        name: &str,
        items: Vec<serde_json::Value>,
        config: BatchConfig,
    ) -> Result<Arc<BatchStatus>, QueueError> {
        if items.is_empty() {
            return Err(QueueError::InvalidPayload(
                "batch items cannot be empty".to_string(),
            ));
        }

        let status = Arc::new(BatchStatus::new(items.len() as u64));
        let manager = self.manager.clone();
        let name = name.to_string();
        let task_status = status.clone();

        tokio::spawn(async move {
            run_batch(manager, name, items, config, &task_status).await;
            task_status.finish();
        });

        Ok(status)
    }

    /// Pre-transform every item with `mapper`, then dispatch the mapped
    /// items as a batch. Mapper failures respect `continue_on_error`.
    pub fn map(
        &self,
        name: &str,
        items: Vec<serde_json::Value>,
        mapper: BatchMapper,
        config: BatchConfig,
    ) -> Result<Arc<BatchStatus>, QueueError> {
        let mut mapped = Vec::with_capacity(items.len());
        for item in items {
            match mapper(item.clone()) {
                Ok(value) => mapped.push(value),
                Err(err) => {
                    let err = QueueError::InvalidPayload(err.to_string());
                    if let Some(on_error) = &config.on_error {
                        on_error(&item, &err);
                    }
                    if !config.continue_on_error {
                        return Err(err);
                    }
                }
            }
        }

        self.dispatch(name, mapped, config)
    }
}

async fn run_batch(
    manager: Arc<Manager>,
    name: String,
    items: Vec<serde_json::Value>,
    config: BatchConfig,
    status: &BatchStatus,
) {
    let total = items.len();
    let chunk_size = config.chunk_size.max(1);

    for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
        for item in chunk {
            match manager.dispatch(&name, item.clone()).await {
                Ok(job) => {
                    status
                        .job_ids
                        .lock()
                        .expect("batch lock poisoned")
                        .push(job.id);
                    let processed = status.processed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(on_progress) = &config.on_progress {
                        on_progress(processed, total as u64);
                    }
                }
                Err(err) => {
                    status.failed.fetch_add(1, Ordering::SeqCst);
                    if let Some(on_error) = &config.on_error {
                        on_error(item, &err);
                    }
                    if !config.continue_on_error {
                        return;
                    }
                }
            }
        }

        let is_last = (chunk_index + 1) * chunk_size >= total;
        if config.rate_limit > 0 && !is_last {
            let pause = chunk_size as f64 / config.rate_limit as f64;
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }
    }
}
