//! # Conveyor Queue
//!
//! Async background job queue for robust job processing.
//!
//! Features:
//! - Named jobs with opaque JSON payloads
//! - Pluggable storage drivers (in-memory, Redis via `conveyor-redis`)
//! - Per-name worker pools with bounded handoff and backpressure
//! - Retries with linear backoff, per-job timeouts, dead-letter sink
//! - Delayed/scheduled execution
//! - Bulk dispatch helper with progress and rate limiting

pub mod batch;
pub mod config;
pub mod driver;
pub mod error;
pub mod job;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod worker;

pub use batch::{Batch, BatchConfig, BatchStatus};
pub use config::Config;
pub use driver::{Driver, DriverFuture, DriverRegistry};
pub use error::{JobError, QueueError};
pub use job::{Job, JobState};
pub use manager::{Manager, StatusReport};
pub use memory::MemoryDriver;
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use worker::{handler, Handler, Middleware};
