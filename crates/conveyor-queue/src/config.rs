//! Queue configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the queue manager.
///
/// Every field has a sensible default, so deserializing an empty map (or
/// calling [`Config::default`]) yields a working in-process queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver name resolved through the [`DriverRegistry`](crate::DriverRegistry)
    pub driver: String,
    /// Logical connection name handed to the driver factory
    pub connection: String,
    /// Key prefix used by durable drivers
    pub prefix: String,
    /// Queue used by `dispatch` when none is specified
    pub default_queue: String,
    /// Default terminal attempt count
    pub max_attempts: u32,
    /// Default per-job execution timeout
    pub timeout: Duration,
    /// Base delay unit for linear retry backoff
    pub retry_delay: Duration,
    /// Default concurrency when a worker is registered with 0
    pub workers: usize,
    /// When false, `start` is a no-op (producer-only mode)
    pub worker_enabled: bool,
    /// Dispatcher poll interval
    pub poll_interval: Duration,
    /// Driver-specific options
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            connection: "default".to_string(),
            prefix: "queue".to_string(),
            default_queue: "default".to_string(),
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            workers: 5,
            worker_enabled: true,
            poll_interval: Duration::from_millis(100),
            options: HashMap::new(),
        }
    }
}
