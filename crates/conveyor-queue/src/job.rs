//! Job model and lifecycle transitions

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Derived reporting state of a job, computed from its lifecycle
/// timestamps. Terminal states win over transient ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready and waiting in a queue
    Pending,
    /// Not yet available for execution
    Delayed,
    /// Picked up by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed (retryable or terminal)
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Delayed => "delayed",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work flowing through the queue.
///
/// The wire form is JSON with snake_case keys; `timeout` and `delay`
/// serialize as integer nanoseconds and unset lifecycle timestamps are
/// omitted entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation
    pub id: String,
    /// Routing key matching a registered worker pool
    pub name: String,
    /// Logical queue the job lives on
    pub queue: String,
    /// Opaque structured payload
    pub payload: serde_json::Value,
    /// Executions started so far
    pub attempts: u32,
    /// Upper bound on attempts; reaching it makes failure terminal
    pub max_attempts: u32,
    /// Per-execution wall-clock bound
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,
    /// Delay requested at creation
    #[serde(with = "duration_nanos")]
    pub delay: Duration,
    /// Earliest moment the job may execute
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Last error message; empty when the job has not failed
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Job {
    /// Create a job with library defaults. The manager overrides queue,
    /// max_attempts and timeout from its configuration at dispatch time.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            queue: "default".to_string(),
            payload,
            attempts: 0,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            delay: Duration::ZERO,
            available_at: now,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the requested delay; `available_at` becomes `created_at + delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.available_at = self.created_at + to_chrono(delay);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True once the current time has reached `available_at`.
    pub fn is_available(&self) -> bool {
        Utc::now() >= self.available_at
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Record the start of an execution. Increments the attempt counter.
    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.started_at = Some(now);
        self.updated_at = now;
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl std::fmt::Display) {
        let now = Utc::now();
        self.failed_at = Some(now);
        self.updated_at = now;
        self.error = error.to_string();
    }

    /// Put the job back into a retryable state: `available_at` moves to
    /// `now + backoff` and the failure markers are cleared so the job
    /// rejoins the active pool. The originally requested `delay` is left
    /// untouched.
    pub fn schedule_retry(&mut self, backoff: Duration) {
        let now = Utc::now();
        self.available_at = now + to_chrono(backoff);
        self.failed_at = None;
        self.error.clear();
        self.updated_at = now;
    }

    /// Derived reporting state.
    pub fn state(&self) -> JobState {
        if self.completed_at.is_some() {
            JobState::Completed
        } else if self.failed_at.is_some() {
            JobState::Failed
        } else if self.started_at.is_some() {
            JobState::Processing
        } else if !self.is_available() {
            JobState::Delayed
        } else {
            JobState::Pending
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::nanoseconds(d.as_nanos().min(i64::MAX as u128) as i64)
}

/// Serialize a `Duration` as integer nanoseconds, matching the wire
/// format of the stored job.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_job_defaults() {
        let job = Job::new("send_email", json!({"to": "a@b.c"}));
        assert_eq!(job.queue, "default");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.timeout, Duration::from_secs(30));
        assert_eq!(job.delay, Duration::ZERO);
        assert_eq!(job.available_at, job.created_at);
        assert!(job.is_available());
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn with_delay_moves_available_at() {
        let job = Job::new("j", json!({})).with_delay(Duration::from_secs(60));
        assert_eq!(job.delay, Duration::from_secs(60));
        assert_eq!(
            job.available_at - job.created_at,
            chrono::Duration::seconds(60)
        );
        assert!(!job.is_available());
        assert_eq!(job.state(), JobState::Delayed);
    }

    #[test]
    fn mark_started_increments_attempts() {
        let mut job = Job::new("j", json!({}));
        job.mark_started();
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
        assert_eq!(job.state(), JobState::Processing);
        job.mark_started();
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn state_precedence() {
        let mut job = Job::new("j", json!({}));
        job.mark_started();
        job.mark_failed("boom");
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error, "boom");
        job.mark_completed();
        // completed wins over failed
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn schedule_retry_clears_failure() {
        let mut job = Job::new("j", json!({})).with_max_attempts(3);
        job.mark_started();
        job.mark_failed("transient");
        assert!(job.can_retry());

        let before = job.updated_at;
        job.schedule_retry(Duration::from_secs(5));
        assert!(job.failed_at.is_none());
        assert!(job.error.is_empty());
        assert!(job.updated_at >= before);
        assert!(!job.is_available());
        // the originally requested delay is untouched
        assert_eq!(job.delay, Duration::ZERO);
    }

    #[test]
    fn can_retry_bounds() {
        let mut job = Job::new("j", json!({})).with_max_attempts(2);
        job.mark_started();
        assert!(job.can_retry());
        job.mark_started();
        assert!(!job.can_retry());
    }

    #[test]
    fn wire_round_trip_bare() {
        let job = Job::new("roundtrip", json!({"n": 1}));
        let data = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&data).unwrap();
        assert_eq!(job, back);
        // unset timestamps are omitted from the wire form
        assert!(!data.contains("started_at"));
        assert!(!data.contains("completed_at"));
        assert!(!data.contains("failed_at"));
    }

    #[test]
    fn wire_round_trip_populated() {
        let mut job = Job::new("roundtrip", json!({"nested": {"k": [1, 2, 3]}}))
            .with_queue("critical")
            .with_max_attempts(7)
            .with_timeout(Duration::from_millis(1500))
            .with_delay(Duration::from_secs(2))
            .with_metadata("tenant", json!("acme"));
        job.mark_started();
        job.mark_failed("boom");

        let data = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&data).unwrap();
        assert_eq!(job, back);
    }

    #[test]
    fn wire_durations_are_nanoseconds() {
        let job = Job::new("j", json!({})).with_timeout(Duration::from_secs(1));
        let value: serde_json::Value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["timeout"], json!(1_000_000_000u64));
        assert_eq!(value["delay"], json!(0));
    }
}
