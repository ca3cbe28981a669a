//! In-process ephemeral driver
//!
//! FIFO per queue, availability checked at pop time. One lock protects
//! all state: mutations take it exclusively, `get`/`size` take it
//! shared. Everything lives in process memory, so this driver is best
//! suited for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::driver::Driver;
use crate::error::QueueError;
use crate::job::Job;

#[derive(Default)]
struct Inner {
    /// queue name -> ordered jobs, delayed ones interleaved in place
    queues: HashMap<String, VecDeque<Job>>,
    /// failed sink, keyed by job id
    failed: HashMap<String, Job>,
    /// snapshot of jobs handed out by pop, used only for reporting
    in_flight: HashMap<String, Job>,
    /// terminal archive so `get` can report completion after delete
    completed: HashMap<String, Job>,
}

/// Ephemeral in-memory driver.
#[derive(Default)]
pub struct MemoryDriver {
    inner: RwLock<Inner>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently in the failed sink, in no particular order.
    pub async fn failed_jobs(&self) -> Vec<Job> {
        self.inner.read().await.failed.values().cloned().collect()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        inner.in_flight.remove(&job.id);
        inner
            .queues
            .entry(job.queue.clone())
            .or_default()
            .push_back(job.clone());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.write().await;
        let Some(jobs) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        // First available job wins; delayed jobs are skipped in place,
        // which preserves FIFO among the ready ones.
        let Some(index) = jobs.iter().position(Job::is_available) else {
            return Ok(None);
        };
        let job = jobs.remove(index).expect("index from position");
        inner.in_flight.insert(job.id.clone(), job.clone());
        Ok(Some(job))
    }

    async fn delete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;

        for jobs in inner.queues.values_mut() {
            if let Some(index) = jobs.iter().position(|job| job.id == job_id) {
                jobs.remove(index);
                return Ok(());
            }
        }

        if inner.failed.remove(job_id).is_some() {
            return Ok(());
        }

        // A delete for a job we handed out and that is in no live
        // structure is a completion: archive it for status lookups.
        if let Some(mut job) = inner.in_flight.remove(job_id) {
            job.mark_completed();
            inner.completed.insert(job.id.clone(), job);
            return Ok(());
        }

        inner.completed.remove(job_id);
        Ok(())
    }

    async fn retry(&self, job: &Job) -> Result<(), QueueError> {
        self.push(job).await
    }

    async fn failed(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        inner.in_flight.remove(&job.id);
        inner.failed.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Job, QueueError> {
        let inner = self.inner.read().await;

        for jobs in inner.queues.values() {
            if let Some(job) = jobs.iter().find(|job| job.id == job_id) {
                return Ok(job.clone());
            }
        }
        if let Some(job) = inner.failed.get(job_id) {
            return Ok(job.clone());
        }
        if let Some(job) = inner.completed.get(job_id) {
            return Ok(job.clone());
        }
        if let Some(job) = inner.in_flight.get(job_id) {
            return Ok(job.clone());
        }

        Err(QueueError::JobNotFound)
    }

    async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        let inner = self.inner.read().await;
        Ok(inner.queues.get(queue).map_or(0, |jobs| jobs.len() as u64))
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        inner.queues.clear();
        inner.failed.clear();
        inner.in_flight.clear();
        inner.completed.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn push_pop_fifo() {
        let driver = MemoryDriver::new();
        let a = Job::new("a", json!(1));
        let b = Job::new("b", json!(2));
        driver.push(&a).await.unwrap();
        driver.push(&b).await.unwrap();

        assert_eq!(driver.pop("default").await.unwrap().unwrap().id, a.id);
        assert_eq!(driver.pop("default").await.unwrap().unwrap().id, b.id);
        assert!(driver.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_skips_delayed_jobs() {
        let driver = MemoryDriver::new();
        let delayed = Job::new("d", json!({})).with_delay(Duration::from_secs(60));
        let ready = Job::new("r", json!({}));
        driver.push(&delayed).await.unwrap();
        driver.push(&ready).await.unwrap();

        // the ready job behind the delayed one is returned first
        assert_eq!(driver.pop("default").await.unwrap().unwrap().id, ready.id);
        assert!(driver.pop("default").await.unwrap().is_none());
        // the delayed job still counts toward size
        assert_eq!(driver.size("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_promotes_after_availability() {
        let driver = MemoryDriver::new();
        let job = Job::new("d", json!({})).with_delay(Duration::from_millis(50));
        driver.push(&job).await.unwrap();

        assert!(driver.pop("default").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(driver.pop("default").await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn pop_unknown_queue_is_empty() {
        let driver = MemoryDriver::new();
        assert!(driver.pop("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let driver = MemoryDriver::new();
        let job = Job::new("j", json!({}));
        driver.push(&job).await.unwrap();

        driver.delete(&job.id).await.unwrap();
        assert_eq!(driver.size("default").await.unwrap(), 0);
        driver.delete(&job.id).await.unwrap();
        driver.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn delete_after_pop_archives_completion() {
        let driver = MemoryDriver::new();
        let job = Job::new("j", json!({}));
        driver.push(&job).await.unwrap();
        driver.pop("default").await.unwrap().unwrap();

        driver.delete(&job.id).await.unwrap();
        let archived = driver.get(&job.id).await.unwrap();
        assert_eq!(archived.state(), JobState::Completed);

        // a second delete evicts the archive entry
        driver.delete(&job.id).await.unwrap();
        assert!(matches!(
            driver.get(&job.id).await,
            Err(QueueError::JobNotFound)
        ));
    }

    #[tokio::test]
    async fn failed_sink_is_inspectable() {
        let driver = MemoryDriver::new();
        let mut job = Job::new("j", json!({}));
        job.mark_started();
        job.mark_failed("exhausted");
        driver.failed(&job).await.unwrap();

        let stored = driver.get(&job.id).await.unwrap();
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.error, "exhausted");
        assert_eq!(driver.failed_jobs().await.len(), 1);
        // failed jobs are not pending work
        assert_eq!(driver.size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_requeues() {
        let driver = MemoryDriver::new();
        let mut job = Job::new("j", json!({}));
        driver.push(&job).await.unwrap();
        let mut popped = driver.pop("default").await.unwrap().unwrap();
        popped.mark_started();
        popped.mark_failed("transient");
        popped.schedule_retry(Duration::ZERO);
        driver.retry(&popped).await.unwrap();

        job = driver.pop("default").await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.failed_at.is_none());
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let driver = MemoryDriver::new();
        let a = Job::new("a", json!({})).with_queue("alpha");
        let b = Job::new("b", json!({})).with_queue("beta");
        driver.push(&a).await.unwrap();
        driver.push(&b).await.unwrap();

        assert_eq!(driver.size("alpha").await.unwrap(), 1);
        assert_eq!(driver.size("beta").await.unwrap(), 1);
        assert!(driver.pop("alpha").await.unwrap().is_some());
        assert_eq!(driver.size("beta").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn close_clears_and_is_idempotent() {
        let driver = MemoryDriver::new();
        driver.push(&Job::new("j", json!({}))).await.unwrap();
        driver.close().await.unwrap();
        assert_eq!(driver.size("default").await.unwrap(), 0);
        driver.close().await.unwrap();
    }
}
