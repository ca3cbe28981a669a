//! Queue metrics
//!
//! Counters and histograms are plain atomics so recording is wait-free
//! and can never fail; the hot path never blocks on observability.
//! `snapshot` folds in the per-pool gauges sampled by the manager and
//! renders to the Prometheus text exposition format on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Terminal outcome of a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
        }
    }
}

/// Upper bounds of the duration histogram buckets, in milliseconds.
/// A final +Inf bucket is implicit.
const BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 5_000, 10_000];

#[derive(Default)]
struct Histogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn observe(&self, value_ms: u64) {
        let index = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| value_ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct QueueStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    duration_success: Histogram,
    duration_failed: Histogram,
}

/// Metrics collector shared by the manager, dispatcher and workers.
#[derive(Default)]
pub struct QueueMetrics {
    queues: RwLock<HashMap<String, Arc<QueueStats>>>,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal outcome and its end-to-end latency.
    pub fn record_processed(&self, queue: &str, outcome: Outcome, elapsed_ms: u64) {
        let stats = self.stats(queue);
        match outcome {
            Outcome::Success => {
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                stats.duration_success.observe(elapsed_ms);
            }
            Outcome::Failed => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                stats.duration_failed.observe(elapsed_ms);
            }
        }
    }

    /// Point-in-time view; `pools` carries the gauges the manager
    /// samples from its worker pools (channel depth, concurrency).
    pub fn snapshot(&self, pools: Vec<PoolGauge>) -> MetricsSnapshot {
        let queues = self
            .queues
            .read()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(name, stats)| QueueSnapshot {
                queue: name.clone(),
                succeeded: stats.succeeded.load(Ordering::Relaxed),
                failed: stats.failed.load(Ordering::Relaxed),
                duration_success: stats.duration_success.snapshot(),
                duration_failed: stats.duration_failed.snapshot(),
            })
            .collect();

        MetricsSnapshot { queues, pools }
    }

    fn stats(&self, queue: &str) -> Arc<QueueStats> {
        if let Some(stats) = self
            .queues
            .read()
            .expect("metrics lock poisoned")
            .get(queue)
        {
            return stats.clone();
        }
        self.queues
            .write()
            .expect("metrics lock poisoned")
            .entry(queue.to_string())
            .or_default()
            .clone()
    }
}

/// Gauges sampled from one worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolGauge {
    pub queue: String,
    /// Approximate depth: jobs sitting in the handoff channel
    pub depth: u64,
    /// Configured concurrency
    pub workers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub sum_ms: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue: String,
    pub succeeded: u64,
    pub failed: u64,
    pub duration_success: HistogramSnapshot,
    pub duration_failed: HistogramSnapshot,
}

/// Point-in-time view of all queue metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub queues: Vec<QueueSnapshot>,
    pub pools: Vec<PoolGauge>,
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP queue_depth Jobs waiting in a pool's handoff channel\n");
        out.push_str("# TYPE queue_depth gauge\n");
        for pool in &self.pools {
            out.push_str(&format!(
                "queue_depth{{queue=\"{}\"}} {}\n",
                pool.queue, pool.depth
            ));
        }

        out.push_str("# HELP queue_workers Configured worker concurrency\n");
        out.push_str("# TYPE queue_workers gauge\n");
        for pool in &self.pools {
            out.push_str(&format!(
                "queue_workers{{queue=\"{}\"}} {}\n",
                pool.queue, pool.workers
            ));
        }

        out.push_str("# HELP queue_job_processed_total Jobs that reached a terminal outcome\n");
        out.push_str("# TYPE queue_job_processed_total counter\n");
        for entry in &self.queues {
            out.push_str(&format!(
                "queue_job_processed_total{{queue=\"{}\",status=\"success\"}} {}\n",
                entry.queue, entry.succeeded
            ));
            out.push_str(&format!(
                "queue_job_processed_total{{queue=\"{}\",status=\"failed\"}} {}\n",
                entry.queue, entry.failed
            ));
        }

        out.push_str("# HELP queue_job_duration_ms End-to-end job latency in milliseconds\n");
        out.push_str("# TYPE queue_job_duration_ms histogram\n");
        for entry in &self.queues {
            for (status, histogram) in [
                ("success", &entry.duration_success),
                ("failed", &entry.duration_failed),
            ] {
                let mut cumulative = 0;
                for (index, count) in histogram.buckets.iter().enumerate() {
                    cumulative += count;
                    let le = BUCKET_BOUNDS_MS
                        .get(index)
                        .map_or("+Inf".to_string(), |bound| bound.to_string());
                    out.push_str(&format!(
                        "queue_job_duration_ms_bucket{{queue=\"{}\",status=\"{}\",le=\"{}\"}} {}\n",
                        entry.queue, status, le, cumulative
                    ));
                }
                out.push_str(&format!(
                    "queue_job_duration_ms_sum{{queue=\"{}\",status=\"{}\"}} {}\n",
                    entry.queue, status, histogram.sum_ms
                ));
                out.push_str(&format!(
                    "queue_job_duration_ms_count{{queue=\"{}\",status=\"{}\"}} {}\n",
                    entry.queue, status, histogram.count
                ));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_queue() {
        let metrics = QueueMetrics::new();
        metrics.record_processed("email", Outcome::Success, 12);
        metrics.record_processed("email", Outcome::Success, 30);
        metrics.record_processed("email", Outcome::Failed, 700);
        metrics.record_processed("resize", Outcome::Success, 3);

        let snapshot = metrics.snapshot(vec![]);
        let email = snapshot
            .queues
            .iter()
            .find(|entry| entry.queue == "email")
            .unwrap();
        assert_eq!(email.succeeded, 2);
        assert_eq!(email.failed, 1);
        assert_eq!(email.duration_success.count, 2);
        assert_eq!(email.duration_success.sum_ms, 42);
        assert_eq!(email.duration_failed.count, 1);
    }

    #[test]
    fn histogram_buckets() {
        let histogram = Histogram::default();
        histogram.observe(3); // <= 5
        histogram.observe(5); // <= 5
        histogram.observe(80); // <= 100
        histogram.observe(60_000); // +Inf

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.buckets[0], 2);
        assert_eq!(snapshot.buckets[4], 1);
        assert_eq!(snapshot.buckets[BUCKET_BOUNDS_MS.len()], 1);
        assert_eq!(snapshot.count, 4);
    }

    #[test]
    fn prometheus_rendering() {
        let metrics = QueueMetrics::new();
        metrics.record_processed("email", Outcome::Success, 12);
        let snapshot = metrics.snapshot(vec![PoolGauge {
            queue: "email".to_string(),
            depth: 1,
            workers: 4,
        }]);

        let text = snapshot.to_prometheus();
        assert!(text.contains("queue_depth{queue=\"email\"} 1"));
        assert!(text.contains("queue_workers{queue=\"email\"} 4"));
        assert!(text.contains("queue_job_processed_total{queue=\"email\",status=\"success\"} 1"));
        assert!(text.contains("queue_job_duration_ms_bucket{queue=\"email\",status=\"success\",le=\"+Inf\"} 1"));
    }
}
