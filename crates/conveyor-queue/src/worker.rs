//! Worker pools and the single-job execution protocol

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::Driver;
use crate::error::{JobError, QueueError};
use crate::job::Job;
use crate::metrics::{Outcome, QueueMetrics};

/// Future returned by a job handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;

/// A job handler. Receives an owned copy of the job; the queue keeps its
/// own, so a misbehaving handler cannot corrupt the retry bookkeeping.
pub type Handler = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

/// A middleware wraps a handler and returns a handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Adapt an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(move |job| -> HandlerFuture { Box::pin(f(job)) })
}

/// Everything a worker task needs, captured at spawn time so pools never
/// reference back into the manager.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub driver: Arc<dyn Driver>,
    pub retry_delay: Duration,
    pub metrics: Arc<QueueMetrics>,
}

/// A group of executor tasks bound to one job name, fed through a
/// bounded handoff channel of capacity `2 x concurrency`.
pub(crate) struct WorkerPool {
    name: String,
    concurrency: usize,
    handler: Handler,
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, concurrency: usize, handler: Handler) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency * 2);
        Self {
            name: name.into(),
            concurrency,
            handler,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Jobs currently sitting in the handoff channel.
    pub fn depth(&self) -> u64 {
        (self.tx.max_capacity() - self.tx.capacity()) as u64
    }

    /// Non-blocking handoff. Returns the job when the channel is full so
    /// the dispatcher can push it back to the driver.
    pub fn try_dispatch(&self, job: Job) -> Result<(), Job> {
        self.tx.try_send(job).map_err(|err| match err {
            TrySendError::Full(job) | TrySendError::Closed(job) => job,
        })
    }

    /// Spawn the pool's worker tasks. They exit on the stop signal.
    pub fn spawn(&self, ctx: WorkerContext, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|index| {
                tokio::spawn(run_worker(
                    self.name.clone(),
                    index,
                    self.handler.clone(),
                    self.rx.clone(),
                    ctx.clone(),
                    stop.clone(),
                ))
            })
            .collect()
    }
}

async fn run_worker(
    pool: String,
    index: usize,
    handler: Handler,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    ctx: WorkerContext,
    mut stop: watch::Receiver<bool>,
) {
    debug!(pool = %pool, worker = index, "worker started");
    loop {
        let job = tokio::select! {
            _ = stop.changed() => break,
            received = async { rx.lock().await.recv().await } => match received {
                Some(job) => job,
                None => break,
            },
        };
        process_job(&pool, &handler, &ctx, job).await;
    }
    debug!(pool = %pool, worker = index, "worker stopped");
}

/// Run one job to a terminal or retryable outcome.
///
/// The handler runs on a child task raced against the job timeout. On
/// timeout the child is aborted and the worker moves on with its own
/// copy of the job; an abandoned handler can only ever touch its own
/// payload copy.
async fn process_job(pool: &str, handler: &Handler, ctx: &WorkerContext, mut job: Job) {
    job.mark_started();

    let mut run = tokio::spawn({
        let handler = handler.clone();
        let job = job.clone();
        async move { handler(job).await }
    });

    let verdict = match tokio::time::timeout(job.timeout, &mut run).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(err.to_string()),
        Ok(Err(join_err)) => Err(format!("handler panicked: {join_err}")),
        Err(_elapsed) => {
            run.abort();
            Err(QueueError::JobTimeout.to_string())
        }
    };

    match verdict {
        Ok(()) => {
            job.mark_completed();
            if let Err(err) = ctx.driver.delete(&job.id).await {
                warn!(job_id = %job.id, error = %err, "failed to delete completed job");
            }
            record_terminal(ctx, pool, Outcome::Success, &job);
        }
        Err(message) => {
            job.mark_failed(&message);
            if job.can_retry() {
                // linear backoff: base delay times the attempt just finished
                let backoff = ctx.retry_delay * job.attempts;
                info!(
                    job_id = %job.id,
                    job_name = %job.name,
                    attempt = job.attempts,
                    error = %message,
                    "job failed, retrying"
                );
                job.schedule_retry(backoff);
                if let Err(err) = ctx.driver.retry(&job).await {
                    warn!(job_id = %job.id, error = %err, "failed to requeue job for retry");
                }
            } else {
                error!(
                    job_id = %job.id,
                    job_name = %job.name,
                    attempts = job.attempts,
                    error = %message,
                    "job failed permanently"
                );
                if let Err(err) = ctx.driver.failed(&job).await {
                    warn!(job_id = %job.id, error = %err, "failed to move job to the failed sink");
                }
                record_terminal(ctx, pool, Outcome::Failed, &job);
            }
        }
    }
}

fn record_terminal(ctx: &WorkerContext, pool: &str, outcome: Outcome, job: &Job) {
    let elapsed_ms = (Utc::now() - job.created_at).num_milliseconds().max(0) as u64;
    ctx.metrics.record_processed(pool, outcome, elapsed_ms);
}
