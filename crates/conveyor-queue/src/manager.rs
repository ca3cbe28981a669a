//! Queue manager
//!
//! Owns the driver, the worker-pool registry, the middleware chain and
//! the lifecycle. A single dispatcher task polls the driver and routes
//! ready jobs to the matching pool; each pool runs its own executor
//! tasks. One lock guards the registration state, mirroring the rest of
//! the crate's coarse-lock discipline, and it is never held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::driver::Driver;
use crate::error::QueueError;
use crate::job::{Job, JobState};
use crate::metrics::{MetricsSnapshot, Outcome, PoolGauge, QueueMetrics};
use crate::worker::{Handler, Middleware, WorkerContext, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Never started (dispatch allowed; producer-only mode lives here)
    Idle,
    Running,
    /// Stopped after running; dispatch is refused until the next start
    Stopped,
}

struct Shared {
    driver: Option<Arc<dyn Driver>>,
    workers: HashMap<String, Arc<WorkerPool>>,
    middleware: Vec<Middleware>,
    lifecycle: Lifecycle,
    stop: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The queue manager. Cheap to share behind an [`Arc`]; all public
/// operations take `&self`.
pub struct Manager {
    config: Config,
    shared: RwLock<Shared>,
    metrics: Arc<QueueMetrics>,
}

impl Manager {
    /// Create a manager without a driver. One must be set before any
    /// dispatch or start.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: RwLock::new(Shared {
                driver: None,
                workers: HashMap::new(),
                middleware: Vec::new(),
                lifecycle: Lifecycle::Idle,
                stop: None,
                tasks: Vec::new(),
            }),
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    /// Create a manager with a driver already attached.
    pub fn with_driver(config: Config, driver: Arc<dyn Driver>) -> Self {
        let manager = Self::new(config);
        manager
            .shared
            .write()
            .expect("manager lock poisoned")
            .driver = Some(driver);
        manager
    }

    /// Replace the driver. Refused once the manager is running.
    pub fn set_driver(&self, driver: Arc<dyn Driver>) -> Result<(), QueueError> {
        let mut shared = self.lock_mut();
        if shared.lifecycle == Lifecycle::Running {
            return Err(QueueError::AlreadyRunning);
        }
        shared.driver = Some(driver);
        Ok(())
    }

    /// The active driver, if one has been set.
    pub fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.lock().driver.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.metrics.clone()
    }

    /// Dispatch a job for immediate execution on the default queue.
    pub async fn dispatch(
        &self,
        name: &str,
        payload: impl Serialize,
    ) -> Result<Job, QueueError> {
        self.dispatch_job(name, payload, None).await
    }

    /// Dispatch a job that becomes available after `delay`.
    pub async fn dispatch_after(
        &self,
        name: &str,
        payload: impl Serialize,
        delay: std::time::Duration,
    ) -> Result<Job, QueueError> {
        self.dispatch_job(name, payload, Some(delay)).await
    }

    async fn dispatch_job(
        &self,
        name: &str,
        payload: impl Serialize,
        delay: Option<std::time::Duration>,
    ) -> Result<Job, QueueError> {
        let driver = {
            let shared = self.lock();
            if shared.lifecycle == Lifecycle::Stopped {
                return Err(QueueError::QueueStopped);
            }
            shared
                .driver
                .clone()
                .ok_or_else(|| QueueError::InvalidConfig("no driver configured".to_string()))?
        };

        let payload = serde_json::to_value(payload)?;
        let mut job = Job::new(name, payload)
            .with_queue(&self.config.default_queue)
            .with_max_attempts(self.config.max_attempts)
            .with_timeout(self.config.timeout);
        if let Some(delay) = delay {
            job = job.with_delay(delay);
        }

        driver.push(&job).await?;
        Ok(job)
    }

    /// Register (or replace) a worker pool for a job name. A
    /// concurrency of 0 falls back to the configured default. The
    /// handler is wrapped by the middleware chain so the first
    /// registered middleware runs outermost.
    ///
    /// Registration is meant to happen before `start`; registering
    /// while the manager is running only takes effect on the next
    /// start.
    pub fn worker(&self, name: &str, concurrency: usize, handler: Handler) {
        let mut shared = self.lock_mut();
        let concurrency = if concurrency == 0 {
            self.config.workers
        } else {
            concurrency
        };
        let wrapped = wrap_handler(&shared.middleware, handler);
        shared.workers.insert(
            name.to_string(),
            Arc::new(WorkerPool::new(name, concurrency, wrapped)),
        );
    }

    /// Append a middleware. Applies to pools registered afterwards.
    pub fn use_middleware(&self, middleware: Middleware) {
        self.lock_mut().middleware.push(middleware);
    }

    /// Spawn every pool's worker tasks plus the dispatcher. A no-op
    /// when `worker_enabled` is false. The stop signal is recreated on
    /// every start, so stop followed by start is supported.
    pub fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        let mut shared = self.lock_mut();
        if shared.lifecycle == Lifecycle::Running {
            return Err(QueueError::AlreadyRunning);
        }
        if !self.config.worker_enabled {
            info!("queue workers disabled by config");
            return Ok(());
        }
        let driver = shared
            .driver
            .clone()
            .ok_or_else(|| QueueError::InvalidConfig("no driver configured".to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = WorkerContext {
            driver,
            retry_delay: self.config.retry_delay,
            metrics: self.metrics.clone(),
        };

        let mut tasks = Vec::new();
        for pool in shared.workers.values() {
            tasks.extend(pool.spawn(ctx.clone(), stop_rx.clone()));
        }
        tasks.push(tokio::spawn(run_dispatcher(self.clone(), stop_rx)));

        shared.tasks = tasks;
        shared.stop = Some(stop_tx);
        shared.lifecycle = Lifecycle::Running;
        info!(workers = shared.workers.len(), "queue manager started");
        Ok(())
    }

    /// Stop gracefully: signal every task, wait for pools and the
    /// dispatcher to quiesce, then close the driver. Idempotent. Bound
    /// the wait from the outside (`tokio::time::timeout`) if needed.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let (tasks, driver) = {
            let mut shared = self.lock_mut();
            if shared.lifecycle != Lifecycle::Running {
                return Ok(());
            }
            info!(workers = shared.workers.len(), "queue manager stopping");
            shared.lifecycle = Lifecycle::Stopped;
            if let Some(stop) = shared.stop.take() {
                let _ = stop.send(true);
            }
            (std::mem::take(&mut shared.tasks), shared.driver.clone())
        };

        for task in tasks {
            let _ = task.await;
        }

        if let Some(driver) = driver {
            if let Err(err) = driver.close().await {
                tracing::error!(error = %err, "failed to close driver");
                return Err(err);
            }
        }

        info!("queue manager stopped");
        Ok(())
    }

    /// Report the current status of a job, looked up through the driver.
    pub async fn status(&self, job_id: &str) -> Result<StatusReport, QueueError> {
        let driver = self
            .driver()
            .ok_or_else(|| QueueError::InvalidConfig("no driver configured".to_string()))?;
        let job = driver.get(job_id).await?;
        Ok(StatusReport {
            id: job.id.clone(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            state: job.state(),
            attempts: job.attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
            error: job.error,
        })
    }

    /// Current metrics, with per-pool gauges sampled on the spot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let pools = self
            .lock()
            .workers
            .values()
            .map(|pool| PoolGauge {
                queue: pool.name().to_string(),
                depth: pool.depth(),
                workers: pool.concurrency() as u64,
            })
            .collect();
        self.metrics.snapshot(pools)
    }

    /// One dispatcher tick: pop a ready job and route it to its pool.
    async fn poll_once(&self) {
        let Some(driver) = self.driver() else { return };

        let job = match driver.pop(&self.config.default_queue).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "dispatcher failed to pop job");
                return;
            }
        };

        let pool = self.lock().workers.get(&job.name).cloned();
        match pool {
            None => {
                // unknown name is unrecoverable routing: retrying would
                // loop forever, so it goes straight to the failed sink
                let mut job = job;
                warn!(
                    job_id = %job.id,
                    job_name = %job.name,
                    "no worker registered, moving job to failed sink"
                );
                job.mark_failed(format!("no worker registered for job \"{}\"", job.name));
                if let Err(err) = driver.failed(&job).await {
                    warn!(job_id = %job.id, error = %err, "failed to move job to the failed sink");
                }
                let elapsed_ms = (Utc::now() - job.created_at).num_milliseconds().max(0) as u64;
                self.metrics
                    .record_processed(&job.name, Outcome::Failed, elapsed_ms);
            }
            Some(pool) => {
                if let Err(job) = pool.try_dispatch(job) {
                    // pool saturated: cycle the job through the driver
                    // rather than blocking the dispatcher
                    if let Err(err) = driver.push(&job).await {
                        warn!(job_id = %job.id, error = %err, "failed to return job to the driver");
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::RwLockReadGuard<'_, Shared> {
        self.shared.read().expect("manager lock poisoned")
    }

    fn lock_mut(&self) -> std::sync::RwLockWriteGuard<'_, Shared> {
        self.shared.write().expect("manager lock poisoned")
    }
}

/// Status projection returned by [`Manager::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: String,
}

fn wrap_handler(middleware: &[Middleware], handler: Handler) -> Handler {
    let mut wrapped = handler;
    for layer in middleware.iter().rev() {
        wrapped = layer(wrapped);
    }
    wrapped
}

async fn run_dispatcher(manager: Arc<Manager>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(manager.config.poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tick.tick() => manager.poll_once().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;
    use crate::worker::handler;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn memory_manager(config: Config) -> Arc<Manager> {
        Arc::new(Manager::with_driver(config, Arc::new(MemoryDriver::new())))
    }

    fn tracing_middleware(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
        Arc::new(move |next: Handler| {
            let log = log.clone();
            handler(move |job| {
                let log = log.clone();
                let next = next.clone();
                async move {
                    log.lock().unwrap().push(label.to_string());
                    next(job).await
                }
            })
        })
    }

    #[tokio::test]
    async fn dispatch_applies_config_defaults() {
        let config = Config {
            default_queue: "bulk".to_string(),
            max_attempts: 7,
            timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let manager = memory_manager(config);

        let job = manager.dispatch("email", json!({"to": "x"})).await.unwrap();
        assert_eq!(job.queue, "bulk");
        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.timeout, Duration::from_secs(5));
        assert_eq!(
            manager.driver().unwrap().size("bulk").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn dispatch_after_delays_availability() {
        let manager = memory_manager(Config::default());
        let job = manager
            .dispatch_after("email", json!({}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(job.delay, Duration::from_secs(60));
        assert!(!job.is_available());
        assert_eq!(job.state(), JobState::Delayed);
    }

    #[tokio::test]
    async fn dispatch_without_driver_is_invalid() {
        let manager = Manager::new(Config::default());
        assert!(matches!(
            manager.dispatch("j", json!({})).await,
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn status_reports_pending_job() {
        let manager = memory_manager(Config::default());
        let job = manager.dispatch("email", json!({})).await.unwrap();

        let report = manager.status(&job.id).await.unwrap();
        assert_eq!(report.id, job.id);
        assert_eq!(report.state, JobState::Pending);
        assert_eq!(report.attempts, 0);

        assert!(matches!(
            manager.status("missing").await,
            Err(QueueError::JobNotFound)
        ));
    }

    #[tokio::test]
    async fn middleware_wraps_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middleware = vec![
            tracing_middleware("a", log.clone()),
            tracing_middleware("b", log.clone()),
            tracing_middleware("c", log.clone()),
        ];
        let inner = handler({
            let log = log.clone();
            move |_job| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("handler".to_string());
                    Ok(())
                }
            }
        });

        let wrapped = wrap_handler(&middleware, inner);
        wrapped(Job::new("j", json!({}))).await.unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["a", "b", "c", "handler"]
        );
    }

    #[tokio::test]
    async fn worker_zero_concurrency_uses_config_default() {
        let config = Config {
            workers: 3,
            ..Config::default()
        };
        let manager = memory_manager(config);
        manager.worker("email", 0, handler(|_job| async { Ok(()) }));

        let shared = manager.lock();
        assert_eq!(shared.workers["email"].concurrency(), 3);
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let manager = memory_manager(Config::default());
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(QueueError::AlreadyRunning)));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_noop_when_workers_disabled() {
        let config = Config {
            worker_enabled: false,
            ..Config::default()
        };
        let manager = memory_manager(config);
        manager.start().unwrap();
        // no dispatcher was spawned, dispatch still works
        let job = manager.dispatch("j", json!({})).await.unwrap();
        assert!(manager.status(&job.id).await.is_ok());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_blocks_dispatch() {
        let manager = memory_manager(Config::default());
        manager.start().unwrap();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();

        assert!(matches!(
            manager.dispatch("j", json!({})).await,
            Err(QueueError::QueueStopped)
        ));
    }

    #[tokio::test]
    async fn set_driver_refused_while_running() {
        let manager = memory_manager(Config::default());
        manager.start().unwrap();
        assert!(matches!(
            manager.set_driver(Arc::new(MemoryDriver::new())),
            Err(QueueError::AlreadyRunning)
        ));
        manager.stop().await.unwrap();
    }
}
