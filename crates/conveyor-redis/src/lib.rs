//! # Conveyor Redis
//!
//! Durable queue driver backed by Redis. Jobs live in three key
//! families per prefix:
//!
//! - `{prefix}:queues:{name}` — active list, push to tail, pop from head
//! - `{prefix}:queues:{name}:delayed` — sorted set scored by the epoch
//!   second of `available_at`
//! - `{prefix}:failed` — dead-letter list
//!
//! Promotion of due delayed jobs runs as a server-side Lua script, so a
//! job is always in exactly one of the two structures at any observable
//! moment.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use conveyor_queue::{Config, Driver, DriverFuture, DriverRegistry, Job, QueueError};

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Moves every due member of the delayed set to the tail of the active
/// list. Runs atomically on the server: a partially promoted state is
/// never observable and a job can never exist in both structures.
const PROMOTE_DUE_JOBS: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, member in ipairs(due) do
    redis.call('RPUSH', KEYS[2], member)
    redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

/// Redis-backed queue driver.
pub struct RedisDriver {
    conn: ConnectionManager,
    prefix: String,
    promote: Script,
}

impl RedisDriver {
    /// Connect to Redis and verify the connection with a ping.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(to_backend)?;
        let mut conn = client.get_connection_manager().await.map_err(to_backend)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(to_backend)?;
        Ok(Self::with_connection(conn, prefix))
    }

    /// Build a driver over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            promote: Script::new(PROMOTE_DUE_JOBS),
        }
    }

    fn queue_key(&self, name: &str) -> String {
        format!("{}:queues:{}", self.prefix, name)
    }

    fn delayed_key(&self, name: &str) -> String {
        format!("{}:queues:{}:delayed", self.prefix, name)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.prefix)
    }
}

#[async_trait]
impl Driver for RedisDriver {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let data = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();

        if !job.delay.is_zero() || !job.is_available() {
            let score = job.available_at.timestamp();
            let _: () = conn
                .zadd(self.delayed_key(&job.queue), data, score)
                .await
                .map_err(to_backend)?;
        } else {
            let _: () = conn
                .rpush(self.queue_key(&job.queue), data)
                .await
                .map_err(to_backend)?;
        }
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();

        let _promoted: i64 = self
            .promote
            .key(self.delayed_key(queue))
            .key(self.queue_key(queue))
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend)?;

        let data: Option<String> = conn
            .lpop(self.queue_key(queue), None)
            .await
            .map_err(to_backend)?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Jobs leave the store when popped, so there is nothing to remove.
    async fn delete(&self, _job_id: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn retry(&self, job: &Job) -> Result<(), QueueError> {
        self.push(job).await
    }

    async fn failed(&self, job: &Job) -> Result<(), QueueError> {
        let data = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(self.failed_key(), data)
            .await
            .map_err(to_backend)?;
        Ok(())
    }

    /// There is no id index; see the crate docs for the delete/get
    /// asymmetry.
    async fn get(&self, _job_id: &str) -> Result<Job, QueueError> {
        Err(QueueError::Unsupported("get"))
    }

    async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let active: u64 = conn
            .llen(self.queue_key(queue))
            .await
            .map_err(to_backend)?;
        let delayed: u64 = conn
            .zcard(self.delayed_key(queue))
            .await
            .map_err(to_backend)?;
        Ok(active + delayed)
    }

    /// The connection manager reconnects on demand and is released on
    /// drop.
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Register the `redis` driver factory. The Redis URL is read from the
/// `url` entry of the driver options bag.
pub fn register(registry: &mut DriverRegistry) {
    registry.register("redis", |config: &Config| -> DriverFuture {
        let url = config
            .options
            .get("url")
            .and_then(|value| value.as_str())
            .unwrap_or(DEFAULT_URL)
            .to_string();
        let prefix = config.prefix.clone();
        Box::pin(async move {
            let driver = RedisDriver::connect(&url, &prefix).await?;
            Ok(Arc::new(driver) as Arc<dyn Driver>)
        })
    });
}

fn to_backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}
