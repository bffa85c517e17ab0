use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::cli::config::QueueSettings;
use crate::crawler::task::{JobOutcome, JobRequest};

/// Delivery of job requests to workers
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: &JobRequest) -> Result<()>;

    /// Wait up to `timeout` for the next job
    async fn pop(&self, timeout: Duration) -> Result<Option<JobRequest>>;

    /// Publish the outcome for a job handle and release it
    async fn complete(&self, handle: &str, outcome: &JobOutcome) -> Result<()>;

    async fn pending_count(&self) -> Result<usize>;
}

/// Redis-backed queue shared by every worker process
pub struct RedisQueue {
    queue_key: String,

    /// Time to live for published results, in seconds
    result_ttl: u64,

    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisQueue {
    pub async fn connect(config: &QueueSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            queue_key: config.queue_key.clone(),
            result_ttl: config.result_ttl,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.queue_key)
    }

    fn result_key(&self, handle: &str) -> String {
        format!("{}:results:{}", self.queue_key, handle)
    }

    /// Read a published outcome
    pub async fn result(&self, handle: &str) -> Result<Option<JobOutcome>> {
        let mut conn = self.conn.lock().await;
        let json: Option<String> = redis::cmd("GET")
            .arg(self.result_key(handle))
            .query_async(&mut *conn)
            .await
            .context("Failed to read job result")?;

        json.map(|json| serde_json::from_str(&json).context("Failed to deserialize job result"))
            .transpose()
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn push(&self, job: &JobRequest) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job")?;

        let mut conn = self.conn.lock().await;
        redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(&job_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push job to Redis queue")?;

        debug!("Pushed job for task {} to queue", job.task_id);
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<JobRequest>> {
        let job_json: Option<String> = {
            let mut conn = self.conn.lock().await;
            redis::cmd("RPOP")
                .arg(&self.queue_key)
                .query_async(&mut *conn)
                .await
                .context("Failed to pop job from Redis queue")?
        };

        let Some(job_json) = job_json else {
            // Nothing queued; back off before the caller polls again
            tokio::time::sleep(timeout.min(Duration::from_millis(500))).await;
            return Ok(None);
        };

        let job: JobRequest = serde_json::from_str(&job_json).context("Failed to deserialize job")?;

        if let Some(handle) = &job.job_handle {
            let mut conn = self.conn.lock().await;
            redis::cmd("SADD")
                .arg(self.processing_key())
                .arg(handle)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to add job to processing set")?;
        }

        debug!("Popped job for task {} from queue", job.task_id);
        Ok(Some(job))
    }

    async fn complete(&self, handle: &str, outcome: &JobOutcome) -> Result<()> {
        let outcome_json = serde_json::to_string(outcome).context("Failed to serialize job outcome")?;

        let mut conn = self.conn.lock().await;
        redis::cmd("SREM")
            .arg(self.processing_key())
            .arg(handle)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to remove job from processing set")?;

        redis::cmd("SET")
            .arg(self.result_key(handle))
            .arg(&outcome_json)
            .arg("EX")
            .arg(self.result_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to store job result")?;

        debug!("Stored result for job {}", handle);
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let count: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;

        Ok(count)
    }
}

/// In-process FIFO queue for standalone runs
#[derive(Default)]
pub struct LocalQueue {
    jobs: Mutex<VecDeque<JobRequest>>,
    outcomes: Mutex<Vec<(String, JobOutcome)>>,
    notify: Notify,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes published so far, in completion order
    pub async fn outcomes(&self) -> Vec<(String, JobOutcome)> {
        self.outcomes.lock().await.clone()
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn push(&self, job: &JobRequest) -> Result<()> {
        self.jobs.lock().await.push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<JobRequest>> {
        if let Some(job) = self.jobs.lock().await.pop_front() {
            return Ok(Some(job));
        }

        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(self.jobs.lock().await.pop_front())
    }

    async fn complete(&self, handle: &str, outcome: &JobOutcome) -> Result<()> {
        self.outcomes.lock().await.push((handle.to_string(), outcome.clone()));
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.jobs.lock().await.len())
    }
}
