use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crawler::executor::JobExecutor;
use crate::crawler::task::{JobOutcome, JobRequest, NewTask, Task, TaskStatus};
use crate::storage::queue::JobQueue;
use crate::storage::store::Store;

/// Counts of jobs a pool (or one worker) handled before stopping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome.status {
            TaskStatus::Completed => self.completed += 1,
            _ => self.failed += 1,
        }
    }

    fn merge(&mut self, other: WorkerStats) {
        self.processed += other.processed;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// A fixed number of workers pulling jobs from a shared queue
pub struct WorkerPool {
    executor: Arc<JobExecutor>,
    queue: Arc<dyn JobQueue>,
    concurrency: usize,
    poll_timeout: Duration,
}

impl WorkerPool {
    pub fn new(executor: Arc<JobExecutor>, queue: Arc<dyn JobQueue>, concurrency: usize, poll_timeout: Duration) -> Self {
        Self {
            executor,
            queue,
            concurrency: concurrency.max(1),
            poll_timeout,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    /// In-flight jobs are finished before their worker exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!("Starting {} workers", self.concurrency);

        let mut workers = Vec::with_capacity(self.concurrency);
        for id in 0..self.concurrency {
            workers.push(task::spawn(worker_loop(
                id,
                self.executor.clone(),
                self.queue.clone(),
                self.poll_timeout,
                shutdown.clone(),
            )));
        }

        let mut stats = WorkerStats::default();
        for worker in workers {
            match worker.await {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => error!("Worker task aborted: {}", e),
            }
        }

        info!(
            "Workers stopped: {} processed, {} completed, {} failed",
            stats.processed, stats.completed, stats.failed
        );
        stats
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    // A dropped sender also means stop
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn worker_loop(
    id: usize,
    executor: Arc<JobExecutor>,
    queue: Arc<dyn JobQueue>,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    debug!("Worker {} started", id);
    let mut stats = WorkerStats::default();

    // pop is never raced against shutdown so a dequeued job is never dropped
    while !shutdown_requested(&shutdown) {
        match queue.pop(poll_timeout).await {
            Ok(Some(job)) => {
                debug!("Worker {} picked up task {}", id, job.task_id);
                let outcome = executor.execute(&job).await;
                stats.record(&outcome);

                if let Some(handle) = &job.job_handle {
                    if let Err(e) = queue.complete(handle, &outcome).await {
                        warn!("Failed to publish outcome for job {}: {}", handle, e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Worker {} failed to read from queue: {}", id, e);
                tokio::time::sleep(poll_timeout).await;
            }
        }
    }

    debug!("Worker {} stopped", id);
    stats
}

/// Persist a new task, give it a job handle and enqueue it
pub async fn submit_task(store: &dyn Store, queue: &dyn JobQueue, task: &NewTask) -> Result<(Task, String)> {
    let mut task = store.insert_task(task).await?;
    let handle = Uuid::new_v4().to_string();
    store.set_job_handle(task.id, &handle).await?;
    task.external_job_handle = Some(handle.clone());

    let job = JobRequest::for_task(&task);
    queue.push(&job).await?;

    info!("Submitted task {} ({} on {}) as job {}", task.id, task.task_type, task.platform, handle);
    Ok((task, handle))
}
