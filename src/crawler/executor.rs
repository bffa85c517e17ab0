use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use crate::browser::context::ContextProvider;
use crate::crawler::reconcile::{KeyedLocks, ReconciliationEngine};
use crate::crawler::task::{JobOutcome, JobRequest, Task, TaskRequest};
use crate::error::{summarize_error, EngineError};
use crate::extract::pipeline::ExtractionStrategy;
use crate::extract::registry::PlatformScraperRegistry;
use crate::storage::store::{Store, StoreError};
use crate::utils::metrics::{JobTimer, MetricsCollector};

/// A task-level failure plus the records already committed before it
struct JobFailure {
    error: EngineError,
    result_count: i64,
}

/// Default limit on one job, matching the worker setting
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long a context gets to close once the job is over
const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

impl From<EngineError> for JobFailure {
    fn from(error: EngineError) -> Self {
        Self { error, result_count: 0 }
    }
}

/// Runs one scraping job end to end: validate, mark running, acquire a
/// browsing context, extract, reconcile, record the terminal state.
///
/// Every exit path leaves the task completed or failed and hands the
/// context back to the provider.
pub struct JobExecutor {
    store: Arc<dyn Store>,
    browser: Arc<dyn ContextProvider>,
    registry: Arc<PlatformScraperRegistry>,
    reconciler: ReconciliationEngine,
    metrics: MetricsCollector,
    enforce_expiry: bool,
    job_timeout: Duration,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn Store>, browser: Arc<dyn ContextProvider>, registry: Arc<PlatformScraperRegistry>) -> Self {
        let reconciler = ReconciliationEngine::with_locks(store.clone(), KeyedLocks::default());

        Self {
            store,
            browser,
            registry,
            reconciler,
            metrics: MetricsCollector::new(),
            enforce_expiry: false,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// Fail tasks whose `expires_at` has passed instead of running them
    pub fn with_expiry_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_expiry = enforce;
        self
    }

    /// Limit on acquire, extract, release and reconcile together
    pub fn with_job_timeout(mut self, limit: Duration) -> Self {
        self.job_timeout = limit;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Execute a job. Never returns an error: failures end up in the task
    /// row and in the returned outcome.
    pub async fn execute(&self, job: &JobRequest) -> JobOutcome {
        let span = info_span!(
            "job",
            task_id = job.task_id,
            owner_id = job.owner_id,
            platform = %job.platform,
            task_type = %job.task_type
        );

        self.execute_inner(job).instrument(span).await
    }

    async fn execute_inner(&self, job: &JobRequest) -> JobOutcome {
        let timer = self.metrics.start_timer();

        let task = match self.store.get_task(job.task_id, job.owner_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("Task {} not found for owner {}", job.task_id, job.owner_id);
                self.metrics.record_start().await;
                self.metrics.record_finish(&job.platform, timer.end(), Some("missing")).await;
                return JobOutcome::failed(job.task_id, 0, format!("task {} not found", job.task_id));
            }
            Err(e) => {
                let error = EngineError::from(e);
                error!("Failed to load task: {}", error);
                self.metrics.record_start().await;
                self.metrics.record_finish(&job.platform, timer.end(), Some(error.kind())).await;
                return JobOutcome::failed(job.task_id, 0, summarize_error(&error));
            }
        };

        if task.status.is_terminal() {
            warn!("Task already {}, not running it again", task.status);
            return JobOutcome {
                task_id: task.id,
                status: task.status,
                result_count: task.result_count,
                error: task.error_message.clone(),
            };
        }

        self.metrics.record_start().await;

        // Configuration problems fail the task before any browser work
        let (strategy, request) = match self.prepare(job, &task) {
            Ok(prepared) => prepared,
            Err(error) => return self.fail(job, &timer, JobFailure::from(error)).await,
        };

        if let Err(e) = self.store.mark_running(task.id).await {
            return self.fail(job, &timer, JobFailure::from(EngineError::from(e))).await;
        }
        info!("Task running");

        match self.run(job, strategy, &request).await {
            Ok(result_count) => self.complete(job, &timer, result_count).await,
            Err(failure) => self.fail(job, &timer, failure).await,
        }
    }

    fn prepare(&self, job: &JobRequest, task: &Task) -> Result<(Arc<dyn ExtractionStrategy>, TaskRequest), EngineError> {
        let request = TaskRequest::parse(&job.task_type, &job.input)?;
        let strategy = self.registry.resolve(&job.platform)?;

        if self.enforce_expiry && task.is_expired(Utc::now()) {
            if let Some(expires_at) = task.expires_at {
                return Err(EngineError::Expired(expires_at));
            }
        }

        Ok((strategy, request))
    }

    async fn run(
        &self,
        job: &JobRequest,
        strategy: Arc<dyn ExtractionStrategy>,
        request: &TaskRequest,
    ) -> Result<i64, JobFailure> {
        let deadline = Instant::now() + self.job_timeout;

        let context = timeout_at(deadline, self.browser.acquire_context())
            .await
            .map_err(|_| self.timed_out())??;

        let extraction = match timeout_at(deadline, strategy.run(context.as_ref(), request)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out()),
        };

        if timeout(RELEASE_TIMEOUT, self.browser.release(context)).await.is_err() {
            warn!("Browsing context did not close within {:?}", RELEASE_TIMEOUT);
        }

        let extraction = extraction?;
        self.metrics
            .record_extraction(extraction.records.len(), extraction.dropped)
            .await;

        match self
            .reconciler
            .reconcile_until(Some(deadline), job.owner_id, job.task_id, &job.platform, &extraction.records)
            .await
        {
            Ok(report) => {
                self.metrics.record_reconcile(&report).await;
                Ok(report.processed as i64)
            }
            Err(err) => {
                self.metrics.record_reconcile(&err.committed).await;
                let error = match err.source {
                    StoreError::DeadlineExceeded => self.timed_out(),
                    source => EngineError::Persistence(source),
                };
                Err(JobFailure {
                    result_count: err.committed.processed as i64,
                    error,
                })
            }
        }
    }

    fn timed_out(&self) -> EngineError {
        warn!("Job hit its {}s time limit", self.job_timeout.as_secs());
        EngineError::Timeout(self.job_timeout)
    }

    async fn complete(&self, job: &JobRequest, timer: &JobTimer, result_count: i64) -> JobOutcome {
        match self.store.mark_completed(job.task_id, result_count).await {
            Ok(_) => {
                info!("Task completed with {} results", result_count);
                self.metrics.record_finish(&job.platform, timer.end(), None).await;
                JobOutcome::completed(job.task_id, result_count)
            }
            Err(e) => {
                let failure = JobFailure {
                    error: EngineError::from(e),
                    result_count,
                };
                self.fail(job, timer, failure).await
            }
        }
    }

    async fn fail(&self, job: &JobRequest, timer: &JobTimer, failure: JobFailure) -> JobOutcome {
        let message = summarize_error(&failure.error);
        error!("Task failed: {}", message);

        if let Err(e) = self.store.mark_failed(job.task_id, &message, failure.result_count).await {
            error!("Failed to record task failure: {}", e);
        }

        self.metrics
            .record_finish(&job.platform, timer.end(), Some(failure.error.kind()))
            .await;
        JobOutcome::failed(job.task_id, failure.result_count, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::context::testing::FakeProvider;
    use crate::browser::context::MockContextProvider;
    use crate::crawler::reconcile::testing::FailingStore;
    use crate::crawler::task::{NewTask, TaskStatus, TaskType};
    use crate::extract::profile::PlatformProfile;
    use crate::storage::memory::MemoryStore;
    use crate::storage::model::ProductKey;
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    const SEARCH_URL: &str = "https://shopee.co.id/search?keyword=phone";

    fn page(items: &[(&str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(id, price)| {
                format!(
                    r#"<div data-sqe="product" data-itemid="{}"><div class="product-name">Phone {}</div><span class="product-price">{}</span></div>"#,
                    id, id, price
                )
            })
            .collect();
        format!("<html><body>{}</body></html>", body)
    }

    fn registry() -> Arc<PlatformScraperRegistry> {
        Arc::new(PlatformScraperRegistry::with_builtin().unwrap())
    }

    async fn submit(store: &dyn Store, platform: &str, task_type: TaskType, param: &str) -> JobRequest {
        let task = store.insert_task(&NewTask::new(7, platform, task_type, param)).await.unwrap();
        JobRequest::for_task(&task)
    }

    #[tokio::test]
    async fn test_first_run_inserts_products() {
        let store = MemoryStore::new();
        let provider = FakeProvider::with_pages(&[(SEARCH_URL, &page(&[("A", "Rp50.000"), ("B", "Rp75.000"), ("C", "Rp10.000")]))]);
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry());

        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome, JobOutcome::completed(job.task_id, 3));
        assert_eq!(store.all_products(7).await.len(), 3);
        assert!(store.all_snapshots(7).await.is_empty());

        let task = store.get_task(job.task_id, 7).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_count, 3);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert_eq!(provider.outstanding(), 0);

        let metrics = executor.metrics().get_metrics().await;
        assert_eq!(metrics.jobs_completed, 1);
        assert_eq!(metrics.products_inserted, 3);
    }

    #[tokio::test]
    async fn test_rerun_records_price_change() {
        let store = MemoryStore::new();
        let first = FakeProvider::with_pages(&[(SEARCH_URL, &page(&[("A", "Rp50.000"), ("B", "Rp75.000"), ("C", "Rp10.000")]))]);
        JobExecutor::new(Arc::new(store.clone()), Arc::new(first), registry())
            .execute(&submit(&store, "shopee", TaskType::KeywordSearch, "phone").await)
            .await;

        let second = FakeProvider::with_pages(&[(SEARCH_URL, &page(&[("A", "Rp45.000"), ("B", "Rp75.000"), ("D", "Rp99.000")]))]);
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(second), registry());
        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome.result_count, 3);
        assert_eq!(store.all_products(7).await.len(), 4);

        let snapshots = store.all_snapshots(7).await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].price, Some(45000.0));

        let a = store.find_product(&ProductKey::new("shopee", "A", 7)).await.unwrap().unwrap();
        assert_eq!(a.price, Some(45000.0));
    }

    #[tokio::test]
    async fn test_navigation_timeout_completes_empty() {
        let store = MemoryStore::new();
        let provider = FakeProvider {
            degraded: true,
            ..Default::default()
        };
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry());

        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome, JobOutcome::completed(job.task_id, 0));
        assert!(store.all_products(7).await.is_empty());
        assert_eq!(provider.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unknown_platform_fails_without_browser() {
        let store = MemoryStore::new();
        let provider = FakeProvider::default();
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry());

        let job = submit(&store, "unknown_platform", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.result_count, 0);
        assert_eq!(provider.acquired.load(Ordering::SeqCst), 0);

        let task = store.get_task(job.task_id, 7).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("configuration error"));
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_input_fails_task() {
        let store = MemoryStore::new();
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(FakeProvider::default()), registry());

        let mut task = NewTask::new(7, "shopee", TaskType::KeywordSearch, "phone");
        task.input = serde_json::json!({ "query": "phone" });
        let task = store.insert_task(&task).await.unwrap();

        let outcome = executor.execute(&JobRequest::for_task(&task)).await;
        assert!(outcome.error.unwrap().contains("'keyword'"));
    }

    #[tokio::test]
    async fn test_launch_failure_fails_task() {
        let store = MemoryStore::new();
        let mut provider = MockContextProvider::new();
        provider
            .expect_acquire_context()
            .times(1)
            .returning(|| Err(EngineError::resource("chromedriver exited with status 1")));
        provider.expect_release().times(0);

        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider), registry());
        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.error.unwrap().contains("browser resource error"));

        let task = store.get_task(job.task_id, 7).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_context_released_when_strategy_fails() {
        let store = MemoryStore::new();
        let provider = FakeProvider::default();
        let mut shopee = PlatformProfile::shopee();
        shopee.shop_url.clear();
        let registry = Arc::new(PlatformScraperRegistry::from_profiles(&[shopee]).unwrap());
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry);

        let job = submit(&store, "shopee", TaskType::ShopMonitor, "12345").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(provider.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_partial_count() {
        let memory = MemoryStore::new();
        let store = Arc::new(FailingStore::new(memory.clone(), 2));
        let provider = FakeProvider::with_pages(&[(SEARCH_URL, &page(&[("A", "Rp1"), ("B", "Rp2"), ("C", "Rp3")]))]);
        let executor = JobExecutor::new(store.clone(), Arc::new(provider), registry());

        let job = submit(store.as_ref(), "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.result_count, 2);
        assert!(outcome.error.unwrap().contains("persistence error"));
        assert_eq!(memory.all_products(7).await.len(), 2);

        let task = memory.get_task(job.task_id, 7).await.unwrap().unwrap();
        assert_eq!(task.result_count, 2);
    }

    #[tokio::test]
    async fn test_item_without_id_creates_no_product() {
        let store = MemoryStore::new();
        let mut shopee = PlatformProfile::shopee();
        shopee.fields.id_link_pattern = Some(r"id=([^&]*)".to_string());
        let registry = Arc::new(PlatformScraperRegistry::from_profiles(&[shopee]).unwrap());

        let html = r#"<html><body>
            <div data-sqe="product"><a href="/item?id=&x=1">nameless</a></div>
            <div data-sqe="product" data-itemid="A"><span class="product-price">Rp1</span></div>
            </body></html>"#;
        let provider = FakeProvider::with_pages(&[(SEARCH_URL, html)]);
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider), registry);

        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = executor.execute(&job).await;

        assert_eq!(outcome, JobOutcome::completed(job.task_id, 1));
        let products = store.all_products(7).await;
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].external_id, "A");
        assert_eq!(executor.metrics().get_metrics().await.records_dropped, 1);
    }

    #[tokio::test]
    async fn test_stalled_page_fails_at_time_limit() {
        let store = MemoryStore::new();
        let provider = FakeProvider {
            stalled: true,
            ..FakeProvider::with_pages(&[(SEARCH_URL, &page(&[("A", "Rp1")]))])
        };
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry())
            .with_job_timeout(std::time::Duration::from_millis(50));

        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), executor.execute(&job))
            .await
            .unwrap();

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.result_count, 0);
        assert!(outcome.error.unwrap().contains("time limit"));
        assert_eq!(provider.outstanding(), 0);
        assert!(store.all_products(7).await.is_empty());

        let task = store.get_task(job.task_id, 7).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_some());
        assert_eq!(executor.metrics().get_metrics().await.failures_by_kind.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn test_expired_task_fails_when_enforced() {
        let store = MemoryStore::new();
        let provider = FakeProvider::default();
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry())
            .with_expiry_enforcement(true);

        let mut task = NewTask::new(7, "shopee", TaskType::KeywordSearch, "phone");
        task.expires_at = Some(Utc::now() - Duration::minutes(5));
        let task = store.insert_task(&task).await.unwrap();

        let outcome = executor.execute(&JobRequest::for_task(&task)).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.error.unwrap().contains("expired"));
        assert_eq!(provider.acquired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminal_task_is_not_rerun() {
        let store = MemoryStore::new();
        let provider = FakeProvider::with_pages(&[(SEARCH_URL, &page(&[("A", "Rp1")]))]);
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(provider.clone()), registry());

        let job = submit(&store, "shopee", TaskType::KeywordSearch, "phone").await;
        let first = executor.execute(&job).await;
        let second = executor.execute(&job).await;

        assert_eq!(first, second);
        assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(executor.metrics().get_metrics().await.jobs_started, 1);
    }

    #[tokio::test]
    async fn test_missing_task_reports_failure() {
        let store = MemoryStore::new();
        let executor = JobExecutor::new(Arc::new(store), Arc::new(FakeProvider::default()), registry());

        let job = JobRequest {
            task_id: 404,
            owner_id: 7,
            platform: "shopee".to_string(),
            task_type: "keyword_search".to_string(),
            input: serde_json::json!({ "keyword": "phone" }),
            job_handle: None,
        };

        let outcome = executor.execute(&job).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.error.unwrap().contains("not found"));
    }
}
