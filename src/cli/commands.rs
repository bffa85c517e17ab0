use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::session::BrowserSessionManager;
use crate::cli::config::CrawlerConfig;
use crate::crawler::executor::JobExecutor;
use crate::crawler::task::{JobRequest, NewTask, TaskRequest, TaskType};
use crate::crawler::worker::{submit_task, WorkerPool};
use crate::extract::profile::PlatformProfile;
use crate::extract::registry::PlatformScraperRegistry;
use crate::proxy::pool::ProxyPool;
use crate::storage::memory::MemoryStore;
use crate::storage::postgres::PostgresStore;
use crate::storage::queue::{JobQueue, RedisQueue};
use crate::storage::store::Store;

async fn connect_store(config: &CrawlerConfig) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(&config.storage).await?;
    Ok(Arc::new(store))
}

/// Wire an executor to `store`; the session manager is returned so the
/// caller can stop the driver on exit
fn build_executor(config: &CrawlerConfig, store: Arc<dyn Store>) -> Result<(Arc<JobExecutor>, Arc<BrowserSessionManager>)> {
    let proxies = Arc::new(ProxyPool::new(config.proxy.proxy_list.clone()));
    if proxies.is_empty() {
        info!("No proxies configured, using direct connections");
    }

    let browser = Arc::new(BrowserSessionManager::new(config.browser.clone(), proxies)?);
    let registry = Arc::new(
        PlatformScraperRegistry::from_profiles(&config.platforms).context("Invalid platform profile in configuration")?,
    );

    let executor = JobExecutor::new(store, browser.clone(), registry)
        .with_expiry_enforcement(config.worker.enforce_expiry)
        .with_job_timeout(config.worker.job_timeout());
    Ok((Arc::new(executor), browser))
}

/// Build a pending task from command line parameters, rejecting bad input
/// before anything is persisted
fn new_task(owner: i64, platform: &str, task_type: &str, param: &str, expires_in: Option<u64>) -> Result<NewTask> {
    let task_type: TaskType = task_type.parse()?;
    let mut task = NewTask::new(owner, platform, task_type, param);
    TaskRequest::parse(&task.task_type, &task.input)?;

    if let Some(secs) = expires_in {
        task.expires_at = Some(Utc::now() + chrono::Duration::seconds(secs as i64));
    }

    Ok(task)
}

/// Run a worker pool against the shared queue until Ctrl-C
pub async fn worker(config: CrawlerConfig, concurrency: Option<usize>) -> Result<()> {
    let store = connect_store(&config).await?;
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::connect(&config.queue).await?);
    let (executor, browser) = build_executor(&config, store)?;

    let concurrency = concurrency.unwrap_or(config.worker.concurrency);
    let poll_timeout = Duration::from_secs(config.queue.poll_timeout_secs.max(1));
    let pool = WorkerPool::new(executor.clone(), queue, concurrency, poll_timeout);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing in-flight jobs");
            let _ = tx.send(true);
        }
    });

    let stats = pool.run(rx).await;
    browser.shutdown().await;

    let metrics = executor.metrics().get_metrics().await;
    println!("Jobs processed: {} ({} completed, {} failed)", stats.processed, stats.completed, stats.failed);
    println!("Products inserted: {}, updated: {}", metrics.products_inserted, metrics.products_updated);

    Ok(())
}

/// Execute one stored task in this process, bypassing the queue
pub async fn run(config: CrawlerConfig, task_id: i64, owner: i64) -> Result<()> {
    let store = connect_store(&config).await?;
    let task = store
        .get_task(task_id, owner)
        .await?
        .with_context(|| format!("Task {} not found for owner {}", task_id, owner))?;

    let (executor, browser) = build_executor(&config, store)?;
    let outcome = executor.execute(&JobRequest::for_task(&task)).await;
    browser.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_success() {
        bail!("Task {} failed", task_id);
    }

    Ok(())
}

/// One-shot scrape against an in-memory store; prints the products found
pub async fn scrape(config: CrawlerConfig, platform: &str, task_type: &str, param: &str) -> Result<()> {
    const OWNER: i64 = 0;

    let store = Arc::new(MemoryStore::new());
    let task = store.insert_task(&new_task(OWNER, platform, task_type, param, None)?).await?;

    let (executor, browser) = build_executor(&config, store.clone())?;
    let outcome = executor.execute(&JobRequest::for_task(&task)).await;
    browser.shutdown().await;

    let products = store.products_for_task(task.id, OWNER).await?;
    println!("{}", serde_json::to_string_pretty(&products)?);

    match outcome.error {
        Some(error) => bail!("Scrape failed after {} products: {}", outcome.result_count, error),
        None => {
            info!("Scraped {} products", outcome.result_count);
            Ok(())
        }
    }
}

/// Insert a pending task and, unless told otherwise, enqueue it
pub async fn submit(
    config: CrawlerConfig,
    owner: i64,
    platform: &str,
    task_type: &str,
    param: &str,
    expires_in: Option<u64>,
    no_enqueue: bool,
) -> Result<()> {
    let task = new_task(owner, platform, task_type, param, expires_in)?;
    let store = connect_store(&config).await?;

    if no_enqueue {
        let task = store.insert_task(&task).await?;
        println!("Task {} created (not enqueued)", task.id);
        return Ok(());
    }

    let queue = RedisQueue::connect(&config.queue).await?;
    let (task, handle) = submit_task(store.as_ref(), &queue, &task).await?;

    println!("Task {} submitted as job {}", task.id, handle);
    println!("Use `crawler status {} --owner {}` to check progress", task.id, owner);
    Ok(())
}

/// Show a task's state and the products it produced
pub async fn status(config: CrawlerConfig, task_id: i64, owner: i64) -> Result<()> {
    let store = connect_store(&config).await?;
    let task = store
        .get_task(task_id, owner)
        .await?
        .with_context(|| format!("Task {} not found for owner {}", task_id, owner))?;

    println!("Task ID: {}", task.id);
    println!("Platform: {}", task.platform);
    println!("Type: {}", task.task_type);
    println!("Input: {}", task.input);
    println!("Status: {}", task.status);
    println!("Results: {}", task.result_count);
    println!("Created: {}", task.created_at);

    if let Some(started) = task.started_at {
        println!("Started: {}", started);
    }
    if let Some(completed) = task.completed_at {
        println!("Finished: {}", completed);
    }
    if let Some(handle) = &task.external_job_handle {
        println!("Job handle: {}", handle);
    }
    if let Some(error) = &task.error_message {
        println!("Error: {}", error);
    }

    let tracked = store.count_products(owner, Some(&task.platform)).await?;
    println!("Products tracked on {}: {}", task.platform, tracked);

    let products = store.products_for_task(task.id, owner).await?;
    if !products.is_empty() {
        println!("Products first seen by this task:");
        for product in products {
            println!(
                "  - [{}] {} {}",
                product.external_id,
                product.name.as_deref().unwrap_or("(no name)"),
                product.price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }
    }

    Ok(())
}

/// Print a product's price history, optionally recording a snapshot first
pub async fn history(config: CrawlerConfig, product_id: i64, owner: i64, limit: i64, record: bool) -> Result<()> {
    let store = connect_store(&config).await?;
    let product = store
        .get_product(product_id, owner)
        .await?
        .with_context(|| format!("Product {} not found for owner {}", product_id, owner))?;

    if record {
        let snapshot = store.record_snapshot(product_id, owner).await?;
        info!("Recorded snapshot {} at {}", snapshot.id, snapshot.recorded_at);
    }

    println!("{} [{}] on {}", product.name.as_deref().unwrap_or("(no name)"), product.external_id, product.platform);
    let history = store.price_history(product_id, owner, limit).await?;
    if history.is_empty() {
        println!("No price changes recorded");
    }

    for snapshot in history {
        println!(
            "  {}  price={} discount={} sold={} rating={}",
            snapshot.recorded_at,
            display(snapshot.price),
            display(snapshot.discount_percentage),
            display(snapshot.sold_count),
            display(snapshot.rating)
        );
    }

    Ok(())
}

fn display<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Probe every configured proxy
pub async fn proxies(config: CrawlerConfig) -> Result<()> {
    let pool = ProxyPool::new(config.proxy.proxy_list.clone());
    if pool.is_empty() {
        println!("No proxies configured");
        return Ok(());
    }

    let timeout = Duration::from_secs(config.proxy.probe_timeout_secs);
    let results = pool.probe_all(&config.proxy.probe_url, timeout).await;
    let working = results.iter().filter(|(_, ok)| *ok).count();

    for (proxy, ok) in &results {
        println!("  {} {}", if *ok { "OK  " } else { "FAIL" }, proxy.redacted());
    }
    println!("{}/{} proxies working", working, results.len());

    if working == 0 {
        warn!("No working proxies");
    }
    Ok(())
}

/// List supported platforms, built-in and configured
pub async fn platforms(config: CrawlerConfig) -> Result<()> {
    let mut profiles = PlatformProfile::builtin();
    for profile in config.platforms {
        match profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
    }
    profiles.sort_by(|a, b| a.name.cmp(&b.name));

    for profile in profiles {
        println!(
            "  {:<14} cap={:<4} shops={}",
            profile.name,
            profile.result_cap,
            if profile.supports_shops() { "yes" } else { "no" }
        );
    }

    Ok(())
}

/// Print the effective configuration or where it lives
pub async fn show_config(config: &CrawlerConfig, path: Option<&Path>, show: bool) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(CrawlerConfig::default_path);
    println!("Configuration file: {}", path.display());

    if show {
        println!("{}", serde_yaml::to_string(config).context("Failed to serialize configuration")?);
    }

    Ok(())
}
