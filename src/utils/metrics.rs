use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crawler::reconcile::ReconcileReport;

/// Job metrics collector, shared by every worker in the process
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    pub jobs_started: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,

    /// Failures by error kind ("configuration", "resource", ...)
    pub failures_by_kind: HashMap<String, usize>,

    /// Job durations per platform
    pub job_durations: HashMap<String, DurationStats>,

    pub records_extracted: usize,
    pub records_dropped: usize,
    pub products_inserted: usize,
    pub products_updated: usize,
    pub products_unchanged: usize,
}

/// Running totals of job durations, in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    fn add(&mut self, duration_ms: u64) {
        self.count += 1;
        self.total_ms = self.total_ms.saturating_add(duration_ms);
        self.max_ms = self.max_ms.max(duration_ms);
    }
}

impl Metrics {
    /// Mean job duration for a platform in milliseconds
    pub fn average_duration(&self, platform: &str) -> Option<u64> {
        let stats = self.job_durations.get(platform)?;
        if stats.count == 0 {
            return None;
        }
        Some(stats.total_ms / stats.count)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    pub async fn record_start(&self) {
        self.metrics.lock().await.jobs_started += 1;
    }

    pub async fn record_extraction(&self, extracted: usize, dropped: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.records_extracted += extracted;
        metrics.records_dropped += dropped;
    }

    pub async fn record_reconcile(&self, report: &ReconcileReport) {
        let mut metrics = self.metrics.lock().await;
        metrics.products_inserted += report.inserted;
        metrics.products_updated += report.updated;
        metrics.products_unchanged += report.unchanged;
    }

    /// Record a finished job; `failure` carries the error kind
    pub async fn record_finish(&self, platform: &str, duration_ms: u64, failure: Option<&str>) {
        let mut metrics = self.metrics.lock().await;

        match failure {
            None => metrics.jobs_completed += 1,
            Some(kind) => {
                metrics.jobs_failed += 1;
                *metrics.failures_by_kind.entry(kind.to_string()).or_default() += 1;
            }
        }

        metrics
            .job_durations
            .entry(platform.to_string())
            .or_default()
            .add(duration_ms);
    }

    /// Start timing a job
    pub fn start_timer(&self) -> JobTimer {
        JobTimer { start: Instant::now() }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

/// Wall-clock timer for one job
pub struct JobTimer {
    start: Instant,
}

impl JobTimer {
    /// Elapsed time in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
