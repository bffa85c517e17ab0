use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::EngineError;

/// Lifecycle state of a scraping task. Only moves forward:
/// pending -> running -> completed | failed, plus pending -> failed for
/// tasks rejected before they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a task in this state may move to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// States from which `target` can be reached
    pub fn sources_of(target: TaskStatus) -> &'static [TaskStatus] {
        match target {
            Self::Pending => &[],
            Self::Running => &[Self::Pending],
            Self::Completed => &[Self::Running],
            Self::Failed => &[Self::Pending, Self::Running],
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of scrape a task asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    KeywordSearch,
    UrlScrape,
    ShopMonitor,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeywordSearch => "keyword_search",
            Self::UrlScrape => "url_scrape",
            Self::ShopMonitor => "shop_monitor",
        }
    }

    /// Name of the input parameter this task type reads
    pub fn input_key(&self) -> &'static str {
        match self {
            Self::KeywordSearch => "keyword",
            Self::UrlScrape => "url",
            Self::ShopMonitor => "shop_id",
        }
    }
}

impl FromStr for TaskType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword_search" => Ok(Self::KeywordSearch),
            "url_scrape" => Ok(Self::UrlScrape),
            "shop_monitor" => Ok(Self::ShopMonitor),
            other => Err(EngineError::configuration(format!("unknown task type: {}", other))),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted scraping task. Platform and task type stay as submitted so
/// that unsupported values are recorded and rejected at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub owner_id: i64,
    pub platform: String,
    pub task_type: String,
    pub input: Value,
    pub status: TaskStatus,
    pub result_count: i64,
    pub error_message: Option<String>,
    pub external_job_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }
}

/// Fields supplied when a task is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub owner_id: i64,
    pub platform: String,
    pub task_type: String,
    pub input: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Convenience constructor for the common single-parameter input
    pub fn new(owner_id: i64, platform: &str, task_type: TaskType, param: &str) -> Self {
        let mut input = serde_json::Map::new();
        input.insert(task_type.input_key().to_string(), Value::String(param.to_string()));

        Self {
            owner_id,
            platform: platform.to_string(),
            task_type: task_type.as_str().to_string(),
            input: Value::Object(input),
            expires_at: None,
        }
    }
}

/// Validated, typed task input
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    KeywordSearch { keyword: String },
    UrlScrape { url: Url },
    ShopMonitor { shop_id: String },
}

impl TaskRequest {
    /// Validate raw task type and input parameters
    pub fn parse(task_type: &str, input: &Value) -> Result<Self, EngineError> {
        let task_type: TaskType = task_type.parse()?;
        let key = task_type.input_key();

        let param = input
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                EngineError::configuration(format!("{} task requires a non-empty '{}' parameter", task_type, key))
            })?;

        match task_type {
            TaskType::KeywordSearch => Ok(Self::KeywordSearch { keyword: param.to_string() }),
            TaskType::ShopMonitor => Ok(Self::ShopMonitor { shop_id: param.to_string() }),
            TaskType::UrlScrape => {
                let url = Url::parse(param)
                    .map_err(|e| EngineError::configuration(format!("invalid url '{}': {}", param, e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(EngineError::configuration(format!("unsupported url scheme: {}", url.scheme())));
                }
                Ok(Self::UrlScrape { url })
            }
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Self::KeywordSearch { .. } => TaskType::KeywordSearch,
            Self::UrlScrape { .. } => TaskType::UrlScrape,
            Self::ShopMonitor { .. } => TaskType::ShopMonitor,
        }
    }
}

/// Message placed on the job queue for one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub task_id: i64,
    pub owner_id: i64,
    pub platform: String,
    pub task_type: String,
    pub input: Value,

    /// Opaque handle for the queue side; `None` for direct runs
    pub job_handle: Option<String>,
}

impl JobRequest {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            owner_id: task.owner_id,
            platform: task.platform.clone(),
            task_type: task.task_type.clone(),
            input: task.input.clone(),
            job_handle: task.external_job_handle.clone(),
        }
    }
}

/// Terminal result of one job execution, returned to the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub task_id: i64,
    pub status: TaskStatus,
    pub result_count: i64,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn completed(task_id: i64, result_count: i64) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            result_count,
            error: None,
        }
    }

    pub fn failed(task_id: i64, result_count: i64, error: String) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            result_count,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_only_move_forward() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }

        for target in [Pending, Running, Completed, Failed] {
            for source in TaskStatus::sources_of(target) {
                assert!(source.can_transition_to(target));
            }
        }
    }

    #[test]
    fn test_parse_requests() {
        let keyword = TaskRequest::parse("keyword_search", &json!({"keyword": " phone "})).unwrap();
        assert_eq!(keyword, TaskRequest::KeywordSearch { keyword: "phone".to_string() });

        let shop = TaskRequest::parse("shop_monitor", &json!({"shop_id": "12345"})).unwrap();
        assert_eq!(shop.task_type(), TaskType::ShopMonitor);

        let url = TaskRequest::parse("url_scrape", &json!({"url": "https://shopee.co.id/item-i.1.2"})).unwrap();
        match url {
            TaskRequest::UrlScrape { url } => assert_eq!(url.host_str(), Some("shopee.co.id")),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let missing = TaskRequest::parse("keyword_search", &json!({})).unwrap_err();
        assert!(matches!(missing, EngineError::Configuration(_)));

        let blank = TaskRequest::parse("keyword_search", &json!({"keyword": "   "})).unwrap_err();
        assert!(matches!(blank, EngineError::Configuration(_)));

        let unknown = TaskRequest::parse("price_watch", &json!({"keyword": "x"})).unwrap_err();
        assert!(unknown.to_string().contains("unknown task type"));

        let relative = TaskRequest::parse("url_scrape", &json!({"url": "/search?q=x"})).unwrap_err();
        assert!(matches!(relative, EngineError::Configuration(_)));

        let ftp = TaskRequest::parse("url_scrape", &json!({"url": "ftp://host/file"})).unwrap_err();
        assert!(ftp.to_string().contains("unsupported url scheme"));
    }

    #[test]
    fn test_new_task_input_shape() {
        let task = NewTask::new(7, "shopee", TaskType::KeywordSearch, "phone");
        assert_eq!(task.task_type, "keyword_search");
        assert_eq!(task.input, json!({"keyword": "phone"}));
    }

    #[test]
    fn test_job_outcome_serialization() {
        let outcome = JobOutcome::failed(3, 0, "configuration error: unknown platform".to_string());
        let value = serde_json::to_value(&outcome).unwrap();

        assert_eq!(value["status"], "failed");
        assert_eq!(value["result_count"], 0);
        assert!(!outcome.is_success());
    }
}
