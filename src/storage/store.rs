use async_trait::async_trait;
use thiserror::Error;

use crate::crawler::task::{NewTask, Task, TaskStatus};
use crate::extract::record::RawRecord;
use crate::storage::model::{PriceSnapshot, Product, ProductKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("product {0} not found")]
    ProductNotFound(i64),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} already has a job handle")]
    HandleAlreadySet(i64),

    /// Another writer inserted the same product first
    #[error("product {0} was inserted concurrently")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("transaction already finished")]
    TransactionClosed,

    /// The caller's deadline passed before the operation finished
    #[error("deadline passed before the write finished")]
    DeadlineExceeded,
}

/// Unit of work for one product observation. Dropping it without calling
/// `commit` rolls every change back.
#[async_trait]
pub trait ProductTx: Send {
    /// Look up by natural key and lock the row for the rest of the transaction
    async fn find_for_update(&mut self, key: &ProductKey) -> Result<Option<Product>, StoreError>;

    /// Fails with `StoreError::Conflict` when the key already exists
    async fn insert_product(
        &mut self,
        key: &ProductKey,
        source_task_id: Option<i64>,
        record: &RawRecord,
    ) -> Result<Product, StoreError>;

    async fn update_product(&mut self, product: &Product) -> Result<(), StoreError>;

    /// Append a snapshot of the product's current price fields
    async fn insert_snapshot(&mut self, product: &Product) -> Result<PriceSnapshot, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

/// Persistence for tasks, products and price history
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_task(&self, task: &NewTask) -> Result<Task, StoreError>;

    /// Owner-scoped lookup; another owner's task reads as absent
    async fn get_task(&self, task_id: i64, owner_id: i64) -> Result<Option<Task>, StoreError>;

    /// Record the queue handle. Set once, never overwritten.
    async fn set_job_handle(&self, task_id: i64, handle: &str) -> Result<(), StoreError>;

    /// pending -> running, stamping `started_at` if unset. Idempotent for
    /// a task that is already running.
    async fn mark_running(&self, task_id: i64) -> Result<Task, StoreError>;

    async fn mark_completed(&self, task_id: i64, result_count: i64) -> Result<Task, StoreError>;

    async fn mark_failed(&self, task_id: i64, error_message: &str, result_count: i64) -> Result<Task, StoreError>;

    async fn begin(&self) -> Result<Box<dyn ProductTx>, StoreError>;

    async fn get_product(&self, product_id: i64, owner_id: i64) -> Result<Option<Product>, StoreError>;

    async fn find_product(&self, key: &ProductKey) -> Result<Option<Product>, StoreError>;

    async fn products_for_task(&self, task_id: i64, owner_id: i64) -> Result<Vec<Product>, StoreError>;

    async fn count_products(&self, owner_id: i64, platform: Option<&str>) -> Result<i64, StoreError>;

    /// Newest first
    async fn price_history(&self, product_id: i64, owner_id: i64, limit: i64) -> Result<Vec<PriceSnapshot>, StoreError>;

    /// Snapshot a product's current values outside of a scrape
    async fn record_snapshot(&self, product_id: i64, owner_id: i64) -> Result<PriceSnapshot, StoreError>;
}
