use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;

use crate::cli::config::StorageSettings;
use crate::crawler::task::{NewTask, Task, TaskStatus};
use crate::extract::record::RawRecord;
use crate::storage::model::{PriceSnapshot, Product, ProductKey};
use crate::storage::store::{ProductTx, Store, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS scraping_tasks (
        id BIGSERIAL PRIMARY KEY,
        owner_id BIGINT NOT NULL,
        platform TEXT NOT NULL,
        task_type TEXT NOT NULL,
        input_data JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        result_count BIGINT NOT NULL DEFAULT 0,
        error_message TEXT,
        external_job_handle TEXT UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_scraping_tasks_owner ON scraping_tasks (owner_id)",
    "CREATE TABLE IF NOT EXISTS products (
        id BIGSERIAL PRIMARY KEY,
        source_task_id BIGINT REFERENCES scraping_tasks (id) ON DELETE SET NULL,
        owner_id BIGINT NOT NULL,
        platform TEXT NOT NULL,
        external_id TEXT NOT NULL,
        name TEXT,
        price DOUBLE PRECISION,
        original_price DOUBLE PRECISION,
        discount_percentage INTEGER,
        sold_count BIGINT,
        rating DOUBLE PRECISION,
        review_count BIGINT,
        shop_id TEXT,
        shop_name TEXT,
        shop_location TEXT,
        url TEXT,
        image_urls JSONB NOT NULL DEFAULT '[]',
        description TEXT,
        category TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        raw_payload JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uq_products_platform_external_owner UNIQUE (platform, external_id, owner_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_products_owner_platform ON products (owner_id, platform)",
    "CREATE TABLE IF NOT EXISTS price_history (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL REFERENCES products (id) ON DELETE CASCADE,
        owner_id BIGINT NOT NULL,
        price DOUBLE PRECISION,
        discount_percentage INTEGER,
        sold_count BIGINT,
        rating DOUBLE PRECISION,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_price_history_product ON price_history (product_id, recorded_at DESC)",
];

const TASK_COLUMNS: &str = "id, owner_id, platform, task_type, input_data, status, result_count, error_message, \
     external_job_handle, created_at, started_at, completed_at, expires_at";

const PRODUCT_COLUMNS: &str = "id, owner_id, platform, external_id, source_task_id, name, price, original_price, \
     discount_percentage, sold_count, rating, review_count, shop_id, shop_name, shop_location, url, image_urls, \
     description, category, status, raw_payload, created_at, updated_at";

const SNAPSHOT_COLUMNS: &str = "id, product_id, owner_id, price, discount_percentage, sold_count, rating, recorded_at";

/// PostgreSQL store. Uniqueness of products is backed by a table
/// constraint and row locks, so several worker processes can share it.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn connect(settings: &StorageSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = Self { pool };
        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL database");
        Ok(store)
    }

    /// Create tables and indexes if they are missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create database schema")?;
        }

        debug!("Ensured database schema exists");
        Ok(())
    }

    async fn transition(
        &self,
        task_id: i64,
        target: TaskStatus,
        result_count: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<Task, StoreError> {
        let sources: Vec<String> = TaskStatus::sources_of(target)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let query = format!(
            "UPDATE scraping_tasks SET
                status = $2,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                result_count = COALESCE($3, result_count),
                error_message = CASE WHEN $2 = 'failed' THEN $4 WHEN $2 = 'completed' THEN NULL ELSE error_message END
             WHERE id = $1 AND status = ANY($5)
             RETURNING {}",
            TASK_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(task_id)
            .bind(target.as_str())
            .bind(result_count)
            .bind(error_message)
            .bind(&sources)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => task_from_row(&row),
            None => {
                let current = self.current_status(task_id).await?;
                Err(StoreError::InvalidTransition {
                    task_id,
                    from: current,
                    to: target,
                })
            }
        }
    }

    async fn current_status(&self, task_id: i64) -> Result<TaskStatus, StoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM scraping_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        status
            .ok_or(StoreError::TaskNotFound(task_id))?
            .parse()
            .map_err(StoreError::Corrupt)
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;
    let input: Json<serde_json::Value> = row.try_get("input_data")?;

    Ok(Task {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        platform: row.try_get("platform")?,
        task_type: row.try_get("task_type")?,
        input: input.0,
        status: status.parse().map_err(StoreError::Corrupt)?,
        result_count: row.try_get("result_count")?,
        error_message: row.try_get("error_message")?,
        external_job_handle: row.try_get("external_job_handle")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let status: String = row.try_get("status")?;
    let image_urls: Json<Vec<String>> = row.try_get("image_urls")?;
    let raw_payload: Json<serde_json::Value> = row.try_get("raw_payload")?;

    Ok(Product {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        platform: row.try_get("platform")?,
        external_id: row.try_get("external_id")?,
        source_task_id: row.try_get("source_task_id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        original_price: row.try_get("original_price")?,
        discount_percentage: row.try_get("discount_percentage")?,
        sold_count: row.try_get("sold_count")?,
        rating: row.try_get("rating")?,
        review_count: row.try_get("review_count")?,
        shop_id: row.try_get("shop_id")?,
        shop_name: row.try_get("shop_name")?,
        shop_location: row.try_get("shop_location")?,
        url: row.try_get("url")?,
        image_urls: image_urls.0,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        raw_payload: raw_payload.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<PriceSnapshot, StoreError> {
    Ok(PriceSnapshot {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        owner_id: row.try_get("owner_id")?,
        price: row.try_get("price")?,
        discount_percentage: row.try_get("discount_percentage")?,
        sold_count: row.try_get("sold_count")?,
        rating: row.try_get("rating")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

/// Snapshot insert shared by transactional and standalone paths
fn snapshot_query() -> String {
    format!(
        "INSERT INTO price_history (product_id, owner_id, price, discount_percentage, sold_count, rating, recorded_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW())
         RETURNING {}",
        SNAPSHOT_COLUMNS
    )
}

pub struct PgProductTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgProductTx {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl ProductTx for PgProductTx {
    async fn find_for_update(&mut self, key: &ProductKey) -> Result<Option<Product>, StoreError> {
        let query = format!(
            "SELECT {} FROM products WHERE platform = $1 AND external_id = $2 AND owner_id = $3 FOR UPDATE",
            PRODUCT_COLUMNS
        );

        let tx = self.tx()?;
        let row = sqlx::query(&query)
            .bind(&key.platform)
            .bind(&key.external_id)
            .bind(key.owner_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_product(
        &mut self,
        key: &ProductKey,
        source_task_id: Option<i64>,
        record: &RawRecord,
    ) -> Result<Product, StoreError> {
        let query = format!(
            "INSERT INTO products (owner_id, platform, external_id, source_task_id, name, price, original_price,
                discount_percentage, sold_count, rating, review_count, shop_id, shop_name, shop_location, url,
                image_urls, description, category, status, raw_payload, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, 'active', $19, NOW(), NOW())
             ON CONFLICT (platform, external_id, owner_id) DO NOTHING
             RETURNING {}",
            PRODUCT_COLUMNS
        );

        let tx = self.tx()?;
        let row = sqlx::query(&query)
            .bind(key.owner_id)
            .bind(&key.platform)
            .bind(&key.external_id)
            .bind(source_task_id)
            .bind(&record.name)
            .bind(record.price)
            .bind(record.original_price)
            .bind(record.discount_percentage)
            .bind(record.sold_count)
            .bind(record.rating)
            .bind(record.review_count)
            .bind(&record.shop_id)
            .bind(&record.shop_name)
            .bind(&record.shop_location)
            .bind(&record.url)
            .bind(Json(&record.image_urls))
            .bind(&record.description)
            .bind(&record.category)
            .bind(Json(&record.raw_payload))
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => product_from_row(&row),
            None => Err(StoreError::Conflict(key.to_string())),
        }
    }

    async fn update_product(&mut self, product: &Product) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "UPDATE products SET
                name = $2, price = $3, original_price = $4, discount_percentage = $5, sold_count = $6,
                rating = $7, review_count = $8, shop_id = $9, shop_name = $10, shop_location = $11,
                url = $12, image_urls = $13, description = $14, category = $15, status = $16,
                raw_payload = $17, updated_at = $18
             WHERE id = $1",
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.original_price)
        .bind(product.discount_percentage)
        .bind(product.sold_count)
        .bind(product.rating)
        .bind(product.review_count)
        .bind(&product.shop_id)
        .bind(&product.shop_name)
        .bind(&product.shop_location)
        .bind(&product.url)
        .bind(Json(&product.image_urls))
        .bind(&product.description)
        .bind(&product.category)
        .bind(product.status.as_str())
        .bind(Json(&product.raw_payload))
        .bind(product.updated_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ProductNotFound(product.id));
        }
        Ok(())
    }

    async fn insert_snapshot(&mut self, product: &Product) -> Result<PriceSnapshot, StoreError> {
        let query = snapshot_query();
        let fields = product.price_fields();

        let tx = self.tx()?;
        let row = sqlx::query(&query)
            .bind(product.id)
            .bind(product.owner_id)
            .bind(fields.price)
            .bind(fields.discount_percentage)
            .bind(fields.sold_count)
            .bind(fields.rating)
            .fetch_one(&mut **tx)
            .await?;

        snapshot_from_row(&row)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_task(&self, task: &NewTask) -> Result<Task, StoreError> {
        let query = format!(
            "INSERT INTO scraping_tasks (owner_id, platform, task_type, input_data, status, expires_at)
             VALUES ($1, $2, $3, $4, 'pending', $5)
             RETURNING {}",
            TASK_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(task.owner_id)
            .bind(&task.platform)
            .bind(&task.task_type)
            .bind(Json(&task.input))
            .bind(task.expires_at)
            .fetch_one(&self.pool)
            .await?;

        task_from_row(&row)
    }

    async fn get_task(&self, task_id: i64, owner_id: i64) -> Result<Option<Task>, StoreError> {
        let query = format!("SELECT {} FROM scraping_tasks WHERE id = $1 AND owner_id = $2", TASK_COLUMNS);
        let row = sqlx::query(&query)
            .bind(task_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn set_job_handle(&self, task_id: i64, handle: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE scraping_tasks SET external_job_handle = $2 WHERE id = $1 AND external_job_handle IS NULL",
        )
        .bind(task_id)
        .bind(handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing task from one that already has a handle
            self.current_status(task_id).await?;
            return Err(StoreError::HandleAlreadySet(task_id));
        }
        Ok(())
    }

    async fn mark_running(&self, task_id: i64) -> Result<Task, StoreError> {
        // Re-entry on a running task is a no-op
        let query = format!("SELECT {} FROM scraping_tasks WHERE id = $1 AND status = 'running'", TASK_COLUMNS);
        let running = sqlx::query(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = running {
            return task_from_row(&row);
        }

        self.transition(task_id, TaskStatus::Running, None, None).await
    }

    async fn mark_completed(&self, task_id: i64, result_count: i64) -> Result<Task, StoreError> {
        self.transition(task_id, TaskStatus::Completed, Some(result_count), None).await
    }

    async fn mark_failed(&self, task_id: i64, error_message: &str, result_count: i64) -> Result<Task, StoreError> {
        self.transition(task_id, TaskStatus::Failed, Some(result_count), Some(error_message))
            .await
    }

    async fn begin(&self) -> Result<Box<dyn ProductTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgProductTx { tx: Some(tx) }))
    }

    async fn get_product(&self, product_id: i64, owner_id: i64) -> Result<Option<Product>, StoreError> {
        let query = format!("SELECT {} FROM products WHERE id = $1 AND owner_id = $2", PRODUCT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(product_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn find_product(&self, key: &ProductKey) -> Result<Option<Product>, StoreError> {
        let query = format!(
            "SELECT {} FROM products WHERE platform = $1 AND external_id = $2 AND owner_id = $3",
            PRODUCT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(&key.platform)
            .bind(&key.external_id)
            .bind(key.owner_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn products_for_task(&self, task_id: i64, owner_id: i64) -> Result<Vec<Product>, StoreError> {
        let query = format!(
            "SELECT {} FROM products WHERE source_task_id = $1 AND owner_id = $2 ORDER BY id",
            PRODUCT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(task_id)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(product_from_row).collect()
    }

    async fn count_products(&self, owner_id: i64, platform: Option<&str>) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE owner_id = $1 AND ($2::TEXT IS NULL OR platform = $2)",
        )
        .bind(owner_id)
        .bind(platform)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn price_history(&self, product_id: i64, owner_id: i64, limit: i64) -> Result<Vec<PriceSnapshot>, StoreError> {
        let query = format!(
            "SELECT {} FROM price_history WHERE product_id = $1 AND owner_id = $2
             ORDER BY recorded_at DESC, id DESC LIMIT $3",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(product_id)
            .bind(owner_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn record_snapshot(&self, product_id: i64, owner_id: i64) -> Result<PriceSnapshot, StoreError> {
        let product = self
            .get_product(product_id, owner_id)
            .await?
            .ok_or(StoreError::ProductNotFound(product_id))?;
        let fields = product.price_fields();

        let row = sqlx::query(&snapshot_query())
            .bind(product.id)
            .bind(product.owner_id)
            .bind(fields.price)
            .bind(fields.discount_percentage)
            .bind(fields.sold_count)
            .bind(fields.rating)
            .fetch_one(&self.pool)
            .await?;

        snapshot_from_row(&row)
    }
}
