use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::crawler::task::{NewTask, Task, TaskStatus};
use crate::extract::record::RawRecord;
use crate::storage::model::{PriceSnapshot, Product, ProductKey};
use crate::storage::store::{ProductTx, Store, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tasks: BTreeMap<i64, Task>,
    products: BTreeMap<i64, Product>,
    snapshots: Vec<PriceSnapshot>,
    next_task_id: i64,
    next_product_id: i64,
    next_snapshot_id: i64,
}

impl MemoryState {
    fn find_product(&self, key: &ProductKey) -> Option<&Product> {
        self.products.values().find(|p| {
            p.owner_id == key.owner_id && p.platform == key.platform && p.external_id == key.external_id
        })
    }

    fn push_snapshot(&mut self, product: &Product) -> PriceSnapshot {
        self.next_snapshot_id += 1;
        let snapshot = PriceSnapshot::of(self.next_snapshot_id, product, Utc::now());
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    fn transition<F>(&mut self, task_id: i64, target: TaskStatus, apply: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task),
    {
        let task = self.tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
        if !task.status.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: task.status,
                to: target,
            });
        }

        task.status = target;
        apply(task);
        Ok(task.clone())
    }
}

/// In-process store used for standalone runs and tests. Transactions take
/// the whole state lock, so they are fully serialized.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot for an owner, oldest first
    pub async fn all_snapshots(&self, owner_id: i64) -> Vec<PriceSnapshot> {
        let state = self.state.lock().await;
        state.snapshots.iter().filter(|s| s.owner_id == owner_id).cloned().collect()
    }

    pub async fn all_products(&self, owner_id: i64) -> Vec<Product> {
        let state = self.state.lock().await;
        state.products.values().filter(|p| p.owner_id == owner_id).cloned().collect()
    }
}

/// Works on a copy of the state and swaps it in on commit
pub struct MemoryTx {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
}

#[async_trait]
impl ProductTx for MemoryTx {
    async fn find_for_update(&mut self, key: &ProductKey) -> Result<Option<Product>, StoreError> {
        Ok(self.working.find_product(key).cloned())
    }

    async fn insert_product(
        &mut self,
        key: &ProductKey,
        source_task_id: Option<i64>,
        record: &RawRecord,
    ) -> Result<Product, StoreError> {
        if self.working.find_product(key).is_some() {
            return Err(StoreError::Conflict(key.to_string()));
        }

        self.working.next_product_id += 1;
        let product = Product::from_record(self.working.next_product_id, key, source_task_id, record, Utc::now());
        self.working.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn update_product(&mut self, product: &Product) -> Result<(), StoreError> {
        match self.working.products.get_mut(&product.id) {
            Some(existing) => {
                *existing = product.clone();
                Ok(())
            }
            None => Err(StoreError::ProductNotFound(product.id)),
        }
    }

    async fn insert_snapshot(&mut self, product: &Product) -> Result<PriceSnapshot, StoreError> {
        Ok(self.working.push_snapshot(product))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::TransactionClosed)?;
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: &NewTask) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        state.next_task_id += 1;

        let stored = Task {
            id: state.next_task_id,
            owner_id: task.owner_id,
            platform: task.platform.clone(),
            task_type: task.task_type.clone(),
            input: task.input.clone(),
            status: TaskStatus::Pending,
            result_count: 0,
            error_message: None,
            external_job_handle: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: task.expires_at,
        };
        state.tasks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_task(&self, task_id: i64, owner_id: i64) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).filter(|t| t.owner_id == owner_id).cloned())
    }

    async fn set_job_handle(&self, task_id: i64, handle: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
        if task.external_job_handle.is_some() {
            return Err(StoreError::HandleAlreadySet(task_id));
        }
        task.external_job_handle = Some(handle.to_string());
        Ok(())
    }

    async fn mark_running(&self, task_id: i64) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get(&task_id) {
            if task.status == TaskStatus::Running {
                return Ok(task.clone());
            }
        }

        state.transition(task_id, TaskStatus::Running, |task| {
            task.started_at.get_or_insert_with(Utc::now);
        })
    }

    async fn mark_completed(&self, task_id: i64, result_count: i64) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        state.transition(task_id, TaskStatus::Completed, |task| {
            task.result_count = result_count;
            task.error_message = None;
            task.completed_at = Some(Utc::now());
        })
    }

    async fn mark_failed(&self, task_id: i64, error_message: &str, result_count: i64) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        state.transition(task_id, TaskStatus::Failed, |task| {
            task.result_count = result_count;
            task.error_message = Some(error_message.to_string());
            task.completed_at = Some(Utc::now());
        })
    }

    async fn begin(&self) -> Result<Box<dyn ProductTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard: Some(guard),
            working,
        }))
    }

    async fn get_product(&self, product_id: i64, owner_id: i64) -> Result<Option<Product>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.products.get(&product_id).filter(|p| p.owner_id == owner_id).cloned())
    }

    async fn find_product(&self, key: &ProductKey) -> Result<Option<Product>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.find_product(key).cloned())
    }

    async fn products_for_task(&self, task_id: i64, owner_id: i64) -> Result<Vec<Product>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .values()
            .filter(|p| p.owner_id == owner_id && p.source_task_id == Some(task_id))
            .cloned()
            .collect())
    }

    async fn count_products(&self, owner_id: i64, platform: Option<&str>) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let count = state
            .products
            .values()
            .filter(|p| p.owner_id == owner_id && platform.map_or(true, |name| p.platform == name))
            .count();
        Ok(count as i64)
    }

    async fn price_history(&self, product_id: i64, owner_id: i64, limit: i64) -> Result<Vec<PriceSnapshot>, StoreError> {
        let state = self.state.lock().await;
        let mut history: Vec<PriceSnapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.product_id == product_id && s.owner_id == owner_id)
            .cloned()
            .collect();

        history.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        history.truncate(limit.max(0) as usize);
        Ok(history)
    }

    async fn record_snapshot(&self, product_id: i64, owner_id: i64) -> Result<PriceSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get(&product_id)
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .ok_or(StoreError::ProductNotFound(product_id))?;

        Ok(state.push_snapshot(&product))
    }
}
