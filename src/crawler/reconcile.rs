use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::extract::record::RawRecord;
use crate::storage::model::ProductKey;
use crate::storage::store::{Store, StoreError};

/// Tally of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records committed, whatever their outcome
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ReconcileReport {
    fn add(&mut self, outcome: RecordOutcome) {
        self.processed += 1;
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Reconciliation stopped part way; everything in `committed` stays
#[derive(Debug, Error)]
#[error("reconciliation stopped after {} records: {source}", .committed.processed)]
pub struct ReconcileError {
    pub committed: ReconcileReport,
    #[source]
    pub source: StoreError,
}

/// Per-key async locks so two jobs in this process never race on the same
/// product. Idle entries are pruned on the next lock call.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<ProductKey, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &ProductKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(key.clone()).or_default().clone()
        };

        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Upserts extracted records into the product catalog, recording a price
/// snapshot whenever a tracked field changes
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    locks: KeyedLocks,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
        }
    }

    /// Share locks with other engines in the same process
    pub fn with_locks(store: Arc<dyn Store>, locks: KeyedLocks) -> Self {
        Self { store, locks }
    }

    /// Reconcile records one by one, each in its own transaction. Stops at
    /// the first persistence failure; earlier records remain committed.
    pub async fn reconcile(
        &self,
        owner_id: i64,
        task_id: i64,
        platform: &str,
        records: &[RawRecord],
    ) -> Result<ReconcileReport, ReconcileError> {
        self.reconcile_until(None, owner_id, task_id, platform, records).await
    }

    /// Like `reconcile`, but gives up once `deadline` passes. A record whose
    /// transaction is cut short is rolled back; earlier ones stay.
    pub async fn reconcile_until(
        &self,
        deadline: Option<Instant>,
        owner_id: i64,
        task_id: i64,
        platform: &str,
        records: &[RawRecord],
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        for record in records {
            let key = ProductKey::new(platform, &record.external_id, owner_id);
            let result = match deadline {
                Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
                Some(deadline) => timeout_at(deadline, self.reconcile_record(&key, task_id, record))
                    .await
                    .unwrap_or(Err(StoreError::DeadlineExceeded)),
                None => self.reconcile_record(&key, task_id, record).await,
            };

            match result {
                Ok(outcome) => report.add(outcome),
                Err(source) => {
                    return Err(ReconcileError {
                        committed: report,
                        source,
                    })
                }
            }
        }

        info!(
            "Reconciled {} records: {} new, {} changed, {} unchanged",
            report.processed, report.inserted, report.updated, report.unchanged
        );
        Ok(report)
    }

    async fn reconcile_record(&self, key: &ProductKey, task_id: i64, record: &RawRecord) -> Result<RecordOutcome, StoreError> {
        let _guard = self.locks.lock(key).await;

        match self.apply(key, task_id, record).await {
            // Another process inserted the row between our lookup and insert;
            // the retry finds it and takes the update path
            Err(StoreError::Conflict(_)) => {
                debug!("Concurrent insert of {}, retrying as update", key);
                self.apply(key, task_id, record).await
            }
            other => other,
        }
    }

    async fn apply(&self, key: &ProductKey, task_id: i64, record: &RawRecord) -> Result<RecordOutcome, StoreError> {
        let mut tx = self.store.begin().await?;

        let outcome = match tx.find_for_update(key).await? {
            None => {
                tx.insert_product(key, Some(task_id), record).await?;
                RecordOutcome::Inserted
            }
            Some(mut product) => {
                let changed = product.price_fields() != record.price_fields();
                product.apply_observation(record, Utc::now());
                tx.update_product(&product).await?;

                if changed {
                    tx.insert_snapshot(&product).await?;
                    RecordOutcome::Updated
                } else {
                    RecordOutcome::Unchanged
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
pub mod testing {
    //! Store wrapper that fails commits after a set number succeed

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::crawler::task::{NewTask, Task};
    use crate::storage::memory::MemoryStore;
    use crate::storage::model::{PriceSnapshot, Product};
    use crate::storage::store::ProductTx;

    pub struct FailingStore {
        pub inner: MemoryStore,
        commits_allowed: Arc<AtomicUsize>,
    }

    impl FailingStore {
        pub fn new(inner: MemoryStore, commits_allowed: usize) -> Self {
            Self {
                inner,
                commits_allowed: Arc::new(AtomicUsize::new(commits_allowed)),
            }
        }
    }

    struct FailingTx {
        inner: Box<dyn ProductTx>,
        commits_allowed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProductTx for FailingTx {
        async fn find_for_update(&mut self, key: &ProductKey) -> Result<Option<Product>, StoreError> {
            self.inner.find_for_update(key).await
        }

        async fn insert_product(&mut self, key: &ProductKey, source_task_id: Option<i64>, record: &RawRecord) -> Result<Product, StoreError> {
            self.inner.insert_product(key, source_task_id, record).await
        }

        async fn update_product(&mut self, product: &Product) -> Result<(), StoreError> {
            self.inner.update_product(product).await
        }

        async fn insert_snapshot(&mut self, product: &Product) -> Result<PriceSnapshot, StoreError> {
            self.inner.insert_snapshot(product).await
        }

        async fn commit(&mut self) -> Result<(), StoreError> {
            let allowed = self.commits_allowed.load(Ordering::SeqCst);
            if allowed == 0 {
                return Err(StoreError::Corrupt("simulated commit failure".to_string()));
            }
            self.commits_allowed.store(allowed - 1, Ordering::SeqCst);
            self.inner.commit().await
        }
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn insert_task(&self, task: &NewTask) -> Result<Task, StoreError> {
            self.inner.insert_task(task).await
        }

        async fn get_task(&self, task_id: i64, owner_id: i64) -> Result<Option<Task>, StoreError> {
            self.inner.get_task(task_id, owner_id).await
        }

        async fn set_job_handle(&self, task_id: i64, handle: &str) -> Result<(), StoreError> {
            self.inner.set_job_handle(task_id, handle).await
        }

        async fn mark_running(&self, task_id: i64) -> Result<Task, StoreError> {
            self.inner.mark_running(task_id).await
        }

        async fn mark_completed(&self, task_id: i64, result_count: i64) -> Result<Task, StoreError> {
            self.inner.mark_completed(task_id, result_count).await
        }

        async fn mark_failed(&self, task_id: i64, error_message: &str, result_count: i64) -> Result<Task, StoreError> {
            self.inner.mark_failed(task_id, error_message, result_count).await
        }

        async fn begin(&self) -> Result<Box<dyn ProductTx>, StoreError> {
            Ok(Box::new(FailingTx {
                inner: self.inner.begin().await?,
                commits_allowed: self.commits_allowed.clone(),
            }))
        }

        async fn get_product(&self, product_id: i64, owner_id: i64) -> Result<Option<Product>, StoreError> {
            self.inner.get_product(product_id, owner_id).await
        }

        async fn find_product(&self, key: &ProductKey) -> Result<Option<Product>, StoreError> {
            self.inner.find_product(key).await
        }

        async fn products_for_task(&self, task_id: i64, owner_id: i64) -> Result<Vec<Product>, StoreError> {
            self.inner.products_for_task(task_id, owner_id).await
        }

        async fn count_products(&self, owner_id: i64, platform: Option<&str>) -> Result<i64, StoreError> {
            self.inner.count_products(owner_id, platform).await
        }

        async fn price_history(&self, product_id: i64, owner_id: i64, limit: i64) -> Result<Vec<PriceSnapshot>, StoreError> {
            self.inner.price_history(product_id, owner_id, limit).await
        }

        async fn record_snapshot(&self, product_id: i64, owner_id: i64) -> Result<PriceSnapshot, StoreError> {
            self.inner.record_snapshot(product_id, owner_id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FailingStore;
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn record(id: &str, price: Option<f64>) -> RawRecord {
        let mut record = RawRecord::new(id);
        record.name = Some(format!("Phone {}", id));
        record.price = price;
        record
    }

    fn engine(store: &MemoryStore) -> ReconciliationEngine {
        ReconciliationEngine::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_first_sighting_inserts_without_snapshot() {
        let store = MemoryStore::new();
        let records = vec![record("A", Some(50000.0)), record("B", Some(75000.0)), record("C", None)];

        let report = engine(&store).reconcile(7, 1, "shopee", &records).await.unwrap();

        assert_eq!(report, ReconcileReport { processed: 3, inserted: 3, updated: 0, unchanged: 0 });
        assert_eq!(store.all_products(7).await.len(), 3);
        assert!(store.all_snapshots(7).await.is_empty());
    }

    #[tokio::test]
    async fn test_passed_deadline_stops_before_writing() {
        let store = MemoryStore::new();
        let records = vec![record("A", Some(50000.0))];

        let err = engine(&store)
            .reconcile_until(Some(Instant::now()), 7, 1, "shopee", &records)
            .await
            .unwrap_err();

        assert_eq!(err.committed.processed, 0);
        assert!(matches!(err.source, StoreError::DeadlineExceeded));
        assert!(store.all_products(7).await.is_empty());
    }

    #[tokio::test]
    async fn test_price_change_records_snapshot_of_new_values() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        engine
            .reconcile(7, 1, "shopee", &[record("A", Some(50000.0)), record("B", Some(75000.0))])
            .await
            .unwrap();

        let second = vec![record("A", Some(45000.0)), record("B", Some(75000.0)), record("D", Some(10.0))];
        let report = engine.reconcile(7, 2, "shopee", &second).await.unwrap();

        assert_eq!(report, ReconcileReport { processed: 3, inserted: 1, updated: 1, unchanged: 1 });

        let snapshots = store.all_snapshots(7).await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].price, Some(45000.0));

        let a = store.find_product(&ProductKey::new("shopee", "A", 7)).await.unwrap().unwrap();
        assert_eq!(a.price, Some(45000.0));
        assert_eq!(a.source_task_id, Some(1));
        assert_eq!(snapshots[0].product_id, a.id);
        assert_eq!(store.all_products(7).await.len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        let records = vec![record("A", Some(1.0)), record("B", Some(2.0))];

        engine.reconcile(7, 1, "shopee", &records).await.unwrap();
        let before = store.all_products(7).await;

        let report = engine.reconcile(7, 1, "shopee", &records).await.unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(store.all_products(7).await.len(), before.len());
        assert!(store.all_snapshots(7).await.is_empty());
    }

    #[tokio::test]
    async fn test_field_becoming_absent_counts_as_change() {
        let store = MemoryStore::new();
        let engine = engine(&store);

        engine.reconcile(7, 1, "shopee", &[record("A", Some(1.0))]).await.unwrap();
        let report = engine.reconcile(7, 2, "shopee", &[record("A", None)]).await.unwrap();

        assert_eq!(report.updated, 1);
        let snapshots = store.all_snapshots(7).await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].price, None);
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let store = MemoryStore::new();
        let engine = engine(&store);

        engine.reconcile(7, 1, "shopee", &[record("A", Some(1.0))]).await.unwrap();
        engine.reconcile(8, 2, "shopee", &[record("A", Some(1.0))]).await.unwrap();
        engine.reconcile(7, 3, "tokopedia", &[record("A", Some(1.0))]).await.unwrap();

        assert_eq!(store.all_products(7).await.len(), 2);
        assert_eq!(store.all_products(8).await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_create_single_row() {
        let store = MemoryStore::new();
        let locks = KeyedLocks::default();

        let mut handles = Vec::new();
        for task_id in 0..8 {
            let engine = ReconciliationEngine::with_locks(Arc::new(store.clone()), locks.clone());
            handles.push(tokio::spawn(async move {
                engine
                    .reconcile(7, task_id, "shopee", &[record("X", Some(100.0 + task_id as f64))])
                    .await
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            inserted += handle.await.unwrap().unwrap().inserted;
        }

        assert_eq!(inserted, 1);
        assert_eq!(store.all_products(7).await.len(), 1);
        // Every later writer saw a different price
        assert_eq!(store.all_snapshots(7).await.len(), 7);
    }

    #[tokio::test]
    async fn test_failure_keeps_committed_prefix() {
        let memory = MemoryStore::new();
        let store = FailingStore::new(memory.clone(), 2);
        let engine = ReconciliationEngine::new(Arc::new(store));

        let records = vec![record("A", Some(1.0)), record("B", Some(2.0)), record("C", Some(3.0))];
        let err = engine.reconcile(7, 1, "shopee", &records).await.unwrap_err();

        assert_eq!(err.committed.processed, 2);
        assert!(err.to_string().contains("after 2 records"));
        assert_eq!(memory.all_products(7).await.len(), 2);
        assert!(memory.find_product(&ProductKey::new("shopee", "C", 7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let locks = KeyedLocks::default();
        {
            let _a = locks.lock(&ProductKey::new("shopee", "A", 1)).await;
            let _b = locks.lock(&ProductKey::new("shopee", "B", 1)).await;
            assert_eq!(locks.len(), 2);
        }

        let _c = locks.lock(&ProductKey::new("shopee", "C", 1)).await;
        assert_eq!(locks.len(), 1);
    }
}
