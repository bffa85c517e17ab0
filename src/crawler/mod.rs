pub mod executor;
pub mod reconcile;
pub mod task;
pub mod worker;

// Re-export common types
pub use executor::JobExecutor;
pub use reconcile::{KeyedLocks, ReconcileError, ReconcileReport, ReconciliationEngine};
pub use task::{JobOutcome, JobRequest, NewTask, Task, TaskRequest, TaskStatus, TaskType};
pub use worker::{submit_task, WorkerPool, WorkerStats};
