pub mod memory;
pub mod model;
pub mod postgres;
pub mod queue;
pub mod store;

// Re-export common types
pub use memory::MemoryStore;
pub use model::{PriceFields, PriceSnapshot, Product, ProductKey, ProductStatus};
pub use postgres::PostgresStore;
pub use queue::{JobQueue, LocalQueue, RedisQueue};
pub use store::{ProductTx, Store, StoreError};
