pub mod pool;

// Re-export common types
pub use pool::{ProxyEndpoint, ProxyPool};
