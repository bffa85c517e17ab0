use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("webdriver error: {0}")]
    WebDriver(#[from] thirtyfour::error::WebDriverError),

    #[error("browsing context already closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// How a navigation ended. A degraded navigation is not an error: the page
/// may still hold usable content.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationOutcome {
    Loaded,
    Degraded(String),
}

/// An isolated browsing session: its own cookies, storage and fingerprint
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    fn id(&self) -> &str;

    /// Navigate and wait for the page to settle, bounded by the context's
    /// navigation and settle timeouts
    async fn navigate(&self, url: &str) -> Result<NavigationOutcome, ContextError>;

    /// Whether `selector` matched something within `timeout`
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool, ContextError>;

    async fn page_source(&self) -> Result<String, ContextError>;

    async fn close(&mut self) -> Result<(), ContextError>;
}

/// Source of browsing contexts. Callers must hand every acquired context
/// back through `release`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn acquire_context(&self) -> Result<Box<dyn BrowsingContext>, EngineError>;

    async fn release(&self, context: Box<dyn BrowsingContext>) {
        let mut context = context;
        let id = context.id().to_string();
        match context.close().await {
            Ok(()) => debug!("Closed browsing context {}", id),
            Err(e) => warn!("Failed to close browsing context {}: {}", id, e),
        }
    }
}
