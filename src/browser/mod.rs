pub mod context;
pub mod fingerprint;
pub mod session;

// Re-export common types
pub use context::{BrowsingContext, ContextError, ContextProvider, NavigationOutcome};
pub use fingerprint::{Fingerprint, FingerprintPool};
pub use session::{BrowserSessionManager, WebDriverContext};
