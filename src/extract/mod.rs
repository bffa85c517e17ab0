pub mod parse;
pub mod pipeline;
pub mod profile;
pub mod record;
pub mod registry;

// Re-export common types
pub use pipeline::{ExtractionStrategy, ProfileStrategy};
pub use profile::{FieldSelectors, PlatformProfile, Readiness};
pub use record::{ExtractionReport, RawRecord, RecordExtractor};
pub use registry::PlatformScraperRegistry;
