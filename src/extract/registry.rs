use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::EngineError;
use crate::extract::pipeline::{ExtractionStrategy, ProfileStrategy};
use crate::extract::profile::PlatformProfile;

/// Maps platform identifiers to extraction strategies
#[derive(Default)]
pub struct PlatformScraperRegistry {
    strategies: HashMap<String, Arc<dyn ExtractionStrategy>>,
}

impl PlatformScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in profiles, with `overrides` replacing or extending them by name
    pub fn from_profiles(overrides: &[PlatformProfile]) -> Result<Self, EngineError> {
        let mut registry = Self::new();

        for profile in PlatformProfile::builtin().into_iter().chain(overrides.iter().cloned()) {
            registry.register(Arc::new(ProfileStrategy::new(profile)?));
        }

        Ok(registry)
    }

    pub fn with_builtin() -> Result<Self, EngineError> {
        Self::from_profiles(&[])
    }

    /// Add a strategy; a later registration for the same platform wins
    pub fn register(&mut self, strategy: Arc<dyn ExtractionStrategy>) {
        let name = strategy.platform().to_string();
        if self.strategies.insert(name.clone(), strategy).is_some() {
            debug!("Replaced strategy for platform {}", name);
        }
    }

    pub fn resolve(&self, platform: &str) -> Result<Arc<dyn ExtractionStrategy>, EngineError> {
        self.strategies
            .get(platform)
            .cloned()
            .ok_or_else(|| EngineError::configuration(format!("unknown platform: {}", platform)))
    }

    pub fn platforms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
