use anyhow::Result;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::config::BrowserSettings;

/// Viewport dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Identity presented by one browsing context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub accept_language: String,
    pub locale: String,
    pub timezone: String,
    pub platform: String,
    pub viewport: Viewport,
    pub is_mobile: bool,
}

/// Draws a fingerprint per context. User agents rotate; locale and timezone
/// stay fixed to the target market.
#[derive(Debug, Clone)]
pub struct FingerprintPool {
    user_agents: Vec<String>,
    locale: String,
    timezone: String,
}

impl FingerprintPool {
    pub fn new(user_agents: Vec<String>, locale: &str, timezone: &str) -> Result<Self> {
        if user_agents.is_empty() {
            anyhow::bail!("No user agents configured");
        }

        Ok(Self {
            user_agents,
            locale: locale.to_string(),
            timezone: timezone.to_string(),
        })
    }

    pub fn from_settings(settings: &BrowserSettings) -> Result<Self> {
        Self::new(settings.user_agents.clone(), &settings.locale, &settings.timezone)
    }

    pub fn len(&self) -> usize {
        self.user_agents.len()
    }

    /// Select a user agent uniformly at random and build the fingerprint
    pub fn random(&self) -> Fingerprint {
        let mut rng = thread_rng();
        let user_agent = &self.user_agents[rng.gen_range(0..self.user_agents.len())];
        self.complete(user_agent)
    }

    fn complete(&self, user_agent: &str) -> Fingerprint {
        let mut rng = thread_rng();
        let is_mobile = user_agent.contains("Mobile");

        let viewport = if is_mobile {
            Viewport {
                width: rng.gen_range(360..430),
                height: rng.gen_range(740..932),
            }
        } else {
            // Desktop sizes around the common 1280x720
            Viewport {
                width: rng.gen_range(1280..1920),
                height: rng.gen_range(720..1080),
            }
        };

        let fingerprint = Fingerprint {
            user_agent: user_agent.to_string(),
            accept_language: accept_language(&self.locale),
            locale: self.locale.clone(),
            timezone: self.timezone.clone(),
            platform: platform_of(user_agent).to_string(),
            viewport,
            is_mobile,
        };

        debug!(
            "Generated fingerprint: {} {}x{}",
            fingerprint.platform, fingerprint.viewport.width, fingerprint.viewport.height
        );

        fingerprint
    }
}

/// `navigator.platform` value consistent with the user agent
fn platform_of(user_agent: &str) -> &'static str {
    if user_agent.contains("Android") {
        "Linux armv8l"
    } else if user_agent.contains("Windows") {
        "Win32"
    } else if user_agent.contains("Macintosh") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

/// Accept-Language header for a locale, falling back to English
fn accept_language(locale: &str) -> String {
    let language = locale.split('-').next().unwrap_or(locale);
    if language == "en" {
        format!("{},en;q=0.9", locale)
    } else {
        format!("{},{};q=0.9,en-US;q=0.8,en;q=0.7", locale, language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_rejected() {
        assert!(FingerprintPool::new(vec![], "id-ID", "Asia/Jakarta").is_err());
    }

    #[test]
    fn test_fingerprint_matches_user_agent() {
        let mobile = "Mozilla/5.0 (Linux; Android 13; SM-A546E) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
        let pool = FingerprintPool::new(vec![mobile.to_string()], "id-ID", "Asia/Jakarta").unwrap();

        let fingerprint = pool.random();
        assert!(fingerprint.is_mobile);
        assert_eq!(fingerprint.platform, "Linux armv8l");
        assert!(fingerprint.viewport.width < 500);
        assert_eq!(fingerprint.timezone, "Asia/Jakarta");
        assert_eq!(fingerprint.accept_language, "id-ID,id;q=0.9,en-US;q=0.8,en;q=0.7");
    }

    #[test]
    fn test_default_pool_covers_all_agents() {
        let settings = BrowserSettings::default();
        let pool = FingerprintPool::from_settings(&settings).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(pool.random().user_agent);
        }
        assert_eq!(seen.len(), pool.len());
    }

    #[test]
    fn test_desktop_platforms() {
        assert_eq!(platform_of("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"), "Win32");
        assert_eq!(platform_of("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)"), "MacIntel");
        assert_eq!(platform_of("Mozilla/5.0 (X11; Linux x86_64)"), "Linux x86_64");
        assert_eq!(accept_language("en-US"), "en-US,en;q=0.9");
    }
}
