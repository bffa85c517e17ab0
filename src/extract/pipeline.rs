use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::form_urlencoded;
use url::Url;

use crate::browser::context::{BrowsingContext, NavigationOutcome};
use crate::crawler::task::TaskRequest;
use crate::error::EngineError;
use crate::extract::profile::{PlatformProfile, Readiness};
use crate::extract::record::{ExtractionReport, RecordExtractor};

/// Platform-specific scraping behind a uniform interface. Navigation and
/// extraction problems degrade to fewer records; only errors that make the
/// task meaningless are returned.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn platform(&self) -> &str;

    async fn search_keyword(&self, ctx: &dyn BrowsingContext, keyword: &str) -> Result<ExtractionReport, EngineError>;

    async fn scrape_url(&self, ctx: &dyn BrowsingContext, url: &Url) -> Result<ExtractionReport, EngineError>;

    async fn monitor_shop(&self, ctx: &dyn BrowsingContext, shop_id: &str) -> Result<ExtractionReport, EngineError>;

    /// Dispatch on the request's task type
    async fn run(&self, ctx: &dyn BrowsingContext, request: &TaskRequest) -> Result<ExtractionReport, EngineError> {
        match request {
            TaskRequest::KeywordSearch { keyword } => self.search_keyword(ctx, keyword).await,
            TaskRequest::UrlScrape { url } => self.scrape_url(ctx, url).await,
            TaskRequest::ShopMonitor { shop_id } => self.monitor_shop(ctx, shop_id).await,
        }
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Strategy driven entirely by a `PlatformProfile`
#[derive(Debug)]
pub struct ProfileStrategy {
    profile: PlatformProfile,
    extractor: RecordExtractor,
}

impl ProfileStrategy {
    pub fn new(profile: PlatformProfile) -> Result<Self, EngineError> {
        let extractor = RecordExtractor::compile(&profile)?;
        Ok(Self { profile, extractor })
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    pub fn search_url(&self, keyword: &str) -> Result<Url, EngineError> {
        let raw = self.profile.search_url.replace("{keyword}", &encode(keyword));
        Url::parse(&raw).map_err(|e| EngineError::configuration(format!("invalid search url '{}': {}", raw, e)))
    }

    pub fn shop_url(&self, shop_id: &str) -> Result<Url, EngineError> {
        if !self.profile.supports_shops() {
            return Err(EngineError::configuration(format!(
                "platform {} does not support shop monitoring",
                self.profile.name
            )));
        }

        let raw = self.profile.shop_url.replace("{shop_id}", &encode(shop_id));
        Url::parse(&raw).map_err(|e| EngineError::configuration(format!("invalid shop url '{}': {}", raw, e)))
    }

    /// Navigate, wait for readiness, then extract. Every failure along the
    /// way is logged and yields whatever was collected.
    async fn collect(&self, ctx: &dyn BrowsingContext, url: &Url, cap: Option<usize>) -> ExtractionReport {
        match ctx.navigate(url.as_str()).await {
            Ok(NavigationOutcome::Loaded) => {}
            Ok(NavigationOutcome::Degraded(reason)) => {
                warn!("Degraded navigation to {}: {}", url, reason);
            }
            Err(e) => {
                warn!("Navigation to {} failed: {}", url, e);
                return ExtractionReport::empty();
            }
        }

        match &self.profile.readiness {
            Readiness::WaitForSelector { selector, timeout_ms } => {
                match ctx.wait_for_selector(selector, Duration::from_millis(*timeout_ms)).await {
                    Ok(true) => {}
                    Ok(false) => debug!("Result marker '{}' did not appear on {}", selector, url),
                    Err(e) => warn!("Waiting for '{}' on {} failed: {}", selector, url, e),
                }
            }
            Readiness::FixedDelay { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
        }

        let html = match ctx.page_source().await {
            Ok(html) => html,
            Err(e) => {
                warn!("Failed to read page source for {}: {}", url, e);
                return ExtractionReport::empty();
            }
        };

        let report = self.extractor.extract_page(&html, url, cap);
        info!(
            "Extracted {} {} records from {} ({} dropped)",
            report.records.len(),
            self.profile.name,
            url,
            report.dropped
        );
        report
    }
}

#[async_trait]
impl ExtractionStrategy for ProfileStrategy {
    fn platform(&self) -> &str {
        &self.profile.name
    }

    async fn search_keyword(&self, ctx: &dyn BrowsingContext, keyword: &str) -> Result<ExtractionReport, EngineError> {
        let url = self.search_url(keyword)?;
        Ok(self.collect(ctx, &url, Some(self.profile.result_cap)).await)
    }

    async fn scrape_url(&self, ctx: &dyn BrowsingContext, url: &Url) -> Result<ExtractionReport, EngineError> {
        Ok(self.collect(ctx, url, None).await)
    }

    async fn monitor_shop(&self, ctx: &dyn BrowsingContext, shop_id: &str) -> Result<ExtractionReport, EngineError> {
        let url = self.shop_url(shop_id)?;
        Ok(self.collect(ctx, &url, None).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::context::testing::FakeContext;

    fn shopee() -> ProfileStrategy {
        ProfileStrategy::new(PlatformProfile::shopee()).unwrap()
    }

    fn items(ids: &[&str]) -> String {
        let body: String = ids
            .iter()
            .map(|id| format!(r#"<div data-sqe="product" data-itemid="{}"><div class="product-name">{}</div></div>"#, id, id))
            .collect();
        format!("<html><body>{}</body></html>", body)
    }

    #[test]
    fn test_urls_are_encoded() {
        let strategy = shopee();

        let url = strategy.search_url("hp samsung & case").unwrap();
        assert_eq!(url.as_str(), "https://shopee.co.id/search?keyword=hp+samsung+%26+case");

        let shop = strategy.shop_url("12345").unwrap();
        assert_eq!(shop.as_str(), "https://shopee.co.id/shop/12345");
    }

    #[tokio::test]
    async fn test_keyword_search_waits_for_marker() {
        let strategy = shopee();
        let url = strategy.search_url("phone").unwrap();
        let ctx = FakeContext::with_page(url.as_str(), &items(&["A", "B", "C"]));

        let report = strategy
            .run(&ctx, &TaskRequest::KeywordSearch { keyword: "phone".to_string() })
            .await
            .unwrap();

        let ids: Vec<&str> = report.records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(ctx.selector_waits.lock().unwrap().as_slice(), ["[data-sqe=\"product\"]"]);
        assert_eq!(ctx.visited.lock().unwrap().as_slice(), [url.as_str()]);
    }

    #[tokio::test]
    async fn test_keyword_search_caps_results() {
        let strategy = shopee();
        let url = strategy.search_url("phone").unwrap();
        let ids: Vec<String> = (0..70).map(|i| format!("P{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let ctx = FakeContext::with_page(url.as_str(), &items(&id_refs));

        let report = strategy.search_keyword(&ctx, "phone").await.unwrap();
        assert_eq!(report.records.len(), 50);
    }

    #[tokio::test]
    async fn test_fixed_delay_platform_skips_selector_wait() {
        let mut profile = PlatformProfile::tiktok_shop();
        profile.readiness = Readiness::FixedDelay { delay_ms: 5 };
        let strategy = ProfileStrategy::new(profile).unwrap();
        let ctx = FakeContext::default();

        let report = strategy.search_keyword(&ctx, "phone").await.unwrap();
        assert!(report.records.is_empty());
        assert!(ctx.selector_waits.lock().unwrap().is_empty());
        assert_eq!(ctx.visited.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_navigation_still_extracts() {
        let strategy = shopee();
        let url = Url::parse("https://shopee.co.id/some-listing").unwrap();
        let mut ctx = FakeContext::with_page(url.as_str(), &items(&["A"]));
        ctx.degraded = true;

        let report = strategy.scrape_url(&ctx, &url).await.unwrap();
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_page_yields_no_records() {
        let strategy = shopee();
        let ctx = FakeContext::degraded();

        let report = strategy.search_keyword(&ctx, "phone").await.unwrap();
        assert_eq!(report, ExtractionReport::empty());
    }

    #[tokio::test]
    async fn test_shop_monitor_unsupported_is_configuration_error() {
        let mut profile = PlatformProfile::shopee();
        profile.shop_url.clear();
        let strategy = ProfileStrategy::new(profile).unwrap();

        let err = strategy.monitor_shop(&FakeContext::default(), "123").await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
