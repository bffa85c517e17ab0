use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::browser::context::{BrowsingContext, ContextError, ContextProvider, NavigationOutcome};
use crate::browser::fingerprint::{Fingerprint, FingerprintPool};
use crate::cli::config::BrowserSettings;
use crate::error::EngineError;
use crate::proxy::pool::{ProxyEndpoint, ProxyPool};

/// Hides the usual automation tells before any page script runs
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => false });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Stealth script with `navigator.languages` matching the fingerprint locale
fn stealth_script(fingerprint: &Fingerprint) -> String {
    let mut languages = vec![fingerprint.locale.clone()];
    if let Some((base, _)) = fingerprint.locale.split_once('-') {
        languages.push(base.to_string());
    }
    if !languages.iter().any(|l| l.starts_with("en")) {
        languages.push("en-US".to_string());
        languages.push("en".to_string());
    }

    format!(
        "{}Object.defineProperty(navigator, 'languages', {{ get: () => {} }});\n",
        STEALTH_SCRIPT,
        json!(languages)
    )
}

/// Grace added on top of the driver's own page-load timeout
const NAVIGATION_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A WebDriver endpoint, with the driver process if we spawned it
struct DriverEndpoint {
    url: String,
    process: Mutex<Option<Child>>,
}

/// Owns the shared driver process and hands out isolated browsing
/// contexts, one WebDriver session each. The driver is launched on first
/// use and reused for the life of the worker.
pub struct BrowserSessionManager {
    settings: BrowserSettings,
    fingerprints: FingerprintPool,
    proxies: Arc<ProxyPool>,
    driver: OnceCell<DriverEndpoint>,
    http: reqwest::Client,
}

impl BrowserSessionManager {
    pub fn new(settings: BrowserSettings, proxies: Arc<ProxyPool>) -> Result<Self> {
        let fingerprints = FingerprintPool::from_settings(&settings)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            settings,
            fingerprints,
            proxies,
            driver: OnceCell::new(),
            http,
        })
    }

    /// Endpoint of the running driver, launching it on first call. A failed
    /// launch is retried by the next caller.
    async fn driver_url(&self) -> Result<&str, EngineError> {
        let endpoint = self
            .driver
            .get_or_try_init(|| self.launch_driver())
            .await
            .map_err(|e| EngineError::resource(format!("{:#}", e)))?;

        Ok(&endpoint.url)
    }

    async fn launch_driver(&self) -> Result<DriverEndpoint> {
        if let Some(url) = &self.settings.webdriver_url {
            let url = url.trim_end_matches('/').to_string();
            self.wait_until_ready(&url).await?;
            info!("Using WebDriver at {}", url);
            return Ok(DriverEndpoint {
                url,
                process: Mutex::new(None),
            });
        }

        let port = self.settings.driver_port;
        let child = Command::new(&self.settings.driver_binary)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to launch {}", self.settings.driver_binary))?;

        let url = format!("http://127.0.0.1:{}", port);
        self.wait_until_ready(&url).await?;
        info!("Launched {} on port {}", self.settings.driver_binary, port);

        Ok(DriverEndpoint {
            url,
            process: Mutex::new(Some(child)),
        })
    }

    /// Poll the driver's status endpoint until it reports ready
    async fn wait_until_ready(&self, url: &str) -> Result<()> {
        let deadline = Instant::now() + self.settings.launch_timeout();
        let status_url = format!("{}/status", url);

        loop {
            match self.http.get(&status_url).send().await {
                Ok(response) if response.status().is_success() => {
                    let body: serde_json::Value = response.json().await.unwrap_or_default();
                    if body["value"]["ready"].as_bool().unwrap_or(true) {
                        return Ok(());
                    }
                }
                Ok(response) => debug!("Driver status {} from {}", response.status(), status_url),
                Err(e) => debug!("Driver not reachable yet: {}", e),
            }

            if Instant::now() >= deadline {
                anyhow::bail!(
                    "WebDriver at {} not ready after {}ms",
                    url,
                    self.settings.launch_timeout_ms
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn create_context(&self, driver_url: &str) -> Result<WebDriverContext, ContextError> {
        let fingerprint = self.fingerprints.random();
        let proxy = self.proxies.pick().cloned();
        let caps = build_capabilities(&self.settings, &fingerprint, proxy.as_ref())?;

        let driver = WebDriver::new(driver_url, caps).await?;
        if let Err(e) = prepare_session(&driver, &fingerprint, self.settings.navigation_timeout()).await {
            if let Err(quit_err) = driver.quit().await {
                warn!("Failed to quit half-initialized session: {}", quit_err);
            }
            return Err(e);
        }

        let context = WebDriverContext {
            id: uuid::Uuid::new_v4().to_string(),
            driver: Some(driver),
            navigation_timeout: self.settings.navigation_timeout(),
            settle_timeout: self.settings.settle_timeout(),
        };

        debug!(
            "Created browsing context {} ({}, proxy: {})",
            context.id,
            fingerprint.platform,
            proxy.as_ref().map(|p| p.redacted()).unwrap_or_else(|| "none".to_string())
        );
        Ok(context)
    }

    /// Stop the driver process if we own one
    pub async fn shutdown(&self) {
        let Some(endpoint) = self.driver.get() else {
            return;
        };

        let child = endpoint.process.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut child) = child {
            match child.kill().await {
                Ok(()) => info!("Stopped WebDriver process"),
                Err(e) => error!("Failed to stop WebDriver process: {}", e),
            }
        }
    }
}

#[async_trait]
impl ContextProvider for BrowserSessionManager {
    async fn acquire_context(&self) -> Result<Box<dyn BrowsingContext>, EngineError> {
        let driver_url = self.driver_url().await?;

        match self.create_context(driver_url).await {
            Ok(context) => Ok(Box::new(context)),
            Err(first) => {
                warn!("Browsing context creation failed, retrying once: {}", first);
                let context = self
                    .create_context(driver_url)
                    .await
                    .map_err(|e| EngineError::resource(format!("failed to create browsing context: {}", e)))?;
                Ok(Box::new(context))
            }
        }
    }
}

fn build_capabilities(
    settings: &BrowserSettings,
    fingerprint: &Fingerprint,
    proxy: Option<&ProxyEndpoint>,
) -> Result<ChromeCapabilities, ContextError> {
    let mut caps = DesiredCapabilities::chrome();

    caps.add_chrome_arg(&format!("--user-agent={}", fingerprint.user_agent))?;
    caps.add_chrome_arg(&format!("--lang={}", fingerprint.locale))?;
    caps.add_chrome_arg(&format!(
        "--window-size={},{}",
        fingerprint.viewport.width, fingerprint.viewport.height
    ))?;

    if settings.headless {
        caps.set_headless()?;
    }

    if let Some(proxy) = proxy {
        if proxy.has_credentials() {
            warn!("Chrome ignores proxy credentials; using {} without them", proxy.redacted());
        }
        caps.add_chrome_arg(&format!("--proxy-server={}", proxy.server_arg()))?;
    }

    caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
    caps.add_chrome_arg("--no-first-run")?;
    caps.add_chrome_arg("--no-default-browser-check")?;
    caps.add_chrome_arg("--disable-dev-shm-usage")?;

    caps.add_chrome_option("excludeSwitches", json!(["enable-automation"]))?;
    caps.add_chrome_option("useAutomationExtension", false)?;
    caps.add_chrome_option("prefs", json!({ "intl.accept_languages": fingerprint.accept_language }))?;

    Ok(caps)
}

/// Per-session setup: timeouts, stealth script, timezone and UA overrides
async fn prepare_session(driver: &WebDriver, fingerprint: &Fingerprint, page_load: Duration) -> Result<(), ContextError> {
    driver.set_page_load_timeout(page_load).await?;

    let dev_tools = ChromeDevTools::new(driver.handle.clone());
    dev_tools
        .execute_cdp_with_params("Page.addScriptToEvaluateOnNewDocument", json!({ "source": stealth_script(fingerprint) }))
        .await?;
    dev_tools
        .execute_cdp_with_params("Emulation.setTimezoneOverride", json!({ "timezoneId": fingerprint.timezone }))
        .await?;
    dev_tools
        .execute_cdp_with_params(
            "Network.setUserAgentOverride",
            json!({
                "userAgent": fingerprint.user_agent,
                "acceptLanguage": fingerprint.accept_language,
                "platform": fingerprint.platform,
            }),
        )
        .await?;

    Ok(())
}

/// One WebDriver session
pub struct WebDriverContext {
    id: String,
    driver: Option<WebDriver>,
    navigation_timeout: Duration,
    settle_timeout: Duration,
}

impl WebDriverContext {
    fn driver(&self) -> Result<&WebDriver, ContextError> {
        self.driver.as_ref().ok_or(ContextError::Closed)
    }

    /// Wait for `document.readyState` to reach "complete", capped at the
    /// settle timeout
    async fn wait_settled(&self, driver: &WebDriver) -> bool {
        let deadline = Instant::now() + self.settle_timeout;

        loop {
            match driver.execute("return document.readyState;", Vec::new()).await {
                Ok(ret) if ret.json().as_str() == Some("complete") => return true,
                Ok(_) => {}
                Err(e) => debug!("readyState check failed: {}", e),
            }

            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BrowsingContext for WebDriverContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<NavigationOutcome, ContextError> {
        let driver = self.driver()?;
        debug!("Navigating to: {}", url);

        match tokio::time::timeout(self.navigation_timeout + NAVIGATION_GRACE, driver.goto(url)).await {
            Err(_) => {
                warn!("Navigation to {} exceeded {:?}", url, self.navigation_timeout);
                return Ok(NavigationOutcome::Degraded(format!(
                    "navigation exceeded {}ms",
                    self.navigation_timeout.as_millis()
                )));
            }
            Ok(Err(e)) => {
                warn!("Navigation to {} failed: {}", url, e);
                return Ok(NavigationOutcome::Degraded(e.to_string()));
            }
            Ok(Ok(())) => {}
        }

        if self.wait_settled(driver).await {
            Ok(NavigationOutcome::Loaded)
        } else {
            debug!("Page {} did not settle within {:?}", url, self.settle_timeout);
            Ok(NavigationOutcome::Degraded("page did not settle".to_string()))
        }
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool, ContextError> {
        let driver = self.driver()?;
        let found = driver
            .query(By::Css(selector))
            .wait(timeout, POLL_INTERVAL)
            .exists()
            .await?;

        Ok(found)
    }

    async fn page_source(&self) -> Result<String, ContextError> {
        Ok(self.driver()?.source().await?)
    }

    async fn close(&mut self) -> Result<(), ContextError> {
        if let Some(driver) = self.driver.take() {
            driver.quit().await?;
            debug!("Browsing context {} closed", self.id);
        }
        Ok(())
    }
}

impl Drop for WebDriverContext {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Last resort for contexts dropped without release
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browsing context during drop: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> Fingerprint {
        let settings = BrowserSettings::default();
        FingerprintPool::from_settings(&settings).unwrap().random()
    }

    #[test]
    fn test_capabilities_carry_fingerprint_and_proxy() {
        let settings = BrowserSettings::default();
        let proxy: ProxyEndpoint = "http://user:pw@10.0.0.1:3128".parse().unwrap();
        let fp = fingerprint();

        let caps: thirtyfour::Capabilities = build_capabilities(&settings, &fp, Some(&proxy)).unwrap().into();
        let rendered = serde_json::to_string(&caps).unwrap();

        assert!(rendered.contains("--proxy-server=http://10.0.0.1:3128"));
        assert!(!rendered.contains("pw@"));
        assert!(rendered.contains("AutomationControlled"));
        assert!(rendered.contains("enable-automation"));
        assert!(rendered.contains(&fp.accept_language));
    }

    #[test]
    fn test_stealth_script_masks_languages() {
        let mut fp = fingerprint();
        fp.locale = "id-ID".to_string();

        let script = stealth_script(&fp);
        assert!(script.contains("'webdriver'"));
        assert!(script.contains(r#"'languages', { get: () => ["id-ID","id","en-US","en"] }"#));
    }

    #[tokio::test]
    async fn test_launch_failure_is_resource_error() {
        let settings = BrowserSettings {
            driver_binary: "/nonexistent/chromedriver-for-tests".to_string(),
            launch_timeout_ms: 200,
            ..Default::default()
        };
        let manager = BrowserSessionManager::new(settings, Arc::new(ProxyPool::default())).unwrap();

        let err = match manager.acquire_context().await {
            Err(e) => e,
            Ok(_) => panic!("context acquired without a driver"),
        };
        assert!(matches!(err, EngineError::Resource(_)));
    }

    #[tokio::test]
    async fn test_unreachable_remote_driver_times_out() {
        let settings = BrowserSettings {
            webdriver_url: Some("http://127.0.0.1:9/".to_string()),
            launch_timeout_ms: 300,
            ..Default::default()
        };
        let manager = BrowserSessionManager::new(settings, Arc::new(ProxyPool::default())).unwrap();

        let err = manager.driver_url().await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }
}
