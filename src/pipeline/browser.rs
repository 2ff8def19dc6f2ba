//! Headless-browser rendering fallback for JS-rendered listings and
//! consent/age interstitials.
//!
//! Uses chromiumoxide (CDP) with stealth evasion so listing sites that
//! serve empty shells to plain HTTP clients still yield markup. Every DOM
//! interaction is wrapped so a missing element or script exception
//! degrades to a no-op; DOM variance across sites must never abort a
//! fetch. The session is torn down on every exit path.

#[cfg(feature = "browser")]
use std::sync::Arc;
#[cfg(feature = "browser")]
use std::time::Duration;

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, SetUserAgentOverrideParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
use serde::{Deserialize, Serialize};
#[cfg(feature = "browser")]
use tokio::sync::Mutex;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};
#[cfg(feature = "browser")]
use url::Url;

use crate::config::ConsentConfig;
use crate::error::HarvestError;

use super::deadline::Deadline;

/// Browser session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Run in headless mode (default: true).
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Proxy server URL (e.g. "socks5://127.0.0.1:1080").
    #[serde(default)]
    pub proxy: Option<String>,
    /// Page load timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Upper bound on scroll-and-wait cycles for lazily loaded content.
    #[serde(default = "default_max_scrolls")]
    pub max_scrolls: usize,
    /// User agent presented by the session.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            headless: true,
            proxy: None,
            timeout: default_timeout(),
            max_scrolls: default_max_scrolls(),
            user_agent: None,
            chrome_args: Vec::new(),
        }
    }
}

pub fn default_headless() -> bool {
    true
}

pub fn default_timeout() -> u64 {
    30
}

fn default_max_scrolls() -> usize {
    6
}

#[cfg(feature = "browser")]
const RENDER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Stealth evasion JavaScript injected into pages.
/// Based on puppeteer-extra-plugin-stealth techniques.
#[cfg(feature = "browser")]
const STEALTH_SCRIPTS: &[&str] = &[
    // Remove webdriver property
    r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    "#,
    // Fix chrome object
    r#"
    window.chrome = {
        runtime: {},
        loadTimes: function() {},
        csi: function() {},
        app: {}
    };
    "#,
    // Fix languages
    r#"
    Object.defineProperty(navigator, 'languages', {
        get: () => ['ja-JP', 'ja', 'en-US', 'en'],
        configurable: true
    });
    "#,
    // Fix plugins (make it look like regular Chrome)
    r#"
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
            { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
        ],
        configurable: true
    });
    "#,
    // Remove automation-related properties
    r#"
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
    "#,
];

/// Headless renderer with consent-gate bypass and scroll surfacing.
#[cfg(feature = "browser")]
pub struct Renderer {
    config: RenderConfig,
    browser: Option<Arc<Mutex<Browser>>>,
}

#[cfg(feature = "browser")]
impl Renderer {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/opt/google/chrome/google-chrome",
    ];

    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            browser: None,
        }
    }

    fn find_chrome() -> Result<std::path::PathBuf, HarvestError> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }
        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        info!("Found Chrome in PATH: {}", path);
                        return Ok(std::path::PathBuf::from(path));
                    }
                }
            }
        }
        Err(HarvestError::Render(
            "Chrome/Chromium not found; install chromium or google-chrome".into(),
        ))
    }

    /// Launch the browser if not already running.
    async fn ensure_browser(&mut self) -> Result<(), HarvestError> {
        if self.browser.is_some() {
            return Ok(());
        }

        info!("Launching browser (headless={})", self.config.headless);
        let chrome_path = Self::find_chrome()?;

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(ref proxy) = self.config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }

        // Fingerprint-reduction and container-friendly args
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--metrics-recording-only")
            .arg("--lang=ja-JP")
            .arg("--window-size=1366,900")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer");

        for arg in &self.config.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| HarvestError::Render(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarvestError::Render(format!("browser launch: {e}")))?;

        // Drive the CDP connection until it closes
        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        self.browser = Some(Arc::new(Mutex::new(browser)));
        Ok(())
    }

    /// Open a URL in an isolated page, bypass a consent interstitial if
    /// configured, surface lazily loaded content, and return the fully
    /// rendered markup. The page is closed on every exit path.
    pub async fn render(
        &mut self,
        url: &str,
        consent: Option<&ConsentConfig>,
        deadline: &Deadline,
    ) -> Result<String, HarvestError> {
        if deadline.expired() {
            return Err(HarvestError::DeadlineExceeded);
        }
        self.ensure_browser().await?;

        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| HarvestError::Render("browser not running".into()))?
            .lock()
            .await;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarvestError::Render(format!("new page: {e}")))?;
        drop(browser);

        let result = self.render_on(&page, url, consent, deadline).await;

        // Close the page to prevent tab accumulation, success or failure
        let _ = page.close().await;
        result
    }

    async fn render_on(
        &self,
        page: &Page,
        url: &str,
        consent: Option<&ConsentConfig>,
        deadline: &Deadline,
    ) -> Result<String, HarvestError> {
        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| RENDER_USER_AGENT.to_string());
        page.execute(SetUserAgentOverrideParams::new(user_agent))
            .await
            .map_err(|e| HarvestError::Render(format!("user agent override: {e}")))?;

        // Consent flags go in before navigation where possible, so most
        // interstitials never appear at all.
        if let Some(consent) = consent {
            self.inject_consent_state(page, url, consent).await;
        }

        self.navigate(page, url, deadline).await?;
        self.wait_for_ready(page, deadline).await;

        // Post-navigation consent steps; if the interstitial survives
        // them, reload once and retry the steps.
        if let Some(consent) = consent {
            let stepped = self.run_consent_steps(page, consent).await;
            if stepped && self.interstitial_present(page, consent).await {
                debug!(url = %url, "interstitial still present, reloading once");
                self.navigate(page, url, deadline).await?;
                self.wait_for_ready(page, deadline).await;
                self.run_consent_steps(page, consent).await;
            }
        }

        self.scroll_to_bottom(page, deadline).await;

        page.content()
            .await
            .map_err(|e| HarvestError::Render(format!("page content: {e}")))
    }

    async fn navigate(
        &self,
        page: &Page,
        url: &str,
        deadline: &Deadline,
    ) -> Result<(), HarvestError> {
        if deadline.expired() {
            return Err(HarvestError::DeadlineExceeded);
        }
        info!("Rendering {}", url);
        let nav = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| HarvestError::Render(format!("invalid URL: {e}")))?;
        page.execute(nav)
            .await
            .map_err(|e| HarvestError::Render(format!("navigate: {e}")))?;
        Ok(())
    }

    /// Wait for document.readyState instead of a fixed timeout.
    async fn wait_for_ready(&self, page: &Page, deadline: &Deadline) {
        let script = r#"
            new Promise((resolve) => {
                if (document.readyState === 'complete' || document.readyState === 'interactive') {
                    resolve(document.readyState);
                } else {
                    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                    setTimeout(() => resolve('timeout'), 10000);
                }
            })
        "#;

        let timeout = deadline.clamp(Duration::from_secs(self.config.timeout));
        match tokio::time::timeout(timeout, page.evaluate(script.to_string())).await {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }

        // Small additional delay for late-loading scripts
        tokio::time::sleep(Duration::from_millis(500)).await;

        for script in STEALTH_SCRIPTS {
            if let Err(e) = page.evaluate(script.to_string()).await {
                // Can fail on non-HTML pages or during transitions;
                // best-effort evasion
                debug!("Stealth script injection skipped: {}", e);
            }
        }
    }

    /// Write "already agreed" cookies and localStorage flags so they are
    /// in place before the site's scripts run.
    async fn inject_consent_state(&self, page: &Page, url: &str, consent: &ConsentConfig) {
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));

        for cookie in &consent.cookies {
            let Some(ref domain) = domain else { break };
            let param = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(domain.clone())
                .build();
            match param {
                Ok(param) => {
                    if let Err(e) = page.set_cookie(param).await {
                        warn!("Failed to set consent cookie {}: {}", cookie.name, e);
                    }
                }
                Err(e) => warn!("Failed to build consent cookie {}: {}", cookie.name, e),
            }
        }

        if !consent.storage_flags.is_empty() {
            let assignments: String = consent
                .storage_flags
                .iter()
                .map(|f| {
                    format!(
                        "try {{ localStorage.setItem({}, {}); }} catch (e) {{}}\n",
                        serde_json::json!(f.key),
                        serde_json::json!(f.value)
                    )
                })
                .collect();
            let install = page
                .execute(AddScriptToEvaluateOnNewDocumentParams::new(assignments))
                .await;
            if let Err(e) = install {
                debug!("Storage flag injection skipped: {}", e);
            }
        }
    }

    /// Run the ordered consent steps. Each step is individually fallible
    /// and none may abort the sequence. Returns true if any step fired.
    async fn run_consent_steps(&self, page: &Page, consent: &ConsentConfig) -> bool {
        let mut clicked = false;

        for selector in &consent.click_selectors {
            clicked |= self.attempt_click(page, selector).await;
        }

        if !consent.label_patterns.is_empty() {
            clicked |= self.attempt_label_click(page, &consent.label_patterns).await;
        }

        if clicked {
            // Give the gate's dismiss handler a moment to run
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        clicked
    }

    /// Click the first visible element matching `selector`; a missing
    /// element is a no-op.
    async fn attempt_click(&self, page: &Page, selector: &str) -> bool {
        match page.find_element(selector).await {
            Ok(element) => match element.click().await {
                Ok(_) => {
                    debug!(selector = %selector, "consent step clicked");
                    true
                }
                Err(e) => {
                    debug!(selector = %selector, error = %e, "consent click failed");
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// Search buttons/links/inputs for known agree/age/enter labels and
    /// click the first visible match.
    async fn attempt_label_click(&self, page: &Page, labels: &[String]) -> bool {
        let script = format!(
            r#"
            (() => {{
                const labels = {};
                const nodes = document.querySelectorAll(
                    'button, a, input[type=submit], input[type=button], label');
                for (const node of nodes) {{
                    const text = ((node.innerText || node.value || '') + '').trim().toLowerCase();
                    if (!text) continue;
                    if (node.offsetParent === null) continue;
                    if (labels.some(l => text.includes(l))) {{
                        node.click();
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            serde_json::json!(labels
                .iter()
                .map(|l| l.to_lowercase())
                .collect::<Vec<_>>())
        );

        match page.evaluate(script).await {
            Ok(result) => {
                let clicked = result.into_value::<bool>().unwrap_or(false);
                if clicked {
                    debug!("consent label click fired");
                }
                clicked
            }
            Err(e) => {
                debug!("consent label scan failed: {}", e);
                false
            }
        }
    }

    async fn interstitial_present(&self, page: &Page, consent: &ConsentConfig) -> bool {
        if consent.interstitial_markers.is_empty() {
            return false;
        }
        let html = match page.content().await {
            Ok(html) => html,
            Err(_) => return false,
        };
        consent
            .interstitial_markers
            .iter()
            .any(|marker| html.contains(marker))
    }

    /// Bounded scroll-and-wait cycles to surface lazily loaded items.
    /// Stops early when page height stops growing across two consecutive
    /// cycles.
    async fn scroll_to_bottom(&self, page: &Page, deadline: &Deadline) {
        let mut last_height: i64 = -1;
        let mut stable_cycles = 0usize;

        for cycle in 0..self.config.max_scrolls {
            if deadline.expired() {
                debug!("deadline reached during scroll cycle {}", cycle);
                break;
            }

            let height = page
                .evaluate("document.body ? document.body.scrollHeight : 0".to_string())
                .await
                .ok()
                .and_then(|r| r.into_value::<i64>().ok())
                .unwrap_or(0);

            if height == last_height {
                stable_cycles += 1;
                if stable_cycles >= 2 {
                    break;
                }
            } else {
                stable_cycles = 0;
            }
            last_height = height;

            if let Err(e) = page
                .evaluate(
                    "window.scrollTo(0, document.body ? document.body.scrollHeight : 0)"
                        .to_string(),
                )
                .await
            {
                debug!("scroll failed: {}", e);
                break;
            }
            tokio::time::sleep(deadline.clamp(Duration::from_millis(800))).await;
        }
    }

    /// Tear down the session.
    pub async fn close(&mut self) {
        self.browser = None;
    }
}

// Stub for when browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct Renderer {
    #[allow(dead_code)]
    config: RenderConfig,
}

#[cfg(not(feature = "browser"))]
impl Renderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub async fn render(
        &mut self,
        _url: &str,
        _consent: Option<&ConsentConfig>,
        _deadline: &Deadline,
    ) -> Result<String, HarvestError> {
        Err(HarvestError::Render(
            "browser support not compiled; rebuild with: cargo build --features browser".into(),
        ))
    }

    pub async fn close(&mut self) {}
}
