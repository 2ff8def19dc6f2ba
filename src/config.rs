//! Configuration types for the harvest pipeline.
//!
//! A single TOML file defines collection defaults plus a table of site
//! configurations. Each site entry parameterizes the one shared pipeline;
//! there are no per-site code paths.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::models::StrategyKind;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collect: CollectOptions,
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, HarvestError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| HarvestError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Look up a site by name.
    pub fn site(&self, name: &str) -> Result<&SiteConfig, HarvestError> {
        self.sites
            .get(name)
            .ok_or_else(|| HarvestError::Config(format!("unknown site: {name}")))
    }
}

/// Knobs for one collection run. All sub-steps share the same deadline;
/// none of these creates an independent longer-lived timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectOptions {
    /// Quota: how many URLs a full batch contains.
    #[serde(default = "default_want")]
    pub want: usize,
    /// Below this count the batch is reported as empty.
    #[serde(default = "default_min_accept")]
    pub min_accept: usize,
    /// Per-strategy listing page budget.
    #[serde(default = "default_num_pages")]
    pub num_pages: usize,
    /// Wall-clock budget in seconds. None = unbounded.
    #[serde(default)]
    pub deadline_sec: Option<u64>,
    /// Soft cap on raw candidates per strategy, before dedup.
    #[serde(default = "default_raw_cap")]
    pub raw_cap: usize,
    /// Hard cap on liveness probes per run, independent of quota.
    #[serde(default = "default_max_probes")]
    pub max_probes: usize,
    /// Bounded fan-out for candidate verification.
    #[serde(default = "default_verify_concurrency")]
    pub verify_concurrency: usize,
    /// Per-request timeout for listing/feed/sitemap fetches, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_sec: u64,
    /// Liveness probe timeout, seconds. Short on purpose: the probe runs
    /// per-candidate inside a loop bounded by the run deadline.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_sec: u64,
    /// How much of a probe response body is read before dropping the
    /// connection, bytes.
    #[serde(default = "default_probe_read_limit")]
    pub probe_read_limit: usize,
    /// Redirect resolution timeout, seconds.
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_sec: u64,
    /// Politeness delay between listing pages, milliseconds.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    /// Transport retries per page fetch.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Proxy server URL (e.g. "socks5://127.0.0.1:1080").
    #[serde(default)]
    pub proxy: Option<String>,
    /// User agent configuration.
    /// - None: default linkharvest user agent
    /// - "impersonate": random real browser user agent
    /// - anything else: used verbatim
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            want: default_want(),
            min_accept: default_min_accept(),
            num_pages: default_num_pages(),
            deadline_sec: None,
            raw_cap: default_raw_cap(),
            max_probes: default_max_probes(),
            verify_concurrency: default_verify_concurrency(),
            request_timeout_sec: default_request_timeout(),
            probe_timeout_sec: default_probe_timeout(),
            probe_read_limit: default_probe_read_limit(),
            resolve_timeout_sec: default_resolve_timeout(),
            page_delay_ms: default_page_delay_ms(),
            retry_attempts: default_retry_attempts(),
            proxy: None,
            user_agent: None,
        }
    }
}

impl CollectOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_sec)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_sec)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

fn default_want() -> usize {
    5
}
fn default_min_accept() -> usize {
    1
}
fn default_num_pages() -> usize {
    50
}
fn default_raw_cap() -> usize {
    200
}
fn default_max_probes() -> usize {
    15
}
fn default_verify_concurrency() -> usize {
    4
}
fn default_request_timeout() -> u64 {
    20
}
fn default_probe_timeout() -> u64 {
    3
}
fn default_probe_read_limit() -> usize {
    4096
}
fn default_resolve_timeout() -> u64 {
    4
}
fn default_page_delay_ms() -> u64 {
    300
}
fn default_retry_attempts() -> u32 {
    2
}

/// One listing site. The pipeline is a pure function of this struct plus
/// the already-seen set, the quota and the deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Base origin, e.g. "https://listings.example.com".
    pub base_origin: String,
    /// Listing page URL template with a `{page}` placeholder.
    #[serde(default)]
    pub listing_template: Option<String>,
    /// Pattern matched by target-content URLs.
    pub target_pattern: String,
    /// Secondary detail/redirect link patterns, used when the target
    /// pattern is not directly present on listing pages.
    #[serde(default)]
    pub detail_patterns: Vec<String>,
    /// Query keys a redirect link may encode its destination in.
    #[serde(default = "default_redirect_params")]
    pub redirect_params: Vec<String>,
    /// Structured feed/API endpoint template with a `{page}` placeholder.
    #[serde(default)]
    pub feed_endpoint: Option<String>,
    /// Site-map endpoint.
    #[serde(default)]
    pub sitemap_url: Option<String>,
    /// Strategy priority order. Entries missing their site config
    /// (no feed endpoint, no sitemap) are skipped.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
    /// Candidates from this site skip the liveness probe (direct media
    /// URLs that cannot go stale within a run).
    #[serde(default)]
    pub self_verifying: bool,
    /// Consent/age interstitial bypass, used by the rendering fallback.
    #[serde(default)]
    pub consent: Option<ConsentConfig>,
}

fn default_redirect_params() -> Vec<String> {
    ["url", "u", "target", "to", "dest"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_strategies() -> Vec<StrategyKind> {
    vec![
        StrategyKind::Feed,
        StrategyKind::Sitemap,
        StrategyKind::Crawl,
        StrategyKind::Render,
    ]
}

impl SiteConfig {
    /// Compile the site's patterns once per run.
    pub fn compile(&self) -> Result<SitePatterns, HarvestError> {
        if self.base_origin.is_empty() {
            return Err(HarvestError::Config("site base_origin is empty".into()));
        }
        if self.target_pattern.is_empty() {
            return Err(HarvestError::Config("site target_pattern is empty".into()));
        }
        let target = RegexBuilder::new(&self.target_pattern)
            .case_insensitive(true)
            .build()?;
        let details = self
            .detail_patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SitePatterns { target, details })
    }

    /// Expand the listing template for a page number.
    pub fn listing_url(&self, page: usize) -> Option<String> {
        self.listing_template
            .as_ref()
            .map(|t| expand_page(self.base_origin.trim_end_matches('/'), t, page))
    }

    /// Expand the feed endpoint template for a page number.
    pub fn feed_url(&self, page: usize) -> Option<String> {
        self.feed_endpoint
            .as_ref()
            .map(|t| expand_page(self.base_origin.trim_end_matches('/'), t, page))
    }
}

fn expand_page(base: &str, template: &str, page: usize) -> String {
    let expanded = template.replace("{page}", &page.to_string());
    if expanded.starts_with("http://") || expanded.starts_with("https://") {
        expanded
    } else {
        format!("{base}{expanded}")
    }
}

/// Compiled per-site patterns.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    pub target: Regex,
    pub details: Vec<Regex>,
}

/// Consent/age-gate bypass configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsentConfig {
    /// Cookies written before navigation ("already agreed" flags).
    #[serde(default)]
    pub cookies: Vec<ConsentCookie>,
    /// localStorage flags written before page scripts run.
    #[serde(default)]
    pub storage_flags: Vec<StorageFlag>,
    /// Selectors clicked after navigation, in order, each best-effort.
    #[serde(default)]
    pub click_selectors: Vec<String>,
    /// Button/checkbox label phrases searched when no selector matches.
    #[serde(default = "default_consent_labels")]
    pub label_patterns: Vec<String>,
    /// Markup fragments that identify the interstitial. If any is still
    /// present after the click steps, the page is reloaded once.
    #[serde(default)]
    pub interstitial_markers: Vec<String>,
}

fn default_consent_labels() -> Vec<String> {
    [
        "agree",
        "i agree",
        "accept",
        "i am over 18",
        "i am 18",
        "over 18",
        "enter",
        "continue",
        "同意",
        "18歳以上",
        "入場",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// A pre-navigation consent cookie.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsentCookie {
    pub name: String,
    pub value: String,
}

/// A pre-navigation localStorage flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageFlag {
    pub key: String,
    pub value: String,
}
