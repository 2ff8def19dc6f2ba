//! Source strategies and the selector that orders them.
//!
//! Each strategy is one way of enumerating a site's listing. The selector
//! tries them in the site's configured priority order and stops at the
//! first one that yields candidates. Page-scoped failures inside a
//! strategy are logged and skipped; a strategy as a whole fails only when
//! it produces nothing or every page failed.

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{CollectOptions, SiteConfig, SitePatterns};
use crate::error::HarvestError;
use crate::models::{Candidate, StrategyKind};

use super::browser::{RenderConfig, Renderer};
use super::deadline::Deadline;
use super::extract::{ExtractedLinks, LinkExtractor};
use super::fetch::FetchExecutor;

/// Listing pages worth rendering; the browser is the last resort, not a
/// crawler.
const MAX_RENDER_PAGES: usize = 3;

#[async_trait]
pub trait SourceStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Produce candidates in discovery order (newest first, following the
    /// site's own listing order).
    async fn discover(&mut self, deadline: &Deadline) -> Result<Vec<Candidate>, HarvestError>;
}

/// Tries strategies in priority order; the first non-empty result wins.
pub struct StrategySelector {
    strategies: Vec<Box<dyn SourceStrategy>>,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Box<dyn SourceStrategy>>) -> Self {
        Self { strategies }
    }

    /// Build the strategy chain for a site. Entries whose site config is
    /// missing (no feed endpoint, no sitemap, no listing template) are
    /// skipped up front.
    pub fn for_site(
        site: &SiteConfig,
        patterns: &SitePatterns,
        opts: &CollectOptions,
        fetch: FetchExecutor,
        render_config: RenderConfig,
    ) -> Self {
        let mut strategies: Vec<Box<dyn SourceStrategy>> = Vec::new();
        for kind in &site.strategies {
            match kind {
                StrategyKind::Feed if site.feed_endpoint.is_some() => {
                    strategies.push(Box::new(FeedStrategy {
                        site: site.clone(),
                        patterns: patterns.clone(),
                        opts: opts.clone(),
                        fetch: fetch.clone(),
                    }));
                }
                StrategyKind::Sitemap if site.sitemap_url.is_some() => {
                    strategies.push(Box::new(SitemapStrategy {
                        site: site.clone(),
                        patterns: patterns.clone(),
                        opts: opts.clone(),
                        fetch: fetch.clone(),
                    }));
                }
                StrategyKind::Crawl if site.listing_template.is_some() => {
                    strategies.push(Box::new(CrawlStrategy {
                        site: site.clone(),
                        patterns: patterns.clone(),
                        opts: opts.clone(),
                        fetch: fetch.clone(),
                    }));
                }
                StrategyKind::Render if site.listing_template.is_some() => {
                    strategies.push(Box::new(RenderStrategy {
                        site: site.clone(),
                        patterns: patterns.clone(),
                        opts: opts.clone(),
                        render_config: render_config.clone(),
                    }));
                }
                skipped => debug!(strategy = %skipped, "strategy not configured for site"),
            }
        }
        Self::new(strategies)
    }

    pub async fn select(&mut self, deadline: &Deadline) -> Vec<Candidate> {
        for strategy in &mut self.strategies {
            if deadline.expired() {
                info!("deadline reached before strategy {}", strategy.kind());
                break;
            }
            match strategy.discover(deadline).await {
                Ok(candidates) if !candidates.is_empty() => {
                    info!(
                        strategy = %strategy.kind(),
                        count = candidates.len(),
                        "strategy yielded candidates"
                    );
                    return candidates;
                }
                Ok(_) => {
                    info!(strategy = %strategy.kind(), "strategy yielded nothing, falling through");
                }
                Err(e) => {
                    warn!(strategy = %strategy.kind(), error = %e, "strategy failed, falling through");
                }
            }
        }
        Vec::new()
    }
}

/// Accumulates candidates for one strategy, preserving discovery order and
/// enforcing the soft raw cap.
struct CandidateSink {
    origin: StrategyKind,
    cap: usize,
    out: Vec<Candidate>,
}

impl CandidateSink {
    fn new(origin: StrategyKind, cap: usize) -> Self {
        Self {
            origin,
            cap,
            out: Vec::new(),
        }
    }

    fn full(&self) -> bool {
        self.out.len() >= self.cap
    }

    fn push_extracted(&mut self, links: ExtractedLinks) {
        for url in links.targets {
            if self.full() {
                return;
            }
            let order = self.out.len();
            self.out.push(Candidate::target(url, self.origin, order));
        }
        for url in links.details {
            if self.full() {
                return;
            }
            let order = self.out.len();
            self.out.push(Candidate::redirect(url, self.origin, order));
        }
    }

    fn push_url(&mut self, url: String, is_target: bool) {
        if self.full() {
            return;
        }
        let order = self.out.len();
        self.out.push(if is_target {
            Candidate::target(url, self.origin, order)
        } else {
            Candidate::redirect(url, self.origin, order)
        });
    }
}

// ---------------------------------------------------------------------------
// Feed/API fast path
// ---------------------------------------------------------------------------

struct FeedStrategy {
    site: SiteConfig,
    patterns: SitePatterns,
    opts: CollectOptions,
    fetch: FetchExecutor,
}

#[async_trait]
impl SourceStrategy for FeedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Feed
    }

    async fn discover(&mut self, deadline: &Deadline) -> Result<Vec<Candidate>, HarvestError> {
        let mut sink = CandidateSink::new(StrategyKind::Feed, self.opts.raw_cap);
        let paginated = self
            .site
            .feed_endpoint
            .as_deref()
            .is_some_and(|t| t.contains("{page}"));
        let pages = if paginated { self.opts.num_pages } else { 1 };

        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_err = None;

        for page in 1..=pages {
            if deadline.expired() {
                info!(page, "feed deadline reached; stopping");
                break;
            }
            if sink.full() {
                info!(cap = self.opts.raw_cap, "feed early stop at raw cap");
                break;
            }
            let Some(url) = self.site.feed_url(page) else {
                break;
            };

            attempted += 1;
            let body = match self.fetch.get_text(&url, deadline).await {
                Ok(body) => body,
                Err(HarvestError::DeadlineExceeded) => break,
                Err(e) => {
                    warn!(url = %url, error = %e, "feed page failed; skipping");
                    failed += 1;
                    last_err = Some(e);
                    continue;
                }
            };

            let parsed: serde_json::Value = match serde_json::from_str(&body) {
                Ok(value) => value,
                Err(e) => {
                    warn!(url = %url, error = %e, "feed page is not JSON; skipping");
                    failed += 1;
                    continue;
                }
            };

            let before = sink.out.len();
            collect_feed_urls(&parsed, &self.patterns, &mut sink);
            let found = sink.out.len() - before;
            info!(url = %url, found, "feed page scanned");

            // A paginated feed that runs dry has been fully consumed
            if paginated && found == 0 {
                break;
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(last_err.unwrap_or(HarvestError::Config(
                "feed strategy: every page failed".into(),
            )));
        }
        Ok(sink.out)
    }
}

/// Walk a JSON document collecting every string that matches the target or
/// detail patterns, in document order.
fn collect_feed_urls(value: &serde_json::Value, patterns: &SitePatterns, sink: &mut CandidateSink) {
    if sink.full() {
        return;
    }
    match value {
        serde_json::Value::String(s) => {
            let fixed = crate::models::fix_scheme_typo(s);
            if let Some(m) = patterns.target.find(&fixed) {
                sink.push_url(m.as_str().to_string(), true);
            } else if patterns.details.iter().any(|d| d.is_match(&fixed)) {
                sink.push_url(fixed, false);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_feed_urls(item, patterns, sink);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_feed_urls(item, patterns, sink);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Site-map path
// ---------------------------------------------------------------------------

struct SitemapStrategy {
    site: SiteConfig,
    patterns: SitePatterns,
    opts: CollectOptions,
    fetch: FetchExecutor,
}

#[async_trait]
impl SourceStrategy for SitemapStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sitemap
    }

    async fn discover(&mut self, deadline: &Deadline) -> Result<Vec<Candidate>, HarvestError> {
        let Some(sitemap_url) = self.site.sitemap_url.clone() else {
            return Ok(Vec::new());
        };
        let body = self.fetch.get_text(&sitemap_url, deadline).await?;

        let mut sink = CandidateSink::new(StrategyKind::Sitemap, self.opts.raw_cap);
        let extractor = LinkExtractor::new(&self.patterns);
        let locs = sitemap_locs(&body);
        info!(url = %sitemap_url, locs = locs.len(), "sitemap fetched");

        // Newest entries conventionally sit at the end of a sitemap;
        // iterate back-to-front so discovery order prefers them.
        let mut fetched_pages = 0usize;
        let mut failed_pages = 0usize;
        for loc in locs.iter().rev() {
            if deadline.expired() {
                info!("sitemap deadline reached; stopping");
                break;
            }
            if sink.full() {
                break;
            }

            let fixed = crate::models::fix_scheme_typo(loc);
            if let Some(m) = self.patterns.target.find(&fixed) {
                sink.push_url(m.as_str().to_string(), true);
                continue;
            }
            if self.patterns.details.iter().any(|d| d.is_match(&fixed)) {
                sink.push_url(fixed, false);
                continue;
            }

            // Same-origin pages listed in the map may carry target links
            if fetched_pages < self.opts.num_pages
                && fixed.starts_with(self.site.base_origin.trim_end_matches('/'))
            {
                fetched_pages += 1;
                match self.fetch.get_text(&fixed, deadline).await {
                    Ok(html) => {
                        sink.push_extracted(extractor.extract(&html, &fixed));
                    }
                    Err(HarvestError::DeadlineExceeded) => break,
                    Err(e) => {
                        debug!(url = %fixed, error = %e, "sitemap page failed; skipping");
                        failed_pages += 1;
                    }
                }
            }
        }

        if fetched_pages > 0 && failed_pages == fetched_pages && sink.out.is_empty() {
            return Err(HarvestError::Config(
                "sitemap strategy: every page failed".into(),
            ));
        }
        Ok(sink.out)
    }
}

/// Pull `<loc>` entries out of sitemap XML. Plain scan; must tolerate
/// malformed maps.
fn sitemap_locs(xml: &str) -> Vec<String> {
    // Compiled per call; the sitemap fetch happens at most once per run.
    let Ok(loc_re) = Regex::new(r"<loc>\s*(?:<!\[CDATA\[)?([^<\]]+?)(?:\]\]>)?\s*</loc>") else {
        return Vec::new();
    };
    loc_re
        .captures_iter(xml)
        .map(|c| c[1].trim().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Page-by-page listing crawl
// ---------------------------------------------------------------------------

struct CrawlStrategy {
    site: SiteConfig,
    patterns: SitePatterns,
    opts: CollectOptions,
    fetch: FetchExecutor,
}

#[async_trait]
impl SourceStrategy for CrawlStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Crawl
    }

    async fn discover(&mut self, deadline: &Deadline) -> Result<Vec<Candidate>, HarvestError> {
        let mut sink = CandidateSink::new(StrategyKind::Crawl, self.opts.raw_cap);
        let extractor = LinkExtractor::new(&self.patterns);

        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_err = None;

        for page in 1..=self.opts.num_pages {
            if deadline.expired() {
                info!(page, "crawl deadline reached; stopping");
                break;
            }
            if sink.full() {
                info!(cap = self.opts.raw_cap, "crawl early stop at raw cap");
                break;
            }
            let Some(url) = self.site.listing_url(page) else {
                break;
            };

            attempted += 1;
            match self.fetch.get_text(&url, deadline).await {
                Ok(html) => {
                    let links = extractor.extract(&html, &url);
                    info!(url = %url, found = links.len(), "listing page scanned");
                    sink.push_extracted(links);
                }
                Err(HarvestError::DeadlineExceeded) => break,
                Err(e) => {
                    warn!(url = %url, error = %e, "listing page failed; skipping");
                    failed += 1;
                    last_err = Some(e);
                }
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(last_err.unwrap_or(HarvestError::Config(
                "crawl strategy: every page failed".into(),
            )));
        }
        Ok(sink.out)
    }
}

// ---------------------------------------------------------------------------
// Rendered crawl (browser fallback)
// ---------------------------------------------------------------------------

struct RenderStrategy {
    site: SiteConfig,
    patterns: SitePatterns,
    opts: CollectOptions,
    render_config: RenderConfig,
}

#[async_trait]
impl SourceStrategy for RenderStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Render
    }

    async fn discover(&mut self, deadline: &Deadline) -> Result<Vec<Candidate>, HarvestError> {
        let mut sink = CandidateSink::new(StrategyKind::Render, self.opts.raw_cap);
        let extractor = LinkExtractor::new(&self.patterns);
        let mut renderer = Renderer::new(self.render_config.clone());

        let pages = self.opts.num_pages.min(MAX_RENDER_PAGES);
        let mut render_failed = false;

        for page in 1..=pages {
            if deadline.expired() {
                info!(page, "render deadline reached; stopping");
                break;
            }
            if sink.full() {
                break;
            }
            let Some(url) = self.site.listing_url(page) else {
                break;
            };

            match renderer
                .render(&url, self.site.consent.as_ref(), deadline)
                .await
            {
                Ok(html) => {
                    let links = extractor.extract(&html, &url);
                    info!(url = %url, found = links.len(), "rendered page scanned");
                    sink.push_extracted(links);
                }
                Err(e) => {
                    // A broken session is not retried within the run
                    warn!(url = %url, error = %e, "render failed; abandoning fallback");
                    render_failed = true;
                    break;
                }
            }
        }

        renderer.close().await;

        if render_failed && sink.out.is_empty() {
            return Err(HarvestError::Render(
                "rendering fallback produced nothing".into(),
            ));
        }
        Ok(sink.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubStrategy {
        kind: StrategyKind,
        result: Option<Vec<Candidate>>,
    }

    #[async_trait]
    impl SourceStrategy for StubStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn discover(&mut self, _deadline: &Deadline) -> Result<Vec<Candidate>, HarvestError> {
            match self.result.take() {
                Some(candidates) => Ok(candidates),
                None => Err(HarvestError::Config("stub failure".into())),
            }
        }
    }

    fn targets(origin: StrategyKind, urls: &[&str]) -> Vec<Candidate> {
        urls.iter()
            .enumerate()
            .map(|(i, u)| Candidate::target(*u, origin, i))
            .collect()
    }

    #[tokio::test]
    async fn test_first_non_empty_strategy_wins() {
        let mut selector = StrategySelector::new(vec![
            Box::new(StubStrategy {
                kind: StrategyKind::Feed,
                result: Some(Vec::new()),
            }),
            Box::new(StubStrategy {
                kind: StrategyKind::Crawl,
                result: Some(targets(
                    StrategyKind::Crawl,
                    &["https://files.example.com/d/a", "https://files.example.com/d/b"],
                )),
            }),
            Box::new(StubStrategy {
                kind: StrategyKind::Render,
                result: Some(targets(StrategyKind::Render, &["https://files.example.com/d/z"])),
            }),
        ]);

        let got = selector.select(&Deadline::unbounded()).await;
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|c| c.origin == StrategyKind::Crawl));
    }

    #[tokio::test]
    async fn test_failed_strategy_falls_through() {
        let mut selector = StrategySelector::new(vec![
            Box::new(StubStrategy {
                kind: StrategyKind::Feed,
                result: None, // errors
            }),
            Box::new(StubStrategy {
                kind: StrategyKind::Sitemap,
                result: Some(targets(StrategyKind::Sitemap, &["https://files.example.com/d/ok"])),
            }),
        ]);

        let got = selector.select(&Deadline::unbounded()).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].origin, StrategyKind::Sitemap);
    }

    #[tokio::test]
    async fn test_all_strategies_empty_yields_empty() {
        let mut selector = StrategySelector::new(vec![Box::new(StubStrategy {
            kind: StrategyKind::Feed,
            result: Some(Vec::new()),
        })]);
        assert!(selector.select(&Deadline::unbounded()).await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline_tries_no_strategy() {
        let mut selector = StrategySelector::new(vec![Box::new(StubStrategy {
            kind: StrategyKind::Crawl,
            result: Some(targets(StrategyKind::Crawl, &["https://files.example.com/d/a"])),
        })]);
        let got = selector.select(&Deadline::after_secs(Some(0))).await;
        assert!(got.is_empty());
    }

    #[test]
    fn test_sitemap_locs_parsing() {
        let xml = r#"
            <urlset>
              <url><loc>https://listings.example.com/item/1</loc></url>
              <url><loc> https://listings.example.com/item/2 </loc></url>
              <url><loc><![CDATA[https://listings.example.com/item/3]]></loc></url>
            </urlset>
        "#;
        assert_eq!(
            sitemap_locs(xml),
            vec![
                "https://listings.example.com/item/1",
                "https://listings.example.com/item/2",
                "https://listings.example.com/item/3",
            ]
        );
    }

    #[test]
    fn test_candidate_sink_respects_cap() {
        let mut sink = CandidateSink::new(StrategyKind::Crawl, 2);
        for i in 0..5 {
            sink.push_url(format!("https://files.example.com/d/x{i}"), true);
        }
        assert_eq!(sink.out.len(), 2);
        assert_eq!(sink.out[0].order, 0);
        assert_eq!(sink.out[1].order, 1);
    }

    #[test]
    fn test_feed_url_collection_scans_nested_json() {
        let site = SiteConfig {
            base_origin: "https://listings.example.com".into(),
            target_pattern: r"https?://files\.example\.com/d/[A-Za-z0-9]+".into(),
            ..Default::default()
        };
        let patterns = site.compile().unwrap();
        let mut sink = CandidateSink::new(StrategyKind::Feed, 100);
        let doc: serde_json::Value = serde_json::from_str(
            r#"{
                "items": [
                    {"title": "one", "link": "https://files.example.com/d/aaa"},
                    {"title": "two", "media": {"url": "https://files.example.com/d/bbb"}}
                ],
                "next": null
            }"#,
        )
        .unwrap();
        collect_feed_urls(&doc, &patterns, &mut sink);
        let urls: Vec<_> = sink.out.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://files.example.com/d/aaa",
                "https://files.example.com/d/bbb"
            ]
        );
    }
}
