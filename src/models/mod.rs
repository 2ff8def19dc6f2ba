//! Core data types shared across pipeline stages.

use serde::{Deserialize, Serialize};

/// One method of enumerating a site's listing, tried in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Structured feed/API fast path.
    Feed,
    /// Site-map based enumeration.
    Sitemap,
    /// Page-by-page listing crawl over plain HTTP.
    Crawl,
    /// Rendered crawl through the headless browser fallback.
    Render,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyKind::Feed => "feed",
            StrategyKind::Sitemap => "sitemap",
            StrategyKind::Crawl => "crawl",
            StrategyKind::Render => "render",
        };
        f.write_str(name)
    }
}

/// How a candidate link relates to the target pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Matches the target-content pattern directly.
    Target,
    /// Secondary detail/redirect link; must go through the resolver.
    Redirect,
}

/// A link extracted from a page, not yet resolved or verified.
/// Created by the extractor, consumed within a single run, never persisted.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: String,
    pub origin: StrategyKind,
    /// Discovery order; lower = newer = more preferred.
    pub order: usize,
    pub kind: LinkKind,
}

impl Candidate {
    pub fn target(url: impl Into<String>, origin: StrategyKind, order: usize) -> Self {
        Self {
            url: url.into(),
            origin,
            order,
            kind: LinkKind::Target,
        }
    }

    pub fn redirect(url: impl Into<String>, origin: StrategyKind, order: usize) -> Self {
        Self {
            url: url.into(),
            origin,
            order,
            kind: LinkKind::Redirect,
        }
    }
}

/// Tri-state outcome of probing a resolved URL.
///
/// `Unknown` is deliberately not `Dead`: a timed-out or rate-limited probe
/// must not record a live link as removed. Both end up excluded from the
/// batch, but they are logged differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    Dead,
    Unknown,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verdict::Alive => "alive",
            Verdict::Dead => "dead",
            Verdict::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Canonicalize a URL for dedup equality: trim, force https, strip the
/// trailing slash. Idempotent.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let https = if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("http://") {
        format!("https://{}", &trimmed[7..])
    } else {
        trimmed.to_string()
    };
    https.trim_end_matches('/').to_string()
}

/// Correct minor scheme typos (a dropped letter in "https") before
/// pattern matching.
pub fn fix_scheme_typo(url: &str) -> String {
    let u = url.trim();
    for (broken, fixed) in [
        ("ttps://", "https://"),
        ("ttp://", "http://"),
        ("htps://", "https://"),
        ("htp://", "http://"),
        ("https//", "https://"),
        ("http//", "http://"),
    ] {
        if let Some(rest) = u.strip_prefix(broken) {
            return format!("{fixed}{rest}");
        }
    }
    u.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_forces_https() {
        assert_eq!(
            normalize_url("http://example.com/d/abc"),
            "https://example.com/d/abc"
        );
    }

    #[test]
    fn test_normalize_strips_trailing_slash_and_whitespace() {
        assert_eq!(
            normalize_url("  https://example.com/d/abc/  "),
            "https://example.com/d/abc"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            "http://example.com/d/abc/",
            "https://example.com",
            "  https://example.com/x  ",
            "not a url",
        ];
        for u in inputs {
            let once = normalize_url(u);
            assert_eq!(normalize_url(&once), once);
        }
    }

    #[test]
    fn test_fix_scheme_typo() {
        assert_eq!(
            fix_scheme_typo("ttps://example.com/d/abc"),
            "https://example.com/d/abc"
        );
        assert_eq!(
            fix_scheme_typo("htps://example.com/d/abc"),
            "https://example.com/d/abc"
        );
        assert_eq!(
            fix_scheme_typo("https//example.com/d/abc"),
            "https://example.com/d/abc"
        );
        // Already-correct URLs pass through untouched
        assert_eq!(
            fix_scheme_typo("https://example.com/d/abc"),
            "https://example.com/d/abc"
        );
    }
}
