//! Link extraction from raw markup.
//!
//! Combines an attribute walk (anchors plus the data-attributes sites use
//! to embed URLs) with a full-text pattern scan that catches URLs inside
//! inline scripts. Full-text hits count only when they independently match
//! the target pattern, so the catch-all cannot introduce false positives.

use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use crate::config::SitePatterns;
use crate::models::fix_scheme_typo;

/// Attributes commonly carrying URLs besides `href`.
const URL_ATTRS: &[&str] = &["href", "data-url", "data-href", "data-link", "data-src"];

const ATTR_SELECTOR: &str = "a[href], [data-url], [data-href], [data-link], [data-src]";

/// Links pulled from one page, order-preserving and de-duplicated.
#[derive(Debug, Default)]
pub struct ExtractedLinks {
    /// Direct matches of the target-content pattern.
    pub targets: Vec<String>,
    /// Secondary detail/redirect links, to be fed through the resolver.
    pub details: Vec<String>,
}

impl ExtractedLinks {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.details.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len() + self.details.len()
    }
}

pub struct LinkExtractor<'a> {
    patterns: &'a SitePatterns,
}

impl<'a> LinkExtractor<'a> {
    pub fn new(patterns: &'a SitePatterns) -> Self {
        Self { patterns }
    }

    /// Scan markup for target and detail links. `base_url` absolutizes
    /// relative detail hrefs.
    pub fn extract(&self, html: &str, base_url: &str) -> ExtractedLinks {
        let mut out = ExtractedLinks::default();
        let mut seen: HashSet<String> = HashSet::new();

        // Pass 1: tag attributes, in document order.
        let doc = Html::parse_document(html);
        if let Ok(selector) = Selector::parse(ATTR_SELECTOR) {
            for element in doc.select(&selector) {
                for attr in URL_ATTRS {
                    let Some(value) = element.value().attr(attr) else {
                        continue;
                    };
                    self.classify(value, base_url, &mut seen, &mut out);
                }
            }
        }

        // Pass 2: full-text catch-all over the raw markup.
        for m in self.patterns.target.find_iter(html) {
            push_unique(&mut out.targets, &mut seen, m.as_str().to_string());
        }

        out
    }

    fn classify(
        &self,
        raw: &str,
        base_url: &str,
        seen: &mut HashSet<String>,
        out: &mut ExtractedLinks,
    ) {
        let value = fix_scheme_typo(raw);

        if let Some(m) = self.patterns.target.find(&value) {
            push_unique(&mut out.targets, seen, m.as_str().to_string());
            return;
        }

        let absolute = absolutize(&value, base_url);
        if self.patterns.details.iter().any(|d| d.is_match(&absolute)) {
            push_unique(&mut out.details, seen, absolute);
        }
    }
}

fn push_unique(list: &mut Vec<String>, seen: &mut HashSet<String>, url: String) {
    if url.is_empty() {
        return;
    }
    if seen.insert(url.clone()) {
        list.push(url);
    }
}

fn absolutize(link: &str, base_url: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    match Url::parse(base_url).and_then(|b| b.join(link)) {
        Ok(joined) => joined.to_string(),
        Err(_) => link.to_string(),
    }
}
