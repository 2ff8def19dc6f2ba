//! Redirect/short-link resolution without rendering the destination.
//!
//! On the hot path for every detail candidate, so it must finish in low
//! single-digit seconds or be abandoned. Resolution order: query-parameter
//! decode, then a no-redirect HEAD for the Location header, then a
//! verbatim target match. `None` means "could not resolve" - the caller
//! discards the candidate; it is never an error.

use std::time::Duration;

use regex::Regex;
use reqwest::{redirect, Client};
use tracing::debug;
use url::Url;

use crate::config::CollectOptions;
use crate::error::HarvestError;
use crate::models::fix_scheme_typo;

use super::deadline::Deadline;

pub struct RedirectResolver {
    client: Client,
    timeout: Duration,
}

impl RedirectResolver {
    pub fn new(opts: &CollectOptions) -> Result<Self, HarvestError> {
        // Dedicated client: redirects must not be followed, the Location
        // header itself is the answer.
        let mut builder = Client::builder()
            .user_agent(super::fetch::resolve_user_agent(opts.user_agent.as_deref()))
            .redirect(redirect::Policy::none())
            .timeout(opts.resolve_timeout());
        if let Some(ref proxy) = opts.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            timeout: opts.resolve_timeout(),
        })
    }

    /// Resolve a same-site redirect/outbound link to a canonical target
    /// URL, or `None` when no step yields a target-pattern match.
    pub async fn resolve(
        &self,
        link: &str,
        target: &Regex,
        params: &[String],
        deadline: &Deadline,
    ) -> Option<String> {
        // 1) Destination encoded in a query parameter.
        if let Some(url) = decode_from_query(link, params, target) {
            return Some(url);
        }

        // 2) HEAD without following redirects, read Location.
        if !deadline.expired() {
            match self.head_location(link, deadline).await {
                Some(location) => {
                    let location = fix_scheme_typo(&location);
                    if let Some(m) = target.find(&location) {
                        return Some(m.as_str().to_string());
                    }
                }
                None => debug!(link = %link, "no usable Location header"),
            }
        }

        // 3) The input already is a target URL.
        target.find(link).map(|m| m.as_str().to_string())
    }

    async fn head_location(&self, link: &str, deadline: &Deadline) -> Option<String> {
        let timeout = deadline.clamp(self.timeout);
        if timeout.is_zero() {
            return None;
        }
        let resp = match self.client.head(link).timeout(timeout).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(link = %link, error = %e, "redirect HEAD failed");
                return None;
            }
        };
        if !resp.status().is_redirection() {
            return None;
        }
        resp.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// Step 1 of resolution: pull the destination out of a query parameter
/// (common keys: url, u, target), percent-decoded, and match it against
/// the target pattern.
pub fn decode_from_query(link: &str, params: &[String], target: &Regex) -> Option<String> {
    let url = Url::parse(link).ok()?;
    for key in params {
        for (k, v) in url.query_pairs() {
            if k != key.as_str() {
                continue;
            }
            // query_pairs already percent-decodes; run a second decode for
            // doubly-encoded values seen in the wild
            let mut candidates = vec![v.to_string()];
            if let Ok(decoded) = urlencoding::decode(&v) {
                candidates.push(decoded.into_owned());
            }
            for value in candidates {
                let value = fix_scheme_typo(&value);
                if let Some(m) = target.find(&value) {
                    return Some(m.as_str().to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::RegexBuilder;

    fn target() -> Regex {
        RegexBuilder::new(r"https?://files\.example\.com/d/[A-Za-z0-9]+")
            .case_insensitive(true)
            .build()
            .unwrap()
    }

    fn params() -> Vec<String> {
        ["url", "u", "target", "to", "dest"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_query_param_round_trip() {
        // A synthetic redirect URL encoding a known target resolves to
        // exactly that target.
        let encoded = urlencoding::encode("https://files.example.com/d/abc123");
        let link = format!("https://listings.example.com/out?u={encoded}");
        assert_eq!(
            decode_from_query(&link, &params(), &target()),
            Some("https://files.example.com/d/abc123".to_string())
        );
    }

    #[test]
    fn test_query_param_key_priority() {
        let link = "https://listings.example.com/out?junk=1&url=https://files.example.com/d/xyz";
        assert_eq!(
            decode_from_query(link, &params(), &target()),
            Some("https://files.example.com/d/xyz".to_string())
        );
    }

    #[test]
    fn test_query_param_without_target_is_none() {
        let link = "https://listings.example.com/out?u=https://elsewhere.example.com/x";
        assert_eq!(decode_from_query(link, &params(), &target()), None);
    }

    #[test]
    fn test_doubly_encoded_value_is_decoded() {
        let once = urlencoding::encode("https://files.example.com/d/dbl").into_owned();
        let twice = urlencoding::encode(&once).into_owned();
        let link = format!("https://listings.example.com/out?target={twice}");
        assert_eq!(
            decode_from_query(&link, &params(), &target()),
            Some("https://files.example.com/d/dbl".to_string())
        );
    }

    #[tokio::test]
    async fn test_verbatim_target_passes_through() {
        let resolver = RedirectResolver::new(&CollectOptions::default()).unwrap();
        // Expired deadline skips the HEAD step, leaving only the verbatim
        // match, so no network is touched.
        let deadline = Deadline::after_secs(Some(0));
        let resolved = resolver
            .resolve(
                "https://files.example.com/d/direct",
                &target(),
                &params(),
                &deadline,
            )
            .await;
        assert_eq!(
            resolved,
            Some("https://files.example.com/d/direct".to_string())
        );
    }

    #[tokio::test]
    async fn test_unresolvable_link_is_none() {
        let resolver = RedirectResolver::new(&CollectOptions::default()).unwrap();
        let deadline = Deadline::after_secs(Some(0));
        let resolved = resolver
            .resolve(
                "https://listings.example.com/page/7",
                &target(),
                &params(),
                &deadline,
            )
            .await;
        assert_eq!(resolved, None);
    }
}
