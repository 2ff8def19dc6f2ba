//! HTTP fetch executor: one request with timeout, retry/backoff, proxy
//! support and per-host politeness pacing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::CollectOptions;
use crate::error::HarvestError;

use super::deadline::Deadline;

pub const USER_AGENT: &str = "linkharvest/0.3 (+https://github.com/linkharvest/linkharvest)";

/// Real browser user agents for impersonate mode.
pub const IMPERSONATE_USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Firefox on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

/// Pick an impersonate user agent without a PRNG dependency.
pub fn random_user_agent() -> &'static str {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as usize)
        .unwrap_or(0);
    IMPERSONATE_USER_AGENTS[nanos % IMPERSONATE_USER_AGENTS.len()]
}

/// Resolve user agent from config value.
/// - None => default linkharvest user agent
/// - "impersonate" => random real browser user agent
/// - other => custom user agent string
pub fn resolve_user_agent(config: Option<&str>) -> String {
    match config {
        None => USER_AGENT.to_string(),
        Some("impersonate") => random_user_agent().to_string(),
        Some(custom) => custom.to_string(),
    }
}

#[derive(Debug)]
struct HostState {
    last_request: Option<Instant>,
    current_delay: Duration,
}

/// Per-host politeness pacer. Spaces requests by a base delay and backs
/// off after 429/503; recovers to the base delay on success. In-run scope
/// only, nothing persists.
#[derive(Debug, Clone)]
pub struct HostPacer {
    base_delay: Duration,
    max_delay: Duration,
    hosts: Arc<RwLock<HashMap<String, HostState>>>,
}

impl HostPacer {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Duration::from_secs(10),
            hosts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn host_of(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    /// Wait until the host is ready, then mark the request as started.
    pub async fn acquire(&self, url: &str) -> Option<String> {
        let host = Self::host_of(url)?;

        let wait = {
            let hosts = self.hosts.read().await;
            hosts
                .get(&host)
                .and_then(|s| {
                    s.last_request
                        .map(|last| (last + s.current_delay).saturating_duration_since(Instant::now()))
                })
                .unwrap_or(Duration::ZERO)
        };
        if wait > Duration::ZERO {
            debug!(host = %host, ?wait, "pacing request");
            tokio::time::sleep(wait).await;
        }

        let mut hosts = self.hosts.write().await;
        let state = hosts.entry(host.clone()).or_insert_with(|| HostState {
            last_request: None,
            current_delay: self.base_delay,
        });
        state.last_request = Some(Instant::now());
        Some(host)
    }

    /// Rate-limit response seen: escalate the per-host delay.
    pub async fn report_rate_limited(&self, host: &str) {
        let mut hosts = self.hosts.write().await;
        if let Some(state) = hosts.get_mut(host) {
            state.current_delay = (state.current_delay * 4).min(self.max_delay);
            warn!(host = %host, delay = ?state.current_delay, "rate limited, backing off");
        }
    }

    /// Successful response: fall back to the base delay.
    pub async fn report_success(&self, host: &str) {
        let mut hosts = self.hosts.write().await;
        if let Some(state) = hosts.get_mut(host) {
            state.current_delay = self.base_delay;
        }
    }
}

/// HTTP fetch executor shared by the non-rendering strategies and the
/// liveness verifier.
#[derive(Clone)]
pub struct FetchExecutor {
    client: Client,
    pacer: HostPacer,
    retry_attempts: u32,
}

impl FetchExecutor {
    pub fn new(opts: &CollectOptions) -> Result<Self, HarvestError> {
        let user_agent = resolve_user_agent(opts.user_agent.as_deref());
        let mut builder = Client::builder()
            .user_agent(&user_agent)
            .timeout(opts.request_timeout())
            .cookie_store(true)
            .gzip(true)
            .brotli(true);
        if let Some(ref proxy) = opts.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            pacer: HostPacer::new(opts.page_delay()),
            retry_attempts: opts.retry_attempts,
        })
    }

    pub fn pacer(&self) -> &HostPacer {
        &self.pacer
    }

    /// GET a page as text, retrying transport errors with backoff up to
    /// the configured budget. Non-2xx statuses are errors here: callers
    /// treat a failed page as skipped, not fatal.
    pub async fn get_text(&self, url: &str, deadline: &Deadline) -> Result<String, HarvestError> {
        if deadline.expired() {
            return Err(HarvestError::DeadlineExceeded);
        }

        let mut last_err: Option<reqwest::Error> = None;
        for attempt in 0..=self.retry_attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(500) * 2u32.pow(attempt - 1);
                tokio::time::sleep(deadline.clamp(backoff)).await;
                if deadline.expired() {
                    return Err(HarvestError::DeadlineExceeded);
                }
            }

            let host = self.pacer.acquire(url).await;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if let Some(ref host) = host {
                        if status == StatusCode::TOO_MANY_REQUESTS
                            || status == StatusCode::SERVICE_UNAVAILABLE
                        {
                            self.pacer.report_rate_limited(host).await;
                        } else if status.is_success() {
                            self.pacer.report_success(host).await;
                        }
                    }
                    return Ok(resp.error_for_status()?.text().await?);
                }
                Err(e) => {
                    debug!(url = %url, attempt, error = %e, "page fetch failed");
                    last_err = Some(e);
                }
            }
        }

        // retry budget exhausted
        Err(last_err
            .map(HarvestError::Transport)
            .unwrap_or(HarvestError::DeadlineExceeded))
    }

    /// GET a URL reading at most `max_bytes` of the body, then drop the
    /// connection. Used by the liveness probe, where the full body is
    /// wasteful. No retries: probe failures are verdicts, not errors.
    pub async fn get_prefix(
        &self,
        url: &str,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let mut resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status();

        let mut body: Vec<u8> = Vec::with_capacity(max_bytes.min(8192));
        while let Some(chunk) = resp.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() >= max_bytes {
                break;
            }
        }
        body.truncate(max_bytes);

        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_user_agent_default() {
        let ua = resolve_user_agent(None);
        assert!(ua.contains("linkharvest"));
    }

    #[test]
    fn test_resolve_user_agent_impersonate() {
        let ua = resolve_user_agent(Some("impersonate"));
        assert!(ua.contains("Mozilla"));
        assert!(!ua.contains("linkharvest"));
    }

    #[test]
    fn test_resolve_user_agent_custom() {
        assert_eq!(resolve_user_agent(Some("MyBot/1.0")), "MyBot/1.0");
    }

    #[tokio::test]
    async fn test_pacer_tracks_hosts_independently() {
        let pacer = HostPacer::new(Duration::ZERO);
        assert_eq!(
            pacer.acquire("https://a.example.com/x").await.as_deref(),
            Some("a.example.com")
        );
        assert_eq!(
            pacer.acquire("https://b.example.com/y").await.as_deref(),
            Some("b.example.com")
        );
        // Unparseable URLs are not paced
        assert!(pacer.acquire("not a url").await.is_none());
    }

    #[tokio::test]
    async fn test_pacer_backoff_and_recovery() {
        let pacer = HostPacer::new(Duration::from_millis(1));
        pacer.acquire("https://a.example.com/x").await;
        pacer.report_rate_limited("a.example.com").await;
        {
            let hosts = pacer.hosts.read().await;
            assert_eq!(
                hosts.get("a.example.com").unwrap().current_delay,
                Duration::from_millis(4)
            );
        }
        pacer.report_success("a.example.com").await;
        {
            let hosts = pacer.hosts.read().await;
            assert_eq!(
                hosts.get("a.example.com").unwrap().current_delay,
                Duration::from_millis(1)
            );
        }
    }
}
