//! Lightweight liveness probe for resolved URLs.
//!
//! Reads only a body prefix and classifies alive/dead/unknown. The
//! asymmetry is deliberate: a timed-out or rate-limited probe is
//! `Unknown`, never `Dead` - posting a dead link is the costlier failure,
//! but a flaky network must not burn live candidates either. Both end up
//! excluded from the batch; they are logged differently.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::config::CollectOptions;
use crate::models::Verdict;

use super::deadline::Deadline;
use super::fetch::FetchExecutor;

/// Phrases a host serves on removed/expired content pages.
pub const REMOVED_MARKERS: &[&str] = &[
    "this content does not exist",
    "the content you are looking for could not be found",
    "no items to display",
    "this content is password protected",
    "has been automatically removed",
    "has been deleted by the owner",
];

/// Seam for the selection loop; lets tests substitute scripted verdicts.
#[async_trait]
pub trait ProbeLiveness: Send + Sync {
    async fn verify(&self, url: &str, deadline: &Deadline) -> Verdict;
}

pub struct LivenessVerifier {
    fetch: FetchExecutor,
    timeout: std::time::Duration,
    read_limit: usize,
}

impl LivenessVerifier {
    pub fn new(fetch: FetchExecutor, opts: &CollectOptions) -> Self {
        Self {
            fetch,
            timeout: opts.probe_timeout(),
            read_limit: opts.probe_read_limit,
        }
    }
}

#[async_trait]
impl ProbeLiveness for LivenessVerifier {
    async fn verify(&self, url: &str, deadline: &Deadline) -> Verdict {
        if deadline.expired() {
            debug!(url = %url, "skipping probe, deadline passed");
            return Verdict::Unknown;
        }
        let timeout = deadline.clamp(self.timeout);
        if timeout.is_zero() {
            return Verdict::Unknown;
        }

        match self.fetch.get_prefix(url, self.read_limit, timeout).await {
            Ok((status, body)) => {
                let verdict = classify(status, &body);
                match verdict {
                    Verdict::Alive => debug!(url = %url, "probe: alive"),
                    Verdict::Dead => info!(url = %url, status = %status, "probe: dead"),
                    Verdict::Unknown => info!(url = %url, status = %status, "probe: ambiguous status"),
                }
                verdict
            }
            Err(e) => {
                info!(url = %url, error = %e, "probe: transport failure");
                Verdict::Unknown
            }
        }
    }
}

/// Classify a probe response. Pure, so re-running it on the same response
/// always yields the same verdict.
pub fn classify(status: StatusCode, body_prefix: &str) -> Verdict {
    // Rate limiting and overload are ambiguous, not proof of removal.
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        return Verdict::Unknown;
    }
    if status.is_client_error() || status.is_server_error() {
        return Verdict::Dead;
    }
    if !status.is_success() {
        return Verdict::Unknown;
    }

    let lowered = body_prefix.to_lowercase();
    if REMOVED_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Verdict::Dead;
    }
    Verdict::Alive
}
