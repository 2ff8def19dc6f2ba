//! Read-only view of the caller's persisted run state.
//!
//! The pipeline never writes state; publishing and state updates belong
//! to the caller. This reader only builds the already-seen set: every URL
//! ever posted plus anything used within the recent window.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::normalize_url;

/// Hours a recently used URL stays excluded even if it never made it
/// into the posted list.
pub const DEFAULT_RECENT_WINDOW_HOURS: i64 = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub posted_urls: Vec<String>,
    #[serde(default, alias = "recent_urls_24h")]
    pub recent_urls: Vec<RecentUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentUrl {
    pub url: String,
    pub ts: DateTime<Utc>,
}

impl RunState {
    /// Load state from a JSON file. A missing or unreadable file is an
    /// empty state, not an error; the first run starts cold.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "run state unreadable; starting cold");
                Self::default()
            }
        }
    }

    /// Union of posted URLs and recent-window URLs, normalized.
    pub fn already_seen(&self, window_hours: i64) -> HashSet<String> {
        let cutoff = Utc::now() - Duration::hours(window_hours);
        let mut seen: HashSet<String> = self
            .posted_urls
            .iter()
            .map(|u| normalize_url(u))
            .collect();
        seen.extend(
            self.recent_urls
                .iter()
                .filter(|r| r.ts >= cutoff)
                .map(|r| normalize_url(&r.url)),
        );
        seen
    }
}
