//! Deduplication and selection over candidates in discovery order.
//!
//! Consumes candidates until the quota of alive, never-used, structurally
//! unique URLs is met or the deadline passes. Verification fans out to a
//! bounded, order-preserving gather: a later candidate never gets accepted
//! ahead of an earlier one still pending, which is what encodes the
//! "prefer newer" policy end to end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{CollectOptions, SiteConfig, SitePatterns};
use crate::models::{fix_scheme_typo, normalize_url, Candidate, LinkKind, Verdict};

use super::deadline::Deadline;
use super::liveness::ProbeLiveness;
use super::resolve::RedirectResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    DeadlinePassed,
    AlreadyUsed,
    DuplicateInRun,
    Unresolved,
    Dead,
    AmbiguousLiveness,
    ProbeBudgetSpent,
}

enum Outcome {
    Accepted(String),
    Skipped { url: String, reason: SkipReason },
}

pub struct SelectionLoop<'a, V: ProbeLiveness> {
    pub site: &'a SiteConfig,
    pub patterns: &'a SitePatterns,
    pub opts: &'a CollectOptions,
    pub resolver: &'a RedirectResolver,
    pub verifier: &'a V,
    pub already_seen: &'a HashSet<String>,
}

impl<'a, V: ProbeLiveness> SelectionLoop<'a, V> {
    /// Run candidates through normalize → dedup → resolve → verify,
    /// returning up to `want` accepted URLs in discovery order.
    pub async fn select(&self, candidates: Vec<Candidate>, deadline: &Deadline) -> Vec<String> {
        let want = self.opts.want;
        if want == 0 || deadline.expired() {
            return Vec::new();
        }

        // In-run seen set; shared with the concurrent verification tasks.
        let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let probes = Arc::new(AtomicUsize::new(0));

        let mut outcomes = stream::iter(candidates.into_iter().map(|candidate| {
            let seen = Arc::clone(&seen);
            let probes = Arc::clone(&probes);
            async move { self.process(candidate, seen, probes, deadline).await }
        }))
        .buffered(self.opts.verify_concurrency.max(1));

        let mut accepted: Vec<String> = Vec::new();
        while let Some(outcome) = outcomes.next().await {
            if deadline.expired() {
                // Work that was in flight when the deadline passed is
                // discarded along with everything not yet started.
                info!(
                    accepted = accepted.len(),
                    "deadline reached during selection; stopping"
                );
                break;
            }
            match outcome {
                Outcome::Accepted(url) => {
                    info!(url = %url, n = accepted.len() + 1, "candidate accepted");
                    accepted.push(url);
                    if accepted.len() >= want {
                        // Quota met: skip all remaining liveness checks
                        break;
                    }
                }
                Outcome::Skipped { url, reason } => match reason {
                    SkipReason::Dead | SkipReason::AmbiguousLiveness => {
                        info!(url = %url, reason = ?reason, "candidate excluded")
                    }
                    _ => debug!(url = %url, reason = ?reason, "candidate skipped"),
                },
            }
        }

        info!(
            accepted = accepted.len(),
            probes = probes.load(Ordering::Relaxed).min(self.opts.max_probes),
            "selection finished"
        );
        accepted
    }

    async fn process(
        &self,
        candidate: Candidate,
        seen: Arc<Mutex<HashSet<String>>>,
        probes: Arc<AtomicUsize>,
        deadline: &Deadline,
    ) -> Outcome {
        if deadline.expired() {
            return Outcome::Skipped {
                url: candidate.url,
                reason: SkipReason::DeadlinePassed,
            };
        }

        let norm = normalize_url(&fix_scheme_typo(&candidate.url));
        if self.already_seen.contains(&norm) {
            return Outcome::Skipped {
                url: norm,
                reason: SkipReason::AlreadyUsed,
            };
        }
        if !seen.lock().await.insert(norm.clone()) {
            return Outcome::Skipped {
                url: norm,
                reason: SkipReason::DuplicateInRun,
            };
        }

        // Detail/redirect links have to be decoded to the canonical
        // target before dedup on the resolved form makes sense.
        let resolved = match candidate.kind {
            LinkKind::Target => norm.clone(),
            LinkKind::Redirect => {
                match self
                    .resolver
                    .resolve(
                        &candidate.url,
                        &self.patterns.target,
                        &self.site.redirect_params,
                        deadline,
                    )
                    .await
                {
                    Some(url) => normalize_url(&url),
                    None => {
                        return Outcome::Skipped {
                            url: norm,
                            reason: SkipReason::Unresolved,
                        }
                    }
                }
            }
        };

        if resolved != norm {
            if self.already_seen.contains(&resolved) {
                return Outcome::Skipped {
                    url: resolved,
                    reason: SkipReason::AlreadyUsed,
                };
            }
            if !seen.lock().await.insert(resolved.clone()) {
                return Outcome::Skipped {
                    url: resolved,
                    reason: SkipReason::DuplicateInRun,
                };
            }
        }

        // Sources whose target URLs cannot go stale within a run skip
        // the probe entirely.
        if self.site.self_verifying {
            return Outcome::Accepted(resolved);
        }

        if probes.fetch_add(1, Ordering::SeqCst) >= self.opts.max_probes {
            return Outcome::Skipped {
                url: resolved,
                reason: SkipReason::ProbeBudgetSpent,
            };
        }
        if deadline.expired() {
            return Outcome::Skipped {
                url: resolved,
                reason: SkipReason::DeadlinePassed,
            };
        }

        match self.verifier.verify(&resolved, deadline).await {
            Verdict::Alive => Outcome::Accepted(resolved),
            Verdict::Dead => Outcome::Skipped {
                url: resolved,
                reason: SkipReason::Dead,
            },
            Verdict::Unknown => Outcome::Skipped {
                url: resolved,
                reason: SkipReason::AmbiguousLiveness,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Scripted verifier: per-URL verdicts plus a probe counter.
    struct ScriptedVerifier {
        verdicts: HashMap<String, Verdict>,
        probes: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedVerifier {
        fn new(verdicts: &[(&str, Verdict)]) -> Self {
            Self {
                verdicts: verdicts
                    .iter()
                    .map(|(u, v)| (u.to_string(), *v))
                    .collect(),
                probes: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProbeLiveness for ScriptedVerifier {
        async fn verify(&self, url: &str, _deadline: &Deadline) -> Verdict {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            *self.verdicts.get(url).unwrap_or(&Verdict::Unknown)
        }
    }

    fn site() -> SiteConfig {
        SiteConfig {
            base_origin: "https://listings.example.com".into(),
            target_pattern: r"https?://files\.example\.com/d/[A-Za-z0-9]+".into(),
            ..Default::default()
        }
    }

    fn candidates(urls: &[&str]) -> Vec<Candidate> {
        urls.iter()
            .enumerate()
            .map(|(i, u)| Candidate::target(*u, StrategyKind::Crawl, i))
            .collect()
    }

    async fn run_selection(
        site: &SiteConfig,
        opts: &CollectOptions,
        verifier: &ScriptedVerifier,
        already: &HashSet<String>,
        cands: Vec<Candidate>,
        deadline: &Deadline,
    ) -> Vec<String> {
        let patterns = site.compile().unwrap();
        let resolver = RedirectResolver::new(opts).unwrap();
        let selection = SelectionLoop {
            site,
            patterns: &patterns,
            opts,
            resolver: &resolver,
            verifier,
            already_seen: already,
        };
        selection.select(cands, deadline).await
    }

    #[tokio::test]
    async fn test_scenario_a_first_three_alive_in_order() {
        let site = site();
        let opts = CollectOptions {
            want: 3,
            ..Default::default()
        };
        let urls: Vec<String> = (1..=5)
            .map(|i| format!("https://files.example.com/d/v{i}"))
            .collect();
        let verdicts: Vec<(&str, Verdict)> =
            urls.iter().map(|u| (u.as_str(), Verdict::Alive)).collect();
        let verifier = ScriptedVerifier::new(&verdicts);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&urls.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(got, urls[..3].to_vec());
    }

    #[tokio::test]
    async fn test_scenario_b_dead_candidates_cost_probes_but_not_slots() {
        let site = site();
        // Sequential verification makes the probe count exact
        let opts = CollectOptions {
            want: 3,
            verify_concurrency: 1,
            ..Default::default()
        };
        let urls: Vec<String> = (1..=10)
            .map(|i| format!("https://files.example.com/d/b{i}"))
            .collect();
        let verdicts: Vec<(&str, Verdict)> = urls
            .iter()
            .enumerate()
            .map(|(i, u)| {
                (
                    u.as_str(),
                    if i < 4 { Verdict::Dead } else { Verdict::Alive },
                )
            })
            .collect();
        let verifier = ScriptedVerifier::new(&verdicts);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&urls.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(got, urls[4..7].to_vec());
        // 4 dead + 3 alive probed; candidates 8-10 never probed
        assert_eq!(verifier.probe_count(), 7);
    }

    #[tokio::test]
    async fn test_scenario_c_expired_deadline_yields_empty_batch() {
        let site = site();
        let opts = CollectOptions {
            want: 3,
            ..Default::default()
        };
        let verifier =
            ScriptedVerifier::new(&[("https://files.example.com/d/x", Verdict::Alive)]);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&["https://files.example.com/d/x"]),
            &Deadline::after_secs(Some(0)),
        )
        .await;

        assert!(got.is_empty());
        assert_eq!(verifier.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_scenario_e_unknown_excluded_without_blocking_rest() {
        let site = site();
        let opts = CollectOptions {
            want: 2,
            ..Default::default()
        };
        let verifier = ScriptedVerifier::new(&[
            ("https://files.example.com/d/t1", Verdict::Unknown),
            ("https://files.example.com/d/t2", Verdict::Alive),
            ("https://files.example.com/d/t3", Verdict::Alive),
        ]);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&[
                "https://files.example.com/d/t1",
                "https://files.example.com/d/t2",
                "https://files.example.com/d/t3",
            ]),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(
            got,
            vec![
                "https://files.example.com/d/t2".to_string(),
                "https://files.example.com/d/t3".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_already_seen_is_excluded_post_normalization() {
        let site = site();
        let opts = CollectOptions {
            want: 5,
            ..Default::default()
        };
        let verifier = ScriptedVerifier::new(&[
            ("https://files.example.com/d/used", Verdict::Alive),
            ("https://files.example.com/d/fresh", Verdict::Alive),
        ]);
        // Stored normalized; candidate arrives denormalized
        let already: HashSet<String> =
            [normalize_url("http://files.example.com/d/used/")].into();

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &already,
            candidates(&[
                "http://files.example.com/d/used/",
                "https://files.example.com/d/fresh",
            ]),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(got, vec!["https://files.example.com/d/fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_in_run_duplicates_collapse() {
        let site = site();
        let opts = CollectOptions {
            want: 5,
            verify_concurrency: 1,
            ..Default::default()
        };
        let verifier =
            ScriptedVerifier::new(&[("https://files.example.com/d/dup", Verdict::Alive)]);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&[
                "https://files.example.com/d/dup",
                "http://files.example.com/d/dup/",
                "https://files.example.com/d/dup",
            ]),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(got, vec!["https://files.example.com/d/dup".to_string()]);
        assert_eq!(verifier.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_budget_caps_verification() {
        let site = site();
        let opts = CollectOptions {
            want: 10,
            max_probes: 2,
            verify_concurrency: 1,
            ..Default::default()
        };
        let urls: Vec<String> = (1..=5)
            .map(|i| format!("https://files.example.com/d/c{i}"))
            .collect();
        let verdicts: Vec<(&str, Verdict)> =
            urls.iter().map(|u| (u.as_str(), Verdict::Alive)).collect();
        let verifier = ScriptedVerifier::new(&verdicts);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&urls.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
            &Deadline::unbounded(),
        )
        .await;

        // Only the two probed candidates can be accepted
        assert_eq!(got, urls[..2].to_vec());
        assert_eq!(verifier.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_self_verifying_site_skips_probes() {
        let site = SiteConfig {
            self_verifying: true,
            ..site()
        };
        let opts = CollectOptions {
            want: 2,
            ..Default::default()
        };
        let verifier = ScriptedVerifier::new(&[]);

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&[
                "https://files.example.com/d/m1",
                "https://files.example.com/d/m2",
            ]),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(got.len(), 2);
        assert_eq!(verifier.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_verification_preserves_discovery_order() {
        let site = site();
        let opts = CollectOptions {
            want: 3,
            verify_concurrency: 4,
            ..Default::default()
        };
        let urls: Vec<String> = (1..=6)
            .map(|i| format!("https://files.example.com/d/o{i}"))
            .collect();
        let verdicts: Vec<(&str, Verdict)> =
            urls.iter().map(|u| (u.as_str(), Verdict::Alive)).collect();
        let verifier =
            ScriptedVerifier::new(&verdicts).with_delay(Duration::from_millis(10));

        let got = run_selection(
            &site,
            &opts,
            &verifier,
            &HashSet::new(),
            candidates(&urls.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
            &Deadline::unbounded(),
        )
        .await;

        assert_eq!(got, urls[..3].to_vec());
    }
}
