//! Run orchestration: one deadline, strategy selection, candidate
//! selection, minimum-count gate.

use std::collections::HashSet;

use tracing::info;

use crate::config::{CollectOptions, SiteConfig, SitePatterns};
use crate::error::HarvestError;
use crate::models::Candidate;

use super::browser::RenderConfig;
use super::deadline::Deadline;
use super::fetch::FetchExecutor;
use super::liveness::{LivenessVerifier, ProbeLiveness};
use super::resolve::RedirectResolver;
use super::select::SelectionLoop;
use super::strategy::{SourceStrategy, StrategySelector};

/// Wires the pipeline for one site. A run is a pure function of
/// (site config, already-seen set, quota, deadline) → URL batch; the
/// collector owns no cross-run state.
pub struct Collector<V: ProbeLiveness> {
    site: SiteConfig,
    patterns: SitePatterns,
    opts: CollectOptions,
    fetch: FetchExecutor,
    resolver: RedirectResolver,
    verifier: V,
    render_config: RenderConfig,
}

impl Collector<LivenessVerifier> {
    /// Build a collector with the real liveness verifier. Configuration
    /// problems (bad pattern, bad proxy) are fatal here; nothing later is.
    pub fn new(site: SiteConfig, opts: CollectOptions) -> Result<Self, HarvestError> {
        let patterns = site.compile()?;
        let fetch = FetchExecutor::new(&opts)?;
        let resolver = RedirectResolver::new(&opts)?;
        let verifier = LivenessVerifier::new(fetch.clone(), &opts);
        let render_config = RenderConfig {
            proxy: opts.proxy.clone(),
            ..RenderConfig::default()
        };
        Ok(Self {
            site,
            patterns,
            opts,
            fetch,
            resolver,
            verifier,
            render_config,
        })
    }

    pub fn with_render_config(mut self, render_config: RenderConfig) -> Self {
        self.render_config = render_config;
        self
    }
}

impl<V: ProbeLiveness> Collector<V> {
    /// Swap the verifier; the seam the scenario tests use.
    pub fn with_verifier<W: ProbeLiveness>(self, verifier: W) -> Collector<W> {
        Collector {
            site: self.site,
            patterns: self.patterns,
            opts: self.opts,
            fetch: self.fetch,
            resolver: self.resolver,
            verifier,
            render_config: self.render_config,
        }
    }

    /// Collect up to `want` fresh, verified URLs for this site. Returns
    /// an empty batch when the minimum acceptable count was not reached
    /// before the deadline - a normal outcome, not an error.
    pub async fn collect_fresh_urls(&self, already_seen: &HashSet<String>) -> Vec<String> {
        let deadline = Deadline::after_secs(self.opts.deadline_sec);
        let mut selector = StrategySelector::for_site(
            &self.site,
            &self.patterns,
            &self.opts,
            self.fetch.clone(),
            self.render_config.clone(),
        );
        let candidates = selector.select(&deadline).await;
        self.finish(candidates, already_seen, &deadline).await
    }

    /// Variant with an explicit strategy chain; used by tests and by
    /// callers that already hold candidates from elsewhere.
    pub async fn collect_with_strategies(
        &self,
        strategies: Vec<Box<dyn SourceStrategy>>,
        already_seen: &HashSet<String>,
    ) -> Vec<String> {
        let deadline = Deadline::after_secs(self.opts.deadline_sec);
        let candidates = StrategySelector::new(strategies).select(&deadline).await;
        self.finish(candidates, already_seen, &deadline).await
    }

    async fn finish(
        &self,
        mut candidates: Vec<Candidate>,
        already_seen: &HashSet<String>,
        deadline: &Deadline,
    ) -> Vec<String> {
        // Acceptance must follow discovery order (lower = newer)
        candidates.sort_by_key(|c| c.order);
        let origin = candidates.first().map(|c| c.origin);
        info!(
            candidates = candidates.len(),
            origin = ?origin,
            "strategy selection done"
        );

        let selection = SelectionLoop {
            site: &self.site,
            patterns: &self.patterns,
            opts: &self.opts,
            resolver: &self.resolver,
            verifier: &self.verifier,
            already_seen,
        };
        let batch = selection.select(candidates, deadline).await;

        // Below the minimum the batch reads as "nothing to do"; a
        // short batch must never leak downstream.
        if batch.len() < self.opts.min_accept {
            info!(
                collected = batch.len(),
                min = self.opts.min_accept,
                "below minimum acceptable count; returning empty batch"
            );
            return Vec::new();
        }
        batch
    }
}

/// One-shot convenience wrapper around [`Collector`].
pub async fn collect_fresh_urls(
    site: &SiteConfig,
    already_seen: &HashSet<String>,
    opts: &CollectOptions,
) -> Result<Vec<String>, HarvestError> {
    let collector = Collector::new(site.clone(), opts.clone())?;
    Ok(collector.collect_fresh_urls(already_seen).await)
}
