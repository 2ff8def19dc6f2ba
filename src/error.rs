//! Error taxonomy for the harvest pipeline.
//!
//! Only failures that abort a whole stage live here. A candidate that
//! cannot be resolved or probes dead/unknown is a domain value
//! (`Option` / `Verdict`), not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Network or timeout failure after the retry budget is exhausted.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Browser session failure. Rendering is not retried within a run.
    #[error("render failed: {0}")]
    Render(String),

    /// A site pattern in configuration does not compile.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Unrecoverable configuration problem. Fatal at the orchestrator
    /// boundary; everything else is skipped and logged.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run deadline passed before the stage could start.
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}
