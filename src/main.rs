//! linkharvest - deadline-bounded discovery of freshly posted links.
//!
//! Discovers candidate links on third-party listing sites, resolves
//! redirects, verifies liveness and returns a deduplicated batch under
//! a single wall-clock deadline.

mod cli;
mod config;
mod error;
mod models;
mod pipeline;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "linkharvest=info"
    } else {
        "linkharvest=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
