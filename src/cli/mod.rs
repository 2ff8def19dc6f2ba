//! Command line interface.

mod state;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::models::normalize_url;
use crate::pipeline::{Collector, Deadline, FetchExecutor, LivenessVerifier, ProbeLiveness};

use state::{RunState, DEFAULT_RECENT_WINDOW_HOURS};

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Deadline-bounded discovery of freshly posted links")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "harvest.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one configured site and print the batch
    Collect {
        /// Site name from the configuration file
        site: String,
        /// Quota of URLs for the batch
        #[arg(long, env = "WANT_POST")]
        want: Option<usize>,
        /// Minimum acceptable count; below this the batch is empty
        #[arg(long, env = "MIN_POST")]
        min: Option<usize>,
        /// Per-strategy listing page budget
        #[arg(long, env = "NUM_PAGES")]
        pages: Option<usize>,
        /// Wall-clock budget in seconds
        #[arg(long, env = "SCRAPE_TIMEOUT_SEC")]
        deadline_sec: Option<u64>,
        /// Run-state JSON file with previously used URLs
        #[arg(long)]
        state_file: Option<PathBuf>,
        /// Print the batch as a JSON array instead of one URL per line
        #[arg(long)]
        json: bool,
    },

    /// List configured sites
    Sites,

    /// Probe a single URL and print the liveness verdict
    Check {
        url: String,
        /// Probe timeout in seconds
        #[arg(long, default_value = "3")]
        timeout: u64,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            site,
            want,
            min,
            pages,
            deadline_sec,
            state_file,
            json,
        } => {
            let config = Config::load(&cli.config)?;
            let site_config = config.site(&site)?.clone();

            let mut opts = config.collect.clone();
            if let Some(want) = want {
                opts.want = want;
            }
            if let Some(min) = min {
                opts.min_accept = min;
            }
            if let Some(pages) = pages {
                opts.num_pages = pages;
            }
            if let Some(deadline_sec) = deadline_sec {
                opts.deadline_sec = Some(deadline_sec);
            }

            let already_seen = match state_file {
                Some(ref path) => {
                    RunState::load(path).already_seen(DEFAULT_RECENT_WINDOW_HOURS)
                }
                None => Default::default(),
            };

            let collector = Collector::new(site_config, opts)
                .context("failed to construct pipeline")?;
            let batch = collector.collect_fresh_urls(&already_seen).await;

            if json {
                println!("{}", serde_json::to_string(&batch)?);
            } else {
                for url in &batch {
                    println!("{url}");
                }
            }
            if batch.is_empty() {
                // Normal outcome: the caller skips publishing this run
                tracing::info!(site = %site, "no batch this run");
            }
            Ok(())
        }

        Commands::Sites => {
            let config = Config::load(&cli.config)?;
            let mut names: Vec<_> = config.sites.keys().collect();
            names.sort();
            for name in names {
                let site = &config.sites[name];
                let strategies: Vec<String> =
                    site.strategies.iter().map(|s| s.to_string()).collect();
                println!("{name}\t{}\t[{}]", site.base_origin, strategies.join(", "));
            }
            Ok(())
        }

        Commands::Check { url, timeout } => {
            let opts = crate::config::CollectOptions {
                probe_timeout_sec: timeout,
                ..Default::default()
            };
            let fetch = FetchExecutor::new(&opts)?;
            let verifier = LivenessVerifier::new(fetch, &opts);
            let url = normalize_url(&url);
            let verdict = verifier.verify(&url, &Deadline::unbounded()).await;
            println!("{url}\t{verdict}");
            Ok(())
        }
    }
}
