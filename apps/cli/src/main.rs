//! datagate CLI: fetch data items through the orchestrator.
//!
//! Commands:
//! - `fetch` - fetch one key, optionally repeatedly, and print the results
//! - `sources` - list the configured sources in fetch order
//! - `config` - print the effective orchestrator settings

mod config;
mod fetchers;
mod main_lib;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use datagate_orchestrator::{CacheMode, FetchOrchestrator, FetchRequest, FetchResult};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use config::CliConfig;
use main_lib::{build_orchestrator, init_tracing};

#[derive(Parser)]
#[command(
    name = "datagate",
    about = "Fetch data items from redundant sources with caching and failover"
)]
struct Cli {
    /// Path to a JSON config file. Defaults to $DATAGATE_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one key from a category.
    Fetch {
        /// Data category (e.g., price, news).
        category: String,

        /// Item key (e.g., AAPL).
        key: String,

        /// Overall deadline in seconds across all sources.
        #[arg(long)]
        deadline: Option<f64>,

        /// Skip the cache read but store the fresh result.
        #[arg(long, default_value_t = false, conflicts_with = "bypass")]
        refresh: bool,

        /// Neither read nor write the cache.
        #[arg(long, default_value_t = false)]
        bypass: bool,

        /// Number of fetches to run back to back.
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Print cache, circuit and health diagnostics afterwards.
        #[arg(long, default_value_t = false)]
        diagnostics: bool,
    },
    /// List configured sources in fetch order.
    Sources,
    /// Print the effective settings after file and environment overrides.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch {
            category,
            key,
            deadline,
            refresh,
            bypass,
            repeat,
            diagnostics,
        } => {
            let cache_mode = if bypass {
                CacheMode::Bypass
            } else if refresh {
                CacheMode::Refresh
            } else {
                CacheMode::Use
            };
            let mut request = FetchRequest::new(category, key).with_cache_mode(cache_mode);
            if let Some(secs) = deadline {
                request = request.with_deadline(Duration::try_from_secs_f64(secs)?);
            }

            let orchestrator = build_orchestrator(&config)?;
            let last = run_fetches(&orchestrator, request, repeat.max(1)).await?;

            if diagnostics {
                print_json(&orchestrator.diagnostics())?;
            }
            if let Some(error) = last.error() {
                bail!("Fetch failed: {}", error);
            }
        }
        Commands::Sources => {
            let orchestrator = build_orchestrator(&config)?;
            print_json(&orchestrator.registry().summaries())?;
        }
        Commands::Config => {
            print_json(&config.fetch)?;
        }
    }

    Ok(())
}

/// Run `repeat` fetches, printing each result. Ctrl-C abandons the one in
/// flight and stops.
async fn run_fetches(
    orchestrator: &FetchOrchestrator,
    request: FetchRequest,
    repeat: u32,
) -> Result<FetchResult> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling fetch");
            on_interrupt.cancel();
        }
    });

    let mut last = None;
    for run in 1..=repeat {
        let result = orchestrator
            .fetch_with_cancel(request.clone(), cancel.clone())
            .await;
        tracing::info!(
            "Run {}/{}: success={} cached={} source={:?} in {:?}",
            run,
            repeat,
            result.success(),
            result.cached(),
            result.source(),
            result.duration()
        );
        print_json(&result)?;
        last = Some(result);
        if cancel.is_cancelled() {
            break;
        }
    }

    match last {
        Some(result) => Ok(result),
        None => bail!("No fetch was run"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
