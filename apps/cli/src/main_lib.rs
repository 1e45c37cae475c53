use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use datagate_orchestrator::FetchOrchestrator;
use reqwest::Client;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::CliConfig;

/// Log output goes to stderr so stdout stays parseable JSON.
pub fn init_tracing() {
    let log_format = std::env::var("DATAGATE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

pub fn build_orchestrator(config: &CliConfig) -> Result<FetchOrchestrator> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    let registry = config.build_registry(&client)?;
    tracing::info!(
        "Registered {} sources across {} categories",
        registry.len(),
        registry.categories().len()
    );

    Ok(FetchOrchestrator::from_config(&config.fetch, Arc::new(registry))?)
}
