//! CLI configuration: orchestrator settings plus the source list.
//!
//! ```json
//! {
//!   "failure_threshold": 3,
//!   "cache_ttl_by_category": { "price": 30 },
//!   "sources": [
//!     { "name": "primary", "category": "price", "priority": 1, "timeout": 2.5,
//!       "kind": "http", "url": "https://api.example.com/quote?symbol={key}",
//!       "headers": { "X-Api-Key": "..." } },
//!     { "name": "fixtures", "category": "price", "priority": 9,
//!       "kind": "file", "dir": "./fixtures" }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use datagate_orchestrator::{DataSource, FetchConfig, Fetcher, SourceRegistry};
use reqwest::Client;
use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::fetchers::{FileFetcher, HttpJsonFetcher};

/// Environment variable pointing at the config file.
pub const CONFIG_PATH_VAR: &str = "DATAGATE_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    File {
        dir: PathBuf,
    },
}

impl CliConfig {
    /// Load from `path`, else from `$DATAGATE_CONFIG`, else defaults with no
    /// sources. `DATAGATE_*` overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.fetch.apply_env_overrides()?;
        config.fetch.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.fetch.validate()?;
        Ok(config)
    }

    /// Build a registry with one live fetcher per source entry.
    pub fn build_registry(&self, client: &Client) -> Result<SourceRegistry> {
        let registry = SourceRegistry::new();
        for entry in &self.sources {
            registry
                .register(entry.to_source(client))
                .with_context(|| format!("Cannot register source '{}'", entry.name))?;
        }
        Ok(registry)
    }
}

impl SourceEntry {
    fn to_source(&self, client: &Client) -> DataSource {
        let fetcher: Arc<dyn Fetcher> = match &self.kind {
            SourceKind::Http { url, headers } => Arc::new(HttpJsonFetcher::new(
                self.name.clone(),
                client.clone(),
                url.clone(),
                headers.clone(),
            )),
            SourceKind::File { dir } => Arc::new(FileFetcher::new(self.name.clone(), dir.clone())),
        };

        let mut source = DataSource::new(self.name.clone(), self.category.clone(), fetcher);
        if let Some(priority) = self.priority {
            source = source.with_priority(priority);
        }
        if let Some(timeout) = self.timeout {
            source = source.with_timeout(timeout);
        }
        source
    }
}
