//! Orchestrator behaviour switches.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::SourceName;

/// Default per-source fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How candidate sources are called.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchMode {
    /// One source at a time, in order. (Default)
    #[default]
    Sequential,
    /// Up to `width` eligible sources in flight at once; the first valid
    /// payload wins.
    Race { width: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorOptions {
    /// Timeout for sources with no override and no timeout of their own.
    pub default_fetch_timeout: Duration,
    /// Per-source timeout overrides, by source name.
    pub fetch_timeout_by_source: HashMap<SourceName, Duration>,
    /// Store exhausted fetches as negative cache entries.
    pub negative_cache_enabled: bool,
    pub mode: FetchMode,
    /// Try sources with fewer consecutive failures first.
    pub adaptive_ordering: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            default_fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            fetch_timeout_by_source: HashMap::new(),
            negative_cache_enabled: true,
            mode: FetchMode::Sequential,
            adaptive_ordering: false,
        }
    }
}
