//! Fetch request model.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{CacheKey, Category};

/// Defines how a single fetch interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read from the cache if a live entry is present; otherwise fetch and
    /// write the result. (Default)
    #[default]
    Use,
    /// Skip the cache read but write the fresh result.
    Refresh,
    /// Neither read nor write the cache, including negative entries.
    Bypass,
}

impl CacheMode {
    pub fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub fn writes(self) -> bool {
        !matches!(self, Self::Bypass)
    }
}

/// A request for one data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub category: Category,
    pub key: String,
    /// Overall deadline for the whole fallback chain.
    pub deadline: Option<Duration>,
    pub cache_mode: CacheMode,
}

impl FetchRequest {
    pub fn new(category: impl Into<Category>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
            deadline: None,
            cache_mode: CacheMode::Use,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.category.clone(), self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mode_default() {
        let mode: CacheMode = Default::default();
        assert_eq!(mode, CacheMode::Use);
        assert!(mode.reads() && mode.writes());
        assert!(!CacheMode::Refresh.reads() && CacheMode::Refresh.writes());
        assert!(!CacheMode::Bypass.reads() && !CacheMode::Bypass.writes());
    }

    #[test]
    fn test_request_builder() {
        let request = FetchRequest::new("price", "AAPL")
            .with_deadline(Duration::from_secs(2))
            .with_cache_mode(CacheMode::Refresh);

        assert_eq!(request.deadline, Some(Duration::from_secs(2)));
        assert_eq!(request.cache_mode, CacheMode::Refresh);
        assert_eq!(request.cache_key(), CacheKey::new("price", "AAPL"));
    }
}
