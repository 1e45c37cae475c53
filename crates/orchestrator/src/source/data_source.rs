//! Registered data source definition.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::Fetcher;
use crate::models::{Category, SourceKey, SourceName};

/// Default priority for sources that don't declare one. Lower is preferred.
pub const DEFAULT_PRIORITY: i32 = 10;

/// One concrete provider registered for one category.
///
/// Identity is `(category, name)` and never changes after construction.
/// Circuit and health state live in their own components, keyed by
/// [`SourceKey`].
#[derive(Clone)]
pub struct DataSource {
    name: SourceName,
    category: Category,
    priority: i32,
    fetcher: Arc<dyn Fetcher>,
    timeout: Option<Duration>,
}

impl DataSource {
    pub fn new(
        name: impl Into<SourceName>,
        category: impl Into<Category>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            priority: DEFAULT_PRIORITY,
            fetcher,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Per-source timeout. Overridden by `fetch_timeout_by_source` in config.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &SourceName {
        &self.name
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    /// Priority declared at registration.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.category.clone(), self.name.clone())
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
