//! Catalogue of data sources per category.
//!
//! The registry only answers "which sources, in which order". Circuit and
//! health state are tracked elsewhere and never stored here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{info, warn};

use crate::errors::FetchError;
use crate::models::Category;
use crate::source::DataSource;

#[derive(Clone, Debug)]
struct Registration {
    source: Arc<DataSource>,
    /// Effective priority. Starts at the source's declared priority.
    priority: i32,
    /// Registration order, used to break priority ties.
    sequence: u64,
}

/// A source as returned by [`SourceRegistry::sources_for`].
#[derive(Clone, Debug)]
pub struct RegisteredSource {
    pub source: Arc<DataSource>,
    /// Effective priority, which may differ from the declared one after
    /// [`SourceRegistry::set_priority`].
    pub priority: i32,
}

/// Summary row used by diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SourceSummary {
    pub category: String,
    pub name: String,
    pub priority: i32,
}

/// Ordered catalogue of sources, keyed by category.
///
/// Sources are kept sorted by `(priority, registration order)` so lookups
/// are a clone of an already-ordered list.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    categories: RwLock<HashMap<Category, Vec<Registration>>>,
    next_sequence: AtomicU64,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its own category.
    ///
    /// Fails with [`FetchError::DuplicateSource`] if a source with the same
    /// name is already registered for that category.
    pub fn register(&self, source: DataSource) -> Result<(), FetchError> {
        let category = source.category().clone();
        let mut categories = self.write();
        let entries = categories.entry(category.clone()).or_default();

        if entries.iter().any(|r| r.source.name() == source.name()) {
            return Err(FetchError::DuplicateSource {
                category: category.to_string(),
                name: source.name().to_string(),
            });
        }

        info!(
            "Registry: registered source '{}' for '{}' (priority {})",
            source.name(),
            category,
            source.priority()
        );
        entries.push(Registration {
            priority: source.priority(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            source: Arc::new(source),
        });
        sort_entries(entries);
        Ok(())
    }

    /// Sources for a category, by ascending priority then registration order.
    ///
    /// Empty when nothing is registered for the category.
    pub fn sources_for(&self, category: &str) -> Vec<RegisteredSource> {
        self.read()
            .get(category)
            .map(|entries| {
                entries
                    .iter()
                    .map(|r| RegisteredSource {
                        source: Arc::clone(&r.source),
                        priority: r.priority,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, category: &str, name: &str) -> Option<RegisteredSource> {
        self.read().get(category).and_then(|entries| {
            entries
                .iter()
                .find(|r| r.source.name() == name)
                .map(|r| RegisteredSource {
                    source: Arc::clone(&r.source),
                    priority: r.priority,
                })
        })
    }

    /// Change a source's priority at runtime.
    pub fn set_priority(
        &self,
        category: &str,
        name: &str,
        priority: i32,
    ) -> Result<(), FetchError> {
        let mut categories = self.write();
        let entries = categories
            .get_mut(category)
            .ok_or_else(|| unknown(category, name))?;
        let entry = entries
            .iter_mut()
            .find(|r| r.source.name() == name)
            .ok_or_else(|| unknown(category, name))?;

        info!(
            "Registry: priority of '{}/{}' changed {} -> {}",
            category, name, entry.priority, priority
        );
        entry.priority = priority;
        sort_entries(entries);
        Ok(())
    }

    /// Remove a source. Returns the removed definition.
    pub fn remove(&self, category: &str, name: &str) -> Result<Arc<DataSource>, FetchError> {
        let mut categories = self.write();
        let entries = categories
            .get_mut(category)
            .ok_or_else(|| unknown(category, name))?;
        let index = entries
            .iter()
            .position(|r| r.source.name() == name)
            .ok_or_else(|| unknown(category, name))?;

        let removed = entries.remove(index);
        if entries.is_empty() {
            categories.remove(category);
        }
        info!("Registry: removed source '{}/{}'", category, name);
        Ok(removed.source)
    }

    /// Categories with at least one source, sorted.
    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> = self.read().keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Total number of registered sources.
    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every source, grouped by sorted category then in fetch order.
    pub fn summaries(&self) -> Vec<SourceSummary> {
        let categories = self.read();
        let mut names: Vec<&Category> = categories.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|category| {
                categories[category].iter().map(move |r| SourceSummary {
                    category: category.to_string(),
                    name: r.source.name().to_string(),
                    priority: r.priority,
                })
            })
            .collect()
    }

    /// Acquire a read lock, recovering from poison if necessary.
    ///
    /// The registry never leaves a half-applied update behind a panic, so
    /// the poisoned data is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Category, Vec<Registration>>> {
        self.categories.read().unwrap_or_else(|poisoned| {
            warn!("Source registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Acquire a write lock, recovering from poison if necessary.
    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Category, Vec<Registration>>> {
        self.categories.write().unwrap_or_else(|poisoned| {
            warn!("Source registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn sort_entries(entries: &mut [Registration]) {
    entries.sort_by_key(|r| (r.priority, r.sequence));
}

fn unknown(category: &str, name: &str) -> FetchError {
    FetchError::UnknownSource {
        category: category.to_string(),
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::models::Payload;
    use crate::source::FnFetcher;

    fn source(name: &'static str, category: &'static str, priority: i32) -> DataSource {
        let fetcher =
            FnFetcher::new(|_key: String| async move { Ok::<Payload, FetchError>(json!(1)) });
        DataSource::new(name, category, Arc::new(fetcher)).with_priority(priority)
    }

    fn names(registry: &SourceRegistry, category: &str) -> Vec<String> {
        registry
            .sources_for(category)
            .iter()
            .map(|r| r.source.name().to_string())
            .collect()
    }

    #[test]
    fn test_sources_ordered_by_priority() {
        let registry = SourceRegistry::new();
        registry.register(source("C", "price", 30)).unwrap();
        registry.register(source("A", "price", 10)).unwrap();
        registry.register(source("B", "price", 20)).unwrap();

        assert_eq!(names(&registry, "price"), ["A", "B", "C"]);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let registry = SourceRegistry::new();
        registry.register(source("first", "news", 5)).unwrap();
        registry.register(source("second", "news", 5)).unwrap();
        registry.register(source("third", "news", 5)).unwrap();

        assert_eq!(names(&registry, "news"), ["first", "second", "third"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = SourceRegistry::new();
        registry.register(source("A", "price", 10)).unwrap();

        let err = registry.register(source("A", "price", 1)).unwrap_err();
        assert_eq!(
            err,
            FetchError::DuplicateSource {
                category: "price".to_string(),
                name: "A".to_string()
            }
        );
        // Same name in another category is a different source.
        registry.register(source("A", "news", 10)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_category_is_empty() {
        let registry = SourceRegistry::new();
        assert!(registry.sources_for("weather").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_priority_reorders() {
        let registry = SourceRegistry::new();
        registry.register(source("A", "price", 10)).unwrap();
        registry.register(source("B", "price", 20)).unwrap();

        registry.set_priority("price", "B", 1).unwrap();
        assert_eq!(names(&registry, "price"), ["B", "A"]);

        let b = registry.get("price", "B").unwrap();
        assert_eq!(b.priority, 1);
        // The declared priority on the definition is unchanged.
        assert_eq!(b.source.priority(), 20);

        assert!(matches!(
            registry.set_priority("price", "Z", 1),
            Err(FetchError::UnknownSource { .. })
        ));
    }

    #[test]
    fn test_remove() {
        let registry = SourceRegistry::new();
        registry.register(source("A", "price", 10)).unwrap();
        registry.register(source("B", "price", 20)).unwrap();

        let removed = registry.remove("price", "A").unwrap();
        assert_eq!(removed.name(), "A");
        assert_eq!(names(&registry, "price"), ["B"]);

        registry.remove("price", "B").unwrap();
        assert!(registry.categories().is_empty());
        assert!(registry.remove("price", "B").is_err());
    }

    #[test]
    fn test_categories_and_summaries() {
        let registry = SourceRegistry::new();
        registry.register(source("N", "news", 10)).unwrap();
        registry
            .register(source("P", "price", 10).with_timeout(Duration::from_secs(2)))
            .unwrap();

        assert_eq!(registry.categories(), ["news", "price"]);
        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].category, "news");
        assert_eq!(summaries[1].name, "P");
    }
}
