//! Point-in-time operational snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::cache::{CacheStats, DataCache};
use crate::models::SourceKey;
use crate::registry::{CircuitBreaker, CircuitState, HealthScorer, SourceRegistry};

#[derive(Clone, Debug, Serialize)]
pub struct CacheDiagnostics {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
}

/// One row per registered source, in fetch order within each category.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct SourceDiagnostics {
    pub category: String,
    pub name: String,
    pub priority: i32,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub calls: usize,
    pub failures: usize,
    pub fail_rate: f64,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub skip_remaining: Option<Duration>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    pub generated_at: DateTime<Utc>,
    pub cache: CacheDiagnostics,
    pub sources: Vec<SourceDiagnostics>,
}

impl Diagnostics {
    pub fn collect(
        registry: &SourceRegistry,
        cache: &DataCache,
        circuit_breaker: &CircuitBreaker,
        health: &HealthScorer,
    ) -> Self {
        let stats = cache.stats();
        let sources = registry
            .summaries()
            .into_iter()
            .map(|summary| {
                let key = SourceKey::new(summary.category.clone(), summary.name.clone());
                let snapshot = health.snapshot(&key);
                SourceDiagnostics {
                    circuit_state: circuit_breaker.state(&key),
                    consecutive_failures: circuit_breaker.consecutive_failures(&key),
                    calls: snapshot.calls,
                    failures: snapshot.failures,
                    fail_rate: snapshot.fail_rate,
                    skip_remaining: snapshot.skip_remaining,
                    category: summary.category,
                    name: summary.name,
                    priority: summary.priority,
                }
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            cache: CacheDiagnostics {
                hit_rate: stats.hit_rate(),
                stats,
            },
            sources,
        }
    }

    pub fn source(&self, category: &str, name: &str) -> Option<&SourceDiagnostics> {
        self.sources
            .iter()
            .find(|s| s.category == category && s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::errors::FetchError;
    use crate::models::{CacheKey, Payload};
    use crate::source::{DataSource, FnFetcher};

    fn registry() -> SourceRegistry {
        let registry = SourceRegistry::new();
        for (name, priority) in [("A", 10), ("B", 20)] {
            let fetcher =
                FnFetcher::new(|_key: String| async move { Ok::<Payload, FetchError>(json!(1)) });
            registry
                .register(DataSource::new(name, "price", Arc::new(fetcher)).with_priority(priority))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_collect_merges_state() {
        let registry = registry();
        let cache = DataCache::new();
        let circuit_breaker = CircuitBreaker::new();
        let health = HealthScorer::new();

        let a = SourceKey::new("price", "A");
        for _ in 0..3 {
            circuit_breaker.record_failure(&a);
            health.record(&a, false);
        }
        cache.set(CacheKey::new("price", "AAPL"), json!({"price": 1.0}), None, None);
        cache.get(&CacheKey::new("price", "AAPL"));
        cache.get(&CacheKey::new("price", "MSFT"));

        let diagnostics = Diagnostics::collect(&registry, &cache, &circuit_breaker, &health);

        assert_eq!(diagnostics.sources.len(), 2);
        let a = diagnostics.source("price", "A").unwrap();
        assert_eq!(a.circuit_state, CircuitState::Open);
        assert_eq!(a.consecutive_failures, 3);
        assert_eq!(a.calls, 3);
        assert!(a.skip_remaining.is_some());

        let b = diagnostics.source("price", "B").unwrap();
        assert_eq!(b.circuit_state, CircuitState::Closed);
        assert_eq!(b.calls, 0);

        assert_eq!(diagnostics.cache.stats.hits, 1);
        assert_eq!(diagnostics.cache.stats.misses, 1);
        assert!((diagnostics.cache.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serializes_flat_cache_stats() {
        let registry = registry();
        let diagnostics = Diagnostics::collect(
            &registry,
            &DataCache::new(),
            &CircuitBreaker::new(),
            &HealthScorer::new(),
        );

        let value = serde_json::to_value(&diagnostics).unwrap();
        assert_eq!(value["cache"]["hits"], 0);
        assert_eq!(value["cache"]["hit_rate"], 0.0);
        assert_eq!(value["sources"][0]["circuit_state"], "closed");
        assert!(value["sources"][0]["skip_remaining"].is_null());
    }
}
