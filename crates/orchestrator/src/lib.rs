//! Datagate Orchestrator
//!
//! Fetches a data item from an ordered set of interchangeable sources and
//! returns the first valid answer, shielding callers from slow or failing
//! providers.
//!
//! # Overview
//!
//! - Per-category source lists ordered by priority
//! - Shared TTL cache with jitter and negative entries for failed lookups
//! - Circuit breaking on consecutive failures, with half-open trials
//! - Rolling failure-rate health skips
//! - Pluggable payload validation per category
//! - Sequential failover or a bounded race across sources
//! - Overall deadlines and cooperative cancellation
//!
//! # Flow
//!
//! ```text
//! FetchRequest
//!      |
//!      v
//! +-----------+  hit / negative hit
//! | DataCache | --------------------------> FetchResult (cached)
//! +-----------+
//!      | miss
//!      v
//! +----------------+   for each source in priority order
//! | SourceRegistry | ----------------------------------+
//! +----------------+                                   |
//!                                                      v
//!                       CircuitBreaker -> HealthScorer -> Fetcher -> Validator
//!                                                      |
//!                              first valid payload     v
//!                              written to the cache -> FetchResult
//! ```
//!
//! # Core Types
//!
//! - [`FetchOrchestrator`] - Entry point tying everything together
//! - [`DataSource`] / [`Fetcher`] - A named provider for one category
//! - [`FetchRequest`] / [`FetchResult`] - Input and outcome of a fetch
//! - [`FetchConfig`] - Every tunable, loadable from JSON and the environment
//! - [`FetchError`] - Failure kinds shared by fetchers and the orchestrator

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod source;

// Re-export the types most callers need
pub use cache::{CacheConfig, CacheLookup, CacheStats, DataCache, SweeperHandle};
pub use config::FetchConfig;
pub use diagnostics::{CacheDiagnostics, Diagnostics, SourceDiagnostics};
pub use errors::{ConfigError, FetchError, RetryClass};
pub use models::{
    AttemptOutcome, AttemptRecord, CacheKey, CacheMode, Category, FetchRequest, FetchResult,
    FetchTrace, Payload, SourceKey, SourceName,
};
pub use orchestrator::{FetchMode, FetchOrchestrator, FetchOrchestratorBuilder, OrchestratorOptions};
pub use registry::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, HealthConfig, HealthScorer,
    PayloadCheck, SourceRegistry, ValidationContext, ValidationIssue, ValidationResult,
    Validator,
};
pub use source::{DataSource, Fetcher, FnFetcher};
