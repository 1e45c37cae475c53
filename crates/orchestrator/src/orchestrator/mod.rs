//! The fetch orchestrator.
//!
//! Ties the cache, registry, circuit breaker, health scorer and validator
//! together into a single `fetch` call that always returns a `FetchResult`.

mod attempt;
mod fetch_orchestrator;
mod options;

pub use fetch_orchestrator::{FetchOrchestrator, FetchOrchestratorBuilder};
pub use options::{FetchMode, OrchestratorOptions, DEFAULT_FETCH_TIMEOUT};
