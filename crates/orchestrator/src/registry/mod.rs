//! Source catalogue and the per-source guards consulted before every call.
//!
//! This module contains:
//! - `SourceRegistry`: ordered sources per category
//! - `CircuitBreaker`: consecutive-failure isolation with lazy recovery
//! - `HealthScorer`: rolling failure-rate skips
//! - `Validator`: pluggable per-category payload checks

mod circuit_breaker;
mod health;
mod source_registry;
mod validator;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use health::{
    HealthConfig, HealthScorer, HealthSnapshot, DEFAULT_FAIL_THRESHOLD, DEFAULT_HEALTH_WINDOW,
    DEFAULT_MIN_CALLS, DEFAULT_SKIP_DURATION,
};
pub use source_registry::{RegisteredSource, SourceRegistry, SourceSummary};
pub use validator::{
    lookup, CrossFieldConsistency, NonEmptyCollection, NumericPlausibility, PayloadCheck,
    RequiredFields, ValidationContext, ValidationIssue, ValidationResult, ValidationSeverity,
    Validator,
};
