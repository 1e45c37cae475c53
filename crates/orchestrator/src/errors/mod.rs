//! Error types and retry classification for the fetch orchestrator.
//!
//! This module provides:
//! - [`FetchError`]: The error enum for every fetch-related failure
//! - [`RetryClass`]: Classification for determining fallback behavior
//! - [`ConfigError`]: Errors raised while loading or validating configuration

mod retry;

pub use retry::RetryClass;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while fetching a data item.
///
/// Single-source failures are absorbed by the orchestrator and recorded in the
/// attempt trace. Only the terminal variants ever reach the caller, and even
/// then only inside a [`FetchResult`](crate::models::FetchResult).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The provider failed for a network or service reason.
    #[error("Transient provider error: {provider} - {message}")]
    Transient {
        /// The source that failed
        provider: String,
        /// Description of the failure
        message: String,
    },

    /// The fetch did not complete within the per-source timeout.
    #[error("Timeout: {provider} after {after:?}")]
    Timeout {
        /// The source that timed out
        provider: String,
        /// The timeout that elapsed
        after: Duration,
    },

    /// The provider rejected the call because of its own rate limits.
    #[error("Rate limited: {provider}")]
    RateLimited {
        /// The source that rate limited the request
        provider: String,
    },

    /// The provider answered with something that could not be decoded.
    #[error("Invalid payload from {provider}: {message}")]
    InvalidPayload {
        /// The source that returned the payload
        provider: String,
        /// Why the payload was unusable
        message: String,
    },

    /// The payload decoded fine but failed a validator check.
    #[error("Validation failed for {provider}: {}", .issues.join("; "))]
    ValidationFailed {
        /// The source that returned the payload
        provider: String,
        /// Hard validation issues
        issues: Vec<String>,
    },

    /// The source's circuit is open.
    #[error("Circuit open: {provider}")]
    CircuitOpen {
        /// The source with an open circuit
        provider: String,
    },

    /// The source is in a health-based cooldown.
    #[error("Source unhealthy: {provider}")]
    Unhealthy {
        /// The skipped source
        provider: String,
    },

    /// Every source for the category failed or was skipped.
    #[error("all sources exhausted")]
    AllSourcesExhausted {
        /// Requested category
        category: String,
        /// Requested key
        key: String,
        /// Number of sources that appear in the trace
        attempted: usize,
    },

    /// A recent request for the same key exhausted all sources and the
    /// failure is still negatively cached.
    #[error("cached failure")]
    CachedFailure {
        /// Requested category
        category: String,
        /// Requested key
        key: String,
        /// Reason recorded with the negative entry
        reason: String,
    },

    /// No source is registered for the category.
    #[error("No sources registered for category '{category}'")]
    NoSourcesRegistered {
        /// Requested category
        category: String,
    },

    /// The caller's overall deadline elapsed before a source succeeded.
    #[error("Deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// The caller cancelled the request.
    #[error("Fetch cancelled")]
    Cancelled,

    /// A source with the same `(category, name)` is already registered.
    #[error("Source already registered: {category}/{name}")]
    DuplicateSource {
        /// Category of the duplicate
        category: String,
        /// Name of the duplicate
        name: String,
    },

    /// No source with this `(category, name)` is registered.
    #[error("Unknown source: {category}/{name}")]
    UnknownSource {
        /// Category looked up
        category: String,
        /// Name looked up
        name: String,
    },
}

impl FetchError {
    /// Convenience constructor for the most common fetcher failure.
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use datagate_orchestrator::errors::{FetchError, RetryClass};
    ///
    /// let error = FetchError::RateLimited { provider: "alpha".to_string() };
    /// assert_eq!(error.retry_class(), RetryClass::FailoverWithPenalty);
    ///
    /// let error = FetchError::Cancelled;
    /// assert_eq!(error.retry_class(), RetryClass::Never);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transient { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::InvalidPayload { .. }
            | Self::ValidationFailed { .. } => RetryClass::FailoverWithPenalty,

            Self::CircuitOpen { .. } | Self::Unhealthy { .. } => RetryClass::NextSource,

            Self::AllSourcesExhausted { .. }
            | Self::CachedFailure { .. }
            | Self::NoSourcesRegistered { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Cancelled
            | Self::DuplicateSource { .. }
            | Self::UnknownSource { .. } => RetryClass::Never,
        }
    }
}

/// Errors raised while loading or validating a [`FetchConfig`](crate::config::FetchConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override had an unusable value.
    #[error("Invalid value for {var}: {message}")]
    Env {
        /// Environment variable name
        var: String,
        /// What was wrong with it
        message: String,
    },

    /// A value is outside its allowed range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_failures_penalize() {
        let errors = [
            FetchError::transient("A", "connection reset"),
            FetchError::Timeout {
                provider: "A".to_string(),
                after: Duration::from_secs(5),
            },
            FetchError::RateLimited {
                provider: "A".to_string(),
            },
            FetchError::InvalidPayload {
                provider: "A".to_string(),
                message: "not json".to_string(),
            },
            FetchError::ValidationFailed {
                provider: "A".to_string(),
                issues: vec!["price <= 0".to_string()],
            },
        ];

        for error in errors {
            assert_eq!(error.retry_class(), RetryClass::FailoverWithPenalty);
            assert!(error.retry_class().penalizes());
        }
    }

    #[test]
    fn test_skips_do_not_penalize() {
        let error = FetchError::CircuitOpen {
            provider: "A".to_string(),
        };
        assert_eq!(error.retry_class(), RetryClass::NextSource);
        assert!(!error.retry_class().penalizes());
    }

    #[test]
    fn test_terminal_errors_never_retry() {
        let error = FetchError::AllSourcesExhausted {
            category: "price".to_string(),
            key: "X".to_string(),
            attempted: 3,
        };
        assert_eq!(error.retry_class(), RetryClass::Never);
        assert!(!FetchError::Cancelled.retry_class().penalizes());
    }

    #[test]
    fn test_error_display() {
        let error = FetchError::AllSourcesExhausted {
            category: "price".to_string(),
            key: "X".to_string(),
            attempted: 2,
        };
        assert_eq!(format!("{}", error), "all sources exhausted");

        let error = FetchError::CachedFailure {
            category: "price".to_string(),
            key: "X".to_string(),
            reason: "all sources exhausted".to_string(),
        };
        assert_eq!(format!("{}", error), "cached failure");

        let error = FetchError::ValidationFailed {
            provider: "B".to_string(),
            issues: vec!["missing price".to_string(), "negative volume".to_string()],
        };
        assert_eq!(
            format!("{}", error),
            "Validation failed for B: missing price; negative volume"
        );
    }
}
