//! Per-source circuit breaker for fault tolerance.
//!
//! Implements the circuit breaker pattern to stop hammering a source that is
//! failing consistently. Each `(category, source)` pair has its own circuit:
//!
//! - **Closed**: Normal operation, calls are allowed.
//! - **Open**: Source is failing, calls are blocked until the recovery timeout.
//! - **HalfOpen**: A limited number of trial calls probe for recovery.
//!
//! The Open -> HalfOpen transition is lazy: it happens on the first
//! `can_call` after the recovery timeout, not on a timer. State is in-memory
//! and resets on restart. Nothing here returns an error; the breaker only
//! advises the orchestrator.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSecondsWithFrac};

use crate::models::{Category, SourceKey, SourceName};

/// Default number of consecutive failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default time to wait before transitioning from Open to HalfOpen.
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of successes needed to close the circuit from HalfOpen.
const DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD: u32 = 1;

/// Default number of concurrent trial calls allowed in HalfOpen.
const DEFAULT_HALF_OPEN_MAX_TRIALS: u32 = 1;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls are allowed.
    Closed,
    /// Source is failing - calls are blocked.
    Open,
    /// Testing recovery - limited trial calls allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Internal circuit state for a single source.
#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    /// Consecutive successes while HalfOpen.
    half_open_successes: u32,
    /// Trial permits handed out and not yet resolved.
    half_open_trials: u32,
    /// When the circuit last opened (drives the recovery timeout).
    opened_at: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_trials: 0,
            opened_at: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
        self.half_open_trials = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.half_open_trials = 0;
        self.opened_at = None;
    }
}

/// Circuit breaker configuration.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait before allowing a trial call.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub recovery_timeout: Duration,
    /// Successes needed to close from HalfOpen.
    pub half_open_success_threshold: u32,
    /// Trial calls allowed in flight while HalfOpen.
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_success_threshold: DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD,
            half_open_max_trials: DEFAULT_HALF_OPEN_MAX_TRIALS,
        }
    }
}

/// Per-source circuit breaker.
///
/// Circuits live in a sharded map so unrelated sources never contend on
/// the same lock. Configuration can be overridden per source name or per
/// category; a paid API can tolerate more failures than a scraper.
pub struct CircuitBreaker {
    circuits: DashMap<SourceKey, Circuit>,
    config: CircuitBreakerConfig,
    source_overrides: DashMap<SourceName, CircuitBreakerConfig>,
    category_overrides: DashMap<Category, CircuitBreakerConfig>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default settings.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
            source_overrides: DashMap::new(),
            category_overrides: DashMap::new(),
        }
    }

    /// Override the configuration for every source with this name.
    pub fn set_source_override(&self, name: impl Into<SourceName>, config: CircuitBreakerConfig) {
        self.source_overrides.insert(name.into(), config);
    }

    /// Override the configuration for every source of this category.
    pub fn set_category_override(
        &self,
        category: impl Into<Category>,
        config: CircuitBreakerConfig,
    ) {
        self.category_overrides.insert(category.into(), config);
    }

    /// Effective configuration for a source: source override, then category
    /// override, then the default.
    pub fn config_for(&self, source: &SourceKey) -> CircuitBreakerConfig {
        if let Some(config) = self.source_overrides.get(source.name.as_ref()) {
            return config.clone();
        }
        if let Some(config) = self.category_overrides.get(source.category.as_ref()) {
            return config.clone();
        }
        self.config.clone()
    }

    /// Check if a call is allowed for a source.
    ///
    /// Returns true if the circuit is Closed, or HalfOpen with a trial permit
    /// available (the permit is taken). Returns false while Open.
    ///
    /// Handles the lazy Open -> HalfOpen transition once the recovery timeout
    /// has elapsed. A caller that is granted a HalfOpen permit and then does
    /// not make the call must hand it back with [`release_trial`](Self::release_trial).
    pub fn can_call(&self, source: &SourceKey) -> bool {
        let config = self.config_for(source);
        let mut circuit = self
            .circuits
            .entry(source.clone())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => take_trial(&mut circuit, &config),
            CircuitState::Open => {
                let recovered = circuit
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    info!(
                        "Circuit breaker: transitioning '{}' from Open to HalfOpen",
                        source
                    );
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    circuit.half_open_trials = 0;
                    take_trial(&mut circuit, &config)
                } else {
                    false
                }
            }
        }
    }

    /// Return a HalfOpen trial permit that was not used.
    pub fn release_trial(&self, source: &SourceKey) {
        if let Some(mut circuit) = self.circuits.get_mut(source) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.half_open_trials = circuit.half_open_trials.saturating_sub(1);
            }
        }
    }

    /// Record a successful call for a source.
    ///
    /// In Closed state: resets the failure count.
    /// In HalfOpen state: counts toward closing the circuit.
    pub fn record_success(&self, source: &SourceKey) {
        let config = self.config_for(source);
        let mut circuit = self
            .circuits
            .entry(source.clone())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
                debug!("Circuit breaker: success for '{}', failure count reset", source);
            }
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                circuit.half_open_trials = circuit.half_open_trials.saturating_sub(1);
                debug!(
                    "Circuit breaker: success for '{}' in HalfOpen ({}/{})",
                    source, circuit.half_open_successes, config.half_open_success_threshold
                );

                if circuit.half_open_successes >= config.half_open_success_threshold {
                    info!(
                        "Circuit breaker: closing circuit for '{}' after {} successes",
                        source, circuit.half_open_successes
                    );
                    circuit.close();
                }
            }
            CircuitState::Open => {
                // A call that started before the circuit opened finished late.
                debug!(
                    "Circuit breaker: late success for '{}' while Open, ignored",
                    source
                );
            }
        }
    }

    /// Record a failed call for a source.
    ///
    /// Increments the consecutive failure count and may open the circuit.
    /// In HalfOpen state any failure reopens it with a fresh timer.
    pub fn record_failure(&self, source: &SourceKey) {
        let config = self.config_for(source);
        let mut circuit = self
            .circuits
            .entry(source.clone())
            .or_insert_with(Circuit::new);

        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= config.failure_threshold {
                    info!(
                        "Circuit breaker: opening circuit for '{}' after {} failures",
                        source, circuit.consecutive_failures
                    );
                    circuit.open();
                } else {
                    debug!(
                        "Circuit breaker: failure for '{}' ({}/{})",
                        source, circuit.consecutive_failures, config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                info!(
                    "Circuit breaker: reopening circuit for '{}' after failure in HalfOpen",
                    source
                );
                circuit.open();
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker: additional failure for '{}' (already open)",
                    source
                );
            }
        }
    }

    /// Get the current state for a source.
    ///
    /// Does not perform the lazy Open -> HalfOpen transition.
    pub fn state(&self, source: &SourceKey) -> CircuitState {
        self.circuits
            .get(source)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Get the consecutive failure count for a source.
    pub fn consecutive_failures(&self, source: &SourceKey) -> u32 {
        self.circuits
            .get(source)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    /// Reset one circuit, or every circuit when `source` is `None`.
    pub fn reset(&self, source: Option<&SourceKey>) {
        match source {
            Some(source) => {
                if let Some(mut circuit) = self.circuits.get_mut(source) {
                    info!("Circuit breaker: manually resetting circuit for '{}'", source);
                    circuit.close();
                }
            }
            None => {
                self.circuits.clear();
                info!("Circuit breaker: all circuits reset");
            }
        }
    }

    /// Get metrics for all tracked sources, sorted by source key.
    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        let mut metrics: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| CircuitMetrics {
                source: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                open_for: entry.opened_at.map(|at| at.elapsed()),
            })
            .collect();
        metrics.sort_by(|a, b| a.source.cmp(&b.source));
        metrics
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

fn take_trial(circuit: &mut Circuit, config: &CircuitBreakerConfig) -> bool {
    if circuit.half_open_trials < config.half_open_max_trials.max(1) {
        circuit.half_open_trials += 1;
        true
    } else {
        false
    }
}

/// Metrics for a single circuit.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct CircuitMetrics {
    pub source: SourceKey,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the circuit last opened.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub open_for: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(
        failure_threshold: u32,
        half_open_success_threshold: u32,
    ) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_millis(10),
            half_open_success_threshold,
            half_open_max_trials: 1,
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new();
        let source = SourceKey::new("price", "TEST_SOURCE");

        assert!(cb.can_call(&source));
        assert_eq!(cb.state(&source), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        let source = SourceKey::new("price", "FAILING");

        cb.record_failure(&source);
        cb.record_failure(&source);
        assert!(cb.can_call(&source));
        assert_eq!(cb.state(&source), CircuitState::Closed);

        cb.record_failure(&source);
        assert!(!cb.can_call(&source));
        assert_eq!(cb.state(&source), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new();
        let source = SourceKey::new("price", "INTERMITTENT");

        cb.record_failure(&source);
        cb.record_failure(&source);
        assert_eq!(cb.consecutive_failures(&source), 2);

        cb.record_success(&source);
        assert_eq!(cb.consecutive_failures(&source), 0);

        // Non-consecutive failures never trip the circuit.
        cb.record_failure(&source);
        cb.record_failure(&source);
        assert_eq!(cb.state(&source), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let cb = CircuitBreaker::with_config(fast_config(1, 1));
        let source = SourceKey::new("price", "RECOVERING");

        cb.record_failure(&source);
        assert!(!cb.can_call(&source));

        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.can_call(&source));
        assert_eq!(cb.state(&source), CircuitState::HalfOpen);
        // Second concurrent trial is refused while the first is in flight.
        assert!(!cb.can_call(&source));
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let cb = CircuitBreaker::with_config(fast_config(1, 1));
        let source = SourceKey::new("price", "HEALING");

        cb.record_failure(&source);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_call(&source));

        cb.record_success(&source);
        assert_eq!(cb.state(&source), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(&source), 0);
        assert!(cb.can_call(&source));
    }

    #[test]
    fn test_half_open_needs_configured_successes() {
        let cb = CircuitBreaker::with_config(fast_config(1, 2));
        let source = SourceKey::new("price", "SLOW_HEALER");

        cb.record_failure(&source);
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.can_call(&source));
        cb.record_success(&source);
        assert_eq!(cb.state(&source), CircuitState::HalfOpen);

        // The first trial resolved, so another permit is available.
        assert!(cb.can_call(&source));
        cb.record_success(&source);
        assert_eq!(cb.state(&source), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure_with_fresh_timer() {
        let cb = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(30),
            half_open_success_threshold: 1,
            half_open_max_trials: 1,
        });
        let source = SourceKey::new("price", "RELAPSING");

        cb.record_failure(&source);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_call(&source));
        assert_eq!(cb.state(&source), CircuitState::HalfOpen);

        cb.record_failure(&source);
        assert_eq!(cb.state(&source), CircuitState::Open);
        // The timer restarted, so the circuit stays blocked.
        assert!(!cb.can_call(&source));
    }

    #[test]
    fn test_release_trial_returns_permit() {
        let cb = CircuitBreaker::with_config(fast_config(1, 1));
        let source = SourceKey::new("price", "UNUSED_TRIAL");

        cb.record_failure(&source);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_call(&source));
        assert!(!cb.can_call(&source));

        cb.release_trial(&source);
        assert!(cb.can_call(&source));
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::with_config(fast_config(1, 1));
        let source = SourceKey::new("price", "RESET");

        cb.record_failure(&source);
        assert_eq!(cb.state(&source), CircuitState::Open);

        cb.reset(Some(&source));
        assert_eq!(cb.state(&source), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(&source), 0);
    }

    #[test]
    fn test_reset_all() {
        let cb = CircuitBreaker::with_config(fast_config(1, 1));
        let a = SourceKey::new("price", "A");
        let b = SourceKey::new("news", "B");

        cb.record_failure(&a);
        cb.record_failure(&b);
        cb.reset(None);

        assert!(cb.metrics().is_empty());
        assert!(cb.can_call(&a));
        assert!(cb.can_call(&b));
    }

    #[test]
    fn test_source_isolation() {
        let cb = CircuitBreaker::with_config(fast_config(1, 1));
        let a = SourceKey::new("price", "SOURCE_A");
        let b = SourceKey::new("price", "SOURCE_B");
        let a_news = SourceKey::new("news", "SOURCE_A");

        cb.record_failure(&a);
        assert!(!cb.can_call(&a));

        assert!(cb.can_call(&b));
        // Same provider name in another category has its own circuit.
        assert!(cb.can_call(&a_news));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let cb = CircuitBreaker::new();
        cb.set_category_override(
            "news",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        cb.set_source_override(
            "paid_api",
            CircuitBreakerConfig {
                failure_threshold: 10,
                ..Default::default()
            },
        );

        let scraper = SourceKey::new("news", "scraper");
        let paid = SourceKey::new("news", "paid_api");
        let default = SourceKey::new("price", "scraper");

        assert_eq!(cb.config_for(&scraper).failure_threshold, 1);
        assert_eq!(cb.config_for(&paid).failure_threshold, 10);
        assert_eq!(cb.config_for(&default).failure_threshold, 3);

        cb.record_failure(&scraper);
        assert_eq!(cb.state(&scraper), CircuitState::Open);

        for _ in 0..9 {
            cb.record_failure(&paid);
        }
        assert_eq!(cb.state(&paid), CircuitState::Closed);
    }

    #[test]
    fn test_metrics() {
        let cb = CircuitBreaker::new();
        let a = SourceKey::new("price", "METRIC_A");
        let b = SourceKey::new("price", "METRIC_B");

        cb.record_failure(&a);
        cb.record_failure(&a);
        cb.record_failure(&b);

        let metrics = cb.metrics();
        assert_eq!(metrics.len(), 2);

        let metric_a = metrics.iter().find(|m| m.source == a).unwrap();
        assert_eq!(metric_a.consecutive_failures, 2);
        assert_eq!(metric_a.state, CircuitState::Closed);
        assert!(metric_a.open_for.is_none());
    }
}
