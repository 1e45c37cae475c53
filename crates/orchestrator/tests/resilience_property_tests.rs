//! Property-based tests for the cache jitter, circuit breaker and health scorer.
//!
//! These tests check properties that must hold for any sequence of inputs,
//! using the `proptest` crate for random test case generation.

use std::time::Duration;

use datagate_orchestrator::cache::apply_jitter;
use datagate_orchestrator::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, HealthConfig, HealthScorer, SourceKey,
};
use proptest::prelude::*;

// =============================================================================
// Generators
// =============================================================================

/// Generates a sequence of call outcomes (`true` = success).
fn arb_outcomes() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..60)
}

fn arb_circuit_config() -> impl Strategy<Value = CircuitBreakerConfig> {
    (1u32..6, 1u32..4).prop_map(|(failure_threshold, half_open_success_threshold)| {
        CircuitBreakerConfig {
            failure_threshold,
            // Long enough that no test run ever reaches HalfOpen.
            recovery_timeout: Duration::from_secs(3600),
            half_open_success_threshold,
            half_open_max_trials: 1,
        }
    })
}

fn source() -> SourceKey {
    SourceKey::new("price", "A")
}

// =============================================================================
// Jitter
// =============================================================================

proptest! {
    #[test]
    fn prop_jitter_stays_within_band(secs in 1u64..200_000, ratio in 0.0f64..0.99) {
        let ttl = Duration::from_secs(secs);
        let jittered = apply_jitter(ttl, ratio);

        prop_assert!(jittered >= ttl.mul_f64(1.0 - ratio));
        prop_assert!(jittered <= ttl.mul_f64(1.0 + ratio));
    }

    #[test]
    fn prop_out_of_range_ratio_is_identity(secs in 0u64..200_000, ratio in 1.0f64..10.0) {
        let ttl = Duration::from_secs(secs);
        prop_assert_eq!(apply_jitter(ttl, ratio), ttl);
        prop_assert_eq!(apply_jitter(ttl, -ratio), ttl);
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

proptest! {
    /// Replaying outcomes against a simple model: the circuit is Open exactly
    /// when the trailing run of failures has reached the threshold.
    #[test]
    fn prop_circuit_opens_on_consecutive_failures(
        config in arb_circuit_config(),
        outcomes in arb_outcomes(),
    ) {
        let breaker = CircuitBreaker::with_config(config.clone());
        let key = source();
        let mut open = false;
        let mut run = 0u32;

        for success in outcomes {
            if open {
                // Open circuits refuse calls until the recovery timeout.
                prop_assert!(!breaker.can_call(&key));
                continue;
            }
            prop_assert!(breaker.can_call(&key));
            if success {
                breaker.record_success(&key);
                run = 0;
            } else {
                breaker.record_failure(&key);
                run += 1;
                open = run >= config.failure_threshold;
            }

            let expected = if open { CircuitState::Open } else { CircuitState::Closed };
            prop_assert_eq!(breaker.state(&key), expected);
            prop_assert_eq!(breaker.consecutive_failures(&key), run);
        }
    }

    #[test]
    fn prop_reset_always_closes(config in arb_circuit_config(), failures in 0usize..20) {
        let breaker = CircuitBreaker::with_config(config);
        let key = source();
        for _ in 0..failures {
            breaker.record_failure(&key);
        }

        breaker.reset(Some(&key));

        prop_assert_eq!(breaker.state(&key), CircuitState::Closed);
        prop_assert_eq!(breaker.consecutive_failures(&key), 0);
        prop_assert!(breaker.can_call(&key));
    }
}

// =============================================================================
// Health scorer
// =============================================================================

proptest! {
    /// The window never grows past its size and the reported rate matches
    /// the trailing outcomes, as long as no skip has started.
    #[test]
    fn prop_health_window_is_bounded(window in 1usize..20, outcomes in arb_outcomes()) {
        let scorer = HealthScorer::with_config(HealthConfig {
            window,
            min_calls: usize::MAX,
            ..Default::default()
        });
        let key = source();

        for success in &outcomes {
            scorer.record(&key, *success);
        }

        let snapshot = scorer.snapshot(&key);
        let tail: Vec<bool> = outcomes.iter().rev().take(window).copied().collect();
        let failures = tail.iter().filter(|s| !**s).count();

        prop_assert_eq!(snapshot.calls, tail.len());
        prop_assert_eq!(snapshot.failures, failures);
        prop_assert!(!snapshot.is_skipping());
        prop_assert!(scorer.is_healthy(&key));
        if !tail.is_empty() {
            let rate = failures as f64 / tail.len() as f64;
            prop_assert!((snapshot.fail_rate - rate).abs() < 1e-9);
        }
    }

    #[test]
    fn prop_all_failures_trigger_skip(min_calls in 1usize..10, extra in 0usize..10) {
        let scorer = HealthScorer::with_config(HealthConfig {
            min_calls,
            window: 50,
            ..Default::default()
        });
        let key = source();

        for _ in 0..(min_calls + extra) {
            scorer.record(&key, false);
        }

        prop_assert!(!scorer.is_healthy(&key));
        prop_assert!(scorer.snapshot(&key).is_skipping());
    }
}
