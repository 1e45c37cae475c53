//! Rolling failure-rate tracking per source.
//!
//! Complements the circuit breaker: the breaker reacts to consecutive
//! failures, the scorer to a source that fails often but not back to back.
//! A source whose failure rate over the last `window` attempts reaches
//! `threshold` is skipped for `skip_duration`; after that it starts again
//! with a clean window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info};
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::models::SourceKey;

/// Default number of completed attempts kept per source.
pub const DEFAULT_HEALTH_WINDOW: usize = 50;

/// Default minimum attempts before a source can be judged.
pub const DEFAULT_MIN_CALLS: usize = 3;

/// Default failure rate that triggers a skip.
pub const DEFAULT_FAIL_THRESHOLD: f64 = 0.6;

/// Default length of a skip.
pub const DEFAULT_SKIP_DURATION: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    pub window: usize,
    pub min_calls: usize,
    pub fail_threshold: f64,
    pub skip_duration: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_HEALTH_WINDOW,
            min_calls: DEFAULT_MIN_CALLS,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
            skip_duration: DEFAULT_SKIP_DURATION,
        }
    }
}

#[derive(Debug, Default)]
struct HealthRecord {
    /// `true` marks a failed attempt. Oldest first.
    outcomes: VecDeque<bool>,
    skip_started: Option<Instant>,
}

impl HealthRecord {
    fn calls(&self) -> usize {
        self.outcomes.len()
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|failed| **failed).count()
    }

    /// Time left in the active skip, if any.
    fn skip_remaining(&self, skip: Duration, now: Instant) -> Option<Duration> {
        let started = self.skip_started?;
        let left = skip.saturating_sub(now.saturating_duration_since(started));
        (!left.is_zero()).then_some(left)
    }

    fn fail_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.calls() as f64
        }
    }
}

/// Point-in-time view of one source's health.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub source: SourceKey,
    pub calls: usize,
    pub failures: usize,
    pub fail_rate: f64,
    /// Time left in the current skip, if one is active.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub skip_remaining: Option<Duration>,
}

impl HealthSnapshot {
    pub fn is_skipping(&self) -> bool {
        self.skip_remaining.is_some()
    }
}

/// Failure-rate tracker keyed by `(category, source)`.
pub struct HealthScorer {
    records: DashMap<SourceKey, HealthRecord>,
    config: HealthConfig,
}

impl HealthScorer {
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record one completed attempt.
    ///
    /// Only attempts that actually called the fetcher are recorded; sources
    /// skipped by the breaker or by this scorer never reach here.
    pub fn record(&self, source: &SourceKey, success: bool) {
        let window = self.config.window.max(1);
        let mut record = self.records.entry(source.clone()).or_default();

        record.outcomes.push_back(!success);
        while record.outcomes.len() > window {
            record.outcomes.pop_front();
        }

        let now = Instant::now();
        let skipping = record
            .skip_remaining(self.config.skip_duration, now)
            .is_some();
        if !skipping
            && record.calls() >= self.config.min_calls
            && record.fail_rate() >= self.config.fail_threshold
        {
            info!(
                "Health: skipping '{}' for {:?} (fail rate {:.2} over {} calls)",
                source,
                self.config.skip_duration,
                record.fail_rate(),
                record.calls()
            );
            record.skip_started = Some(now);
        }
    }

    /// Whether the source may be called.
    ///
    /// Returns false while a skip is active. The first check after a skip
    /// expires clears the window so the source is judged afresh.
    pub fn is_healthy(&self, source: &SourceKey) -> bool {
        let Some(mut record) = self.records.get_mut(source) else {
            return true;
        };

        if record.skip_started.is_none() {
            return true;
        }
        if record
            .skip_remaining(self.config.skip_duration, Instant::now())
            .is_some()
        {
            return false;
        }

        debug!("Health: skip expired for '{}', window reset", source);
        record.outcomes.clear();
        record.skip_started = None;
        true
    }

    pub fn snapshot(&self, source: &SourceKey) -> HealthSnapshot {
        let now = Instant::now();
        match self.records.get(source) {
            Some(record) => HealthSnapshot {
                source: source.clone(),
                calls: record.calls(),
                failures: record.failures(),
                fail_rate: record.fail_rate(),
                skip_remaining: record.skip_remaining(self.config.skip_duration, now),
            },
            None => HealthSnapshot {
                source: source.clone(),
                calls: 0,
                failures: 0,
                fail_rate: 0.0,
                skip_remaining: None,
            },
        }
    }

    /// Snapshots of every tracked source, sorted by source key.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut keys: Vec<SourceKey> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys.iter().map(|key| self.snapshot(key)).collect()
    }

    /// Forget one source's history, or every source's when `None`.
    pub fn reset(&self, source: Option<&SourceKey>) {
        match source {
            Some(source) => {
                self.records.remove(source);
                info!("Health: reset '{}'", source);
            }
            None => {
                self.records.clear();
                info!("Health: all records reset");
            }
        }
    }
}

impl Default for HealthScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_scorer(skip: Duration) -> HealthScorer {
        HealthScorer::with_config(HealthConfig {
            skip_duration: skip,
            ..Default::default()
        })
    }

    #[test]
    fn test_unknown_source_is_healthy() {
        let scorer = HealthScorer::new();
        assert!(scorer.is_healthy(&SourceKey::new("price", "NEW")));
    }

    #[test]
    fn test_min_calls_gate() {
        let scorer = HealthScorer::new();
        let source = SourceKey::new("price", "FLAKY");

        scorer.record(&source, false);
        scorer.record(&source, false);
        // 100% failures but only two calls.
        assert!(scorer.is_healthy(&source));

        scorer.record(&source, false);
        assert!(!scorer.is_healthy(&source));
    }

    #[test]
    fn test_rate_below_threshold_stays_healthy() {
        let scorer = HealthScorer::new();
        let source = SourceKey::new("price", "MOSTLY_OK");

        // Alternating outcomes never reach 0.6.
        for success in [true, false, true, false, true, false] {
            scorer.record(&source, success);
        }
        assert!(scorer.is_healthy(&source));
        assert_eq!(scorer.snapshot(&source).fail_rate, 0.5);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let scorer = HealthScorer::with_config(HealthConfig {
            min_calls: 5,
            ..Default::default()
        });
        let source = SourceKey::new("price", "EDGE");

        // 3 of 5 = 0.6 exactly.
        for success in [true, false, true, false, false] {
            scorer.record(&source, success);
        }
        assert!(!scorer.is_healthy(&source));
    }

    #[test]
    fn test_window_is_bounded() {
        let scorer = HealthScorer::with_config(HealthConfig {
            window: 4,
            ..Default::default()
        });
        let source = SourceKey::new("price", "OLD_FAILURES");

        scorer.record(&source, false);
        scorer.record(&source, false);
        for _ in 0..4 {
            scorer.record(&source, true);
        }

        let snapshot = scorer.snapshot(&source);
        assert_eq!(snapshot.calls, 4);
        assert_eq!(snapshot.failures, 0);
    }

    #[test]
    fn test_skip_expiry_resets_window() {
        let scorer = fast_scorer(Duration::from_millis(20));
        let source = SourceKey::new("price", "RECOVERS");

        for _ in 0..3 {
            scorer.record(&source, false);
        }
        assert!(!scorer.is_healthy(&source));
        assert!(scorer.snapshot(&source).is_skipping());

        std::thread::sleep(Duration::from_millis(30));

        assert!(scorer.is_healthy(&source));
        let snapshot = scorer.snapshot(&source);
        assert_eq!(snapshot.calls, 0);
        assert!(!snapshot.is_skipping());

        // One more failure is not enough to skip again.
        scorer.record(&source, false);
        assert!(scorer.is_healthy(&source));
    }

    #[test]
    fn test_huge_skip_duration() {
        let scorer = fast_scorer(Duration::MAX);
        let source = SourceKey::new("price", "GONE");

        for _ in 0..3 {
            scorer.record(&source, false);
        }
        assert!(!scorer.is_healthy(&source));
        assert!(scorer.snapshot(&source).skip_remaining.is_some());
    }

    #[test]
    fn test_reset() {
        let scorer = HealthScorer::new();
        let a = SourceKey::new("price", "A");
        let b = SourceKey::new("price", "B");

        for _ in 0..3 {
            scorer.record(&a, false);
            scorer.record(&b, false);
        }
        scorer.reset(Some(&a));
        assert!(scorer.is_healthy(&a));
        assert!(!scorer.is_healthy(&b));

        scorer.reset(None);
        assert!(scorer.snapshots().is_empty());
    }

    #[test]
    fn test_sources_are_independent() {
        let scorer = HealthScorer::new();
        let price = SourceKey::new("price", "A");
        let news = SourceKey::new("news", "A");

        for _ in 0..3 {
            scorer.record(&price, false);
        }
        assert!(!scorer.is_healthy(&price));
        assert!(scorer.is_healthy(&news));
    }
}
