//! TTL resolution and jitter.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::models::Category;

/// Default TTL for categories without an explicit entry (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default jitter ratio (±10%).
pub const DEFAULT_JITTER_RATIO: f64 = 0.10;

/// Default lifetime of a negative entry.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(15);

/// Default interval for the background expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Built-in per-category TTLs.
pub fn default_ttl_table() -> HashMap<Category, Duration> {
    HashMap::from([
        (Category::Borrowed("price"), Duration::from_secs(30)),
        (Category::Borrowed("quote"), Duration::from_secs(30)),
        (Category::Borrowed("news"), Duration::from_secs(600)),
        (Category::Borrowed("fundamentals"), Duration::from_secs(86_400)),
    ])
}

/// Cache configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Base TTL per category.
    pub ttl_by_category: HashMap<Category, Duration>,
    /// TTL for categories missing from `ttl_by_category`.
    pub default_ttl: Duration,
    /// Jitter ratio `r`, in `[0, 1)`.
    pub jitter_ratio: f64,
    /// Base TTL of negative entries (jittered like positive ones).
    pub negative_ttl: Duration,
    /// Hard cap on stored entries. `None` means unbounded.
    pub max_entries: Option<usize>,
    /// Interval used by [`DataCache::spawn_sweeper`](super::DataCache::spawn_sweeper)
    /// when the host does not pass one.
    pub sweep_interval: Duration,
}

impl CacheConfig {
    /// Base TTL for a category, before jitter.
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.ttl_by_category
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_by_category: default_ttl_table(),
            default_ttl: DEFAULT_TTL,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            max_entries: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Spread `ttl` by a uniform factor in `[1 - ratio, 1 + ratio]`.
///
/// Keys written together then expire at different instants instead of all
/// missing at once. A ratio outside `[0, 1)` disables jitter.
pub fn apply_jitter(ttl: Duration, ratio: f64) -> Duration {
    if ttl.is_zero() || ratio.is_nan() || ratio <= 0.0 || ratio >= 1.0 {
        return ttl;
    }

    let lower = scale(ttl, 1.0 - ratio);
    let upper = scale(ttl, 1.0 + ratio);
    let factor = rand::thread_rng().gen_range(-ratio..=ratio);

    // Float rounding can land a nanosecond outside the band.
    scale(ttl, 1.0 + factor).clamp(lower, upper)
}

/// `ttl × factor`, saturating at `Duration::MAX`.
fn scale(ttl: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(ttl.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_table_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_for("price"), Duration::from_secs(30));
        assert_eq!(config.ttl_for("quote"), Duration::from_secs(30));
        assert_eq!(config.ttl_for("news"), Duration::from_secs(600));
        assert_eq!(config.ttl_for("fundamentals"), Duration::from_secs(86_400));
        assert_eq!(config.ttl_for("weather"), DEFAULT_TTL);
    }

    #[test]
    fn test_zero_ratio_is_exact() {
        let ttl = Duration::from_secs(30);
        assert_eq!(apply_jitter(ttl, 0.0), ttl);
    }

    #[test]
    fn test_invalid_ratio_disables_jitter() {
        let ttl = Duration::from_secs(30);
        assert_eq!(apply_jitter(ttl, 1.0), ttl);
        assert_eq!(apply_jitter(ttl, -0.5), ttl);
        assert_eq!(apply_jitter(ttl, f64::NAN), ttl);
    }

    #[test]
    fn test_jitter_saturates_instead_of_panicking() {
        assert!(apply_jitter(Duration::MAX, 0.1) > Duration::from_secs(u64::MAX / 2));
        let huge = Duration::from_secs_f64(1.8e19);
        assert!(apply_jitter(huge, 0.1) >= huge.mul_f64(0.9));
    }

    #[test]
    fn test_jitter_spreads_values() {
        let ttl = Duration::from_secs(30);
        let samples: Vec<_> = (0..64).map(|_| apply_jitter(ttl, 0.1)).collect();

        for sample in &samples {
            assert!(*sample >= Duration::from_millis(26_999));
            assert!(*sample <= Duration::from_millis(33_001));
        }
        let first = samples[0];
        assert!(samples.iter().any(|s| *s != first));
    }
}
