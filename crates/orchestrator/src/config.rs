//! Orchestrator configuration.
//!
//! A single [`FetchConfig`] carries every tunable. It deserializes from JSON
//! (durations as fractional seconds), can be adjusted from `DATAGATE_*`
//! environment variables, and splits into the per-component configs.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::cache::{
    default_ttl_table, CacheConfig, DEFAULT_JITTER_RATIO, DEFAULT_NEGATIVE_TTL,
    DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
};
use crate::errors::ConfigError;
use crate::models::{Category, SourceName};
use crate::orchestrator::{FetchMode, OrchestratorOptions, DEFAULT_FETCH_TIMEOUT};
use crate::registry::{
    CircuitBreakerConfig, HealthConfig, DEFAULT_FAIL_THRESHOLD, DEFAULT_HEALTH_WINDOW,
    DEFAULT_MIN_CALLS, DEFAULT_SKIP_DURATION,
};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "DATAGATE_";

/// Upper bound for every configured duration (one year).
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    // Circuit breaker
    pub failure_threshold: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub recovery_timeout: Duration,
    pub half_open_success_threshold: u32,
    pub half_open_max_trials: u32,
    pub circuit_overrides_by_source: HashMap<String, CircuitBreakerConfig>,
    pub circuit_overrides_by_category: HashMap<String, CircuitBreakerConfig>,

    // Cache
    #[serde_as(as = "HashMap<_, DurationSecondsWithFrac<f64>>")]
    pub cache_ttl_by_category: HashMap<String, Duration>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub default_cache_ttl: Duration,
    pub cache_jitter_ratio: f64,
    pub negative_cache_enabled: bool,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub negative_cache_ttl: Duration,
    pub cache_max_entries: Option<usize>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub cache_sweep_interval: Duration,

    // Health
    pub health_fail_rate_threshold: f64,
    pub health_min_calls: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub health_skip_duration: Duration,
    pub health_window: usize,

    // Fetching
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub default_fetch_timeout: Duration,
    #[serde_as(as = "HashMap<_, DurationSecondsWithFrac<f64>>")]
    pub fetch_timeout_by_source: HashMap<String, Duration>,
    pub mode: FetchMode,
    pub adaptive_ordering: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let circuit = CircuitBreakerConfig::default();
        Self {
            failure_threshold: circuit.failure_threshold,
            recovery_timeout: circuit.recovery_timeout,
            half_open_success_threshold: circuit.half_open_success_threshold,
            half_open_max_trials: circuit.half_open_max_trials,
            circuit_overrides_by_source: HashMap::new(),
            circuit_overrides_by_category: HashMap::new(),
            cache_ttl_by_category: default_ttl_table()
                .into_iter()
                .map(|(category, ttl)| (category.into_owned(), ttl))
                .collect(),
            default_cache_ttl: DEFAULT_TTL,
            cache_jitter_ratio: DEFAULT_JITTER_RATIO,
            negative_cache_enabled: true,
            negative_cache_ttl: DEFAULT_NEGATIVE_TTL,
            cache_max_entries: None,
            cache_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            health_fail_rate_threshold: DEFAULT_FAIL_THRESHOLD,
            health_min_calls: DEFAULT_MIN_CALLS,
            health_skip_duration: DEFAULT_SKIP_DURATION,
            health_window: DEFAULT_HEALTH_WINDOW,
            default_fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            fetch_timeout_by_source: HashMap::new(),
            mode: FetchMode::Sequential,
            adaptive_ordering: false,
        }
    }
}

impl FetchConfig {
    /// Parse from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Apply `DATAGATE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `DATAGATE_*` overrides from the given variables.
    ///
    /// Unknown `DATAGATE_*` names are ignored. `DATAGATE_RACE_WIDTH` selects
    /// race mode with that width; `0` selects sequential mode.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let (name, value) = (name.as_ref(), value.as_ref().trim());
            let Some(option) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match option {
                "FAILURE_THRESHOLD" => self.failure_threshold = parse(name, value)?,
                "RECOVERY_TIMEOUT" => self.recovery_timeout = parse_secs(name, value)?,
                "HALF_OPEN_SUCCESS_THRESHOLD" => {
                    self.half_open_success_threshold = parse(name, value)?
                }
                "HALF_OPEN_MAX_TRIALS" => self.half_open_max_trials = parse(name, value)?,
                "DEFAULT_CACHE_TTL" => self.default_cache_ttl = parse_secs(name, value)?,
                "CACHE_JITTER_RATIO" => self.cache_jitter_ratio = parse(name, value)?,
                "NEGATIVE_CACHE_ENABLED" => self.negative_cache_enabled = parse(name, value)?,
                "NEGATIVE_CACHE_TTL" => self.negative_cache_ttl = parse_secs(name, value)?,
                "CACHE_MAX_ENTRIES" => self.cache_max_entries = Some(parse(name, value)?),
                "CACHE_SWEEP_INTERVAL" => self.cache_sweep_interval = parse_secs(name, value)?,
                "HEALTH_FAIL_RATE_THRESHOLD" => {
                    self.health_fail_rate_threshold = parse(name, value)?
                }
                "HEALTH_MIN_CALLS" => self.health_min_calls = parse(name, value)?,
                "HEALTH_SKIP_DURATION" => self.health_skip_duration = parse_secs(name, value)?,
                "HEALTH_WINDOW" => self.health_window = parse(name, value)?,
                "DEFAULT_FETCH_TIMEOUT" => self.default_fetch_timeout = parse_secs(name, value)?,
                "ADAPTIVE_ORDERING" => self.adaptive_ordering = parse(name, value)?,
                "RACE_WIDTH" => {
                    self.mode = match parse::<usize>(name, value)? {
                        0 => FetchMode::Sequential,
                        width => FetchMode::Race { width },
                    }
                }
                _ => continue,
            }
            debug!("Config override applied from {}", name);
        }
        Ok(())
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_circuit("circuit", &self.circuit_breaker_config())?;
        for (name, config) in &self.circuit_overrides_by_source {
            validate_circuit(&format!("circuit_overrides_by_source.{}", name), config)?;
        }
        for (category, config) in &self.circuit_overrides_by_category {
            validate_circuit(&format!("circuit_overrides_by_category.{}", category), config)?;
        }

        for (name, duration) in self.named_durations() {
            if duration > MAX_DURATION {
                return Err(invalid(format!(
                    "{} must be at most {:?}, got {:?}",
                    name, MAX_DURATION, duration
                )));
            }
        }

        if !(0.0..1.0).contains(&self.cache_jitter_ratio) {
            return Err(invalid(format!(
                "cache_jitter_ratio must be in [0, 1), got {}",
                self.cache_jitter_ratio
            )));
        }
        if self.cache_max_entries == Some(0) {
            return Err(invalid("cache_max_entries must be at least 1"));
        }
        if self.cache_sweep_interval.is_zero() {
            return Err(invalid("cache_sweep_interval must be greater than zero"));
        }

        if !(self.health_fail_rate_threshold > 0.0 && self.health_fail_rate_threshold <= 1.0) {
            return Err(invalid(format!(
                "health_fail_rate_threshold must be in (0, 1], got {}",
                self.health_fail_rate_threshold
            )));
        }
        if self.health_min_calls == 0 {
            return Err(invalid("health_min_calls must be at least 1"));
        }
        if self.health_window == 0 {
            return Err(invalid("health_window must be at least 1"));
        }

        if self.default_fetch_timeout.is_zero() {
            return Err(invalid("default_fetch_timeout must be greater than zero"));
        }
        if let Some((name, _)) = self
            .fetch_timeout_by_source
            .iter()
            .find(|(_, timeout)| timeout.is_zero())
        {
            return Err(invalid(format!(
                "fetch_timeout_by_source.{} must be greater than zero",
                name
            )));
        }
        if self.mode == (FetchMode::Race { width: 0 }) {
            return Err(invalid("race width must be at least 1"));
        }

        Ok(())
    }

    fn named_durations(&self) -> Vec<(String, Duration)> {
        let mut durations = vec![
            ("recovery_timeout".to_string(), self.recovery_timeout),
            ("default_cache_ttl".to_string(), self.default_cache_ttl),
            ("negative_cache_ttl".to_string(), self.negative_cache_ttl),
            ("cache_sweep_interval".to_string(), self.cache_sweep_interval),
            ("health_skip_duration".to_string(), self.health_skip_duration),
            ("default_fetch_timeout".to_string(), self.default_fetch_timeout),
        ];
        durations.extend(
            self.cache_ttl_by_category
                .iter()
                .map(|(category, ttl)| (format!("cache_ttl_by_category.{}", category), *ttl)),
        );
        durations.extend(
            self.fetch_timeout_by_source
                .iter()
                .map(|(name, timeout)| (format!("fetch_timeout_by_source.{}", name), *timeout)),
        );
        for (scope, overrides) in [
            ("circuit_overrides_by_source", &self.circuit_overrides_by_source),
            ("circuit_overrides_by_category", &self.circuit_overrides_by_category),
        ] {
            durations.extend(overrides.iter().map(|(name, config)| {
                (
                    format!("{}.{}.recovery_timeout", scope, name),
                    config.recovery_timeout,
                )
            }));
        }
        durations
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            half_open_success_threshold: self.half_open_success_threshold,
            half_open_max_trials: self.half_open_max_trials,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_by_category: self
                .cache_ttl_by_category
                .iter()
                .map(|(category, ttl)| (Category::Owned(category.clone()), *ttl))
                .collect(),
            default_ttl: self.default_cache_ttl,
            jitter_ratio: self.cache_jitter_ratio,
            negative_ttl: self.negative_cache_ttl,
            max_entries: self.cache_max_entries,
            sweep_interval: self.cache_sweep_interval,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            window: self.health_window,
            min_calls: self.health_min_calls,
            fail_threshold: self.health_fail_rate_threshold,
            skip_duration: self.health_skip_duration,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            default_fetch_timeout: self.default_fetch_timeout,
            fetch_timeout_by_source: self
                .fetch_timeout_by_source
                .iter()
                .map(|(name, timeout)| (SourceName::Owned(name.clone()), *timeout))
                .collect(),
            negative_cache_enabled: self.negative_cache_enabled,
            mode: self.mode,
            adaptive_ordering: self.adaptive_ordering,
        }
    }
}

fn validate_circuit(scope: &str, config: &CircuitBreakerConfig) -> Result<(), ConfigError> {
    if config.failure_threshold == 0 {
        return Err(invalid(format!("{}: failure_threshold must be at least 1", scope)));
    }
    if config.half_open_success_threshold == 0 {
        return Err(invalid(format!(
            "{}: half_open_success_threshold must be at least 1",
            scope
        )));
    }
    if config.half_open_max_trials == 0 {
        return Err(invalid(format!("{}: half_open_max_trials must be at least 1", scope)));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn parse<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}

fn parse_secs(var: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(var, value)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}
