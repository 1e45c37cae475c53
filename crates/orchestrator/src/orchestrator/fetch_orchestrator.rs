//! Fetch orchestration: cache lookup, fallback traversal and trace assembly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::attempt::{settle, Attempt, Bookkeeping, WinnerClaim};
use super::options::{FetchMode, OrchestratorOptions};
use crate::cache::{CacheLookup, DataCache, SweeperHandle};
use crate::config::FetchConfig;
use crate::diagnostics::Diagnostics;
use crate::errors::{ConfigError, FetchError};
use crate::models::{
    AttemptOutcome, Category, FetchRequest, FetchResult, FetchTrace, Payload, SourceName,
};
use crate::registry::{CircuitBreaker, HealthScorer, RegisteredSource, SourceRegistry, Validator};
use crate::source::DataSource;

/// How a traversal of the source list ended.
enum Traversal {
    Won { payload: Payload, source: SourceName },
    Exhausted,
    Interrupted(FetchError),
}

enum Wait<T> {
    Done(T),
    DeadlineExceeded,
    Cancelled,
}

/// Overall time budget of one fetch.
#[derive(Clone, Copy)]
struct Budget {
    started: Instant,
    deadline: Option<Instant>,
}

impl Budget {
    fn new(started: Instant, limit: Option<Duration>) -> Self {
        Self {
            started,
            // A deadline past the end of the clock is no deadline.
            deadline: limit.and_then(|limit| started.checked_add(limit)),
        }
    }

    fn is_spent(&self) -> bool {
        self.deadline.is_some_and(|at| Instant::now() >= at)
    }

    fn exceeded(&self) -> FetchError {
        FetchError::DeadlineExceeded {
            elapsed: self.started.elapsed(),
        }
    }
}

/// Entry point for every fetch.
///
/// Holds the registry and the shared guards. Cheap to share behind an `Arc`;
/// every method takes `&self`.
///
/// # Flow
///
/// 1. Cache lookup (positive hit returns, negative hit fails fast)
/// 2. Sources for the category, in registry order
/// 3. Circuit breaker and health checks per source
/// 4. Fetch under the per-source timeout
/// 5. Validate, then cache and return the first accepted payload
/// 6. If every source failed, optionally cache the failure
pub struct FetchOrchestrator {
    registry: Arc<SourceRegistry>,
    cache: Arc<DataCache>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<HealthScorer>,
    validator: Arc<Validator>,
    options: OrchestratorOptions,
}

impl FetchOrchestrator {
    pub fn builder() -> FetchOrchestratorBuilder {
        FetchOrchestratorBuilder::default()
    }

    /// Build every component from configuration.
    ///
    /// The registry is passed in because sources carry live fetchers, which
    /// configuration cannot describe.
    pub fn from_config(
        config: &FetchConfig,
        registry: Arc<SourceRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let circuit_breaker = CircuitBreaker::with_config(config.circuit_breaker_config());
        for (name, overrides) in &config.circuit_overrides_by_source {
            circuit_breaker.set_source_override(name.clone(), overrides.clone());
        }
        for (category, overrides) in &config.circuit_overrides_by_category {
            circuit_breaker.set_category_override(category.clone(), overrides.clone());
        }

        Ok(Self::builder()
            .registry(registry)
            .cache(Arc::new(DataCache::with_config(config.cache_config())))
            .circuit_breaker(Arc::new(circuit_breaker))
            .health(Arc::new(HealthScorer::with_config(config.health_config())))
            .options(config.orchestrator_options())
            .build())
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn health(&self) -> &Arc<HealthScorer> {
        &self.health
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Fetch `key` from `category` with default request settings.
    pub async fn fetch_key(
        &self,
        category: impl Into<Category>,
        key: impl Into<String>,
    ) -> FetchResult {
        self.fetch(FetchRequest::new(category, key)).await
    }

    /// Fetch one data item.
    ///
    /// Never fails outright: failures come back as `success == false` with
    /// the attempt trace.
    pub async fn fetch(&self, request: FetchRequest) -> FetchResult {
        self.fetch_with_cancel(request, CancellationToken::new()).await
    }

    /// Fetch one data item, giving up when `cancel` fires.
    ///
    /// Giving up only releases the caller. An attempt already in flight runs
    /// to completion in its own task and still records its outcome.
    pub async fn fetch_with_cancel(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> FetchResult {
        let started = Instant::now();
        let cache_key = request.cache_key();

        if request.cache_mode.reads() {
            match self.cache.get(&cache_key) {
                CacheLookup::Hit(hit) => {
                    debug!("Cache hit for '{}'", cache_key);
                    return FetchResult::from_cache(
                        hit.payload,
                        hit.source,
                        hit.stored_at,
                        started.elapsed(),
                    );
                }
                CacheLookup::NegativeHit { reason } => {
                    debug!("Negative cache hit for '{}': {}", cache_key, reason);
                    return FetchResult::cached_failure(
                        FetchError::CachedFailure {
                            category: request.category.to_string(),
                            key: request.key.clone(),
                            reason,
                        },
                        started.elapsed(),
                    );
                }
                CacheLookup::Miss => {}
            }
        }

        let sources = self.ordered_sources(&request.category);
        if sources.is_empty() {
            warn!("No sources registered for category '{}'", request.category);
            return FetchResult::failed(
                FetchError::NoSourcesRegistered {
                    category: request.category.to_string(),
                },
                started.elapsed(),
                FetchTrace::new(),
            );
        }

        let budget = Budget::new(started, request.deadline);
        let mut trace = FetchTrace::new();
        let traversal = match self.options.mode {
            FetchMode::Sequential => {
                self.run_sequential(&request, sources, budget, &cancel, &mut trace)
                    .await
            }
            FetchMode::Race { width } => {
                self.run_race(&request, sources, width.max(1), budget, &cancel, &mut trace)
                    .await
            }
        };

        match traversal {
            Traversal::Won { payload, source } => {
                debug!(
                    "Fetched '{}' from '{}' ({})",
                    cache_key,
                    source,
                    trace.summary()
                );
                FetchResult::fetched(payload, source, started.elapsed(), trace)
            }
            Traversal::Exhausted => {
                let error = FetchError::AllSourcesExhausted {
                    category: request.category.to_string(),
                    key: request.key.clone(),
                    attempted: trace.len(),
                };
                warn!("All sources exhausted for '{}': {}", cache_key, trace.summary());
                if self.options.negative_cache_enabled && request.cache_mode.writes() {
                    self.cache.set_negative(cache_key, error.to_string());
                }
                FetchResult::failed(error, started.elapsed(), trace)
            }
            Traversal::Interrupted(error) => {
                info!("Fetch for '{}' interrupted: {}", cache_key, error);
                FetchResult::failed(error, started.elapsed(), trace)
            }
        }
    }

    /// Serializable snapshot of cache, circuit and health state.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::collect(&self.registry, &self.cache, &self.circuit_breaker, &self.health)
    }

    /// Start the background cache sweep at the configured interval.
    pub fn spawn_cache_sweeper(&self) -> SweeperHandle {
        let interval = self.cache.config().sweep_interval;
        info!("Starting cache sweeper every {:?}", interval);
        self.cache.spawn_sweeper(interval)
    }

    async fn run_sequential(
        &self,
        request: &FetchRequest,
        sources: Vec<RegisteredSource>,
        budget: Budget,
        cancel: &CancellationToken,
        trace: &mut FetchTrace,
    ) -> Traversal {
        let claim = WinnerClaim::default();

        for registered in sources {
            if let Some(error) = interruption(budget, cancel, trace) {
                return Traversal::Interrupted(error);
            }
            let source = registered.source;
            if let Err(skip) = self.admit(&source) {
                trace.record_skip(source.name().clone(), AttemptOutcome::from(&skip));
                continue;
            }

            let sequence = trace.next_sequence();
            let handle = self
                .attempt(request, &source, sequence, &claim)
                .spawn(self.bookkeeping());

            match wait(handle, budget.deadline, cancel).await {
                Wait::Done(joined) => {
                    let report = settle(joined, sequence, &source, &self.bookkeeping());
                    trace.push(report.record);
                    if let Some(payload) = report.payload {
                        return Traversal::Won {
                            payload,
                            source: source.name().clone(),
                        };
                    }
                }
                Wait::DeadlineExceeded => return Traversal::Interrupted(budget.exceeded()),
                Wait::Cancelled => return Traversal::Interrupted(FetchError::Cancelled),
            }
        }

        Traversal::Exhausted
    }

    async fn run_race(
        &self,
        request: &FetchRequest,
        sources: Vec<RegisteredSource>,
        width: usize,
        budget: Budget,
        cancel: &CancellationToken,
        trace: &mut FetchTrace,
    ) -> Traversal {
        let claim = WinnerClaim::default();
        let mut pending = sources.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            // Stop launching once a winner exists; its report is on its way.
            while in_flight.len() < width && !claim.is_claimed() {
                let Some(registered) = pending.next() else {
                    break;
                };
                if let Some(error) = interruption(budget, cancel, trace) {
                    return Traversal::Interrupted(error);
                }
                let source = registered.source;
                if let Err(skip) = self.admit(&source) {
                    trace.record_skip(source.name().clone(), AttemptOutcome::from(&skip));
                    continue;
                }

                let sequence = trace.next_sequence();
                let handle = self
                    .attempt(request, &source, sequence, &claim)
                    .spawn(self.bookkeeping());
                in_flight.push(async move { (sequence, source, handle.await) });
            }

            if in_flight.is_empty() {
                return Traversal::Exhausted;
            }

            match wait(in_flight.next(), budget.deadline, cancel).await {
                Wait::Done(Some((sequence, source, joined))) => {
                    let report = settle(joined, sequence, &source, &self.bookkeeping());
                    trace.push(report.record);
                    if let Some(payload) = report.payload {
                        // Dropping the remaining handles detaches those tasks.
                        return Traversal::Won {
                            payload,
                            source: source.name().clone(),
                        };
                    }
                }
                Wait::Done(None) => return Traversal::Exhausted,
                Wait::DeadlineExceeded => return Traversal::Interrupted(budget.exceeded()),
                Wait::Cancelled => return Traversal::Interrupted(FetchError::Cancelled),
            }
        }
    }

    /// Circuit and health gate for one source.
    ///
    /// A refusal is a `NextSource` error: the caller records the skip and
    /// moves on without penalizing the source.
    fn admit(&self, source: &DataSource) -> Result<(), FetchError> {
        let key = source.key();
        let provider = source.name().to_string();

        if !self.circuit_breaker.can_call(&key) {
            debug!("Circuit open for '{}', skipping", key);
            return Err(FetchError::CircuitOpen { provider });
        }

        if !self.health.is_healthy(&key) {
            // Hand back a half-open trial the breaker may have just granted.
            self.circuit_breaker.release_trial(&key);
            debug!("Source '{}' is unhealthy, skipping", key);
            return Err(FetchError::Unhealthy { provider });
        }

        Ok(())
    }

    fn attempt(
        &self,
        request: &FetchRequest,
        source: &Arc<DataSource>,
        sequence: usize,
        claim: &WinnerClaim,
    ) -> Attempt {
        Attempt {
            sequence,
            source: Arc::clone(source),
            key: request.key.clone(),
            timeout: self.timeout_for(source),
            write_cache: request.cache_mode.writes(),
            claim: claim.clone(),
        }
    }

    /// Configured override, else the source's own timeout, else the default.
    fn timeout_for(&self, source: &DataSource) -> Duration {
        self.options
            .fetch_timeout_by_source
            .get(source.name())
            .copied()
            .or(source.timeout())
            .unwrap_or(self.options.default_fetch_timeout)
    }

    fn ordered_sources(&self, category: &str) -> Vec<RegisteredSource> {
        let mut sources = self.registry.sources_for(category);
        if self.options.adaptive_ordering {
            // Stable, so equal keys keep registry order.
            sources.sort_by_key(|r| {
                (
                    self.circuit_breaker.consecutive_failures(&r.source.key()),
                    r.priority,
                )
            });
        }
        sources
    }

    fn bookkeeping(&self) -> Bookkeeping {
        Bookkeeping {
            cache: Arc::clone(&self.cache),
            circuit: Arc::clone(&self.circuit_breaker),
            health: Arc::clone(&self.health),
            validator: Arc::clone(&self.validator),
        }
    }
}

/// Check cancellation and the deadline before starting another attempt.
fn interruption(
    budget: Budget,
    cancel: &CancellationToken,
    trace: &FetchTrace,
) -> Option<FetchError> {
    if cancel.is_cancelled() {
        debug!("Fetch cancelled after {} attempts", trace.len());
        return Some(FetchError::Cancelled);
    }
    budget.is_spent().then(|| budget.exceeded())
}

/// Wait for `future`, giving up at the deadline or on cancellation.
async fn wait<F: Future>(
    future: F,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Wait<F::Output> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Wait::Cancelled,
        output = future => Wait::Done(output),
        _ = expiry => Wait::DeadlineExceeded,
    }
}

/// Builder for [`FetchOrchestrator`]. Unset components get their defaults.
#[derive(Default)]
pub struct FetchOrchestratorBuilder {
    registry: Option<Arc<SourceRegistry>>,
    cache: Option<Arc<DataCache>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    health: Option<Arc<HealthScorer>>,
    validator: Option<Arc<Validator>>,
    options: OrchestratorOptions,
}

impl FetchOrchestratorBuilder {
    pub fn registry(mut self, registry: Arc<SourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache(mut self, cache: Arc<DataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn health(mut self, health: Arc<HealthScorer>) -> Self {
        self.health = Some(health);
        self
    }

    /// Defaults to [`Validator::with_defaults`].
    pub fn validator(mut self, validator: Arc<Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn mode(mut self, mode: FetchMode) -> Self {
        self.options.mode = mode;
        self
    }

    pub fn build(self) -> FetchOrchestrator {
        FetchOrchestrator {
            registry: self.registry.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            health: self.health.unwrap_or_default(),
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(Validator::with_defaults())),
            options: self.options,
        }
    }
}
