//! A single source attempt, run as its own task.
//!
//! The task owns everything it needs and performs its own bookkeeping
//! (circuit, health, validator history, cache write), so the outcome is
//! recorded even when the caller that started it has given up.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{debug, warn};
use tokio::task::{JoinError, JoinHandle};

use crate::cache::DataCache;
use crate::errors::FetchError;
use crate::models::{AttemptOutcome, AttemptRecord, CacheKey, Payload, SourceKey, SourceName};
use crate::registry::{CircuitBreaker, HealthScorer, ValidationContext, Validator};
use crate::source::DataSource;

/// Shared state an attempt reports into.
#[derive(Clone)]
pub(crate) struct Bookkeeping {
    pub cache: Arc<DataCache>,
    pub circuit: Arc<CircuitBreaker>,
    pub health: Arc<HealthScorer>,
    pub validator: Arc<Validator>,
}

impl Bookkeeping {
    fn record_failure(&self, source: &SourceKey) {
        self.circuit.record_failure(source);
        self.health.record(source, false);
    }

    /// Record a failed call according to the error's retry class.
    ///
    /// Errors that do not penalize leave the circuit and health records
    /// alone, but hand back any half-open trial the call was holding.
    fn record_error(&self, source: &SourceKey, error: &FetchError) {
        if error.retry_class().penalizes() {
            self.record_failure(source);
        } else {
            debug!("Not penalizing '{}' for: {}", source, error);
            self.circuit.release_trial(source);
        }
    }

    fn record_success(&self, source: &SourceKey) {
        self.circuit.record_success(source);
        self.health.record(source, true);
    }
}

/// Per-fetch claim on the single cache write and result slot.
///
/// The first attempt of a fetch to produce a valid payload takes it. Later
/// successes (possible only when racing) are recorded but neither cached nor
/// returned.
#[derive(Clone, Default)]
pub(crate) struct WinnerClaim(Arc<AtomicBool>);

impl WinnerClaim {
    fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything one attempt needs, owned.
pub(crate) struct Attempt {
    pub sequence: usize,
    pub source: Arc<DataSource>,
    pub key: String,
    pub timeout: Duration,
    /// Whether a winning payload is written to the cache.
    pub write_cache: bool,
    pub claim: WinnerClaim,
}

/// What the attempt reports back.
pub(crate) struct AttemptReport {
    pub record: AttemptRecord,
    /// Set only for the attempt that won the fetch.
    pub payload: Option<Payload>,
}

impl Attempt {
    pub fn spawn(self, books: Bookkeeping) -> JoinHandle<AttemptReport> {
        tokio::spawn(self.run(books))
    }

    async fn run(self, books: Bookkeeping) -> AttemptReport {
        let source_key = self.source.key();
        let name = self.source.name().clone();
        let started = Instant::now();

        debug!(
            "Fetching '{}' from '{}' (timeout {:?})",
            self.key, source_key, self.timeout
        );
        let call = AssertUnwindSafe(self.source.fetcher().fetch(&self.key, self.timeout))
            .catch_unwind();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(FetchError::transient(
                name.to_string(),
                format!("fetcher panicked: {}", panic_message(&*panic)),
            )),
            Err(_) => Err(FetchError::Timeout {
                provider: name.to_string(),
                after: self.timeout,
            }),
        };
        let duration = started.elapsed();

        let payload = match result {
            Ok(payload) => payload,
            Err(error) => {
                warn!("Source '{}' failed for '{}': {}", source_key, self.key, error);
                books.record_error(&source_key, &error);
                return self.failed(name, &error, duration);
            }
        };

        let context = ValidationContext {
            category: self.source.category(),
            key: &self.key,
        };
        let validation = books.validator.validate(&context, &payload);
        if !validation.is_valid {
            let error = FetchError::ValidationFailed {
                provider: name.to_string(),
                issues: validation.hard_messages(),
            };
            warn!("Rejected payload for '{}': {}", self.key, error);
            books.record_error(&source_key, &error);
            return self.failed(name, &error, duration);
        }

        books.record_success(&source_key);
        books.validator.observe(&context, &payload);

        if !self.claim.try_claim() {
            debug!(
                "Source '{}' succeeded for '{}' after another source won",
                source_key, self.key
            );
            return self.report(name, AttemptOutcome::Success, duration, None);
        }

        if self.write_cache {
            books.cache.set(
                CacheKey::new(self.source.category().clone(), self.key.clone()),
                payload.clone(),
                None,
                Some(name.clone()),
            );
        }
        let mut report = self.report(name, AttemptOutcome::Success, duration, None);
        report.payload = Some(payload);
        report
    }

    fn failed(&self, source: SourceName, error: &FetchError, duration: Duration) -> AttemptReport {
        self.report(source, AttemptOutcome::from(error), duration, Some(error.to_string()))
    }

    fn report(
        &self,
        source: SourceName,
        outcome: AttemptOutcome,
        duration: Duration,
        detail: Option<String>,
    ) -> AttemptReport {
        AttemptReport {
            record: AttemptRecord {
                sequence: self.sequence,
                source,
                outcome,
                duration,
                detail,
            },
            payload: None,
        }
    }
}

/// Turn a task join result into a report.
///
/// A join error means the task died outside the guarded fetcher call, so
/// its own bookkeeping never ran; the failure is recorded here instead.
pub(crate) fn settle(
    joined: Result<AttemptReport, JoinError>,
    sequence: usize,
    source: &DataSource,
    books: &Bookkeeping,
) -> AttemptReport {
    match joined {
        Ok(report) => report,
        Err(error) => {
            warn!("Attempt task for '{}' did not complete: {}", source.key(), error);
            books.record_failure(&source.key());
            AttemptReport {
                record: AttemptRecord {
                    sequence,
                    source: source.name().clone(),
                    outcome: AttemptOutcome::TransientError,
                    duration: Duration::ZERO,
                    detail: Some(error.to_string()),
                },
                payload: None,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
