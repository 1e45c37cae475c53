//! Fetch result envelope and attempt trace.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_with::{serde_as, DurationMilliSeconds};

use super::types::{Payload, SourceName};
use crate::errors::FetchError;

/// What happened to one source during a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The source returned a payload that passed validation.
    Success,
    /// The source returned a payload that failed validation.
    ValidationFailed,
    /// The source errored, timed out or panicked.
    TransientError,
    /// The source was not called because its circuit is open.
    CircuitOpen,
    /// The source was not called because it is in a health cooldown.
    SkippedUnhealthy,
}

impl AttemptOutcome {
    /// Whether the fetcher was actually invoked.
    pub fn was_called(self) -> bool {
        matches!(
            self,
            Self::Success | Self::ValidationFailed | Self::TransientError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ValidationFailed => "validation_failed",
            Self::TransientError => "transient_error",
            Self::CircuitOpen => "circuit_open",
            Self::SkippedUnhealthy => "skipped_unhealthy",
        }
    }
}

impl From<&FetchError> for AttemptOutcome {
    fn from(error: &FetchError) -> Self {
        match error {
            FetchError::ValidationFailed { .. } => Self::ValidationFailed,
            FetchError::CircuitOpen { .. } => Self::CircuitOpen,
            FetchError::Unhealthy { .. } => Self::SkippedUnhealthy,
            _ => Self::TransientError,
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single source attempt.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Start order within the fetch (0-based).
    pub sequence: usize,
    pub source: SourceName,
    pub outcome: AttemptOutcome,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    /// Error or validation message, if any.
    pub detail: Option<String>,
}

/// Append-only list of attempts built during one fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchTrace {
    records: Vec<AttemptRecord>,
    next_sequence: usize,
}

impl FetchTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next start-order slot. Call when an attempt is issued.
    pub fn next_sequence(&mut self) -> usize {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn record_skip(&mut self, source: SourceName, outcome: AttemptOutcome) {
        let sequence = self.next_sequence();
        self.records.push(AttemptRecord {
            sequence,
            source,
            outcome,
            duration: Duration::ZERO,
            detail: None,
        });
    }

    pub fn push(&mut self, record: AttemptRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        self.sorted_records()
            .iter()
            .map(|r| match &r.detail {
                Some(detail) => format!("{}: {} ({})", r.source, r.outcome, detail),
                None => format!("{}: {}", r.source, r.outcome),
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Records ordered by start sequence, whatever order they completed in.
    pub fn into_records(mut self) -> Vec<AttemptRecord> {
        self.records.sort_by_key(|r| r.sequence);
        self.records
    }

    fn sorted_records(&self) -> Vec<&AttemptRecord> {
        let mut records: Vec<_> = self.records.iter().collect();
        records.sort_by_key(|r| r.sequence);
        records
    }
}

/// Uniform result envelope returned by every fetch.
///
/// Callers always get one of these, never a raw fetcher error. `success ==
/// false` with a populated trace is the canonical failure signal.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct FetchResult {
    success: bool,
    data: Option<Payload>,
    source: Option<SourceName>,
    cached: bool,
    fallback_used: bool,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    duration: Duration,
    as_of: DateTime<Utc>,
    #[serde(serialize_with = "serialize_error")]
    error: Option<FetchError>,
    tried_sources: Vec<SourceName>,
    trace: Vec<AttemptRecord>,
}

impl FetchResult {
    /// A fresh, validated payload from `source`.
    pub(crate) fn fetched(
        data: Payload,
        source: SourceName,
        duration: Duration,
        trace: FetchTrace,
    ) -> Self {
        let trace = trace.into_records();
        let fallback_used = trace.iter().any(|r| r.source != source);
        Self {
            success: true,
            data: Some(data),
            source: Some(source),
            cached: false,
            fallback_used,
            duration,
            as_of: Utc::now(),
            error: None,
            tried_sources: tried_sources(&trace),
            trace,
        }
    }

    /// A positive cache hit. `as_of` is when the entry was stored.
    pub(crate) fn from_cache(
        data: Payload,
        source: Option<SourceName>,
        stored_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            success: true,
            data: Some(data),
            source,
            cached: true,
            fallback_used: false,
            duration,
            as_of: stored_at,
            error: None,
            tried_sources: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// A negative cache hit: fail fast without touching any source.
    pub(crate) fn cached_failure(error: FetchError, duration: Duration) -> Self {
        Self {
            success: false,
            data: None,
            source: None,
            cached: true,
            fallback_used: true,
            duration,
            as_of: Utc::now(),
            error: Some(error),
            tried_sources: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// A terminal failure carrying whatever trace was built.
    pub(crate) fn failed(error: FetchError, duration: Duration, trace: FetchTrace) -> Self {
        let trace = trace.into_records();
        Self {
            success: false,
            data: None,
            source: None,
            cached: false,
            fallback_used: !trace.is_empty(),
            duration,
            as_of: Utc::now(),
            error: Some(error),
            tried_sources: tried_sources(&trace),
            trace,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Payload> {
        self.data.as_ref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn cached(&self) -> bool {
        self.cached
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn tried_sources(&self) -> &[SourceName] {
        &self.tried_sources
    }

    pub fn trace(&self) -> &[AttemptRecord] {
        &self.trace
    }

    /// Convert into a plain `Result`, dropping provenance.
    pub fn into_result(self) -> Result<Payload, FetchError> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(error)) => Err(error),
            (None, None) => Err(FetchError::Cancelled),
        }
    }
}

fn tried_sources(trace: &[AttemptRecord]) -> Vec<SourceName> {
    trace.iter().map(|r| r.source.clone()).collect()
}

fn serialize_error<S>(error: &Option<FetchError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}
