//! Payload validation.
//!
//! Validates payloads from sources before they are cached or returned:
//! - Required fields present and non-null
//! - Numeric plausibility (positive, bounded, close to recent accepted values)
//! - Cross-field consistency (e.g. market cap ≈ price × shares)
//! - Empty collections
//!
//! Checks are registered per category. A payload is rejected when any check
//! reports a `Hard` issue; `Soft` issues are logged and the payload accepted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use log::warn;

use crate::models::{CacheKey, Category, Payload};

/// Validation severity levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationSeverity {
    /// Hard failure - reject payload, try next source.
    Hard,
    /// Soft warning - accept payload but log warning.
    Soft,
}

/// One problem found by a check.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationIssue {
    /// Name of the check that raised it.
    pub check: String,
    pub severity: ValidationSeverity,
    pub message: String,
}

impl ValidationIssue {
    pub fn hard(check: &str, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity: ValidationSeverity::Hard,
            message: message.into(),
        }
    }

    pub fn soft(check: &str, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity: ValidationSeverity::Soft,
            message: message.into(),
        }
    }
}

/// Outcome of validating one payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let is_valid = !issues
            .iter()
            .any(|i| i.severity == ValidationSeverity::Hard);
        Self { is_valid, issues }
    }

    /// Messages of every issue, hard and soft.
    pub fn messages(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.message.clone()).collect()
    }

    /// Messages of the issues that caused rejection.
    pub fn hard_messages(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Hard)
            .map(|i| i.message.clone())
            .collect()
    }
}

/// What is being validated.
#[derive(Clone, Copy, Debug)]
pub struct ValidationContext<'a> {
    pub category: &'a str,
    pub key: &'a str,
}

/// A single sanity check.
///
/// Checks never mutate the payload. Checks that keep history (see
/// [`NumericPlausibility`]) learn from [`observe`](Self::observe), which the
/// orchestrator calls only for payloads it accepted.
pub trait PayloadCheck: Send + Sync {
    fn name(&self) -> &str;

    fn check(
        &self,
        ctx: &ValidationContext<'_>,
        payload: &Payload,
        issues: &mut Vec<ValidationIssue>,
    );

    fn observe(&self, _ctx: &ValidationContext<'_>, _payload: &Payload) {}
}

/// Resolve a dot-separated path such as `quote.price` or `items.0.id`.
///
/// An empty path is the payload itself.
pub fn lookup<'a>(payload: &'a Payload, path: &str) -> Option<&'a Payload> {
    if path.is_empty() {
        return Some(payload);
    }
    let pointer: String = path
        .split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect();
    payload.pointer(&pointer)
}

// =============================================================================
// Required fields
// =============================================================================

/// Every listed field must be present and non-null.
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl PayloadCheck for RequiredFields {
    fn name(&self) -> &str {
        "required_fields"
    }

    fn check(
        &self,
        _ctx: &ValidationContext<'_>,
        payload: &Payload,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for field in &self.fields {
            match lookup(payload, field) {
                None | Some(Payload::Null) => {
                    issues.push(ValidationIssue::hard(
                        self.name(),
                        format!("Missing field: {}", field),
                    ));
                }
                Some(_) => {}
            }
        }
    }
}

// =============================================================================
// Numeric plausibility
// =============================================================================

/// Default number of accepted values remembered per key.
const DEFAULT_HISTORY_WINDOW: usize = 20;

/// Default number of remembered values needed before the deviation test runs.
const DEFAULT_MIN_SAMPLES: usize = 3;

/// Default allowed deviation, in standard deviations.
const DEFAULT_MAX_SIGMAS: f64 = 3.0;

/// Default minimum allowed deviation as a fraction of the mean.
const DEFAULT_FLOOR_RATIO: f64 = 0.05;

/// Default number of agreeing deviations that move the anchor.
const DEFAULT_REANCHOR_AFTER: usize = 3;

/// Numeric field must be finite, above `minimum`, at most `maximum`, and
/// within `max_sigmas` standard deviations of recently accepted values for
/// the same key.
///
/// A perfectly stable history has zero deviation, so the allowed band never
/// shrinks below `floor_ratio × |mean|`.
///
/// History only learns from accepted values, so a real level shift would be
/// rejected forever. Instead, once `reanchor_after` consecutive deviating
/// readings agree with each other (within `floor_ratio` of their own mean),
/// they replace the history and the latest one passes with a soft issue.
/// Any in-band reading discards the pending deviations.
pub struct NumericPlausibility {
    field: String,
    minimum: f64,
    maximum: Option<f64>,
    max_sigmas: f64,
    min_samples: usize,
    history_window: usize,
    floor_ratio: f64,
    reanchor_after: usize,
    history: DashMap<CacheKey, VecDeque<f64>>,
    /// Consecutive deviating readings per key, oldest first.
    pending: DashMap<CacheKey, VecDeque<f64>>,
}

impl NumericPlausibility {
    /// Check `field` with the default bounds: strictly positive, no maximum.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            minimum: 0.0,
            maximum: None,
            max_sigmas: DEFAULT_MAX_SIGMAS,
            min_samples: DEFAULT_MIN_SAMPLES,
            history_window: DEFAULT_HISTORY_WINDOW,
            floor_ratio: DEFAULT_FLOOR_RATIO,
            reanchor_after: DEFAULT_REANCHOR_AFTER,
            history: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Values must be strictly greater than `minimum`.
    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = minimum;
        self
    }

    pub fn with_maximum(mut self, maximum: f64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    pub fn with_max_sigmas(mut self, max_sigmas: f64) -> Self {
        self.max_sigmas = max_sigmas;
        self
    }

    pub fn with_history(mut self, window: usize, min_samples: usize) -> Self {
        self.history_window = window.max(1);
        self.min_samples = min_samples.max(1);
        self
    }

    pub fn with_floor_ratio(mut self, floor_ratio: f64) -> Self {
        self.floor_ratio = floor_ratio;
        self
    }

    /// Agreeing deviations needed to move the anchor. `0` never moves it.
    pub fn with_reanchor_after(mut self, readings: usize) -> Self {
        self.reanchor_after = readings;
        self
    }

    fn history_key(ctx: &ValidationContext<'_>) -> CacheKey {
        CacheKey::new(ctx.category.to_string(), ctx.key)
    }

    fn deviation_issue(&self, ctx: &ValidationContext<'_>, value: f64) -> Option<String> {
        let history = self.history.get(&Self::history_key(ctx))?;
        if history.len() < self.min_samples {
            return None;
        }

        let n = history.len() as f64;
        let mean = history.iter().sum::<f64>() / n;
        let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let allowed = (self.max_sigmas * variance.sqrt()).max(self.floor_ratio * mean.abs());

        let deviation = (value - mean).abs();
        (deviation > allowed).then(|| {
            format!(
                "{} = {} deviates from recent mean {:.4} by {:.4} (allowed {:.4})",
                self.field, value, mean, deviation, allowed
            )
        })
    }

    /// Remember a deviating reading. Returns the new anchor mean when the
    /// last `reanchor_after` deviations agree, after swapping them in as
    /// the key's history.
    fn note_deviation(&self, ctx: &ValidationContext<'_>, value: f64) -> Option<f64> {
        if self.reanchor_after == 0 {
            return None;
        }
        let key = Self::history_key(ctx);

        let agreed = {
            let mut pending = self.pending.entry(key.clone()).or_default();
            pending.push_back(value);
            while pending.len() > self.reanchor_after {
                pending.pop_front();
            }
            if pending.len() < self.reanchor_after {
                return None;
            }

            let mean = pending.iter().sum::<f64>() / pending.len() as f64;
            let tolerance = self.floor_ratio * mean.abs();
            if pending.iter().any(|v| (v - mean).abs() > tolerance) {
                return None;
            }
            std::mem::take(&mut *pending)
        };

        self.pending.remove(&key);
        let anchor = agreed.iter().sum::<f64>() / agreed.len() as f64;
        self.history.insert(key, agreed);
        Some(anchor)
    }
}

impl PayloadCheck for NumericPlausibility {
    fn name(&self) -> &str {
        "numeric_plausibility"
    }

    fn check(
        &self,
        ctx: &ValidationContext<'_>,
        payload: &Payload,
        issues: &mut Vec<ValidationIssue>,
    ) {
        // Presence is RequiredFields' job.
        let Some(raw) = lookup(payload, &self.field).filter(|v| !v.is_null()) else {
            return;
        };
        let Some(value) = raw.as_f64() else {
            issues.push(ValidationIssue::hard(
                self.name(),
                format!("{} is not numeric: {}", self.field, raw),
            ));
            return;
        };

        if !value.is_finite() {
            issues.push(ValidationIssue::hard(
                self.name(),
                format!("{} is not finite", self.field),
            ));
            return;
        }
        if value <= self.minimum {
            issues.push(ValidationIssue::hard(
                self.name(),
                format!("{} = {} must be greater than {}", self.field, value, self.minimum),
            ));
            return;
        }
        if let Some(maximum) = self.maximum {
            if value > maximum {
                issues.push(ValidationIssue::hard(
                    self.name(),
                    format!("{} = {} exceeds maximum {}", self.field, value, maximum),
                ));
                return;
            }
        }

        match self.deviation_issue(ctx, value) {
            Some(message) => match self.note_deviation(ctx, value) {
                Some(anchor) => issues.push(ValidationIssue::soft(
                    self.name(),
                    format!("{} (re-anchored at {:.4})", message, anchor),
                )),
                None => issues.push(ValidationIssue::hard(self.name(), message)),
            },
            None => {
                self.pending.remove(&Self::history_key(ctx));
            }
        }
    }

    fn observe(&self, ctx: &ValidationContext<'_>, payload: &Payload) {
        let Some(value) = lookup(payload, &self.field).and_then(Payload::as_f64) else {
            return;
        };
        if !value.is_finite() {
            return;
        }

        let mut history = self.history.entry(Self::history_key(ctx)).or_default();
        history.push_back(value);
        while history.len() > self.history_window {
            history.pop_front();
        }
    }
}

// =============================================================================
// Cross-field consistency
// =============================================================================

/// `product` must equal `factor_a × factor_b` within a relative tolerance.
///
/// Skipped when any of the three fields is missing or not numeric.
pub struct CrossFieldConsistency {
    product: String,
    factor_a: String,
    factor_b: String,
    tolerance: f64,
    severity: ValidationSeverity,
}

impl CrossFieldConsistency {
    pub fn new(
        product: impl Into<String>,
        factor_a: impl Into<String>,
        factor_b: impl Into<String>,
        tolerance: f64,
    ) -> Self {
        Self {
            product: product.into(),
            factor_a: factor_a.into(),
            factor_b: factor_b.into(),
            tolerance,
            severity: ValidationSeverity::Hard,
        }
    }

    pub fn with_severity(mut self, severity: ValidationSeverity) -> Self {
        self.severity = severity;
        self
    }
}

impl PayloadCheck for CrossFieldConsistency {
    fn name(&self) -> &str {
        "cross_field_consistency"
    }

    fn check(
        &self,
        _ctx: &ValidationContext<'_>,
        payload: &Payload,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let number = |path: &str| lookup(payload, path).and_then(Payload::as_f64);
        let (Some(product), Some(a), Some(b)) = (
            number(self.product.as_str()),
            number(self.factor_a.as_str()),
            number(self.factor_b.as_str()),
        ) else {
            return;
        };

        let expected = a * b;
        let scale = expected.abs().max(f64::EPSILON);
        let relative = (product - expected).abs() / scale;
        if relative > self.tolerance {
            let message = format!(
                "{} = {} differs from {} × {} = {} by {:.2}%",
                self.product,
                product,
                self.factor_a,
                self.factor_b,
                expected,
                relative * 100.0
            );
            issues.push(ValidationIssue {
                check: self.name().to_string(),
                severity: self.severity,
                message,
            });
        }
    }
}

// =============================================================================
// Empty collections
// =============================================================================

/// Flags an empty array at `field` (or at the root when no field is given).
///
/// Soft by default: an empty batch is a legitimate answer.
pub struct NonEmptyCollection {
    field: Option<String>,
    severity: ValidationSeverity,
}

impl NonEmptyCollection {
    pub fn root() -> Self {
        Self {
            field: None,
            severity: ValidationSeverity::Soft,
        }
    }

    pub fn field(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            severity: ValidationSeverity::Soft,
        }
    }

    pub fn with_severity(mut self, severity: ValidationSeverity) -> Self {
        self.severity = severity;
        self
    }
}

impl PayloadCheck for NonEmptyCollection {
    fn name(&self) -> &str {
        "non_empty_collection"
    }

    fn check(
        &self,
        _ctx: &ValidationContext<'_>,
        payload: &Payload,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let path = self.field.as_deref().unwrap_or("");
        if let Some(Payload::Array(items)) = lookup(payload, path) {
            if items.is_empty() {
                let target = if path.is_empty() { "payload" } else { path };
                issues.push(ValidationIssue {
                    check: self.name().to_string(),
                    severity: self.severity,
                    message: format!("{} is an empty collection", target),
                });
            }
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Per-category check sets.
///
/// Categories without checks accept every payload.
#[derive(Default)]
pub struct Validator {
    checks: RwLock<HashMap<Category, Vec<Arc<dyn PayloadCheck>>>>,
}

impl Validator {
    /// Create a validator with no checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator with the built-in checks for the standard categories:
    ///
    /// - `price`, `quote`: `price` required, positive and plausible
    /// - `fundamentals`: `market_cap ≈ price × shares_outstanding` within 5%
    /// - `news`: warn on an empty batch
    pub fn with_defaults() -> Self {
        let validator = Self::new();
        for category in ["price", "quote"] {
            validator.register(category, RequiredFields::new(["price"]));
            validator.register(category, NumericPlausibility::new("price"));
        }
        validator.register(
            "fundamentals",
            CrossFieldConsistency::new("market_cap", "price", "shares_outstanding", 0.05),
        );
        validator.register("news", NonEmptyCollection::root());
        validator
    }

    /// Add a check for a category. Checks run in registration order.
    pub fn register(&self, category: impl Into<Category>, check: impl PayloadCheck + 'static) {
        self.write()
            .entry(category.into())
            .or_default()
            .push(Arc::new(check));
    }

    /// Run every check registered for the context's category.
    ///
    /// Soft issues are logged here; the caller only needs `is_valid`.
    pub fn validate(&self, ctx: &ValidationContext<'_>, payload: &Payload) -> ValidationResult {
        let checks = self.checks_for(ctx.category);
        let mut issues = Vec::new();
        for check in &checks {
            check.check(ctx, payload, &mut issues);
        }

        for issue in issues.iter().filter(|i| i.severity == ValidationSeverity::Soft) {
            warn!(
                "Validation warning for {}:{}: {}",
                ctx.category, ctx.key, issue.message
            );
        }

        ValidationResult::from_issues(issues)
    }

    /// Feed an accepted payload to checks that keep history.
    pub fn observe(&self, ctx: &ValidationContext<'_>, payload: &Payload) {
        for check in &self.checks_for(ctx.category) {
            check.observe(ctx, payload);
        }
    }

    /// Number of checks registered for a category.
    pub fn check_count(&self, category: &str) -> usize {
        self.read().get(category).map(Vec::len).unwrap_or(0)
    }

    // Cloned out so no lock is held while checks run.
    fn checks_for(&self, category: &str) -> Vec<Arc<dyn PayloadCheck>> {
        self.read().get(category).cloned().unwrap_or_default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Category, Vec<Arc<dyn PayloadCheck>>>> {
        self.checks.read().unwrap_or_else(|poisoned| {
            warn!("Validator lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Category, Vec<Arc<dyn PayloadCheck>>>> {
        self.checks.write().unwrap_or_else(|poisoned| {
            warn!("Validator lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
