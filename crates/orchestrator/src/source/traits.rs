//! Fetcher trait definition.
//!
//! This module defines the `Fetcher` trait that every concrete data provider
//! implements. The orchestrator never knows which provider it is talking to.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::FetchError;
use crate::models::Payload;

/// Capability to fetch one data item from an external provider.
///
/// Implementations must not retry internally (fallback and retries are the
/// orchestrator's concern) and must never swallow errors: a failed fetch
/// returns `Err`, a genuinely empty result returns `Ok(Value::Null)` or an
/// empty collection.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use datagate_orchestrator::source::Fetcher;
///
/// struct QuoteApi {
///     client: reqwest::Client,
/// }
///
/// #[async_trait]
/// impl Fetcher for QuoteApi {
///     async fn fetch(&self, key: &str, timeout: Duration) -> Result<Payload, FetchError> {
///         // ... call the provider and decode its response
///     }
/// }
/// ```
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the item identified by `key`.
    ///
    /// `timeout` is the budget the orchestrator will enforce; it is passed
    /// so that implementations can forward it to their HTTP client.
    async fn fetch(&self, key: &str, timeout: Duration) -> Result<Payload, FetchError>;
}
