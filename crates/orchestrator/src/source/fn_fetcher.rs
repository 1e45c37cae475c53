//! Closure-backed fetcher.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::Fetcher;
use crate::errors::FetchError;
use crate::models::Payload;

/// Adapts an async closure `Fn(String) -> Future<Output = Result<Payload, FetchError>>`
/// into a [`Fetcher`].
///
/// Handy for wiring in-process providers and for tests.
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, FetchError>> + Send + 'static,
{
    async fn fetch(&self, key: &str, _timeout: Duration) -> Result<Payload, FetchError> {
        (self.f)(key.to_string()).await
    }
}
