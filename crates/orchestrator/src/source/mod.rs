//! Data source abstractions.
//!
//! This module contains:
//! - The `Fetcher` trait every provider implements
//! - `DataSource`, the registration record pairing a fetcher with its identity
//! - `FnFetcher`, an adapter for closure-based providers
//!
//! Concrete providers live with the host application; the orchestrator only
//! sees `Arc<dyn Fetcher>`.

mod data_source;
mod fn_fetcher;
mod traits;

pub use data_source::{DataSource, DEFAULT_PRIORITY};
pub use fn_fetcher::FnFetcher;
pub use traits::Fetcher;
