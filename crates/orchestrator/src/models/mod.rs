//! Request, result and identity types shared by every component.

mod request;
mod result;
mod types;

pub use request::{CacheMode, FetchRequest};
pub use result::{AttemptOutcome, AttemptRecord, FetchResult, FetchTrace};
pub use types::{CacheKey, Category, Payload, SourceKey, SourceName};
