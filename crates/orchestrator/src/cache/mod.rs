//! Result caching.
//!
//! - [`DataCache`]: TTL store with jitter, negative entries and an optional size cap
//! - [`CacheConfig`]: per-category TTL table and cache limits
//! - [`apply_jitter`]: the TTL spreading used for every write

mod data_cache;
mod ttl;

pub use data_cache::{CacheLookup, CacheStats, CachedPayload, DataCache, SweeperHandle};
pub use ttl::{
    apply_jitter, default_ttl_table, CacheConfig, DEFAULT_JITTER_RATIO, DEFAULT_NEGATIVE_TTL,
    DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
};
