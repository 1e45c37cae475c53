//! Basic type aliases and identity keys.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Data category identifier (e.g., "price", "news", "fundamentals").
pub type Category = Cow<'static, str>;

/// Source name, unique within a category (e.g., "alpha_vantage").
pub type SourceName = Cow<'static, str>;

/// Payload returned by a fetcher.
///
/// `Value::Null` or an empty collection is a valid empty result; failures are
/// always reported through `Err`.
pub type Payload = serde_json::Value;

/// Identity of a registered source: `(category, name)`.
///
/// Circuit and health state are keyed by this, so the same provider name
/// registered for two categories is tracked independently.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub category: Category,
    pub name: SourceName,
}

impl SourceKey {
    pub fn new(category: impl Into<Category>, name: impl Into<SourceName>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// Cache identity of a data item: `(category, key)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub category: Category,
    pub key: String,
}

impl CacheKey {
    pub fn new(category: impl Into<Category>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_display_and_equality() {
        let a = SourceKey::new("price", "A");
        let b = SourceKey::new(String::from("price"), String::from("A"));

        assert_eq!(a, b);
        assert_eq!(a.to_string(), "price/A");
        assert_ne!(a, SourceKey::new("news", "A"));
    }

    #[test]
    fn test_cache_key_display() {
        assert_eq!(CacheKey::new("price", "AAPL").to_string(), "price:AAPL");
    }
}
