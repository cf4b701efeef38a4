//! Cache key definitions
//!
//! A [`QueryKey`] names one cached query result. A [`CacheLocation`] is what
//! a canonical invalidation key resolves to: one key, a family of keys, or
//! the whole cache.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured key of a cached query (e.g. `["acts", "detail", "7"]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    /// Create a key from its segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Return a new key with one more segment appended
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Segment-wise prefix test
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0.iter().zip(&prefix.0).all(|(a, b)| a == b)
    }

    /// Whether any segment equals `token`
    pub fn has_segment(&self, token: &str) -> bool {
        self.0.iter().any(|s| s == token)
    }

    /// Convert to storage key string
    pub fn to_storage_key(&self) -> String {
        self.0.join(":")
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Set of cached queries targeted by an invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheLocation {
    /// Exactly one query
    Exact(QueryKey),
    /// Every query whose key starts with these segments
    Prefix(QueryKey),
    /// Every query whose key contains all of these tokens as segments
    Containing(Vec<String>),
    /// The entire cache
    All,
}

impl CacheLocation {
    pub fn prefix<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Prefix(QueryKey::new(segments))
    }

    pub fn containing<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Containing(tokens.into_iter().map(Into::into).collect())
    }

    /// Check whether a cached query falls inside this location
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix),
            Self::Containing(tokens) => tokens.iter().all(|t| key.has_segment(t)),
            Self::All => true,
        }
    }
}

impl fmt::Display for CacheLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => write!(f, "exact {}", key),
            Self::Prefix(key) => write!(f, "prefix {}", key),
            Self::Containing(tokens) => write!(f, "containing [{}]", tokens.join(", ")),
            Self::All => write!(f, "all"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        let key = QueryKey::new(["acts", "detail", "7"]);
        assert_eq!(key.to_storage_key(), "acts:detail:7");
        assert_eq!(key.to_string(), "[acts, detail, 7]");
    }

    #[test]
    fn test_child_appends_segment() {
        let prefix = QueryKey::new(["acts", "detail"]);
        assert_eq!(prefix.child("9"), QueryKey::new(["acts", "detail", "9"]));
        // original untouched
        assert_eq!(prefix.segments().len(), 2);
    }

    #[test]
    fn test_prefix_is_segment_wise() {
        let key = QueryKey::new(["acts", "list", "project", "5"]);
        assert!(CacheLocation::prefix(["acts"]).matches(&key));
        assert!(CacheLocation::prefix(["acts", "list"]).matches(&key));
        assert!(!CacheLocation::prefix(["act"]).matches(&key));
        assert!(!CacheLocation::prefix(["acts", "list", "project", "5", "x"]).matches(&key));
    }

    #[test]
    fn test_containing_requires_every_token() {
        let key = QueryKey::new(["worklogs", "project", "12"]);
        assert!(CacheLocation::containing(["12"]).matches(&key));
        assert!(CacheLocation::containing(["worklogs", "12"]).matches(&key));
        assert!(!CacheLocation::containing(["balances", "12"]).matches(&key));
        // token must equal a whole segment
        assert!(!CacheLocation::containing(["1"]).matches(&key));
    }

    #[test]
    fn test_exact_and_all() {
        let key = QueryKey::new(["clients", "list"]);
        assert!(CacheLocation::Exact(key.clone()).matches(&key));
        assert!(!CacheLocation::Exact(QueryKey::new(["clients"])).matches(&key));
        assert!(CacheLocation::All.matches(&key));
    }

    #[test]
    fn test_serde_transparent() {
        let key: QueryKey = serde_json::from_str(r#"["stages","list"]"#).unwrap();
        assert_eq!(key, QueryKey::new(["stages", "list"]));
    }
}
