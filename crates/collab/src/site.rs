//! Site identifiers for collaborative editing.
//!
//! A site is one independent replica of the document. Its id tags every
//! position digit it mints and every operation it authors, so two sites must
//! never share an id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a site (replica) in the collaborative system.
///
/// Site ids are used for:
/// - Tagging freshly minted position digits so concurrent splits stay distinct
/// - Breaking ties between equal digits when ordering positions
/// - Keying the version vector
///
/// The string is reference counted because every position component carries
/// one; cloning a `SiteId` never copies the text.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Arc<str>);

impl SiteId {
    /// Create a site id from an existing string.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The empty site id used by the virtual start and end bounds.
    pub fn none() -> Self {
        Self(Arc::from(""))
    }

    /// Derive a fresh site id from a wall-clock reading and random bits.
    pub fn generate(now_ms: u64) -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("{:x}-{}", now_ms, &random[..12]))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if this is the empty bound id.
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({:?})", &*self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SiteId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl AsRef<str> for SiteId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_id_ordering() {
        let a = SiteId::new("a");
        let b = SiteId::new("b");
        assert!(a < b);
        assert!(SiteId::none() < a);
    }

    #[test]
    fn test_generate_is_unique() {
        let first = SiteId::generate(1_700_000_000_000);
        let second = SiteId::generate(1_700_000_000_000);
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("18bcfe56800-"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = SiteId::new("site-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"site-1\"");

        let back: SiteId = serde_json::from_str("\"site-1\"").unwrap();
        assert_eq!(back, id);
    }
}
