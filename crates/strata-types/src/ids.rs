//! Typed identifiers for execution contexts.
//!
//! `ContextId` wraps a UUIDv7 (time-ordered, globally unique). It displays as
//! standard UUID text for logging; `short()` is for human-facing output only
//! and is never used as a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An execution context identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(uuid::Uuid);

impl ContextId {
    /// Create a new time-ordered ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for human display only, not lookup.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Full 32-character hex string (no hyphens).
    pub fn to_hex(&self) -> String {
        self.0.as_simple().to_string()
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }

    /// Name of the advisory lock this context holds for its whole lifetime.
    ///
    /// Peers learn about a departure when this lock becomes acquirable.
    pub fn lock_name(&self) -> String {
        format!("strata:context:{}", self.to_hex())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<uuid::Uuid> for ContextId {
    fn from(u: uuid::Uuid) -> Self {
        Self(u)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = ContextId::new();
        let b = ContextId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_parse_roundtrip_and_short() {
        let id = ContextId::new();
        let parsed = ContextId::parse(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
        assert!(id.to_hex().starts_with(&id.short()));
    }

    #[test]
    fn test_lock_name_is_per_context() {
        let a = ContextId::new();
        let b = ContextId::new();
        assert_ne!(a.lock_name(), b.lock_name());
        assert!(a.lock_name().starts_with("strata:context:"));
    }
}
