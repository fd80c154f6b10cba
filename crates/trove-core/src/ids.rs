//! Typed identifiers.
//!
//! [`KeyId`] names a registered metadata key, [`OperationId`] names an
//! outstanding dispatcher call. Operation ids carry the [`DispatcherId`] of
//! the dispatcher that issued them so that a foreign id can be detected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// KeyId
// ---------------------------------------------------------------------------

/// Numeric id of a metadata key, stable for the lifetime of its registry.
///
/// Real ids start at 1; [`KeyId::INVALID`] is returned for unknown names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(u32);

impl KeyId {
    /// Sentinel id that never refers to a registered key.
    pub const INVALID: KeyId = KeyId(0);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DispatcherId / OperationId
// ---------------------------------------------------------------------------

/// Identity of a dispatcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatcherId(Uuid);

impl DispatcherId {
    /// Create a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DispatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-visible handle of one outstanding operation.
///
/// Sequence numbers are allocated monotonically per dispatcher and never
/// reused, so an id stays unambiguous for as long as anybody holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    dispatcher: DispatcherId,
    seq: u64,
}

impl OperationId {
    #[must_use]
    pub fn new(dispatcher: DispatcherId, seq: u64) -> Self {
        Self { dispatcher, seq }
    }

    #[must_use]
    pub fn dispatcher(&self) -> DispatcherId {
        self.dispatcher
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_key_is_distinct() {
        assert!(!KeyId::INVALID.is_valid());
        assert!(KeyId::from_raw(1).is_valid());
        assert_ne!(KeyId::INVALID, KeyId::from_raw(1));
    }

    #[test]
    fn key_id_serde_transparent() {
        let json = serde_json::to_string(&KeyId::from_raw(7)).unwrap();
        assert_eq!(json, "7");
        let back: KeyId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw(), 7);
    }

    #[test]
    fn operation_ids_from_different_dispatchers_differ() {
        let a = OperationId::new(DispatcherId::new(), 1);
        let b = OperationId::new(DispatcherId::new(), 1);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "op-1");
    }
}
