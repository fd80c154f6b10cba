//! Capability declarations.
//!
//! A source reports one [`Caps`] per operation it supports. A `Caps`
//! describes the envelope of [`OperationOptions`](crate::OperationOptions)
//! values the source can honour itself; the default value supports nothing
//! beyond option defaults.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ids::KeyId;
use crate::options::Count;
use crate::value::KeyFilter;

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

bitflags! {
    /// Set of operations a source implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SupportedOps: u16 {
        const BROWSE = 1 << 0;
        const SEARCH = 1 << 1;
        const QUERY = 1 << 2;
        const RESOLVE = 1 << 3;
        const STORE_METADATA = 1 << 4;
        const STORE = 1 << 5;
        const REMOVE = 1 << 6;
        const MEDIA_FROM_URI = 1 << 7;
    }
}

impl SupportedOps {
    /// The individual operations contained in this set.
    pub fn kinds(self) -> impl Iterator<Item = OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.as_flag()))
    }
}

/// A single operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Browse,
    Search,
    Query,
    Resolve,
    StoreMetadata,
    Store,
    Remove,
    MediaFromUri,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Browse,
        OperationKind::Search,
        OperationKind::Query,
        OperationKind::Resolve,
        OperationKind::StoreMetadata,
        OperationKind::Store,
        OperationKind::Remove,
        OperationKind::MediaFromUri,
    ];

    pub fn as_flag(self) -> SupportedOps {
        match self {
            OperationKind::Browse => SupportedOps::BROWSE,
            OperationKind::Search => SupportedOps::SEARCH,
            OperationKind::Query => SupportedOps::QUERY,
            OperationKind::Resolve => SupportedOps::RESOLVE,
            OperationKind::StoreMetadata => SupportedOps::STORE_METADATA,
            OperationKind::Store => SupportedOps::STORE,
            OperationKind::Remove => SupportedOps::REMOVE,
            OperationKind::MediaFromUri => SupportedOps::MEDIA_FROM_URI,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Browse => "browse",
            OperationKind::Search => "search",
            OperationKind::Query => "query",
            OperationKind::Resolve => "resolve",
            OperationKind::StoreMetadata => "store-metadata",
            OperationKind::Store => "store",
            OperationKind::Remove => "remove",
            OperationKind::MediaFromUri => "media-from-uri",
        }
    }

    /// Browse, search and query deliver a stream of items; everything else
    /// answers with a single result.
    pub fn is_paged(self) -> bool {
        matches!(
            self,
            OperationKind::Browse | OperationKind::Search | OperationKind::Query
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Option bit sets
// ---------------------------------------------------------------------------

bitflags! {
    /// Media kinds a caller wants to see.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TypeFilter: u8 {
        const AUDIO = 1 << 0;
        const VIDEO = 1 << 1;
        const IMAGE = 1 << 2;
        const CONTAINER = 1 << 3;
        const ALL = Self::AUDIO.bits() | Self::VIDEO.bits() | Self::IMAGE.bits() | Self::CONTAINER.bits();
    }
}

impl TypeFilter {
    pub const NONE: TypeFilter = TypeFilter::empty();
}

impl Default for TypeFilter {
    fn default() -> Self {
        TypeFilter::NONE
    }
}

bitflags! {
    /// How the dispatcher should resolve and deliver results.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ResolutionFlags: u8 {
        /// Resolve keys the target source lacks through other sources.
        const FULL = 1 << 0;
        /// Deliver callbacks through the caller's relay, never inline.
        const IDLE_RELAY = 1 << 1;
        /// Skip keys that are slow to compute.
        const FAST_ONLY = 1 << 2;
    }
}

impl ResolutionFlags {
    pub const NORMAL: ResolutionFlags = ResolutionFlags::empty();
}

// ---------------------------------------------------------------------------
// Caps
// ---------------------------------------------------------------------------

/// One option value to test against a [`Caps`].
#[derive(Debug, Clone, Copy)]
pub enum CapsOption<'a> {
    Skip(u32),
    Count(Count),
    Flags(ResolutionFlags),
    TypeFilter(TypeFilter),
    KeyFilter(KeyId, &'a KeyFilter),
}

/// Envelope of option values a source accepts for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caps {
    pagination: bool,
    flags: bool,
    type_filter: TypeFilter,
    key_filters: BTreeSet<KeyId>,
}

impl Caps {
    /// Caps supporting nothing beyond option defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `skip` and `count` support.
    pub fn with_pagination(mut self, supported: bool) -> Self {
        self.pagination = supported;
        self
    }

    /// Declare that the source wants to see resolution flags.
    pub fn with_flags(mut self, supported: bool) -> Self {
        self.flags = supported;
        self
    }

    pub fn with_type_filter(mut self, filter: TypeFilter) -> Self {
        self.type_filter = filter;
        self
    }

    pub fn with_key_filters(mut self, keys: impl IntoIterator<Item = KeyId>) -> Self {
        self.key_filters.extend(keys);
        self
    }

    pub fn supports_pagination(&self) -> bool {
        self.pagination
    }

    pub fn supports_flags(&self) -> bool {
        self.flags
    }

    pub fn type_filter(&self) -> TypeFilter {
        self.type_filter
    }

    pub fn key_filters(&self) -> &BTreeSet<KeyId> {
        &self.key_filters
    }

    /// Whether `option` lies inside this envelope.
    ///
    /// A type filter passes when it is a subset of the declared mask, so
    /// [`TypeFilter::NONE`] always passes and a filter with any bit outside
    /// the mask fails as a whole.
    pub fn test(&self, option: CapsOption<'_>) -> bool {
        match option {
            CapsOption::Skip(_) | CapsOption::Count(_) => self.pagination,
            CapsOption::Flags(_) => self.flags,
            CapsOption::TypeFilter(filter) => self.type_filter.contains(filter),
            CapsOption::KeyFilter(key, _) => self.key_filter_is_allowed(key),
        }
    }

    pub fn key_filter_is_allowed(&self, key: KeyId) -> bool {
        self.key_filters.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::system;
    use crate::value::Value;

    #[test]
    fn empty_caps_support_nothing() {
        let caps = Caps::new();
        assert!(!caps.test(CapsOption::Skip(0)));
        assert!(!caps.test(CapsOption::Count(Count::Unbounded)));
        assert!(!caps.test(CapsOption::Flags(ResolutionFlags::NORMAL)));
        assert!(!caps.test(CapsOption::TypeFilter(TypeFilter::AUDIO)));
        assert!(!caps.key_filter_is_allowed(system::ARTIST));
    }

    #[test]
    fn type_filter_is_subset_test() {
        let caps = Caps::new().with_type_filter(TypeFilter::VIDEO);
        assert!(caps.test(CapsOption::TypeFilter(TypeFilter::VIDEO)));
        assert!(!caps.test(CapsOption::TypeFilter(TypeFilter::AUDIO | TypeFilter::VIDEO)));
        assert!(caps.test(CapsOption::TypeFilter(TypeFilter::NONE)));
    }

    #[test]
    fn key_filters_are_per_key() {
        let caps = Caps::new().with_key_filters([system::ARTIST, system::CREATION_DATE]);
        let filter = KeyFilter::Exact(Value::from("x"));
        assert!(caps.test(CapsOption::KeyFilter(system::ARTIST, &filter)));
        assert!(!caps.test(CapsOption::KeyFilter(system::ALBUM, &filter)));
    }

    #[test]
    fn supported_ops_kinds() {
        let ops = SupportedOps::BROWSE | SupportedOps::RESOLVE;
        let kinds: Vec<_> = ops.kinds().collect();
        assert_eq!(kinds, vec![OperationKind::Browse, OperationKind::Resolve]);
        assert!(OperationKind::Search.is_paged());
        assert!(!OperationKind::Store.is_paged());
        assert_eq!(OperationKind::MediaFromUri.to_string(), "media-from-uri");
    }
}
