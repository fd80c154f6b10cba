//! Media entity model.
//!
//! A [`Media`] is one node of a source's tree: an opaque identifier, the id
//! of the source that produced it, a [`MediaKind`] discriminant and a map of
//! metadata values keyed by [`KeyId`]. Only containers can be browsed into.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::caps::TypeFilter;
use crate::ids::KeyId;
use crate::keys::system;
use crate::value::Value;

// ---------------------------------------------------------------------------
// MediaKind
// ---------------------------------------------------------------------------

/// Variant tag of a media node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaKind {
    Generic,
    Audio,
    Video,
    Image,
    /// A box holding other media. `None` means the child count is unknown.
    Container { child_count: Option<u32> },
}

impl MediaKind {
    /// The type-filter bit for this kind. Generic media has none.
    pub fn type_filter(self) -> TypeFilter {
        match self {
            MediaKind::Generic => TypeFilter::NONE,
            MediaKind::Audio => TypeFilter::AUDIO,
            MediaKind::Video => TypeFilter::VIDEO,
            MediaKind::Image => TypeFilter::IMAGE,
            MediaKind::Container { .. } => TypeFilter::CONTAINER,
        }
    }

    /// Whether media of this kind passes `filter`.
    ///
    /// Generic media carries no type information and only passes
    /// [`TypeFilter::ALL`].
    pub fn passes(self, filter: TypeFilter) -> bool {
        match self {
            MediaKind::Generic => filter == TypeFilter::ALL,
            kind => filter.intersects(kind.type_filter()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Generic => "generic",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "image",
            MediaKind::Container { .. } => "container",
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// A media item or container returned by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(flatten)]
    kind: MediaKind,
    #[serde(default)]
    data: BTreeMap<KeyId, Value>,
}

impl Media {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: None,
            source: None,
            kind,
            data: BTreeMap::new(),
        }
    }

    pub fn generic() -> Self {
        Self::new(MediaKind::Generic)
    }

    pub fn audio() -> Self {
        Self::new(MediaKind::Audio)
    }

    pub fn video() -> Self {
        Self::new(MediaKind::Video)
    }

    pub fn image() -> Self {
        Self::new(MediaKind::Image)
    }

    /// A container with an unknown child count.
    pub fn container() -> Self {
        Self::new(MediaKind::Container { child_count: None })
    }

    /// Set the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set a metadata value.
    pub fn with(mut self, key: KeyId, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Id of the source that produced this media.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, MediaKind::Container { .. })
    }

    /// Child count of a container; `None` for leaves and unknown counts.
    pub fn child_count(&self) -> Option<u32> {
        match self.kind {
            MediaKind::Container { child_count } => child_count,
            _ => None,
        }
    }

    /// Update the child count. Returns `false` (and changes nothing) for leaves.
    pub fn set_child_count(&mut self, count: Option<u32>) -> bool {
        match &mut self.kind {
            MediaKind::Container { child_count } => {
                *child_count = count;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: KeyId) -> Option<&Value> {
        self.data.get(&key)
    }

    pub fn set(&mut self, key: KeyId, value: impl Into<Value>) {
        self.data.insert(key, value.into());
    }

    pub fn remove(&mut self, key: KeyId) -> Option<Value> {
        self.data.remove(&key)
    }

    pub fn has(&self, key: KeyId) -> bool {
        self.data.contains_key(&key)
    }

    /// Keys with a known value, ascending.
    pub fn keys(&self) -> impl Iterator<Item = KeyId> + '_ {
        self.data.keys().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = (KeyId, &Value)> + '_ {
        self.data.iter().map(|(k, v)| (*k, v))
    }

    /// Number of known metadata values.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy every value of `other` whose key is unknown here.
    ///
    /// Returns the number of keys added.
    pub fn merge_missing(&mut self, other: &Media) -> usize {
        let mut added = 0;
        for (key, value) in &other.data {
            if !self.data.contains_key(key) {
                self.data.insert(*key, value.clone());
                added += 1;
            }
        }
        if self.id.is_none() {
            self.id.clone_from(&other.id);
        }
        added
    }

    /// Drop every value whose key is not in `keys`.
    pub fn retain_keys(&mut self, keys: &[KeyId]) {
        self.data.retain(|key, _| keys.contains(key));
    }

    // -- Common keys ---------------------------------------------------------

    pub fn title(&self) -> Option<&str> {
        self.get(system::TITLE).and_then(Value::as_str)
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.set(system::TITLE, title.into());
    }

    pub fn url(&self) -> Option<&str> {
        self.get(system::URL).and_then(Value::as_str)
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.set(system::URL, url.into());
    }

    pub fn mime(&self) -> Option<&str> {
        self.get(system::MIME).and_then(Value::as_str)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> Option<i64> {
        self.get(system::DURATION).and_then(Value::as_i64)
    }
}
