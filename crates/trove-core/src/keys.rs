//! Metadata key registry.
//!
//! A [`KeyRegistry`] is the canonical namespace of metadata keys. Names map
//! one-to-one onto [`KeyId`]s, keys are never removed, and registering the
//! same name with the same type twice hands back the original id.
//! [`KeyRegistry::new`] pre-registers the [`system`] keys with fixed ids.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ids::KeyId;
use crate::value::Value;

// ---------------------------------------------------------------------------
// KeyType
// ---------------------------------------------------------------------------

/// Declared value type of a metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    Integer,
    Float,
    Boolean,
    DateTime,
    Binary,
    Enum,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Integer => "integer",
            KeyType::Float => "float",
            KeyType::Boolean => "boolean",
            KeyType::DateTime => "datetime",
            KeyType::Binary => "binary",
            KeyType::Enum => "enum",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MetadataKey
// ---------------------------------------------------------------------------

/// Immutable descriptor of a registered key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataKey {
    id: KeyId,
    name: String,
    key_type: KeyType,
    description: String,
    depends: BTreeSet<KeyId>,
}

impl MetadataKey {
    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Keys that must be known before this one can be computed.
    pub fn depends(&self) -> &BTreeSet<KeyId> {
        &self.depends
    }
}

// ---------------------------------------------------------------------------
// System keys
// ---------------------------------------------------------------------------

/// Keys every registry created with [`KeyRegistry::new`] knows about.
pub mod system {
    use crate::ids::KeyId;

    pub const ID: KeyId = KeyId::from_raw(1);
    pub const TITLE: KeyId = KeyId::from_raw(2);
    pub const URL: KeyId = KeyId::from_raw(3);
    pub const MIME: KeyId = KeyId::from_raw(4);
    pub const ARTIST: KeyId = KeyId::from_raw(5);
    pub const ALBUM: KeyId = KeyId::from_raw(6);
    pub const GENRE: KeyId = KeyId::from_raw(7);
    pub const AUTHOR: KeyId = KeyId::from_raw(8);
    pub const DESCRIPTION: KeyId = KeyId::from_raw(9);
    pub const SOURCE: KeyId = KeyId::from_raw(10);
    pub const THUMBNAIL: KeyId = KeyId::from_raw(11);
    pub const THUMBNAIL_BINARY: KeyId = KeyId::from_raw(12);
    pub const SITE: KeyId = KeyId::from_raw(13);
    pub const DURATION: KeyId = KeyId::from_raw(14);
    pub const CHILDCOUNT: KeyId = KeyId::from_raw(15);
    pub const BITRATE: KeyId = KeyId::from_raw(16);
    pub const WIDTH: KeyId = KeyId::from_raw(17);
    pub const HEIGHT: KeyId = KeyId::from_raw(18);
    pub const FRAMERATE: KeyId = KeyId::from_raw(19);
    pub const RATING: KeyId = KeyId::from_raw(20);
    pub const PLAY_COUNT: KeyId = KeyId::from_raw(21);
    pub const LAST_PLAYED: KeyId = KeyId::from_raw(22);
    pub const LAST_POSITION: KeyId = KeyId::from_raw(23);
    pub const CREATION_DATE: KeyId = KeyId::from_raw(24);
    pub const MODIFICATION_DATE: KeyId = KeyId::from_raw(25);
    pub const TRACK_NUMBER: KeyId = KeyId::from_raw(26);
    pub const LYRICS: KeyId = KeyId::from_raw(27);
    pub const STUDIO: KeyId = KeyId::from_raw(28);
    pub const CERTIFICATE: KeyId = KeyId::from_raw(29);
    pub const LICENSE: KeyId = KeyId::from_raw(30);
    pub const EXTERNAL_URL: KeyId = KeyId::from_raw(31);
}

const SYSTEM_KEYS: &[(KeyId, &str, KeyType, &str)] = &[
    (system::ID, "id", KeyType::String, "Identifier of media"),
    (system::TITLE, "title", KeyType::String, "Title of the media"),
    (system::URL, "url", KeyType::String, "Media URL"),
    (system::MIME, "mime-type", KeyType::String, "Media mime type"),
    (system::ARTIST, "artist", KeyType::String, "Main artist"),
    (system::ALBUM, "album", KeyType::String, "Album the media belongs to"),
    (system::GENRE, "genre", KeyType::String, "Genre of the media"),
    (system::AUTHOR, "author", KeyType::String, "Creator of the media"),
    (system::DESCRIPTION, "description", KeyType::String, "Description of the media"),
    (system::SOURCE, "source", KeyType::String, "Id of the source that produced the media"),
    (system::THUMBNAIL, "thumbnail", KeyType::String, "Thumbnail image URL"),
    (system::THUMBNAIL_BINARY, "thumbnail-binary", KeyType::Binary, "Thumbnail image data"),
    (system::SITE, "site", KeyType::String, "Site where the media can be found"),
    (system::DURATION, "duration", KeyType::Integer, "Duration in seconds"),
    (system::CHILDCOUNT, "childcount", KeyType::Integer, "Number of items inside a container"),
    (system::BITRATE, "bitrate", KeyType::Integer, "Media bitrate in Kbits/s"),
    (system::WIDTH, "width", KeyType::Integer, "Width of video or image, in pixels"),
    (system::HEIGHT, "height", KeyType::Integer, "Height of video or image, in pixels"),
    (system::FRAMERATE, "framerate", KeyType::Float, "Frames per second"),
    (system::RATING, "rating", KeyType::Float, "Media rating"),
    (system::PLAY_COUNT, "play-count", KeyType::Integer, "How many times the media was played"),
    (system::LAST_PLAYED, "last-played-time", KeyType::DateTime, "Last time the media was played"),
    (system::LAST_POSITION, "playback-interrupted-time", KeyType::Integer, "Position in seconds where playback was interrupted"),
    (system::CREATION_DATE, "creation-date", KeyType::DateTime, "Date the media was created"),
    (system::MODIFICATION_DATE, "modification-date", KeyType::DateTime, "Date the media was last modified"),
    (system::TRACK_NUMBER, "track-number", KeyType::Integer, "Track number inside the album"),
    (system::LYRICS, "lyrics", KeyType::String, "Song lyrics"),
    (system::STUDIO, "studio", KeyType::String, "Studio the media is from"),
    (system::CERTIFICATE, "certificate", KeyType::String, "Rating certificate"),
    (system::LICENSE, "license", KeyType::String, "License of the media"),
    (system::EXTERNAL_URL, "external-url", KeyType::String, "Link to an external resource about the media"),
];

// ---------------------------------------------------------------------------
// KeyRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KeyTable {
    /// Index `n` holds the key with id `n + 1`.
    keys: Vec<Arc<MetadataKey>>,
    by_name: HashMap<String, KeyId>,
}

impl KeyTable {
    fn get(&self, id: KeyId) -> Option<&Arc<MetadataKey>> {
        if !id.is_valid() {
            return None;
        }
        self.keys.get(id.raw() as usize - 1)
    }

    fn insert(
        &mut self,
        name: &str,
        key_type: KeyType,
        description: &str,
        depends: BTreeSet<KeyId>,
    ) -> KeyId {
        let id = KeyId::from_raw(self.keys.len() as u32 + 1);
        self.keys.push(Arc::new(MetadataKey {
            id,
            name: name.to_string(),
            key_type,
            description: description.to_string(),
            depends,
        }));
        self.by_name.insert(name.to_string(), id);
        id
    }
}

/// Thread-safe, grow-only table of metadata keys.
pub struct KeyRegistry {
    table: RwLock<KeyTable>,
}

impl KeyRegistry {
    /// Create a registry holding the [`system`] keys.
    pub fn new() -> Self {
        let mut table = KeyTable::default();
        for (expected, name, key_type, description) in SYSTEM_KEYS {
            let id = table.insert(name, *key_type, description, BTreeSet::new());
            debug_assert_eq!(id, *expected, "system key '{name}' got an unexpected id");
        }
        Self {
            table: RwLock::new(table),
        }
    }

    /// Create a registry without any keys.
    pub fn empty() -> Self {
        Self {
            table: RwLock::new(KeyTable::default()),
        }
    }

    /// Register a key, or return the id of an identical earlier registration.
    ///
    /// Fails with [`Error::DuplicateKey`] when the name exists with another
    /// type and with [`Error::InvalidKey`] for non-canonical names or unknown
    /// dependencies.
    pub fn register(
        &self,
        name: &str,
        key_type: KeyType,
        description: &str,
        depends: &[KeyId],
    ) -> Result<KeyId> {
        if !is_canonical(name) {
            return Err(Error::InvalidKey(format!("'{name}' is not a canonical key name")));
        }

        let mut table = self.table.write();
        if let Some(&id) = table.by_name.get(name) {
            let existing = table.keys[id.raw() as usize - 1].key_type;
            if existing != key_type {
                return Err(Error::DuplicateKey {
                    name: name.to_string(),
                    existing,
                    requested: key_type,
                });
            }
            tracing::debug!(key = name, id = %id, "metadata key already registered");
            return Ok(id);
        }

        if let Some(bad) = depends.iter().find(|d| table.get(**d).is_none()) {
            return Err(Error::InvalidKey(format!(
                "dependency {bad} of '{name}' is not registered"
            )));
        }

        let id = table.insert(name, key_type, description, depends.iter().copied().collect());
        tracing::debug!(key = name, id = %id, key_type = %key_type, "registered metadata key");
        Ok(id)
    }

    /// Id for `name`, or [`KeyId::INVALID`] if unknown.
    pub fn lookup(&self, name: &str) -> KeyId {
        self.table
            .read()
            .by_name
            .get(name)
            .copied()
            .unwrap_or(KeyId::INVALID)
    }

    pub fn get(&self, id: KeyId) -> Option<Arc<MetadataKey>> {
        self.table.read().get(id).cloned()
    }

    pub fn name(&self, id: KeyId) -> Option<String> {
        self.table.read().get(id).map(|k| k.name.clone())
    }

    pub fn key_type(&self, id: KeyId) -> Option<KeyType> {
        self.table.read().get(id).map(|k| k.key_type)
    }

    pub fn contains(&self, id: KeyId) -> bool {
        self.table.read().get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered id, in ascending id order.
    pub fn all_keys(&self) -> Vec<KeyId> {
        self.table.read().keys.iter().map(|k| k.id).collect()
    }

    /// Declared dependencies of `id`; empty when there are none or the id is unknown.
    pub fn depends(&self, id: KeyId) -> BTreeSet<KeyId> {
        self.table
            .read()
            .get(id)
            .map(|k| k.depends.clone())
            .unwrap_or_default()
    }

    /// Fail with [`Error::InvalidKey`] unless `id` is registered.
    pub fn check(&self, id: KeyId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(Error::InvalidKey(format!("key id {id} is not registered")))
        }
    }

    /// Resolve a list of names, failing on the first unknown one.
    pub fn key_list<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<KeyId>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                match self.lookup(name) {
                    KeyId::INVALID => Err(Error::InvalidKey(format!("unknown key '{name}'"))),
                    id => Ok(id),
                }
            })
            .collect()
    }

    /// Check that `value` may be stored under `id`.
    pub fn validate(&self, id: KeyId, value: &Value) -> Result<()> {
        let key = self
            .get(id)
            .ok_or_else(|| Error::InvalidKey(format!("key id {id} is not registered")))?;
        let found = value.key_type();
        if found != key.key_type {
            return Err(Error::TypeMismatch {
                key: key.name.clone(),
                expected: key.key_type,
                found,
            });
        }
        Ok(())
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("keys", &self.len())
            .finish()
    }
}

fn is_canonical(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
