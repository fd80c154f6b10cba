//! JSON catalog files served from memory.
//!
//! ```json
//! {
//!   "description": "Jazz records",
//!   "items": [
//!     { "id": "kind-of-blue", "kind": "container", "metadata": { "title": "Kind of Blue" } },
//!     { "id": "so-what", "parent": "kind-of-blue", "kind": "audio",
//!       "metadata": { "title": "So What", "artist": "Miles Davis", "duration": 562 } }
//!   ]
//! }
//! ```
//!
//! Metadata names are registered key names. Values are checked against the
//! key type; datetimes are RFC 3339 strings. Edits made through the source
//! stay in memory.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use trove_core::config::CatalogSourceConfig;
use trove_core::{system, Error, KeyId, KeyRegistry, KeyType, Media, MediaKind, Result, Value};
use trove_source::MemorySource;

/// Keys a catalog accepts through `store_metadata`.
const WRITABLE: &[KeyId] = &[
    system::TITLE,
    system::DESCRIPTION,
    system::RATING,
    system::PLAY_COUNT,
    system::LAST_PLAYED,
    system::LAST_POSITION,
];

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    items: Vec<CatalogItem>,
}

#[derive(Debug, Deserialize)]
struct CatalogItem {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    kind: ItemKind,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ItemKind {
    #[default]
    Generic,
    Audio,
    Video,
    Image,
    Container,
}

impl From<ItemKind> for MediaKind {
    fn from(kind: ItemKind) -> Self {
        match kind {
            ItemKind::Generic => MediaKind::Generic,
            ItemKind::Audio => MediaKind::Audio,
            ItemKind::Video => MediaKind::Video,
            ItemKind::Image => MediaKind::Image,
            ItemKind::Container => MediaKind::Container { child_count: None },
        }
    }
}

/// Read the catalog at `config.path` into a [`MemorySource`].
pub fn load(config: &CatalogSourceConfig, keys: &Arc<KeyRegistry>) -> Result<MemorySource> {
    let content = std::fs::read_to_string(&config.path).map_err(|e| {
        Error::config(format!("catalog '{}': {:?}: {e}", config.id, config.path))
    })?;
    let source = from_json(config, &content, keys)
        .map_err(|e| Error::config(format!("catalog '{}': {e}", config.id)))?;
    tracing::info!(
        source = %config.id,
        path = %config.path.display(),
        items = source.len(),
        "loaded catalog"
    );
    Ok(source)
}

/// Build a catalog source from JSON text.
pub fn from_json(
    config: &CatalogSourceConfig,
    json: &str,
    keys: &Arc<KeyRegistry>,
) -> Result<MemorySource> {
    let file: CatalogFile = serde_json::from_str(json)?;
    check_tree(&file.items)?;

    let name = config.name.clone().unwrap_or_else(|| config.id.clone());
    let description = file
        .description
        .unwrap_or_else(|| format!("Catalog {}", display_name(&config.path)));
    let mut builder = MemorySource::builder(config.id.clone(), name)
        .description(description)
        .rank(config.rank)
        .key_registry(keys.clone())
        .writable_keys(WRITABLE);

    // Writable keys are readable too, even before any item carries them.
    let mut supported: Vec<KeyId> = WRITABLE.to_vec();
    for item in file.items {
        let mut media = Media::new(item.kind.into()).with_id(item.id.clone());
        for (name, raw) in &item.metadata {
            let key = keys.lookup(name);
            if !key.is_valid() {
                return Err(Error::InvalidKey(format!(
                    "item '{}': unknown key '{name}'",
                    item.id
                )));
            }
            let key_type = keys.key_type(key).unwrap_or(KeyType::String);
            let value = convert(name, key_type, raw)?;
            keys.validate(key, &value)?;
            media.set(key, value);
            supported.push(key);
        }
        builder = builder.item(item.parent.as_deref(), media);
    }
    supported.sort();
    supported.dedup();

    Ok(builder.keys(&supported).build())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Ids must be unique and parents must be containers listed earlier.
fn check_tree(items: &[CatalogItem]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut containers = HashSet::new();
    for item in items {
        if item.id.is_empty() {
            return Err(Error::validation("catalog item with an empty id"));
        }
        if !seen.insert(item.id.as_str()) {
            return Err(Error::validation(format!("duplicate item id '{}'", item.id)));
        }
        if let Some(parent) = &item.parent {
            if !containers.contains(parent.as_str()) {
                return Err(Error::validation(format!(
                    "item '{}': parent '{parent}' is not a container listed before it",
                    item.id
                )));
            }
        }
        if matches!(item.kind, ItemKind::Container) {
            containers.insert(item.id.as_str());
        }
    }
    Ok(())
}

fn convert(name: &str, key_type: KeyType, raw: &serde_json::Value) -> Result<Value> {
    let mismatch = || Error::validation(format!("key '{name}' expects a {key_type} value, got {raw}"));
    let value = match key_type {
        KeyType::String => Value::String(raw.as_str().ok_or_else(mismatch)?.to_string()),
        KeyType::Enum => Value::Enum(raw.as_str().ok_or_else(mismatch)?.to_string()),
        KeyType::Integer => Value::Integer(raw.as_i64().ok_or_else(mismatch)?),
        KeyType::Float => Value::Float(raw.as_f64().ok_or_else(mismatch)?),
        KeyType::Boolean => Value::Boolean(raw.as_bool().ok_or_else(mismatch)?),
        KeyType::DateTime => {
            let text = raw.as_str().ok_or_else(mismatch)?;
            let parsed = DateTime::parse_from_rfc3339(text)
                .map_err(|e| Error::validation(format!("key '{name}': {e}")))?;
            Value::DateTime(parsed.with_timezone(&Utc))
        }
        KeyType::Binary => {
            return Err(Error::validation(format!(
                "key '{name}' holds binary data, which catalogs cannot carry"
            )))
        }
    };
    Ok(value)
}
