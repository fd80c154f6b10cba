//! Rendering media for the terminal.

use serde_json::{json, Map};
use trove_core::{KeyRegistry, Media, Value};

/// JSON view of `media` with metadata under registered key names.
pub fn media_json(keys: &KeyRegistry, media: &Media) -> serde_json::Value {
    let mut metadata = Map::new();
    for (key, value) in media.values() {
        let name = keys.name(key).unwrap_or_else(|| key.to_string());
        metadata.insert(name, value_json(value));
    }

    let mut out = json!({
        "id": media.id(),
        "source": media.source(),
        "kind": media.kind().as_str(),
        "metadata": metadata,
    });
    if let Some(count) = media.child_count() {
        out["child_count"] = json!(count);
    }
    out
}

fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::String(s) | Value::Enum(s) => json!(s),
        Value::Integer(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Boolean(b) => json!(b),
        Value::DateTime(dt) => json!(dt.to_rfc3339()),
        Value::Binary(b) => json!(format!("<{} bytes>", b.len())),
    }
}

/// One line: kind, id, title, then the remaining keys as `name=value`.
pub fn media_line(keys: &KeyRegistry, media: &Media) -> String {
    let mut line = format!(
        "{:<9} {}",
        media.kind().as_str(),
        media.id().unwrap_or("-")
    );
    if let Some(title) = media.title() {
        line.push_str(&format!("  \"{title}\""));
    }
    if let Some(count) = media.child_count() {
        line.push_str(&format!("  [{count}]"));
    }
    for (key, value) in media.values() {
        if key == trove_core::system::TITLE {
            continue;
        }
        let name = keys.name(key).unwrap_or_else(|| key.to_string());
        line.push_str(&format!("  {name}={value}"));
    }
    line
}
