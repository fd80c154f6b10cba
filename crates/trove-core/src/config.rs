//! Configuration types.
//!
//! [`Config`] carries source ranks, dispatcher tuning, the bundled source
//! instances to create and logging defaults. Every section defaults
//! sensibly, so an empty document is a valid configuration. The types are
//! plain serde structs; the binary reads them from TOML, tests usually from
//! JSON via [`Config::from_json`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Source id or glob pattern (`"fs-*"`) to rank.
    pub ranks: BTreeMap<String, i32>,
    pub dispatch: DispatchConfig,
    pub sources: SourcesConfig,
    pub log: LogConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Load JSON configuration from a file path, falling back to defaults if
    /// the path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.dispatch.auto_split_threshold == Some(0) {
            warnings.push("dispatch.auto_split_threshold is 0; auto-split disabled".into());
        }
        if self.dispatch.sync_timeout_secs == Some(0) {
            warnings.push("dispatch.sync_timeout_secs is 0; sync calls wait forever".into());
        }

        for pattern in self.ranks.keys() {
            if pattern.trim().is_empty() {
                warnings.push("ranks contains an empty source pattern".into());
            }
        }

        let mut seen = HashSet::new();
        for (i, fs) in self.sources.filesystem.iter().enumerate() {
            if fs.id.is_empty() {
                warnings.push(format!("sources.filesystem[{i}].id is empty"));
            } else if !seen.insert(fs.id.as_str()) {
                warnings.push(format!("source id '{}' is configured twice", fs.id));
            }
            if fs.root.as_os_str().is_empty() {
                warnings.push(format!("sources.filesystem[{i}].root is empty"));
            }
        }
        for (i, catalog) in self.sources.catalog.iter().enumerate() {
            if catalog.id.is_empty() {
                warnings.push(format!("sources.catalog[{i}].id is empty"));
            } else if !seen.insert(catalog.id.as_str()) {
                warnings.push(format!("source id '{}' is configured twice", catalog.id));
            }
            if catalog.path.as_os_str().is_empty() {
                warnings.push(format!("sources.catalog[{i}].path is empty"));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Dispatcher tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Split large bounded requests into chunks of at most this many items
    /// for sources that do not declare their own threshold.
    pub auto_split_threshold: Option<u32>,
    /// Give up on blocking (`*_sync`) calls after this many seconds.
    pub sync_timeout_secs: Option<u64>,
}

/// Bundled source instances to register at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub filesystem: Vec<FilesystemSourceConfig>,
    pub catalog: Vec<CatalogSourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemSourceConfig {
    #[serde(default = "default_filesystem_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub root: PathBuf,
    #[serde(default)]
    pub rank: i32,
    /// Include dot-files when listing directories.
    #[serde(default)]
    pub show_hidden: bool,
}

fn default_filesystem_id() -> String {
    "filesystem".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// JSON catalog file.
    pub path: PathBuf,
    #[serde(default)]
    pub rank: i32,
}

/// Logging defaults used when `RUST_LOG` is not set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "trove=info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_no_warnings() {
        let cfg = Config::default();
        let warnings = cfg.validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert_eq!(cfg.log.filter, "trove=info");
    }

    #[test]
    fn parse_empty_json_uses_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn parse_sources_and_ranks() {
        let json = r#"{
            "ranks": {"filesystem": 5, "cat-*": -1},
            "dispatch": {"auto_split_threshold": 50},
            "sources": {
                "filesystem": [{"root": "/srv/media"}],
                "catalog": [{"id": "cat-films", "path": "films.json", "rank": 2}]
            }
        }"#;
        let cfg = Config::from_json(json).unwrap();
        assert_eq!(cfg.ranks.get("cat-*"), Some(&-1));
        assert_eq!(cfg.dispatch.auto_split_threshold, Some(50));
        assert_eq!(cfg.sources.filesystem[0].id, "filesystem");
        assert_eq!(cfg.sources.catalog[0].rank, 2);
    }

    #[test]
    fn duplicate_source_ids_warn() {
        let json = r#"{"sources": {
            "filesystem": [{"id": "media", "root": "/a"}],
            "catalog": [{"id": "media", "path": "b.json"}]
        }}"#;
        let cfg = Config::from_json(json).unwrap();
        assert!(cfg.validate().iter().any(|w| w.contains("configured twice")));
    }

    #[test]
    fn zero_threshold_warns() {
        let mut cfg = Config::default();
        cfg.dispatch.auto_split_threshold = Some(0);
        assert!(cfg.validate().iter().any(|w| w.contains("auto_split_threshold")));
    }

    #[test]
    fn parse_error_is_config_error() {
        assert!(matches!(Config::from_json("{nope"), Err(Error::Config(_))));
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/trove.json")));
        assert_eq!(cfg, Config::default());
        assert_eq!(Config::load_or_default(None), Config::default());
    }
}
