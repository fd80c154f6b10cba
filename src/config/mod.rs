//! Loading `trove.toml`.
//!
//! The configuration types live in [`trove_core::config`]; this module finds
//! the file, parses it as TOML and makes source paths absolute. Paths may
//! start with `~` and are otherwise taken relative to the directory holding
//! the config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub use trove_core::config::*;

/// Locations tried, in order, when no `--config` is given.
pub const DEFAULT_PATHS: &[&str] = &["./trove.toml", "~/.config/trove/trove.toml"];

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_paths(&mut config, base);

    Ok(config)
}

/// Parse a TOML document without touching the filesystem.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Load config from `custom_path`, else from the first of [`DEFAULT_PATHS`]
/// that exists, else defaults.
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    match find_default_config() {
        Some(path) => load_config(&path),
        None => Ok(Config::default()),
    }
}

/// First existing file among [`DEFAULT_PATHS`].
pub fn find_default_config() -> Option<PathBuf> {
    DEFAULT_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.is_file())
}

fn resolve_paths(config: &mut Config, base: &Path) {
    for fs in &mut config.sources.filesystem {
        fs.root = resolve(&fs.root, base);
    }
    for catalog in &mut config.sources.catalog {
        catalog.path = resolve(&catalog.path, base);
    }
}

fn resolve(path: &Path, base: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
    if expanded.is_absolute() || expanded.as_os_str().is_empty() {
        expanded
    } else {
        base.join(expanded)
    }
}
