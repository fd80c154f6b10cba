//! Shared test harness for integration tests.
//!
//! Provides [`TestEnv`], a temporary directory holding a small media tree,
//! a JSON catalog and a `trove.toml` that registers both, plus helpers to run
//! the `trove` binary against it.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use tempfile::TempDir;

pub const CATALOG: &str = r#"{
    "description": "Jazz records",
    "items": [
        {"id": "kob", "kind": "container", "metadata": {"title": "Kind of Blue", "artist": "Davis"}},
        {"id": "so-what", "parent": "kob", "kind": "audio",
         "metadata": {"title": "So What", "artist": "Davis", "duration": 562}},
        {"id": "naima", "kind": "audio",
         "metadata": {"title": "Naima", "artist": "Coltrane", "duration": 261}}
    ]
}"#;

pub const CONFIG: &str = r#"
[[sources.filesystem]]
root = "media"
rank = 1

[[sources.catalog]]
id = "jazz"
name = "Jazz Catalog"
path = "jazz.json"
rank = 5
"#;

/// A temporary workspace for one test.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    /// Media tree, catalog and config with the default contents.
    pub fn new() -> Self {
        let env = Self::empty();
        env.write_media("jazz/naima.ogg");
        env.write_media("jazz/so-what.mp3");
        env.write_media("cover.jpg");
        env.write_media("notes.txt");
        env.write_file("jazz.json", CATALOG);
        env.write_config(CONFIG);
        env
    }

    /// An empty directory.
    pub fn empty() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn media_root(&self) -> PathBuf {
        self.path().join("media")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("trove.toml")
    }

    /// Create a file under the media root with a few placeholder bytes.
    pub fn write_media(&self, relative: &str) -> PathBuf {
        let path = self.media_root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create media dir");
        }
        fs::write(&path, b"\0\0\0\0").expect("failed to write media file");
        path
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path().join(relative);
        fs::write(&path, content).expect("failed to write file");
        path
    }

    /// Replace `trove.toml`.
    pub fn write_config(&self, toml: &str) -> PathBuf {
        self.write_file("trove.toml", toml)
    }

    /// `trove --config <env>/trove.toml`, isolated from the caller's
    /// environment.
    pub fn trove(&self) -> Command {
        let mut cmd = self.bare();
        cmd.arg("--config").arg(self.config_path());
        cmd
    }

    /// `trove` run from the env directory without `--config`.
    #[allow(deprecated)]
    pub fn bare(&self) -> Command {
        let mut cmd = Command::cargo_bin("trove").expect("trove binary");
        cmd.current_dir(self.path())
            .env_remove("RUST_LOG")
            .env_remove("TROVE_PLUGIN_RANKS");
        cmd
    }

    /// Run and return stdout, asserting success.
    pub fn stdout(&self, args: &[&str]) -> String {
        let output = self.trove().args(args).output().expect("failed to run trove");
        assert!(
            output.status.success(),
            "trove {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).expect("utf-8 output")
    }

    /// Load the env's config through the library, as the binary does.
    pub fn config(&self) -> trove::config::Config {
        trove::config::load_config(&self.config_path()).expect("config loads")
    }
}
