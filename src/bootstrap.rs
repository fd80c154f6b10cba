//! Wiring a loaded [`Config`] into a registry and a dispatcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use trove_core::config::Config;
use trove_dispatch::Dispatcher;
use trove_source::{RankTable, Registry, Source};

use crate::sources::{catalog, FilesystemSource};

/// A ready registry with the configured sources, plus its dispatcher.
pub struct Trove {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    /// Configured sources that could not be created, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl std::fmt::Debug for Trove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trove")
            .field("sources", &self.registry.len())
            .field("skipped", &self.skipped)
            .finish_non_exhaustive()
    }
}

/// Bootstrap with rank overrides from the config and from
/// `TROVE_PLUGIN_RANKS`, the latter winning.
pub fn bootstrap(config: Config) -> Result<Trove> {
    bootstrap_with_ranks(config, RankTable::from_env())
}

/// Bootstrap with `overrides` applied on top of the config's `[ranks]`.
pub fn bootstrap_with_ranks(config: Config, overrides: RankTable) -> Result<Trove> {
    let mut ranks = RankTable::from_map(&config.ranks).context("invalid [ranks] table")?;
    ranks.merge(overrides);

    let registry = Arc::new(Registry::new().with_ranks(ranks));
    let mut skipped = Vec::new();

    for fs in &config.sources.filesystem {
        let created = FilesystemSource::new(fs).map(|s| Arc::new(s) as Arc<dyn Source>);
        add(&registry, &fs.id, created, &mut skipped);
    }
    for cat in &config.sources.catalog {
        let created = catalog::load(cat, registry.keys()).map(|s| Arc::new(s) as Arc<dyn Source>);
        add(&registry, &cat.id, created, &mut skipped);
    }

    let dispatcher = Dispatcher::builder(registry.clone())
        .config(config.dispatch.clone())
        .build();

    tracing::debug!(sources = registry.len(), skipped = skipped.len(), "bootstrap complete");
    Ok(Trove {
        config,
        registry,
        dispatcher,
        skipped,
    })
}

fn add(
    registry: &Registry,
    id: &str,
    created: trove_core::Result<Arc<dyn Source>>,
    skipped: &mut Vec<(String, String)>,
) {
    let outcome = created.and_then(|source| registry.register_source(source));
    if let Err(err) = outcome {
        tracing::warn!(source = %id, error = %err, "skipping source");
        skipped.push((id.to_string(), err.to_string()));
    }
}
