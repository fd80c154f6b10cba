//! Source registry.
//!
//! The [`Registry`] owns the metadata [`KeyRegistry`] and the set of
//! registered sources. It is an explicitly constructed value: the process
//! entry point builds one and hands an `Arc<Registry>` to whoever needs it,
//! tests build as many independent instances as they like.
//!
//! Sources are held in registration order together with their effective
//! rank (configured override, else the rank the source declares). Ordered
//! listings sort by descending rank with a stable sort, so registration
//! order breaks ties.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use trove_core::{Error, KeyId, KeyRegistry, KeyType, Result, SupportedOps};

use crate::events::{Event, EventBus, RegistryEvent};
use crate::ranks::RankTable;
use crate::source::Source;

// ---------------------------------------------------------------------------
// KeyPartition
// ---------------------------------------------------------------------------

/// Two disjoint key lists whose union is the (deduplicated) input.
///
/// What "accepted" means depends on the helper that produced it: supported
/// keys for [`Registry::filter_supported`], fast keys for
/// [`Registry::filter_slow`], writable keys for [`Registry::filter_writable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPartition {
    pub accepted: Vec<KeyId>,
    pub rejected: Vec<KeyId>,
}

impl KeyPartition {
    fn split(keys: &[KeyId], accept: impl Fn(KeyId) -> bool) -> Self {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut partition = KeyPartition::default();
        for &key in keys {
            if !seen.insert(key) {
                continue;
            }
            if accept(key) {
                partition.accepted.push(key);
            } else {
                partition.rejected.push(key);
            }
        }
        partition
    }

    pub fn len(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct SourceEntry {
    source: Arc<dyn Source>,
    rank: i32,
}

/// Process-wide table of metadata keys and sources.
pub struct Registry {
    keys: Arc<KeyRegistry>,
    ranks: RankTable,
    sources: RwLock<Vec<SourceEntry>>,
    events: EventBus,
}

impl Registry {
    /// A registry with the system keys and no rank overrides.
    pub fn new() -> Self {
        Self::with_keys(Arc::new(KeyRegistry::new()))
    }

    pub fn with_keys(keys: Arc<KeyRegistry>) -> Self {
        Self {
            keys,
            ranks: RankTable::new(),
            sources: RwLock::new(Vec::new()),
            events: EventBus::default(),
        }
    }

    /// Builder: apply rank overrides to sources registered from now on.
    pub fn with_ranks(mut self, ranks: RankTable) -> Self {
        self.ranks = ranks;
        self
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    /// Register a metadata key, announcing it if it is new.
    pub fn register_key(
        &self,
        name: &str,
        key_type: KeyType,
        description: &str,
        depends: &[KeyId],
    ) -> Result<KeyId> {
        let known = self.keys.lookup(name);
        let id = self.keys.register(name, key_type, description, depends)?;
        if !known.is_valid() {
            self.events.publish(RegistryEvent::KeyRegistered {
                key: id,
                name: name.to_string(),
            });
        }
        Ok(id)
    }

    // -- Sources -------------------------------------------------------------

    /// Add a source. Fails with [`Error::DuplicateSource`] if the id is taken.
    pub fn register_source(&self, source: Arc<dyn Source>) -> Result<()> {
        let id = source.id().to_string();
        let rank = self.ranks.rank_for(&id).unwrap_or(source.info().rank);
        {
            let mut sources = self.sources.write();
            if sources.iter().any(|e| e.source.id() == id) {
                return Err(Error::DuplicateSource(id));
            }
            sources.push(SourceEntry { source, rank });
        }
        tracing::info!(source = %id, rank, "registered source");
        self.events.publish(RegistryEvent::SourceAdded { source_id: id });
        Ok(())
    }

    /// Remove a source. Returns whether anything was removed; removing an
    /// unknown id is not an error. Operations already running against the
    /// source keep their own reference and are not affected.
    pub fn unregister_source(&self, id: &str) -> bool {
        let removed = {
            let mut sources = self.sources.write();
            let before = sources.len();
            sources.retain(|e| e.source.id() != id);
            sources.len() != before
        };
        if removed {
            tracing::info!(source = %id, "unregistered source");
            self.events.publish(RegistryEvent::SourceRemoved {
                source_id: id.to_string(),
            });
        }
        removed
    }

    pub fn lookup_source(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.sources
            .read()
            .iter()
            .find(|e| e.source.id() == id)
            .map(|e| e.source.clone())
    }

    /// Like [`Registry::lookup_source`] but failing with [`Error::UnknownSource`].
    pub fn require_source(&self, id: &str) -> Result<Arc<dyn Source>> {
        self.lookup_source(id)
            .ok_or_else(|| Error::UnknownSource(id.to_string()))
    }

    /// Effective rank of a registered source.
    pub fn rank(&self, id: &str) -> Option<i32> {
        self.sources
            .read()
            .iter()
            .find(|e| e.source.id() == id)
            .map(|e| e.rank)
    }

    /// All sources, by descending rank if `ordered`, else in registration order.
    pub fn sources(&self, ordered: bool) -> Vec<Arc<dyn Source>> {
        self.select(ordered, |_| true)
    }

    /// Sources implementing at least one operation of `operations`.
    pub fn sources_by_operation(
        &self,
        operations: SupportedOps,
        ordered: bool,
    ) -> Vec<Arc<dyn Source>> {
        self.select(ordered, |source| {
            source.supported_operations().intersects(operations)
        })
    }

    fn select(&self, ordered: bool, keep: impl Fn(&dyn Source) -> bool) -> Vec<Arc<dyn Source>> {
        let sources = self.sources.read();
        let mut selected: Vec<&SourceEntry> =
            sources.iter().filter(|e| keep(e.source.as_ref())).collect();
        if ordered {
            selected.sort_by(|a, b| b.rank.cmp(&a.rank));
        }
        selected.into_iter().map(|e| e.source.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Key filtering -------------------------------------------------------

    fn check_keys(&self, keys: &[KeyId]) -> Result<()> {
        keys.iter().try_for_each(|key| self.keys.check(*key))
    }

    /// Split `keys` into those `source` can produce and the rest. With
    /// `use_slow == false` slow keys count as unsupported.
    pub fn filter_supported(
        &self,
        source: &dyn Source,
        keys: &[KeyId],
        use_slow: bool,
    ) -> Result<KeyPartition> {
        self.check_keys(keys)?;
        let supported = source.supported_keys();
        let slow = source.slow_keys();
        Ok(KeyPartition::split(keys, |key| {
            supported.contains(&key) && (use_slow || !slow.contains(&key))
        }))
    }

    /// Split `keys` into fast (accepted) and slow (rejected) keys for `source`.
    pub fn filter_slow(&self, source: &dyn Source, keys: &[KeyId]) -> Result<KeyPartition> {
        self.check_keys(keys)?;
        let slow = source.slow_keys();
        Ok(KeyPartition::split(keys, |key| !slow.contains(&key)))
    }

    /// Split `keys` into those `source` can write and the rest.
    pub fn filter_writable(&self, source: &dyn Source, keys: &[KeyId]) -> Result<KeyPartition> {
        self.check_keys(keys)?;
        let writable = source.writable_keys();
        Ok(KeyPartition::split(keys, |key| writable.contains(&key)))
    }

    // -- Events --------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.events.recent_events(n)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys.len())
            .field("sources", &self.len())
            .finish()
    }
}
