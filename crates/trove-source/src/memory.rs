//! In-memory source.
//!
//! [`MemorySource`] keeps a tree of [`Media`] in memory and implements every
//! operation over it. It backs the bundled catalog source and serves as the
//! reference source in tests. Results are produced either inline, from the
//! calling stack, or from a task on a tokio runtime with an optional delay
//! between items.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use trove_core::{
    Caps, Error, KeyId, KeyRegistry, Media, OperationKind, OperationOptions, Result,
    SupportedOps, TypeFilter, Value,
};

use crate::sink::{ReplySink, ResultSink};
use crate::source::{
    BrowseRequest, MediaFromUriRequest, QueryRequest, RemoveRequest, ResolveRequest,
    SearchRequest, Source, SourceInfo, StoreMetadataRequest, StoreRequest,
};

/// Where a [`MemorySource`] produces its results.
#[derive(Clone)]
pub enum Execution {
    /// Answer from the calling stack before the operation call returns.
    Inline,
    /// Answer from a task on `handle`, sleeping `delay` before each item.
    Spawn {
        handle: Handle,
        delay: Option<Duration>,
    },
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Execution::Inline => f.write_str("Inline"),
            Execution::Spawn { delay, .. } => {
                f.debug_struct("Spawn").field("delay", delay).finish_non_exhaustive()
            }
        }
    }
}

type Derivation = Arc<dyn Fn(&Media) -> Option<Value> + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    parent: Option<String>,
    media: Media,
}

#[derive(Debug, Default)]
struct Store {
    entries: Vec<Entry>,
    next_id: u64,
}

impl Store {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.media.id() == Some(id))
    }

    fn find(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.media.id() == Some(id))
    }

    fn is_container(&self, id: &str) -> bool {
        self.find(id).is_some_and(|e| e.media.is_container())
    }

    fn adjust_child_count(&mut self, parent: Option<&str>, delta: i64) {
        let Some(parent) = parent else { return };
        if let Some(pos) = self.position(parent) {
            let media = &mut self.entries[pos].media;
            if let Some(count) = media.child_count() {
                let updated = (i64::from(count) + delta).max(0) as u32;
                media.set_child_count(Some(updated));
            }
        }
    }

    /// Remove `id` and everything below it; returns the number removed.
    fn remove_tree(&mut self, id: &str) -> usize {
        let children: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.parent.as_deref() == Some(id))
            .filter_map(|e| e.media.id().map(str::to_string))
            .collect();
        let mut removed: usize = children.iter().map(|child| self.remove_tree(child)).sum();
        if let Some(pos) = self.position(id) {
            self.entries.remove(pos);
            removed += 1;
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

pub struct MemorySource {
    info: SourceInfo,
    operations: SupportedOps,
    keys: Vec<KeyId>,
    slow: Vec<KeyId>,
    writable: Vec<KeyId>,
    caps: HashMap<OperationKind, Caps>,
    derived: HashMap<KeyId, (Vec<KeyId>, Derivation)>,
    key_registry: Option<Arc<KeyRegistry>>,
    execution: Execution,
    store: RwLock<Store>,
}

impl MemorySource {
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> MemorySourceBuilder {
        MemorySourceBuilder::new(SourceInfo::new(id, name))
    }

    /// Number of stored media, containers included.
    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the stored media with `id`.
    pub fn get(&self, id: &str) -> Option<Media> {
        self.store.read().find(id).map(|e| e.media.clone())
    }

    /// Copy of `media` holding only requested keys this source knows.
    fn project(&self, media: &Media, keys: &[KeyId]) -> Media {
        let mut projected = media.clone();
        projected.retain_keys(keys);
        projected.retain_keys(&self.keys);
        projected
    }

    /// Apply the negotiated filters and pagination to `candidates`.
    fn page(&self, candidates: Vec<Media>, keys: &[KeyId], options: &OperationOptions) -> Vec<Media> {
        let limit = options.count().as_limit().map_or(usize::MAX, |n| n as usize);
        candidates
            .iter()
            .filter(|media| options.matches(media))
            .skip(options.skip() as usize)
            .take(limit)
            .map(|media| self.project(media, keys))
            .collect()
    }

    fn send_all(&self, items: Vec<Media>, sink: ResultSink) {
        match &self.execution {
            Execution::Inline => {
                let total = items.len();
                for (i, media) in items.into_iter().enumerate() {
                    if sink.is_cancelled() {
                        break;
                    }
                    sink.send(media, (total - i - 1) as u32);
                }
                sink.finish();
            }
            Execution::Spawn { handle, delay } => {
                let delay = *delay;
                handle.spawn(async move {
                    let total = items.len();
                    for (i, media) in items.into_iter().enumerate() {
                        if let Some(delay) = delay {
                            tokio::select! {
                                _ = sink.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        if sink.is_cancelled() {
                            break;
                        }
                        sink.send(media, (total - i - 1) as u32);
                    }
                    sink.finish();
                });
            }
        }
    }

    fn answer(&self, result: Result<Option<Media>>, sink: ReplySink) {
        match &self.execution {
            Execution::Inline => sink.complete(result),
            Execution::Spawn { handle, delay } => {
                let delay = *delay;
                handle.spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    sink.complete(result);
                });
            }
        }
    }

    fn all_media(&self) -> Vec<Media> {
        self.store
            .read()
            .entries
            .iter()
            .map(|e| e.media.clone())
            .collect()
    }

    /// Whitespace separated `name=value` terms, all of which must match.
    fn run_query(&self, query: &str) -> Result<Vec<Media>> {
        let registry = self
            .key_registry
            .as_ref()
            .ok_or_else(|| Error::validation("query needs a key registry"))?;

        let mut terms = Vec::new();
        for term in query.split_whitespace() {
            let (name, expected) = term
                .split_once('=')
                .ok_or_else(|| Error::validation(format!("query term '{term}' is not key=value")))?;
            let key = registry.lookup(name);
            if !key.is_valid() {
                return Err(Error::InvalidKey(format!("unknown key '{name}' in query")));
            }
            terms.push((key, expected.to_string()));
        }

        Ok(self
            .all_media()
            .into_iter()
            .filter(|media| {
                terms.iter().all(|(key, expected)| {
                    media.get(*key).is_some_and(|v| v.to_string() == *expected)
                })
            })
            .collect())
    }

    fn resolve_media(&self, mut media: Media, keys: &[KeyId]) -> Media {
        let stored = {
            let store = self.store.read();
            media
                .id()
                .and_then(|id| store.find(id))
                .or_else(|| {
                    let url = media.url()?;
                    store.entries.iter().find(|e| e.media.url() == Some(url))
                })
                .map(|e| e.media.clone())
        };

        if let Some(stored) = stored {
            let wanted = self.project(&stored, keys);
            media.merge_missing(&wanted);
        }

        for key in keys {
            if media.has(*key) {
                continue;
            }
            if let Some((deps, derive)) = self.derived.get(key) {
                if deps.iter().all(|dep| media.has(*dep)) {
                    if let Some(value) = derive(&media) {
                        media.set(*key, value);
                    }
                }
            }
        }
        media
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("id", &self.info.id)
            .field("items", &self.len())
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

impl Source for MemorySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn supported_operations(&self) -> SupportedOps {
        self.operations
    }

    fn supported_keys(&self) -> &[KeyId] {
        &self.keys
    }

    fn slow_keys(&self) -> &[KeyId] {
        &self.slow
    }

    fn writable_keys(&self) -> &[KeyId] {
        &self.writable
    }

    fn key_depends(&self, key: KeyId) -> Option<Vec<KeyId>> {
        self.derived.get(&key).map(|(deps, _)| deps.clone())
    }

    fn caps(&self, operation: OperationKind) -> Caps {
        self.caps.get(&operation).cloned().unwrap_or_default()
    }

    fn browse(&self, request: BrowseRequest, sink: ResultSink) {
        let parent = request
            .container
            .as_ref()
            .and_then(|c| c.id())
            .map(str::to_string);

        let children = {
            let store = self.store.read();
            if let Some(id) = &parent {
                if !store.is_container(id) {
                    drop(store);
                    sink.fail(Error::not_found("container", id));
                    return;
                }
            }
            store
                .entries
                .iter()
                .filter(|e| e.parent == parent)
                .map(|e| e.media.clone())
                .collect()
        };

        let page = self.page(children, &request.keys, &request.options);
        self.send_all(page, sink);
    }

    fn search(&self, request: SearchRequest, sink: ResultSink) {
        let needle = request
            .text
            .as_deref()
            .map(str::to_lowercase)
            .filter(|t| !t.is_empty());
        let matches = self
            .all_media()
            .into_iter()
            .filter(|media| match &needle {
                None => true,
                Some(needle) => media.values().any(|(_, value)| {
                    matches!(value, Value::String(s) if s.to_lowercase().contains(needle))
                }),
            })
            .collect();
        let page = self.page(matches, &request.keys, &request.options);
        self.send_all(page, sink);
    }

    fn query(&self, request: QueryRequest, sink: ResultSink) {
        match self.run_query(&request.query) {
            Ok(matches) => {
                let page = self.page(matches, &request.keys, &request.options);
                self.send_all(page, sink);
            }
            Err(e) => sink.fail(e),
        }
    }

    fn resolve(&self, request: ResolveRequest, sink: ReplySink) {
        let media = self.resolve_media(request.media, &request.keys);
        self.answer(Ok(Some(media)), sink);
    }

    fn store_metadata(&self, request: StoreMetadataRequest, sink: ReplySink) {
        let result = (|| {
            let id = request
                .media
                .id()
                .ok_or_else(|| Error::validation("media without id cannot be updated"))?;
            let mut store = self.store.write();
            let pos = store.position(id).ok_or_else(|| Error::not_found("media", id))?;
            let stored = &mut store.entries[pos].media;
            for key in &request.keys {
                match request.media.get(*key) {
                    Some(value) => stored.set(*key, value.clone()),
                    None => {
                        stored.remove(*key);
                    }
                }
            }
            Ok(Some(stored.clone()))
        })();
        self.answer(result, sink);
    }

    fn store(&self, request: StoreRequest, sink: ReplySink) {
        let result = (|| {
            let parent = request.parent.as_ref().and_then(|p| p.id()).map(str::to_string);
            let mut store = self.store.write();
            if let Some(parent) = &parent {
                if !store.is_container(parent) {
                    return Err(Error::not_found("container", parent));
                }
            }

            let mut media = request.media;
            let id = match media.id() {
                Some(id) => id.to_string(),
                None => {
                    store.next_id += 1;
                    format!("{}-{}", self.info.id, store.next_id)
                }
            };
            if store.find(&id).is_some() {
                return Err(Error::validation(format!("media '{id}' already exists")));
            }
            media.set_id(id);
            media.set_source(self.info.id.clone());

            store.adjust_child_count(parent.as_deref(), 1);
            store.entries.push(Entry {
                parent,
                media: media.clone(),
            });
            Ok(Some(media))
        })();
        self.answer(result, sink);
    }

    fn remove(&self, request: RemoveRequest, sink: ReplySink) {
        let result = (|| {
            let id = request
                .media
                .id()
                .ok_or_else(|| Error::validation("media without id cannot be removed"))?;
            let mut store = self.store.write();
            let parent = store
                .find(id)
                .ok_or_else(|| Error::not_found("media", id))?
                .parent
                .clone();
            let removed = store.remove_tree(id);
            store.adjust_child_count(parent.as_deref(), -1);
            tracing::debug!(source = %self.info.id, media = id, removed, "removed media");
            Ok(None)
        })();
        self.answer(result, sink);
    }

    fn test_media_from_uri(&self, uri: &str) -> bool {
        self.store
            .read()
            .entries
            .iter()
            .any(|e| e.media.url() == Some(uri))
    }

    fn media_from_uri(&self, request: MediaFromUriRequest, sink: ReplySink) {
        let found = self
            .store
            .read()
            .entries
            .iter()
            .find(|e| e.media.url() == Some(request.uri.as_str()))
            .map(|e| self.project(&e.media, &request.keys));
        let result = found
            .map(Some)
            .ok_or_else(|| Error::not_found("uri", &request.uri));
        self.answer(result, sink);
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`MemorySource`].
pub struct MemorySourceBuilder {
    info: SourceInfo,
    operations: Option<SupportedOps>,
    keys: Option<Vec<KeyId>>,
    slow: Vec<KeyId>,
    writable: Vec<KeyId>,
    caps: HashMap<OperationKind, Caps>,
    derived: HashMap<KeyId, (Vec<KeyId>, Derivation)>,
    key_registry: Option<Arc<KeyRegistry>>,
    execution: Execution,
    entries: Vec<Entry>,
}

impl MemorySourceBuilder {
    fn new(info: SourceInfo) -> Self {
        Self {
            info,
            operations: None,
            keys: None,
            slow: Vec::new(),
            writable: Vec::new(),
            caps: HashMap::new(),
            derived: HashMap::new(),
            key_registry: None,
            execution: Execution::Inline,
            entries: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.info.description = description.into();
        self
    }

    pub fn rank(mut self, rank: i32) -> Self {
        self.info.rank = rank;
        self
    }

    pub fn auto_split(mut self, threshold: u32) -> Self {
        self.info = self.info.with_auto_split(threshold);
        self
    }

    /// Override the advertised operations.
    pub fn operations(mut self, operations: SupportedOps) -> Self {
        self.operations = Some(operations);
        self
    }

    /// Override the advertised keys (by default: every key found on the items).
    pub fn keys(mut self, keys: &[KeyId]) -> Self {
        self.keys = Some(keys.to_vec());
        self
    }

    pub fn slow_keys(mut self, keys: &[KeyId]) -> Self {
        self.slow = keys.to_vec();
        self
    }

    pub fn writable_keys(mut self, keys: &[KeyId]) -> Self {
        self.writable = keys.to_vec();
        self
    }

    pub fn caps(mut self, operation: OperationKind, caps: Caps) -> Self {
        self.caps.insert(operation, caps);
        self
    }

    /// Same caps for browse, search and query. Without this the paged
    /// operations accept pagination, every type filter and a filter on any
    /// supported key.
    pub fn paged_caps(mut self, caps: Caps) -> Self {
        for operation in [OperationKind::Browse, OperationKind::Search, OperationKind::Query] {
            self.caps.insert(operation, caps.clone());
        }
        self
    }

    /// Key names in queries are looked up here; without it queries fail.
    pub fn key_registry(mut self, registry: Arc<KeyRegistry>) -> Self {
        self.key_registry = Some(registry);
        self
    }

    pub fn execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    /// Compute `key` during resolve from the keys in `depends`, for any
    /// media carrying them.
    pub fn derive(
        mut self,
        key: KeyId,
        depends: &[KeyId],
        derive: impl Fn(&Media) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.derived.insert(key, (depends.to_vec(), Arc::new(derive)));
        self
    }

    /// Add `media` under the container with id `parent` (`None` for the root).
    pub fn item(mut self, parent: Option<&str>, media: Media) -> Self {
        self.entries.push(Entry {
            parent: parent.map(str::to_string),
            media,
        });
        self
    }

    pub fn build(self) -> MemorySource {
        let mut entries = self.entries;
        let source_id = self.info.id.clone();

        // Containers without an explicit count get the number of their children.
        let counts: Vec<Option<u32>> = entries
            .iter()
            .map(|e| {
                let id = e.media.id()?;
                let n = entries.iter().filter(|c| c.parent.as_deref() == Some(id)).count();
                Some(n as u32)
            })
            .collect();
        for (entry, count) in entries.iter_mut().zip(counts) {
            if entry.media.is_container() && entry.media.child_count().is_none() {
                entry.media.set_child_count(count);
            }
            entry.media.set_source(source_id.clone());
        }

        let keys = self.keys.unwrap_or_else(|| {
            let mut keys: Vec<KeyId> = entries.iter().flat_map(|e| e.media.keys()).collect();
            keys.extend(self.derived.keys().copied());
            keys.sort();
            keys.dedup();
            keys
        });

        let operations = self.operations.unwrap_or_else(|| {
            let mut ops = SupportedOps::BROWSE
                | SupportedOps::SEARCH
                | SupportedOps::RESOLVE
                | SupportedOps::STORE
                | SupportedOps::REMOVE
                | SupportedOps::MEDIA_FROM_URI;
            if self.key_registry.is_some() {
                ops |= SupportedOps::QUERY;
            }
            if !self.writable.is_empty() {
                ops |= SupportedOps::STORE_METADATA;
            }
            ops
        });

        // Paged operations filter and paginate in `page`, so by default they
        // advertise all of it.
        let mut caps = self.caps;
        for operation in [OperationKind::Browse, OperationKind::Search, OperationKind::Query] {
            caps.entry(operation).or_insert_with(|| {
                Caps::new()
                    .with_pagination(true)
                    .with_type_filter(TypeFilter::ALL)
                    .with_key_filters(keys.iter().copied())
            });
        }

        MemorySource {
            info: self.info,
            operations,
            keys,
            slow: self.slow,
            writable: self.writable,
            caps,
            derived: self.derived,
            key_registry: self.key_registry,
            execution: self.execution,
            store: RwLock::new(Store {
                entries,
                next_id: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::*;
    use assert_matches::assert_matches;
    use trove_core::system;

    fn library() -> MemorySourceBuilder {
        MemorySource::builder("library", "Library")
            .item(None, Media::container().with_id("music").with(system::TITLE, "Music"))
            .item(None, Media::container().with_id("films").with(system::TITLE, "Films"))
            .item(Some("music"), Media::audio().with_id("m1").with(system::TITLE, "Blue in Green").with(system::ARTIST, "Miles Davis"))
            .item(Some("music"), Media::audio().with_id("m2").with(system::TITLE, "So What").with(system::ARTIST, "Miles Davis"))
            .item(Some("music"), Media::audio().with_id("m3").with(system::TITLE, "Naima").with(system::ARTIST, "John Coltrane"))
            .item(Some("films"), Media::video().with_id("f1").with(system::TITLE, "Blue Velvet").with(system::URL, "file:///films/bv.mkv"))
    }

    fn browse(source: &MemorySource, container: Option<&str>, options: OperationOptions) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let request = BrowseRequest {
            operation_id: op_id(),
            container: container.map(|id| Media::container().with_id(id)),
            keys: vec![system::TITLE, system::ARTIST],
            options,
        };
        source.browse(request, result_sink(&recorder));
        recorder
    }

    fn titles(recorder: &Recorder) -> Vec<String> {
        recorder
            .items
            .lock()
            .iter()
            .map(|(m, _)| m.title().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn browse_root_and_container() {
        let source = library().build();
        let root = browse(&source, None, OperationOptions::new());
        assert_eq!(titles(&root), vec!["Music", "Films"]);
        assert_eq!(root.items.lock()[0].0.child_count(), Some(3));

        let music = browse(&source, Some("music"), OperationOptions::new());
        assert_eq!(titles(&music), vec!["Blue in Green", "So What", "Naima"]);
        let remaining: Vec<u32> = music.items.lock().iter().map(|(_, r)| *r).collect();
        assert_eq!(remaining, vec![2, 1, 0]);
        assert_matches!(music.outcome.lock().take(), Some(Ok(None)));
    }

    #[test]
    fn browse_applies_skip_count_and_filters() {
        let source = library().build();
        let options = OperationOptions::new().with_skip(1).with_count(1);
        assert_eq!(titles(&browse(&source, Some("music"), options)), vec!["So What"]);

        let by_artist = OperationOptions::new().with_key_filter(system::ARTIST, "John Coltrane");
        assert_eq!(titles(&browse(&source, Some("music"), by_artist)), vec!["Naima"]);

        let videos = OperationOptions::new().with_type_filter(TypeFilter::VIDEO);
        assert!(titles(&browse(&source, Some("music"), videos)).is_empty());
    }

    #[test]
    fn paged_operations_advertise_full_caps() {
        let source = library().build();
        let caps = source.caps(OperationKind::Browse);
        assert!(caps.supports_pagination());
        assert!(caps.key_filter_is_allowed(system::ARTIST));
        assert_eq!(caps.type_filter(), TypeFilter::ALL);
        assert_eq!(source.caps(OperationKind::Resolve), Caps::new());

        let bare = library().paged_caps(Caps::new()).build();
        assert!(!bare.caps(OperationKind::Search).supports_pagination());
    }

    #[test]
    fn browse_unknown_container_fails() {
        let source = library().build();
        let recorder = browse(&source, Some("nope"), OperationOptions::new());
        assert_matches!(recorder.outcome.lock().take(), Some(Err(Error::NotFound { .. })));
    }

    #[test]
    fn results_only_carry_requested_keys() {
        let source = library().build();
        let recorder = browse(&source, Some("films"), OperationOptions::new());
        let items = recorder.items.lock();
        assert!(!items[0].0.has(system::URL));
        assert_eq!(items[0].0.source(), Some("library"));
    }

    #[test]
    fn search_is_case_insensitive() {
        let source = library().build();
        let recorder = Arc::new(Recorder::default());
        let request = SearchRequest {
            operation_id: op_id(),
            text: Some("BLUE".into()),
            keys: vec![system::TITLE],
            options: OperationOptions::new(),
        };
        source.search(request, result_sink(&recorder));
        assert_eq!(titles(&recorder), vec!["Blue in Green", "Blue Velvet"]);
    }

    #[test]
    fn query_matches_key_value_terms() {
        let source = library()
            .key_registry(Arc::new(KeyRegistry::new()))
            .build();
        assert!(source.supported_operations().contains(SupportedOps::QUERY));

        let recorder = Arc::new(Recorder::default());
        let request = QueryRequest {
            operation_id: op_id(),
            query: "title=Naima".into(),
            keys: vec![system::TITLE],
            options: OperationOptions::new(),
        };
        source.query(request, result_sink(&recorder));
        assert_eq!(titles(&recorder), vec!["Naima"]);
    }

    #[test]
    fn query_with_unknown_key_fails() {
        let source = library()
            .key_registry(Arc::new(KeyRegistry::new()))
            .build();
        let recorder = Arc::new(Recorder::default());
        let request = QueryRequest {
            operation_id: op_id(),
            query: "mood=calm".into(),
            keys: vec![],
            options: OperationOptions::new(),
        };
        source.query(request, result_sink(&recorder));
        assert_matches!(recorder.outcome.lock().take(), Some(Err(Error::InvalidKey(_))));
    }

    #[test]
    fn resolve_fills_missing_keys_and_derives() {
        let source = library()
            .derive(system::LYRICS, &[system::ARTIST, system::TITLE], |media| {
                Some(Value::from(format!("lyrics of {}", media.title()?)))
            })
            .build();
        assert_eq!(source.key_depends(system::LYRICS), Some(vec![system::ARTIST, system::TITLE]));

        let recorder = Arc::new(Recorder::default());
        let request = ResolveRequest {
            operation_id: op_id(),
            media: Media::audio().with_id("m3"),
            keys: vec![system::ARTIST, system::TITLE, system::LYRICS],
            options: OperationOptions::new(),
        };
        source.resolve(request, reply_sink(&recorder));
        let outcome = recorder.outcome.lock().take();
        let media = match outcome {
            Some(Ok(Some(media))) => media,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(media.get(system::ARTIST), Some(&Value::from("John Coltrane")));
        assert_eq!(media.get(system::LYRICS), Some(&Value::from("lyrics of Naima")));
    }

    #[test]
    fn store_and_remove_update_child_counts() {
        let source = library().build();
        let recorder = Arc::new(Recorder::default());
        source.store(
            StoreRequest {
                operation_id: op_id(),
                parent: Some(Media::container().with_id("music")),
                media: Media::audio().with(system::TITLE, "Giant Steps"),
            },
            reply_sink(&recorder),
        );
        let stored = match recorder.outcome.lock().take() {
            Some(Ok(Some(media))) => media,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(stored.id(), Some("library-1"));
        assert_eq!(source.get("music").unwrap().child_count(), Some(4));

        let recorder = Arc::new(Recorder::default());
        source.remove(
            RemoveRequest {
                operation_id: op_id(),
                media: Media::container().with_id("music"),
            },
            reply_sink(&recorder),
        );
        assert_matches!(recorder.outcome.lock().take(), Some(Ok(None)));
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn store_metadata_writes_values() {
        let source = library().writable_keys(&[system::RATING]).build();
        assert!(source.supported_operations().contains(SupportedOps::STORE_METADATA));
        let recorder = Arc::new(Recorder::default());
        source.store_metadata(
            StoreMetadataRequest {
                operation_id: op_id(),
                media: Media::audio().with_id("m1").with(system::RATING, 4.5),
                keys: vec![system::RATING],
            },
            reply_sink(&recorder),
        );
        assert_matches!(recorder.outcome.lock().take(), Some(Ok(Some(_))));
        assert_eq!(source.get("m1").unwrap().get(system::RATING), Some(&Value::from(4.5)));
    }

    #[test]
    fn media_from_uri_by_url() {
        let source = library().build();
        assert!(source.test_media_from_uri("file:///films/bv.mkv"));
        assert!(!source.test_media_from_uri("file:///nothing"));

        let recorder = Arc::new(Recorder::default());
        source.media_from_uri(
            MediaFromUriRequest {
                operation_id: op_id(),
                uri: "file:///nothing".into(),
                keys: vec![system::TITLE],
                options: OperationOptions::new(),
            },
            reply_sink(&recorder),
        );
        assert_matches!(recorder.outcome.lock().take(), Some(Err(Error::NotFound { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawned_execution_answers_later() {
        let source = library()
            .execution(Execution::Spawn {
                handle: Handle::current(),
                delay: Some(Duration::from_millis(5)),
            })
            .build();
        let recorder = browse(&source, Some("music"), OperationOptions::new());
        assert!(recorder.outcome.lock().is_none());

        for _ in 0..200 {
            if recorder.outcome.lock().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(titles(&recorder).len(), 3);
        assert_matches!(recorder.outcome.lock().take(), Some(Ok(None)));
    }
}
