//! The source contract.
//!
//! A [`Source`] advertises what it can do (operations, keys, caps) and
//! implements each operation by answering through a sink. Operations never
//! block the caller: a source either answers inline, from the calling
//! stack, or hands the sink to its own worker and answers later.
//!
//! Sources receive options that were already negotiated against their own
//! [`Caps`]; they must honour every field they are handed.

use serde::Serialize;
use trove_core::{
    Caps, Error, KeyId, Media, OperationId, OperationKind, OperationOptions, SupportedOps,
};

use crate::sink::{ReplySink, ResultSink};

// ---------------------------------------------------------------------------
// SourceInfo
// ---------------------------------------------------------------------------

/// Identity of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// Ordering weight; higher ranks sort first. Configuration may override it.
    pub rank: i32,
    /// Split bounded requests larger than this into several calls.
    pub auto_split_threshold: Option<u32>,
}

impl SourceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            rank: 0,
            auto_split_threshold: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_auto_split(mut self, threshold: u32) -> Self {
        self.auto_split_threshold = (threshold > 0).then_some(threshold);
        self
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrowseRequest {
    pub operation_id: OperationId,
    /// `None` browses the source's root.
    pub container: Option<Media>,
    pub keys: Vec<KeyId>,
    pub options: OperationOptions,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub operation_id: OperationId,
    /// `None` matches everything.
    pub text: Option<String>,
    pub keys: Vec<KeyId>,
    pub options: OperationOptions,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub operation_id: OperationId,
    /// Source-specific query language.
    pub query: String,
    pub keys: Vec<KeyId>,
    pub options: OperationOptions,
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub operation_id: OperationId,
    pub media: Media,
    pub keys: Vec<KeyId>,
    pub options: OperationOptions,
}

#[derive(Debug, Clone)]
pub struct StoreMetadataRequest {
    pub operation_id: OperationId,
    pub media: Media,
    /// Keys whose values in `media` should be written; all are writable.
    pub keys: Vec<KeyId>,
}

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub operation_id: OperationId,
    /// `None` stores at the root.
    pub parent: Option<Media>,
    pub media: Media,
}

#[derive(Debug, Clone)]
pub struct RemoveRequest {
    pub operation_id: OperationId,
    pub media: Media,
}

#[derive(Debug, Clone)]
pub struct MediaFromUriRequest {
    pub operation_id: OperationId,
    pub uri: String,
    pub keys: Vec<KeyId>,
    pub options: OperationOptions,
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// A plugin exposing discovery operations over the media it knows about.
///
/// Every operation has a default body that fails with
/// [`Error::UnsupportedOperation`]; a source overrides the operations it
/// lists in [`Source::supported_operations`].
pub trait Source: Send + Sync {
    fn info(&self) -> &SourceInfo;

    fn id(&self) -> &str {
        &self.info().id
    }

    fn supported_operations(&self) -> SupportedOps;

    /// Keys this source can produce.
    fn supported_keys(&self) -> &[KeyId];

    /// Subset of the supported keys that are expensive to produce.
    fn slow_keys(&self) -> &[KeyId] {
        &[]
    }

    fn writable_keys(&self) -> &[KeyId] {
        &[]
    }

    /// Keys this source needs on a foreign media item to resolve `key`.
    ///
    /// `None` means the source cannot resolve `key` for media it did not
    /// produce.
    fn key_depends(&self, _key: KeyId) -> Option<Vec<KeyId>> {
        None
    }

    /// Whether resolving `key` on `media` can succeed with what `media`
    /// already carries.
    fn may_resolve(&self, media: &Media, key: KeyId) -> bool {
        if media.source() == Some(self.id()) {
            return self.supported_keys().contains(&key);
        }
        self.key_depends(key)
            .map_or(false, |deps| deps.iter().all(|dep| media.has(*dep)))
    }

    /// Option envelope for `operation`.
    fn caps(&self, _operation: OperationKind) -> Caps {
        Caps::new()
    }

    fn browse(&self, _request: BrowseRequest, sink: ResultSink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::Browse));
    }

    fn search(&self, _request: SearchRequest, sink: ResultSink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::Search));
    }

    fn query(&self, _request: QueryRequest, sink: ResultSink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::Query));
    }

    fn resolve(&self, _request: ResolveRequest, sink: ReplySink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::Resolve));
    }

    fn store_metadata(&self, _request: StoreMetadataRequest, sink: ReplySink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::StoreMetadata));
    }

    fn store(&self, _request: StoreRequest, sink: ReplySink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::Store));
    }

    fn remove(&self, _request: RemoveRequest, sink: ReplySink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::Remove));
    }

    /// Whether [`Source::media_from_uri`] can handle `uri`.
    fn test_media_from_uri(&self, _uri: &str) -> bool {
        false
    }

    fn media_from_uri(&self, _request: MediaFromUriRequest, sink: ReplySink) {
        sink.fail(Error::unsupported(self.id(), OperationKind::MediaFromUri));
    }

    /// Hook called when the caller cancels `operation_id`. The sink's
    /// cancellation token is already cancelled when this runs.
    fn cancel(&self, _operation_id: OperationId) {}
}

impl std::fmt::Debug for dyn Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id())
            .field("operations", &self.supported_operations())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use trove_core::system;

    struct Bare {
        info: SourceInfo,
    }

    impl Source for Bare {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn supported_operations(&self) -> SupportedOps {
            SupportedOps::empty()
        }

        fn supported_keys(&self) -> &[KeyId] {
            &[system::TITLE]
        }

        fn key_depends(&self, key: KeyId) -> Option<Vec<KeyId>> {
            (key == system::THUMBNAIL).then(|| vec![system::ARTIST, system::ALBUM])
        }
    }

    fn bare() -> Bare {
        Bare {
            info: SourceInfo::new("bare", "Bare"),
        }
    }

    #[test]
    fn default_operations_are_unsupported() {
        let source = bare();
        let recorder = Arc::new(Recorder::default());
        let request = SearchRequest {
            operation_id: op_id(),
            text: None,
            keys: vec![],
            options: OperationOptions::new(),
        };
        source.search(request, result_sink(&recorder));
        assert_matches!(
            recorder.outcome.lock().take(),
            Some(Err(Error::UnsupportedOperation { operation: OperationKind::Search, .. }))
        );
    }

    #[test]
    fn may_resolve_follows_dependencies() {
        let source = bare();
        let partial = Media::audio().with(system::ARTIST, "Björk");
        assert!(!source.may_resolve(&partial, system::THUMBNAIL));
        let full = partial.with(system::ALBUM, "Homogenic");
        assert!(source.may_resolve(&full, system::THUMBNAIL));
        assert!(!source.may_resolve(&full, system::LYRICS));
    }

    #[test]
    fn auto_split_zero_disables() {
        let info = SourceInfo::new("s", "S").with_auto_split(0);
        assert_eq!(info.auto_split_threshold, None);
        assert_eq!(info.with_auto_split(25).auto_split_threshold, Some(25));
    }
}
