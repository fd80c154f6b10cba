//! The dispatcher starts operations against sources and routes their results
//! to callers.
//!
//! Every asynchronous operation returns as soon as the source has been
//! called. Validation failures (an operation the source does not implement,
//! options rejected under strict negotiation, unknown keys, browsing a
//! non-container) are returned as `Err` and no callback is made. Everything
//! after that, source failures included, arrives through the callback, ending
//! with exactly one terminal chunk.
//!
//! Without `IDLE_RELAY` a callback may run before the operation call
//! returns, from the stack of a source that answers inline. With it, every
//! chunk is posted to the callback's relay, or to the dispatcher's
//! [`MainLoop`] when the callback has none.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use trove_core::config::DispatchConfig;
use trove_core::{
    Caps, DispatcherId, Error, KeyId, Media, Negotiated, Negotiation, OperationId,
    OperationKind, OperationOptions, OptionField, ResolutionFlags, Result,
};
use trove_source::{
    MediaFromUriRequest, Registry, RemoveRequest, ReplySink, ResolveRequest, Source,
    StoreMetadataRequest, StoreRequest,
};

use crate::chunk::ResultCallback;
use crate::operation::{Operation, OperationPhase, OperationTable};
use crate::output::{Output, ReplyDelivery};
use crate::paged::{describe, rejected, PagePlan, Paged, PagedDelivery};
use crate::relay::{MainLoop, Relay};
use crate::resolve::FullResolution;

struct Inner {
    id: DispatcherId,
    registry: Arc<Registry>,
    config: DispatchConfig,
    table: Arc<OperationTable>,
    main_loop: MainLoop,
    relay: Arc<dyn Relay>,
    next_seq: AtomicU64,
}

/// Handle to a dispatcher; clones share the same operations.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    registry: Arc<Registry>,
    config: DispatchConfig,
    relay: Option<Arc<dyn Relay>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Default relay for `IDLE_RELAY` operations instead of the main loop.
    pub fn relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn build(self) -> Dispatcher {
        let main_loop = MainLoop::new();
        let relay = self
            .relay
            .unwrap_or_else(|| Arc::new(main_loop.clone()) as Arc<dyn Relay>);
        Dispatcher {
            inner: Arc::new(Inner {
                id: DispatcherId::new(),
                registry: self.registry,
                config: self.config,
                table: Arc::new(OperationTable::default()),
                main_loop,
                relay,
                next_seq: AtomicU64::new(0),
            }),
        }
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::builder(registry).build()
    }

    pub fn builder(registry: Arc<Registry>) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            config: DispatchConfig::default(),
            relay: None,
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.inner.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// The idle queue relayed callbacks land on by default.
    pub fn main_loop(&self) -> &MainLoop {
        &self.inner.main_loop
    }

    // -- Introspection -------------------------------------------------------

    /// Phase of an outstanding operation; `None` once its terminal chunk has
    /// been delivered.
    pub fn phase(&self, id: OperationId) -> Option<OperationPhase> {
        self.inner.table.get(id).map(|op| op.phase())
    }

    /// Whether the terminal chunk of `id` is still to be delivered.
    pub fn is_pending(&self, id: OperationId) -> bool {
        self.inner.table.get(id).is_some()
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.table.len()
    }

    /// Cancel `id`.
    ///
    /// After this returns no non-terminal chunk of `id` is delivered. If the
    /// terminal chunk was not committed yet, the caller gets one terminal
    /// chunk with [`Error::Cancelled`]. A callback of `id` running on another
    /// thread is waited for.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different dispatcher.
    pub fn cancel(&self, id: OperationId) {
        assert!(
            id.dispatcher() == self.inner.id,
            "operation {id} was issued by dispatcher {}, not {}",
            id.dispatcher(),
            self.inner.id
        );
        match self.inner.table.get(id) {
            Some(op) => op.cancel(),
            None => tracing::debug!(operation_id = %id, "cancel of finished operation ignored"),
        }
    }

    // -- Paged operations ----------------------------------------------------

    /// Browse `container` (the root when `None`).
    pub fn browse(
        &self,
        source: &Arc<dyn Source>,
        container: Option<&Media>,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let request = Paged::Browse(container.cloned());
        self.start_paged(source, request, keys, options, callback.into())
            .map(|op| op.id())
    }

    /// Search for `text`; `None` matches everything the source offers.
    pub fn search(
        &self,
        source: &Arc<dyn Source>,
        text: Option<&str>,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let request = Paged::Search(text.map(str::to_string));
        self.start_paged(source, request, keys, options, callback.into())
            .map(|op| op.id())
    }

    /// Run a query in the source's own language.
    pub fn query(
        &self,
        source: &Arc<dyn Source>,
        query: &str,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let request = Paged::Query(query.to_string());
        self.start_paged(source, request, keys, options, callback.into())
            .map(|op| op.id())
    }

    pub(crate) fn start_paged(
        &self,
        source: &Arc<dyn Source>,
        request: Paged,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: ResultCallback,
    ) -> Result<Arc<Operation>> {
        let kind = request.kind();
        require_operation(source.as_ref(), kind)?;
        if let Paged::Browse(Some(container)) = &request {
            if !container.is_container() {
                return Err(Error::NotBrowsable(
                    container.id().unwrap_or("<unnamed>").to_string(),
                ));
            }
        }

        let flags = options.flags();
        let (keys, resolution) = self.plan_keys(source, keys, flags)?;
        let plan = self.plan_page(source, kind, options)?;

        let op = self.register(kind, source, flags, callback);
        let output = Output::new(op.clone(), resolution);
        let delivery = PagedDelivery::new(source.clone(), request, keys, output, plan);
        op.mark_dispatched();
        tracing::debug!(operation_id = %op.id(), source = source.id(), %kind, "dispatching");
        delivery.start();
        Ok(op)
    }

    // -- Single-result operations --------------------------------------------

    /// Fill `keys` on `media`. The terminal chunk carries the result.
    pub fn resolve(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        self.start_resolve(source, media, keys, options, callback.into())
            .map(|op| op.id())
    }

    pub(crate) fn start_resolve(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: ResultCallback,
    ) -> Result<Arc<Operation>> {
        let kind = OperationKind::Resolve;
        require_operation(source.as_ref(), kind)?;
        let flags = options.flags();
        let source_options = self.plan_single(source, kind, options)?;
        let (keys, resolution) = self.plan_keys(source, keys, flags)?;

        let media = media.clone();
        Ok(self.start_reply(
            source,
            kind,
            flags,
            callback,
            resolution,
            Vec::new(),
            move |source, operation_id, sink| {
                let request = ResolveRequest {
                    operation_id,
                    media,
                    keys,
                    options: source_options,
                };
                source.resolve(request, sink);
            },
        ))
    }

    /// Create a media item for `uri`.
    pub fn media_from_uri(
        &self,
        source: &Arc<dyn Source>,
        uri: &str,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let kind = OperationKind::MediaFromUri;
        require_operation(source.as_ref(), kind)?;
        let flags = options.flags();
        let source_options = self.plan_single(source, kind, options)?;
        let (keys, resolution) = self.plan_keys(source, keys, flags)?;

        let uri = uri.to_string();
        let op = self.start_reply(
            source,
            kind,
            flags,
            callback.into(),
            resolution,
            Vec::new(),
            move |source, operation_id, sink| {
                let request = MediaFromUriRequest {
                    operation_id,
                    uri,
                    keys,
                    options: source_options,
                };
                source.media_from_uri(request, sink);
            },
        );
        Ok(op.id())
    }

    /// Write the values of `keys` on `media` back to `source`. Keys the
    /// source cannot write are reported in the terminal chunk's
    /// `failed_keys`; when none are writable the source is not called.
    pub fn store_metadata(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let kind = OperationKind::StoreMetadata;
        require_operation(source.as_ref(), kind)?;
        let partition = self
            .inner
            .registry
            .filter_writable(source.as_ref(), keys)?;
        let flags = options.flags();

        if partition.accepted.is_empty() {
            let op = self.register(kind, source, flags, callback.into());
            op.mark_dispatched();
            let output = Output::new(op.clone(), None);
            let seq = output.reserve();
            output.push_terminal(seq, Ok(Some(media.clone())), partition.rejected);
            return Ok(op.id());
        }

        let media = media.clone();
        let writable = partition.accepted;
        let op = self.start_reply(
            source,
            kind,
            flags,
            callback.into(),
            None,
            partition.rejected,
            move |source, operation_id, sink| {
                let request = StoreMetadataRequest {
                    operation_id,
                    media,
                    keys: writable,
                };
                source.store_metadata(request, sink);
            },
        );
        Ok(op.id())
    }

    /// Store `media` under `parent` (the root when `None`).
    pub fn store(
        &self,
        source: &Arc<dyn Source>,
        parent: Option<&Media>,
        media: Media,
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let kind = OperationKind::Store;
        require_operation(source.as_ref(), kind)?;
        if let Some(parent) = parent {
            if !parent.is_container() {
                return Err(Error::NotBrowsable(
                    parent.id().unwrap_or("<unnamed>").to_string(),
                ));
            }
        }

        let parent = parent.cloned();
        let op = self.start_reply(
            source,
            kind,
            options.flags(),
            callback.into(),
            None,
            Vec::new(),
            move |source, operation_id, sink| {
                let request = StoreRequest {
                    operation_id,
                    parent,
                    media,
                };
                source.store(request, sink);
            },
        );
        Ok(op.id())
    }

    pub fn remove(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> Result<OperationId> {
        let kind = OperationKind::Remove;
        require_operation(source.as_ref(), kind)?;

        let media = media.clone();
        let op = self.start_reply(
            source,
            kind,
            options.flags(),
            callback.into(),
            None,
            Vec::new(),
            move |source, operation_id, sink| {
                source.remove(RemoveRequest { operation_id, media }, sink);
            },
        );
        Ok(op.id())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_reply(
        &self,
        source: &Arc<dyn Source>,
        kind: OperationKind,
        flags: ResolutionFlags,
        callback: ResultCallback,
        resolution: Option<Arc<FullResolution>>,
        failed_keys: Vec<KeyId>,
        call: impl FnOnce(&dyn Source, OperationId, ReplySink),
    ) -> Arc<Operation> {
        let op = self.register(kind, source, flags, callback);
        let output = Output::new(op.clone(), resolution);
        let delivery = ReplyDelivery::new(output, failed_keys);
        let sink = ReplySink::new(op.id(), source.id(), delivery, op.token().clone());
        op.mark_dispatched();
        tracing::debug!(operation_id = %op.id(), source = source.id(), %kind, "dispatching");
        call(source.as_ref(), op.id(), sink);
        op
    }

    // -- Planning ------------------------------------------------------------

    pub(crate) fn register(
        &self,
        kind: OperationKind,
        source: &Arc<dyn Source>,
        flags: ResolutionFlags,
        callback: ResultCallback,
    ) -> Arc<Operation> {
        self.register_operation(kind, Some(source.clone()), flags, callback)
    }

    pub(crate) fn register_operation(
        &self,
        kind: OperationKind,
        source: Option<Arc<dyn Source>>,
        flags: ResolutionFlags,
        callback: ResultCallback,
    ) -> Arc<Operation> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = OperationId::new(self.inner.id, seq);
        let relay = flags.contains(ResolutionFlags::IDLE_RELAY).then(|| {
            callback
                .relay()
                .cloned()
                .unwrap_or_else(|| self.inner.relay.clone())
        });
        let op = Operation::new(
            id,
            kind,
            source,
            callback,
            relay,
            Arc::downgrade(&self.inner.table),
        );
        self.inner.table.insert(op.clone());
        op
    }

    /// Keys to request from `source`, plus the full resolution covering the
    /// keys it cannot produce.
    fn plan_keys(
        &self,
        source: &Arc<dyn Source>,
        keys: &[KeyId],
        flags: ResolutionFlags,
    ) -> Result<(Vec<KeyId>, Option<Arc<FullResolution>>)> {
        let registry = &self.inner.registry;
        let fast_only = flags.contains(ResolutionFlags::FAST_ONLY);
        let partition = registry.filter_supported(source.as_ref(), keys, !fast_only)?;
        let mut source_keys = partition.accepted;
        if !flags.contains(ResolutionFlags::FULL) || partition.rejected.is_empty() {
            return Ok((source_keys, None));
        }

        let plan = FullResolution::plan(registry, source.as_ref(), &partition.rejected, fast_only);
        for dep in plan.dependencies {
            if !source_keys.contains(&dep) {
                source_keys.push(dep);
            }
        }
        Ok((source_keys, plan.resolution))
    }

    /// Negotiate `options` against the caps of `source` for `kind`. Strict
    /// negotiation fails here; resolution flags never take part.
    fn negotiate(
        &self,
        source: &Arc<dyn Source>,
        kind: OperationKind,
        options: &OperationOptions,
    ) -> Result<(Caps, Negotiated)> {
        let caps = source.caps(kind);
        let mut requested = options.clone();
        requested.clear(OptionField::Flags);
        let negotiated = requested.obey_caps(&caps);

        if !negotiated.fully_supported {
            match options.negotiation() {
                Negotiation::Strict => {
                    return Err(rejected(source.as_ref(), kind, &negotiated.unsupported));
                }
                Negotiation::Partial => tracing::debug!(
                    source = source.id(),
                    %kind,
                    dropped = %describe(&negotiated.unsupported),
                    "dropping unsupported options"
                ),
                Negotiation::Emulate => tracing::debug!(
                    source = source.id(),
                    %kind,
                    emulated = %describe(&negotiated.unsupported),
                    "emulating unsupported options"
                ),
            }
        }
        Ok((caps, negotiated))
    }

    fn plan_single(
        &self,
        source: &Arc<dyn Source>,
        kind: OperationKind,
        options: &OperationOptions,
    ) -> Result<OperationOptions> {
        let (caps, negotiated) = self.negotiate(source, kind, options)?;
        let mut source_options = negotiated.supported;
        forward_flags(&caps, options, &mut source_options);
        Ok(source_options)
    }

    fn plan_page(
        &self,
        source: &Arc<dyn Source>,
        kind: OperationKind,
        options: &OperationOptions,
    ) -> Result<PagePlan> {
        let (caps, negotiated) = self.negotiate(source, kind, options)?;
        let mut plan = PagePlan {
            source_options: negotiated.supported,
            limit: options.count().as_limit(),
            ..PagePlan::default()
        };

        let unsupported = negotiated.unsupported;
        if !negotiated.fully_supported && options.negotiation() == Negotiation::Emulate {
            let filtering =
                unsupported.is_set(OptionField::TypeFilter) || unsupported.is_set(OptionField::KeyFilters);
            if filtering {
                // Source-side pagination would count items the local filter drops.
                plan.local_skip = options.skip();
                plan.source_options.clear(OptionField::Skip);
                plan.source_options.clear(OptionField::Count);
                plan.local_filter = Some(unsupported);
            } else {
                plan.local_skip = unsupported.skip();
            }
        }
        forward_flags(&caps, options, &mut plan.source_options);

        if plan.local_filter.is_none() && caps.supports_pagination() {
            let threshold = source
                .info()
                .auto_split_threshold
                .or(self.inner.config.auto_split_threshold)
                .filter(|t| *t > 0);
            if let (Some(threshold), Some(count)) =
                (threshold, plan.source_options.count().as_limit())
            {
                if count > threshold {
                    tracing::debug!(source = source.id(), count, threshold, "auto-splitting request");
                    plan.split = Some(threshold);
                }
            }
        }
        Ok(plan)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.inner.id)
            .field("pending", &self.inner.table.len())
            .finish_non_exhaustive()
    }
}

fn require_operation(source: &dyn Source, kind: OperationKind) -> Result<()> {
    if source.supported_operations().contains(kind.as_flag()) {
        Ok(())
    } else {
        Err(Error::unsupported(source.id(), kind))
    }
}

/// Hand resolution flags to sources whose caps ask for them.
fn forward_flags(caps: &Caps, options: &OperationOptions, source_options: &mut OperationOptions) {
    let flags = options.flags();
    if caps.supports_flags() && !flags.is_empty() {
        source_options.set_flags(flags);
    }
}

/// `options` without `IDLE_RELAY`.
pub(crate) fn without_relay(options: &OperationOptions) -> OperationOptions {
    let mut options = options.clone();
    let flags = options.flags();
    if flags.contains(ResolutionFlags::IDLE_RELAY) {
        options.set_flags(flags - ResolutionFlags::IDLE_RELAY);
    }
    options
}
