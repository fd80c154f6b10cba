//! Browse, search and query: the paged operations.
//!
//! [`PagedDelivery`] sits between a source's [`ResultSink`] and the
//! operation's [`Output`]. It applies whatever the source was not asked to
//! do (skip, type and key filters under emulation), enforces the caller's
//! count bound, keeps `remaining` monotonic and re-issues the request in
//! chunks when auto-split is active.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use trove_core::{Error, KeyId, Media, OperationId, OperationKind, OperationOptions, Result};
use trove_source::{
    BrowseRequest, Delivery, QueryRequest, ResultSink, SearchRequest, Source,
};

use crate::output::Output;

/// The target of a paged operation.
#[derive(Debug, Clone)]
pub(crate) enum Paged {
    Browse(Option<Media>),
    Search(Option<String>),
    Query(String),
}

impl Paged {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Paged::Browse(_) => OperationKind::Browse,
            Paged::Search(_) => OperationKind::Search,
            Paged::Query(_) => OperationKind::Query,
        }
    }

    fn call(
        &self,
        source: &dyn Source,
        operation_id: OperationId,
        keys: Vec<KeyId>,
        options: OperationOptions,
        sink: ResultSink,
    ) {
        match self {
            Paged::Browse(container) => source.browse(
                BrowseRequest {
                    operation_id,
                    container: container.clone(),
                    keys,
                    options,
                },
                sink,
            ),
            Paged::Search(text) => source.search(
                SearchRequest {
                    operation_id,
                    text: text.clone(),
                    keys,
                    options,
                },
                sink,
            ),
            Paged::Query(query) => source.query(
                QueryRequest {
                    operation_id,
                    query: query.clone(),
                    keys,
                    options,
                },
                sink,
            ),
        }
    }
}

/// How the work of one paged call is split between source and dispatcher.
#[derive(Debug, Clone, Default)]
pub(crate) struct PagePlan {
    /// Options handed to the source.
    pub source_options: OperationOptions,
    /// Items the dispatcher drops before delivering.
    pub local_skip: u32,
    /// Type and key filters the dispatcher applies.
    pub local_filter: Option<OperationOptions>,
    /// The caller's count bound.
    pub limit: Option<u32>,
    /// Chunk size when the request is auto-split.
    pub split: Option<u32>,
}

#[derive(Debug)]
struct PageState {
    skipped: u32,
    delivered: u32,
    last_remaining: u32,
    last_source_remaining: Option<u32>,
    done: bool,
    /// Items received in the current split chunk.
    chunk_received: u32,
    chunk_skip: u32,
    chunk_size: u32,
    /// Items requested from the source so far.
    requested: u32,
}

pub(crate) struct PagedDelivery {
    this: Weak<PagedDelivery>,
    source: Arc<dyn Source>,
    request: Paged,
    keys: Vec<KeyId>,
    output: Arc<Output>,
    plan: PagePlan,
    state: Mutex<PageState>,
}

impl PagedDelivery {
    pub(crate) fn new(
        source: Arc<dyn Source>,
        request: Paged,
        keys: Vec<KeyId>,
        output: Arc<Output>,
        plan: PagePlan,
    ) -> Arc<Self> {
        let chunk_skip = plan.source_options.skip();
        let chunk_size = plan.split.unwrap_or(0);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            source,
            request,
            keys,
            output,
            state: Mutex::new(PageState {
                skipped: 0,
                delivered: 0,
                last_remaining: u32::MAX,
                last_source_remaining: None,
                done: false,
                chunk_received: 0,
                chunk_skip,
                chunk_size,
                requested: chunk_size,
            }),
            plan,
        })
    }

    /// Issue the first call to the source.
    pub(crate) fn start(&self) {
        let mut options = self.plan.source_options.clone();
        if let Some(size) = self.plan.split {
            options.set_count(size);
        }
        self.issue(options);
    }

    fn issue(&self, options: OperationOptions) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let op = self.output.op();
        let sink = ResultSink::new(op.id(), self.source.id(), this, op.token().clone());
        self.request
            .call(self.source.as_ref(), op.id(), self.keys.clone(), options, sink);
    }

    fn terminate(&self, seq: u64, outcome: Result<()>) {
        self.output
            .push_terminal(seq, outcome.map(|()| None), Vec::new());
    }
}

impl Delivery for PagedDelivery {
    fn item(&self, media: Media, source_remaining: u32) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        if let Some(previous) = state.last_source_remaining {
            if source_remaining > previous && self.plan.split.is_none() {
                tracing::warn!(
                    operation_id = %self.output.op().id(),
                    source = self.source.id(),
                    previous,
                    remaining = source_remaining,
                    "source reported an increasing remaining count"
                );
            }
        }
        state.last_source_remaining = Some(source_remaining);
        state.chunk_received += 1;

        if let Some(filter) = &self.plan.local_filter {
            if !filter.matches(&media) {
                return;
            }
        }
        if state.skipped < self.plan.local_skip {
            state.skipped += 1;
            return;
        }

        state.delivered += 1;
        let later = match (self.plan.split, self.plan.limit) {
            (Some(_), Some(limit)) => limit.saturating_sub(state.requested),
            _ => 0,
        };
        let mut remaining = source_remaining.saturating_add(1).saturating_add(later);
        if let Some(limit) = self.plan.limit {
            remaining = remaining.min(limit - state.delivered + 1);
        }
        remaining = remaining.min(state.last_remaining).max(1);
        state.last_remaining = remaining;

        let seq = self.output.reserve();
        let reached = self.plan.limit == Some(state.delivered);
        let terminal = reached.then(|| {
            state.done = true;
            self.output.reserve()
        });
        let delivered = state.delivered;
        drop(state);

        self.output.push_item(seq, media, remaining);
        if let Some(terminal) = terminal {
            tracing::debug!(operation_id = %self.output.op().id(), delivered, "count reached");
            self.terminate(terminal, Ok(()));
            self.output.op().stop_producing();
        }
    }

    fn finish(&self, outcome: Result<Option<Media>>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }

        if let (Ok(_), Some(threshold), Some(limit)) = (&outcome, self.plan.split, self.plan.limit)
        {
            let filled = state.chunk_received >= state.chunk_size;
            let wanted = limit.saturating_sub(state.requested);
            if filled && wanted > 0 && !self.output.op().token().is_cancelled() {
                state.chunk_skip += state.chunk_received;
                state.chunk_size = threshold.min(wanted);
                state.requested += state.chunk_size;
                state.chunk_received = 0;
                state.last_source_remaining = None;

                let mut options = self.plan.source_options.clone();
                options.set_skip(state.chunk_skip);
                options.set_count(state.chunk_size);
                tracing::debug!(
                    operation_id = %self.output.op().id(),
                    skip = state.chunk_skip,
                    count = state.chunk_size,
                    "requesting next chunk"
                );
                drop(state);
                self.issue(options);
                return;
            }
        }

        let outcome = match outcome {
            Ok(Some(_)) => {
                tracing::warn!(
                    operation_id = %self.output.op().id(),
                    source = self.source.id(),
                    "paged operation finished with a media item; ignored"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        state.done = true;
        let seq = self.output.reserve();
        drop(state);
        self.terminate(seq, outcome);
    }
}

/// Names of the negotiable fields set on `options`.
pub(crate) fn describe(options: &OperationOptions) -> String {
    use trove_core::OptionField;

    let names: Vec<&str> = [
        (OptionField::Skip, "skip"),
        (OptionField::Count, "count"),
        (OptionField::Flags, "flags"),
        (OptionField::TypeFilter, "type-filter"),
        (OptionField::KeyFilters, "key-filters"),
    ]
    .into_iter()
    .filter(|(field, _)| options.is_set(*field))
    .map(|(_, name)| name)
    .collect();
    names.join(", ")
}

pub(crate) fn rejected(source: &dyn Source, operation: OperationKind, unsupported: &OperationOptions) -> Error {
    Error::CapabilityRejected {
        source_id: source.id().to_string(),
        operation,
        detail: format!("unsupported options: {}", describe(unsupported)),
    }
}
