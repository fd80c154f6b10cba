//! Fan-out: one logical operation over several sources under a single id.
//!
//! Every source runs as a regular sub-operation registered as a child of the
//! aggregate, so cancelling the aggregate cancels all of them. A bounded
//! count is split across the sources, the first one taking the remainder;
//! when a round ends short, sources that filled their share are asked for the
//! missing items, continuing after what they already delivered.
//!
//! A failing source produces one error-only chunk and the others carry on.
//! The aggregate terminal chunk carries no error unless the caller
//! cancelled, or no source could take the request at all
//! ([`Error::NoSources`]).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use trove_core::{Error, KeyId, Media, OperationId, OperationKind, OperationOptions, OptionField};
use trove_source::Source;

use crate::chunk::{Chunk, ResultCallback};
use crate::dispatcher::{without_relay, Dispatcher};
use crate::operation::Operation;
use crate::output::Output;
use crate::paged::Paged;

/// Split `limit` across `n` sources; the first takes the remainder.
pub(crate) fn split_count(limit: u32, n: usize) -> Vec<u32> {
    if n == 0 {
        return Vec::new();
    }
    let n32 = n as u32;
    let base = limit / n32;
    let mut shares = vec![base; n];
    shares[0] = limit - base * (n32 - 1);
    shares
}

fn supporting(sources: Vec<Arc<dyn Source>>, kind: OperationKind) -> Vec<Arc<dyn Source>> {
    sources
        .into_iter()
        .filter(|s| s.supported_operations().contains(kind.as_flag()))
        .collect()
}

impl Dispatcher {
    fn fan_out_sources(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        kind: OperationKind,
    ) -> Vec<Arc<dyn Source>> {
        match sources {
            Some(sources) => supporting(sources.to_vec(), kind),
            None => self.registry().sources_by_operation(kind.as_flag(), true),
        }
    }

    /// Search every source in `sources`, or every search-capable source by
    /// rank when `None`.
    ///
    /// `skip` applies to each source separately: every source starts after
    /// its own first `skip` results. `count` bounds the aggregate.
    pub fn multiple_search(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        text: Option<&str>,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> OperationId {
        let request = Paged::Search(text.map(str::to_string));
        self.fan_out(sources, request, keys, options, callback.into())
    }

    /// Run the same query on several sources. `skip` and `count` behave as
    /// in [`Dispatcher::multiple_search`].
    pub fn multiple_query(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        query: &str,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> OperationId {
        let request = Paged::Query(query.to_string());
        self.fan_out(sources, request, keys, options, callback.into())
    }

    pub(crate) fn fan_out(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        request: Paged,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: ResultCallback,
    ) -> OperationId {
        let kind = request.kind();
        let sources = self.fan_out_sources(sources, kind);
        let op = self.register_operation(kind, None, options.flags(), callback);
        op.mark_dispatched();
        let id = op.id();

        if sources.is_empty() {
            tracing::debug!(operation_id = %id, %kind, "no source for fan-out");
            op.emit(Chunk::terminal(id, None, Err(Error::NoSources(kind))));
            return id;
        }

        let limit = options.count().as_limit();
        let shares: Vec<Option<u32>> = match limit {
            Some(limit) => split_count(limit, sources.len()).into_iter().map(Some).collect(),
            None => vec![None; sources.len()],
        };
        let skip = options.skip();
        let subs: Vec<Sub> = sources
            .into_iter()
            .zip(shares)
            .map(|(source, share)| Sub {
                source,
                skip,
                share,
                received: 0,
                remaining: 1,
                running: share != Some(0),
                exhausted: false,
            })
            .collect();
        let launch: Vec<usize> = (0..subs.len()).filter(|i| subs[*i].running).collect();

        let mut base = without_relay(options);
        base.clear(OptionField::Skip);
        base.clear(OptionField::Count);

        tracing::debug!(operation_id = %id, %kind, sources = subs.len(), "fan-out");
        let fan = Arc::new_cyclic(|this| FanOut {
            this: this.clone(),
            dispatcher: self.clone(),
            output: Output::new(op, None),
            request,
            keys: keys.to_vec(),
            options: base,
            limit,
            state: Mutex::new(FanState {
                subs,
                delivered: 0,
                last_remaining: u32::MAX,
                finished: false,
            }),
        });
        for index in launch {
            fan.issue(index);
        }
        id
    }

    /// Resolve `media` on every eligible source. Each answer arrives as its
    /// own chunk; the terminal chunk carries all answers merged in rank order.
    pub fn multiple_resolve(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        media: &Media,
        keys: &[KeyId],
        options: &OperationOptions,
        callback: impl Into<ResultCallback>,
    ) -> OperationId {
        let kind = OperationKind::Resolve;
        let sources: Vec<Arc<dyn Source>> = self
            .fan_out_sources(sources, kind)
            .into_iter()
            .filter(|s| {
                media.source() == Some(s.id()) || keys.iter().any(|k| s.may_resolve(media, *k))
            })
            .collect();
        let op = self.register_operation(kind, None, options.flags(), callback.into());
        op.mark_dispatched();
        let id = op.id();

        if sources.is_empty() {
            op.emit(Chunk::terminal(id, None, Err(Error::NoSources(kind))));
            return id;
        }

        let gather = Arc::new(Gather {
            output: Output::new(op, None),
            original: media.clone(),
            state: Mutex::new(GatherState {
                results: vec![None; sources.len()],
                running: sources.len(),
                finished: false,
            }),
        });
        let options = without_relay(options);
        for (index, source) in sources.iter().enumerate() {
            let handler = gather.clone();
            let source_id = source.id().to_string();
            let callback = ResultCallback::new(move |chunk| handler.on_chunk(index, chunk));
            match self.start_resolve(source, media, keys, &options, callback) {
                Ok(child) => gather.output.op().add_child(&child),
                Err(e) => gather.failed(index, source_id, e),
            }
        }
        id
    }
}

// ---------------------------------------------------------------------------
// Paged fan-out
// ---------------------------------------------------------------------------

struct Sub {
    source: Arc<dyn Source>,
    /// Skip for the next request to this source.
    skip: u32,
    /// Count asked for in the current round.
    share: Option<u32>,
    received: u32,
    /// Last `remaining` of the running sub-operation.
    remaining: u32,
    running: bool,
    exhausted: bool,
}

struct FanState {
    subs: Vec<Sub>,
    delivered: u32,
    last_remaining: u32,
    finished: bool,
}

impl FanState {
    fn estimate(&mut self, limit: Option<u32>) -> u32 {
        let estimate = match limit {
            Some(limit) => limit.saturating_sub(self.delivered).saturating_add(1),
            None => self
                .subs
                .iter()
                .filter(|s| s.running)
                .map(|s| s.remaining.saturating_sub(1))
                .fold(1u32, u32::saturating_add),
        };
        let remaining = estimate.min(self.last_remaining).max(1);
        self.last_remaining = remaining;
        remaining
    }
}

struct FanOut {
    this: Weak<FanOut>,
    dispatcher: Dispatcher,
    output: Arc<Output>,
    request: Paged,
    keys: Vec<KeyId>,
    options: OperationOptions,
    limit: Option<u32>,
    state: Mutex<FanState>,
}

impl FanOut {
    fn op(&self) -> &Arc<Operation> {
        self.output.op()
    }

    /// Start the sub-operation for `index`, already marked running.
    fn issue(&self, index: usize) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let (source, options) = {
            let mut state = self.state.lock();
            let sub = &mut state.subs[index];
            sub.received = 0;
            sub.remaining = 1;
            let mut options = self.options.clone();
            if sub.skip > 0 {
                options.set_skip(sub.skip);
            }
            if let Some(share) = sub.share {
                options.set_count(share);
            }
            (sub.source.clone(), options)
        };

        let callback = ResultCallback::new(move |chunk| this.on_chunk(index, chunk));
        match self
            .dispatcher
            .start_paged(&source, self.request.clone(), &self.keys, &options, callback)
        {
            Ok(child) => self.op().add_child(&child),
            Err(e) => self.on_terminal(index, Some(e)),
        }
    }

    fn on_chunk(&self, index: usize, chunk: Chunk) {
        if chunk.is_terminal() {
            return self.on_terminal(index, chunk.error);
        }
        let Some(media) = chunk.media else {
            return;
        };
        if self.op().is_cancelled() {
            return;
        }

        let (seq, remaining, source_id, terminal) = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            let sub = &mut state.subs[index];
            sub.received += 1;
            sub.remaining = chunk.remaining;
            let source_id = sub.source.id().to_string();
            state.delivered += 1;
            let remaining = state.estimate(self.limit);
            let seq = self.output.reserve();
            let terminal = (self.limit == Some(state.delivered)).then(|| {
                state.finished = true;
                self.output.reserve()
            });
            (seq, remaining, source_id, terminal)
        };

        let id = self.op().id();
        self.output
            .push(seq, Chunk::item(id, Some(source_id), media, remaining));
        if let Some(terminal) = terminal {
            tracing::debug!(operation_id = %id, "fan-out count reached");
            self.output.push(terminal, Chunk::terminal(id, None, Ok(None)));
            self.op().cancel_children();
        }
    }

    fn on_terminal(&self, index: usize, error: Option<Error>) {
        if self.op().is_cancelled() {
            return;
        }
        let id = self.op().id();
        let mut frame = None;
        let mut terminal = None;
        let mut launch = Vec::new();
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            let sub = &mut state.subs[index];
            sub.running = false;
            let source_id = sub.source.id().to_string();
            match error {
                Some(e) => {
                    sub.exhausted = true;
                    if !e.is_cancelled() {
                        tracing::debug!(operation_id = %id, source = %source_id, error = %e, "fan-out source failed");
                        let remaining = state.estimate(self.limit);
                        frame = Some((
                            self.output.reserve(),
                            Chunk::error_frame(id, Some(source_id), e, remaining),
                        ));
                    }
                }
                None => match sub.share {
                    Some(share) if sub.received >= share => sub.skip += sub.received,
                    _ => sub.exhausted = true,
                },
            }

            if !state.subs.iter().any(|s| s.running) {
                let shortfall = self.limit.map_or(0, |l| l.saturating_sub(state.delivered));
                let candidates: Vec<usize> = (0..state.subs.len())
                    .filter(|i| !state.subs[*i].exhausted)
                    .collect();
                if shortfall > 0 && !candidates.is_empty() {
                    let shares = split_count(shortfall, candidates.len());
                    for (i, share) in candidates.into_iter().zip(shares) {
                        let sub = &mut state.subs[i];
                        sub.share = Some(share);
                        if share > 0 {
                            sub.running = true;
                            launch.push(i);
                        }
                    }
                    tracing::debug!(operation_id = %id, shortfall, sources = launch.len(), "refilling fan-out");
                }
                if launch.is_empty() {
                    state.finished = true;
                    terminal = Some(self.output.reserve());
                }
            }
        }

        if let Some((seq, chunk)) = frame {
            self.output.push(seq, chunk);
        }
        if let Some(seq) = terminal {
            self.output.push(seq, Chunk::terminal(id, None, Ok(None)));
        }
        for index in launch {
            self.issue(index);
        }
    }
}

// ---------------------------------------------------------------------------
// Resolve fan-out
// ---------------------------------------------------------------------------

struct GatherState {
    results: Vec<Option<Media>>,
    running: usize,
    finished: bool,
}

struct Gather {
    output: Arc<Output>,
    original: Media,
    state: Mutex<GatherState>,
}

impl Gather {
    fn on_chunk(&self, index: usize, chunk: Chunk) {
        if !chunk.is_terminal() {
            return;
        }
        let source_id = chunk.source.clone().unwrap_or_default();
        match (chunk.media, chunk.error) {
            (_, Some(e)) => self.failed(index, source_id, e),
            (media, None) => self.answered(index, source_id, media),
        }
    }

    fn answered(&self, index: usize, source_id: String, media: Option<Media>) {
        let id = self.output.op().id();
        let (seq, remaining, terminal) = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.results[index] = media.clone();
            self.step(&mut state)
        };
        let chunk = match media {
            Some(media) => Chunk::item(id, Some(source_id), media, remaining),
            // Nothing to show for this source; keep the sequence dense.
            None => Chunk::error_frame(
                id,
                Some(source_id.clone()),
                Error::not_found("media", source_id),
                remaining,
            ),
        };
        self.output.push(seq, chunk);
        self.finish(terminal);
    }

    fn failed(&self, index: usize, source_id: String, error: Error) {
        if error.is_cancelled() || self.output.op().is_cancelled() {
            return;
        }
        let id = self.output.op().id();
        let (seq, remaining, terminal) = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.results[index] = None;
            self.step(&mut state)
        };
        self.output
            .push(seq, Chunk::error_frame(id, Some(source_id), error, remaining));
        self.finish(terminal);
    }

    /// Account for one finished source: a slot for its chunk, its
    /// `remaining`, and the terminal slot with the merged media if it was
    /// the last.
    fn step(&self, state: &mut GatherState) -> (u64, u32, Option<(u64, Media)>) {
        state.running = state.running.saturating_sub(1);
        let seq = self.output.reserve();
        let remaining = state.running as u32 + 1;
        let terminal = (state.running == 0).then(|| {
            state.finished = true;
            let mut merged = self.original.clone();
            for result in state.results.iter().flatten() {
                merged.merge_missing(result);
            }
            (self.output.reserve(), merged)
        });
        (seq, remaining, terminal)
    }

    fn finish(&self, terminal: Option<(u64, Media)>) {
        if let Some((seq, merged)) = terminal {
            let id = self.output.op().id();
            self.output
                .push(seq, Chunk::terminal(id, None, Ok(Some(merged))));
        }
    }
}
