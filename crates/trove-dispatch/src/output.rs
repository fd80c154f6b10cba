//! Ordered emission of an operation's chunks.
//!
//! Chunks reserve a sequence number when they are produced and reach the
//! operation in that order, even when full resolution finishes items out of
//! order. A terminal chunk therefore waits for every item produced before it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use trove_core::{Error, KeyId, Media};
use trove_source::Delivery;

use crate::chunk::Chunk;
use crate::operation::Operation;
use crate::resolve::FullResolution;

#[derive(Default)]
struct Order {
    next_seq: u64,
    next_emit: u64,
    ready: BTreeMap<u64, Chunk>,
    draining: bool,
}

pub(crate) struct Output {
    op: Arc<Operation>,
    resolution: Option<Arc<FullResolution>>,
    order: Mutex<Order>,
}

impl Output {
    pub(crate) fn new(op: Arc<Operation>, resolution: Option<Arc<FullResolution>>) -> Arc<Self> {
        Arc::new(Self {
            op,
            resolution,
            order: Mutex::new(Order::default()),
        })
    }

    pub(crate) fn op(&self) -> &Arc<Operation> {
        &self.op
    }

    /// Claim the next position in the chunk order.
    pub(crate) fn reserve(&self) -> u64 {
        let mut order = self.order.lock();
        let seq = order.next_seq;
        order.next_seq += 1;
        seq
    }

    pub(crate) fn push_item(self: &Arc<Self>, seq: u64, media: Media, remaining: u32) {
        let id = self.op.id();
        let source = self.op.source_id();
        match &self.resolution {
            Some(resolution) => {
                let this = self.clone();
                resolution.resolve(&self.op, media, move |media| {
                    this.ready(seq, Chunk::item(id, source, media, remaining));
                });
            }
            None => self.ready(seq, Chunk::item(id, source, media, remaining)),
        }
    }

    pub(crate) fn push_terminal(
        self: &Arc<Self>,
        seq: u64,
        outcome: Result<Option<Media>, Error>,
        failed_keys: Vec<KeyId>,
    ) {
        let id = self.op.id();
        let source = self.op.source_id();
        let finish = move |outcome| {
            let mut chunk = Chunk::terminal(id, source, outcome);
            chunk.failed_keys = failed_keys;
            chunk
        };
        match (&self.resolution, outcome) {
            (Some(resolution), Ok(Some(media))) => {
                let this = self.clone();
                resolution.resolve(&self.op, media, move |media| {
                    this.ready(seq, finish(Ok(Some(media))));
                });
            }
            (_, outcome) => self.ready(seq, finish(outcome)),
        }
    }

    /// Place a ready-made chunk at `seq`.
    pub(crate) fn push(&self, seq: u64, chunk: Chunk) {
        self.ready(seq, chunk);
    }

    fn ready(&self, seq: u64, chunk: Chunk) {
        {
            let mut order = self.order.lock();
            order.ready.insert(seq, chunk);
            if order.draining {
                return;
            }
            order.draining = true;
        }

        loop {
            let next = {
                let mut order = self.order.lock();
                let seq = order.next_emit;
                match order.ready.remove(&seq) {
                    Some(chunk) => {
                        order.next_emit += 1;
                        Some(chunk)
                    }
                    None => {
                        order.draining = false;
                        None
                    }
                }
            };
            match next {
                Some(chunk) => self.op.emit(chunk),
                None => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ReplyDelivery
// ---------------------------------------------------------------------------

/// Delivery for single-result operations: the reply becomes the terminal
/// chunk.
pub(crate) struct ReplyDelivery {
    output: Arc<Output>,
    failed_keys: Vec<KeyId>,
}

impl ReplyDelivery {
    pub(crate) fn new(output: Arc<Output>, failed_keys: Vec<KeyId>) -> Arc<Self> {
        Arc::new(Self {
            output,
            failed_keys,
        })
    }
}

impl Delivery for ReplyDelivery {
    fn item(&self, _media: Media, _remaining: u32) {
        tracing::warn!(
            operation_id = %self.output.op().id(),
            "item sent on a single-result operation; ignored"
        );
    }

    fn finish(&self, outcome: Result<Option<Media>, Error>) {
        let seq = self.output.reserve();
        self.output
            .push_terminal(seq, outcome, self.failed_keys.clone());
    }
}
