//! Per-operation state and the delivery rules every chunk goes through.
//!
//! All chunks of an operation pass [`Operation::emit`], which enforces the
//! delivery contract: at most one terminal chunk, nothing after it, and no
//! non-terminal chunk once the caller has cancelled. Callbacks run under a
//! per-operation reentrant lock that [`Operation::cancel`] also takes, so a
//! cancel waits for a callback already in progress and every chunk checked
//! after it sees the cancellation.
//!
//! Cancel against an operation whose terminal chunk is already committed is
//! a no-op; otherwise the caller receives one terminal chunk carrying
//! [`Error::Cancelled`] and nothing else.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use trove_core::{Error, OperationId, OperationKind};
use trove_source::Source;

use crate::chunk::{Chunk, ResultCallback};
use crate::relay::Relay;

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Created,
    Dispatched,
    Delivering,
    Completed,
    Cancelled,
    Failed,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationPhase::Completed | OperationPhase::Cancelled | OperationPhase::Failed
        )
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationPhase::Created => "created",
            OperationPhase::Dispatched => "dispatched",
            OperationPhase::Delivering => "delivering",
            OperationPhase::Completed => "completed",
            OperationPhase::Cancelled => "cancelled",
            OperationPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

pub(crate) struct Operation {
    id: OperationId,
    kind: OperationKind,
    source: Option<Arc<dyn Source>>,
    callback: ResultCallback,
    relay: Option<Arc<dyn Relay>>,
    table: Weak<OperationTable>,
    token: CancellationToken,
    phase: Mutex<OperationPhase>,
    delivery: ReentrantMutex<()>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    children: Mutex<Vec<Weak<Operation>>>,
}

impl Operation {
    pub(crate) fn new(
        id: OperationId,
        kind: OperationKind,
        source: Option<Arc<dyn Source>>,
        callback: ResultCallback,
        relay: Option<Arc<dyn Relay>>,
        table: Weak<OperationTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            source,
            callback,
            relay,
            table,
            token: CancellationToken::new(),
            phase: Mutex::new(OperationPhase::Created),
            delivery: ReentrantMutex::new(()),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    pub(crate) fn kind(&self) -> OperationKind {
        self.kind
    }

    pub(crate) fn source_id(&self) -> Option<String> {
        self.source.as_ref().map(|s| s.id().to_string())
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn phase(&self) -> OperationPhase {
        *self.phase.lock()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn advance(&self, next: OperationPhase) {
        let mut phase = self.phase.lock();
        if !phase.is_terminal() {
            *phase = next;
        }
    }

    pub(crate) fn mark_dispatched(&self) {
        let mut phase = self.phase.lock();
        if *phase == OperationPhase::Created {
            *phase = OperationPhase::Dispatched;
        }
    }

    /// Ask the producer to stop without cancelling the operation, e.g. once
    /// the count bound is reached.
    pub(crate) fn stop_producing(&self) {
        self.token.cancel();
    }

    /// Attach a sub-operation that is cancelled together with this one.
    pub(crate) fn add_child(&self, child: &Arc<Operation>) {
        let mut children = self.children.lock();
        if self.is_cancelled() {
            drop(children);
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(child));
        }
    }

    /// Cancel every live sub-operation.
    pub(crate) fn cancel_children(&self) {
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    /// Route `chunk` to the caller, inline or through the relay.
    pub(crate) fn emit(self: &Arc<Self>, chunk: Chunk) {
        if chunk.is_terminal() {
            if self.finished.swap(true, Ordering::SeqCst) {
                if !self.is_cancelled() {
                    tracing::warn!(operation_id = %self.id, "dropping second terminal chunk");
                }
                return;
            }
            let phase = match &chunk.error {
                None => OperationPhase::Completed,
                Some(e) if e.is_cancelled() => OperationPhase::Cancelled,
                Some(_) => OperationPhase::Failed,
            };
            self.advance(phase);
        } else {
            if self.is_finished() {
                if !self.is_cancelled() {
                    tracing::warn!(operation_id = %self.id, "dropping chunk after terminal");
                }
                return;
            }
            if self.is_cancelled() {
                return;
            }
            self.advance(OperationPhase::Delivering);
        }

        match &self.relay {
            Some(relay) => {
                let op = self.clone();
                relay.post(Box::new(move || op.deliver(chunk)));
            }
            None => self.deliver(chunk),
        }
    }

    fn deliver(&self, chunk: Chunk) {
        let _guard = self.delivery.lock();
        let terminal = chunk.is_terminal();
        if !terminal && self.is_cancelled() {
            tracing::trace!(operation_id = %self.id, "suppressing chunk of cancelled operation");
            return;
        }

        tracing::debug!(
            operation_id = %self.id,
            source = chunk.source.as_deref().unwrap_or("-"),
            remaining = chunk.remaining,
            has_media = chunk.media.is_some(),
            error = chunk.error.as_ref().map(|e| e.code()),
            "chunk"
        );
        self.callback.call(chunk);

        if terminal {
            if let Some(table) = self.table.upgrade() {
                table.remove(self.id);
            }
        }
    }

    /// Cancel the operation, its sub-operations and the producing source.
    pub(crate) fn cancel(self: &Arc<Self>) {
        {
            let _guard = self.delivery.lock();
            if self.is_finished() {
                tracing::debug!(operation_id = %self.id, "cancel after terminal chunk ignored");
                return;
            }
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            tracing::debug!(operation_id = %self.id, kind = %self.kind, "cancelling operation");
            self.emit(Chunk::terminal(self.id, self.source_id(), Err(Error::Cancelled)));
        }

        self.token.cancel();
        self.cancel_children();
        if let Some(source) = &self.source {
            source.cancel(self.id);
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// OperationTable
// ---------------------------------------------------------------------------

/// Outstanding operations of one dispatcher, removed once their terminal
/// chunk has been delivered.
#[derive(Debug, Default)]
pub(crate) struct OperationTable {
    ops: DashMap<OperationId, Arc<Operation>>,
}

impl OperationTable {
    pub(crate) fn insert(&self, op: Arc<Operation>) {
        self.ops.insert(op.id(), op);
    }

    pub(crate) fn get(&self, id: OperationId) -> Option<Arc<Operation>> {
        self.ops.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: OperationId) {
        self.ops.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MainLoop;
    use trove_core::{DispatcherId, Media};

    fn operation(
        relay: Option<Arc<dyn Relay>>,
        table: &Arc<OperationTable>,
    ) -> (Arc<Operation>, Arc<Mutex<Vec<Chunk>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = ResultCallback::new(move |chunk| sink.lock().push(chunk));
        let id = OperationId::new(DispatcherId::new(), 1);
        let op = Operation::new(
            id,
            OperationKind::Browse,
            None,
            callback,
            relay,
            Arc::downgrade(table),
        );
        table.insert(op.clone());
        (op, seen)
    }

    #[test]
    fn single_terminal_and_nothing_after() {
        let table = Arc::new(OperationTable::default());
        let (op, seen) = operation(None, &table);
        op.emit(Chunk::item(op.id(), None, Media::audio(), 2));
        op.emit(Chunk::terminal(op.id(), None, Ok(None)));
        op.emit(Chunk::terminal(op.id(), None, Ok(None)));
        op.emit(Chunk::item(op.id(), None, Media::audio(), 1));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_terminal());
        assert_eq!(op.phase(), OperationPhase::Completed);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn cancel_delivers_one_cancelled_terminal() {
        let table = Arc::new(OperationTable::default());
        let (op, seen) = operation(None, &table);
        op.emit(Chunk::item(op.id(), None, Media::audio(), 3));
        op.cancel();
        op.emit(Chunk::item(op.id(), None, Media::audio(), 2));
        op.emit(Chunk::terminal(op.id(), None, Ok(None)));
        op.cancel();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_cancelled());
        assert!(op.token().is_cancelled());
        assert_eq!(op.phase(), OperationPhase::Cancelled);
    }

    #[test]
    fn cancel_after_terminal_is_a_noop() {
        let table = Arc::new(OperationTable::default());
        let (op, seen) = operation(None, &table);
        op.emit(Chunk::terminal(op.id(), None, Ok(None)));
        op.cancel();
        assert_eq!(seen.lock().len(), 1);
        assert!(!op.is_cancelled());
        assert_eq!(op.phase(), OperationPhase::Completed);
    }

    #[test]
    fn relayed_chunks_queued_before_cancel_are_suppressed() {
        let table = Arc::new(OperationTable::default());
        let main_loop = MainLoop::new();
        let (op, seen) = operation(Some(Arc::new(main_loop.clone())), &table);
        op.emit(Chunk::item(op.id(), None, Media::audio(), 2));
        op.emit(Chunk::item(op.id(), None, Media::audio(), 1));
        assert!(seen.lock().is_empty());

        op.cancel();
        main_loop.dispatch_pending();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_cancelled());
    }

    #[test]
    fn children_are_cancelled_with_parent() {
        let table = Arc::new(OperationTable::default());
        let (parent, _) = operation(None, &table);
        let (child, child_seen) = operation(None, &table);
        parent.add_child(&child);
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(child_seen.lock()[0].is_cancelled());

        let (late, _) = operation(None, &table);
        parent.add_child(&late);
        assert!(late.is_cancelled());
    }
}
