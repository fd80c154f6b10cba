//! Sinks through which a source answers an operation.
//!
//! Paged operations (browse, search, query) answer through a [`ResultSink`]:
//! any number of [`ResultSink::send`] calls followed by exactly one
//! [`ResultSink::finish`] or [`ResultSink::fail`]. Single-result operations
//! answer through a [`ReplySink`]. Finishing consumes the sink, so a source
//! cannot send after its terminal call; a sink dropped unfinished terminates
//! the operation with [`Error::SourceFailure`].

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use trove_core::{Error, Media, OperationId, Result};

/// Receiving end of a sink, implemented by the dispatcher.
pub trait Delivery: Send + Sync {
    /// One item; `remaining` is how many more items the source expects to send.
    fn item(&self, media: Media, remaining: u32);

    /// The terminal call. `Ok(Some(_))` carries the answer of a
    /// single-result operation.
    fn finish(&self, outcome: Result<Option<Media>>);
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

struct SinkCore {
    operation_id: OperationId,
    source_id: String,
    delivery: Option<Arc<dyn Delivery>>,
    cancellation: CancellationToken,
}

impl SinkCore {
    fn complete(&mut self, outcome: Result<Option<Media>>) {
        if let Some(delivery) = self.delivery.take() {
            delivery.finish(outcome);
        }
    }
}

impl Drop for SinkCore {
    fn drop(&mut self) {
        if self.delivery.is_some() {
            tracing::warn!(
                operation_id = %self.operation_id,
                source = %self.source_id,
                "sink dropped without a terminal call"
            );
            let err = Error::source_failure(
                self.source_id.clone(),
                "operation ended without a result",
            );
            self.complete(Err(err));
        }
    }
}

// ---------------------------------------------------------------------------
// ResultSink
// ---------------------------------------------------------------------------

/// Sink for browse, search and query.
pub struct ResultSink {
    core: SinkCore,
}

impl ResultSink {
    pub fn new(
        operation_id: OperationId,
        source_id: impl Into<String>,
        delivery: Arc<dyn Delivery>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            core: SinkCore {
                operation_id,
                source_id: source_id.into(),
                delivery: Some(delivery),
                cancellation,
            },
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.core.operation_id
    }

    /// Deliver one item. `remaining` counts the items still to come after it.
    pub fn send(&self, media: Media, remaining: u32) {
        if let Some(delivery) = &self.core.delivery {
            delivery.item(media, remaining);
        }
    }

    /// End the operation successfully.
    pub fn finish(mut self) {
        self.core.complete(Ok(None));
    }

    /// End the operation with an error.
    pub fn fail(mut self, err: Error) {
        self.core.complete(Err(err));
    }

    /// End the operation with `result`.
    pub fn complete(mut self, result: Result<()>) {
        self.core.complete(result.map(|()| None));
    }

    /// Whether the caller cancelled; sources should stop producing.
    pub fn is_cancelled(&self) -> bool {
        self.core.cancellation.is_cancelled()
    }

    /// Resolves once the caller cancels.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.core.cancellation.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancellation.clone()
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("operation_id", &self.core.operation_id)
            .field("source", &self.core.source_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ReplySink
// ---------------------------------------------------------------------------

/// Sink for resolve, store, store-metadata, remove and media-from-uri.
pub struct ReplySink {
    core: SinkCore,
}

impl ReplySink {
    pub fn new(
        operation_id: OperationId,
        source_id: impl Into<String>,
        delivery: Arc<dyn Delivery>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            core: SinkCore {
                operation_id,
                source_id: source_id.into(),
                delivery: Some(delivery),
                cancellation,
            },
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.core.operation_id
    }

    /// Answer with a media item.
    pub fn reply(mut self, media: Media) {
        self.core.complete(Ok(Some(media)));
    }

    /// Answer without a media item (e.g. after a removal).
    pub fn done(mut self) {
        self.core.complete(Ok(None));
    }

    pub fn fail(mut self, err: Error) {
        self.core.complete(Err(err));
    }

    pub fn complete(mut self, result: Result<Option<Media>>) {
        self.core.complete(result);
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.core.cancellation.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancellation.clone()
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink")
            .field("operation_id", &self.core.operation_id)
            .field("source", &self.core.source_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use trove_core::DispatcherId;

    /// Records everything a source sends.
    #[derive(Default)]
    pub struct Recorder {
        pub items: Mutex<Vec<(Media, u32)>>,
        pub outcome: Mutex<Option<Result<Option<Media>>>>,
    }

    impl Delivery for Recorder {
        fn item(&self, media: Media, remaining: u32) {
            self.items.lock().push((media, remaining));
        }

        fn finish(&self, outcome: Result<Option<Media>>) {
            let mut slot = self.outcome.lock();
            assert!(slot.is_none(), "finished twice");
            *slot = Some(outcome);
        }
    }

    pub fn op_id() -> OperationId {
        OperationId::new(DispatcherId::new(), 1)
    }

    pub fn result_sink(recorder: &Arc<Recorder>) -> ResultSink {
        ResultSink::new(op_id(), "test", recorder.clone(), CancellationToken::new())
    }

    pub fn reply_sink(recorder: &Arc<Recorder>) -> ReplySink {
        ReplySink::new(op_id(), "test", recorder.clone(), CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn finish_reaches_delivery_once() {
        let recorder = Arc::new(Recorder::default());
        let sink = result_sink(&recorder);
        sink.send(Media::audio().with_id("a"), 1);
        sink.send(Media::audio().with_id("b"), 0);
        sink.finish();
        assert_eq!(recorder.items.lock().len(), 2);
        assert_matches!(recorder.outcome.lock().take(), Some(Ok(None)));
    }

    #[test]
    fn dropped_sink_fails_the_operation() {
        let recorder = Arc::new(Recorder::default());
        drop(result_sink(&recorder));
        assert_matches!(
            recorder.outcome.lock().take(),
            Some(Err(Error::SourceFailure { .. }))
        );
    }

    #[test]
    fn reply_carries_media() {
        let recorder = Arc::new(Recorder::default());
        reply_sink(&recorder).reply(Media::video().with_id("v"));
        let outcome = recorder.outcome.lock().take();
        assert_matches!(outcome, Some(Ok(Some(media))) if media.id() == Some("v"));
    }

    #[test]
    fn cancellation_is_visible_to_the_source() {
        let recorder = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let sink = ResultSink::new(op_id(), "test", recorder.clone(), token.clone());
        assert!(!sink.is_cancelled());
        token.cancel();
        assert!(sink.is_cancelled());
        sink.fail(Error::Cancelled);
    }
}
