//! Operations as [`futures::Stream`]s of chunks.
//!
//! The stream yields every chunk, the terminal one last, and then ends.
//! Dropping it early cancels the operation.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use trove_core::{KeyId, Media, OperationId, OperationOptions, Result};
use trove_source::Source;

use crate::chunk::{Chunk, ResultCallback};
use crate::dispatcher::{without_relay, Dispatcher};

/// Chunks of one operation.
pub struct ChunkStream {
    dispatcher: Dispatcher,
    operation_id: OperationId,
    inner: UnboundedReceiverStream<Chunk>,
    finished: bool,
}

impl ChunkStream {
    fn start(
        dispatcher: &Dispatcher,
        start: impl FnOnce(ResultCallback) -> Result<OperationId>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = ResultCallback::new(move |chunk| {
            // The receiver is gone once the stream is dropped.
            let _ = tx.send(chunk);
        });
        let operation_id = start(callback)?;
        Ok(Self::new(dispatcher, operation_id, rx))
    }

    fn new(dispatcher: &Dispatcher, operation_id: OperationId, rx: mpsc::UnboundedReceiver<Chunk>) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            operation_id,
            inner: UnboundedReceiverStream::new(rx),
            finished: false,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Collect the media items, failing on a terminal error.
    pub async fn into_media(mut self) -> Result<Vec<Media>> {
        use futures::StreamExt;

        let mut items = Vec::new();
        while let Some(chunk) = self.next().await {
            if let Some(error) = chunk.error {
                if chunk.remaining == 0 {
                    return Err(error);
                }
                tracing::warn!(operation_id = %self.operation_id, error = %error, "source failed");
                continue;
            }
            items.extend(chunk.media);
        }
        Ok(items)
    }
}

impl Stream for ChunkStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(operation_id = %self.operation_id, "stream dropped; cancelling");
            self.dispatcher.cancel(self.operation_id);
        }
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("operation_id", &self.operation_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn browse_stream(
        &self,
        source: &Arc<dyn Source>,
        container: Option<&Media>,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<ChunkStream> {
        let options = without_relay(options);
        ChunkStream::start(self, |cb| self.browse(source, container, keys, &options, cb))
    }

    pub fn search_stream(
        &self,
        source: &Arc<dyn Source>,
        text: Option<&str>,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<ChunkStream> {
        let options = without_relay(options);
        ChunkStream::start(self, |cb| self.search(source, text, keys, &options, cb))
    }

    pub fn query_stream(
        &self,
        source: &Arc<dyn Source>,
        query: &str,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<ChunkStream> {
        let options = without_relay(options);
        ChunkStream::start(self, |cb| self.query(source, query, keys, &options, cb))
    }

    pub fn multiple_search_stream(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        text: Option<&str>,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> ChunkStream {
        let options = without_relay(options);
        let (tx, rx) = mpsc::unbounded_channel();
        let operation_id = self.multiple_search(sources, text, keys, &options, move |chunk: Chunk| {
            let _ = tx.send(chunk);
        });
        ChunkStream::new(self, operation_id, rx)
    }
}
