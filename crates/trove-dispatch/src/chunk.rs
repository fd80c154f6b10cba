//! What the caller receives.

use std::fmt;
use std::sync::Arc;

use trove_core::{Error, KeyId, Media, OperationId};

use crate::relay::Relay;

/// One callback invocation of an operation.
///
/// `remaining` counts the invocations still to come for the same operation,
/// including the terminal one, so it reaches `0` exactly once: on the
/// terminal chunk, which is the last chunk of the operation.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub operation_id: OperationId,
    /// Source that produced the chunk; `None` on fan-out terminals.
    pub source: Option<String>,
    pub media: Option<Media>,
    pub remaining: u32,
    pub error: Option<Error>,
    /// Keys a store-metadata operation could not write.
    pub failed_keys: Vec<KeyId>,
}

impl Chunk {
    pub(crate) fn item(
        operation_id: OperationId,
        source: Option<String>,
        media: Media,
        remaining: u32,
    ) -> Self {
        Self {
            operation_id,
            source,
            media: Some(media),
            remaining: remaining.max(1),
            error: None,
            failed_keys: Vec::new(),
        }
    }

    /// A non-terminal frame carrying only an error.
    pub(crate) fn error_frame(
        operation_id: OperationId,
        source: Option<String>,
        error: Error,
        remaining: u32,
    ) -> Self {
        Self {
            operation_id,
            source,
            media: None,
            remaining: remaining.max(1),
            error: Some(error),
            failed_keys: Vec::new(),
        }
    }

    pub(crate) fn terminal(
        operation_id: OperationId,
        source: Option<String>,
        outcome: Result<Option<Media>, Error>,
    ) -> Self {
        let (media, error) = match outcome {
            Ok(media) => (media, None),
            Err(e) => (None, Some(e)),
        };
        Self {
            operation_id,
            source,
            media,
            remaining: 0,
            error,
            failed_keys: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.remaining == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(Error::is_cancelled)
    }
}

// ---------------------------------------------------------------------------
// ResultCallback
// ---------------------------------------------------------------------------

/// The caller's chunk handler.
///
/// Any `Fn(Chunk) + Send + Sync` converts into a callback. A callback may
/// carry its own relay, which then replaces the dispatcher's default relay
/// for operations started with [`ResolutionFlags::IDLE_RELAY`].
///
/// [`ResolutionFlags::IDLE_RELAY`]: trove_core::ResolutionFlags::IDLE_RELAY
#[derive(Clone)]
pub struct ResultCallback {
    handler: Arc<dyn Fn(Chunk) + Send + Sync>,
    relay: Option<Arc<dyn Relay>>,
}

impl ResultCallback {
    pub fn new(handler: impl Fn(Chunk) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            relay: None,
        }
    }

    /// Builder: deliver relayed chunks through `relay`.
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn relay(&self) -> Option<&Arc<dyn Relay>> {
        self.relay.as_ref()
    }

    pub(crate) fn call(&self, chunk: Chunk) {
        (self.handler)(chunk);
    }
}

impl<F> From<F> for ResultCallback
where
    F: Fn(Chunk) + Send + Sync + 'static,
{
    fn from(handler: F) -> Self {
        Self::new(handler)
    }
}

impl fmt::Debug for ResultCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCallback")
            .field("relay", &self.relay.is_some())
            .finish_non_exhaustive()
    }
}
