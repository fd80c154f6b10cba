//! Blocking forms of the dispatcher operations.
//!
//! Each `*_sync` call starts the asynchronous operation without
//! `IDLE_RELAY`, collects its chunks and returns once the terminal chunk has
//! arrived. A terminal error is returned as `Err`; nothing is returned
//! partially. With `dispatch.sync_timeout_secs` set, an operation still
//! running at the deadline is cancelled and [`Error::Timeout`] returned.
//!
//! These calls park the current thread. Sources that answer from a tokio
//! runtime need that runtime to run on other threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use trove_core::{Error, KeyId, Media, OperationId, OperationOptions, Result};
use trove_source::Source;

use crate::chunk::{Chunk, ResultCallback};
use crate::dispatcher::{without_relay, Dispatcher};

#[derive(Default)]
struct Collected {
    items: Vec<Media>,
    /// Error-only frames from the sources of a fan-out.
    errors: Vec<(Option<String>, Error)>,
    terminal: Option<Chunk>,
}

#[derive(Default)]
struct Collector {
    state: Mutex<Collected>,
    done: Condvar,
}

impl Collector {
    fn callback(self: &Arc<Self>) -> ResultCallback {
        let this = self.clone();
        ResultCallback::new(move |chunk: Chunk| {
            let mut state = this.state.lock();
            if chunk.is_terminal() {
                state.terminal = Some(chunk);
                this.done.notify_all();
                return;
            }
            match (chunk.media, chunk.error) {
                (Some(media), _) => state.items.push(media),
                (None, Some(error)) => state.errors.push((chunk.source, error)),
                (None, None) => {}
            }
        })
    }

    fn wait(&self, dispatcher: &Dispatcher, id: OperationId) -> Result<(Collected, Chunk)> {
        let timeout = dispatcher.config().sync_timeout_secs;
        let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut state = self.state.lock();
        while state.terminal.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut state, deadline).timed_out()
                        && state.terminal.is_none()
                    {
                        drop(state);
                        let secs = timeout.unwrap_or_default();
                        tracing::warn!(operation_id = %id, secs, "blocking call timed out; cancelling");
                        dispatcher.cancel(id);
                        return Err(Error::Timeout { secs });
                    }
                }
                None => self.done.wait(&mut state),
            }
        }
        let mut collected = std::mem::take(&mut *state);
        let terminal = collected
            .terminal
            .take()
            .ok_or_else(|| Error::Internal("terminal chunk vanished".into()))?;
        if let Some(error) = terminal.error.clone() {
            return Err(error);
        }
        Ok((collected, terminal))
    }
}

/// Start an operation with a fresh collector and wait for it.
fn collect(
    dispatcher: &Dispatcher,
    start: impl FnOnce(ResultCallback) -> Result<OperationId>,
) -> Result<(Collected, Chunk)> {
    let collector = Arc::new(Collector::default());
    let id = start(collector.callback())?;
    collector.wait(dispatcher, id)
}

fn items(dispatcher: &Dispatcher, start: impl FnOnce(ResultCallback) -> Result<OperationId>) -> Result<Vec<Media>> {
    let (collected, _) = collect(dispatcher, start)?;
    for (source, error) in &collected.errors {
        tracing::warn!(source = source.as_deref().unwrap_or("-"), error = %error, "source failed");
    }
    Ok(collected.items)
}

fn reply(dispatcher: &Dispatcher, start: impl FnOnce(ResultCallback) -> Result<OperationId>) -> Result<Option<Media>> {
    let (_, terminal) = collect(dispatcher, start)?;
    Ok(terminal.media)
}

impl Dispatcher {
    pub fn browse_sync(
        &self,
        source: &Arc<dyn Source>,
        container: Option<&Media>,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Vec<Media>> {
        let options = without_relay(options);
        items(self, |cb| self.browse(source, container, keys, &options, cb))
    }

    pub fn search_sync(
        &self,
        source: &Arc<dyn Source>,
        text: Option<&str>,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Vec<Media>> {
        let options = without_relay(options);
        items(self, |cb| self.search(source, text, keys, &options, cb))
    }

    pub fn query_sync(
        &self,
        source: &Arc<dyn Source>,
        query: &str,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Vec<Media>> {
        let options = without_relay(options);
        items(self, |cb| self.query(source, query, keys, &options, cb))
    }

    /// Search several sources; failures of individual sources are logged and
    /// skipped.
    pub fn multiple_search_sync(
        &self,
        sources: Option<&[Arc<dyn Source>]>,
        text: Option<&str>,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Vec<Media>> {
        let options = without_relay(options);
        items(self, |cb| Ok(self.multiple_search(sources, text, keys, &options, cb)))
    }

    /// Resolve `keys` on `media`; returns `media` unchanged if the source had
    /// nothing to add.
    pub fn resolve_sync(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Media> {
        let options = without_relay(options);
        let resolved = reply(self, |cb| self.resolve(source, media, keys, &options, cb))?;
        Ok(resolved.unwrap_or_else(|| media.clone()))
    }

    pub fn media_from_uri_sync(
        &self,
        source: &Arc<dyn Source>,
        uri: &str,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Media> {
        let options = without_relay(options);
        reply(self, |cb| self.media_from_uri(source, uri, keys, &options, cb))?
            .ok_or_else(|| Error::not_found("uri", uri))
    }

    /// Write `keys` of `media` back; returns the keys that could not be
    /// written.
    pub fn store_metadata_sync(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        keys: &[KeyId],
        options: &OperationOptions,
    ) -> Result<Vec<KeyId>> {
        let options = without_relay(options);
        let (_, terminal) = collect(self, |cb| {
            self.store_metadata(source, media, keys, &options, cb)
        })?;
        Ok(terminal.failed_keys)
    }

    /// Store `media`; returns it as the source recorded it.
    pub fn store_sync(
        &self,
        source: &Arc<dyn Source>,
        parent: Option<&Media>,
        media: Media,
        options: &OperationOptions,
    ) -> Result<Media> {
        let options = without_relay(options);
        let fallback = media.clone();
        let stored = reply(self, |cb| self.store(source, parent, media, &options, cb))?;
        Ok(stored.unwrap_or(fallback))
    }

    pub fn remove_sync(
        &self,
        source: &Arc<dyn Source>,
        media: &Media,
        options: &OperationOptions,
    ) -> Result<()> {
        let options = without_relay(options);
        reply(self, |cb| self.remove(source, media, &options, cb)).map(|_| ())
    }
}
