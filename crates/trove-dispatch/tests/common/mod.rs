//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use trove_core::{system, Media};
use trove_dispatch::{Chunk, Dispatcher, ResultCallback};
use trove_source::{MemorySource, MemorySourceBuilder, Registry, Source};

/// Records every chunk delivered to its callback.
#[derive(Default)]
pub struct Capture {
    pub chunks: Mutex<Vec<Chunk>>,
}

impl Capture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn callback(self: &Arc<Self>) -> ResultCallback {
        let this = self.clone();
        ResultCallback::new(move |chunk| this.chunks.lock().push(chunk))
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn titles(&self) -> Vec<String> {
        self.chunks
            .lock()
            .iter()
            .filter_map(|c| c.media.as_ref())
            .map(|m| m.title().unwrap_or_default().to_string())
            .collect()
    }

    /// Titles of non-terminal chunks only.
    pub fn item_titles(&self) -> Vec<String> {
        self.chunks
            .lock()
            .iter()
            .filter(|c| !c.is_terminal())
            .filter_map(|c| c.media.as_ref())
            .map(|m| m.title().unwrap_or_default().to_string())
            .collect()
    }

    pub fn remaining(&self) -> Vec<u32> {
        self.chunks.lock().iter().map(|c| c.remaining).collect()
    }

    pub fn terminals(&self) -> usize {
        self.chunks.lock().iter().filter(|c| c.is_terminal()).count()
    }

    pub fn last(&self) -> Option<Chunk> {
        self.chunks.lock().last().cloned()
    }
}

/// A flat source of `n` audio tracks titled "<prefix> 1" to "<prefix> n".
pub fn tracks(id: &str, prefix: &str, n: usize) -> MemorySourceBuilder {
    (1..=n).fold(MemorySource::builder(id, id), |builder, i| {
        builder.item(
            None,
            Media::audio()
                .with_id(format!("{id}-{i}"))
                .with(system::TITLE, format!("{prefix} {i}")),
        )
    })
}

pub fn register(registry: &Registry, source: MemorySource) -> Arc<dyn Source> {
    let source: Arc<dyn Source> = Arc::new(source);
    registry
        .register_source(source.clone())
        .expect("register source");
    source
}

pub fn dispatcher() -> (Arc<Registry>, Dispatcher) {
    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(registry.clone());
    (registry, dispatcher)
}
