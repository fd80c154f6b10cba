//! Single-source operations through the dispatcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{dispatcher, register, tracks, Capture};
use tokio::runtime::Handle;
use trove_core::{
    system, Caps, Error, KeyId, Media, Negotiation, OperationKind, OperationOptions,
    ResolutionFlags, SupportedOps, TypeFilter, Value,
};
use trove_dispatch::{Chunk, Dispatcher, MainLoop, OperationPhase};
use trove_source::{Execution, MemorySource};

const TITLE: &[KeyId] = &[system::TITLE];

#[test]
fn browse_delivers_items_then_one_terminal() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 3).build());
    let capture = Capture::new();

    let id = dispatcher
        .browse(&source, None, TITLE, &OperationOptions::new(), capture.callback())
        .unwrap();

    assert_eq!(capture.len(), 4);
    assert_eq!(capture.remaining(), vec![3, 2, 1, 0]);
    assert_eq!(capture.item_titles(), vec!["Track 1", "Track 2", "Track 3"]);
    let last = capture.last().unwrap();
    assert!(last.media.is_none());
    assert!(last.error.is_none());
    assert_eq!(last.operation_id, id);
    assert!(!dispatcher.is_pending(id));
    assert_eq!(dispatcher.phase(id), None);
}

#[test]
fn skip_and_count_select_a_window() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 10).build());
    let capture = Capture::new();
    let options = OperationOptions::new().with_skip(2).with_count(3);

    dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap();

    assert_eq!(capture.item_titles(), vec!["Track 3", "Track 4", "Track 5"]);
    assert_eq!(capture.remaining(), vec![3, 2, 1, 0]);
    assert_eq!(capture.terminals(), 1);
}

#[test]
fn browse_without_results_sends_only_the_terminal() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("empty", "Track", 0).build());
    let capture = Capture::new();

    dispatcher
        .browse(&source, None, TITLE, &OperationOptions::new(), capture.callback())
        .unwrap();

    assert_eq!(capture.remaining(), vec![0]);
}

#[test]
fn validation_failures_are_returned_without_callbacks() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("local", "Track", 2)
            .operations(SupportedOps::BROWSE)
            .build(),
    );
    let capture = Capture::new();
    let options = OperationOptions::new();

    let err = dispatcher
        .search(&source, Some("x"), TITLE, &options, capture.callback())
        .unwrap_err();
    assert_matches!(err, Error::UnsupportedOperation { operation: OperationKind::Search, .. });

    let leaf = Media::audio().with_id("local-1");
    let err = dispatcher
        .browse(&source, Some(&leaf), TITLE, &options, capture.callback())
        .unwrap_err();
    assert_matches!(err, Error::NotBrowsable(id) if id == "local-1");

    let err = dispatcher
        .browse(&source, None, &[KeyId::from_raw(9_999)], &options, capture.callback())
        .unwrap_err();
    assert_matches!(err, Error::InvalidKey(_));

    assert_eq!(capture.len(), 0);
    assert_eq!(dispatcher.pending_operations(), 0);
}

#[test]
fn strict_negotiation_rejects_unsupported_options() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("plain", "Track", 5).paged_caps(Caps::new()).build(),
    );
    let capture = Capture::new();
    let options = OperationOptions::new().with_skip(1);

    let err = dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap_err();
    assert_matches!(err, Error::CapabilityRejected { operation: OperationKind::Browse, .. });
    assert_eq!(capture.len(), 0);
}

#[test]
fn partial_negotiation_drops_skip_but_keeps_the_count_bound() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("plain", "Track", 5).paged_caps(Caps::new()).build(),
    );
    let capture = Capture::new();
    let options = OperationOptions::new()
        .with_skip(1)
        .with_count(2)
        .with_negotiation(Negotiation::Partial);

    dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap();

    assert_eq!(capture.item_titles(), vec!["Track 1", "Track 2"]);
    assert_eq!(capture.terminals(), 1);
}

#[test]
fn emulation_applies_unsupported_options_locally() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        MemorySource::builder("mixed", "Mixed")
            .item(None, Media::audio().with_id("a1").with(system::TITLE, "Song A"))
            .item(None, Media::video().with_id("v1").with(system::TITLE, "Film A"))
            .item(None, Media::audio().with_id("a2").with(system::TITLE, "Song B"))
            .item(None, Media::video().with_id("v2").with(system::TITLE, "Film B"))
            .item(None, Media::video().with_id("v3").with(system::TITLE, "Film C"))
            .paged_caps(Caps::new().with_pagination(true))
            .build(),
    );
    let capture = Capture::new();
    let options = OperationOptions::new()
        .with_type_filter(TypeFilter::VIDEO)
        .with_skip(1)
        .with_count(1)
        .with_negotiation(Negotiation::Emulate);

    dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap();

    assert_eq!(capture.item_titles(), vec!["Film B"]);
    assert_eq!(capture.remaining(), vec![1, 0]);
}

#[test]
fn auto_split_keeps_results_and_remaining_monotonic() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("split", "Track", 10).auto_split(2).build());
    let capture = Capture::new();
    let options = OperationOptions::new().with_skip(1).with_count(5);

    dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap();

    assert_eq!(
        capture.item_titles(),
        vec!["Track 2", "Track 3", "Track 4", "Track 5", "Track 6"]
    );
    let remaining = capture.remaining();
    assert!(remaining.windows(2).all(|w| w[0] >= w[1]), "{remaining:?}");
    assert_eq!(remaining.last(), Some(&0));
    assert_eq!(capture.terminals(), 1);
}

#[test]
fn fast_only_leaves_out_slow_keys() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        MemorySource::builder("slow", "Slow")
            .item(
                None,
                Media::audio()
                    .with_id("a")
                    .with(system::TITLE, "A")
                    .with(system::DURATION, 240i64),
            )
            .slow_keys(&[system::DURATION])
            .build(),
    );
    let keys = [system::TITLE, system::DURATION];

    let fast = Capture::new();
    let options = OperationOptions::new().with_flags(ResolutionFlags::FAST_ONLY);
    dispatcher
        .browse(&source, None, &keys, &options, fast.callback())
        .unwrap();
    let item = fast.chunks.lock()[0].media.clone().unwrap();
    assert!(!item.has(system::DURATION));

    let all = Capture::new();
    dispatcher
        .browse(&source, None, &keys, &OperationOptions::new(), all.callback())
        .unwrap();
    let item = all.chunks.lock()[0].media.clone().unwrap();
    assert_eq!(item.duration(), Some(240));
}

fn describe(media: &Media) -> Option<Value> {
    media.title().map(|t| Value::from(format!("about {t}")))
}

#[test]
fn full_resolution_fills_keys_from_other_sources() {
    let (registry, dispatcher) = dispatcher();
    let library = register(&registry, tracks("library", "Track", 2).build());
    register(
        &registry,
        MemorySource::builder("notes", "Notes")
            .derive(system::DESCRIPTION, &[system::TITLE], describe)
            .build(),
    );
    let keys = [system::TITLE, system::DESCRIPTION];

    let plain = Capture::new();
    dispatcher
        .browse(&library, None, &keys, &OperationOptions::new(), plain.callback())
        .unwrap();
    assert!(plain.chunks.lock()[0].media.as_ref().unwrap().get(system::DESCRIPTION).is_none());

    let full = Capture::new();
    let options = OperationOptions::new().with_flags(ResolutionFlags::FULL);
    dispatcher
        .browse(&library, None, &keys, &options, full.callback())
        .unwrap();
    let chunks = full.chunks.lock();
    assert_eq!(chunks.len(), 3);
    let description = chunks[1].media.as_ref().unwrap().get(system::DESCRIPTION);
    assert_eq!(description.and_then(Value::as_str), Some("about Track 2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_resolution_preserves_item_order() {
    let (registry, dispatcher) = dispatcher();
    let library = register(&registry, tracks("library", "Track", 5).build());
    register(
        &registry,
        MemorySource::builder("notes", "Notes")
            .derive(system::DESCRIPTION, &[system::TITLE], describe)
            .execution(Execution::Spawn {
                handle: Handle::current(),
                delay: None,
            })
            .build(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let options = OperationOptions::new().with_flags(ResolutionFlags::FULL);

    dispatcher
        .browse(
            &library,
            None,
            &[system::TITLE, system::DESCRIPTION],
            &options,
            move |chunk: Chunk| {
                let _ = tx.send(chunk);
            },
        )
        .unwrap();

    let mut titles = Vec::new();
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("chunk in time")
            .expect("channel open");
        if chunk.is_terminal() {
            break;
        }
        let media = chunk.media.unwrap();
        assert!(media.has(system::DESCRIPTION));
        titles.push(media.title().unwrap().to_string());
    }
    assert_eq!(titles, vec!["Track 1", "Track 2", "Track 3", "Track 4", "Track 5"]);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_items_and_sends_one_cancelled_terminal() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("slow", "Track", 50)
            .execution(Execution::Spawn {
                handle: Handle::current(),
                delay: Some(Duration::from_millis(20)),
            })
            .build(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = dispatcher
        .browse(&source, None, TITLE, &OperationOptions::new(), move |chunk: Chunk| {
            let _ = tx.send(chunk);
        })
        .unwrap();

    let first = rx.recv().await.unwrap();
    assert!(!first.is_terminal());
    dispatcher.cancel(id);

    let mut rest = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
        rest.push(chunk);
    }
    let terminals: Vec<_> = rest.iter().filter(|c| c.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert!(terminals[0].is_cancelled());
    assert!(rest.last().unwrap().is_terminal());
    assert!(rest.len() < 49);
    assert!(!dispatcher.is_pending(id));
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 2).build());
    let capture = Capture::new();
    let id = dispatcher
        .browse(&source, None, TITLE, &OperationOptions::new(), capture.callback())
        .unwrap();

    dispatcher.cancel(id);
    assert_eq!(capture.len(), 3);
    assert!(capture.last().unwrap().error.is_none());
}

#[test]
fn cancel_from_inside_the_callback_ends_the_operation() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 5).build());
    let capture = Capture::new();
    let handle = dispatcher.clone();
    let seen = capture.clone();

    dispatcher
        .browse(&source, None, TITLE, &OperationOptions::new(), move |chunk: Chunk| {
            let id = chunk.operation_id;
            let first = !chunk.is_terminal() && seen.len() == 0;
            seen.chunks.lock().push(chunk);
            if first {
                handle.cancel(id);
            }
        })
        .unwrap();

    assert_eq!(capture.len(), 2);
    assert!(capture.last().unwrap().is_cancelled());
}

#[test]
#[should_panic(expected = "was issued by dispatcher")]
fn cancel_with_a_foreign_id_panics() {
    let (registry, first) = dispatcher();
    let second = Dispatcher::new(registry.clone());
    let source = register(&registry, tracks("local", "Track", 1).build());
    let id = first
        .browse(&source, None, TITLE, &OperationOptions::new(), |_: Chunk| {})
        .unwrap();
    second.cancel(id);
}

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

#[test]
fn idle_relay_defers_callbacks_to_the_main_loop() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 3).build());
    let capture = Capture::new();
    let options = OperationOptions::new().with_flags(ResolutionFlags::IDLE_RELAY);

    let id = dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap();

    assert_eq!(capture.len(), 0);
    assert!(dispatcher.is_pending(id));
    assert_eq!(dispatcher.main_loop().pending(), 4);

    dispatcher.main_loop().dispatch_pending();
    assert_eq!(capture.remaining(), vec![3, 2, 1, 0]);
    assert!(!dispatcher.is_pending(id));
}

#[test]
fn cancel_once_the_terminal_is_queued_changes_nothing() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 3).build());
    let capture = Capture::new();
    let options = OperationOptions::new().with_flags(ResolutionFlags::IDLE_RELAY);

    let id = dispatcher
        .browse(&source, None, TITLE, &options, capture.callback())
        .unwrap();
    dispatcher.cancel(id);
    dispatcher.main_loop().dispatch_pending();

    assert_eq!(capture.remaining(), vec![3, 2, 1, 0]);
    assert!(capture.last().unwrap().error.is_none());
}

#[test]
fn callback_relay_overrides_the_main_loop() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 2).build());
    let capture = Capture::new();
    let own = MainLoop::new();
    let options = OperationOptions::new().with_flags(ResolutionFlags::IDLE_RELAY);

    dispatcher
        .browse(
            &source,
            None,
            TITLE,
            &options,
            capture.callback().with_relay(Arc::new(own.clone())),
        )
        .unwrap();

    assert_eq!(dispatcher.main_loop().pending(), 0);
    assert_eq!(own.dispatch_pending(), 3);
    assert_eq!(capture.terminals(), 1);
}

// ---------------------------------------------------------------------------
// Threads and the registry
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistering_does_not_cancel_running_operations() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("remote", "Track", 5)
            .execution(Execution::Spawn {
                handle: Handle::current(),
                delay: Some(Duration::from_millis(10)),
            })
            .build(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    dispatcher
        .browse(&source, None, TITLE, &OperationOptions::new(), move |chunk: Chunk| {
            let _ = tx.send(chunk);
        })
        .unwrap();
    assert!(registry.unregister_source("remote"));
    drop(source);

    let mut items = 0;
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if chunk.is_terminal() {
            assert!(chunk.error.is_none());
            break;
        }
        items += 1;
    }
    assert_eq!(items, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_each_terminate_once() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("remote", "Track", 8)
            .execution(Execution::Spawn {
                handle: Handle::current(),
                delay: None,
            })
            .build(),
    );
    let captures: Vec<Arc<Capture>> = (0..8).map(|_| Capture::new()).collect();
    for capture in &captures {
        dispatcher
            .search(&source, None, TITLE, &OperationOptions::new(), capture.callback())
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.pending_operations() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("operations finish");

    for capture in &captures {
        assert_eq!(capture.terminals(), 1);
        assert_eq!(capture.len(), 9);
    }
}

// ---------------------------------------------------------------------------
// Single-result operations
// ---------------------------------------------------------------------------

#[test]
fn resolve_replies_in_the_terminal_chunk() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        MemorySource::builder("lib", "Lib")
            .item(
                None,
                Media::audio()
                    .with_id("a")
                    .with(system::TITLE, "A")
                    .with(system::ARTIST, "Someone"),
            )
            .build(),
    );
    let capture = Capture::new();
    let stub = Media::audio().with_id("a");

    let id = dispatcher
        .resolve(&source, &stub, &[system::ARTIST], &OperationOptions::new(), capture.callback())
        .unwrap();

    let chunks = capture.chunks.lock();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].operation_id, id);
    let media = chunks[0].media.as_ref().unwrap();
    assert_eq!(media.get(system::ARTIST).and_then(Value::as_str), Some("Someone"));
}

#[test]
fn store_metadata_reports_keys_it_could_not_write() {
    let (registry, dispatcher) = dispatcher();
    let source = register(
        &registry,
        tracks("lib", "Track", 1)
            .writable_keys(&[system::TITLE])
            .build(),
    );
    let edited = Media::audio()
        .with_id("lib-1")
        .with(system::TITLE, "Renamed")
        .with(system::ARTIST, "Nobody");

    let capture = Capture::new();
    dispatcher
        .store_metadata(
            &source,
            &edited,
            &[system::TITLE, system::ARTIST],
            &OperationOptions::new(),
            capture.callback(),
        )
        .unwrap();
    let last = capture.last().unwrap();
    assert!(last.error.is_none());
    assert_eq!(last.failed_keys, vec![system::ARTIST]);

    let nothing = Capture::new();
    dispatcher
        .store_metadata(&source, &edited, &[system::ARTIST], &OperationOptions::new(), nothing.callback())
        .unwrap();
    assert_eq!(nothing.len(), 1);
    assert_eq!(nothing.last().unwrap().failed_keys, vec![system::ARTIST]);
}

#[test]
fn store_under_a_leaf_is_rejected() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("lib", "Track", 1).build());
    let leaf = Media::audio().with_id("lib-1");
    let err = dispatcher
        .store(&source, Some(&leaf), Media::audio(), &OperationOptions::new(), |_: Chunk| {})
        .unwrap_err();
    assert_matches!(err, Error::NotBrowsable(_));
}

#[test]
fn source_failures_arrive_in_the_terminal_chunk() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("lib", "Track", 1).build());
    let capture = Capture::new();
    let missing = Media::container().with_id("nowhere");

    dispatcher
        .browse(&source, Some(&missing), TITLE, &OperationOptions::new(), capture.callback())
        .unwrap();

    let last = capture.last().unwrap();
    assert!(last.is_terminal());
    assert_matches!(last.error, Some(Error::NotFound { .. }));
}

#[test]
fn phase_is_reported_while_pending() {
    let (registry, dispatcher) = dispatcher();
    let source = register(&registry, tracks("local", "Track", 1).build());
    let options = OperationOptions::new().with_flags(ResolutionFlags::IDLE_RELAY);
    let id = dispatcher
        .browse(&source, None, TITLE, &options, |_: Chunk| {})
        .unwrap();

    // The terminal chunk is committed; only its delivery is outstanding.
    assert_eq!(dispatcher.phase(id), Some(OperationPhase::Completed));
    assert!(dispatcher.is_pending(id));
    dispatcher.main_loop().dispatch_pending();
    assert_eq!(dispatcher.phase(id), None::<OperationPhase>);
}
