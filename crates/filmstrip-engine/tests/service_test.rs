//! Filmstrip service integration tests.
//!
//! Drive the orchestrator end to end with fake decoders and an in-memory
//! blob store, checking what callers observe through the public API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use filmstrip_core::{Error, PriorityWindow};
use filmstrip_engine::{DecodePath, ExtractionOutcome, MemoryPressure};
use filmstrip_store::MemoryBlobStore;

// ---------------------------------------------------------------------------
// get_filmstrip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_calls_share_the_same_value() {
    let decoder = Arc::new(GatedDecoder::default());
    let gate = decoder.gate(&source("a"), 0.0);
    let h = TestHarness::new(test_config(), decoders(decoder.clone()));

    let first = h.service.get_filmstrip(request("a", 10.0)).await.unwrap();
    assert!(first.is_extracting);
    assert!(first.is_empty());

    let service = h.service.clone();
    wait_until("session active", || {
        let service = service.clone();
        async move { service.stats().await.unwrap().active_sessions == 1 }
    })
    .await;

    let second = h.service.get_filmstrip(request("a", 10.0)).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.stats().await.dispatched_requests, 1);

    gate.open();
    let done = h.wait_complete(request("a", 10.0)).await;
    assert_eq!(done.len(), 10);
}

#[tokio::test]
async fn completed_filmstrip_is_reused_and_persisted() {
    let decoder = Arc::new(SolidDecoder::default());
    let h = TestHarness::new(test_config(), decoders(decoder.clone()));

    let strip = h.wait_complete(request("clip", 10.0)).await;
    assert_eq!(strip.len(), 10);
    assert_eq!(strip.progress, 100);
    let indices: Vec<u32> = strip.indices().collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    assert!((strip.frames[3].timestamp - 3.0).abs() < f64::EPSILON);
    assert!(strip.frames.iter().all(|f| f.handle.bytes().is_some()));

    let dispatched = h.stats().await.dispatched_requests;
    let decodes = decoder.calls();
    let again = h.service.get_filmstrip(request("clip", 10.0)).await.unwrap();
    assert!(Arc::ptr_eq(&strip, &again));
    assert_eq!(h.stats().await.dispatched_requests, dispatched);
    assert_eq!(decoder.calls(), decodes);

    let asset = filmstrip_core::AssetId::new("clip");
    wait_for_meta(&h.store, "clip").await;
    let meta = h.store.meta(&asset).unwrap();
    assert_eq!(meta.frame_count, 10);
    assert_eq!((meta.width, meta.height), (16, 9));

    // A fresh service over the same store loads instead of extracting.
    let fresh_decoder = Arc::new(SolidDecoder::default());
    let fresh = TestHarness::with_store(
        test_config(),
        decoders(fresh_decoder.clone()),
        h.store.clone(),
    );
    let loaded = fresh.wait_complete(request("clip", 10.0)).await;
    assert_eq!(loaded.len(), 10);
    assert_eq!(fresh.stats().await.dispatched_requests, 0);
    assert_eq!(fresh_decoder.calls(), 0);
}

#[tokio::test]
async fn progress_callback_sees_updates_until_complete() {
    let mut config = test_config();
    config.extraction.progress_frame_delta = 1;
    let h = TestHarness::new(config, decoders(Arc::new(SolidDecoder::default())));

    let (callback, seen) = recorder();
    h.service
        .get_filmstrip(request("cb", 12.0).on_progress(callback))
        .await
        .unwrap();
    h.wait_for_outcomes(1).await;

    let updates = seen.lock().clone();
    assert!(updates.len() >= 2, "expected intermediate updates");
    let final_strip = updates.last().unwrap();
    assert!(final_strip.is_complete);
    assert_eq!(final_strip.len(), 12);
    // Progress never moves backwards and stays below 100 while extracting.
    for pair in updates.windows(2) {
        assert!(pair[0].progress <= pair[1].progress);
    }
    assert!(updates
        .iter()
        .filter(|s| s.is_extracting)
        .all(|s| s.progress < 100));
}

#[tokio::test]
async fn index_only_progress_reads_frames_back() {
    let mut config = test_config();
    config.extraction.inline_frame_bytes = false;
    let h = TestHarness::new(config, decoders(Arc::new(SolidDecoder::default())));

    let strip = h.wait_complete(request("compat", 8.0)).await;
    assert_eq!(strip.len(), 8);
    assert!(strip.frames.iter().all(|f| f.handle.bytes().is_some()));
}

#[tokio::test]
async fn zero_length_clip_completes_empty() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    let strip = h.wait_complete(request("empty", 0.0)).await;
    assert!(strip.is_empty());
    assert_eq!(h.stats().await.dispatched_requests, 0);
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_returns_partial_filmstrip() {
    let mut config = test_config();
    config.extraction.progress_frame_delta = 1;
    let decoder = Arc::new(GatedDecoder::default());
    let _gate = decoder.gate(&source("long"), 4.0);
    let h = TestHarness::new(config, decoders(decoder));

    let (callback, seen) = recorder();
    let _sub = h.service.subscribe("long", callback).await.unwrap();
    h.service.get_filmstrip(request("long", 20.0)).await.unwrap();

    wait_until("four frames", || {
        let count = last(&seen).map_or(0, |s| s.len());
        async move { count >= 4 }
    })
    .await;

    let partial = h.service.abort("long").await.unwrap().unwrap();
    assert_eq!(partial.len(), 4);
    assert!(!partial.is_complete);
    assert!(!partial.is_extracting);

    let stats = h.stats().await;
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.queued_sessions, 0);

    let metrics = h.metrics().await;
    assert_eq!(metrics.aborted, 1);
    assert_eq!(metrics.samples[0].outcome, ExtractionOutcome::Aborted);
    assert_eq!(metrics.samples[0].frames_extracted, 4);
}

#[tokio::test]
async fn abort_without_session_is_harmless() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    assert!(h.service.abort("nothing").await.unwrap().is_none());
    assert_eq!(h.metrics().await.total(), 0);
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_slot_runs_cheapest_queued_first() {
    let decoder = Arc::new(GatedDecoder::default());
    let gate = decoder.gate(&source("a"), 0.0);
    let h = TestHarness::new(test_config(), decoders(decoder));

    h.service.get_filmstrip(request("a", 10.0)).await.unwrap();
    let service = h.service.clone();
    wait_until("a active", || {
        let service = service.clone();
        async move { service.stats().await.unwrap().active_sessions == 1 }
    })
    .await;

    h.service.get_filmstrip(request("b", 50.0)).await.unwrap();
    h.service.get_filmstrip(request("c", 10.0)).await.unwrap();
    h.service.get_filmstrip(request("d", 30.0)).await.unwrap();
    let service = h.service.clone();
    wait_until("three queued", || {
        let service = service.clone();
        async move { service.stats().await.unwrap().queued_sessions == 3 }
    })
    .await;
    assert_eq!(h.stats().await.concurrency_cap, 1);

    gate.open();
    let service = h.service.clone();
    wait_until("all complete", || {
        let service = service.clone();
        async move {
            let stats = service.stats().await.unwrap();
            assert!(stats.active_sessions <= 1, "cap exceeded: {stats:?}");
            service.metrics_snapshot().await.unwrap().completed == 4
        }
    })
    .await;

    let metrics = h.metrics().await;
    let order: Vec<&str> = metrics
        .samples
        .iter()
        .rev()
        .map(|m| m.asset_id.as_str())
        .collect();
    assert_eq!(order, vec!["a", "c", "d", "b"]);
}

#[tokio::test]
async fn hard_pressure_defers_unobserved_assets() {
    let store = Arc::new(MemoryBlobStore::new());
    let h = TestHarness::with_probe(
        test_config(),
        decoders(Arc::new(SolidDecoder::default())),
        store,
        Arc::new(FixedProbe(u64::MAX)),
    );

    h.service.get_filmstrip(request("quiet", 10.0)).await.unwrap();
    let service = h.service.clone();
    wait_until("load settled", || {
        let service = service.clone();
        async move { service.stats().await.unwrap().loading_assets == 0 }
    })
    .await;

    let stats = h.stats().await;
    assert_eq!(stats.pressure, MemoryPressure::Hard);
    assert_eq!(stats.dispatched_requests, 0);
    assert_eq!(stats.active_sessions, 0);
    let strip = h.service.get_filmstrip(request("quiet", 10.0)).await.unwrap();
    assert!(!strip.is_extracting);
    assert!(!strip.is_complete);

    // Someone is watching this one, so it may start.
    let (callback, _seen) = recorder();
    let _sub = h.service.subscribe("watched", callback).await.unwrap();
    let done = h.wait_complete(request("watched", 5.0)).await;
    assert_eq!(done.len(), 5);
    assert!(h.stats().await.dispatched_requests >= 1);
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn keyframe_failures_walk_the_fallback_chain() {
    let mut config = test_config();
    config.extraction.cpu_count = Some(8);
    let fast = Arc::new(KeyframeDecoder::default());
    let fallback = Arc::new(KeyframeDecoder::default());
    let h = TestHarness::new(
        config,
        filmstrip_engine::Decoders::new(fast.clone(), fallback.clone()),
    );

    let (callback, seen) = recorder();
    let _sub = h.service.subscribe("kf", callback).await.unwrap();
    h.service.get_filmstrip(request("kf", 100.0)).await.unwrap();
    let metrics = h.wait_for_outcomes(1).await;

    let sample = &metrics.samples[0];
    assert_eq!(sample.outcome, ExtractionOutcome::Failed);
    assert_eq!(
        sample.decode_paths,
        vec![DecodePath::Parallel, DecodePath::SingleWorker, DecodePath::Element]
    );
    assert_eq!(sample.retries, 2);
    assert_eq!(sample.worker_count, 2);
    assert!(sample.error.as_deref().unwrap_or("").contains("key frame"));
    assert_eq!(fallback.calls(), 1);
    assert_eq!(h.stats().await.dispatched_requests, 4);

    let final_strip = last(&seen).unwrap();
    assert!(!final_strip.is_complete);
    assert!(!final_strip.is_extracting);
}

#[tokio::test]
async fn store_failures_skip_straight_to_element_path() {
    let store = Arc::new(MemoryBlobStore::new());
    store.set_fail_writes(true);
    let h = TestHarness::with_store(
        test_config(),
        decoders(Arc::new(SolidDecoder::default())),
        store,
    );

    h.service.get_filmstrip(request("ro", 10.0)).await.unwrap();
    let metrics = h.wait_for_outcomes(1).await;
    let sample = &metrics.samples[0];
    assert_eq!(sample.outcome, ExtractionOutcome::Failed);
    assert_eq!(
        sample.decode_paths,
        vec![DecodePath::SingleWorker, DecodePath::Element]
    );
    assert!(sample.error.as_deref().unwrap_or("").contains("Store error"));
    assert_eq!(h.stats().await.active_sessions, 0);
}

#[tokio::test]
async fn failed_read_back_is_never_reported_complete() {
    let mut config = test_config();
    config.extraction.inline_frame_bytes = false;
    let store = Arc::new(MemoryBlobStore::new());
    store.set_fail_reads(true);
    let h = TestHarness::with_store(
        config,
        decoders(Arc::new(SolidDecoder::default())),
        store.clone(),
    );

    let (callback, seen) = recorder();
    h.service
        .get_filmstrip(request("unreadable", 8.0).on_progress(callback))
        .await
        .unwrap();
    let metrics = h.wait_for_outcomes(1).await;
    let sample = &metrics.samples[0];
    assert_eq!(sample.outcome, ExtractionOutcome::Failed);
    assert_eq!(
        sample.decode_paths,
        vec![DecodePath::SingleWorker, DecodePath::Element]
    );
    assert!(sample.error.as_deref().unwrap_or("").contains("Store error"));

    let strip = last(&seen).unwrap();
    assert!(!strip.is_complete);
    assert!(!strip.is_extracting);
    assert!(strip.progress < 100);
    assert!(store
        .meta(&"unreadable".into())
        .map_or(true, |meta| !meta.is_complete));
}

// ---------------------------------------------------------------------------
// Priority windows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_window_refines_a_complete_filmstrip() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    let base = h.wait_complete(request("long", 200.0)).await;
    let window = PriorityWindow::new(100, 110);
    let missing = (100..110).filter(|i| !base.contains_index(*i)).count();
    assert!(missing > 0, "background sampling should leave gaps");

    let refining = h
        .service
        .get_filmstrip(request("long", 200.0).with_priority(window))
        .await
        .unwrap();
    assert!(refining.is_complete);

    let metrics = h.wait_for_outcomes(2).await;
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.samples[0].target_frames, missing);

    let refined = h
        .wait_complete(request("long", 200.0).with_priority(window))
        .await;
    assert!((100..110).all(|i| refined.contains_index(i)));
    assert_eq!(refined.len(), base.len() + missing);

    // Covered now: no further work.
    let dispatched = h.stats().await.dispatched_requests;
    h.service
        .get_filmstrip(request("long", 200.0).with_priority(window))
        .await
        .unwrap();
    assert_eq!(h.stats().await.dispatched_requests, dispatched);
}

// ---------------------------------------------------------------------------
// Eviction and clearing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn soft_pressure_evicts_unobserved_assets() {
    let mut config = test_config();
    config.memory.soft_limit_bytes = 1;
    config.memory.hard_limit_bytes = u64::MAX;
    let h = TestHarness::new(config, decoders(Arc::new(SolidDecoder::default())));

    let (watch_a, seen_a) = recorder();
    let _sub = h.service.subscribe("a", watch_a).await.unwrap();
    h.service.get_filmstrip(request("a", 6.0)).await.unwrap();
    h.wait_for_outcomes(1).await;

    let (watch_b, seen_b) = recorder();
    h.service
        .get_filmstrip(request("b", 6.0).on_progress(watch_b))
        .await
        .unwrap();
    h.wait_for_outcomes(2).await;

    let stats = h.stats().await;
    assert_eq!(stats.cached_assets, 1);
    assert_eq!(stats.outstanding_handles, 6);

    let b = last(&seen_b).unwrap();
    assert!(b.is_complete);
    assert!(b.frames.iter().all(|f| f.handle.is_revoked()));
    let a = last(&seen_a).unwrap();
    assert!(a.is_complete);
    assert!(a.frames.iter().all(|f| f.handle.bytes().is_some()));
}

#[tokio::test]
async fn subscribed_assets_survive_hard_pressure() {
    let mut config = test_config();
    config.memory.soft_limit_bytes = 1;
    config.memory.hard_limit_bytes = 1;
    let h = TestHarness::new(config, decoders(Arc::new(SolidDecoder::default())));

    let (watch_a, seen_a) = recorder();
    let _sub = h.service.subscribe("a", watch_a).await.unwrap();
    h.service.get_filmstrip(request("a", 6.0)).await.unwrap();
    h.wait_for_outcomes(1).await;

    let stats = h.stats().await;
    assert_eq!(stats.pressure, MemoryPressure::Hard);
    assert_eq!(stats.cached_assets, 1);
    assert_eq!(stats.outstanding_handles, 6);
    let a = last(&seen_a).unwrap();
    assert!(a.is_complete);
    assert!(a.frames.iter().all(|f| f.handle.bytes().is_some()));

    // A second, unwatched asset is deferred and triggers another eviction pass.
    h.service.get_filmstrip(request("b", 6.0)).await.unwrap();
    let service = h.service.clone();
    wait_until("b settled", || {
        let service = service.clone();
        async move { service.stats().await.unwrap().loading_assets == 0 }
    })
    .await;

    let stats = h.stats().await;
    assert_eq!(stats.dispatched_requests, 1);
    assert_eq!(stats.cached_assets, 1);
    assert_eq!(stats.outstanding_handles, 6);
    assert!(a.frames.iter().all(|f| f.handle.bytes().is_some()));
    let again = h.service.get_filmstrip(request("a", 6.0)).await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
}

#[tokio::test]
async fn idle_assets_are_dropped_from_memory() {
    let mut config = test_config();
    config.cache.idle_eviction_ms = 20;
    let h = TestHarness::new(config, decoders(Arc::new(SolidDecoder::default())));

    let (callback, seen) = recorder();
    h.service
        .get_filmstrip(request("idle", 4.0).on_progress(callback))
        .await
        .unwrap();
    h.wait_for_outcomes(1).await;

    let service = h.service.clone();
    wait_until("idle eviction", || {
        let service = service.clone();
        async move { service.stats().await.unwrap().cached_assets == 0 }
    })
    .await;
    let strip = last(&seen).unwrap();
    assert!(strip.frames.iter().all(|f| f.handle.is_revoked()));
}

#[tokio::test]
async fn clear_asset_drops_memory_and_storage() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    let strip = h.wait_complete(request("gone", 5.0)).await;
    wait_for_meta(&h.store, "gone").await;

    h.service.clear_asset("gone").await.unwrap();
    assert!(strip.frames.iter().all(|f| f.handle.is_revoked()));
    let stats = h.stats().await;
    assert_eq!(stats.cached_assets, 0);
    assert_eq!(stats.outstanding_handles, 0);
    assert!(h.store.meta(&"gone".into()).is_none());

    // Extraction starts over.
    let again = h.service.get_filmstrip(request("gone", 5.0)).await.unwrap();
    assert!(again.is_extracting);
}

#[tokio::test]
async fn clear_all_drops_everything() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    h.wait_complete(request("x", 3.0)).await;
    h.wait_complete(request("y", 3.0)).await;
    wait_for_meta(&h.store, "x").await;
    wait_for_meta(&h.store, "y").await;

    h.service.clear_all().await.unwrap();
    let stats = h.stats().await;
    assert_eq!(stats.cached_assets, 0);
    assert_eq!(stats.cache_bytes, 0);
    assert!(h.store.meta(&"x".into()).is_none());
    assert!(h.store.meta(&"y".into()).is_none());
}

#[tokio::test]
async fn clear_asset_outlasts_a_slow_metadata_write() {
    let store = Arc::new(MemoryBlobStore::new());
    store.set_meta_write_delay(Duration::from_millis(200));
    let h = TestHarness::with_store(
        test_config(),
        decoders(Arc::new(SolidDecoder::default())),
        store.clone(),
    );
    let strip = h.wait_complete(request("r", 5.0)).await;
    assert_eq!(strip.len(), 5);

    h.service.clear_asset("r").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.meta(&"r".into()).is_none());

    let dispatched = h.stats().await.dispatched_requests;
    let again = h.wait_complete(request("r", 5.0)).await;
    assert_eq!(again.len(), 5);
    assert!(h.stats().await.dispatched_requests > dispatched);
}

#[tokio::test]
async fn clear_all_outlasts_slow_metadata_writes() {
    let store = Arc::new(MemoryBlobStore::new());
    store.set_meta_write_delay(Duration::from_millis(200));
    let h = TestHarness::with_store(
        test_config(),
        decoders(Arc::new(SolidDecoder::default())),
        store.clone(),
    );
    h.wait_complete(request("p", 3.0)).await;
    h.wait_complete(request("q", 3.0)).await;

    h.service.clear_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.meta(&"p".into()).is_none());
    assert!(store.meta(&"q".into()).is_none());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscription_replays_current_value() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    h.wait_complete(request("r", 3.0)).await;

    let (callback, seen) = recorder();
    let sub = h.service.subscribe("r", callback).await.unwrap();
    assert_eq!(sub.asset_id().as_str(), "r");
    let replayed = last(&seen).unwrap();
    assert!(replayed.is_complete);
    sub.unsubscribe();
}

#[tokio::test]
async fn disposed_service_rejects_calls() {
    let h = TestHarness::new(test_config(), decoders(Arc::new(SolidDecoder::default())));
    h.service.dispose().await.unwrap();
    let err = h
        .service
        .get_filmstrip(request("late", 3.0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceStopped));
    assert!(matches!(h.service.stats().await, Err(Error::ServiceStopped)));
}
