//! Shared test harness for engine integration tests.
//!
//! Provides [`TestHarness`] which starts a [`FilmstripService`] over an
//! in-memory blob store, plus scriptable fake decoders and polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use filmstrip_av::{DecodeError, FrameDecoder};
use filmstrip_core::config::Config;
use filmstrip_core::{AssetId, Filmstrip, FrameSize, SourceRef};
use filmstrip_engine::{
    CacheFootprintProbe, Decoders, FilmstripCallback, FilmstripRequest, FilmstripService,
    MemoryPressureProbe, MetricsSnapshot, ServiceStats,
};
use filmstrip_store::MemoryBlobStore;
use image::RgbaImage;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Small frames keep encoding cheap; two cores give a concurrency cap of one.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.extraction.frame_width = 16;
    config.extraction.frame_height = 9;
    config.extraction.cpu_count = Some(2);
    config.cache.idle_eviction_ms = 60_000;
    config
}

pub fn source(name: &str) -> SourceRef {
    SourceRef::Path(PathBuf::from(format!("/media/{name}.mp4")))
}

pub fn request(asset: &str, duration: f64) -> FilmstripRequest {
    FilmstripRequest::new(asset, source(asset), duration)
}

pub struct TestHarness {
    pub service: FilmstripService,
    pub store: Arc<MemoryBlobStore>,
}

impl TestHarness {
    pub fn new(config: Config, decoders: Decoders) -> Self {
        Self::with_store(config, decoders, Arc::new(MemoryBlobStore::new()))
    }

    pub fn with_store(config: Config, decoders: Decoders, store: Arc<MemoryBlobStore>) -> Self {
        Self::with_probe(config, decoders, store, Arc::new(CacheFootprintProbe))
    }

    pub fn with_probe(
        config: Config,
        decoders: Decoders,
        store: Arc<MemoryBlobStore>,
        probe: Arc<dyn MemoryPressureProbe>,
    ) -> Self {
        let service = FilmstripService::start(config, store.clone(), decoders, probe);
        Self { service, store }
    }

    pub async fn stats(&self) -> ServiceStats {
        self.service.stats().await.unwrap()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.service.metrics_snapshot().await.unwrap()
    }

    /// Wait until `n` sessions reached a terminal outcome.
    pub async fn wait_for_outcomes(&self, n: u64) -> MetricsSnapshot {
        let service = self.service.clone();
        wait_until(&format!("{n} finished sessions"), || {
            let service = service.clone();
            async move { service.metrics_snapshot().await.unwrap().total() >= n }
        })
        .await;
        self.metrics().await
    }

    /// Poll `get_filmstrip` until the asset reports complete.
    pub async fn wait_complete(&self, request: FilmstripRequest) -> Arc<Filmstrip> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let strip = self.service.get_filmstrip(request.clone()).await.unwrap();
            if strip.is_complete && !strip.is_extracting {
                return strip;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} to complete",
                request.asset_id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Poll a condition every 10ms for up to 10s.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the store holds a complete metadata record for `asset`.
pub async fn wait_for_meta(store: &MemoryBlobStore, asset: &str) {
    let asset = AssetId::new(asset);
    wait_until(&format!("metadata of {asset}"), || {
        let done = store.meta(&asset).is_some_and(|m| m.is_complete);
        async move { done }
    })
    .await;
}

/// Callback that records every filmstrip it receives.
pub fn recorder() -> (FilmstripCallback, Arc<Mutex<Vec<Arc<Filmstrip>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: FilmstripCallback = Arc::new(move |strip: Arc<Filmstrip>| sink.lock().push(strip));
    (callback, seen)
}

pub fn last(seen: &Mutex<Vec<Arc<Filmstrip>>>) -> Option<Arc<Filmstrip>> {
    seen.lock().last().cloned()
}

// ---------------------------------------------------------------------------
// Fake decoders
// ---------------------------------------------------------------------------

/// Decodes a solid frame for every request.
#[derive(Default)]
pub struct SolidDecoder {
    calls: AtomicUsize,
}

impl SolidDecoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameDecoder for SolidDecoder {
    fn name(&self) -> &'static str {
        "solid"
    }

    async fn decode(
        &self,
        _source: &SourceRef,
        timestamp: f64,
        size: FrameSize,
    ) -> Result<RgbaImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let shade = (timestamp as u32 % 256) as u8;
        Ok(RgbaImage::from_pixel(
            size.width,
            size.height,
            image::Rgba([shade, 64, 128, 255]),
        ))
    }
}

/// Always fails with the keyframe precondition.
#[derive(Default)]
pub struct KeyframeDecoder {
    calls: AtomicUsize,
}

impl KeyframeDecoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameDecoder for KeyframeDecoder {
    fn name(&self) -> &'static str {
        "keyframe"
    }

    async fn decode(
        &self,
        _source: &SourceRef,
        timestamp: f64,
        _size: FrameSize,
    ) -> Result<RgbaImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DecodeError::KeyframeRequired { timestamp })
    }
}

/// Solid decoder whose frames of chosen sources block behind a gate.
#[derive(Default)]
pub struct GatedDecoder {
    inner: SolidDecoder,
    gates: Mutex<HashMap<String, (f64, watch::Receiver<bool>)>>,
}

/// Opens a gate of a [`GatedDecoder`]; dropping it also releases waiters.
pub struct Gate(watch::Sender<bool>);

impl Gate {
    pub fn open(&self) {
        let _ = self.0.send(true);
    }
}

impl GatedDecoder {
    /// Block frames of `source` at or after `from_secs` until the gate opens.
    pub fn gate(&self, source: &SourceRef, from_secs: f64) -> Gate {
        let (tx, rx) = watch::channel(false);
        self.gates.lock().insert(source.as_input(), (from_secs, rx));
        Gate(tx)
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl FrameDecoder for GatedDecoder {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn decode(
        &self,
        source: &SourceRef,
        timestamp: f64,
        size: FrameSize,
    ) -> Result<RgbaImage, DecodeError> {
        let gate = self
            .gates
            .lock()
            .get(&source.as_input())
            .filter(|(from, _)| timestamp >= *from)
            .map(|(_, rx)| rx.clone());
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }
        self.inner.decode(source, timestamp, size).await
    }
}

pub fn decoders(decoder: Arc<dyn FrameDecoder>) -> Decoders {
    Decoders::new(decoder.clone(), decoder)
}

/// Reports a fixed process memory figure.
pub struct FixedProbe(pub u64);

impl MemoryPressureProbe for FixedProbe {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn process_memory_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}
