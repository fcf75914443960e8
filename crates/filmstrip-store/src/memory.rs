//! In-process blob store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use filmstrip_core::{AssetId, Error, Result};
use parking_lot::RwLock;

use crate::{BlobStore, FilmstripMeta, FrameCodec};

#[derive(Debug, Default)]
struct AssetBlobs {
    meta: Option<FilmstripMeta>,
    frames: BTreeMap<u32, HashMap<FrameCodec, Bytes>>,
}

/// Blob store held entirely in memory.
///
/// Writes and frame reads can be made to fail on demand, and metadata writes
/// can be slowed down, which lets callers exercise the engine's storage
/// failure and ordering paths without a real disk.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    assets: RwLock<HashMap<AssetId, AssetBlobs>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    meta_delay_ms: AtomicU64,
    frame_writes: AtomicUsize,
    meta_writes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write return a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent frame read return a store error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long before applying each metadata write.
    pub fn set_meta_write_delay(&self, delay: Duration) {
        self.meta_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful frame writes so far.
    pub fn frame_writes(&self) -> usize {
        self.frame_writes.load(Ordering::SeqCst)
    }

    /// Number of successful metadata writes so far.
    pub fn meta_writes(&self) -> usize {
        self.meta_writes.load(Ordering::SeqCst)
    }

    /// Seed a frame blob in an explicit codec.
    pub fn insert_frame(&self, asset: &AssetId, index: u32, codec: FrameCodec, bytes: Bytes) {
        self.assets
            .write()
            .entry(asset.clone())
            .or_default()
            .frames
            .entry(index)
            .or_default()
            .insert(codec, bytes);
    }

    /// Current metadata record without going through the async trait.
    pub fn meta(&self, asset: &AssetId) -> Option<FilmstripMeta> {
        self.assets.read().get(asset).and_then(|a| a.meta)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::store("memory store rejected write"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read_meta(&self, asset: &AssetId) -> Result<Option<FilmstripMeta>> {
        Ok(self.meta(asset))
    }

    async fn write_meta(&self, asset: &AssetId, meta: &FilmstripMeta) -> Result<()> {
        let delay = self.meta_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_writable()?;
        self.assets.write().entry(asset.clone()).or_default().meta = Some(*meta);
        self.meta_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_frames(&self, asset: &AssetId) -> Result<Vec<u32>> {
        Ok(self
            .assets
            .read()
            .get(asset)
            .map(|a| a.frames.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn read_frame(&self, asset: &AssetId, index: u32) -> Result<Option<Bytes>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::store("memory store rejected read"));
        }
        let assets = self.assets.read();
        let Some(blobs) = assets.get(asset).and_then(|a| a.frames.get(&index)) else {
            return Ok(None);
        };
        Ok(FrameCodec::READ_ORDER
            .iter()
            .find_map(|codec| blobs.get(codec).cloned()))
    }

    async fn write_frame(&self, asset: &AssetId, index: u32, bytes: Bytes) -> Result<()> {
        self.check_writable()?;
        self.insert_frame(asset, index, FrameCodec::CURRENT, bytes);
        self.frame_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_asset(&self, asset: &AssetId) -> Result<()> {
        self.assets.write().remove(asset);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.assets.write().clear();
        Ok(())
    }
}
