//! filmstrip-store: durable storage for extracted filmstrip frames.
//!
//! The engine treats persistence as a key/blob directory service keyed by
//! `(asset, frame index)` plus one metadata record per asset. [`BlobStore`] is
//! that boundary; [`FsBlobStore`] lays it out on disk and [`MemoryBlobStore`]
//! keeps everything in process (tests, ephemeral runs).
//!
//! # Layout
//!
//! ```text
//! {root}/{asset storage key}/meta.json
//! {root}/{asset storage key}/{index}.webp   current codec
//! {root}/{asset storage key}/{index}.jpg    legacy codec, read-only
//! ```

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use bytes::Bytes;
use filmstrip_core::{AssetId, Result};
use serde::{Deserialize, Serialize};

/// Name of the per-asset metadata record.
pub const META_FILE: &str = "meta.json";

/// Per-asset metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilmstripMeta {
    pub width: u32,
    pub height: u32,
    pub is_complete: bool,
    pub frame_count: u32,
}

/// Image codec of a stored frame blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameCodec {
    WebP,
    /// Written by older stores; still readable.
    Jpeg,
}

impl FrameCodec {
    /// Codec used for every new write.
    pub const CURRENT: FrameCodec = FrameCodec::WebP;

    /// Read preference order: current codec first.
    pub const READ_ORDER: [FrameCodec; 2] = [FrameCodec::WebP, FrameCodec::Jpeg];

    pub fn extension(&self) -> &'static str {
        match self {
            Self::WebP => "webp",
            Self::Jpeg => "jpg",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "webp" => Some(Self::WebP),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

/// File name of a frame blob.
pub fn frame_file_name(index: u32, codec: FrameCodec) -> String {
    format!("{}.{}", index, codec.extension())
}

/// Parse a frame blob file name into its index and codec.
pub fn parse_frame_file_name(name: &str) -> Option<(u32, FrameCodec)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let codec = FrameCodec::from_extension(ext)?;
    let index = stem.parse().ok()?;
    Some((index, codec))
}

/// Key/blob directory service holding extracted frames.
///
/// Workers write disjoint frame keys concurrently; metadata writes come only
/// from the orchestrator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable backend name for logging.
    fn name(&self) -> &'static str;

    async fn read_meta(&self, asset: &AssetId) -> Result<Option<FilmstripMeta>>;

    async fn write_meta(&self, asset: &AssetId, meta: &FilmstripMeta) -> Result<()>;

    /// Indices with a stored blob in any readable codec, ascending.
    async fn list_frames(&self, asset: &AssetId) -> Result<Vec<u32>>;

    /// Read one frame, preferring the current codec when both exist.
    async fn read_frame(&self, asset: &AssetId, index: u32) -> Result<Option<Bytes>>;

    /// Write one frame in the current codec.
    async fn write_frame(&self, asset: &AssetId, index: u32, bytes: Bytes) -> Result<()>;

    /// Remove every blob and the metadata record of an asset.
    async fn delete_asset(&self, asset: &AssetId) -> Result<()>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;

    /// Read several frames, skipping indices without a blob.
    async fn read_frames(&self, asset: &AssetId, indices: &[u32]) -> Result<Vec<(u32, Bytes)>> {
        let mut frames = Vec::with_capacity(indices.len());
        for &index in indices {
            if let Some(bytes) = self.read_frame(asset, index).await? {
                frames.push((index, bytes));
            }
        }
        Ok(frames)
    }
}
