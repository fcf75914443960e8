//! Filesystem-backed blob store.
//!
//! Organizes frames under `{root}/{asset storage key}/` with one file per
//! frame index and a JSON metadata record beside them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use filmstrip_core::{AssetId, Error, Result};

use crate::{
    frame_file_name, parse_frame_file_name, BlobStore, FilmstripMeta, FrameCodec, META_FILE,
};

/// Filesystem manager for filmstrip frames.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a new `FsBlobStore` rooted at the given directory.
    ///
    /// The directory is created lazily on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one asset's blobs.
    pub fn asset_dir(&self, asset: &AssetId) -> PathBuf {
        self.root.join(asset.storage_key())
    }

    /// Path of a frame blob in the given codec.
    pub fn frame_path(&self, asset: &AssetId, index: u32, codec: FrameCodec) -> PathBuf {
        self.asset_dir(asset).join(frame_file_name(index, codec))
    }

    async fn ensure_asset_dir(&self, asset: &AssetId) -> Result<PathBuf> {
        let dir = self.asset_dir(asset);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::store(format!("failed to create {}: {e}", dir.display()))
        })?;
        Ok(dir)
    }

    /// Write through a temporary file so readers never see a torn blob.
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("blob")
        ));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::store(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::store(format!("failed to rename {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn read_meta(&self, asset: &AssetId) -> Result<Option<FilmstripMeta>> {
        let path = self.asset_dir(asset).join(META_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::store(format!("failed to read {}: {e}", path.display())))
            }
        };

        match serde_json::from_slice(&data) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                // A corrupt record only costs a re-extraction.
                tracing::warn!(asset_id = %asset, "Ignoring unreadable filmstrip metadata: {e}");
                Ok(None)
            }
        }
    }

    async fn write_meta(&self, asset: &AssetId, meta: &FilmstripMeta) -> Result<()> {
        let dir = self.ensure_asset_dir(asset).await?;
        let json = serde_json::to_vec(meta)
            .map_err(|e| Error::Internal(format!("failed to serialize metadata: {e}")))?;
        Self::write_atomic(&dir.join(META_FILE), &json).await
    }

    async fn list_frames(&self, asset: &AssetId) -> Result<Vec<u32>> {
        let dir = self.asset_dir(asset);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::store(format!("failed to list {}: {e}", dir.display())))
            }
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::store(format!("failed to list {}: {e}", dir.display())))?
        {
            let name = entry.file_name();
            if let Some((index, _)) = name.to_str().and_then(parse_frame_file_name) {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    async fn read_frame(&self, asset: &AssetId, index: u32) -> Result<Option<Bytes>> {
        for codec in FrameCodec::READ_ORDER {
            let path = self.frame_path(asset, index, codec);
            match tokio::fs::read(&path).await {
                Ok(data) => return Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::store(format!("failed to read {}: {e}", path.display())))
                }
            }
        }
        Ok(None)
    }

    async fn write_frame(&self, asset: &AssetId, index: u32, bytes: Bytes) -> Result<()> {
        self.ensure_asset_dir(asset).await?;
        let path = self.frame_path(asset, index, FrameCodec::CURRENT);
        Self::write_atomic(&path, &bytes).await
    }

    async fn delete_asset(&self, asset: &AssetId) -> Result<()> {
        let dir = self.asset_dir(asset);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store(format!("failed to delete {}: {e}", dir.display()))),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store(format!(
                "failed to clear {}: {e}",
                self.root.display()
            ))),
        }
    }
}
