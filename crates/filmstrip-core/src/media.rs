//! Filmstrip data model shared by the store, decoders and engine.
//!
//! A [`Filmstrip`] is an immutable snapshot: the engine builds a new value on
//! every update and hands it out behind an `Arc`, so subscribers never observe
//! a frame list being mutated underneath them.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::HandleId;

// ---------------------------------------------------------------------------
// Frame index space
// ---------------------------------------------------------------------------

/// Number of frame slots for a clip: `ceil(duration * frame_rate)`.
///
/// Non-finite or non-positive inputs yield zero frames.
pub fn total_frames(duration_secs: f64, frame_rate: f64) -> u32 {
    if !duration_secs.is_finite() || !frame_rate.is_finite() {
        return 0;
    }
    if duration_secs <= 0.0 || frame_rate <= 0.0 {
        return 0;
    }
    let slots = (duration_secs * frame_rate).ceil();
    if slots >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        (slots as u32).max(1)
    }
}

/// Presentation time of a frame index, in seconds.
pub fn frame_timestamp(index: u32, frame_rate: f64) -> f64 {
    if frame_rate <= 0.0 {
        return 0.0;
    }
    f64::from(index) / frame_rate
}

/// Pixel dimensions of an extracted thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Location of the media a filmstrip is extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum SourceRef {
    /// A local file.
    Path(PathBuf),
    /// A URL the decoder can open directly.
    Url(String),
}

impl SourceRef {
    /// The string handed to the decoder as its input argument.
    pub fn as_input(&self) -> String {
        match self {
            SourceRef::Path(p) => p.to_string_lossy().into_owned(),
            SourceRef::Url(u) => u.clone(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_input())
    }
}

// ---------------------------------------------------------------------------
// PriorityWindow
// ---------------------------------------------------------------------------

/// Half-open frame-index range the caller needs densely covered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriorityWindow {
    pub start_index: u32,
    pub end_index: u32,
}

impl PriorityWindow {
    pub const fn new(start_index: u32, end_index: u32) -> Self {
        Self {
            start_index,
            end_index,
        }
    }

    /// Clamp the window to `[0, total_frames)`.
    ///
    /// Returns `None` when nothing of the window remains.
    pub fn clamp(&self, total_frames: u32) -> Option<Self> {
        let start = self.start_index.min(total_frames);
        let end = self.end_index.min(total_frames);
        (start < end).then_some(Self::new(start, end))
    }

    pub fn len(&self) -> u32 {
        self.end_index.saturating_sub(self.start_index)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: u32) -> bool {
        index >= self.start_index && index < self.end_index
    }
}

// ---------------------------------------------------------------------------
// FrameHandle
// ---------------------------------------------------------------------------

struct HandleInner {
    bytes: Bytes,
    revoked: AtomicBool,
}

/// Owned reference to the encoded bytes of one extracted frame.
///
/// Handles are issued and revoked by the engine's handle arena. Clones share
/// the revocation flag: once the engine replaces or evicts a frame, every
/// clone stops resolving, the same way a revoked object URL does.
#[derive(Clone)]
pub struct FrameHandle {
    id: HandleId,
    inner: Arc<HandleInner>,
}

impl FrameHandle {
    pub fn new(id: HandleId, bytes: Bytes) -> Self {
        Self {
            id,
            inner: Arc::new(HandleInner {
                bytes,
                revoked: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The encoded image bytes, or `None` once the handle was revoked.
    pub fn bytes(&self) -> Option<Bytes> {
        if self.is_revoked() {
            None
        } else {
            Some(self.inner.bytes.clone())
        }
    }

    /// Size of the encoded bytes, regardless of revocation.
    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    pub fn revoke(&self) {
        self.inner.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl PartialEq for FrameHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FrameHandle {}

// ---------------------------------------------------------------------------
// Filmstrip
// ---------------------------------------------------------------------------

/// One decoded thumbnail in a filmstrip.
#[derive(Debug, Clone, PartialEq)]
pub struct FilmstripFrame {
    pub index: u32,
    /// Seconds from the start of the clip: `index / frame_rate`.
    pub timestamp: f64,
    pub handle: FrameHandle,
    pub byte_size: Option<u64>,
}

impl FilmstripFrame {
    pub fn new(index: u32, frame_rate: f64, handle: FrameHandle) -> Self {
        let byte_size = Some(handle.len() as u64);
        Self {
            index,
            timestamp: frame_timestamp(index, frame_rate),
            handle,
            byte_size,
        }
    }
}

/// Ordered, possibly partial set of thumbnails for one asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filmstrip {
    /// Frames sorted by ascending index, no duplicates.
    pub frames: Vec<FilmstripFrame>,
    pub is_complete: bool,
    pub is_extracting: bool,
    /// 0..=100.
    pub progress: u8,
}

impl Filmstrip {
    /// Placeholder returned while the first extraction is being set up.
    pub fn pending() -> Self {
        Self {
            frames: Vec::new(),
            is_complete: false,
            is_extracting: true,
            progress: 0,
        }
    }

    /// Build a filmstrip from frames in any order.
    ///
    /// Frames are sorted by index; for duplicate indices the last one wins.
    pub fn from_frames(
        frames: impl IntoIterator<Item = FilmstripFrame>,
        is_complete: bool,
        is_extracting: bool,
        progress: u8,
    ) -> Self {
        let mut frames: Vec<FilmstripFrame> = frames.into_iter().collect();
        frames.reverse();
        frames.sort_by_key(|f| f.index);
        frames.dedup_by_key(|f| f.index);
        Self {
            frames,
            is_complete,
            is_extracting,
            progress: progress.min(100),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sum of the encoded frame sizes.
    pub fn size_bytes(&self) -> u64 {
        self.frames
            .iter()
            .map(|f| f.byte_size.unwrap_or(f.handle.len() as u64))
            .sum()
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.frames.iter().map(|f| f.index)
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.frame(index).is_some()
    }

    pub fn frame(&self, index: u32) -> Option<&FilmstripFrame> {
        self.frames
            .binary_search_by_key(&index, |f| f.index)
            .ok()
            .map(|pos| &self.frames[pos])
    }
}
