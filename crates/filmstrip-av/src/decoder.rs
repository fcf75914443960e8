//! Frame decoding.
//!
//! [`FrameDecoder`] is the boundary the extraction workers decode through:
//! given a source, a presentation time and a target size it produces one
//! RGBA thumbnail. Two ffmpeg strategies are provided. The fast one seeks on
//! the input (keyframe-granular, cheap) and the accurate one decodes from the
//! start of the stream up to the exact time, which is what the engine falls
//! back to when fast decoding keeps failing.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use filmstrip_core::config::ToolsConfig;
use filmstrip_core::{FrameSize, SourceRef};
use image::RgbaImage;
use tokio::sync::OnceCell;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Failure to produce a frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The decoder could not start at the requested time without a key frame.
    #[error("decoder requires a key frame before {timestamp:.3}s")]
    KeyframeRequired { timestamp: f64 },

    #[error("no frame decoded at {timestamp:.3}s")]
    NoFrame { timestamp: f64 },

    /// The decoder could not be constructed.
    #[error("decoder unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Tool(#[from] filmstrip_core::Error),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

impl DecodeError {
    /// Whether the failure is the keyframe-dependency class that a restart
    /// with fewer parallel decoders may cure.
    pub fn is_keyframe_required(&self) -> bool {
        match self {
            Self::KeyframeRequired { .. } => true,
            Self::Tool(e) => mentions_key_frame(&e.to_string()),
            _ => false,
        }
    }
}

impl From<DecodeError> for filmstrip_core::Error {
    fn from(e: DecodeError) -> Self {
        filmstrip_core::Error::Decode(e.to_string())
    }
}

fn mentions_key_frame(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("key frame") || lower.contains("keyframe")
}

/// Produces RGBA thumbnails from a media source.
#[async_trait]
pub trait FrameDecoder: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    /// Decode the frame presented at `timestamp` seconds, scaled to `size`.
    async fn decode(
        &self,
        source: &SourceRef,
        timestamp: f64,
        size: FrameSize,
    ) -> Result<RgbaImage, DecodeError>;
}

// ---------------------------------------------------------------------------
// ffmpeg
// ---------------------------------------------------------------------------

/// Where ffmpeg seeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Seek on the input: jumps to the nearest key frame first.
    Fast,
    /// Decode from the start and discard frames until the timestamp.
    Accurate,
}

/// Single-frame grabber backed by the `ffmpeg` CLI.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg_path: PathBuf,
    mode: SeekMode,
    timeout: Duration,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_path: PathBuf, mode: SeekMode) -> Self {
        Self {
            ffmpeg_path,
            mode,
            timeout: Duration::from_secs(30),
        }
    }

    /// Create a decoder from a discovered registry.
    pub fn from_registry(registry: &ToolRegistry, mode: SeekMode) -> filmstrip_core::Result<Self> {
        let tool = registry.require("ffmpeg")?;
        Ok(Self {
            ffmpeg_path: tool.path.clone(),
            mode,
            timeout: tool.timeout,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> SeekMode {
        self.mode
    }

    /// ffmpeg arguments grabbing one PNG frame to stdout.
    pub fn args(&self, source: &SourceRef, timestamp: f64, size: FrameSize) -> Vec<String> {
        let ts = format!("{timestamp:.3}");
        let input = source.as_input();
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        match self.mode {
            SeekMode::Fast => {
                args.extend(["-ss".into(), ts, "-i".into(), input]);
            }
            SeekMode::Accurate => {
                args.extend(["-i".into(), input, "-ss".into(), ts]);
            }
        }
        args.extend([
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={}:{}", size.width, size.height),
            "-f".into(),
            "image2pipe".into(),
            "-c:v".into(),
            "png".into(),
            "-".into(),
        ]);
        args
    }
}

#[async_trait]
impl FrameDecoder for FfmpegDecoder {
    fn name(&self) -> &'static str {
        match self.mode {
            SeekMode::Fast => "ffmpeg-fast",
            SeekMode::Accurate => "ffmpeg-accurate",
        }
    }

    async fn decode(
        &self,
        source: &SourceRef,
        timestamp: f64,
        size: FrameSize,
    ) -> Result<RgbaImage, DecodeError> {
        let mut cmd = ToolCommand::new(self.ffmpeg_path.clone());
        cmd.args(self.args(source, timestamp, size));
        cmd.timeout(self.timeout);

        let output = cmd.run().await?;
        if !output.success() {
            if mentions_key_frame(&output.stderr) {
                return Err(DecodeError::KeyframeRequired { timestamp });
            }
            return Err(DecodeError::Tool(filmstrip_core::Error::tool(
                cmd.tool_name(),
                format!("exited with {}: {}", output.status, output.stderr_tail()),
            )));
        }

        if output.stdout.is_empty() {
            // Input seeking past the last reachable key frame yields nothing.
            return Err(match self.mode {
                SeekMode::Fast => DecodeError::KeyframeRequired { timestamp },
                SeekMode::Accurate => DecodeError::NoFrame { timestamp },
            });
        }

        let image = image::load_from_memory(&output.stdout)?;
        Ok(image.to_rgba8())
    }
}

// ---------------------------------------------------------------------------
// Lazy construction
// ---------------------------------------------------------------------------

type DecoderInit = Box<dyn Fn() -> Result<Arc<dyn FrameDecoder>, DecodeError> + Send + Sync>;

/// Decoder built on first use.
///
/// Tool discovery and decoder setup are deferred until a frame is actually
/// requested. A failed initialization is retried on the next call.
pub struct LazyDecoder {
    name: &'static str,
    init: DecoderInit,
    decoder: OnceCell<Arc<dyn FrameDecoder>>,
}

impl LazyDecoder {
    pub fn new<F>(name: &'static str, init: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn FrameDecoder>, DecodeError> + Send + Sync + 'static,
    {
        Self {
            name,
            init: Box::new(init),
            decoder: OnceCell::new(),
        }
    }

    /// ffmpeg decoder discovered from the tool configuration on first use.
    pub fn ffmpeg(tools: ToolsConfig, mode: SeekMode) -> Self {
        let name = match mode {
            SeekMode::Fast => "lazy-ffmpeg-fast",
            SeekMode::Accurate => "lazy-ffmpeg-accurate",
        };
        Self::new(name, move || {
            let registry = ToolRegistry::discover(&tools);
            let decoder = FfmpegDecoder::from_registry(&registry, mode)
                .map_err(|e| DecodeError::Unavailable(e.to_string()))?;
            tracing::debug!(decoder = decoder.name(), "Initialized frame decoder");
            Ok(Arc::new(decoder) as Arc<dyn FrameDecoder>)
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.decoder.initialized()
    }

    async fn get(&self) -> Result<&Arc<dyn FrameDecoder>, DecodeError> {
        self.decoder.get_or_try_init(|| async { (self.init)() }).await
    }
}

impl fmt::Debug for LazyDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyDecoder")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[async_trait]
impl FrameDecoder for LazyDecoder {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn decode(
        &self,
        source: &SourceRef,
        timestamp: f64,
        size: FrameSize,
    ) -> Result<RgbaImage, DecodeError> {
        self.get().await?.decode(source, timestamp, size).await
    }
}
