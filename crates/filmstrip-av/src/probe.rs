//! FFprobe-based media probing.
//!
//! Shells out to `ffprobe -v quiet -print_format json -show_format -show_streams`
//! and maps the JSON output into [`MediaInfo`], which carries what filmstrip
//! extraction needs to know up front: duration, frame geometry and the
//! native frame rate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use filmstrip_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Frame rate assumed when a stream does not report one.
const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Summary of a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    /// Seconds; zero when the container does not report a duration.
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub video_codec: Option<String>,
    pub container: Option<String>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct MediaProbe {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl MediaProbe {
    /// Create a new prober using the given ffprobe path.
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self {
            ffprobe_path,
            timeout: Duration::from_secs(30),
        }
    }

    /// Create a prober from a discovered registry.
    pub fn from_registry(registry: &ToolRegistry) -> Result<Self> {
        let tool = registry.require("ffprobe")?;
        Ok(Self {
            ffprobe_path: tool.path.clone(),
            timeout: tool.timeout,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(path.to_string_lossy().as_ref());
        cmd.timeout(self.timeout);

        let output = cmd.execute().await?;
        parse_probe_json(path, &output.stdout)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_probe_json(path: &Path, json: &[u8]) -> Result<MediaInfo> {
    let output: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| Error::tool("ffprobe", format!("JSON parse error: {e}")))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    // Some containers only report the duration on the stream.
    let duration_secs = output
        .format
        .duration
        .as_deref()
        .and_then(parse_seconds)
        .or_else(|| video.and_then(|v| v.duration.as_deref()).and_then(parse_seconds))
        .unwrap_or(0.0);

    let frame_rate = video
        .and_then(|v| v.r_frame_rate.as_deref())
        .and_then(parse_frame_rate)
        .filter(|r| *r > 0.0)
        .unwrap_or(DEFAULT_FRAME_RATE);

    Ok(MediaInfo {
        path: path.to_path_buf(),
        duration_secs,
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        frame_rate,
        video_codec: video.and_then(|v| v.codec_name.clone()),
        container: output.format.format_name,
    })
}

fn parse_seconds(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    if let Some((num, den)) = rate_str.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den != 0.0).then(|| num / den);
    }
    rate_str.parse().ok()
}
