//! # filmstrip-av
//!
//! Decoding and probing for the filmstrip engine.
//!
//! This crate provides:
//!
//! - **Frame decoding** ([`FrameDecoder`]) -- the seam the engine decodes
//!   through, with an ffmpeg-backed implementation ([`FfmpegDecoder`]) in a
//!   fast-seek and an accurate seek-capture mode, plus [`LazyDecoder`] which
//!   defers decoder construction until the first frame is needed.
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Media probing** ([`MediaProbe`]) -- duration, dimensions and frame
//!   rate of a source via ffprobe.

pub mod command;
pub mod decoder;
pub mod probe;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use decoder::{DecodeError, FfmpegDecoder, FrameDecoder, LazyDecoder, SeekMode};
pub use probe::{MediaInfo, MediaProbe};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
