//! Error type shared by the store, decoders and engine.
//!
//! Collaborator failures never reach `get_filmstrip` callers directly: the
//! engine turns them into partial filmstrips plus a metric record. The
//! variants exist so workers can report what broke and the fallback chain can
//! pick the next decode path.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration or request data was rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A blob store read or write failed.
    #[error("Store error: {0}")]
    Store(String),

    /// ffmpeg or ffprobe could not be run or exited with an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool { tool: String, message: String },

    /// A frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A decoded frame could not be encoded for storage.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The orchestrator task is no longer running.
    #[error("Filmstrip service has stopped")]
    ServiceStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn store(message: impl fmt::Display) -> Self {
        Error::Store(message.to_string())
    }

    /// Whether the blob store is to blame.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
