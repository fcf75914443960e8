//! Typed ID wrappers providing compile-time safety for engine identifiers.
//!
//! Asset ids come from the external media catalog and are opaque strings.
//! Worker, request and handle ids are process-local counters handed out by
//! the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Generate a newtype ID wrapper over `u64`.
///
/// The macro produces a struct with:
/// - `new(u64)` and `get()` accessors
/// - `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`, `Ord`, `Serialize`, `Deserialize`
/// - `Display` rendering as `<prefix>-<n>`
macro_rules! counter_id {
    ($($(#[doc = $doc:expr])* $name:ident => $prefix:literal),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(u64);

            impl $name {
                /// Wrap a raw counter value.
                #[must_use]
                pub const fn new(value: u64) -> Self {
                    Self(value)
                }

                /// Return the raw counter value.
                #[must_use]
                pub const fn get(&self) -> u64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}-{}", $prefix, self.0)
                }
            }
        )+
    };
}

counter_id! {
    /// Identifier of one background extraction worker.
    WorkerId => "worker",
    /// Identifier of one extract request sent to a worker.
    RequestId => "req",
    /// Identifier of one issued frame handle.
    HandleId => "handle",
}

/// Identifier of a media asset, as assigned by the media catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Create an asset id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form of the id.
    ///
    /// ASCII alphanumerics, `-` and `_` pass through; every other byte is
    /// written as `%XX` so distinct ids never collide on disk.
    pub fn storage_key(&self) -> String {
        let mut key = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                key.push(byte as char);
            } else {
                key.push_str(&format!("%{byte:02X}"));
            }
        }
        key
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AssetId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("asset id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
