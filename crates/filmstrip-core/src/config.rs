//! Engine configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries the
//! sub-configs for the blob store, sampling, extraction, memory budget, cache
//! and external tools. Every section defaults sensibly so an empty file is
//! valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::media::FrameSize;
use crate::Error;

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub sampling: SamplingConfig,
    pub extraction: ExtractionConfig,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(self.sampling.frame_rate > 0.0) {
            warnings.push("sampling.frame_rate must be positive; no frames will be targeted".into());
        }
        if self.sampling.max_target_frames < self.sampling.dense_threshold {
            warnings.push(format!(
                "sampling.max_target_frames ({}) is below dense_threshold ({})",
                self.sampling.max_target_frames, self.sampling.dense_threshold
            ));
        }
        if self.sampling.priority_max_frames < self.sampling.priority_dense_limit {
            warnings.push(format!(
                "sampling.priority_max_frames ({}) is below priority_dense_limit ({})",
                self.sampling.priority_max_frames, self.sampling.priority_dense_limit
            ));
        }
        let tiers = &self.sampling.stride_tiers;
        if tiers.windows(2).any(|w| w[0] >= w[1]) {
            warnings.push("sampling.stride_tiers should be strictly increasing".into());
        }

        if self.extraction.frame_width == 0 || self.extraction.frame_height == 0 {
            warnings.push("extraction frame size has a zero dimension".into());
        }
        if self.extraction.max_parallel_writes == 0 {
            warnings.push("extraction.max_parallel_writes is 0; treated as 1".into());
        }
        if self.extraction.max_workers_per_session == 0 {
            warnings.push("extraction.max_workers_per_session is 0; treated as 1".into());
        }

        if self.memory.soft_limit_bytes >= self.memory.hard_limit_bytes {
            warnings.push(format!(
                "memory.soft_limit_bytes ({}) should be below hard_limit_bytes ({})",
                self.memory.soft_limit_bytes, self.memory.hard_limit_bytes
            ));
        }

        if self.cache.metrics_capacity == 0 {
            warnings.push("cache.metrics_capacity is 0; no metric samples will be kept".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Blob store location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/filmstrips"),
        }
    }
}

/// Sampling-strategy tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Frame slots per second of media.
    pub frame_rate: f64,
    /// Clips with at most this many frames are extracted densely.
    pub dense_threshold: u32,
    /// Hard cap on the frame budget of a single clip.
    pub max_target_frames: u32,
    /// Multiplier of the square-root growth above the dense threshold.
    pub budget_scale: f64,
    /// Clip-length boundaries for background strides 1, 2, 3 (above: 4).
    pub stride_tiers: Vec<u32>,
    /// Priority windows up to this length are taken in full.
    pub priority_dense_limit: u32,
    /// Absolute cap on indices taken from one priority window.
    pub priority_max_frames: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            frame_rate: 1.0,
            dense_threshold: 60,
            max_target_frames: 300,
            budget_scale: 6.0,
            stride_tiers: vec![300, 900, 1800],
            priority_dense_limit: 90,
            priority_max_frames: 120,
        }
    }
}

/// Worker and session tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    /// Concurrent blob writes per worker.
    pub max_parallel_writes: usize,
    pub max_workers_per_session: usize,
    /// Below this many frames to extract a session runs on one worker.
    pub min_frames_for_parallel: usize,
    /// Below this many cores a session runs on one worker.
    pub min_cores_for_parallel: usize,
    pub max_idle_workers: usize,
    /// Frames that must arrive before a throttled progress notification.
    pub progress_frame_delta: usize,
    pub progress_min_interval_ms: u64,
    /// Workers ship frame bytes inside progress messages. When false they only
    /// report saved indices and the orchestrator reads the frames back.
    pub inline_frame_bytes: bool,
    /// Override for the detected hardware concurrency.
    pub cpu_count: Option<usize>,
}

impl ExtractionConfig {
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::new(self.frame_width, self.frame_height)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            frame_width: 160,
            frame_height: 90,
            max_parallel_writes: 4,
            max_workers_per_session: 2,
            min_frames_for_parallel: 48,
            min_cores_for_parallel: 4,
            max_idle_workers: 2,
            progress_frame_delta: 8,
            progress_min_interval_ms: 250,
            inline_frame_bytes: true,
            cpu_count: None,
        }
    }
}

/// Memory budget thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
    /// Also consult the OS resident-set size of this process.
    pub use_process_memory: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit_bytes: 192 * MIB,
            hard_limit_bytes: 384 * MIB,
            use_process_memory: false,
        }
    }
}

/// In-memory cache behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Grace period before an unobserved, idle asset is dropped from memory.
    pub idle_eviction_ms: u64,
    /// Number of extraction metric samples retained.
    pub metrics_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_eviction_ms: 30_000,
            metrics_capacity: 50,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    #[serde(default = "default_decode_timeout")]
    pub decode_timeout_secs: u64,
}

fn default_decode_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            decode_timeout_secs: default_decode_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        assert_eq!(cfg.sampling.frame_rate, 1.0);
        assert_eq!(cfg.extraction.frame_size(), FrameSize::new(160, 90));
        assert_eq!(cfg.cache.idle_eviction_ms, 30_000);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let cfg = Config::from_toml(
            r#"
            [store]
            root = "/var/cache/strips"

            [memory]
            soft_limit_bytes = 1000
            hard_limit_bytes = 2000

            [extraction]
            cpu_count = 8
            inline_frame_bytes = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.store.root, PathBuf::from("/var/cache/strips"));
        assert_eq!(cfg.memory.soft_limit_bytes, 1000);
        assert_eq!(cfg.extraction.cpu_count, Some(8));
        assert!(!cfg.extraction.inline_frame_bytes);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.extraction.max_parallel_writes, 4);
        assert_eq!(cfg.tools.decode_timeout_secs, 30);
    }

    #[test]
    fn invalid_toml_is_validation_error() {
        let err = Config::from_toml("[memory\nsoft = ").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn validate_flags_inverted_memory_limits() {
        let mut cfg = Config::default();
        cfg.memory.soft_limit_bytes = cfg.memory.hard_limit_bytes;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("soft_limit_bytes")));
    }

    #[test]
    fn validate_flags_bad_frame_rate_and_tiers() {
        let mut cfg = Config::default();
        cfg.sampling.frame_rate = 0.0;
        cfg.sampling.stride_tiers = vec![900, 300];
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("frame_rate")));
        assert!(warnings.iter().any(|w| w.contains("stride_tiers")));
    }

    #[test]
    fn load_or_default_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/filmstrip.toml")));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_or_default_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filmstrip.toml");
        std::fs::write(&path, "[cache]\nidle_eviction_ms = 5\n").unwrap();
        let cfg = Config::load_or_default(Some(&path));
        assert_eq!(cfg.cache.idle_eviction_ms, 5);
    }
}
