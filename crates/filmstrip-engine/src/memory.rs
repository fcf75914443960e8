//! Memory budget monitoring.
//!
//! Pressure is derived from the larger of the cache footprint and whatever a
//! [`MemoryPressureProbe`] can observe about the process, compared against
//! the configured soft and hard limits.

use filmstrip_core::config::MemoryConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    #[default]
    Normal,
    Soft,
    Hard,
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Soft => "soft",
            Self::Hard => "hard",
        };
        f.write_str(name)
    }
}

/// Optional process-level memory signal.
pub trait MemoryPressureProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bytes in use by the process, when observable.
    fn process_memory_bytes(&self) -> Option<u64>;
}

/// Portable default: observes nothing, so pressure follows the cache alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFootprintProbe;

impl MemoryPressureProbe for CacheFootprintProbe {
    fn name(&self) -> &'static str {
        "cache-footprint"
    }

    fn process_memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Resident set size of the current process, read through `sysinfo`.
pub struct ProcessMemoryProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    /// Returns `None` on platforms where the current pid is unavailable.
    pub fn new() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        Some(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }
}

impl MemoryPressureProbe for ProcessMemoryProbe {
    fn name(&self) -> &'static str {
        "process-rss"
    }

    fn process_memory_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system.process(self.pid).map(|p| p.memory())
    }
}

/// Pick the probe a configuration asks for.
pub fn probe_from_config(config: &MemoryConfig) -> Arc<dyn MemoryPressureProbe> {
    if config.use_process_memory {
        if let Some(probe) = ProcessMemoryProbe::new() {
            return Arc::new(probe);
        }
        tracing::warn!("Process memory is not observable here; using cache footprint only");
    }
    Arc::new(CacheFootprintProbe)
}

/// Classifies memory use into pressure levels.
pub struct MemoryMonitor {
    soft_limit: u64,
    hard_limit: u64,
    probe: Arc<dyn MemoryPressureProbe>,
}

impl MemoryMonitor {
    pub fn new(config: &MemoryConfig, probe: Arc<dyn MemoryPressureProbe>) -> Self {
        Self {
            soft_limit: config.soft_limit_bytes,
            hard_limit: config.hard_limit_bytes.max(config.soft_limit_bytes),
            probe,
        }
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    pub fn classify(&self, bytes: u64) -> MemoryPressure {
        if bytes >= self.hard_limit {
            MemoryPressure::Hard
        } else if bytes >= self.soft_limit {
            MemoryPressure::Soft
        } else {
            MemoryPressure::Normal
        }
    }

    /// Current pressure given the cache footprint.
    pub fn sample(&self, cache_bytes: u64) -> MemoryPressure {
        let process = self.probe.process_memory_bytes().unwrap_or(0);
        self.classify(cache_bytes.max(process))
    }
}
