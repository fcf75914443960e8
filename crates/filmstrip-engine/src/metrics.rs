//! Extraction metrics.
//!
//! [`MetricsRing`] keeps a bounded ring buffer of recent session records so
//! callers can inspect how extraction has been behaving.

use chrono::{DateTime, Utc};
use filmstrip_core::AssetId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::fallback::DecodePath;

// ---------------------------------------------------------------------------
// ExtractionOutcome
// ---------------------------------------------------------------------------

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionOutcome {
    Completed,
    Failed,
    Aborted,
}

// ---------------------------------------------------------------------------
// ExtractionMetrics
// ---------------------------------------------------------------------------

/// Immutable record of one extraction session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetrics {
    pub asset_id: AssetId,
    pub outcome: ExtractionOutcome,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_frames: u32,
    /// Size of the session's target set.
    pub target_frames: usize,
    /// Frames decoded by this session (excluding ones known beforehand).
    pub frames_extracted: usize,
    /// Most workers assigned at once.
    pub worker_count: usize,
    /// Decode paths in the order they were tried.
    pub decode_paths: Vec<DecodePath>,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// MetricsSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of the ring plus lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Newest first.
    pub samples: Vec<ExtractionMetrics>,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    /// Mean duration of the retained completed sessions.
    pub avg_completed_ms: Option<f64>,
}

impl MetricsSnapshot {
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.aborted
    }
}

// ---------------------------------------------------------------------------
// MetricsRing
// ---------------------------------------------------------------------------

/// Bounded ring buffer of recent session records.
#[derive(Debug)]
pub struct MetricsRing {
    capacity: usize,
    recent: VecDeque<ExtractionMetrics>,
    completed: u64,
    failed: u64,
    aborted: u64,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            completed: 0,
            failed: 0,
            aborted: 0,
        }
    }

    /// Store a record, dropping the oldest when full.
    pub fn record(&mut self, metrics: ExtractionMetrics) {
        match metrics.outcome {
            ExtractionOutcome::Completed => self.completed += 1,
            ExtractionOutcome::Failed => self.failed += 1,
            ExtractionOutcome::Aborted => self.aborted += 1,
        }

        tracing::debug!(
            asset_id = %metrics.asset_id,
            outcome = ?metrics.outcome,
            duration_ms = metrics.duration_ms,
            frames = metrics.frames_extracted,
            "Recorded extraction metrics"
        );

        if self.capacity == 0 {
            return;
        }
        if self.recent.len() >= self.capacity {
            self.recent.pop_back();
        }
        self.recent.push_front(metrics);
    }

    /// Return the `n` most recent records (newest first).
    pub fn recent(&self, n: usize) -> Vec<ExtractionMetrics> {
        self.recent.iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed: Vec<u64> = self
            .recent
            .iter()
            .filter(|m| m.outcome == ExtractionOutcome::Completed)
            .map(|m| m.duration_ms)
            .collect();
        let avg_completed_ms = (!completed.is_empty())
            .then(|| completed.iter().sum::<u64>() as f64 / completed.len() as f64);

        MetricsSnapshot {
            samples: self.recent.iter().cloned().collect(),
            completed: self.completed,
            failed: self.failed,
            aborted: self.aborted,
            avg_completed_ms,
        }
    }
}
