//! Per-asset extraction session state.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use filmstrip_core::{AssetId, Filmstrip, FilmstripFrame, PriorityWindow, RequestId, SourceRef, WorkerId};
use tokio::time::Instant;

use crate::cache::SubscriberId;
use crate::fallback::{DecodePath, FallbackState};
use crate::metrics::{ExtractionMetrics, ExtractionOutcome};
use crate::protocol::DecodeStrategy;

/// One worker's contiguous slice of the target set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRangeAssignment {
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub start_index: u32,
    /// Exclusive.
    pub end_index: u32,
    pub completed: bool,
    pub frame_count: u32,
}

/// Split ascending indices into up to `workers` contiguous half-open ranges
/// holding near-equal numbers of indices.
pub fn partition(indices: &[u32], workers: usize) -> Vec<(u32, u32)> {
    if indices.is_empty() || workers == 0 {
        return Vec::new();
    }
    let workers = workers.min(indices.len());
    let base = indices.len() / workers;
    let extra = indices.len() % workers;

    let mut ranges = Vec::with_capacity(workers);
    let mut offset = 0;
    for w in 0..workers {
        let len = base + usize::from(w < extra);
        let chunk = &indices[offset..offset + len];
        ranges.push((chunk[0], chunk[len - 1] + 1));
        offset += len;
    }
    ranges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Queued,
    Active,
}

/// Rate limiter for progress notifications.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_delta: usize,
    min_interval: Duration,
    last_emit: Instant,
    frames_at_last_emit: usize,
}

impl ProgressThrottle {
    pub fn new(min_delta: usize, min_interval: Duration, frames: usize, now: Instant) -> Self {
        Self {
            min_delta: min_delta.max(1),
            min_interval,
            last_emit: now,
            frames_at_last_emit: frames,
        }
    }

    /// Whether an update with `frames` frames should be published now.
    /// Records the emission when it returns true.
    pub fn should_emit(&mut self, frames: usize, now: Instant) -> bool {
        if frames <= self.frames_at_last_emit {
            return false;
        }
        let delta = frames - self.frames_at_last_emit;
        if delta >= self.min_delta || now.duration_since(self.last_emit) >= self.min_interval {
            self.mark(frames, now);
            true
        } else {
            false
        }
    }

    pub fn mark(&mut self, frames: usize, now: Instant) {
        self.last_emit = now;
        self.frames_at_last_emit = frames;
    }
}

/// Live state of one asset's extraction.
#[derive(Debug)]
pub struct ExtractionSession {
    pub asset_id: AssetId,
    pub generation: u64,
    pub source: SourceRef,
    pub duration: f64,
    pub total_frames: u32,
    pub state: SessionState,
    /// The asset was already complete; this session only refines it.
    pub base_complete: bool,
    pub targets: BTreeSet<u32>,
    pub priority: Vec<u32>,
    /// Every materialized frame: the ones known at creation plus new ones.
    pub frames: BTreeMap<u32, FilmstripFrame>,
    initial_frames: usize,
    pub assignments: Vec<WorkerRangeAssignment>,
    pub strategy: DecodeStrategy,
    pub path: DecodePath,
    pub force_single_worker: bool,
    pub fallback: FallbackState,
    /// Store read-backs of saved indices still in flight.
    pub pending_reads: usize,
    /// Priority window requested while this session was running.
    pub pending_window: Option<PriorityWindow>,
    pub transient_subscribers: Vec<SubscriberId>,
    pub throttle: ProgressThrottle,
    pub decode_paths: Vec<DecodePath>,
    pub max_workers: usize,
    pub retries: u32,
    pub last_error: Option<String>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

/// Inputs for a new session.
#[derive(Debug)]
pub struct SessionPlan {
    pub asset_id: AssetId,
    pub generation: u64,
    pub source: SourceRef,
    pub duration: f64,
    pub total_frames: u32,
    pub base_complete: bool,
    pub targets: Vec<u32>,
    pub priority: Vec<u32>,
    pub known_frames: Vec<FilmstripFrame>,
}

impl ExtractionSession {
    pub fn new(plan: SessionPlan, throttle: ProgressThrottle, now: Instant) -> Self {
        let frames: BTreeMap<u32, FilmstripFrame> = plan
            .known_frames
            .into_iter()
            .map(|f| (f.index, f))
            .collect();
        let initial_frames = frames.len();
        Self {
            asset_id: plan.asset_id,
            generation: plan.generation,
            source: plan.source,
            duration: plan.duration,
            total_frames: plan.total_frames,
            state: SessionState::Queued,
            base_complete: plan.base_complete,
            targets: plan.targets.into_iter().collect(),
            priority: plan.priority,
            frames,
            initial_frames,
            assignments: Vec::new(),
            strategy: DecodeStrategy::Fast,
            path: DecodePath::SingleWorker,
            force_single_worker: false,
            fallback: FallbackState::default(),
            pending_reads: 0,
            pending_window: None,
            transient_subscribers: Vec::new(),
            throttle,
            decode_paths: Vec::new(),
            max_workers: 0,
            retries: 0,
            last_error: None,
            started_at: now,
            started_wall: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Targets not yet materialized, ascending.
    pub fn remaining(&self) -> Vec<u32> {
        self.targets
            .iter()
            .copied()
            .filter(|i| !self.frames.contains_key(i))
            .collect()
    }

    pub fn remaining_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|i| !self.frames.contains_key(i))
            .count()
    }

    /// Share of the target set materialized, 0..=99.
    pub fn progress(&self) -> u8 {
        if self.targets.is_empty() {
            return 99;
        }
        let covered = self.targets.len() - self.remaining_count();
        ((covered * 99) / self.targets.len()) as u8
    }

    /// Frames decoded by this session.
    pub fn extracted_count(&self) -> usize {
        self.frames.len().saturating_sub(self.initial_frames)
    }

    pub fn insert_frame(&mut self, frame: FilmstripFrame) {
        self.frames.insert(frame.index, frame);
    }

    pub fn snapshot(&self, is_complete: bool, is_extracting: bool, progress: u8) -> Filmstrip {
        Filmstrip::from_frames(self.frames.values().cloned(), is_complete, is_extracting, progress)
    }

    /// Snapshot while work is still pending.
    pub fn in_flight_snapshot(&self) -> Filmstrip {
        self.snapshot(self.base_complete, true, self.progress())
    }

    pub fn assignment_mut(
        &mut self,
        worker_id: WorkerId,
        request_id: RequestId,
    ) -> Option<&mut WorkerRangeAssignment> {
        self.assignments
            .iter_mut()
            .find(|a| a.worker_id == worker_id && a.request_id == request_id)
    }

    pub fn all_workers_completed(&self) -> bool {
        !self.assignments.is_empty() && self.assignments.iter().all(|a| a.completed)
    }

    pub fn ready_to_finalize(&self) -> bool {
        self.all_workers_completed() && self.pending_reads == 0
    }

    /// Workers still running an assignment.
    pub fn running_workers(&self) -> Vec<WorkerId> {
        self.assignments
            .iter()
            .filter(|a| !a.completed)
            .map(|a| a.worker_id)
            .collect()
    }

    /// Reset for a restart on another decode path. The target set grows to
    /// include every known frame so nothing already decoded is lost.
    pub fn prepare_restart(&mut self) {
        let known: Vec<u32> = self.frames.keys().copied().collect();
        self.targets.extend(known);
        self.assignments.clear();
        self.pending_reads = 0;
        self.retries += 1;
    }

    /// Record the start of a run on `path` with `workers` workers.
    pub fn begin_run(&mut self, path: DecodePath, workers: usize) {
        self.path = path;
        self.state = SessionState::Active;
        self.max_workers = self.max_workers.max(workers);
        if self.decode_paths.last() != Some(&path) {
            self.decode_paths.push(path);
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.started_at)
    }

    pub fn metrics(&self, outcome: ExtractionOutcome, now: Instant) -> ExtractionMetrics {
        ExtractionMetrics {
            asset_id: self.asset_id.clone(),
            outcome,
            started_at: self.started_wall,
            duration_ms: self.elapsed(now).as_millis() as u64,
            total_frames: self.total_frames,
            target_frames: self.targets.len(),
            frames_extracted: self.extracted_count(),
            worker_count: self.max_workers,
            decode_paths: self.decode_paths.clone(),
            retries: self.retries,
            error: self.last_error.clone(),
        }
    }
}
