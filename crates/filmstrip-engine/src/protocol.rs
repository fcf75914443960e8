//! Messages exchanged between the orchestrator and extraction workers.

use std::collections::HashSet;

use bytes::Bytes;
use filmstrip_core::{AssetId, FrameSize, RequestId, SourceRef, WorkerId};
use serde::{Deserialize, Serialize};

/// Which decode path a worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// Bulk decoder, fast seeking.
    Fast,
    /// One frame at a time, decoded up to the exact presentation time.
    SeekCapture,
}

/// Decode one contiguous slice of a session's target set.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub request_id: RequestId,
    pub asset_id: AssetId,
    pub source: SourceRef,
    pub duration: f64,
    pub frame_size: FrameSize,
    /// Indices already materialized; never re-extracted.
    pub skip_indices: Vec<u32>,
    /// Indices to extract before anything else in the range.
    pub priority_indices: Vec<u32>,
    /// The session's whole target set; the worker only handles the part
    /// inside `[start_index, end_index)`.
    pub target_indices: Vec<u32>,
    pub start_index: u32,
    pub end_index: u32,
    pub total_frames: u32,
    pub max_parallel_writes: usize,
    pub frame_rate: f64,
    pub strategy: DecodeStrategy,
    /// Ship frame bytes in progress messages instead of indices only.
    pub inline_frame_bytes: bool,
}

impl ExtractRequest {
    /// Frames this request covers, in extraction order: priority indices
    /// first, then the rest ascending.
    pub fn frames_to_extract(&self) -> Vec<u32> {
        let skip: HashSet<u32> = self.skip_indices.iter().copied().collect();
        let in_range = |index: &u32| {
            *index >= self.start_index && *index < self.end_index && !skip.contains(index)
        };

        let mut targets: Vec<u32> = self.target_indices.iter().copied().filter(in_range).collect();
        targets.sort_unstable();
        targets.dedup();

        let target_set: HashSet<u32> = targets.iter().copied().collect();
        let mut priority: Vec<u32> = self
            .priority_indices
            .iter()
            .copied()
            .filter(|i| target_set.contains(i))
            .collect();
        priority.sort_unstable();
        priority.dedup();

        let priority_set: HashSet<u32> = priority.iter().copied().collect();
        priority.extend(targets.into_iter().filter(|i| !priority_set.contains(i)));
        priority
    }
}

/// Orchestrator → worker.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    Extract(ExtractRequest),
    Abort { request_id: RequestId },
}

/// One encoded frame that has been written to the blob store.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrame {
    pub index: u32,
    pub bytes: Bytes,
}

/// Worker → orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Progress {
        request_id: RequestId,
        /// Index of the frame that was just saved.
        frame_index: u32,
        /// Frames saved so far by this request.
        frame_count: u32,
        /// 0..=99
        progress: u8,
        saved_frames: Vec<SavedFrame>,
        saved_indices: Vec<u32>,
    },
    Complete {
        request_id: RequestId,
        frame_count: u32,
    },
    Error {
        request_id: RequestId,
        error: String,
    },
}

impl WorkerResponse {
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Progress { request_id, .. }
            | Self::Complete { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }
}

/// A response tagged with the worker that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker_id: WorkerId,
    pub response: WorkerResponse,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(targets: Vec<u32>, priority: Vec<u32>, skip: Vec<u32>, range: (u32, u32)) -> ExtractRequest {
        ExtractRequest {
            request_id: RequestId::new(1),
            asset_id: AssetId::new("a"),
            source: SourceRef::Path(PathBuf::from("/m.mp4")),
            duration: 100.0,
            frame_size: FrameSize::new(160, 90),
            skip_indices: skip,
            priority_indices: priority,
            target_indices: targets,
            start_index: range.0,
            end_index: range.1,
            total_frames: 100,
            max_parallel_writes: 4,
            frame_rate: 1.0,
            strategy: DecodeStrategy::Fast,
            inline_frame_bytes: true,
        }
    }

    #[test]
    fn extraction_order_puts_priority_first() {
        let req = request(vec![0, 10, 20, 30, 40, 50], vec![40, 30], vec![], (0, 100));
        assert_eq!(req.frames_to_extract(), vec![30, 40, 0, 10, 20, 50]);
    }

    #[test]
    fn extraction_respects_range_and_skip() {
        let req = request(
            vec![0, 10, 20, 30, 40, 50],
            vec![50],
            vec![20],
            (10, 50),
        );
        // 50 is outside the half-open range, 20 is already known.
        assert_eq!(req.frames_to_extract(), vec![10, 30, 40]);
    }

    #[test]
    fn priority_outside_targets_is_ignored() {
        let req = request(vec![1, 2, 3], vec![7], vec![], (0, 10));
        assert_eq!(req.frames_to_extract(), vec![1, 2, 3]);
    }

    #[test]
    fn response_request_id() {
        let resp = WorkerResponse::Complete {
            request_id: RequestId::new(9),
            frame_count: 3,
        };
        assert_eq!(resp.request_id(), RequestId::new(9));
    }
}
