//! Failure classification and the decode fallback chain.
//!
//! A failing session escalates at most twice: a parallel session that hit
//! the keyframe precondition restarts on a single worker, anything that has
//! not yet tried it restarts on the seek-and-capture path, and a failure on
//! that path is terminal.

use serde::{Deserialize, Serialize};

/// Decode path a session ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePath {
    /// Fast decoder, range split across several workers.
    Parallel,
    /// Fast decoder, one worker.
    SingleWorker,
    /// Seek-and-capture decoder, one worker.
    Element,
}

impl std::fmt::Display for DecodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Parallel => "parallel",
            Self::SingleWorker => "single_worker",
            Self::Element => "element",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The decoder needs a fresh key frame after being reconfigured.
    KeyframeRequired,
    Other,
}

/// Classify a worker error message.
pub fn classify_failure(error: &str) -> FailureKind {
    let lower = error.to_ascii_lowercase();
    if lower.contains("key frame") || lower.contains("keyframe") {
        FailureKind::KeyframeRequired
    } else {
        FailureKind::Other
    }
}

/// Escalations a session has already been through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackState {
    pub single_worker_tried: bool,
    pub element_tried: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    RetrySingleWorker,
    FallbackElement,
    Terminal,
}

/// What to do after a worker failure.
pub fn next_action(path: DecodePath, kind: FailureKind, state: FallbackState) -> FallbackAction {
    if path == DecodePath::Element || state.element_tried {
        return FallbackAction::Terminal;
    }
    if kind == FailureKind::KeyframeRequired
        && path == DecodePath::Parallel
        && !state.single_worker_tried
    {
        return FallbackAction::RetrySingleWorker;
    }
    FallbackAction::FallbackElement
}
