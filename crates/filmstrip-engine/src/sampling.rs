//! Frame sampling strategy.
//!
//! Decides which frame indices of a clip are worth extracting. Short clips
//! are sampled densely; longer clips get a budget that grows with the square
//! root of their length, a coarser background stride, and a dense (or evenly
//! thinned) pass over the caller's priority window. Everything here is pure
//! and deterministic.

use std::collections::BTreeSet;

use filmstrip_core::config::SamplingConfig;
use filmstrip_core::PriorityWindow;

/// Index selection parameters, built once from [`SamplingConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sampler {
    dense_threshold: u32,
    max_target_frames: u32,
    budget_scale: f64,
    stride_tiers: Vec<u32>,
    priority_dense_limit: u32,
    priority_max_frames: u32,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(&SamplingConfig::default())
    }
}

impl Sampler {
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            dense_threshold: config.dense_threshold,
            max_target_frames: config.max_target_frames.max(config.dense_threshold),
            budget_scale: config.budget_scale.max(0.0),
            stride_tiers: config.stride_tiers.clone(),
            priority_dense_limit: config.priority_dense_limit,
            priority_max_frames: config.priority_max_frames.max(1),
        }
    }

    /// Number of frames a clip of `total_frames` may target.
    pub fn target_frame_budget(&self, total_frames: u32) -> u32 {
        if total_frames <= self.dense_threshold {
            return total_frames;
        }
        let excess = f64::from(total_frames - self.dense_threshold);
        let growth = (self.budget_scale * excess.sqrt()).round() as u32;
        self.dense_threshold
            .saturating_add(growth)
            .min(self.max_target_frames)
            .min(total_frames)
    }

    /// Background subsampling step for a clip length.
    pub fn background_stride(&self, total_frames: u32) -> u32 {
        let tier = self
            .stride_tiers
            .iter()
            .position(|&limit| total_frames <= limit)
            .unwrap_or(self.stride_tiers.len());
        tier as u32 + 1
    }

    /// Indices of the priority window that must be extracted, ascending.
    ///
    /// Small windows are taken in full; larger ones are thinned evenly to at
    /// most half their length and never more than the configured cap.
    pub fn priority_indices(&self, total_frames: u32, window: Option<PriorityWindow>) -> Vec<u32> {
        let Some(window) = window.and_then(|w| w.clamp(total_frames)) else {
            return Vec::new();
        };
        if window.len() <= self.priority_dense_limit {
            return (window.start_index..window.end_index).collect();
        }
        let count = self.priority_max_frames.min(window.len().div_ceil(2));
        even_positions(window.len() as usize, count as usize)
            .into_iter()
            .map(|offset| window.start_index + offset as u32)
            .collect()
    }

    /// Full target set, ascending and without duplicates.
    ///
    /// Always contains the first and last frame and every priority index.
    /// Whatever budget is left is spent on background candidates at the
    /// clip's stride, thinned evenly when there are more than fit. The
    /// candidates are addressed by position on the stride lattice and never
    /// materialized, so cost depends on the budget rather than clip length.
    pub fn target_indices(&self, total_frames: u32, window: Option<PriorityWindow>) -> Vec<u32> {
        if total_frames == 0 {
            return Vec::new();
        }

        let mut targets = BTreeSet::new();
        targets.insert(0);
        targets.insert(total_frames - 1);
        targets.extend(self.priority_indices(total_frames, window));

        let budget = self.target_frame_budget(total_frames) as usize;
        let remaining = budget.saturating_sub(targets.len());
        if remaining > 0 {
            let stride = self.background_stride(total_frames);
            let lattice = (total_frames - 1) / stride + 1;
            // Lattice positions already claimed, ascending.
            let taken: Vec<u32> = targets
                .iter()
                .filter(|&&index| index % stride == 0)
                .map(|&index| index / stride)
                .collect();
            let free = (lattice as usize).saturating_sub(taken.len());
            let picks: Vec<u32> = even_positions(free, remaining)
                .into_iter()
                .map(|n| nth_free_position(n as u32, &taken) * stride)
                .collect();
            targets.extend(picks);
        }

        targets.into_iter().collect()
    }
}

/// Choose `count` elements spread evenly over `candidates`, keeping both ends.
///
/// A single pick takes the middle element. Asking for at least as many as
/// exist returns everything.
pub fn pick_evenly(candidates: &[u32], count: usize) -> Vec<u32> {
    even_positions(candidates.len(), count)
        .into_iter()
        .map(|i| candidates[i])
        .collect()
}

/// Positions in `0..len` that [`pick_evenly`] would take.
fn even_positions(len: usize, count: usize) -> Vec<usize> {
    if count == 0 || len == 0 {
        return Vec::new();
    }
    if count >= len {
        return (0..len).collect();
    }
    if count == 1 {
        return vec![len / 2];
    }
    let (span, steps) = ((len - 1) as u64, (count - 1) as u64);
    (0..count as u64)
        .map(|i| (i * span / steps) as usize)
        .collect()
}

/// The `n`th lattice position, counting from zero, that is not in `taken`.
fn nth_free_position(n: u32, taken: &[u32]) -> u32 {
    let mut position = n;
    for &t in taken {
        if t <= position {
            position += 1;
        } else {
            break;
        }
    }
    position
}
