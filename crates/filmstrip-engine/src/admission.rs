//! Admission queue and concurrency cap.

use filmstrip_core::AssetId;

use crate::memory::MemoryPressure;

/// Sessions allowed to extract at once on `cores` hardware threads.
pub fn base_concurrency(cores: usize) -> usize {
    match cores {
        c if c >= 8 => 3,
        c if c >= 4 => 2,
        _ => 1,
    }
}

/// Concurrency cap under the current memory pressure.
pub fn concurrency_cap(cores: usize, pressure: MemoryPressure) -> usize {
    let base = base_concurrency(cores);
    match pressure {
        MemoryPressure::Normal => base,
        MemoryPressure::Soft => (base / 2).max(1),
        MemoryPressure::Hard => 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedSession {
    asset_id: AssetId,
    remaining: usize,
    seq: u64,
}

/// Sessions waiting for a slot, cheapest first.
///
/// Ordered by frames remaining; ties keep arrival order.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    entries: Vec<QueuedSession>,
    next_seq: u64,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an asset, or re-rank it if it is already waiting.
    pub fn push(&mut self, asset_id: AssetId, remaining: usize) {
        let seq = match self.entries.iter().position(|e| e.asset_id == asset_id) {
            Some(pos) => self.entries.remove(pos).seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        let entry = QueuedSession {
            asset_id,
            remaining,
            seq,
        };
        let pos = self
            .entries
            .partition_point(|e| (e.remaining, e.seq) <= (entry.remaining, entry.seq));
        self.entries.insert(pos, entry);
    }

    pub fn pop_front(&mut self) -> Option<AssetId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).asset_id)
        }
    }

    pub fn remove(&mut self, asset_id: &AssetId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.asset_id != asset_id);
        self.entries.len() != before
    }

    pub fn contains(&self, asset_id: &AssetId) -> bool {
        self.entries.iter().any(|e| &e.asset_id == asset_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Queued assets in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &AssetId> {
        self.entries.iter().map(|e| &e.asset_id)
    }
}
