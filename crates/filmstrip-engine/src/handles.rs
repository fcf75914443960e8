//! Arena of outstanding frame handles.
//!
//! Every handle the engine hands out is tracked per asset. Replacing a frame
//! revokes the handle it replaces, and evicting an asset revokes all of its
//! handles in one batch.

use std::collections::HashMap;

use bytes::Bytes;
use filmstrip_core::{AssetId, FrameHandle, HandleId};

#[derive(Debug, Default)]
pub struct HandleArena {
    next_id: u64,
    outstanding: HashMap<AssetId, HashMap<u32, FrameHandle>>,
    revoked: u64,
}

impl HandleArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a handle for one frame, revoking the one it replaces.
    pub fn issue(&mut self, asset: &AssetId, index: u32, bytes: Bytes) -> FrameHandle {
        self.next_id += 1;
        let handle = FrameHandle::new(HandleId::new(self.next_id), bytes);
        let previous = self
            .outstanding
            .entry(asset.clone())
            .or_default()
            .insert(index, handle.clone());
        if let Some(previous) = previous {
            previous.revoke();
            self.revoked += 1;
        }
        handle
    }

    /// Revoke every handle of an asset. Returns how many were revoked.
    pub fn release_asset(&mut self, asset: &AssetId) -> usize {
        let Some(handles) = self.outstanding.remove(asset) else {
            return 0;
        };
        for handle in handles.values() {
            handle.revoke();
        }
        self.revoked += handles.len() as u64;
        handles.len()
    }

    pub fn release_all(&mut self) -> usize {
        let assets: Vec<AssetId> = self.outstanding.keys().cloned().collect();
        assets.iter().map(|a| self.release_asset(a)).sum()
    }

    pub fn outstanding(&self, asset: &AssetId) -> usize {
        self.outstanding.get(asset).map_or(0, HashMap::len)
    }

    pub fn total_outstanding(&self) -> usize {
        self.outstanding.values().map(HashMap::len).sum()
    }

    /// Handles revoked over the arena's lifetime.
    pub fn revoked_count(&self) -> u64 {
        self.revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacing_a_frame_revokes_old_handle() {
        let mut arena = HandleArena::new();
        let asset = AssetId::new("a");
        let first = arena.issue(&asset, 3, Bytes::from_static(b"one"));
        let second = arena.issue(&asset, 3, Bytes::from_static(b"two"));
        assert!(first.is_revoked());
        assert!(!second.is_revoked());
        assert_ne!(first.id(), second.id());
        assert_eq!(arena.outstanding(&asset), 1);
        assert_eq!(arena.revoked_count(), 1);
    }

    #[test]
    fn release_asset_revokes_batch() {
        let mut arena = HandleArena::new();
        let a = AssetId::new("a");
        let b = AssetId::new("b");
        let handles: Vec<_> = (0..4)
            .map(|i| arena.issue(&a, i, Bytes::from_static(b"x")))
            .collect();
        let other = arena.issue(&b, 0, Bytes::from_static(b"y"));

        assert_eq!(arena.release_asset(&a), 4);
        assert!(handles.iter().all(FrameHandle::is_revoked));
        assert!(!other.is_revoked());
        assert_eq!(arena.release_asset(&a), 0);
        assert_eq!(arena.total_outstanding(), 1);

        assert_eq!(arena.release_all(), 1);
        assert!(other.is_revoked());
    }
}
