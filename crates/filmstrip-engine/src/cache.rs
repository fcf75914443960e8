//! Cache store: the current filmstrip of each asset plus its subscribers.
//!
//! Owned by the orchestrator task. Entries carry size and access metadata
//! for eviction; the footprint is kept equal to the sum of entry sizes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use filmstrip_core::{AssetId, Filmstrip};
use tokio::time::Instant;

/// Callback receiving every new filmstrip value of an asset.
pub type FilmstripCallback = Arc<dyn Fn(Arc<Filmstrip>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Eviction bookkeeping of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntryMeta {
    pub size_bytes: u64,
    pub last_accessed_at: Instant,
}

struct CacheEntry {
    filmstrip: Arc<Filmstrip>,
    meta: CacheEntryMeta,
}

struct Subscriber {
    id: SubscriberId,
    callback: FilmstripCallback,
    /// Registered for the duration of one request, not by `subscribe`.
    transient: bool,
}

#[derive(Default)]
pub struct CacheStore {
    entries: HashMap<AssetId, CacheEntry>,
    subscribers: HashMap<AssetId, Vec<Subscriber>>,
    footprint: u64,
    next_subscriber: u64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, marking the entry as accessed.
    pub fn get(&mut self, asset: &AssetId, now: Instant) -> Option<Arc<Filmstrip>> {
        let entry = self.entries.get_mut(asset)?;
        entry.meta.last_accessed_at = now;
        Some(Arc::clone(&entry.filmstrip))
    }

    /// Current value without touching access metadata.
    pub fn peek(&self, asset: &AssetId) -> Option<&Arc<Filmstrip>> {
        self.entries.get(asset).map(|e| &e.filmstrip)
    }

    pub fn meta(&self, asset: &AssetId) -> Option<CacheEntryMeta> {
        self.entries.get(asset).map(|e| e.meta)
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.entries.contains_key(asset)
    }

    /// Replace the cached value without notifying anyone.
    pub fn insert(&mut self, asset: &AssetId, filmstrip: Arc<Filmstrip>, now: Instant) {
        let size_bytes = filmstrip.size_bytes();
        let meta = CacheEntryMeta {
            size_bytes,
            last_accessed_at: now,
        };
        self.footprint += size_bytes;
        if let Some(old) = self
            .entries
            .insert(asset.clone(), CacheEntry { filmstrip, meta })
        {
            self.footprint -= old.meta.size_bytes;
        }
    }

    /// Replace the cached value and fan it out to subscribers.
    ///
    /// An update equal to the current value only refreshes the access time,
    /// so callers holding the current `Arc` keep holding the live value.
    /// Returns whether subscribers were notified.
    pub fn notify_update(&mut self, asset: &AssetId, filmstrip: Arc<Filmstrip>, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(asset) {
            if *entry.filmstrip == *filmstrip {
                entry.meta.last_accessed_at = now;
                return false;
            }
        }
        self.insert(asset, Arc::clone(&filmstrip), now);
        if let Some(subscribers) = self.subscribers.get(asset) {
            for subscriber in subscribers {
                (subscriber.callback)(Arc::clone(&filmstrip));
            }
        }
        true
    }

    /// Register a listener; the current value, if any, is replayed at once.
    pub fn subscribe(&mut self, asset: &AssetId, callback: FilmstripCallback) -> SubscriberId {
        if let Some(current) = self.peek(asset) {
            callback(Arc::clone(current));
        }
        self.add_subscriber(asset, callback, false)
    }

    /// Register a listener that lives only until its request settles.
    pub fn subscribe_transient(&mut self, asset: &AssetId, callback: FilmstripCallback) -> SubscriberId {
        self.add_subscriber(asset, callback, true)
    }

    fn add_subscriber(&mut self, asset: &AssetId, callback: FilmstripCallback, transient: bool) -> SubscriberId {
        self.next_subscriber += 1;
        let id = SubscriberId(self.next_subscriber);
        self.subscribers
            .entry(asset.clone())
            .or_default()
            .push(Subscriber {
                id,
                callback,
                transient,
            });
        id
    }

    pub fn unsubscribe(&mut self, asset: &AssetId, id: SubscriberId) -> bool {
        let Some(subscribers) = self.subscribers.get_mut(asset) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.subscribers.remove(asset);
        }
        removed
    }

    /// Number of listeners of any kind.
    pub fn subscriber_count(&self, asset: &AssetId) -> usize {
        self.subscribers.get(asset).map_or(0, Vec::len)
    }

    /// Whether anyone called `subscribe` for this asset and is still listening.
    pub fn has_persistent_subscribers(&self, asset: &AssetId) -> bool {
        self.subscribers
            .get(asset)
            .is_some_and(|subs| subs.iter().any(|s| !s.transient))
    }

    /// Drop the cached value. Subscribers stay registered.
    pub fn remove(&mut self, asset: &AssetId) -> Option<Arc<Filmstrip>> {
        let entry = self.entries.remove(asset)?;
        self.footprint -= entry.meta.size_bytes;
        Some(entry.filmstrip)
    }

    /// Drop every cached value. Subscribers stay registered.
    pub fn clear(&mut self) -> Vec<AssetId> {
        self.footprint = 0;
        self.entries.drain().map(|(asset, _)| asset).collect()
    }

    pub fn clear_subscribers(&mut self) {
        self.subscribers.clear();
    }

    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Least recently accessed unprotected entries whose removal brings the
    /// footprint below `target_bytes`, in eviction order.
    ///
    /// Returns fewer (possibly none) when protected entries alone exceed it.
    pub fn eviction_candidates<F>(&self, target_bytes: u64, is_protected: F) -> Vec<AssetId>
    where
        F: Fn(&AssetId) -> bool,
    {
        if self.footprint < target_bytes {
            return Vec::new();
        }
        let mut candidates: Vec<(&AssetId, &CacheEntryMeta)> = self
            .entries
            .iter()
            .filter(|(asset, _)| !is_protected(asset))
            .map(|(asset, entry)| (asset, &entry.meta))
            .collect();
        candidates.sort_by_key(|(_, meta)| meta.last_accessed_at);

        let mut footprint = self.footprint;
        let mut evict = Vec::new();
        for (asset, meta) in candidates {
            if footprint < target_bytes {
                break;
            }
            footprint -= meta.size_bytes;
            evict.push(asset.clone());
        }
        evict
    }

    #[cfg(test)]
    fn metadata_total(&self) -> u64 {
        self.entries.values().map(|e| e.meta.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use filmstrip_core::{FilmstripFrame, FrameHandle, HandleId};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn strip(sizes: &[usize], complete: bool) -> Arc<Filmstrip> {
        let frames = sizes.iter().enumerate().map(|(i, &len)| {
            FilmstripFrame::new(
                i as u32,
                1.0,
                FrameHandle::new(HandleId::new(i as u64 + 1), Bytes::from(vec![0u8; len])),
            )
        });
        Arc::new(Filmstrip::from_frames(frames, complete, !complete, 50))
    }

    fn recorder() -> (FilmstripCallback, Arc<Mutex<Vec<Arc<Filmstrip>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: FilmstripCallback = Arc::new(move |f| sink.lock().push(f));
        (cb, seen)
    }

    #[test]
    fn footprint_tracks_entry_sizes() {
        let mut cache = CacheStore::new();
        let now = Instant::now();
        cache.insert(&AssetId::new("a"), strip(&[10, 20], false), now);
        cache.insert(&AssetId::new("b"), strip(&[5], false), now);
        assert_eq!(cache.footprint(), 35);

        cache.insert(&AssetId::new("a"), strip(&[10, 20, 30], true), now);
        assert_eq!(cache.footprint(), 65);
        assert_eq!(cache.footprint(), cache.metadata_total());

        cache.remove(&AssetId::new("b"));
        assert_eq!(cache.footprint(), 60);
        assert_eq!(cache.footprint(), cache.metadata_total());

        cache.clear();
        assert_eq!(cache.footprint(), 0);
    }

    #[test]
    fn subscribe_replays_current_value() {
        let mut cache = CacheStore::new();
        let asset = AssetId::new("a");
        let value = strip(&[1], false);
        cache.insert(&asset, Arc::clone(&value), Instant::now());

        let (cb, seen) = recorder();
        cache.subscribe(&asset, cb);
        assert_eq!(seen.lock().len(), 1);
        assert!(Arc::ptr_eq(&seen.lock()[0], &value));
    }

    #[test]
    fn notify_fans_out_and_skips_identical_values() {
        let mut cache = CacheStore::new();
        let asset = AssetId::new("a");
        let (cb, seen) = recorder();
        let id = cache.subscribe(&asset, cb);
        assert!(seen.lock().is_empty());

        let first = strip(&[1, 2], false);
        assert!(cache.notify_update(&asset, Arc::clone(&first), Instant::now()));
        // Same content in a fresh Arc: the original stays cached.
        assert!(!cache.notify_update(&asset, strip(&[1, 2], false), Instant::now()));
        assert!(Arc::ptr_eq(cache.peek(&asset).unwrap(), &first));
        assert_eq!(seen.lock().len(), 1);

        assert!(cache.unsubscribe(&asset, id));
        cache.notify_update(&asset, strip(&[1, 2, 3], false), Instant::now());
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(cache.subscriber_count(&asset), 0);
    }

    #[test]
    fn transient_subscribers_are_not_persistent() {
        let mut cache = CacheStore::new();
        let asset = AssetId::new("a");
        let (cb, _) = recorder();
        let id = cache.subscribe_transient(&asset, cb.clone());
        assert_eq!(cache.subscriber_count(&asset), 1);
        assert!(!cache.has_persistent_subscribers(&asset));
        cache.subscribe(&asset, cb);
        assert!(cache.has_persistent_subscribers(&asset));
        cache.unsubscribe(&asset, id);
        assert_eq!(cache.subscriber_count(&asset), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_candidates_are_lru_and_skip_protected() {
        let mut cache = CacheStore::new();
        let start = Instant::now();
        cache.insert(&AssetId::new("old"), strip(&[40], true), start);
        cache.insert(
            &AssetId::new("protected"),
            strip(&[40], true),
            start + Duration::from_secs(1),
        );
        cache.insert(&AssetId::new("mid"), strip(&[40], true), start + Duration::from_secs(2));
        cache.insert(&AssetId::new("new"), strip(&[40], true), start + Duration::from_secs(3));

        let protected = AssetId::new("protected");
        let evict = cache.eviction_candidates(100, |a| *a == protected);
        assert_eq!(evict, vec![AssetId::new("old"), AssetId::new("mid")]);

        assert!(cache.eviction_candidates(1000, |_| false).is_empty());
        // Everything protected: nothing can go even when over budget.
        assert!(cache.eviction_candidates(1, |_| true).is_empty());
    }

    #[test]
    fn get_touches_access_time() {
        let mut cache = CacheStore::new();
        let asset = AssetId::new("a");
        let t0 = Instant::now();
        cache.insert(&asset, strip(&[1], true), t0);
        let t1 = t0 + Duration::from_secs(5);
        assert!(cache.get(&asset, t1).is_some());
        assert_eq!(cache.meta(&asset).unwrap().last_accessed_at, t1);
        assert!(cache.get(&AssetId::new("missing"), t1).is_none());
    }
}
