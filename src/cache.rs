//! Frame cache and viewport-relative eviction.
//!
//! The decode worker owns the only [`FrameCache`]. Everyone else reads
//! [`CacheSnapshot`]s, which share pixel buffers but never mutate them.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::bitmap::DecodedBitmap;

/// Cache key: segment plus display timestamp at microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub segment_index: usize,
    timestamp_us: i64,
}

impl CacheKey {
    pub fn new(segment_index: usize, timestamp: f64) -> Self {
        Self {
            segment_index,
            timestamp_us: (timestamp * 1_000_000.0).round() as i64,
        }
    }

    /// Display timestamp in seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp_us as f64 / 1_000_000.0
    }

    fn segment_bounds(segment_index: usize) -> (Bound<CacheKey>, Bound<CacheKey>) {
        (
            Bound::Included(CacheKey {
                segment_index,
                timestamp_us: i64::MIN,
            }),
            Bound::Included(CacheKey {
                segment_index,
                timestamp_us: i64::MAX,
            }),
        )
    }
}

/// Visible time range of the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleRange {
    pub start: f64,
    pub end: f64,
}

impl VisibleRange {
    pub fn new(start: f64, end: f64) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    pub fn span(&self) -> f64 {
        self.end - self.start
    }

    /// `[start - k*span, end + k*span]`
    pub fn retained(&self, k: f64) -> (f64, f64) {
        let margin = k * self.span();
        (self.start - margin, self.end + margin)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held.
    pub entries: usize,
    /// Bitmaps ever inserted.
    pub inserted: u64,
    /// Bitmaps released by replacement, eviction or teardown.
    pub released: u64,
}

pub struct FrameCache {
    entries: BTreeMap<CacheKey, DecodedBitmap>,
    unavailable: BTreeSet<usize>,
    inserted: u64,
    released: u64,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            unavailable: BTreeSet::new(),
            inserted: 0,
            released: 0,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&DecodedBitmap> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a bitmap. A second put for the same key replaces and releases
    /// the first.
    pub fn put(&mut self, key: CacheKey, bitmap: DecodedBitmap) {
        self.inserted += 1;
        if self.entries.insert(key, bitmap).is_some() {
            self.released += 1;
        }
    }

    /// Entries held for one segment.
    pub fn segment_len(&self, segment_index: usize) -> usize {
        self.entries
            .range(CacheKey::segment_bounds(segment_index))
            .count()
    }

    pub fn mark_unavailable(&mut self, segment_index: usize) {
        self.unavailable.insert(segment_index);
    }

    pub fn is_unavailable(&self, segment_index: usize) -> bool {
        self.unavailable.contains(&segment_index)
    }

    /// Release every entry whose timestamp falls outside the retained window
    /// around `visible`. Returns the number released.
    pub fn evict(&mut self, visible: &VisibleRange, span_multiplier: f64) -> usize {
        let (low, high) = visible.retained(span_multiplier);
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            let t = key.timestamp();
            t >= low && t <= high
        });
        let evicted = before - self.entries.len();
        self.released += evicted as u64;
        if evicted > 0 {
            tracing::debug!(evicted, low, high, "evicted cache entries");
        }
        evicted
    }

    /// Release everything, including unavailable markers.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.unavailable.clear();
        self.released += count as u64;
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            inserted: self.inserted,
            released: self.released,
        }
    }

    /// Read-only copy for the producer side.
    pub fn snapshot(&self, generation: u64) -> CacheSnapshot {
        CacheSnapshot {
            generation,
            entries: self.entries.clone(),
            unavailable: self.unavailable.clone(),
            stats: self.stats(),
        }
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the cache.
///
/// Bitmaps in a snapshot stay valid while the snapshot is held; drop it
/// after the paint that used it.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    /// Bumped on every rendition switch.
    pub generation: u64,
    pub entries: BTreeMap<CacheKey, DecodedBitmap>,
    pub unavailable: BTreeSet<usize>,
    pub stats: CacheStats,
}

impl CacheSnapshot {
    pub fn get(&self, key: &CacheKey) -> Option<&DecodedBitmap> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries of one segment in display order.
    pub fn segment_entries(
        &self,
        segment_index: usize,
    ) -> impl Iterator<Item = (&CacheKey, &DecodedBitmap)> {
        self.entries.range(CacheKey::segment_bounds(segment_index))
    }

    pub fn segment_len(&self, segment_index: usize) -> usize {
        self.segment_entries(segment_index).count()
    }

    pub fn is_unavailable(&self, segment_index: usize) -> bool {
        self.unavailable.contains(&segment_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Weak};

    fn bitmap() -> (DecodedBitmap, Weak<[u8]>) {
        let pixels: Arc<[u8]> = Arc::from(vec![0u8; 4]);
        let weak = Arc::downgrade(&pixels);
        (DecodedBitmap::new(1, 1, pixels), weak)
    }

    #[test]
    fn test_key_round_trips_timestamp() {
        let key = CacheKey::new(3, 12.345678);
        assert_eq!(key.segment_index, 3);
        assert!((key.timestamp() - 12.345678).abs() < 1e-6);
        assert_eq!(CacheKey::new(3, 12.3456781), key);
    }

    #[test]
    fn test_put_is_last_wins() {
        let mut cache = FrameCache::new();
        let (first, first_weak) = bitmap();
        let (second, _second_weak) = bitmap();
        let key = CacheKey::new(0, 1.0);

        cache.put(key, first);
        cache.put(key, second.clone());

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key).unwrap().shares_pixels(&second));
        assert!(first_weak.upgrade().is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                inserted: 2,
                released: 1
            }
        );
    }

    #[test]
    fn test_evict_outside_window() {
        let mut cache = FrameCache::new();
        for t in [0.0, 10.0, 19.0, 20.0, 30.0, 40.0, 41.0] {
            cache.put(CacheKey::new(t as usize / 2, t), bitmap().0);
        }

        // Visible [20, 30] with k = 1 keeps [10, 40].
        let evicted = cache.evict(&VisibleRange::new(20.0, 30.0), 1.0);
        assert_eq!(evicted, 2);
        let kept: Vec<f64> = cache.snapshot(0).entries.keys().map(|k| k.timestamp()).collect();
        assert_eq!(kept, vec![10.0, 19.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_clear_releases_everything_once() {
        let mut cache = FrameCache::new();
        let mut weaks = Vec::new();
        for i in 0..5 {
            let (b, w) = bitmap();
            weaks.push(w);
            cache.put(CacheKey::new(i, i as f64), b);
        }
        cache.mark_unavailable(9);

        cache.evict(&VisibleRange::new(0.0, 1.0), 1.0);
        assert_eq!(cache.clear(), 3);
        assert!(!cache.is_unavailable(9));

        let stats = cache.stats();
        assert_eq!(stats.inserted, stats.released);
        assert!(weaks.iter().all(|w| w.upgrade().is_none()));
    }

    #[test]
    fn test_segment_lookup() {
        let mut cache = FrameCache::new();
        cache.put(CacheKey::new(1, 2.0), bitmap().0);
        cache.put(CacheKey::new(1, 2.5), bitmap().0);
        cache.put(CacheKey::new(2, 4.0), bitmap().0);

        assert_eq!(cache.segment_len(1), 2);
        assert_eq!(cache.segment_len(0), 0);

        let snapshot = cache.snapshot(7);
        assert_eq!(snapshot.generation, 7);
        let times: Vec<f64> = snapshot.segment_entries(1).map(|(k, _)| k.timestamp()).collect();
        assert_eq!(times, vec![2.0, 2.5]);
    }

    #[test]
    fn test_snapshot_keeps_bitmap_alive_until_dropped() {
        let mut cache = FrameCache::new();
        let (b, weak) = bitmap();
        cache.put(CacheKey::new(0, 0.0), b);

        let snapshot = cache.snapshot(0);
        cache.clear();
        assert!(weak.upgrade().is_some());
        drop(snapshot);
        assert!(weak.upgrade().is_none());
    }
}
