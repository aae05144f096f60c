//! Priority bucket queue ordering evictable tiles.
//!
//! Priorities are coarse: the queue keeps `num_buckets` lists, each
//! covering `bucket_range` consecutive priorities, and evicts from the
//! lowest non-empty bucket. Within a bucket, insertion is at the head
//! and eviction takes the tail, so equal-priority tiles leave in the
//! order they arrived. A non-lowest bucket that is already at its
//! occupancy target redirects new inserts to the lowest bucket, which
//! keeps a flood of high-priority tiles from starving eviction.

use super::list::{SlotIdx, SlotList};
use super::types::TileKey;

/// Where an entry sits in the queue; recorded by the cache so removal
/// is O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuePos {
    pub bucket: u16,
    pub idx: SlotIdx,
}

#[derive(Debug)]
pub(crate) struct BucketQueue {
    buckets: Vec<SlotList<TileKey>>,
    range: u32,
    capacity: usize,
    len: usize,
}

impl BucketQueue {
    pub fn new(num_buckets: usize, range: u32, capacity: usize) -> Self {
        let mut buckets = Vec::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            buckets.push(SlotList::new());
        }
        BucketQueue {
            buckets,
            range,
            capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bucket a priority maps to; priorities past the last bucket clamp
    /// into it.
    fn bucket_for(&self, priority: u32) -> usize {
        ((priority / self.range) as usize).min(self.buckets.len() - 1)
    }

    /// Insert `key` at its priority's bucket head, applying the overflow
    /// redirect.
    pub fn add(&mut self, key: TileKey, priority: u32) -> QueuePos {
        let mut bucket = self.bucket_for(priority);
        if bucket != 0 && self.buckets[bucket].len() >= self.capacity {
            bucket = 0;
        }
        let idx = self.buckets[bucket].push_front(key);
        self.len += 1;
        QueuePos {
            bucket: bucket as u16,
            idx,
        }
    }

    /// Remove a specific entry. `None` means the position was stale.
    pub fn remove(&mut self, pos: QueuePos) -> Option<TileKey> {
        let key = self.buckets.get_mut(pos.bucket as usize)?.remove(pos.idx)?;
        self.len -= 1;
        Some(key)
    }

    /// Take the eviction victim: the oldest entry of the lowest
    /// non-empty bucket. `None` means nothing is evictable.
    pub fn pop(&mut self) -> Option<TileKey> {
        for bucket in &mut self.buckets {
            if let Some(key) = bucket.pop_back() {
                self.len -= 1;
                return Some(key);
            }
        }
        None
    }

    #[cfg(test)]
    fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets[bucket].len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
