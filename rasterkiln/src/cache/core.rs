//! The tile cache.
//!
//! All cache metadata lives behind one mutex: the key index, the
//! priority eviction queue, the holding lists, the recycled-buffer
//! pool, byte accounting, and the checkpoint registry. Critical
//! sections are short and never perform I/O or pixel work; producers
//! fill tiles through a [`TileWriteGuard`] that owns the pixel buffer
//! outright, so the long part of a fill holds no lock at all.
//!
//! # Lock states
//!
//! Every resident tile is in exactly one place:
//!
//! ```text
//!   Evictable ──(read acquire / pin)──► Held / Pinned
//!   Held      ──(last release)────────► Evictable | Pinned | gone
//!   Pinned    ──(last unpin)──────────► Evictable | gone
//! ```
//!
//! `Held` covers both a producer's write lock and any number of
//! readers. Only `Evictable` tiles are in the queue, so eviction can
//! never free pixels somebody is looking at. Checkpoint pins move
//! tiles to `Pinned`, which the queue also never sees; if pinned tiles
//! force the cache past its budget, the overrun is flagged and the
//! trim is retried when the next checkpoint releases.
//!
//! Callers blocked on a busy tile park on a cache-wide condvar with
//! the mutex released, then revalidate from scratch: the tile they
//! were waiting for may have been cooked, discarded, or evicted in the
//! meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::raster::{PixelBuffer, PixelFormat, Rect, Remap};
use crate::region::{Region, RegionError, RegionRequest};
use crate::swap::{TileMeta, TileStore};

use super::list::{SlotIdx, SlotList};
use super::queue::{BucketQueue, QueuePos};
use super::stats::{CacheStats, CacheStatistics};
use super::tile::{Tile, TileReadGuard, TileWriteGuard};
use super::types::{CacheConfig, CacheError, ImageToken, OwnerId, StorageClass, TileKey};

/// How many retired regions the reuse pool keeps.
const REGION_POOL_LIMIT: usize = 32;

/// Creation parameters for a tile: what the pixels look like and how
/// the cache should treat them.
#[derive(Debug, Clone, Copy)]
pub struct TileSpec {
    pub format: PixelFormat,
    pub remap: Remap,
    pub class: StorageClass,
}

impl TileSpec {
    pub fn new(format: PixelFormat) -> Self {
        TileSpec {
            format,
            remap: Remap::full_scale(format),
            class: StorageClass::Cached,
        }
    }

    pub fn with_remap(mut self, remap: Remap) -> Self {
        self.remap = remap;
        self
    }

    pub fn with_class(mut self, class: StorageClass) -> Self {
        self.class = class;
        self
    }
}

/// Outcome of a lookup. Contention and absence are ordinary results,
/// not errors.
pub enum TileLookup {
    /// The tile is resident and cooked; you hold a read lock.
    Hit(TileReadGuard),
    /// The tile did not exist; you hold the write lock and must fill
    /// it (or discard it).
    Created(TileWriteGuard),
    /// A producer holds the write lock and `blocking` was off.
    Busy,
    /// The tile is not resident and `create` was off.
    Absent,
}

impl TileLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, TileLookup::Hit(_))
    }

    pub fn is_created(&self) -> bool {
        matches!(self, TileLookup::Created(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, TileLookup::Busy)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, TileLookup::Absent)
    }

    pub fn into_read(self) -> Option<TileReadGuard> {
        match self {
            TileLookup::Hit(guard) => Some(guard),
            _ => None,
        }
    }

    pub fn into_write(self) -> Option<TileWriteGuard> {
        match self {
            TileLookup::Created(guard) => Some(guard),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TileLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileLookup::Hit(g) => write!(f, "Hit({})", g.key()),
            TileLookup::Created(g) => write!(f, "Created({})", g.key()),
            TileLookup::Busy => write!(f, "Busy"),
            TileLookup::Absent => write!(f, "Absent"),
        }
    }
}

/// Handle returned by [`TileCache::checkpoint`]; hand it back to
/// [`TileCache::uncheckpoint`] to release the pins. Deliberately not
/// `Clone`: one checkpoint, one release.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CheckpointToken(u64);

/// Which list a resident tile currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Evictable(QueuePos),
    Held(SlotIdx),
    Pinned(SlotIdx),
}

struct CacheEntry {
    tile: Arc<Tile>,
    /// `None` exactly while a producer owns the pixels.
    payload: Option<Arc<PixelBuffer>>,
    readers: u32,
    writer: bool,
    pins: u32,
    /// Whether the creation pin of a `Locked` tile is still in place.
    /// Only [`TileCache::release_locked`] may take that pin, so a
    /// checkpoint's pins cannot be stolen through it.
    birth_pin: bool,
    location: Location,
}

struct CacheInner {
    index: HashMap<TileKey, CacheEntry>,
    queue: BucketQueue,
    held: SlotList<TileKey>,
    pinned: SlotList<TileKey>,
    pool: Vec<PixelBuffer>,
    used_bytes: usize,
    /// Pinned or locked tiles are holding the cache past its budget;
    /// retry the trim when pins release.
    over_budget: bool,
    /// Live checkpoints keep tile handles, not keys, so a stale
    /// checkpoint can never unpin a tile recreated under the same key.
    checkpoints: HashMap<u64, Vec<Arc<Tile>>>,
    next_checkpoint: u64,
}

impl CacheInner {
    fn pool_take(&mut self, format: PixelFormat, elements: usize) -> Option<PixelBuffer> {
        let pos = self
            .pool
            .iter()
            .position(|b| b.format() == format && b.len() == elements)?;
        let mut buffer = self.pool.swap_remove(pos);
        buffer.fill_raw(0.0);
        Some(buffer)
    }

    fn pool_push(&mut self, buffer: PixelBuffer, cap: usize) {
        if !buffer.is_empty() && self.pool.len() < cap {
            self.pool.push(buffer);
        }
    }

    /// Move a resident tile into the `held` list (read or write lock
    /// taken).
    fn to_held(&mut self, key: TileKey) {
        let Some(location) = self.index.get(&key).map(|e| e.location) else {
            return;
        };
        match location {
            Location::Held(_) => return,
            Location::Evictable(pos) => {
                self.queue.remove(pos);
            }
            Location::Pinned(idx) => {
                self.pinned.remove(idx);
            }
        }
        let idx = self.held.push_front(key);
        if let Some(entry) = self.index.get_mut(&key) {
            entry.location = Location::Held(idx);
        }
    }

    /// Move a resident tile into the `pinned` list.
    fn to_pinned(&mut self, key: TileKey) {
        let Some(location) = self.index.get(&key).map(|e| e.location) else {
            return;
        };
        match location {
            Location::Pinned(_) => return,
            Location::Evictable(pos) => {
                self.queue.remove(pos);
            }
            Location::Held(idx) => {
                self.held.remove(idx);
            }
        }
        let idx = self.pinned.push_front(key);
        if let Some(entry) = self.index.get_mut(&key) {
            entry.location = Location::Pinned(idx);
        }
    }

    /// Return a resident tile to the eviction queue at `priority`.
    fn to_evictable(&mut self, key: TileKey, priority: u32) {
        let Some(location) = self.index.get(&key).map(|e| e.location) else {
            return;
        };
        match location {
            Location::Evictable(_) => return,
            Location::Held(idx) => {
                self.held.remove(idx);
            }
            Location::Pinned(idx) => {
                self.pinned.remove(idx);
            }
        }
        let pos = self.queue.add(key, priority);
        if let Some(entry) = self.index.get_mut(&key) {
            entry.location = Location::Evictable(pos);
        }
    }

    /// Unlink and drop a resident tile, returning its entry. Adjusts
    /// byte accounting; the caller decides what happens to the payload.
    fn remove_entry(&mut self, key: &TileKey) -> Option<CacheEntry> {
        if let Some(entry) = self.index.get(key) {
            match entry.location {
                Location::Evictable(pos) => {
                    self.queue.remove(pos);
                }
                Location::Held(idx) => {
                    self.held.remove(idx);
                }
                Location::Pinned(idx) => {
                    self.pinned.remove(idx);
                }
            }
        }
        let entry = self.index.remove(key)?;
        self.used_bytes -= entry.tile.bytes();
        Some(entry)
    }
}

/// Take sole ownership of a payload arc. Read guards hold the only
/// other clones, and callers only reach this when no reader exists, so
/// the fallback clone is never taken in practice.
fn unwrap_payload(payload: Arc<PixelBuffer>) -> PixelBuffer {
    match Arc::try_unwrap(payload) {
        Ok(buffer) => buffer,
        Err(shared) => (*shared).clone(),
    }
}

/// Tile-grid index rectangle covering a pixel rectangle.
pub(crate) fn tile_grid(rect: &Rect, tile_w: usize, tile_h: usize) -> Rect {
    if rect.is_empty() {
        return Rect::new(0, 0, 0, 0);
    }
    let tw = tile_w as i32;
    let th = tile_h as i32;
    Rect::new(
        rect.x0.div_euclid(tw),
        rect.y0.div_euclid(th),
        (rect.x1 - 1).div_euclid(tw) + 1,
        (rect.y1 - 1).div_euclid(th) + 1,
    )
}

/// Concurrent, size-bounded tile cache with priority eviction.
///
/// Constructed as an `Arc` because guards, daemons, and worker threads
/// all hold references back into it.
pub struct TileCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    /// Signalled whenever a write lock releases or a tile disappears,
    /// so blocked lookups can revalidate.
    tile_released: Condvar,
    store: Option<Arc<dyn TileStore>>,
    stats: CacheStats,
    created_at: Instant,
    /// Milliseconds since `created_at` of the last foreground call.
    last_activity: AtomicU64,
    region_pool: Mutex<Vec<Region>>,
}

impl TileCache {
    /// Build a cache with no swap store.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        Self::build(config, None)
    }

    /// Build a cache whose proxy tiles persist through `store`.
    pub fn with_store(
        config: CacheConfig,
        store: Arc<dyn TileStore>,
    ) -> Result<Arc<Self>, CacheError> {
        Self::build(config, Some(store))
    }

    fn build(
        config: CacheConfig,
        store: Option<Arc<dyn TileStore>>,
    ) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        let inner = CacheInner {
            index: HashMap::new(),
            queue: BucketQueue::new(
                config.num_buckets,
                config.bucket_range,
                config.bucket_capacity,
            ),
            held: SlotList::new(),
            pinned: SlotList::new(),
            pool: Vec::new(),
            used_bytes: 0,
            over_budget: false,
            checkpoints: HashMap::new(),
            next_checkpoint: 1,
        };
        Ok(Arc::new(TileCache {
            config,
            inner: Mutex::new(inner),
            tile_released: Condvar::new(),
            store,
            stats: CacheStats::new(),
            created_at: Instant::now(),
            last_activity: AtomicU64::new(0),
            region_pool: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn touch(&self) {
        self.last_activity.store(
            self.created_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    /// How long since the last foreground operation. Maintenance calls
    /// (trims, snapshots) do not reset this.
    pub fn idle_for(&self) -> Duration {
        let now = self.created_at.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Look up `key`, optionally creating it.
    ///
    /// - Resident and cooked: `Hit` with a read lock.
    /// - Resident but being produced: `Busy`, or parks until the
    ///   producer finishes when `blocking` is on.
    /// - Not resident, `create` off: `Absent`.
    /// - Not resident, `create` on: evicts to make room and returns
    ///   `Created` with the write lock. For [`StorageClass::Proxy`]
    ///   the swap store is consulted first, turning the miss into a
    ///   `Hit` when the tile restores.
    ///
    /// The only hard failures are allocation failure and store I/O
    /// breakage.
    pub fn get_or_create(
        self: &Arc<Self>,
        key: TileKey,
        spec: TileSpec,
        create: bool,
        blocking: bool,
    ) -> Result<TileLookup, CacheError> {
        self.touch();
        let elements = self.config.tile_elements();
        let bytes = elements * spec.format.bytes_per_element();

        if spec.class == StorageClass::Never {
            return self.create_scratch(key, spec, create, elements);
        }

        let mut inner = self.inner.lock();
        loop {
            if let Some(entry) = inner.index.get(&key) {
                if entry.writer {
                    self.stats.record_busy();
                    if !blocking {
                        return Ok(TileLookup::Busy);
                    }
                    self.tile_released.wait(&mut inner);
                    continue;
                }
                let tile = entry.tile.clone();
                let Some(data) = entry.payload.clone() else {
                    // Unlocked entry without pixels should not exist;
                    // treat it like contention rather than corrupting
                    // state.
                    self.stats.record_busy();
                    if !blocking {
                        return Ok(TileLookup::Busy);
                    }
                    self.tile_released.wait(&mut inner);
                    continue;
                };
                if let Some(entry) = inner.index.get_mut(&key) {
                    entry.readers += 1;
                }
                inner.to_held(key);
                self.stats.record_hit();
                return Ok(TileLookup::Hit(TileReadGuard::new(
                    self.clone(),
                    tile,
                    data,
                )));
            }

            // Miss. Proxy tiles may restore from the swap store.
            if spec.class == StorageClass::Proxy {
                if let Some(store) = self.store.clone() {
                    if store.contains(&key) {
                        return self.restore_proxy(
                            inner, store, key, spec, create, elements, bytes,
                        );
                    }
                }
            }

            if !create {
                self.stats.record_miss();
                return Ok(TileLookup::Absent);
            }

            let target = self.config.max_bytes.saturating_sub(bytes);
            let victims = self.evict_until(&mut inner, target);
            let buffer = match self.take_buffer(&mut inner, spec.format, elements) {
                Ok(buffer) => buffer,
                Err(err) => {
                    drop(inner);
                    self.flush_swap_outs(victims);
                    return Err(err);
                }
            };
            let tile = self.index_new_tile(&mut inner, key, spec, bytes);
            self.stats.record_miss();
            self.stats.record_created();
            drop(inner);
            self.flush_swap_outs(victims);
            return Ok(TileLookup::Created(TileWriteGuard::new(
                self.clone(),
                tile,
                buffer,
            )));
        }
    }

    /// Lookup without creating; `Absent` when the tile is not resident
    /// (or restorable, for proxy specs).
    pub fn fetch(
        self: &Arc<Self>,
        key: TileKey,
        spec: TileSpec,
        blocking: bool,
    ) -> Result<TileLookup, CacheError> {
        self.get_or_create(key, spec, false, blocking)
    }

    fn take_buffer(
        &self,
        inner: &mut CacheInner,
        format: PixelFormat,
        elements: usize,
    ) -> Result<PixelBuffer, CacheError> {
        if let Some(buffer) = inner.pool_take(format, elements) {
            return Ok(buffer);
        }
        PixelBuffer::try_new(format, elements).map_err(|_| CacheError::AllocationFailed {
            requested: elements * format.bytes_per_element(),
        })
    }

    /// Insert a fresh writer-held entry and charge its bytes.
    fn index_new_tile(
        &self,
        inner: &mut CacheInner,
        key: TileKey,
        spec: TileSpec,
        bytes: usize,
    ) -> Arc<Tile> {
        let tile = Arc::new(Tile::new(
            key,
            spec.format,
            spec.remap,
            spec.class,
            self.config.tile_width,
            self.config.tile_height,
        ));
        let idx = inner.held.push_front(key);
        inner.index.insert(
            key,
            CacheEntry {
                tile: tile.clone(),
                payload: None,
                readers: 0,
                writer: true,
                pins: u32::from(spec.class == StorageClass::Locked),
                birth_pin: spec.class == StorageClass::Locked,
                location: Location::Held(idx),
            },
        );
        inner.used_bytes += bytes;
        inner.over_budget = inner.used_bytes > self.config.max_bytes;
        self.stats.observe_bytes(inner.used_bytes as u64);
        tile
    }

    /// Scratch tiles are never indexed: hand out a private write guard
    /// backed by a pooled or fresh buffer.
    fn create_scratch(
        self: &Arc<Self>,
        key: TileKey,
        spec: TileSpec,
        create: bool,
        elements: usize,
    ) -> Result<TileLookup, CacheError> {
        if !create {
            self.stats.record_miss();
            return Ok(TileLookup::Absent);
        }
        let buffer = {
            let mut inner = self.inner.lock();
            self.take_buffer(&mut inner, spec.format, elements)?
        };
        let tile = Arc::new(Tile::new(
            key,
            spec.format,
            spec.remap,
            StorageClass::Never,
            self.config.tile_width,
            self.config.tile_height,
        ));
        self.stats.record_created();
        Ok(TileLookup::Created(TileWriteGuard::new(
            self.clone(),
            tile,
            buffer,
        )))
    }

    /// Proxy miss with a store entry: reserve the slot, read the tile
    /// back in outside the lock, and publish it with a read lock held.
    /// Falls back to ordinary creation when the restore fails.
    #[allow(clippy::too_many_arguments)]
    fn restore_proxy(
        self: &Arc<Self>,
        mut inner: parking_lot::MutexGuard<'_, CacheInner>,
        store: Arc<dyn TileStore>,
        key: TileKey,
        spec: TileSpec,
        create: bool,
        elements: usize,
        bytes: usize,
    ) -> Result<TileLookup, CacheError> {
        let target = self.config.max_bytes.saturating_sub(bytes);
        let victims = self.evict_until(&mut inner, target);
        let tile = self.index_new_tile(&mut inner, key, spec, bytes);
        self.stats.record_miss();
        drop(inner);
        self.flush_swap_outs(victims);

        let restored = match store.read_in(&key) {
            Ok(Some((meta, data)))
                if meta.format == spec.format
                    && meta.remap == spec.remap
                    && meta.width as usize == self.config.tile_width
                    && meta.height as usize == self.config.tile_height
                    && data.len() == elements =>
            {
                Some(data)
            }
            Ok(Some(_)) => {
                warn!(key = %key, "swap entry shape mismatch, rebuilding");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "swap read-in failed, rebuilding");
                self.stats.record_swap_failure();
                None
            }
        };

        match restored {
            Some(data) => {
                let shared = Arc::new(data);
                {
                    let mut inner = self.inner.lock();
                    if let Some(entry) = inner.index.get_mut(&key) {
                        if Arc::ptr_eq(&entry.tile, &tile) {
                            entry.payload = Some(shared.clone());
                            entry.writer = false;
                            entry.readers = 1;
                        }
                    }
                }
                tile.mark_cooked();
                self.stats.record_swap_in();
                self.tile_released.notify_all();
                Ok(TileLookup::Hit(TileReadGuard::new(
                    self.clone(),
                    tile,
                    shared,
                )))
            }
            None if create => {
                // Keep the reservation; the caller rebuilds the pixels.
                let buffer = {
                    let mut inner = self.inner.lock();
                    match self.take_buffer(&mut inner, spec.format, elements) {
                        Ok(buffer) => buffer,
                        Err(err) => {
                            inner.remove_entry(&key);
                            drop(inner);
                            self.tile_released.notify_all();
                            return Err(err);
                        }
                    }
                };
                self.stats.record_created();
                Ok(TileLookup::Created(TileWriteGuard::new(
                    self.clone(),
                    tile,
                    buffer,
                )))
            }
            None => {
                let mut inner = self.inner.lock();
                inner.remove_entry(&key);
                drop(inner);
                self.tile_released.notify_all();
                Ok(TileLookup::Absent)
            }
        }
    }

    /// Evict queue tiles until `used_bytes <= target` or the queue is
    /// empty. Proxy victims come back for write-out, which must happen
    /// after the lock drops.
    fn evict_until(
        &self,
        inner: &mut CacheInner,
        target: usize,
    ) -> Vec<(Arc<Tile>, PixelBuffer)> {
        let mut swap_outs = Vec::new();
        while inner.used_bytes > target {
            let Some(key) = inner.queue.pop() else {
                break;
            };
            // The pop already unlinked the queue node.
            let Some(entry) = inner.index.remove(&key) else {
                continue;
            };
            inner.used_bytes -= entry.tile.bytes();
            self.stats.record_eviction();
            let Some(payload) = entry.payload else {
                continue;
            };
            let buffer = unwrap_payload(payload);
            let wants_swap = entry.tile.storage_class() == StorageClass::Proxy
                && !entry.tile.is_doomed()
                && self.store.is_some();
            if wants_swap {
                swap_outs.push((entry.tile, buffer));
            } else {
                inner.pool_push(buffer, self.config.free_pool_tiles);
            }
        }
        inner.over_budget = inner.used_bytes > self.config.max_bytes;
        swap_outs
    }

    /// Write evicted proxy tiles out, then recycle their buffers.
    fn flush_swap_outs(&self, victims: Vec<(Arc<Tile>, PixelBuffer)>) {
        if victims.is_empty() {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let mut buffers = Vec::with_capacity(victims.len());
        for (tile, buffer) in victims {
            let key = tile.key();
            let meta = TileMeta {
                format: tile.format(),
                width: tile.width() as u32,
                height: tile.height() as u32,
                remap: tile.remap(),
            };
            match store.write_out(&key, &meta, &buffer) {
                Ok(()) => {
                    self.stats.record_swap_out();
                    debug!(key = %key, "proxy tile swapped out");
                }
                Err(err) => {
                    self.stats.record_swap_failure();
                    warn!(key = %key, error = %err, "swap write-out failed; tile will rebuild");
                }
            }
            buffers.push(buffer);
        }
        let mut inner = self.inner.lock();
        for buffer in buffers {
            inner.pool_push(buffer, self.config.free_pool_tiles);
        }
    }

    /// A write guard released normally: publish the pixels.
    pub(crate) fn finish_write(&self, tile: &Arc<Tile>, data: PixelBuffer) {
        self.touch();
        let key = tile.key();
        let mut inner = self.inner.lock();
        let same_tile = inner
            .index
            .get(&key)
            .map(|e| Arc::ptr_eq(&e.tile, tile))
            .unwrap_or(false);
        if !same_tile {
            // Scratch tile, or the entry was invalidated out from
            // under the producer.
            inner.pool_push(data, self.config.free_pool_tiles);
            tile.mark_cooked();
            return;
        }
        tile.mark_cooked();
        let (doomed, no_cache, pins) = {
            let entry = match inner.index.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            entry.writer = false;
            entry.payload = Some(Arc::new(data));
            (
                tile.is_doomed(),
                tile.storage_class() == StorageClass::NoCache,
                entry.pins,
            )
        };
        if doomed || (no_cache && pins == 0) {
            if let Some(entry) = inner.remove_entry(&key) {
                if let Some(payload) = entry.payload {
                    let buffer = unwrap_payload(payload);
                    inner.pool_push(buffer, self.config.free_pool_tiles);
                }
            }
            self.stats.record_discard();
        } else if pins > 0 {
            inner.to_pinned(key);
        } else {
            inner.to_evictable(key, tile.priority());
        }
        drop(inner);
        self.tile_released.notify_all();
    }

    /// Atomic write-to-read downgrade: publish the pixels and keep a
    /// read lock, all in one critical section.
    pub(crate) fn downgrade_write(&self, tile: &Arc<Tile>, data: PixelBuffer) -> Arc<PixelBuffer> {
        self.touch();
        let key = tile.key();
        let shared = Arc::new(data);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.index.get_mut(&key) {
            if Arc::ptr_eq(&entry.tile, tile) {
                entry.writer = false;
                entry.readers = 1;
                entry.payload = Some(shared.clone());
            }
        }
        tile.mark_cooked();
        drop(inner);
        self.tile_released.notify_all();
        shared
    }

    /// A write guard abandoned its tile: drop the entry and recycle
    /// the buffer.
    pub(crate) fn discard_write(&self, tile: &Arc<Tile>, data: PixelBuffer) {
        self.touch();
        let key = tile.key();
        let mut inner = self.inner.lock();
        let same_tile = inner
            .index
            .get(&key)
            .map(|e| Arc::ptr_eq(&e.tile, tile))
            .unwrap_or(false);
        if same_tile {
            inner.remove_entry(&key);
        }
        inner.pool_push(data, self.config.free_pool_tiles);
        self.stats.record_discard();
        drop(inner);
        self.tile_released.notify_all();
    }

    /// A read guard dropped.
    pub(crate) fn release_read(&self, tile: &Arc<Tile>) {
        let key = tile.key();
        let mut inner = self.inner.lock();
        let state = inner.index.get_mut(&key).and_then(|entry| {
            if !Arc::ptr_eq(&entry.tile, tile) {
                return None;
            }
            entry.readers = entry.readers.saturating_sub(1);
            Some((entry.readers, entry.pins))
        });
        let Some((readers, pins)) = state else {
            return;
        };
        if readers > 0 {
            return;
        }
        let doomed = tile.is_doomed();
        let no_cache = tile.storage_class() == StorageClass::NoCache;
        if doomed || (no_cache && pins == 0) {
            if let Some(entry) = inner.remove_entry(&key) {
                if let Some(payload) = entry.payload {
                    let buffer = unwrap_payload(payload);
                    inner.pool_push(buffer, self.config.free_pool_tiles);
                }
            }
            self.stats.record_discard();
            drop(inner);
            self.tile_released.notify_all();
        } else if pins > 0 {
            inner.to_pinned(key);
        } else {
            inner.to_evictable(key, tile.priority());
        }
    }

    /// Insert an already-filled tile (adopting the caller's buffer) at
    /// the given priority. A resident tile under the same key wins;
    /// the buffer is recycled in that case.
    pub fn insert_ready(
        self: &Arc<Self>,
        key: TileKey,
        spec: TileSpec,
        priority: u32,
        buffer: PixelBuffer,
    ) -> Result<(), CacheError> {
        self.touch();
        let elements = self.config.tile_elements();
        if buffer.format() != spec.format || buffer.len() != elements {
            return Err(CacheError::BufferMismatch {
                expected: elements,
                got: buffer.len(),
            });
        }
        if spec.class == StorageClass::Never || spec.class == StorageClass::NoCache {
            return Err(CacheError::InvalidConfig(format!(
                "storage class {:?} cannot be inserted ready-made",
                spec.class
            )));
        }
        let bytes = buffer.byte_size();
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&key) {
            inner.pool_push(buffer, self.config.free_pool_tiles);
            return Ok(());
        }
        let target = self.config.max_bytes.saturating_sub(bytes);
        let victims = self.evict_until(&mut inner, target);
        let tile = Arc::new(Tile::new(
            key,
            spec.format,
            spec.remap,
            spec.class,
            self.config.tile_width,
            self.config.tile_height,
        ));
        tile.set_priority(priority);
        tile.mark_cooked();
        let pins = u32::from(spec.class == StorageClass::Locked);
        // Insert directly into its resting list.
        let location = if pins > 0 {
            Location::Pinned(inner.pinned.push_front(key))
        } else {
            Location::Evictable(inner.queue.add(key, priority))
        };
        inner.index.insert(
            key,
            CacheEntry {
                tile,
                payload: Some(Arc::new(buffer)),
                readers: 0,
                writer: false,
                pins,
                birth_pin: pins > 0,
                location,
            },
        );
        inner.used_bytes += bytes;
        inner.over_budget = inner.used_bytes > self.config.max_bytes;
        self.stats.observe_bytes(inner.used_bytes as u64);
        self.stats.record_created();
        drop(inner);
        self.flush_swap_outs(victims);
        Ok(())
    }

    /// Discard an unlocked, unpinned resident tile. Returns whether a
    /// tile was removed; locked or pinned tiles are left alone.
    pub fn discard(&self, key: &TileKey) -> bool {
        self.touch();
        let mut inner = self.inner.lock();
        let removable = inner
            .index
            .get(key)
            .map(|e| e.readers == 0 && !e.writer && e.pins == 0)
            .unwrap_or(false);
        if !removable {
            return false;
        }
        if let Some(entry) = inner.remove_entry(key) {
            if let Some(payload) = entry.payload {
                let buffer = unwrap_payload(payload);
                inner.pool_push(buffer, self.config.free_pool_tiles);
            }
        }
        self.stats.record_discard();
        true
    }

    /// Pin every resident tile of `token` whose pixels intersect
    /// `rect`, excluding them from eviction until the returned token
    /// is handed back.
    pub fn checkpoint(&self, token: ImageToken, rect: Rect) -> CheckpointToken {
        self.touch();
        let mut inner = self.inner.lock();
        let grid = tile_grid(&rect, self.config.tile_width, self.config.tile_height);
        let keys: Vec<TileKey> = inner
            .index
            .keys()
            .filter(|k| k.token == token && grid.contains(k.tile_x, k.tile_y))
            .copied()
            .collect();
        let mut tiles = Vec::with_capacity(keys.len());
        for key in &keys {
            let newly_pinned = {
                let Some(entry) = inner.index.get_mut(key) else {
                    continue;
                };
                entry.pins += 1;
                tiles.push(entry.tile.clone());
                entry.pins == 1 && entry.readers == 0 && !entry.writer
            };
            if newly_pinned {
                inner.to_pinned(*key);
            }
        }
        let id = inner.next_checkpoint;
        inner.next_checkpoint += 1;
        inner.checkpoints.insert(id, tiles);
        self.stats.record_checkpoint();
        debug!(checkpoint = id, "checkpoint pinned tiles");
        CheckpointToken(id)
    }

    /// Release a checkpoint's pins. If pinned tiles had forced the
    /// cache over budget, the trim is retried immediately.
    pub fn uncheckpoint(&self, token: CheckpointToken) {
        self.touch();
        let mut inner = self.inner.lock();
        let Some(tiles) = inner.checkpoints.remove(&token.0) else {
            return;
        };
        for tile in tiles {
            let key = tile.key();
            let same_tile = inner
                .index
                .get(&key)
                .map(|e| Arc::ptr_eq(&e.tile, &tile))
                .unwrap_or(false);
            if same_tile {
                self.unpin_one(&mut inner, key);
            }
        }
        if inner.over_budget {
            let victims = self.evict_until(&mut inner, self.config.max_bytes);
            drop(inner);
            self.flush_swap_outs(victims);
        }
    }

    /// Remove the birth pin of a [`StorageClass::Locked`] tile so it
    /// becomes evictable like any other. Returns whether this call
    /// released the pin; a tile of any other class, or one already
    /// released, is left alone and reports `false`.
    pub fn release_locked(&self, key: &TileKey) -> bool {
        self.touch();
        let mut inner = self.inner.lock();
        let released = inner
            .index
            .get_mut(key)
            .map(|entry| std::mem::take(&mut entry.birth_pin))
            .unwrap_or(false);
        if !released {
            return false;
        }
        self.unpin_one(&mut inner, *key);
        if inner.over_budget {
            let victims = self.evict_until(&mut inner, self.config.max_bytes);
            drop(inner);
            self.flush_swap_outs(victims);
        }
        true
    }

    /// Drop one pin; when the last pin on an unlocked tile releases,
    /// the tile re-enters the queue (or dies, if doomed).
    fn unpin_one(&self, inner: &mut CacheInner, key: TileKey) {
        let state = {
            let Some(entry) = inner.index.get_mut(&key) else {
                return;
            };
            entry.pins = entry.pins.saturating_sub(1);
            (entry.pins, entry.readers, entry.writer)
        };
        let (pins, readers, writer) = state;
        if pins > 0 || readers > 0 || writer {
            return;
        }
        let tile = match inner.index.get(&key) {
            Some(entry) => entry.tile.clone(),
            None => return,
        };
        if tile.is_doomed() {
            if let Some(entry) = inner.remove_entry(&key) {
                if let Some(payload) = entry.payload {
                    let buffer = unwrap_payload(payload);
                    inner.pool_push(buffer, self.config.free_pool_tiles);
                }
            }
            self.stats.record_discard();
        } else {
            inner.to_evictable(key, tile.priority());
        }
    }

    /// Whether a cooked tile for `key` is resident right now. Purely
    /// advisory: the answer can be stale by the time you act on it.
    pub fn contains(&self, key: &TileKey) -> bool {
        let inner = self.inner.lock();
        inner
            .index
            .get(key)
            .map(|e| !e.writer && e.tile.is_cooked())
            .unwrap_or(false)
    }

    /// Whether every tile of `token` covering `rect` is resident and
    /// cooked. Advisory, same as [`TileCache::contains`].
    pub fn contains_rect(&self, token: ImageToken, rect: Rect) -> bool {
        if rect.is_empty() {
            return true;
        }
        let grid = tile_grid(&rect, self.config.tile_width, self.config.tile_height);
        let inner = self.inner.lock();
        for ty in grid.y0..grid.y1 {
            for tx in grid.x0..grid.x1 {
                let key = TileKey::new(token, tx, ty);
                let ok = inner
                    .index
                    .get(&key)
                    .map(|e| !e.writer && e.tile.is_cooked())
                    .unwrap_or(false);
                if !ok {
                    return false;
                }
            }
        }
        true
    }

    /// Remove every tile belonging to `owner`. Unlocked tiles go
    /// immediately; locked or pinned ones are doomed and reclaimed at
    /// their release. Returns how many were removed immediately.
    pub fn invalidate_owner(&self, owner: OwnerId) -> usize {
        self.touch();
        let mut inner = self.inner.lock();
        let keys: Vec<TileKey> = inner
            .index
            .keys()
            .filter(|k| k.token.owner == owner)
            .copied()
            .collect();
        let mut removed = 0usize;
        for key in keys {
            let busy = {
                let Some(entry) = inner.index.get(&key) else {
                    continue;
                };
                entry.readers > 0 || entry.writer || entry.pins > 0
            };
            if busy {
                if let Some(entry) = inner.index.get(&key) {
                    entry.tile.doom();
                }
                continue;
            }
            if let Some(entry) = inner.remove_entry(&key) {
                if let Some(payload) = entry.payload {
                    let buffer = unwrap_payload(payload);
                    inner.pool_push(buffer, self.config.free_pool_tiles);
                }
                removed += 1;
            }
        }
        inner.over_budget = inner.used_bytes > self.config.max_bytes;
        drop(inner);
        self.stats.record_invalidated(removed as u64);
        if let Some(store) = &self.store {
            match store.remove_owner(owner) {
                Ok(purged) if purged > 0 => {
                    debug!(%owner, purged, "purged swap entries for invalidated owner");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%owner, error = %err, "failed to purge swap entries");
                }
            }
        }
        debug!(%owner, removed, "owner invalidated");
        removed
    }

    /// Evict until resident bytes fit `target_bytes` (or nothing more
    /// can go). Does not count as foreground activity.
    pub fn trim_to(&self, target_bytes: usize) {
        let mut inner = self.inner.lock();
        let victims = self.evict_until(&mut inner, target_bytes);
        drop(inner);
        self.flush_swap_outs(victims);
    }

    /// Trim everything evictable.
    pub fn clear(&self) {
        self.trim_to(0);
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    pub fn resident_tiles(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Whether pinned or locked tiles are currently holding the cache
    /// past its budget.
    pub fn is_over_budget(&self) -> bool {
        self.inner.lock().over_budget
    }

    /// Point-in-time statistics snapshot.
    pub fn statistics(&self) -> CacheStatistics {
        let inner = self.inner.lock();
        CacheStatistics::from_stats(
            &self.stats,
            inner.index.len(),
            inner.used_bytes,
            inner.pinned.len(),
            self.config.max_bytes,
        )
    }

    /// Check out a region view, reusing a retired one when possible.
    pub fn acquire_region(
        self: &Arc<Self>,
        request: RegionRequest,
    ) -> Result<Arc<Region>, RegionError> {
        self.touch();
        request.validate()?;
        let recycled = self.region_pool.lock().pop();
        let mut region = recycled.unwrap_or_default();
        region.reset(request, self.config.tile_width, self.config.tile_height);
        Ok(Arc::new(region))
    }

    /// Return a region to the reuse pool. No-op if other handles are
    /// still alive.
    pub fn retire_region(&self, region: Arc<Region>) {
        if let Some(mut region) = Arc::into_inner(region) {
            region.clear();
            let mut pool = self.region_pool.lock();
            if pool.len() < REGION_POOL_LIMIT {
                pool.push(region);
            }
        }
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TileCache")
            .field("tiles", &inner.index.len())
            .field("used_bytes", &inner.used_bytes)
            .field("max_bytes", &self.config.max_bytes)
            .field("over_budget", &inner.over_budget)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
