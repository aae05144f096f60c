//! Tiles and the guards that hold them locked.
//!
//! A [`Tile`] is the immutable identity and bookkeeping of one cached
//! component plane; its pixel payload lives in the cache's metadata
//! table and is only reachable through a guard. [`TileReadGuard`]
//! shares the payload with other readers; [`TileWriteGuard`] owns the
//! payload outright while a producer fills it, so fills run without any
//! lock held. Dropping a guard releases the lock; the guard's other
//! consumers ([`TileWriteGuard::into_read`], [`TileWriteGuard::discard`])
//! decide what the release does.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::raster::{PixelBuffer, PixelFormat, Remap};

use super::core::TileCache;
use super::types::{StorageClass, TileKey};

/// Cached verdict of the uniform-plane scan.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ConstantState {
    Unknown,
    Varying,
    Constant(f32),
}

/// Identity and bookkeeping of one cached tile.
///
/// Everything here is either immutable or atomically updated; the pixel
/// payload itself is managed by the cache and handed out through
/// guards.
#[derive(Debug)]
pub struct Tile {
    key: TileKey,
    format: PixelFormat,
    remap: Remap,
    class: StorageClass,
    width: usize,
    height: usize,
    bytes: usize,
    cooked: AtomicBool,
    priority: AtomicU32,
    doomed: AtomicBool,
    constant: Mutex<ConstantState>,
}

impl Tile {
    pub(crate) fn new(
        key: TileKey,
        format: PixelFormat,
        remap: Remap,
        class: StorageClass,
        width: usize,
        height: usize,
    ) -> Self {
        Tile {
            key,
            format,
            remap,
            class,
            width,
            height,
            bytes: width * height * format.bytes_per_element(),
            cooked: AtomicBool::new(false),
            priority: AtomicU32::new(0),
            doomed: AtomicBool::new(false),
            constant: Mutex::new(ConstantState::Unknown),
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn remap(&self) -> Remap {
        self.remap
    }

    pub fn storage_class(&self) -> StorageClass {
        self.class
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Payload size in bytes, as charged against the cache budget.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// True once a producer has released its write lock.
    pub fn is_cooked(&self) -> bool {
        self.cooked.load(Ordering::Acquire)
    }

    /// Eviction priority, as set by the producer.
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub(crate) fn mark_cooked(&self) {
        self.cooked.store(true, Ordering::Release);
    }

    pub(crate) fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    pub(crate) fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    /// Forget any cached constant verdict. Called when a writer takes
    /// the tile, since the payload is about to change.
    pub(crate) fn reset_constant(&self) {
        *self.constant.lock() = ConstantState::Unknown;
    }

    /// Normalized value shared by every element, if the plane is
    /// uniform. The scan runs once; the verdict is cached until the
    /// next write lock.
    pub(crate) fn constant_value(&self, data: &PixelBuffer) -> Option<f32> {
        let mut state = self.constant.lock();
        match *state {
            ConstantState::Constant(v) => Some(v),
            ConstantState::Varying => None,
            ConstantState::Unknown => match data.uniform_value() {
                Some(raw) => {
                    let value = if self.format.is_integer() {
                        self.remap.normalize(raw)
                    } else {
                        raw
                    };
                    *state = ConstantState::Constant(value);
                    Some(value)
                }
                None => {
                    *state = ConstantState::Varying;
                    None
                }
            },
        }
    }
}

/// Shared read lock on a cooked tile.
///
/// Dereferences to the pixel payload. While any read guard is alive the
/// tile cannot be evicted or write-locked; the last guard to drop
/// returns the tile to the eviction queue (or frees it, for
/// [`StorageClass::NoCache`]).
pub struct TileReadGuard {
    cache: Arc<TileCache>,
    tile: Arc<Tile>,
    data: Arc<PixelBuffer>,
}

impl TileReadGuard {
    pub(crate) fn new(cache: Arc<TileCache>, tile: Arc<Tile>, data: Arc<PixelBuffer>) -> Self {
        TileReadGuard { cache, tile, data }
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn key(&self) -> TileKey {
        self.tile.key()
    }

    /// Normalized value shared by every element, if the plane is
    /// uniform.
    pub fn constant_value(&self) -> Option<f32> {
        self.tile.constant_value(&self.data)
    }

    /// Normalized read at `(x, y)` within the tile.
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data
            .get_f32(y * self.tile.width() + x, self.tile.remap())
    }
}

impl Deref for TileReadGuard {
    type Target = PixelBuffer;

    fn deref(&self) -> &PixelBuffer {
        &self.data
    }
}

impl Drop for TileReadGuard {
    fn drop(&mut self) {
        self.cache.release_read(&self.tile);
    }
}

impl std::fmt::Debug for TileReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileReadGuard")
            .field("key", &self.tile.key())
            .finish_non_exhaustive()
    }
}

/// What a write guard's release should do with the tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Cook the tile and make it available (the default).
    Release,
    /// Remove the tile and recycle its buffer.
    Discard,
    /// Already handed over via `into_read`; drop does nothing.
    Consumed,
}

/// Exclusive write lock on a tile being produced.
///
/// The guard owns the pixel payload, so filling it touches no locks.
/// Dropping the guard cooks the tile and publishes it at the priority
/// set via [`Tile::set_priority`]; [`TileWriteGuard::into_read`] does
/// the same but atomically keeps a read lock; [`TileWriteGuard::discard`]
/// removes the tile instead.
pub struct TileWriteGuard {
    cache: Arc<TileCache>,
    tile: Arc<Tile>,
    data: PixelBuffer,
    disposition: Disposition,
}

impl TileWriteGuard {
    pub(crate) fn new(cache: Arc<TileCache>, tile: Arc<Tile>, data: PixelBuffer) -> Self {
        TileWriteGuard {
            cache,
            tile,
            data,
            disposition: Disposition::Release,
        }
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn key(&self) -> TileKey {
        self.tile.key()
    }

    /// Sets the eviction priority the tile will be published at.
    pub fn set_priority(&self, priority: u32) {
        self.tile.set_priority(priority);
    }

    /// Normalized write at `(x, y)` within the tile.
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        let idx = y * self.tile.width() + x;
        let remap = self.tile.remap();
        self.data.set_f32(idx, value, remap);
    }

    /// Fill the whole tile with one normalized value.
    pub fn fill(&mut self, value: f32) {
        let remap = self.tile.remap();
        self.data.fill_f32(value, remap);
    }

    /// Cook the tile and atomically downgrade to a read lock at the
    /// given priority. No writer or evictor can slip in between.
    pub fn into_read(mut self, priority: u32) -> TileReadGuard {
        self.tile.set_priority(priority);
        self.disposition = Disposition::Consumed;
        let data = std::mem::replace(&mut self.data, PixelBuffer::empty());
        let cache = self.cache.clone();
        let tile = self.tile.clone();
        let shared = cache.downgrade_write(&tile, data);
        TileReadGuard::new(cache, tile, shared)
    }

    /// Abandon the tile: remove it from the cache and recycle its
    /// buffer. This is how a producer frees a tile it holds.
    pub fn discard(mut self) {
        self.disposition = Disposition::Discard;
    }
}

impl Deref for TileWriteGuard {
    type Target = PixelBuffer;

    fn deref(&self) -> &PixelBuffer {
        &self.data
    }
}

impl DerefMut for TileWriteGuard {
    fn deref_mut(&mut self) -> &mut PixelBuffer {
        &mut self.data
    }
}

impl Drop for TileWriteGuard {
    fn drop(&mut self) {
        let data = std::mem::replace(&mut self.data, PixelBuffer::empty());
        match self.disposition {
            Disposition::Release => self.cache.finish_write(&self.tile, data),
            Disposition::Discard => self.cache.discard_write(&self.tile, data),
            Disposition::Consumed => {}
        }
    }
}

impl std::fmt::Debug for TileWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileWriteGuard")
            .field("key", &self.tile.key())
            .field("disposition", &self.disposition)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::{ImageToken, OwnerId};

    fn test_tile(format: PixelFormat) -> Tile {
        let key = TileKey::new(ImageToken::new(OwnerId::next()), 0, 0);
        Tile::new(
            key,
            format,
            Remap::full_scale(format),
            StorageClass::Cached,
            8,
            4,
        )
    }

    #[test]
    fn byte_accounting_follows_format() {
        assert_eq!(test_tile(PixelFormat::Int8).bytes(), 32);
        assert_eq!(test_tile(PixelFormat::Float16).bytes(), 64);
        assert_eq!(test_tile(PixelFormat::Float32).bytes(), 128);
    }

    #[test]
    fn new_tiles_are_uncooked() {
        let tile = test_tile(PixelFormat::Float32);
        assert!(!tile.is_cooked());
        tile.mark_cooked();
        assert!(tile.is_cooked());
    }

    #[test]
    fn priority_updates_are_visible() {
        let tile = test_tile(PixelFormat::Float32);
        assert_eq!(tile.priority(), 0);
        tile.set_priority(42);
        assert_eq!(tile.priority(), 42);
    }

    #[test]
    fn constant_scan_verdict_is_cached() {
        let tile = test_tile(PixelFormat::Int8);
        let mut data = PixelBuffer::new(PixelFormat::Int8, 32);
        data.fill_raw(255.0);
        assert_eq!(tile.constant_value(&data), Some(1.0));
        // The cached verdict survives a divergent buffer until reset.
        data.set_raw(0, 0.0);
        assert_eq!(tile.constant_value(&data), Some(1.0));
        tile.reset_constant();
        assert_eq!(tile.constant_value(&data), None);
    }

    #[test]
    fn varying_verdict_is_cached_too() {
        let tile = test_tile(PixelFormat::Float32);
        let mut data = PixelBuffer::new(PixelFormat::Float32, 32);
        data.set_raw(3, 1.0);
        assert_eq!(tile.constant_value(&data), None);
        data.fill_raw(0.5);
        assert_eq!(tile.constant_value(&data), None);
        tile.reset_constant();
        assert_eq!(tile.constant_value(&data), Some(0.5));
    }

    #[test]
    fn float_constants_skip_the_remap() {
        let tile = test_tile(PixelFormat::Float32);
        let mut data = PixelBuffer::new(PixelFormat::Float32, 32);
        data.fill_raw(2.5);
        assert_eq!(tile.constant_value(&data), Some(2.5));
    }

    #[test]
    fn doom_flag_round_trips() {
        let tile = test_tile(PixelFormat::Int16);
        assert!(!tile.is_doomed());
        tile.doom();
        assert!(tile.is_doomed());
    }
}
