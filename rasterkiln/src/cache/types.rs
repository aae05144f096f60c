//! Identity, configuration, and error types for the tile cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::swap::StoreError;

/// Process-wide counter backing [`OwnerId::next`].
static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a tile producer.
///
/// Everything a producer puts in the cache carries its `OwnerId`, which
/// is the handle [`TileCache::invalidate_owner`] sweeps by. Identities
/// are never reused within a process.
///
/// [`TileCache::invalidate_owner`]: crate::cache::TileCache::invalidate_owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an identity from its raw value. Only the swap store uses
    /// this, when rereading headers it wrote earlier.
    pub(crate) fn from_raw(raw: u64) -> Self {
        OwnerId(raw)
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Fingerprint of one component plane of one produced image.
///
/// Two tokens compare equal exactly when they describe the same pixels:
/// same producer, plane, component, array index, frame, and cook
/// version. Bumping `cook_version` after a re-render makes stale tiles
/// unreachable without touching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageToken {
    pub owner: OwnerId,
    pub plane: u16,
    pub component: u16,
    pub array_index: u32,
    pub frame: u32,
    pub cook_version: u64,
}

impl ImageToken {
    pub fn new(owner: OwnerId) -> Self {
        ImageToken {
            owner,
            plane: 0,
            component: 0,
            array_index: 0,
            frame: 0,
            cook_version: 0,
        }
    }

    pub fn with_plane(mut self, plane: u16) -> Self {
        self.plane = plane;
        self
    }

    pub fn with_component(mut self, component: u16) -> Self {
        self.component = component;
        self
    }

    pub fn with_array_index(mut self, array_index: u32) -> Self {
        self.array_index = array_index;
        self
    }

    pub fn with_frame(mut self, frame: u32) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_cook_version(mut self, cook_version: u64) -> Self {
        self.cook_version = cook_version;
        self
    }
}

/// Address of one tile: a token plus its grid position.
///
/// Grid positions are tile indices, not pixels; tile `(0, 0)` covers
/// canvas pixels `[0, tile_width) x [0, tile_height)` and indices may be
/// negative for canvases extending left of or above the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub token: ImageToken,
    pub tile_x: i32,
    pub tile_y: i32,
}

impl TileKey {
    pub fn new(token: ImageToken, tile_x: i32, tile_y: i32) -> Self {
        TileKey {
            token,
            tile_x,
            tile_y,
        }
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/p{}c{}a{}f{}v{}@({},{})",
            self.token.owner,
            self.token.plane,
            self.token.component,
            self.token.array_index,
            self.token.frame,
            self.token.cook_version,
            self.tile_x,
            self.tile_y
        )
    }
}

/// Lifecycle class a tile is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Ordinary resident tile, evictable by priority when unlocked.
    Cached,
    /// Dropped as soon as the last reader releases it.
    NoCache,
    /// Pinned from birth; survives eviction until explicitly unpinned
    /// or discarded.
    Locked,
    /// Evictable, but written to the swap store on eviction and restored
    /// from it on a later miss.
    Proxy,
    /// Never indexed. The caller gets a private scratch tile the cache
    /// will not hand to anyone else.
    Never,
}

/// Errors from cache operations.
///
/// Contention and absence are not errors; they come back as
/// [`TileLookup`](crate::cache::TileLookup) variants. This enum is for
/// the genuinely broken cases.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to allocate a {requested}-byte tile buffer")]
    AllocationFailed { requested: usize },

    #[error("buffer holds {got} elements but the tile needs {expected}")]
    BufferMismatch { expected: usize, got: usize },

    #[error("swap store error: {0}")]
    Store(#[from] StoreError),
}

/// Cache construction parameters.
///
/// Builder-style: start from `Default`, chain `with_*` calls, and hand
/// the result to [`TileCache::new`]. Tile dimensions are fixed for the
/// life of the cache.
///
/// [`TileCache::new`]: crate::cache::TileCache::new
///
/// # Example
///
/// ```
/// use rasterkiln::CacheConfig;
///
/// let config = CacheConfig::default()
///     .with_tile_size(64, 64)
///     .with_max_bytes(256 * 1024 * 1024)
///     .with_auto_reduce(64 * 1024 * 1024, std::time::Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Tile width in pixels.
    pub tile_width: usize,
    /// Tile height in pixels.
    pub tile_height: usize,
    /// Resident payload budget in bytes.
    pub max_bytes: usize,
    /// Budget to shrink to when the cache has been idle (see
    /// `auto_reduce`).
    pub inactive_max_bytes: usize,
    /// Whether the trim daemon shrinks an idle cache.
    pub auto_reduce: bool,
    /// Idle time before `auto_reduce` applies.
    pub inactive_after: Duration,
    /// Number of priority buckets in the eviction queue.
    pub num_buckets: usize,
    /// Priority span covered by each bucket.
    pub bucket_range: u32,
    /// Occupancy at which a non-lowest bucket redirects inserts to the
    /// lowest bucket.
    pub bucket_capacity: usize,
    /// Maximum number of freed tile buffers kept for reuse.
    pub free_pool_tiles: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            tile_width: 128,
            tile_height: 128,
            max_bytes: 512 * 1024 * 1024,
            inactive_max_bytes: 128 * 1024 * 1024,
            auto_reduce: false,
            inactive_after: Duration::from_secs(30),
            num_buckets: 8,
            bucket_range: 16,
            bucket_capacity: 4096,
            free_pool_tiles: 64,
        }
    }
}

impl CacheConfig {
    pub fn with_tile_size(mut self, width: usize, height: usize) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_auto_reduce(mut self, inactive_max_bytes: usize, after: Duration) -> Self {
        self.auto_reduce = true;
        self.inactive_max_bytes = inactive_max_bytes;
        self.inactive_after = after;
        self
    }

    pub fn with_buckets(mut self, count: usize, range: u32, capacity: usize) -> Self {
        self.num_buckets = count;
        self.bucket_range = range;
        self.bucket_capacity = capacity;
        self
    }

    pub fn with_free_pool(mut self, tiles: usize) -> Self {
        self.free_pool_tiles = tiles;
        self
    }

    /// Checks the configuration for contradictions.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "tile size {}x{} has a zero dimension",
                self.tile_width, self.tile_height
            )));
        }
        if self.max_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_bytes must be non-zero".to_string(),
            ));
        }
        if self.auto_reduce && self.inactive_max_bytes > self.max_bytes {
            return Err(CacheError::InvalidConfig(format!(
                "inactive budget {} exceeds main budget {}",
                self.inactive_max_bytes, self.max_bytes
            )));
        }
        if self.num_buckets == 0 {
            return Err(CacheError::InvalidConfig(
                "at least one priority bucket is required".to_string(),
            ));
        }
        if self.bucket_range == 0 {
            return Err(CacheError::InvalidConfig(
                "bucket_range must be non-zero".to_string(),
            ));
        }
        if self.bucket_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "bucket_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Elements in one tile plane.
    pub fn tile_elements(&self) -> usize {
        self.tile_width * self.tile_height
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
