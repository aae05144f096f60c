//! Rasterkiln - concurrent tile cache and adaptive sampling for
//! compositing pipelines.
//!
//! The library has two halves. The [`cache`] module is a size-bounded,
//! priority-evicting store of image tiles shared by every cooking
//! thread, with optional disk swap ([`swap`]) and rectangle-level
//! assembly ([`region`]). The [`adaptive`] module drives progressive
//! renderers: it decides where the next sample should go based on
//! per-pixel noise and accumulates the results into filterable planes.
//!
//! # Example
//!
//! ```
//! # fn main() -> Result<(), rasterkiln::CacheError> {
//! use rasterkiln::{CacheConfig, ImageToken, OwnerId, TileCache, TileKey, TileLookup, TileSpec};
//! use rasterkiln::raster::PixelFormat;
//!
//! let cache = TileCache::new(CacheConfig::default())?;
//! let key = TileKey::new(ImageToken::new(OwnerId::next()), 0, 0);
//! let spec = TileSpec::new(PixelFormat::Float32);
//!
//! // First lookup creates the tile; dropping the guard publishes it.
//! if let TileLookup::Created(mut guard) = cache.get_or_create(key, spec, true, true)? {
//!     guard.fill(0.25);
//!     guard.set(3, 4, 0.5);
//! }
//!
//! let hit = cache.fetch(key, spec, true)?.into_read().expect("tile is resident");
//! assert_eq!(hit.get(3, 4), 0.5);
//! # Ok(())
//! # }
//! ```

pub mod adaptive;
pub mod cache;
pub mod logging;
pub mod raster;
pub mod region;
pub mod swap;

pub use adaptive::{
    AdaptiveConfig, AdaptiveError, AdaptiveImage, AdaptivePlane, PixelFilter, PixelSample,
    PriorityRegion,
};
pub use cache::{
    CacheConfig, CacheError, CacheStatistics, CheckpointToken, ImageToken, OwnerId, StorageClass,
    TileCache, TileKey, TileLookup, TileSpec, TrimDaemon,
};
pub use raster::{Packing, PixelBuffer, PixelFormat, Raster, Rect, Remap};
pub use region::{EdgeExtend, EdgePolicy, NeededTile, Region, RegionError, RegionRequest};
pub use swap::{DiskTileStore, NullStore, StoreConfig, StoreError, TileStore};

/// Version of the rasterkiln library and CLI.
///
/// This is synchronized across all components in the workspace. The
/// version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
