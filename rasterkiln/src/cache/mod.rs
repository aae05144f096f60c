//! Concurrent, size-bounded tile cache with priority eviction.
//!
//! Tiles are fixed-size pixel planes addressed by [`TileKey`]. The
//! cache bounds resident bytes, evicts lowest-priority tiles first,
//! and coordinates one producer or many readers per tile through RAII
//! guards.

mod core;
mod daemon;
mod list;
mod queue;
mod stats;
mod tile;
mod types;

pub use self::core::{CheckpointToken, TileCache, TileLookup, TileSpec};
pub use daemon::TrimDaemon;
pub use stats::{CacheStatistics, CacheStats};
pub use tile::{Tile, TileReadGuard, TileWriteGuard};
pub use types::{CacheConfig, CacheError, ImageToken, OwnerId, StorageClass, TileKey};

pub(crate) use self::core::tile_grid;
