//! Swap store: the persistence boundary for proxy tiles.
//!
//! Tiles created with [`StorageClass::Proxy`] are cheap to keep but
//! expensive to rebuild, so when the cache evicts one it is written out
//! here, and a later miss restores it byte-for-byte instead of
//! re-rendering. The cache talks to the store through the [`TileStore`]
//! trait; [`DiskTileStore`] is the shipping implementation and
//! [`NullStore`] is the do-nothing stand-in for setups that want proxy
//! semantics without persistence.
//!
//! Store failures are contained: a failed write-out costs a rebuild
//! later, never correctness, so the cache logs and counts them rather
//! than propagating.
//!
//! [`StorageClass::Proxy`]: crate::cache::StorageClass::Proxy

mod disk;

pub use disk::{DiskTileStore, StoreConfig};

use thiserror::Error;

use crate::cache::{OwnerId, TileKey};
use crate::raster::{PixelBuffer, PixelFormat, Remap};

/// Errors from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

/// Everything needed to reconstruct a tile besides its pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileMeta {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub remap: Remap,
}

/// Persistence backend for proxy tiles.
///
/// Implementations must be safe to call from many threads at once; the
/// cache never serializes store calls.
pub trait TileStore: Send + Sync {
    /// Persist a tile. Overwrites any previous entry for the key.
    fn write_out(
        &self,
        key: &TileKey,
        meta: &TileMeta,
        data: &PixelBuffer,
    ) -> Result<(), StoreError>;

    /// Restore a tile. `Ok(None)` means the store has no entry for the
    /// key, which is an ordinary miss.
    fn read_in(&self, key: &TileKey) -> Result<Option<(TileMeta, PixelBuffer)>, StoreError>;

    /// Whether an entry exists for the key. Racy by nature.
    fn contains(&self, key: &TileKey) -> bool;

    /// Drop the entry for the key, if any.
    fn remove(&self, key: &TileKey) -> Result<(), StoreError>;

    /// Drop every entry belonging to the owner, returning how many
    /// were removed.
    fn remove_owner(&self, owner: OwnerId) -> Result<usize, StoreError>;

    /// Drop every entry.
    fn clear(&self) -> Result<(), StoreError>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total stored payload size in bytes.
    fn total_bytes(&self) -> u64;
}

/// A store that remembers nothing.
///
/// Write-outs vanish and read-ins always miss, so proxy tiles behave
/// like ordinary cached tiles that are simply rebuilt after eviction.
#[derive(Debug, Default)]
pub struct NullStore;

impl TileStore for NullStore {
    fn write_out(
        &self,
        _key: &TileKey,
        _meta: &TileMeta,
        _data: &PixelBuffer,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn read_in(&self, _key: &TileKey) -> Result<Option<(TileMeta, PixelBuffer)>, StoreError> {
        Ok(None)
    }

    fn contains(&self, _key: &TileKey) -> bool {
        false
    }

    fn remove(&self, _key: &TileKey) -> Result<(), StoreError> {
        Ok(())
    }

    fn remove_owner(&self, _owner: OwnerId) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn clear(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn len(&self) -> usize {
        0
    }

    fn total_bytes(&self) -> u64 {
        0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ImageToken, OwnerId};

    #[test]
    fn null_store_forgets_everything() {
        let store = NullStore;
        let key = TileKey::new(ImageToken::new(OwnerId::next()), 0, 0);
        let meta = TileMeta {
            format: PixelFormat::Float32,
            width: 4,
            height: 4,
            remap: Remap::IDENTITY,
        };
        let data = PixelBuffer::new(PixelFormat::Float32, 16);
        store.write_out(&key, &meta, &data).unwrap();
        assert!(!store.contains(&key));
        assert!(store.read_in(&key).unwrap().is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(store.total_bytes(), 0);
        assert!(store.is_empty());
    }
}
