//! Disk-backed tile store.
//!
//! One file per tile under a root directory, named from the key so
//! lookups never need the index, plus an in-memory [`DashMap`] index
//! rebuilt by rescanning headers at startup. Files are a fixed 60-byte
//! little-endian header followed by the raw element payload.
//!
//! The store can carry an optional payload byte cap. Index entries
//! hold a logical access stamp, and a write that pushes the store past
//! the cap sweeps the least recently stamped entries out until it fits.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cache::{ImageToken, OwnerId, TileKey};
use crate::raster::{PixelBuffer, PixelFormat, Remap};

use super::{StoreError, TileMeta, TileStore};

const MAGIC: [u8; 4] = *b"RKSW";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 60;
const EXTENSION: &str = "rkt";

fn encode_header(key: &TileKey, meta: &TileMeta) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0..4].copy_from_slice(&MAGIC);
    h[4] = VERSION;
    h[5] = meta.format.tag();
    // h[6..8] reserved
    h[8..16].copy_from_slice(&key.token.owner.as_u64().to_le_bytes());
    h[16..18].copy_from_slice(&key.token.plane.to_le_bytes());
    h[18..20].copy_from_slice(&key.token.component.to_le_bytes());
    h[20..24].copy_from_slice(&key.token.array_index.to_le_bytes());
    h[24..28].copy_from_slice(&key.token.frame.to_le_bytes());
    h[28..36].copy_from_slice(&key.token.cook_version.to_le_bytes());
    h[36..40].copy_from_slice(&key.tile_x.to_le_bytes());
    h[40..44].copy_from_slice(&key.tile_y.to_le_bytes());
    h[44..48].copy_from_slice(&meta.width.to_le_bytes());
    h[48..52].copy_from_slice(&meta.height.to_le_bytes());
    h[52..56].copy_from_slice(&meta.remap.black.to_le_bytes());
    h[56..60].copy_from_slice(&meta.remap.white.to_le_bytes());
    h
}

fn decode_header(h: &[u8]) -> Result<(TileKey, TileMeta), StoreError> {
    if h.len() < HEADER_LEN {
        return Err(StoreError::Corrupt(format!(
            "header truncated at {} bytes",
            h.len()
        )));
    }
    if h[0..4] != MAGIC {
        return Err(StoreError::Corrupt("bad magic".to_string()));
    }
    if h[4] != VERSION {
        return Err(StoreError::Corrupt(format!(
            "unsupported version {}",
            h[4]
        )));
    }
    let format = PixelFormat::from_tag(h[5])
        .ok_or_else(|| StoreError::Corrupt(format!("unknown format tag {}", h[5])))?;

    let u64_at = |o: usize| u64::from_le_bytes(h[o..o + 8].try_into().unwrap_or([0; 8]));
    let u32_at = |o: usize| u32::from_le_bytes(h[o..o + 4].try_into().unwrap_or([0; 4]));
    let u16_at = |o: usize| u16::from_le_bytes(h[o..o + 2].try_into().unwrap_or([0; 2]));
    let i32_at = |o: usize| i32::from_le_bytes(h[o..o + 4].try_into().unwrap_or([0; 4]));
    let f32_at = |o: usize| f32::from_le_bytes(h[o..o + 4].try_into().unwrap_or([0; 4]));

    let token = ImageToken {
        owner: OwnerId::from_raw(u64_at(8)),
        plane: u16_at(16),
        component: u16_at(18),
        array_index: u32_at(20),
        frame: u32_at(24),
        cook_version: u64_at(28),
    };
    let key = TileKey::new(token, i32_at(36), i32_at(40));
    let meta = TileMeta {
        format,
        width: u32_at(44),
        height: u32_at(48),
        remap: Remap {
            black: f32_at(52),
            white: f32_at(56),
        },
    };
    Ok((key, meta))
}

/// Configuration for a [`DiskTileStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory the tile files live under.
    pub root: PathBuf,
    /// Payload byte ceiling, `None` for unbounded.
    pub max_bytes: Option<u64>,
}

impl StoreConfig {
    /// Unbounded store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            max_bytes: None,
        }
    }

    /// Cap stored payload bytes at `max_bytes`.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

/// Payload size plus a logical access stamp for oldest-first sweeps.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    bytes: u64,
    stamp: u64,
}

/// Disk-backed [`TileStore`].
pub struct DiskTileStore {
    root: PathBuf,
    max_bytes: Option<u64>,
    index: DashMap<TileKey, IndexEntry>,
    total_bytes: AtomicU64,
    clock: AtomicU64,
}

impl DiskTileStore {
    /// Open (or create) an unbounded store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_config(StoreConfig::new(root))
    }

    /// Open (or create) the store `config` describes, rescanning any
    /// entries a previous run left behind. Unreadable files are skipped
    /// with a warning rather than failing the open, and a store found
    /// over its byte cap is swept back under it before returning.
    pub fn with_config(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.root)?;
        let store = DiskTileStore {
            root: config.root,
            max_bytes: config.max_bytes,
            index: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
        };
        store.rescan()?;
        store.enforce_budget();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &TileKey) -> PathBuf {
        let t = &key.token;
        self.root.join(format!(
            "{}_{}_{}_{}_{}_{}_{}_{}.{}",
            t.owner.as_u64(),
            t.plane,
            t.component,
            t.array_index,
            t.frame,
            t.cook_version,
            key.tile_x,
            key.tile_y,
            EXTENSION,
        ))
    }

    fn rescan(&self) -> Result<(), StoreError> {
        let mut restored = 0usize;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read_header(&path) {
                Ok((key, _meta, payload_bytes)) => {
                    let entry = IndexEntry {
                        bytes: payload_bytes,
                        stamp: self.clock.fetch_add(1, Ordering::Relaxed),
                    };
                    self.index.insert(key, entry);
                    self.total_bytes.fetch_add(payload_bytes, Ordering::Relaxed);
                    restored += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable store file");
                }
            }
        }
        if restored > 0 {
            debug!(entries = restored, root = %self.root.display(), "restored swap store index");
        }
        Ok(())
    }

    fn read_header(path: &Path) -> Result<(TileKey, TileMeta, u64), StoreError> {
        let mut file = fs::File::open(path)?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        let (key, meta) = decode_header(&header)?;
        let payload = file
            .metadata()?
            .len()
            .saturating_sub(HEADER_LEN as u64);
        Ok((key, meta, payload))
    }

    fn touch(&self, key: &TileKey) {
        if let Some(mut entry) = self.index.get_mut(key) {
            entry.stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop least recently stamped entries until payload bytes fit the
    /// cap. No-op for unbounded stores.
    fn enforce_budget(&self) {
        let Some(max) = self.max_bytes else {
            return;
        };
        if self.total_bytes() <= max {
            return;
        }
        let mut candidates: Vec<(TileKey, u64)> = self
            .index
            .iter()
            .map(|e| (*e.key(), e.value().stamp))
            .collect();
        candidates.sort_by_key(|&(_, stamp)| stamp);

        let mut dropped = 0usize;
        for (key, _) in candidates {
            if self.total_bytes() <= max {
                break;
            }
            match self.remove(&key) {
                Ok(()) => dropped += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to drop tile while sweeping swap store");
                }
            }
        }
        if dropped > 0 {
            debug!(
                dropped,
                total_bytes = self.total_bytes(),
                max_bytes = max,
                "swept swap store back under its byte cap"
            );
        }
    }
}

impl TileStore for DiskTileStore {
    fn write_out(
        &self,
        key: &TileKey,
        meta: &TileMeta,
        data: &PixelBuffer,
    ) -> Result<(), StoreError> {
        let payload = data.to_bytes();
        let mut file = Vec::with_capacity(HEADER_LEN + payload.len());
        file.extend_from_slice(&encode_header(key, meta));
        file.extend_from_slice(&payload);
        fs::write(self.path_for(key), &file)?;

        let entry = IndexEntry {
            bytes: payload.len() as u64,
            stamp: self.clock.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(previous) = self.index.insert(*key, entry) {
            self.total_bytes.fetch_sub(previous.bytes, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(entry.bytes, Ordering::Relaxed);
        debug!(key = %key, bytes = entry.bytes, "tile written to swap store");
        self.enforce_budget();
        Ok(())
    }

    fn read_in(&self, key: &TileKey) -> Result<Option<(TileMeta, PixelBuffer)>, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let (stored_key, meta) = decode_header(&bytes)?;
        if stored_key != *key {
            return Err(StoreError::Corrupt(format!(
                "entry holds {stored_key}, expected {key}"
            )));
        }
        let data = PixelBuffer::from_bytes(meta.format, &bytes[HEADER_LEN..])
            .ok_or_else(|| StoreError::Corrupt("payload is not whole elements".to_string()))?;
        let expected = meta.width as usize * meta.height as usize;
        if data.len() != expected {
            return Err(StoreError::Corrupt(format!(
                "payload holds {} elements, header promises {}",
                data.len(),
                expected
            )));
        }
        self.touch(key);
        Ok(Some((meta, data)))
    }

    fn contains(&self, key: &TileKey) -> bool {
        self.index.contains_key(key)
    }

    fn remove(&self, key: &TileKey) -> Result<(), StoreError> {
        if let Some((_, entry)) = self.index.remove(key) {
            self.total_bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
        }
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_owner(&self, owner: OwnerId) -> Result<usize, StoreError> {
        let keys: Vec<TileKey> = self
            .index
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.token.owner == owner)
            .collect();
        let removed = keys.len();
        for key in keys {
            self.remove(&key)?;
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let keys: Vec<TileKey> = self.index.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DiskTileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTileStore")
            .field("root", &self.root)
            .field("max_bytes", &self.max_bytes)
            .field("entries", &self.index.len())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
