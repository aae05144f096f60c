//! Rectangular multi-tile views.
//!
//! A [`Region`] turns "give me these pixels" into tile work. It maps a
//! requested rectangle onto the tile grid, hands out uncooked cells to
//! worker threads, and finally assembles the finished tiles into one
//! [`Raster`], synthesizing any pixels that fall outside the image
//! bounds from the edge policy.
//!
//! # Worker protocol
//!
//! Any number of workers can share one region:
//!
//! ```text
//! while let Some(need) = region.next_needed_tile() {
//!     for c in 0..region.request().components {
//!         // cook cache tile region.tile_key(&need, c)
//!     }
//!     region.finished_tile(&need);
//! }
//! ```
//!
//! A worker that cannot complete a cell calls
//! [`Region::reject_tile`] so another worker can pick it up.
//! [`Region::next_needed_tile`] returning `None` means every cell has
//! been handed out, not that the region is done; poll
//! [`Region::is_filled`] for that.
//!
//! Cooked tiles are ordinary cache citizens and can be evicted between
//! cooking and [`Region::gather`]. Callers that cannot tolerate a
//! [`RegionError::Incomplete`] from gather should checkpoint the
//! region's rectangle while they work.
//!
//! Regions are plain structs with interior locking, so they recycle
//! well: get them from
//! [`TileCache::acquire_region`](crate::cache::TileCache::acquire_region)
//! and hand them back with
//! [`TileCache::retire_region`](crate::cache::TileCache::retire_region).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::{
    tile_grid, CacheError, ImageToken, StorageClass, TileCache, TileKey, TileLookup, TileSpec,
};
use crate::raster::{Packing, PixelFormat, Raster, Rect, Remap};

/// A region aggregates at most this many component planes.
const MAX_COMPONENTS: u16 = 4;

/// What to put in requested pixels that lie outside the image bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeExtend {
    /// Fill with a fixed normalized value.
    Black(f32),
    /// Replicate the nearest in-bounds pixel.
    Hold,
}

/// Out-of-bounds resolution, chosen per side of the image.
///
/// A composite often holds the edges it scrolls along while matting
/// the others to black, so each side carries its own [`EdgeExtend`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgePolicy {
    pub left: EdgeExtend,
    pub right: EdgeExtend,
    pub top: EdgeExtend,
    pub bottom: EdgeExtend,
}

impl EdgePolicy {
    /// The same resolution on every side.
    pub fn uniform(extend: EdgeExtend) -> Self {
        EdgePolicy {
            left: extend,
            right: extend,
            top: extend,
            bottom: extend,
        }
    }

    pub fn with_left(mut self, extend: EdgeExtend) -> Self {
        self.left = extend;
        self
    }

    pub fn with_right(mut self, extend: EdgeExtend) -> Self {
        self.right = extend;
        self
    }

    pub fn with_top(mut self, extend: EdgeExtend) -> Self {
        self.top = extend;
        self
    }

    pub fn with_bottom(mut self, extend: EdgeExtend) -> Self {
        self.bottom = extend;
        self
    }
}

impl Default for EdgePolicy {
    fn default() -> Self {
        EdgePolicy::uniform(EdgeExtend::Hold)
    }
}

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("invalid region request: {0}")]
    InvalidRequest(String),

    #[error("tile {missing} is not resident; the region cannot assemble")]
    Incomplete { missing: TileKey },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Everything a region needs to know about the pixels it describes.
///
/// `rect` may extend past `bounds`; the overhang is synthesized by the
/// edge policy rather than cooked. A region carries up to four
/// component planes; `token.component` is overwritten per plane, so
/// pass the base token.
#[derive(Debug, Clone)]
pub struct RegionRequest {
    pub token: ImageToken,
    pub rect: Rect,
    pub bounds: Rect,
    pub components: u16,
    pub format: PixelFormat,
    pub remap: Remap,
    pub class: StorageClass,
    pub packing: Packing,
    pub edge: EdgePolicy,
}

impl RegionRequest {
    pub fn new(
        token: ImageToken,
        rect: Rect,
        bounds: Rect,
        components: u16,
        format: PixelFormat,
    ) -> Self {
        RegionRequest {
            token,
            rect,
            bounds,
            components,
            format,
            remap: Remap::full_scale(format),
            class: StorageClass::Cached,
            packing: Packing::Interleaved,
            edge: EdgePolicy::default(),
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

    pub fn with_packing(mut self, packing: Packing) -> Self {
        self.packing = packing;
        self
    }

    /// Apply one resolution to all four sides.
    pub fn with_edge(mut self, extend: EdgeExtend) -> Self {
        self.edge = EdgePolicy::uniform(extend);
        self
    }

    pub fn with_edge_policy(mut self, edge: EdgePolicy) -> Self {
        self.edge = edge;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), RegionError> {
        if self.rect.is_empty() {
            return Err(RegionError::InvalidRequest(format!(
                "empty rect {}",
                self.rect
            )));
        }
        if self.components == 0 || self.components > MAX_COMPONENTS {
            return Err(RegionError::InvalidRequest(format!(
                "component count {} is outside 1..={}",
                self.components, MAX_COMPONENTS
            )));
        }
        // Scratch and drop-on-release tiles cannot outlive cooking, so
        // a region could never assemble from them.
        if matches!(self.class, StorageClass::Never | StorageClass::NoCache) {
            return Err(RegionError::InvalidRequest(format!(
                "storage class {:?} cannot back a region",
                self.class
            )));
        }
        Ok(())
    }
}

/// One grid cell handed to a worker.
///
/// `tile_x`/`tile_y` index the global tile grid (use them to build
/// tile keys); the shifts are the tile's pixel origin relative to the
/// request rectangle's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeededTile {
    pub tile_x: i32,
    pub tile_y: i32,
    pub x_shift: i32,
    pub y_shift: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Unissued,
    Issued,
    Done,
}

/// A tile-grid view over one requested rectangle.
///
/// Tracks per-cell cooking state; pixels and locking stay in the
/// cache. One cell covers every component plane of the image, so a
/// worker fills all components before reporting the cell done.
pub struct Region {
    request: RegionRequest,
    tile_w: usize,
    tile_h: usize,
    /// Part of the request actually covered by the image.
    interior: Rect,
    /// Tile-grid indices covering the interior.
    grid: Rect,
    cells: Mutex<Vec<CellState>>,
    remaining: AtomicUsize,
    /// Settled constant verdict, dropped whenever cell state changes.
    constant: Mutex<Option<Option<Vec<f32>>>>,
}

impl Default for Region {
    fn default() -> Self {
        Region {
            request: RegionRequest::new(
                ImageToken::new(crate::cache::OwnerId::from_raw(0)),
                Rect::new(0, 0, 0, 0),
                Rect::new(0, 0, 0, 0),
                0,
                PixelFormat::Float32,
            ),
            tile_w: 1,
            tile_h: 1,
            interior: Rect::new(0, 0, 0, 0),
            grid: Rect::new(0, 0, 0, 0),
            cells: Mutex::new(Vec::new()),
            remaining: AtomicUsize::new(0),
            constant: Mutex::new(None),
        }
    }
}

impl Region {
    /// Re-arm this region for a new request. Wipes all cell state.
    pub(crate) fn reset(&mut self, request: RegionRequest, tile_w: usize, tile_h: usize) {
        let interior = request.rect.intersect(&request.bounds);
        let grid = tile_grid(&interior, tile_w, tile_h);
        let cell_count = (grid.area()).max(0) as usize;
        self.request = request;
        self.tile_w = tile_w;
        self.tile_h = tile_h;
        self.interior = interior;
        self.grid = grid;
        let mut cells = self.cells.lock();
        cells.clear();
        cells.resize(cell_count, CellState::Unissued);
        drop(cells);
        self.remaining.store(cell_count, Ordering::Release);
        *self.constant.get_mut() = None;
    }

    /// Drop cell state so a pooled region holds nothing.
    pub(crate) fn clear(&mut self) {
        self.cells.lock().clear();
        self.remaining.store(0, Ordering::Release);
        *self.constant.get_mut() = None;
    }

    pub fn request(&self) -> &RegionRequest {
        &self.request
    }

    /// The in-bounds part of the requested rectangle.
    pub fn interior(&self) -> Rect {
        self.interior
    }

    /// Total number of tile cells this region cooks.
    pub fn cells_total(&self) -> usize {
        self.grid.area().max(0) as usize
    }

    /// Cells not yet reported done.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Whether every cell has been cooked and reported.
    pub fn is_filled(&self) -> bool {
        self.remaining() == 0
    }

    /// The tile spec workers should cook with.
    pub fn tile_spec(&self) -> TileSpec {
        TileSpec::new(self.request.format)
            .with_remap(self.request.remap)
            .with_class(self.request.class)
    }

    /// Cache key for one component plane of a handed-out cell.
    pub fn tile_key(&self, needed: &NeededTile, component: u16) -> TileKey {
        TileKey::new(
            self.request.token.with_component(component),
            needed.tile_x,
            needed.tile_y,
        )
    }

    /// Hand out the next uncooked cell, marking it issued. `None`
    /// means nothing is waiting for a worker right now.
    pub fn next_needed_tile(&self) -> Option<NeededTile> {
        let grid_w = self.grid.width() as usize;
        let mut cells = self.cells.lock();
        let pos = cells.iter().position(|s| *s == CellState::Unissued)?;
        cells[pos] = CellState::Issued;
        drop(cells);
        let tile_x = self.grid.x0 + (pos % grid_w) as i32;
        let tile_y = self.grid.y0 + (pos / grid_w) as i32;
        Some(NeededTile {
            tile_x,
            tile_y,
            x_shift: tile_x * self.tile_w as i32 - self.request.rect.x0,
            y_shift: tile_y * self.tile_h as i32 - self.request.rect.y0,
        })
    }

    fn cell_index(&self, needed: &NeededTile) -> Option<usize> {
        let col = needed.tile_x - self.grid.x0;
        let row = needed.tile_y - self.grid.y0;
        if col < 0 || col >= self.grid.width() || row < 0 || row >= self.grid.height() {
            return None;
        }
        Some(row as usize * self.grid.width() as usize + col as usize)
    }

    /// A worker finished every component of this cell.
    pub fn finished_tile(&self, needed: &NeededTile) {
        let Some(idx) = self.cell_index(needed) else {
            return;
        };
        let mut cells = self.cells.lock();
        if cells[idx] != CellState::Done {
            cells[idx] = CellState::Done;
            drop(cells);
            self.remaining.fetch_sub(1, Ordering::AcqRel);
            *self.constant.lock() = None;
        }
    }

    /// A worker gave up on this cell; put it back up for grabs.
    pub fn reject_tile(&self, needed: &NeededTile) {
        let Some(idx) = self.cell_index(needed) else {
            return;
        };
        let mut cells = self.cells.lock();
        if cells[idx] == CellState::Issued {
            cells[idx] = CellState::Unissued;
            drop(cells);
            *self.constant.lock() = None;
        }
    }

    /// Assemble the requested rectangle from cached tiles.
    ///
    /// Blocks on tiles still being cooked. A tile that is neither
    /// resident nor restorable fails the whole assembly with
    /// [`RegionError::Incomplete`].
    pub fn gather(&self, cache: &Arc<TileCache>) -> Result<Raster, RegionError> {
        let req = &self.request;
        let w = req.rect.width() as usize;
        let h = req.rect.height() as usize;
        let nc = req.components as usize;
        let mut out = Raster::new(w, h, nc, req.packing, req.format, req.remap);

        if self.interior.is_empty() {
            if let EdgeExtend::Black(v) = self.oob_extend() {
                if v != 0.0 {
                    for c in 0..nc {
                        for y in 0..h {
                            for x in 0..w {
                                out.set(x, y, c, v);
                            }
                        }
                    }
                }
            }
            return Ok(out);
        }

        let spec = self.tile_spec();
        let tw = self.tile_w as i32;
        let th = self.tile_h as i32;
        for c in 0..req.components {
            let token = req.token.with_component(c);
            for ty in self.grid.y0..self.grid.y1 {
                for tx in self.grid.x0..self.grid.x1 {
                    let key = TileKey::new(token, tx, ty);
                    let guard = match cache.get_or_create(key, spec, false, true)? {
                        TileLookup::Hit(guard) => guard,
                        _ => return Err(RegionError::Incomplete { missing: key }),
                    };
                    let tile_rect = Rect::new(tx * tw, ty * th, (tx + 1) * tw, (ty + 1) * th);
                    let copy = tile_rect.intersect(&self.interior);
                    for y in copy.y0..copy.y1 {
                        for x in copy.x0..copy.x1 {
                            let v = guard.get(
                                (x - tile_rect.x0) as usize,
                                (y - tile_rect.y0) as usize,
                            );
                            out.set(
                                (x - req.rect.x0) as usize,
                                (y - req.rect.y0) as usize,
                                c as usize,
                                v,
                            );
                        }
                    }
                }
            }
        }

        self.extend_edges(&mut out);
        Ok(out)
    }

    /// Synthesize the out-of-bounds bands, each from its own side's
    /// policy. Rows above and below the interior are built first over
    /// the interior's columns, then the left and right columns run full
    /// height, so a corner follows its side's policy applied to the
    /// already-extended column.
    fn extend_edges(&self, out: &mut Raster) {
        let req = &self.request;
        let w = out.width();
        let h = out.height();
        let nc = out.components();
        let ix0 = (self.interior.x0 - req.rect.x0).clamp(0, w as i32) as usize;
        let iy0 = (self.interior.y0 - req.rect.y0).clamp(0, h as i32) as usize;
        let ix1 = (self.interior.x1 - req.rect.x0).clamp(0, w as i32) as usize;
        let iy1 = (self.interior.y1 - req.rect.y0).clamp(0, h as i32) as usize;
        if ix0 == 0 && iy0 == 0 && ix1 == w && iy1 == h {
            return;
        }
        let edge = req.edge;
        for c in 0..nc {
            match edge.top {
                EdgeExtend::Black(v) => {
                    for y in 0..iy0 {
                        for x in ix0..ix1 {
                            out.set(x, y, c, v);
                        }
                    }
                }
                EdgeExtend::Hold => {
                    for y in 0..iy0 {
                        for x in ix0..ix1 {
                            let v = out.get(x, iy0, c);
                            out.set(x, y, c, v);
                        }
                    }
                }
            }
            match edge.bottom {
                EdgeExtend::Black(v) => {
                    for y in iy1..h {
                        for x in ix0..ix1 {
                            out.set(x, y, c, v);
                        }
                    }
                }
                EdgeExtend::Hold => {
                    for y in iy1..h {
                        for x in ix0..ix1 {
                            let v = out.get(x, iy1 - 1, c);
                            out.set(x, y, c, v);
                        }
                    }
                }
            }
            match edge.left {
                EdgeExtend::Black(v) => {
                    for x in 0..ix0 {
                        for y in 0..h {
                            out.set(x, y, c, v);
                        }
                    }
                }
                EdgeExtend::Hold => {
                    for x in 0..ix0 {
                        for y in 0..h {
                            let v = out.get(ix0, y, c);
                            out.set(x, y, c, v);
                        }
                    }
                }
            }
            match edge.right {
                EdgeExtend::Black(v) => {
                    for x in ix1..w {
                        for y in 0..h {
                            out.set(x, y, c, v);
                        }
                    }
                }
                EdgeExtend::Hold => {
                    for x in ix1..w {
                        for y in 0..h {
                            let v = out.get(ix1 - 1, y, c);
                            out.set(x, y, c, v);
                        }
                    }
                }
            }
        }
    }

    /// Policy to apply when the whole rect lies outside the bounds.
    /// Horizontal sides are tried first, matching corner ownership in
    /// the band synthesis.
    fn oob_extend(&self) -> EdgeExtend {
        let req = &self.request;
        if req.rect.x1 <= req.bounds.x0 {
            req.edge.left
        } else if req.rect.x0 >= req.bounds.x1 {
            req.edge.right
        } else if req.rect.y1 <= req.bounds.y0 {
            req.edge.top
        } else {
            req.edge.bottom
        }
    }

    /// Per-component constant verdict for the whole region, or `None`
    /// as soon as anything varies.
    ///
    /// Conservative: a boundary tile is judged on its full plane, so a
    /// tile that only varies outside the interior still voids the
    /// verdict. Blocks and fails exactly like [`Region::gather`]. A
    /// settled verdict is kept on the region and served without tile
    /// lookups until the cell state next changes.
    pub fn constant_value(&self, cache: &Arc<TileCache>) -> Result<Option<Vec<f32>>, RegionError> {
        if let Some(verdict) = self.constant.lock().as_ref() {
            return Ok(verdict.clone());
        }
        let verdict = self.compute_constant(cache)?;
        *self.constant.lock() = Some(verdict.clone());
        Ok(verdict)
    }

    fn compute_constant(&self, cache: &Arc<TileCache>) -> Result<Option<Vec<f32>>, RegionError> {
        let req = &self.request;
        let nc = req.components as usize;
        if self.interior.is_empty() {
            let v = match self.oob_extend() {
                EdgeExtend::Black(v) => v,
                EdgeExtend::Hold => 0.0,
            };
            return Ok(Some(vec![v; nc]));
        }
        // Only sides the rect actually overhangs constrain the verdict.
        let overhangs = [
            (req.rect.x0 < self.interior.x0, req.edge.left),
            (req.rect.x1 > self.interior.x1, req.edge.right),
            (req.rect.y0 < self.interior.y0, req.edge.top),
            (req.rect.y1 > self.interior.y1, req.edge.bottom),
        ];
        let spec = self.tile_spec();
        let mut constants = Vec::with_capacity(nc);
        for c in 0..req.components {
            let token = req.token.with_component(c);
            let mut value: Option<f32> = None;
            for ty in self.grid.y0..self.grid.y1 {
                for tx in self.grid.x0..self.grid.x1 {
                    let key = TileKey::new(token, tx, ty);
                    let guard = match cache.get_or_create(key, spec, false, true)? {
                        TileLookup::Hit(guard) => guard,
                        _ => return Err(RegionError::Incomplete { missing: key }),
                    };
                    let Some(v) = guard.constant_value() else {
                        return Ok(None);
                    };
                    match value {
                        None => value = Some(v),
                        Some(prev) if prev == v => {}
                        Some(_) => return Ok(None),
                    }
                }
            }
            let v = value.unwrap_or(0.0);
            for (active, extend) in overhangs {
                if !active {
                    continue;
                }
                match extend {
                    EdgeExtend::Hold => {}
                    EdgeExtend::Black(b) if b == v => {}
                    EdgeExtend::Black(_) => return Ok(None),
                }
            }
            constants.push(v);
        }
        Ok(Some(constants))
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("rect", &self.request.rect)
            .field("interior", &self.interior)
            .field("cells", &self.cells_total())
            .field("remaining", &self.remaining())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, OwnerId};

    fn cache_4x4() -> Arc<TileCache> {
        TileCache::new(
            CacheConfig::default()
                .with_tile_size(4, 4)
                .with_max_bytes(1 << 20),
        )
        .unwrap()
    }

    fn request_8x8(token: ImageToken) -> RegionRequest {
        RegionRequest::new(
            token,
            Rect::new(0, 0, 8, 8),
            Rect::new(0, 0, 8, 8),
            1,
            PixelFormat::Float32,
        )
    }

    /// Cook every cell: each tile is filled with `10 * tile_x + tile_y`.
    fn cook_all(cache: &Arc<TileCache>, region: &Region) {
        while let Some(need) = region.next_needed_tile() {
            for c in 0..region.request().components {
                let mut guard = cache
                    .get_or_create(region.tile_key(&need, c), region.tile_spec(), true, false)
                    .unwrap()
                    .into_write()
                    .unwrap();
                guard.fill((10 * need.tile_x + need.tile_y) as f32);
                drop(guard);
            }
            region.finished_tile(&need);
        }
    }

    #[test]
    fn cells_issue_once_and_finish() {
        let cache = cache_4x4();
        let region = cache
            .acquire_region(request_8x8(ImageToken::new(OwnerId::next())))
            .unwrap();
        assert_eq!(region.cells_total(), 4);
        assert!(!region.is_filled());

        let mut handed = Vec::new();
        while let Some(need) = region.next_needed_tile() {
            handed.push(need);
        }
        assert_eq!(handed.len(), 4);
        assert!(region.next_needed_tile().is_none());
        assert!(!region.is_filled());

        for need in &handed {
            region.finished_tile(need);
        }
        assert!(region.is_filled());
        // Finishing twice does not underflow.
        region.finished_tile(&handed[0]);
        assert_eq!(region.remaining(), 0);
    }

    #[test]
    fn rejected_cells_are_reissued() {
        let cache = cache_4x4();
        let region = cache
            .acquire_region(request_8x8(ImageToken::new(OwnerId::next())))
            .unwrap();
        let first = region.next_needed_tile().unwrap();
        let mut rest = 0;
        while region.next_needed_tile().is_some() {
            rest += 1;
        }
        assert_eq!(rest, 3);

        region.reject_tile(&first);
        let again = region.next_needed_tile().unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn needed_tiles_carry_shifts() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        // Rect straddling tile boundaries: tiles (0,0)..(2,2), origin
        // shifted by -2 relative to the rect.
        let region = cache
            .acquire_region(RegionRequest::new(
                token,
                Rect::new(2, 2, 8, 8),
                Rect::new(0, 0, 8, 8),
                1,
                PixelFormat::Float32,
            ))
            .unwrap();
        let need = region.next_needed_tile().unwrap();
        assert_eq!((need.tile_x, need.tile_y), (0, 0));
        assert_eq!((need.x_shift, need.y_shift), (-2, -2));
    }

    #[test]
    fn gather_assembles_cooked_tiles() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache.acquire_region(request_8x8(token)).unwrap();
        cook_all(&cache, &region);
        assert!(region.is_filled());

        let raster = region.gather(&cache).unwrap();
        assert_eq!((raster.width(), raster.height()), (8, 8));
        // Quadrants carry their tile's fill value.
        assert_eq!(raster.get(1, 1, 0), 0.0);
        assert_eq!(raster.get(5, 1, 0), 10.0);
        assert_eq!(raster.get(1, 5, 0), 1.0);
        assert_eq!(raster.get(5, 5, 0), 11.0);
    }

    #[test]
    fn gather_fails_on_missing_tiles() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache.acquire_region(request_8x8(token)).unwrap();
        // Cook only one of the four cells.
        let need = region.next_needed_tile().unwrap();
        let guard = cache
            .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
            .unwrap()
            .into_write()
            .unwrap();
        drop(guard);
        region.finished_tile(&need);

        match region.gather(&cache) {
            Err(RegionError::Incomplete { .. }) => {}
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn hold_extension_replicates_edges() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache
            .acquire_region(RegionRequest::new(
                token,
                Rect::new(-2, -2, 6, 6),
                Rect::new(0, 0, 4, 4),
                1,
                PixelFormat::Float32,
            ))
            .unwrap();
        // One interior tile with a gradient.
        let need = region.next_needed_tile().unwrap();
        let mut guard = cache
            .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
            .unwrap()
            .into_write()
            .unwrap();
        for y in 0..4 {
            for x in 0..4 {
                guard.set(x, y, (x as f32) + (y as f32) * 0.1);
            }
        }
        drop(guard);
        region.finished_tile(&need);

        let raster = region.gather(&cache).unwrap();
        assert_eq!((raster.width(), raster.height()), (8, 8));
        // Interior untouched.
        assert_eq!(raster.get(2, 2, 0), 0.0);
        assert_eq!(raster.get(5, 5, 0), 3.0 + 3.0 * 0.1);
        // Corner replicates the corner pixel.
        assert_eq!(raster.get(0, 0, 0), 0.0);
        assert_eq!(raster.get(7, 7, 0), 3.0 + 3.0 * 0.1);
        // A top band pixel replicates straight down.
        assert_eq!(raster.get(4, 0, 0), 2.0);
        // A left band pixel replicates straight across.
        assert_eq!(raster.get(0, 4, 0), 2.0 * 0.1);
    }

    #[test]
    fn black_extension_fills_bands() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache
            .acquire_region(
                RegionRequest::new(
                    token,
                    Rect::new(0, 0, 6, 4),
                    Rect::new(0, 0, 4, 4),
                    1,
                    PixelFormat::Float32,
                )
                .with_edge(EdgeExtend::Black(0.25)),
            )
            .unwrap();
        let need = region.next_needed_tile().unwrap();
        let mut guard = cache
            .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
            .unwrap()
            .into_write()
            .unwrap();
        guard.fill(0.75);
        drop(guard);
        region.finished_tile(&need);

        let raster = region.gather(&cache).unwrap();
        assert_eq!(raster.get(3, 0, 0), 0.75);
        assert_eq!(raster.get(4, 0, 0), 0.25);
        assert_eq!(raster.get(5, 3, 0), 0.25);
    }

    #[test]
    fn edge_policies_resolve_per_side() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        // Overhangs left and right of a 4-wide image.
        let region = cache
            .acquire_region(
                RegionRequest::new(
                    token,
                    Rect::new(-2, 0, 6, 4),
                    Rect::new(0, 0, 4, 4),
                    1,
                    PixelFormat::Float32,
                )
                .with_edge_policy(
                    EdgePolicy::uniform(EdgeExtend::Hold).with_right(EdgeExtend::Black(0.0)),
                ),
            )
            .unwrap();
        let need = region.next_needed_tile().unwrap();
        let mut guard = cache
            .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
            .unwrap()
            .into_write()
            .unwrap();
        guard.fill(0.75);
        drop(guard);
        region.finished_tile(&need);

        let raster = region.gather(&cache).unwrap();
        // The held left overhang replicates the image edge.
        assert_eq!(raster.get(0, 1, 0), 0.75);
        assert_eq!(raster.get(1, 3, 0), 0.75);
        // Interior untouched.
        assert_eq!(raster.get(2, 0, 0), 0.75);
        assert_eq!(raster.get(5, 2, 0), 0.75);
        // The matted right overhang goes to black.
        assert_eq!(raster.get(6, 1, 0), 0.0);
        assert_eq!(raster.get(7, 3, 0), 0.0);
    }

    #[test]
    fn corners_follow_the_side_policy() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache
            .acquire_region(
                RegionRequest::new(
                    token,
                    Rect::new(-2, -2, 4, 4),
                    Rect::new(0, 0, 4, 4),
                    1,
                    PixelFormat::Float32,
                )
                .with_edge_policy(
                    EdgePolicy::uniform(EdgeExtend::Hold).with_top(EdgeExtend::Black(0.25)),
                ),
            )
            .unwrap();
        let need = region.next_needed_tile().unwrap();
        let mut guard = cache
            .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
            .unwrap()
            .into_write()
            .unwrap();
        guard.fill(0.75);
        drop(guard);
        region.finished_tile(&need);

        let raster = region.gather(&cache).unwrap();
        // Top band carries the matte value.
        assert_eq!(raster.get(3, 0, 0), 0.25);
        // The held left column reads the band above the interior, so
        // the corner follows the top matte.
        assert_eq!(raster.get(0, 0, 0), 0.25);
        assert_eq!(raster.get(0, 3, 0), 0.75);
        assert_eq!(raster.get(3, 3, 0), 0.75);
    }

    #[test]
    fn fully_out_of_bounds_region_needs_no_cooking() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache
            .acquire_region(
                RegionRequest::new(
                    token,
                    Rect::new(10, 10, 14, 14),
                    Rect::new(0, 0, 4, 4),
                    2,
                    PixelFormat::Float32,
                )
                .with_edge(EdgeExtend::Black(0.5)),
            )
            .unwrap();
        assert_eq!(region.cells_total(), 0);
        assert!(region.is_filled());
        assert!(region.next_needed_tile().is_none());

        let raster = region.gather(&cache).unwrap();
        assert_eq!(raster.get(0, 0, 0), 0.5);
        assert_eq!(raster.get(3, 3, 1), 0.5);
        assert_eq!(
            region.constant_value(&cache).unwrap(),
            Some(vec![0.5, 0.5])
        );
    }

    #[test]
    fn constant_verdict_matches_tiles() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache.acquire_region(request_8x8(token)).unwrap();
        while let Some(need) = region.next_needed_tile() {
            let mut guard = cache
                .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
                .unwrap()
                .into_write()
                .unwrap();
            guard.fill(0.5);
            drop(guard);
            region.finished_tile(&need);
        }
        assert_eq!(region.constant_value(&cache).unwrap(), Some(vec![0.5]));
    }

    #[test]
    fn constant_verdict_checks_only_overhanging_sides() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        // Overhangs the right side only.
        let rect = Rect::new(0, 0, 6, 4);
        let bounds = Rect::new(0, 0, 4, 4);
        let region = cache
            .acquire_region(
                RegionRequest::new(token, rect, bounds, 1, PixelFormat::Float32)
                    .with_edge_policy(
                        EdgePolicy::uniform(EdgeExtend::Black(0.0))
                            .with_right(EdgeExtend::Hold),
                    ),
            )
            .unwrap();
        let need = region.next_needed_tile().unwrap();
        let mut guard = cache
            .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
            .unwrap()
            .into_write()
            .unwrap();
        guard.fill(0.75);
        drop(guard);
        region.finished_tile(&need);

        // The non-overhanging black sides put no constraint on the
        // verdict; the held right side extends the constant.
        assert_eq!(region.constant_value(&cache).unwrap(), Some(vec![0.75]));

        // Matting the overhanging side to a different value voids it.
        let matted = cache
            .acquire_region(
                RegionRequest::new(token, rect, bounds, 1, PixelFormat::Float32)
                    .with_edge_policy(
                        EdgePolicy::uniform(EdgeExtend::Hold)
                            .with_right(EdgeExtend::Black(0.0)),
                    ),
            )
            .unwrap();
        assert_eq!(matted.constant_value(&cache).unwrap(), None);
    }

    #[test]
    fn varying_tile_voids_constant_verdict() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache.acquire_region(request_8x8(token)).unwrap();
        let mut first = true;
        while let Some(need) = region.next_needed_tile() {
            let mut guard = cache
                .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
                .unwrap()
                .into_write()
                .unwrap();
            guard.fill(0.5);
            if first {
                guard.set(0, 0, 0.9);
                first = false;
            }
            drop(guard);
            region.finished_tile(&need);
        }
        assert_eq!(region.constant_value(&cache).unwrap(), None);
    }

    #[test]
    fn constant_verdict_is_cached_between_calls() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache.acquire_region(request_8x8(token)).unwrap();
        while let Some(need) = region.next_needed_tile() {
            let mut guard = cache
                .get_or_create(region.tile_key(&need, 0), region.tile_spec(), true, false)
                .unwrap()
                .into_write()
                .unwrap();
            guard.fill(0.5);
            drop(guard);
            region.finished_tile(&need);
        }

        assert_eq!(region.constant_value(&cache).unwrap(), Some(vec![0.5]));
        let hits = cache.statistics().hits;
        // The settled verdict is served without touching the cache.
        assert_eq!(region.constant_value(&cache).unwrap(), Some(vec![0.5]));
        assert_eq!(cache.statistics().hits, hits);

        // Recycling drops the verdict along with the cell state.
        cache.retire_region(region);
        let fresh = cache
            .acquire_region(request_8x8(ImageToken::new(OwnerId::next())))
            .unwrap();
        assert!(matches!(
            fresh.constant_value(&cache),
            Err(RegionError::Incomplete { .. })
        ));
    }

    #[test]
    fn retired_regions_reset_cleanly() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let region = cache.acquire_region(request_8x8(token)).unwrap();
        let _ = region.next_needed_tile();
        cache.retire_region(region);

        // A recycled region starts from scratch.
        let again = cache
            .acquire_region(request_8x8(ImageToken::new(OwnerId::next())))
            .unwrap();
        assert_eq!(again.remaining(), again.cells_total());
        assert_eq!(again.cells_total(), 4);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let cache = cache_4x4();
        let token = ImageToken::new(OwnerId::next());
        let empty = RegionRequest::new(
            token,
            Rect::new(0, 0, 0, 8),
            Rect::new(0, 0, 8, 8),
            1,
            PixelFormat::Float32,
        );
        assert!(matches!(
            cache.acquire_region(empty),
            Err(RegionError::InvalidRequest(_))
        ));
        let no_components = RegionRequest::new(
            token,
            Rect::new(0, 0, 8, 8),
            Rect::new(0, 0, 8, 8),
            0,
            PixelFormat::Float32,
        );
        assert!(matches!(
            cache.acquire_region(no_components),
            Err(RegionError::InvalidRequest(_))
        ));
        let too_many = RegionRequest::new(
            token,
            Rect::new(0, 0, 8, 8),
            Rect::new(0, 0, 8, 8),
            5,
            PixelFormat::Float32,
        );
        assert!(matches!(
            cache.acquire_region(too_many),
            Err(RegionError::InvalidRequest(_))
        ));
    }
}
