//! Adaptive progressive-sampling accumulator.
//!
//! An [`AdaptiveImage`] drives a renderer's sampling loop: workers ask
//! it where the next sample should go ([`AdaptiveImage::sample`]),
//! evaluate that sample, and feed the result back
//! ([`AdaptiveImage::insert`]). Selection is weighted by a per-pixel
//! noise estimate, so quiet areas converge with few samples while
//! noisy areas keep drawing effort until they settle or hit the
//! per-pixel cap.
//!
//! # Selection pyramid
//!
//! The image is padded up to a power-of-two square and covered by a
//! quadtree whose leaves are final pixels. Each node stores the
//! selection mass of its subtree, so drawing a pixel is an O(log n)
//! weighted descent and updating one pixel's weight is an O(log n)
//! path refresh. Padding pixels carry zero mass and are never
//! selected. Below pixel resolution the descent continues
//! `sub_pixel_levels` further as pure jitter digits: the returned
//! sample carries a sub-pixel offset with that many bits of
//! stratification per axis.
//!
//! # Per-pixel lifecycle
//!
//! A pixel is eligible while `committed < min_samples`, and after that
//! while its relative noise still exceeds the threshold and
//! `committed < max_samples`. `max_samples` is a hard cap. Once no
//! pixel is eligible the root mass is zero and `sample` returns
//! `None`. Eligibility can come back: an insert that raises a pixel's
//! noise estimate re-arms it, so drivers with samples in flight should
//! poll again after their last insert ([`AdaptiveImage::pending_samples`]).
//!
//! While a pixel has few inserts its own variance estimate is not
//! trustworthy, so its selection weight is blended toward the average
//! weight of its quadtree block (`count_smooth` controls how long).
//! Smoothing only scales the weight of eligible pixels; it never
//! resurrects a converged one.
//!
//! # Concurrency
//!
//! Statistics live in row-band shards, each behind its own lock, and
//! the pyramid sits behind one more. No lock is held while the caller
//! evaluates a sample. Inserts for different pixels run concurrently;
//! ownership of a committed `(x, y, sample_index)` triple belongs to
//! whichever worker got it from `sample`, and exactly one insert may
//! answer it.

mod filter;

pub use filter::PixelFilter;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use thiserror::Error;

use crate::raster::{Packing, PixelFormat, Raster, Remap};

/// Rows per statistics shard.
const SHARD_ROWS: usize = 8;

/// Ceiling on a single pixel's unsmoothed selection weight, so one
/// firefly cannot monopolize the distribution.
const MAX_PIXEL_WEIGHT: f64 = 8.0;

/// Floor for the |mean| denominator in the relative-noise estimate.
const NOISE_EPS: f64 = 1e-4;

#[derive(Error, Debug)]
pub enum AdaptiveError {
    #[error("invalid adaptive configuration: {0}")]
    InvalidConfig(String),

    #[error("pixel ({x}, {y}) is outside the image")]
    OutOfBounds { x: usize, y: usize },

    #[error("sample carries {got} values but the planes define {expected}")]
    WrongArity { expected: usize, got: usize },

    #[error("pixel ({x}, {y}) has no committed sample {sample_index}")]
    UnknownSample { x: usize, y: usize, sample_index: u32 },

    #[error("pixel ({x}, {y}) received more inserts than committed samples")]
    InsertOverflow { x: usize, y: usize },

    #[error("no plane at index {0}")]
    UnknownPlane(usize),
}

/// Sampling parameters.
///
/// Builder-style: start from [`AdaptiveConfig::new`] and chain
/// `with_*` calls.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub width: usize,
    pub height: usize,
    /// Every pixel gets at least this many samples.
    pub min_samples: u32,
    /// No pixel ever gets more than this many. A hard cap.
    pub max_samples: u32,
    /// A pixel past `min_samples` stays eligible while its relative
    /// noise exceeds this.
    pub relative_noise_threshold: f64,
    /// Bits of sub-pixel jitter stratification per axis.
    pub sub_pixel_levels: u32,
    /// Sample magnitudes are clamped to this before squaring, bounding
    /// the variance damage of fireflies.
    pub variance_clamp: f64,
    /// Inserts below this count blend the pixel's weight with its
    /// block average. Zero disables smoothing.
    pub count_smooth: u32,
}

impl AdaptiveConfig {
    pub fn new(width: usize, height: usize) -> Self {
        AdaptiveConfig {
            width,
            height,
            min_samples: 4,
            max_samples: 64,
            relative_noise_threshold: 0.02,
            sub_pixel_levels: 2,
            variance_clamp: 16.0,
            count_smooth: 8,
        }
    }

    pub fn with_samples(mut self, min: u32, max: u32) -> Self {
        self.min_samples = min;
        self.max_samples = max;
        self
    }

    pub fn with_noise_threshold(mut self, threshold: f64) -> Self {
        self.relative_noise_threshold = threshold;
        self
    }

    pub fn with_sub_pixel_levels(mut self, levels: u32) -> Self {
        self.sub_pixel_levels = levels;
        self
    }

    pub fn with_variance_clamp(mut self, clamp: f64) -> Self {
        self.variance_clamp = clamp;
        self
    }

    pub fn with_count_smooth(mut self, count: u32) -> Self {
        self.count_smooth = count;
        self
    }

    pub fn validate(&self) -> Result<(), AdaptiveError> {
        if self.width == 0 || self.height == 0 {
            return Err(AdaptiveError::InvalidConfig(format!(
                "image dimensions {}x{} must be nonzero",
                self.width, self.height
            )));
        }
        if self.min_samples == 0 {
            return Err(AdaptiveError::InvalidConfig(
                "min_samples must be at least 1".to_string(),
            ));
        }
        if self.min_samples > self.max_samples {
            return Err(AdaptiveError::InvalidConfig(format!(
                "min_samples {} exceeds max_samples {}",
                self.min_samples, self.max_samples
            )));
        }
        if !self.relative_noise_threshold.is_finite() || self.relative_noise_threshold < 0.0 {
            return Err(AdaptiveError::InvalidConfig(
                "relative_noise_threshold must be finite and non-negative".to_string(),
            ));
        }
        if !(self.variance_clamp > 0.0) {
            return Err(AdaptiveError::InvalidConfig(
                "variance_clamp must be positive".to_string(),
            ));
        }
        if self.sub_pixel_levels > 16 {
            return Err(AdaptiveError::InvalidConfig(
                "sub_pixel_levels is limited to 16".to_string(),
            ));
        }
        Ok(())
    }
}

/// One output plane of the image.
#[derive(Debug, Clone)]
pub struct AdaptivePlane {
    pub name: String,
    pub components: u16,
    pub filter: PixelFilter,
    /// Whether this plane's values feed the per-pixel noise estimate.
    pub track_variance: bool,
}

impl AdaptivePlane {
    pub fn new(name: impl Into<String>, components: u16, filter: PixelFilter) -> Self {
        AdaptivePlane {
            name: name.into(),
            components,
            filter,
            track_variance: false,
        }
    }

    pub fn with_variance_tracking(mut self, on: bool) -> Self {
        self.track_variance = on;
        self
    }
}

/// Caller-settable circular bias: eligible pixels inside the circle
/// have their selection weight multiplied by `boost`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityRegion {
    pub center_x: f32,
    pub center_y: f32,
    pub radius: f32,
    pub boost: f32,
}

impl PriorityRegion {
    fn contains(&self, x: usize, y: usize) -> bool {
        let dx = (x as f32 + 0.5) - self.center_x;
        let dy = (y as f32 + 0.5) - self.center_y;
        dx * dx + dy * dy <= self.radius * self.radius
    }
}

/// One granted sample: where to evaluate, which slot it fills, and the
/// sub-pixel jitter to evaluate at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSample {
    pub x: usize,
    pub y: usize,
    /// 0-based slot within the pixel; hand it back to `insert`.
    pub sample_index: u32,
    /// Offset within the pixel, each component in (0, 1).
    pub jitter: (f32, f32),
}

#[derive(Debug, Clone, Copy, Default)]
struct PixelCell {
    committed: u32,
    inserted: u32,
    noise_sum: f64,
    noise_sum_sq: f64,
}

/// Per-shard slice of one plane's accumulators.
struct PlaneBand {
    /// Running component sums, `band_rows * width * components`.
    sums: Vec<f64>,
    /// Current winning sample for vetting filters; empty otherwise.
    picks: Vec<f32>,
}

struct Shard {
    /// First image row this shard covers.
    y0: usize,
    cells: Vec<PixelCell>,
    planes: Vec<PlaneBand>,
}

/// Quadtree of selection mass. Leaves are final pixels; every interior
/// node is the sum of its four children.
struct SelectionTree {
    /// `levels[l]` is a `2^l` by `2^l` grid, row-major.
    levels: Vec<Vec<f64>>,
    pixel_level: usize,
}

impl SelectionTree {
    fn new(pixel_level: usize) -> Self {
        let levels = (0..=pixel_level)
            .map(|l| vec![0.0f64; 1usize << (2 * l)])
            .collect();
        SelectionTree {
            levels,
            pixel_level,
        }
    }

    fn total(&self) -> f64 {
        self.levels[0][0]
    }

    fn leaf(&self, x: usize, y: usize) -> f64 {
        let side = 1usize << self.pixel_level;
        self.levels[self.pixel_level][y * side + x]
    }

    /// Average leaf weight of the 2x2 block containing `(x, y)`.
    fn parent_avg(&self, x: usize, y: usize) -> f64 {
        if self.pixel_level == 0 {
            return self.levels[0][0];
        }
        let l = self.pixel_level - 1;
        let side = 1usize << l;
        self.levels[l][(y / 2) * side + (x / 2)] / 4.0
    }

    /// Set one leaf and refresh the path to the root.
    fn set(&mut self, x: usize, y: usize, weight: f64) {
        let side = 1usize << self.pixel_level;
        self.levels[self.pixel_level][y * side + x] = weight;
        let (mut cx, mut cy) = (x, y);
        for l in (0..self.pixel_level).rev() {
            cx /= 2;
            cy /= 2;
            let child_side = 1usize << (l + 1);
            let bx = cx * 2;
            let by = cy * 2;
            let children = &self.levels[l + 1];
            let sum = children[by * child_side + bx]
                + children[by * child_side + bx + 1]
                + children[(by + 1) * child_side + bx]
                + children[(by + 1) * child_side + bx + 1];
            let side_l = 1usize << l;
            self.levels[l][cy * side_l + cx] = sum;
        }
    }

    /// Recompute every interior node from the leaves.
    fn build(&mut self) {
        for l in (0..self.pixel_level).rev() {
            let side = 1usize << l;
            let child_side = side * 2;
            for y in 0..side {
                for x in 0..side {
                    let bx = x * 2;
                    let by = y * 2;
                    let children = &self.levels[l + 1];
                    let sum = children[by * child_side + bx]
                        + children[by * child_side + bx + 1]
                        + children[(by + 1) * child_side + bx]
                        + children[(by + 1) * child_side + bx + 1];
                    self.levels[l][y * side + x] = sum;
                }
            }
        }
    }

    /// Weighted descent from the root to one leaf.
    fn descend(&self, rng: &mut Pcg32) -> Option<(usize, usize)> {
        if !(self.total() > 0.0) {
            return None;
        }
        let (mut x, mut y) = (0usize, 0usize);
        for l in 1..=self.pixel_level {
            let side = 1usize << l;
            let bx = x * 2;
            let by = y * 2;
            let level = &self.levels[l];
            let w = [
                level[by * side + bx],
                level[by * side + bx + 1],
                level[(by + 1) * side + bx],
                level[(by + 1) * side + bx + 1],
            ];
            let sum: f64 = w.iter().sum();
            if !(sum > 0.0) {
                // Stale interior mass from float residue.
                return None;
            }
            let mut u = rng.gen::<f64>() * sum;
            let mut pick = 3;
            for (i, wi) in w.iter().enumerate() {
                if u < *wi {
                    pick = i;
                    break;
                }
                u -= *wi;
            }
            // Rounding can land u past the last child; fall back to
            // the heaviest so a zero-weight child is never entered.
            if w[pick] <= 0.0 {
                pick = w
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
            }
            x = bx + (pick & 1);
            y = by + (pick >> 1);
        }
        Some((x, y))
    }
}

/// Adaptive sampling state for one image.
///
/// See the module docs for the lifecycle. All methods take `&self`;
/// share it between workers behind an `Arc`.
pub struct AdaptiveImage {
    config: AdaptiveConfig,
    planes: Vec<AdaptivePlane>,
    total_components: usize,
    pixel_level: usize,
    shards: Vec<Mutex<Shard>>,
    tree: Mutex<SelectionTree>,
    priority: Mutex<Option<PriorityRegion>>,
    committed_total: AtomicU64,
    inserted_total: AtomicU64,
}

impl AdaptiveImage {
    pub fn new(config: AdaptiveConfig, planes: Vec<AdaptivePlane>) -> Result<Self, AdaptiveError> {
        config.validate()?;
        if planes.is_empty() {
            return Err(AdaptiveError::InvalidConfig(
                "at least one plane is required".to_string(),
            ));
        }
        for plane in &planes {
            if plane.components == 0 {
                return Err(AdaptiveError::InvalidConfig(format!(
                    "plane '{}' has zero components",
                    plane.name
                )));
            }
        }
        let total_components = planes.iter().map(|p| p.components as usize).sum();
        let side = config.width.max(config.height).next_power_of_two();
        let pixel_level = side.trailing_zeros() as usize;

        let width = config.width;
        let height = config.height;
        let mut shards = Vec::new();
        let mut y0 = 0;
        while y0 < height {
            let rows = SHARD_ROWS.min(height - y0);
            let pixels = rows * width;
            let bands = planes
                .iter()
                .map(|p| {
                    let nc = p.components as usize;
                    PlaneBand {
                        sums: vec![0.0; pixels * nc],
                        picks: if p.filter.is_vetting() {
                            vec![0.0; pixels * nc]
                        } else {
                            Vec::new()
                        },
                    }
                })
                .collect();
            shards.push(Mutex::new(Shard {
                y0,
                cells: vec![PixelCell::default(); pixels],
                planes: bands,
            }));
            y0 += rows;
        }

        // Every real pixel starts in the minimum-coverage phase with
        // unit weight; padding stays at zero.
        let mut tree = SelectionTree::new(pixel_level);
        {
            let leaf_side = 1usize << pixel_level;
            let leaves = &mut tree.levels[pixel_level];
            for y in 0..height {
                for x in 0..width {
                    leaves[y * leaf_side + x] = 1.0;
                }
            }
        }
        tree.build();

        Ok(AdaptiveImage {
            config,
            planes,
            total_components,
            pixel_level,
            shards,
            tree: Mutex::new(tree),
            priority: Mutex::new(None),
            committed_total: AtomicU64::new(0),
            inserted_total: AtomicU64::new(0),
        })
    }

    pub fn width(&self) -> usize {
        self.config.width
    }

    pub fn height(&self) -> usize {
        self.config.height
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub fn planes(&self) -> &[AdaptivePlane] {
        &self.planes
    }

    pub fn plane_index(&self, name: &str) -> Option<usize> {
        self.planes.iter().position(|p| p.name == name)
    }

    /// Number of values one insert must carry: the sum of all plane
    /// component counts.
    pub fn sample_arity(&self) -> usize {
        self.total_components
    }

    /// Samples granted so far.
    pub fn total_committed(&self) -> u64 {
        self.committed_total.load(Ordering::Relaxed)
    }

    /// Samples inserted so far.
    pub fn total_inserted(&self) -> u64 {
        self.inserted_total.load(Ordering::Relaxed)
    }

    /// Granted samples not yet answered by an insert.
    pub fn pending_samples(&self) -> u64 {
        self.total_committed()
            .saturating_sub(self.total_inserted())
    }

    /// Whether no pixel is currently eligible. Inserts can re-arm
    /// pixels, so pair this with [`AdaptiveImage::pending_samples`]
    /// when deciding to stop.
    pub fn converged(&self) -> bool {
        !(self.tree.lock().total() > 0.0)
    }

    fn shard_of(&self, y: usize) -> usize {
        y / SHARD_ROWS
    }

    fn cell_index(&self, shard: &Shard, x: usize, y: usize) -> usize {
        (y - shard.y0) * self.config.width + x
    }

    /// The double eligibility condition.
    fn is_eligible(&self, cell: &PixelCell) -> bool {
        if cell.committed < self.config.min_samples {
            return true;
        }
        if cell.committed >= self.config.max_samples {
            return false;
        }
        if cell.inserted == 0 {
            // All data is in flight; wait for inserts before granting
            // more.
            return false;
        }
        self.rel_noise(cell) > self.config.relative_noise_threshold
    }

    /// Standard error of the noise scalar relative to its mean.
    /// Pixels with fewer than two inserts report zero.
    fn rel_noise(&self, cell: &PixelCell) -> f64 {
        let n = cell.inserted as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mean = cell.noise_sum / n;
        let var = ((cell.noise_sum_sq / n) - mean * mean).max(0.0) * (n / (n - 1.0));
        let stderr = (var / n).sqrt();
        stderr / mean.abs().max(NOISE_EPS)
    }

    /// Unsmoothed selection weight plus whether block smoothing may
    /// apply. Zero exactly when the pixel is ineligible.
    fn local_weight(&self, cell: &PixelCell) -> (f64, bool) {
        if cell.committed < self.config.min_samples {
            return (1.0, false);
        }
        if cell.committed >= self.config.max_samples || cell.inserted == 0 {
            return (0.0, false);
        }
        let rel = self.rel_noise(cell);
        if rel <= self.config.relative_noise_threshold {
            return (0.0, false);
        }
        (rel.min(MAX_PIXEL_WEIGHT), true)
    }

    /// Publish one pixel's weight into the tree, applying block
    /// smoothing and the priority boost.
    fn store_weight(&self, x: usize, y: usize, weight: f64, smoothable: bool, inserted: u32) {
        let region = *self.priority.lock();
        let mut tree = self.tree.lock();
        let mut w = weight;
        let cs = self.config.count_smooth;
        if smoothable && cs > 0 && inserted < cs {
            let lambda = inserted as f64 / cs as f64;
            w = w * lambda + tree.parent_avg(x, y) * (1.0 - lambda);
        }
        if w > 0.0 {
            if let Some(region) = region {
                if region.contains(x, y) {
                    w *= region.boost as f64;
                }
            }
        }
        tree.set(x, y, w);
    }

    /// Draw the next sample location.
    ///
    /// Seeded per call: the same seed against the same state yields
    /// the same result. Returns `None` when no pixel is eligible.
    pub fn sample(&self, seed: u64) -> Option<PixelSample> {
        let mut rng = Pcg32::seed_from_u64(seed);
        loop {
            let (x, y) = self.tree.lock().descend(&mut rng)?;
            let (granted, weight, smoothable, inserted, sample_index) = {
                let mut shard = self.shards[self.shard_of(y)].lock();
                let idx = self.cell_index(&shard, x, y);
                let cell = &mut shard.cells[idx];
                if self.is_eligible(cell) {
                    let sample_index = cell.committed;
                    cell.committed += 1;
                    let (w, smooth) = self.local_weight(cell);
                    (true, w, smooth, cell.inserted, sample_index)
                } else {
                    // The tree held a stale positive weight; zero it
                    // and redraw.
                    (false, 0.0, false, cell.inserted, 0)
                }
            };
            self.store_weight(x, y, weight, smoothable, inserted);
            if granted {
                self.committed_total.fetch_add(1, Ordering::Relaxed);
                let jitter = Self::jitter(&mut rng, self.config.sub_pixel_levels);
                return Some(PixelSample {
                    x,
                    y,
                    sample_index,
                    jitter,
                });
            }
        }
    }

    /// Quaternary jitter digits, one pair per sub-pixel level, centered
    /// in the final cell.
    fn jitter(rng: &mut Pcg32, levels: u32) -> (f32, f32) {
        let mut jx = 0.0f32;
        let mut jy = 0.0f32;
        let mut scale = 0.5f32;
        for _ in 0..levels {
            let q: u32 = rng.gen_range(0..4);
            if q & 1 == 1 {
                jx += scale;
            }
            if q & 2 == 2 {
                jy += scale;
            }
            scale *= 0.5;
        }
        (jx + scale, jy + scale)
    }

    /// Record one evaluated sample.
    ///
    /// `values` carries every plane's components in declaration order.
    /// The `(x, y, sample_index)` triple must come from a granted
    /// [`AdaptiveImage::sample`], and each triple may be inserted once.
    pub fn insert(
        &self,
        x: usize,
        y: usize,
        sample_index: u32,
        values: &[f32],
    ) -> Result<(), AdaptiveError> {
        if x >= self.config.width || y >= self.config.height {
            return Err(AdaptiveError::OutOfBounds { x, y });
        }
        if values.len() != self.total_components {
            return Err(AdaptiveError::WrongArity {
                expected: self.total_components,
                got: values.len(),
            });
        }
        let (weight, smoothable, inserted) = {
            let mut shard = self.shards[self.shard_of(y)].lock();
            let idx = self.cell_index(&shard, x, y);
            let committed = shard.cells[idx].committed;
            if sample_index >= committed {
                return Err(AdaptiveError::UnknownSample { x, y, sample_index });
            }
            if shard.cells[idx].inserted >= committed {
                return Err(AdaptiveError::InsertOverflow { x, y });
            }
            shard.cells[idx].inserted += 1;
            let n = shard.cells[idx].inserted;

            let mut noise_acc = 0.0f64;
            let mut noise_n = 0usize;
            let mut off = 0usize;
            for (p, plane) in self.planes.iter().enumerate() {
                let nc = plane.components as usize;
                let sample = &values[off..off + nc];
                let base = idx * nc;
                let band = &mut shard.planes[p];
                for (c, v) in sample.iter().enumerate() {
                    band.sums[base + c] += *v as f64;
                }
                if plane.filter.is_vetting() {
                    let mean = band.sums[base..base + nc].iter().sum::<f64>()
                        / (n as f64 * nc as f64);
                    plane.filter.combine_sample(
                        &mut band.picks[base..base + nc],
                        sample,
                        mean,
                        n == 1,
                    );
                }
                if plane.track_variance {
                    for v in sample {
                        noise_acc += *v as f64;
                    }
                    noise_n += nc;
                }
                off += nc;
            }
            if noise_n > 0 {
                let s = noise_acc / noise_n as f64;
                let clamped = s.clamp(-self.config.variance_clamp, self.config.variance_clamp);
                let cell = &mut shard.cells[idx];
                cell.noise_sum += s;
                cell.noise_sum_sq += clamped * clamped;
            }
            let (w, smooth) = self.local_weight(&shard.cells[idx]);
            (w, smooth, n)
        };
        self.inserted_total.fetch_add(1, Ordering::Relaxed);
        self.store_weight(x, y, weight, smoothable, inserted);
        Ok(())
    }

    /// Install or clear the circular priority bias, rebuilding every
    /// pixel's weight. The boost never makes an ineligible pixel
    /// selectable.
    pub fn set_priority_region(
        &self,
        region: Option<PriorityRegion>,
    ) -> Result<(), AdaptiveError> {
        if let Some(r) = region {
            if !(r.boost > 0.0) || !(r.radius >= 0.0) {
                return Err(AdaptiveError::InvalidConfig(format!(
                    "priority region radius {} / boost {} out of range",
                    r.radius, r.boost
                )));
            }
        }
        *self.priority.lock() = region;
        self.rebuild_weights();
        Ok(())
    }

    /// Recompute every leaf weight from current statistics. Smoothing
    /// is skipped here; subsequent inserts restore it.
    fn rebuild_weights(&self) {
        let region = *self.priority.lock();
        let width = self.config.width;
        let mut fresh: Vec<(usize, usize, f64)> = Vec::with_capacity(width * self.config.height);
        for shard in &self.shards {
            let shard = shard.lock();
            for (idx, cell) in shard.cells.iter().enumerate() {
                let x = idx % width;
                let y = shard.y0 + idx / width;
                let (mut w, _) = self.local_weight(cell);
                if w > 0.0 {
                    if let Some(region) = region {
                        if region.contains(x, y) {
                            w *= region.boost as f64;
                        }
                    }
                }
                fresh.push((x, y, w));
            }
        }
        let mut tree = self.tree.lock();
        let side = 1usize << self.pixel_level;
        for (x, y, w) in fresh {
            tree.levels[self.pixel_level][y * side + x] = w;
        }
        tree.build();
    }

    /// Reduce one plane to a raster via its filter.
    ///
    /// Pure read: calling it twice without intervening inserts yields
    /// bit-identical output. Pixels with no inserts read as zero.
    pub fn filter_plane(&self, plane_index: usize) -> Result<Raster, AdaptiveError> {
        let plane = self
            .planes
            .get(plane_index)
            .ok_or(AdaptiveError::UnknownPlane(plane_index))?;
        let nc = plane.components as usize;
        let width = self.config.width;
        let height = self.config.height;
        let mut out = Raster::new(
            width,
            height,
            nc,
            Packing::Interleaved,
            PixelFormat::Float32,
            Remap::full_scale(PixelFormat::Float32),
        );

        match plane.filter {
            PixelFilter::Mean => {
                self.for_each_pixel(plane_index, |x, y, cell, band, base, out_ref| {
                    let n = cell.inserted;
                    for c in 0..nc {
                        let v = if n > 0 {
                            (band.sums[base + c] / n as f64) as f32
                        } else {
                            0.0
                        };
                        out_ref.set(x, y, c, v);
                    }
                }, &mut out);
            }
            PixelFilter::Minimum | PixelFilter::Maximum | PixelFilter::MostDistinct => {
                self.for_each_pixel(plane_index, |x, y, cell, band, base, out_ref| {
                    for c in 0..nc {
                        let v = if cell.inserted > 0 {
                            band.picks[base + c]
                        } else {
                            0.0
                        };
                        out_ref.set(x, y, c, v);
                    }
                }, &mut out);
            }
            PixelFilter::SampleCount => {
                self.for_each_pixel(plane_index, |x, y, cell, _band, _base, out_ref| {
                    for c in 0..nc {
                        out_ref.set(x, y, c, cell.inserted as f32);
                    }
                }, &mut out);
            }
            PixelFilter::NoiseRatio => {
                self.for_each_pixel(plane_index, |x, y, cell, _band, _base, out_ref| {
                    let rel = self.rel_noise(cell) as f32;
                    for c in 0..nc {
                        out_ref.set(x, y, c, rel);
                    }
                }, &mut out);
            }
            PixelFilter::BlockMean { level } => {
                let k = (level as usize).min(self.pixel_level);
                let block = 1usize << k;
                let bw = width.div_ceil(block);
                let bh = height.div_ceil(block);
                let mut block_sums = vec![0.0f64; bw * bh * nc];
                let mut block_counts = vec![0u64; bw * bh];
                for shard in &self.shards {
                    let shard = shard.lock();
                    let band = &shard.planes[plane_index];
                    for (idx, cell) in shard.cells.iter().enumerate() {
                        let x = idx % width;
                        let y = shard.y0 + idx / width;
                        let b = (y / block) * bw + x / block;
                        block_counts[b] += cell.inserted as u64;
                        for c in 0..nc {
                            block_sums[b * nc + c] += band.sums[idx * nc + c];
                        }
                    }
                }
                for y in 0..height {
                    for x in 0..width {
                        let b = (y / block) * bw + x / block;
                        let n = block_counts[b];
                        for c in 0..nc {
                            let v = if n > 0 {
                                (block_sums[b * nc + c] / n as f64) as f32
                            } else {
                                0.0
                            };
                            out.set(x, y, c, v);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Visit every pixel of one plane under its shard lock.
    fn for_each_pixel<F>(&self, plane_index: usize, mut visit: F, out: &mut Raster)
    where
        F: FnMut(usize, usize, &PixelCell, &PlaneBand, usize, &mut Raster),
    {
        let width = self.config.width;
        let nc = self.planes[plane_index].components as usize;
        for shard in &self.shards {
            let shard = shard.lock();
            let band = &shard.planes[plane_index];
            for (idx, cell) in shard.cells.iter().enumerate() {
                let x = idx % width;
                let y = shard.y0 + idx / width;
                visit(x, y, cell, band, idx * nc, out);
            }
        }
    }
}

impl std::fmt::Debug for AdaptiveImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveImage")
            .field("width", &self.config.width)
            .field("height", &self.config.height)
            .field("planes", &self.planes.len())
            .field("committed", &self.total_committed())
            .field("inserted", &self.total_inserted())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn beauty_plane() -> AdaptivePlane {
        AdaptivePlane::new("beauty", 1, PixelFilter::Mean).with_variance_tracking(true)
    }

    /// Sample/insert in lockstep until `sample` returns `None`,
    /// broadcasting one value across every plane component.
    fn drive_to_convergence<F>(image: &AdaptiveImage, mut value_for: F) -> u64
    where
        F: FnMut(&PixelSample) -> f32,
    {
        let arity = image.sample_arity();
        let mut seed = 0u64;
        let mut granted = 0u64;
        loop {
            seed += 1;
            match image.sample(seed) {
                Some(s) => {
                    granted += 1;
                    let values = vec![value_for(&s); arity];
                    image.insert(s.x, s.y, s.sample_index, &values).unwrap();
                }
                None => return granted,
            }
        }
    }

    #[test]
    fn config_validation_catches_nonsense() {
        assert!(AdaptiveConfig::new(0, 4).validate().is_err());
        assert!(AdaptiveConfig::new(4, 4)
            .with_samples(0, 8)
            .validate()
            .is_err());
        assert!(AdaptiveConfig::new(4, 4)
            .with_samples(9, 8)
            .validate()
            .is_err());
        assert!(AdaptiveConfig::new(4, 4)
            .with_noise_threshold(-1.0)
            .validate()
            .is_err());
        assert!(AdaptiveConfig::new(4, 4).validate().is_ok());

        assert!(AdaptiveImage::new(AdaptiveConfig::new(4, 4), vec![]).is_err());
        assert!(AdaptiveImage::new(
            AdaptiveConfig::new(4, 4),
            vec![AdaptivePlane::new("bad", 0, PixelFilter::Mean)]
        )
        .is_err());
    }

    #[test]
    fn zero_variance_image_stops_exactly_at_min_samples() {
        let config = AdaptiveConfig::new(4, 4).with_samples(5, 20);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        let granted = drive_to_convergence(&image, |_| 1.0);
        assert_eq!(granted, 4 * 4 * 5);
        assert!(image.converged());
        assert_eq!(image.pending_samples(), 0);
    }

    #[test]
    fn noisy_pixels_run_to_the_hard_cap() {
        let config = AdaptiveConfig::new(4, 4)
            .with_samples(4, 12)
            .with_noise_threshold(0.01)
            .with_count_smooth(0);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        // Alternating values per pixel slot: mean 1, plenty of noise.
        let granted =
            drive_to_convergence(&image, |s| if s.sample_index % 2 == 0 { 0.0 } else { 2.0 });
        assert_eq!(granted, 4 * 4 * 12);
        assert!(image.converged());
    }

    #[test]
    fn padding_pixels_are_never_sampled() {
        // 5x3 pads to 8x8; only the 15 real pixels may appear.
        let config = AdaptiveConfig::new(5, 3).with_samples(2, 8);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        let granted = drive_to_convergence(&image, |s| {
            assert!(s.x < 5 && s.y < 3, "sampled padding pixel ({}, {})", s.x, s.y);
            0.5
        });
        assert_eq!(granted, 5 * 3 * 2);
    }

    #[test]
    fn sample_indices_count_up_per_pixel() {
        let config = AdaptiveConfig::new(2, 2).with_samples(3, 8);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        let mut seen = std::collections::HashMap::new();
        drive_to_convergence(&image, |s| {
            let next = seen.entry((s.x, s.y)).or_insert(0u32);
            assert_eq!(s.sample_index, *next);
            *next += 1;
            1.0
        });
        assert!(seen.values().all(|n| *n == 3));
    }

    #[test]
    fn jitter_is_centered_and_stratified() {
        let config = AdaptiveConfig::new(2, 2).with_samples(1, 4).with_sub_pixel_levels(0);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        let s = image.sample(7).unwrap();
        assert_eq!(s.jitter, (0.5, 0.5));

        let config = AdaptiveConfig::new(2, 2).with_samples(4, 8).with_sub_pixel_levels(2);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        for seed in 0..16 {
            if let Some(s) = image.sample(seed) {
                let (jx, jy) = s.jitter;
                assert!(jx > 0.0 && jx < 1.0);
                assert!(jy > 0.0 && jy < 1.0);
                // Two levels leave eighth-aligned centers.
                assert_eq!((jx * 8.0).fract(), 0.0);
                assert_eq!((jy * 8.0).fract(), 0.0);
                image.insert(s.x, s.y, s.sample_index, &[1.0]).unwrap();
            }
        }
    }

    #[test]
    fn same_seed_same_state_is_deterministic() {
        let build = || {
            AdaptiveImage::new(
                AdaptiveConfig::new(4, 4).with_samples(2, 8),
                vec![beauty_plane()],
            )
            .unwrap()
        };
        let a = build();
        let b = build();
        for seed in 0..32 {
            let sa = a.sample(seed);
            let sb = b.sample(seed);
            assert_eq!(sa, sb);
            if let Some(s) = sa {
                a.insert(s.x, s.y, s.sample_index, &[0.25]).unwrap();
                b.insert(s.x, s.y, s.sample_index, &[0.25]).unwrap();
            }
        }
    }

    #[test]
    fn insert_validates_its_arguments() {
        let image = AdaptiveImage::new(
            AdaptiveConfig::new(2, 2).with_samples(2, 4),
            vec![beauty_plane()],
        )
        .unwrap();
        assert!(matches!(
            image.insert(5, 0, 0, &[1.0]),
            Err(AdaptiveError::OutOfBounds { .. })
        ));
        assert!(matches!(
            image.insert(0, 0, 0, &[1.0, 2.0]),
            Err(AdaptiveError::WrongArity { expected: 1, got: 2 })
        ));
        // Nothing committed yet at (0, 0).
        assert!(matches!(
            image.insert(0, 0, 0, &[1.0]),
            Err(AdaptiveError::UnknownSample { .. })
        ));

        let s = image.sample(3).unwrap();
        image.insert(s.x, s.y, s.sample_index, &[1.0]).unwrap();
        // The slot is spent.
        assert!(matches!(
            image.insert(s.x, s.y, s.sample_index, &[1.0]),
            Err(AdaptiveError::InsertOverflow { .. })
        ));
    }

    #[test]
    fn priority_region_biases_selection() {
        let config = AdaptiveConfig::new(8, 8).with_samples(8, 16);
        let image = AdaptiveImage::new(config, vec![beauty_plane()]).unwrap();
        image
            .set_priority_region(Some(PriorityRegion {
                center_x: 2.0,
                center_y: 2.0,
                radius: 1.5,
                boost: 64.0,
            }))
            .unwrap();
        let mut inside = 0;
        let mut outside = 0;
        for seed in 0..20 {
            let s = image.sample(seed).unwrap();
            let dx = (s.x as f32 + 0.5) - 2.0;
            let dy = (s.y as f32 + 0.5) - 2.0;
            if dx * dx + dy * dy <= 1.5 * 1.5 {
                inside += 1;
            } else {
                outside += 1;
            }
        }
        assert!(inside > outside, "inside={inside} outside={outside}");

        assert!(image
            .set_priority_region(Some(PriorityRegion {
                center_x: 0.0,
                center_y: 0.0,
                radius: 1.0,
                boost: 0.0,
            }))
            .is_err());
    }

    #[test]
    fn mean_filter_averages_inserts() {
        let image = AdaptiveImage::new(
            AdaptiveConfig::new(2, 1).with_samples(2, 2),
            vec![beauty_plane()],
        )
        .unwrap();
        drive_to_convergence(&image, |s| if s.sample_index == 0 { 1.0 } else { 3.0 });
        let raster = image.filter_plane(0).unwrap();
        assert_eq!(raster.get(0, 0, 0), 2.0);
        assert_eq!(raster.get(1, 0, 0), 2.0);
    }

    #[test]
    fn vetting_filters_keep_their_winner() {
        let planes = vec![
            AdaptivePlane::new("value", 1, PixelFilter::Mean).with_variance_tracking(true),
            AdaptivePlane::new("low", 1, PixelFilter::Minimum),
            AdaptivePlane::new("high", 1, PixelFilter::Maximum),
        ];
        let image =
            AdaptiveImage::new(AdaptiveConfig::new(1, 1).with_samples(3, 6), planes).unwrap();
        let values = [2.0f32, 5.0, -1.0];
        let mut k = 0usize;
        let mut seed = 0u64;
        while k < 3 {
            seed += 1;
            if let Some(s) = image.sample(seed) {
                let v = values[k];
                image.insert(s.x, s.y, s.sample_index, &[v, v, v]).unwrap();
                k += 1;
            } else {
                break;
            }
        }
        let low = image.filter_plane(1).unwrap();
        let high = image.filter_plane(2).unwrap();
        assert_eq!(low.get(0, 0, 0), -1.0);
        assert_eq!(high.get(0, 0, 0), 5.0);
    }

    #[test]
    fn sample_count_and_block_mean_views() {
        let planes = vec![
            AdaptivePlane::new("value", 1, PixelFilter::Mean).with_variance_tracking(true),
            AdaptivePlane::new("count", 1, PixelFilter::SampleCount),
            AdaptivePlane::new("blocks", 1, PixelFilter::BlockMean { level: 1 }),
        ];
        let image =
            AdaptiveImage::new(AdaptiveConfig::new(2, 2).with_samples(2, 4), planes).unwrap();
        drive_to_convergence(&image, |s| (s.x + s.y) as f32);

        let counts = image.filter_plane(1).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(counts.get(x, y, 0), 2.0);
            }
        }
        // One 2x2 block: its mean is the average of all pixel values.
        let blocks = image.filter_plane(2).unwrap();
        let expected = (0.0 + 1.0 + 1.0 + 2.0) / 4.0;
        assert_eq!(blocks.get(0, 0, 0), expected);
        assert_eq!(blocks.get(1, 1, 0), expected);
    }

    #[test]
    fn noise_ratio_is_zero_for_constant_pixels() {
        let planes = vec![
            AdaptivePlane::new("value", 1, PixelFilter::Mean).with_variance_tracking(true),
            AdaptivePlane::new("noise", 1, PixelFilter::NoiseRatio),
        ];
        let image =
            AdaptiveImage::new(AdaptiveConfig::new(2, 2).with_samples(3, 6), planes).unwrap();
        drive_to_convergence(&image, |_| 0.75);
        let noise = image.filter_plane(1).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(noise.get(x, y, 0), 0.0);
            }
        }
    }

    #[test]
    fn filter_plane_is_idempotent() {
        let image = AdaptiveImage::new(
            AdaptiveConfig::new(4, 4).with_samples(3, 8).with_noise_threshold(0.001),
            vec![beauty_plane()],
        )
        .unwrap();
        drive_to_convergence(&image, |s| (s.sample_index as f32) * 0.37 + s.x as f32);
        let a = image.filter_plane(0).unwrap();
        let b = image.filter_plane(0).unwrap();
        assert_eq!(a.buffer(), b.buffer());
    }

    #[test]
    fn unknown_plane_is_an_error() {
        let image = AdaptiveImage::new(AdaptiveConfig::new(2, 2), vec![beauty_plane()]).unwrap();
        assert!(matches!(
            image.filter_plane(3),
            Err(AdaptiveError::UnknownPlane(3))
        ));
        assert_eq!(image.plane_index("beauty"), Some(0));
        assert_eq!(image.plane_index("missing"), None);
    }
}
