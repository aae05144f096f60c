//! Pixel primitives shared by the cache, region, and sampling layers.
//!
//! Everything above this module moves pixels around in one of two shapes:
//!
//! - [`PixelBuffer`]: a typed, format-tagged element vector holding one
//!   component plane of a tile (see [`buffer`]).
//! - [`Raster`]: a flat output buffer assembled from many tiles, with a
//!   selectable component [`Packing`].
//!
//! Integer formats are stored raw and normalized on access through a
//! [`Remap`] (black/white points), so a 12-bit scan stored in `Int16`
//! reads back as `0.0..=1.0` just like float data does.
//!
//! # Coordinates
//!
//! [`Rect`] is half-open: `x0`/`y0` inclusive, `x1`/`y1` exclusive, in
//! signed canvas pixels. An empty intersection is a valid rect with zero
//! area, not an error.

mod buffer;

pub use buffer::PixelBuffer;

use std::fmt;

/// Element storage format of a pixel plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Unsigned 8-bit integer elements.
    Int8,
    /// Unsigned 16-bit integer elements.
    Int16,
    /// Unsigned 32-bit integer elements.
    Int32,
    /// IEEE 754 half-precision float elements.
    Float16,
    /// IEEE 754 single-precision float elements.
    Float32,
}

impl PixelFormat {
    /// Size of one element in bytes.
    pub const fn bytes_per_element(self) -> usize {
        match self {
            PixelFormat::Int8 => 1,
            PixelFormat::Int16 => 2,
            PixelFormat::Int32 => 4,
            PixelFormat::Float16 => 2,
            PixelFormat::Float32 => 4,
        }
    }

    /// True for the integer storage formats, which read through a remap.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            PixelFormat::Int8 | PixelFormat::Int16 | PixelFormat::Int32
        )
    }

    /// The raw element value that maps to white under the full-scale remap.
    pub fn full_scale_white(self) -> f32 {
        match self {
            PixelFormat::Int8 => u8::MAX as f32,
            PixelFormat::Int16 => u16::MAX as f32,
            PixelFormat::Int32 => u32::MAX as f32,
            PixelFormat::Float16 | PixelFormat::Float32 => 1.0,
        }
    }

    /// Stable single-byte tag used by the swap store header.
    pub const fn tag(self) -> u8 {
        match self {
            PixelFormat::Int8 => 1,
            PixelFormat::Int16 => 2,
            PixelFormat::Int32 => 3,
            PixelFormat::Float16 => 4,
            PixelFormat::Float32 => 5,
        }
    }

    /// Inverse of [`PixelFormat::tag`].
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PixelFormat::Int8),
            2 => Some(PixelFormat::Int16),
            3 => Some(PixelFormat::Int32),
            4 => Some(PixelFormat::Float16),
            5 => Some(PixelFormat::Float32),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Int8 => "int8",
            PixelFormat::Int16 => "int16",
            PixelFormat::Int32 => "int32",
            PixelFormat::Float16 => "float16",
            PixelFormat::Float32 => "float32",
        };
        write!(f, "{name}")
    }
}

/// Black/white remap points for integer-format normalization.
///
/// Raw elements map to normalized values with
/// `(raw - black) / (white - black)`. Float formats pass through
/// untouched. A degenerate remap (`white <= black`) normalizes
/// everything to zero rather than dividing by zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Remap {
    pub black: f32,
    pub white: f32,
}

impl Remap {
    pub const IDENTITY: Remap = Remap {
        black: 0.0,
        white: 1.0,
    };

    /// The full-scale remap for a format (e.g. 0..=255 for `Int8`).
    pub fn full_scale(format: PixelFormat) -> Self {
        Remap {
            black: 0.0,
            white: format.full_scale_white(),
        }
    }

    /// Raw element value to normalized.
    pub fn normalize(&self, raw: f32) -> f32 {
        let span = self.white - self.black;
        if span <= 0.0 {
            0.0
        } else {
            (raw - self.black) / span
        }
    }

    /// Normalized value to raw element value.
    pub fn quantize(&self, normalized: f32) -> f32 {
        self.black + normalized * (self.white - self.black)
    }
}

impl Default for Remap {
    fn default() -> Self {
        Remap::IDENTITY
    }
}

/// Component layout of a [`Raster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// `RGBRGB...`, components adjacent per pixel.
    Interleaved,
    /// `RRR...GGG...`, one full plane per component.
    Planar,
}

/// Half-open integer pixel rectangle in canvas space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Rect {
    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Rect { x0, y0, x1, y1 }
    }

    /// Rect anchored at the origin with the given size.
    pub const fn of_size(width: i32, height: i32) -> Self {
        Rect {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
        }
    }

    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y1 - self.y0).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// Intersection with `other`; may be empty.
    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{})x[{},{})",
            self.x0, self.x1, self.y0, self.y1
        )
    }
}

/// Flat pixel output buffer covering a rectangle of canvas space.
///
/// Produced by region gathers and plane filters. The element storage is a
/// single [`PixelBuffer`] whose layout is governed by [`Packing`].
#[derive(Debug, Clone)]
pub struct Raster {
    width: usize,
    height: usize,
    components: usize,
    packing: Packing,
    remap: Remap,
    buffer: PixelBuffer,
}

impl Raster {
    /// Allocate a zero-filled raster.
    pub fn new(
        width: usize,
        height: usize,
        components: usize,
        packing: Packing,
        format: PixelFormat,
        remap: Remap,
    ) -> Self {
        let buffer = PixelBuffer::new(format, width * height * components);
        Raster {
            width,
            height,
            components,
            packing,
            remap,
            buffer,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format()
    }

    pub fn remap(&self) -> Remap {
        self.remap
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    /// Element index of `(x, y, c)` under the raster's packing.
    pub fn index(&self, x: usize, y: usize, c: usize) -> usize {
        match self.packing {
            Packing::Interleaved => (y * self.width + x) * self.components + c,
            Packing::Planar => c * self.width * self.height + y * self.width + x,
        }
    }

    /// Normalized read at `(x, y, c)`. Out-of-range reads return zero.
    pub fn get(&self, x: usize, y: usize, c: usize) -> f32 {
        if x >= self.width || y >= self.height || c >= self.components {
            return 0.0;
        }
        self.buffer.get_f32(self.index(x, y, c), self.remap)
    }

    /// Normalized write at `(x, y, c)`. Out-of-range writes are dropped.
    pub fn set(&mut self, x: usize, y: usize, c: usize, value: f32) {
        if x >= self.width || y >= self.height || c >= self.components {
            return;
        }
        let idx = self.index(x, y, c);
        self.buffer.set_f32(idx, value, self.remap);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
