//! Typed element storage for one component plane.

use half::f16;
use std::collections::TryReserveError;

use super::{PixelFormat, Remap};

/// A format-tagged element vector.
///
/// One `PixelBuffer` holds one component plane of one tile (or one
/// assembled raster). Elements are stored raw; normalized access goes
/// through a [`Remap`]. The length is fixed at allocation and never
/// changes, which keeps cache byte accounting exact.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    Int8(Vec<u8>),
    Int16(Vec<u16>),
    Int32(Vec<u32>),
    Float16(Vec<f16>),
    Float32(Vec<f32>),
}

impl PixelBuffer {
    /// Allocate a zero-filled buffer of `len` elements.
    pub fn new(format: PixelFormat, len: usize) -> Self {
        match format {
            PixelFormat::Int8 => PixelBuffer::Int8(vec![0; len]),
            PixelFormat::Int16 => PixelBuffer::Int16(vec![0; len]),
            PixelFormat::Int32 => PixelBuffer::Int32(vec![0; len]),
            PixelFormat::Float16 => PixelBuffer::Float16(vec![f16::ZERO; len]),
            PixelFormat::Float32 => PixelBuffer::Float32(vec![0.0; len]),
        }
    }

    /// Fallible allocation for the cache's tile creation path.
    ///
    /// Uses `try_reserve_exact` so an oversized request surfaces as an
    /// error instead of aborting the process.
    pub fn try_new(format: PixelFormat, len: usize) -> Result<Self, TryReserveError> {
        fn alloc<T: Clone>(len: usize, zero: T) -> Result<Vec<T>, TryReserveError> {
            let mut v = Vec::new();
            v.try_reserve_exact(len)?;
            v.resize(len, zero);
            Ok(v)
        }
        Ok(match format {
            PixelFormat::Int8 => PixelBuffer::Int8(alloc(len, 0u8)?),
            PixelFormat::Int16 => PixelBuffer::Int16(alloc(len, 0u16)?),
            PixelFormat::Int32 => PixelBuffer::Int32(alloc(len, 0u32)?),
            PixelFormat::Float16 => PixelBuffer::Float16(alloc(len, f16::ZERO)?),
            PixelFormat::Float32 => PixelBuffer::Float32(alloc(len, 0.0f32)?),
        })
    }

    /// Zero-length placeholder. Used where a buffer slot must hold
    /// something after its contents were moved out.
    pub const fn empty() -> Self {
        PixelBuffer::Int8(Vec::new())
    }

    pub fn format(&self) -> PixelFormat {
        match self {
            PixelBuffer::Int8(_) => PixelFormat::Int8,
            PixelBuffer::Int16(_) => PixelFormat::Int16,
            PixelBuffer::Int32(_) => PixelFormat::Int32,
            PixelBuffer::Float16(_) => PixelFormat::Float16,
            PixelBuffer::Float32(_) => PixelFormat::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::Int8(v) => v.len(),
            PixelBuffer::Int16(v) => v.len(),
            PixelBuffer::Int32(v) => v.len(),
            PixelBuffer::Float16(v) => v.len(),
            PixelBuffer::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.len() * self.format().bytes_per_element()
    }

    /// Raw element value as `f32`. Out-of-range reads return zero.
    pub fn get_raw(&self, i: usize) -> f32 {
        match self {
            PixelBuffer::Int8(v) => v.get(i).map(|&x| x as f32).unwrap_or(0.0),
            PixelBuffer::Int16(v) => v.get(i).map(|&x| x as f32).unwrap_or(0.0),
            PixelBuffer::Int32(v) => v.get(i).map(|&x| x as f32).unwrap_or(0.0),
            PixelBuffer::Float16(v) => v.get(i).map(|x| x.to_f32()).unwrap_or(0.0),
            PixelBuffer::Float32(v) => v.get(i).copied().unwrap_or(0.0),
        }
    }

    /// Raw element write. Integer formats round and saturate; out-of-range
    /// writes are dropped.
    pub fn set_raw(&mut self, i: usize, raw: f32) {
        match self {
            PixelBuffer::Int8(v) => {
                if let Some(slot) = v.get_mut(i) {
                    *slot = raw.round() as u8;
                }
            }
            PixelBuffer::Int16(v) => {
                if let Some(slot) = v.get_mut(i) {
                    *slot = raw.round() as u16;
                }
            }
            PixelBuffer::Int32(v) => {
                if let Some(slot) = v.get_mut(i) {
                    *slot = raw.round() as u32;
                }
            }
            PixelBuffer::Float16(v) => {
                if let Some(slot) = v.get_mut(i) {
                    *slot = f16::from_f32(raw);
                }
            }
            PixelBuffer::Float32(v) => {
                if let Some(slot) = v.get_mut(i) {
                    *slot = raw;
                }
            }
        }
    }

    /// Normalized read through a remap. Float formats ignore the remap.
    pub fn get_f32(&self, i: usize, remap: Remap) -> f32 {
        let raw = self.get_raw(i);
        if self.format().is_integer() {
            remap.normalize(raw)
        } else {
            raw
        }
    }

    /// Normalized write through a remap. Float formats ignore the remap.
    pub fn set_f32(&mut self, i: usize, value: f32, remap: Remap) {
        let raw = if self.format().is_integer() {
            remap.quantize(value)
        } else {
            value
        };
        self.set_raw(i, raw);
    }

    /// Fill every element with the raw value.
    pub fn fill_raw(&mut self, raw: f32) {
        match self {
            PixelBuffer::Int8(v) => v.fill(raw.round() as u8),
            PixelBuffer::Int16(v) => v.fill(raw.round() as u16),
            PixelBuffer::Int32(v) => v.fill(raw.round() as u32),
            PixelBuffer::Float16(v) => v.fill(f16::from_f32(raw)),
            PixelBuffer::Float32(v) => v.fill(raw),
        }
    }

    /// Fill every element with a normalized value through a remap.
    pub fn fill_f32(&mut self, value: f32, remap: Remap) {
        if self.format().is_integer() {
            self.fill_raw(remap.quantize(value));
        } else {
            self.fill_raw(value);
        }
    }

    /// Returns the raw value all elements share, or `None` if the buffer
    /// is empty or holds more than one distinct value.
    pub fn uniform_value(&self) -> Option<f32> {
        fn scan<T: PartialEq + Copy>(v: &[T], to_f32: impl Fn(T) -> f32) -> Option<f32> {
            let first = *v.first()?;
            if v.iter().all(|&x| x == first) {
                Some(to_f32(first))
            } else {
                None
            }
        }
        match self {
            PixelBuffer::Int8(v) => scan(v, |x| x as f32),
            PixelBuffer::Int16(v) => scan(v, |x| x as f32),
            PixelBuffer::Int32(v) => scan(v, |x| x as f32),
            PixelBuffer::Float16(v) => scan(v, |x| x.to_f32()),
            PixelBuffer::Float32(v) => scan(v, |x| x),
        }
    }

    /// Copy `len` elements from `src` starting at `src_off` into `self`
    /// at `dst_off`. Returns `false` without copying when the formats
    /// differ or either range is out of bounds.
    pub fn copy_from(
        &mut self,
        dst_off: usize,
        src: &PixelBuffer,
        src_off: usize,
        len: usize,
    ) -> bool {
        fn copy<T: Copy>(dst: &mut [T], d: usize, src: &[T], s: usize, len: usize) -> bool {
            if d + len > dst.len() || s + len > src.len() {
                return false;
            }
            dst[d..d + len].copy_from_slice(&src[s..s + len]);
            true
        }
        match (self, src) {
            (PixelBuffer::Int8(d), PixelBuffer::Int8(s)) => copy(d, dst_off, s, src_off, len),
            (PixelBuffer::Int16(d), PixelBuffer::Int16(s)) => copy(d, dst_off, s, src_off, len),
            (PixelBuffer::Int32(d), PixelBuffer::Int32(s)) => copy(d, dst_off, s, src_off, len),
            (PixelBuffer::Float16(d), PixelBuffer::Float16(s)) => copy(d, dst_off, s, src_off, len),
            (PixelBuffer::Float32(d), PixelBuffer::Float32(s)) => copy(d, dst_off, s, src_off, len),
            _ => false,
        }
    }

    /// Serialize elements as little-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size());
        match self {
            PixelBuffer::Int8(v) => out.extend_from_slice(v),
            PixelBuffer::Int16(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            PixelBuffer::Int32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            PixelBuffer::Float16(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            PixelBuffer::Float32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
        out
    }

    /// Deserialize little-endian bytes. Returns `None` when `bytes` is not
    /// a whole number of elements.
    pub fn from_bytes(format: PixelFormat, bytes: &[u8]) -> Option<Self> {
        let elem = format.bytes_per_element();
        if bytes.len() % elem != 0 {
            return None;
        }
        Some(match format {
            PixelFormat::Int8 => PixelBuffer::Int8(bytes.to_vec()),
            PixelFormat::Int16 => PixelBuffer::Int16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            PixelFormat::Int32 => PixelBuffer::Int32(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            PixelFormat::Float16 => PixelBuffer::Float16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            PixelFormat::Float32 => PixelBuffer::Float32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
