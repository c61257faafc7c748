//! Shared Framebuffer
//!
//! The single hardware-visible pixel surface. Only the compositor and its
//! transfer scheduler write here. Pixels are 4-bit palette indices stored
//! either two per byte (`Packed4`, left pixel in the high nibble) or one per
//! byte (`Indexed8`).

use alloc::vec;
use alloc::vec::Vec;

use crate::color::Color;
use crate::error::{CompositorError, Result};
use crate::geometry::Rect;

/// Pixel storage format shared by the framebuffer and layer buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Two pixels per byte, high nibble first.
    Packed4,
    /// One palette index per byte.
    Indexed8,
}

impl PixelFormat {
    /// Pixels stored in one byte.
    pub const fn pixels_per_byte(self) -> u32 {
        match self {
            PixelFormat::Packed4 => 2,
            PixelFormat::Indexed8 => 1,
        }
    }

    /// Bytes needed for a run of `pixels` starting on a byte boundary.
    pub const fn bytes_for(self, pixels: u32) -> usize {
        let ppb = self.pixels_per_byte();
        pixels.div_ceil(ppb) as usize
    }

    /// Byte offset of pixel `(x, y)` in a buffer with the given stride.
    #[inline]
    pub fn byte_offset(self, stride: usize, x: u32, y: u32) -> usize {
        y as usize * stride + (x / self.pixels_per_byte()) as usize
    }

    /// Read one pixel. Coordinates are not range-checked against a width.
    pub(crate) fn read(self, data: &[u8], stride: usize, x: u32, y: u32) -> Option<Color> {
        let byte = *data.get(self.byte_offset(stride, x, y))?;
        Some(match self {
            PixelFormat::Packed4 if x % 2 == 0 => Color::new(byte >> 4),
            PixelFormat::Packed4 => Color::new(byte & 0x0F),
            PixelFormat::Indexed8 => Color::new(byte),
        })
    }

    /// Write one pixel, leaving its packed neighbour untouched.
    pub(crate) fn write(self, data: &mut [u8], stride: usize, x: u32, y: u32, color: Color) {
        let Some(byte) = data.get_mut(self.byte_offset(stride, x, y)) else {
            return;
        };
        *byte = match self {
            PixelFormat::Packed4 if x % 2 == 0 => (*byte & 0x0F) | (color.index() << 4),
            PixelFormat::Packed4 => (*byte & 0xF0) | color.index(),
            PixelFormat::Indexed8 => color.index(),
        };
    }

    /// Byte value that paints every pixel it covers with `color`.
    pub(crate) const fn fill_byte(self, color: Color) -> u8 {
        match self {
            PixelFormat::Packed4 => color.packed_pair(),
            PixelFormat::Indexed8 => color.index(),
        }
    }
}

/// Fill `rect` (already clipped to the surface) in a raw pixel store.
pub(crate) fn fill_rect_raw(
    data: &mut [u8],
    stride: usize,
    format: PixelFormat,
    rect: Rect,
    color: Color,
) {
    if rect.is_empty() {
        return;
    }
    let x0 = rect.x as u32;
    let x1 = rect.right() as u32;
    let ppb = format.pixels_per_byte();
    // Whole bytes in the middle, single pixels on ragged edges
    let inner_start = x0.div_ceil(ppb) * ppb;
    let inner_end = (x1 / ppb * ppb).max(inner_start);
    let value = format.fill_byte(color);

    for y in rect.y as u32..rect.bottom() as u32 {
        for x in x0..inner_start.min(x1) {
            format.write(data, stride, x, y, color);
        }
        if inner_end > inner_start {
            let start = format.byte_offset(stride, inner_start, y);
            let end = format.byte_offset(stride, inner_end, y);
            data[start..end].fill(value);
        }
        for x in inner_end.max(inner_start.min(x1))..x1 {
            format.write(data, stride, x, y, color);
        }
    }
}

enum Storage {
    /// Heap-backed surface for hosted builds and tests.
    Owned(Vec<u8>),
    /// Video memory mapped at a fixed address.
    Mapped(&'static mut [u8]),
}

/// The hardware-visible framebuffer.
pub struct FrameBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    storage: Storage,
}

impl FrameBuffer {
    /// Allocate a zeroed framebuffer on the heap.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = format.bytes_for(width);
        Self {
            width,
            height,
            format,
            stride,
            storage: Storage::Owned(vec![0u8; stride * height as usize]),
        }
    }

    /// Wrap mapped video memory.
    pub fn from_mapped(
        memory: &'static mut [u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self> {
        let stride = format.bytes_for(width);
        if memory.len() < stride * height as usize {
            return Err(CompositorError::InvalidGeometry {
                rect: Rect::new(0, 0, width, height),
                reason: "mapped framebuffer smaller than the display mode",
            });
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
            storage: Storage::Mapped(memory),
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Screen bounds at the origin.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Byte offset of `(x, y)`, or `None` off screen.
    pub fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.format.byte_offset(self.stride, x, y))
    }

    /// Raw pixel bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => v,
            Storage::Mapped(m) => m,
        }
    }

    /// Raw write access.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(v) => v,
            Storage::Mapped(m) => m,
        }
    }

    /// Mutable window `[offset, offset + count)`, bounds-checked.
    pub fn span_mut(&mut self, offset: usize, count: usize) -> Result<&mut [u8]> {
        let len = self.as_bytes().len();
        match offset.checked_add(count) {
            Some(end) if end <= len => Ok(&mut self.as_bytes_mut()[offset..end]),
            _ => Err(CompositorError::TransferOutOfBounds { offset, count, len }),
        }
    }

    /// Copy `bytes` to `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.span_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Read one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.format.read(self.as_bytes(), self.stride, x, y)
    }

    /// Write one pixel; ignored off screen.
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }
        let (format, stride) = (self.format, self.stride);
        format.write(self.as_bytes_mut(), stride, x, y, color);
    }

    /// Fill the whole surface.
    pub fn fill(&mut self, color: Color) {
        let value = self.format.fill_byte(color);
        self.as_bytes_mut().fill(value);
    }

    /// Fill a rectangle, clipped to the screen.
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let Some(clipped) = rect.intersection(&self.bounds()) else {
            return;
        };
        let (format, stride) = (self.format, self.stride);
        fill_rect_raw(self.as_bytes_mut(), stride, format, clipped, color);
    }
}

impl core::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_pixel_roundtrip_keeps_neighbour() {
        let mut fb = FrameBuffer::new(16, 4, PixelFormat::Packed4);
        fb.set_pixel(2, 1, Color::RED);
        fb.set_pixel(3, 1, Color::YELLOW);
        assert_eq!(fb.pixel(2, 1), Some(Color::RED));
        assert_eq!(fb.pixel(3, 1), Some(Color::YELLOW));
        assert_eq!(fb.as_bytes()[fb.offset(2, 1).unwrap()], 0x4E);
    }

    #[test]
    fn test_fill_rect_ragged_edges() {
        let mut fb = FrameBuffer::new(16, 2, PixelFormat::Packed4);
        fb.fill_rect(Rect::new(1, 0, 4, 1), Color::WHITE);
        assert_eq!(fb.pixel(0, 0), Some(Color::BLACK));
        for x in 1..5 {
            assert_eq!(fb.pixel(x, 0), Some(Color::WHITE));
        }
        assert_eq!(fb.pixel(5, 0), Some(Color::BLACK));
        assert_eq!(fb.pixel(1, 1), Some(Color::BLACK));
    }

    #[test]
    fn test_indexed_fill() {
        let mut fb = FrameBuffer::new(8, 8, PixelFormat::Indexed8);
        fb.fill(Color::BLUE);
        assert!(fb.as_bytes().iter().all(|&b| b == 1));
        assert_eq!(fb.stride(), 8);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mut fb = FrameBuffer::new(8, 1, PixelFormat::Packed4);
        assert!(fb.write(2, &[0, 0]).is_ok());
        assert!(matches!(
            fb.write(3, &[0, 0]),
            Err(CompositorError::TransferOutOfBounds { .. })
        ));
    }
}
