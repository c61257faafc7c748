//! Layer pixel buffers and the size-keyed buffer pool.
//!
//! A [`PixelBuffer`] is the offscreen store behind one layer. Buffers come
//! from the memory collaborator ([`PixelAllocator`]) either directly or via
//! the [`BufferPool`], which recycles blocks by byte size. A pooled buffer is
//! moved out of the pool while a layer holds it, so the pool can never hand
//! the same block to two layers.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::color::Color;
use crate::error::{CompositorError, Resource, Result};
use crate::framebuffer::{fill_rect_raw, PixelFormat};
use crate::geometry::Rect;

/// Memory collaborator: hands out and takes back raw pixel storage.
pub trait PixelAllocator {
    /// Allocate `size` zeroed bytes, or `None` when memory is short.
    fn alloc(&mut self, size: usize) -> Option<Vec<u8>>;

    /// Return a block obtained from [`alloc`](Self::alloc).
    fn free(&mut self, block: Vec<u8>);
}

/// Heap allocator with a hard byte budget.
#[derive(Debug)]
pub struct HeapAllocator {
    budget: usize,
    in_use: usize,
}

impl HeapAllocator {
    pub fn new(budget: usize) -> Self {
        Self { budget, in_use: 0 }
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

impl PixelAllocator for HeapAllocator {
    fn alloc(&mut self, size: usize) -> Option<Vec<u8>> {
        if self.in_use.checked_add(size)? > self.budget {
            return None;
        }
        self.in_use += size;
        Some(vec![0u8; size])
    }

    fn free(&mut self, block: Vec<u8>) {
        self.in_use = self.in_use.saturating_sub(block.len());
    }
}

/// Who reclaims a buffer when its layer lets go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Supplied by the caller; handed back on reconfiguration.
    Owned,
    /// Borrowed from the pool; returned to it on reconfiguration.
    Pooled,
}

/// Offscreen pixel store for one layer.
#[derive(Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    data: Vec<u8>,
    origin: BufferOrigin,
}

impl PixelBuffer {
    /// Heap-allocate a zeroed buffer owned by the caller.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = format.bytes_for(width);
        Self {
            width,
            height,
            format,
            stride,
            data: vec![0u8; stride * height as usize],
            origin: BufferOrigin::Owned,
        }
    }

    /// Wrap existing storage. Fails if `data` is too short for the size.
    pub fn from_vec(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let stride = format.bytes_for(width);
        if data.len() < stride * height as usize {
            return Err(CompositorError::InvalidGeometry {
                rect: Rect::new(0, 0, width, height),
                reason: "pixel storage shorter than width x height",
            });
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
            data,
            origin: BufferOrigin::Owned,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

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

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    /// Local bounds at the origin.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Byte offset of local pixel `(x, y)`.
    pub fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.format.byte_offset(self.stride, x, y))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read-only window `[offset, offset + count)`, bounds-checked.
    pub fn span(&self, offset: usize, count: usize) -> Result<&[u8]> {
        let len = self.data.len();
        match offset.checked_add(count) {
            Some(end) if end <= len => Ok(&self.data[offset..end]),
            _ => Err(CompositorError::TransferOutOfBounds { offset, count, len }),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.format.read(&self.data, self.stride, x, y)
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }
        self.format.write(&mut self.data, self.stride, x, y, color);
    }

    /// Fill every pixel.
    pub fn fill(&mut self, color: Color) {
        let value = self.format.fill_byte(color);
        self.data.fill(value);
    }

    /// Fill a local rectangle, clipped to the buffer.
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let Some(clipped) = rect.intersection(&self.bounds()) else {
            return;
        };
        fill_rect_raw(&mut self.data, self.stride, self.format, clipped, color);
    }

    /// Storage size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn into_storage(self) -> Vec<u8> {
        self.data
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Blocks obtained from the allocator
    pub allocations: u64,
    /// Requests served from the free lists
    pub reuses: u64,
    /// Blocks given back to the allocator
    pub frees: u64,
    /// Requests refused for lack of budget or memory
    pub exhausted: u64,
}

/// Size-keyed recycler for layer buffers.
pub struct BufferPool {
    allocator: Box<dyn PixelAllocator + Send>,
    /// Free blocks grouped by byte length.
    free: HashMap<usize, Vec<Vec<u8>>>,
    /// Bytes currently lent to layers.
    lent: usize,
    budget: usize,
    max_free_per_size: usize,
    pub stats: PoolStats,
}

impl BufferPool {
    /// Create a pool drawing from `allocator`, lending at most `budget` bytes.
    pub fn new(
        allocator: Box<dyn PixelAllocator + Send>,
        budget: usize,
        max_free_per_size: usize,
    ) -> Self {
        Self {
            allocator,
            free: HashMap::new(),
            lent: 0,
            budget,
            max_free_per_size,
            stats: PoolStats::default(),
        }
    }

    /// Lend a zeroed buffer of the given dimensions.
    pub fn acquire(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<PixelBuffer> {
        let size = format.bytes_for(width) * height as usize;
        if self.lent + size > self.budget {
            self.stats.exhausted += 1;
            log::warn!("[Compositor] buffer pool budget exhausted ({} bytes lent)", self.lent);
            return Err(CompositorError::ResourceExhausted(Resource::BufferPool));
        }

        let data = match self.free.get_mut(&size).and_then(|list| list.pop()) {
            Some(mut block) => {
                block.fill(0);
                self.stats.reuses += 1;
                block
            }
            None => {
                let Some(block) = self.allocator.alloc(size) else {
                    self.stats.exhausted += 1;
                    log::warn!("[Compositor] allocator refused {} bytes", size);
                    return Err(CompositorError::ResourceExhausted(Resource::Memory));
                };
                self.stats.allocations += 1;
                log::debug!("[Compositor] pool allocated {} byte buffer", size);
                block
            }
        };

        self.lent += size;
        let mut buffer = PixelBuffer::from_vec(width, height, format, data)?;
        buffer.origin = BufferOrigin::Pooled;
        Ok(buffer)
    }

    /// Take back a buffer previously lent by [`acquire`](Self::acquire).
    pub fn release(&mut self, buffer: PixelBuffer) {
        debug_assert_eq!(buffer.origin, BufferOrigin::Pooled);
        let block = buffer.into_storage();
        let size = block.len();
        self.lent = self.lent.saturating_sub(size);

        let list = self.free.entry(size).or_default();
        if list.len() < self.max_free_per_size {
            list.push(block);
        } else {
            self.stats.frees += 1;
            self.allocator.free(block);
        }
    }

    /// Bytes currently lent to layers.
    pub fn lent_bytes(&self) -> usize {
        self.lent
    }

    /// Free blocks waiting for reuse, across all sizes.
    pub fn free_blocks(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Return every idle block to the allocator.
    pub fn trim(&mut self) {
        for (_, list) in self.free.drain() {
            for block in list {
                self.stats.frees += 1;
                self.allocator.free(block);
            }
        }
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("lent", &self.lent)
            .field("budget", &self.budget)
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}
