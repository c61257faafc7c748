//! Layer Manager
//!
//! Owns the fixed-capacity layer table and the z-order.
//!
//! `z_order[z]` is the handle of the layer drawn at depth `z` (0 = bottom).
//! The array always holds exactly the occupied slots, densely packed over
//! `[0, count)`, and every occupied layer stores its own index into it.
//! Reordering rotates a sub-slice of the array in place, so no intermediate
//! state ever exposes a duplicated or missing handle.

use alloc::vec::Vec;

use crate::buffer::{BufferOrigin, BufferPool, PixelBuffer};
use crate::error::{CompositorError, Resource, Result};
use crate::framebuffer::PixelFormat;
use crate::geometry::Rect;
use crate::layer::{Layer, LayerHandle};

/// Largest table the occlusion map can index (one id is reserved).
pub const MAX_LAYERS: usize = u8::MAX as usize - 1;

/// Owner of all layers and their stacking order.
pub struct LayerManager {
    slots: Vec<Option<Layer>>,
    generations: Vec<u16>,
    z_order: Vec<LayerHandle>,
    pool: BufferPool,
    grid: u32,
    format: PixelFormat,
}

impl LayerManager {
    /// Create a table with `capacity` slots.
    pub fn new(capacity: usize, grid: u32, format: PixelFormat, pool: BufferPool) -> Self {
        let capacity = capacity.min(MAX_LAYERS);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            generations: alloc::vec![0; capacity],
            z_order: Vec::with_capacity(capacity),
            pool,
            grid,
            format,
        }
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.z_order.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    /// Alignment grid for layer placement.
    pub fn grid(&self) -> u32 {
        self.grid
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Handles ordered bottom to top.
    pub fn z_order(&self) -> &[LayerHandle] {
        &self.z_order
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    /// Claim a free slot. The new layer goes on top and starts dirty.
    pub fn try_acquire(&mut self) -> Result<LayerHandle> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            log::warn!("[Compositor] layer table full ({} slots)", self.capacity());
            return Err(CompositorError::ResourceExhausted(Resource::LayerTable));
        };

        let handle = LayerHandle::new(slot as u8, self.generations[slot]);
        let z = self.z_order.len();
        self.slots[slot] = Some(Layer::new(handle, z));
        self.z_order.push(handle);

        log::debug!("[Compositor] acquired layer {:?} at z={}", handle, z);
        Ok(handle)
    }

    /// Claim a free slot, or `None` when the table is exhausted.
    pub fn acquire(&mut self) -> Option<LayerHandle> {
        self.try_acquire().ok()
    }

    /// Look up a live layer.
    pub fn get(&self, handle: LayerHandle) -> Result<&Layer> {
        match self.slots.get(handle.slot()) {
            Some(Some(layer)) if layer.handle() == handle => Ok(layer),
            _ => Err(CompositorError::InvalidHandle(handle)),
        }
    }

    pub(crate) fn get_mut(&mut self, handle: LayerHandle) -> Result<&mut Layer> {
        match self.slots.get_mut(handle.slot()) {
            Some(Some(layer)) if layer.handle() == handle => Ok(layer),
            _ => Err(CompositorError::InvalidHandle(handle)),
        }
    }

    /// Occupied layer in `slot`, regardless of generation.
    pub fn by_slot(&self, slot: usize) -> Option<&Layer> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Layer drawn at depth `z`.
    pub fn at_z(&self, z: usize) -> Option<&Layer> {
        let handle = *self.z_order.get(z)?;
        self.by_slot(handle.slot())
    }

    /// Layers from the bottom of the stack to the top.
    pub fn iter_back_to_front(&self) -> impl Iterator<Item = &Layer> + '_ {
        self.z_order
            .iter()
            .filter_map(move |h| self.by_slot(h.slot()))
    }

    /// Layers from the top of the stack to the bottom.
    pub fn iter_top_down(&self) -> impl Iterator<Item = &Layer> + '_ {
        self.z_order
            .iter()
            .rev()
            .filter_map(move |h| self.by_slot(h.slot()))
    }

    /// Place a layer and attach a caller-supplied buffer.
    ///
    /// `rect` is expanded to the grid; the buffer must cover the aligned
    /// size. The layer becomes fully dirty. A previously attached pooled
    /// buffer goes back to the pool; a caller-owned one is returned.
    pub fn configure(
        &mut self,
        handle: LayerHandle,
        rect: Rect,
        buffer: PixelBuffer,
    ) -> Result<Option<PixelBuffer>> {
        self.get(handle)?;
        let aligned = self.aligned_rect(rect)?;
        if buffer.width() < aligned.width
            || buffer.height() < aligned.height
            || buffer.format() != self.format
        {
            return Err(CompositorError::InvalidGeometry {
                rect: aligned,
                reason: "buffer does not cover the aligned layer rect",
            });
        }
        Ok(self.attach(handle, aligned, buffer))
    }

    /// Place a layer and attach a zeroed buffer from the pool.
    pub fn configure_pooled(
        &mut self,
        handle: LayerHandle,
        rect: Rect,
    ) -> Result<Option<PixelBuffer>> {
        self.get(handle)?;
        let aligned = self.aligned_rect(rect)?;
        let buffer = self
            .pool
            .acquire(aligned.width, aligned.height, self.format)?;
        Ok(self.attach(handle, aligned, buffer))
    }

    fn aligned_rect(&self, rect: Rect) -> Result<Rect> {
        let aligned = rect.align_to_grid(self.grid);
        if aligned.is_empty() {
            return Err(CompositorError::InvalidGeometry {
                rect,
                reason: "layer rect has no area",
            });
        }
        let grid = self.grid as i32;
        if aligned.right().rem_euclid(grid) != 0 || aligned.bottom().rem_euclid(grid) != 0 {
            return Err(CompositorError::InvalidGeometry {
                rect,
                reason: "layer rect runs past the coordinate range",
            });
        }
        Ok(aligned)
    }

    fn attach(&mut self, handle: LayerHandle, rect: Rect, buffer: PixelBuffer) -> Option<PixelBuffer> {
        let previous = match self.get_mut(handle) {
            Ok(layer) => layer.attach(rect, buffer),
            Err(_) => return None,
        };
        log::debug!("[Compositor] configured layer {:?} at {:?}", handle, rect);
        self.reclaim(previous)
    }

    /// Send a pooled buffer home; hand an owned one back to the caller.
    fn reclaim(&mut self, buffer: Option<PixelBuffer>) -> Option<PixelBuffer> {
        match buffer {
            Some(buf) if buf.origin() == BufferOrigin::Pooled => {
                self.pool.release(buf);
                None
            }
            other => other,
        }
    }

    /// Move a layer to depth `new_z`, shifting the layers in between by one.
    ///
    /// `new_z` past the top is clamped to the top. Returns the old depth.
    pub fn set_z_order(&mut self, handle: LayerHandle, new_z: usize) -> Result<usize> {
        let old_z = self.get(handle)?.z();
        let new_z = new_z.min(self.count() - 1);
        if new_z == old_z {
            return Ok(old_z);
        }

        let (lo, hi) = if old_z < new_z {
            self.z_order[old_z..=new_z].rotate_left(1);
            (old_z, new_z)
        } else {
            self.z_order[new_z..=old_z].rotate_right(1);
            (new_z, old_z)
        };
        self.renumber(lo..=hi);

        log::debug!("[Compositor] layer {:?} z {} -> {}", handle, old_z, new_z);
        Ok(old_z)
    }

    /// Rewrite stored depths for a range of the z-order.
    fn renumber(&mut self, range: core::ops::RangeInclusive<usize>) {
        for z in range {
            let slot = self.z_order[z].slot();
            if let Some(layer) = self.slots[slot].as_mut() {
                layer.set_z(z);
            }
        }
    }

    /// Accumulate a local dirty rect. Returns whether the layer changed.
    pub fn mark_dirty(&mut self, handle: LayerHandle, rect: Rect) -> Result<bool> {
        Ok(self.get_mut(handle)?.mark_dirty(rect))
    }

    pub fn mark_clean(&mut self, handle: LayerHandle) -> Result<()> {
        self.get_mut(handle)?.mark_clean();
        Ok(())
    }

    /// Dirty the entire layer.
    pub fn invalidate(&mut self, handle: LayerHandle) -> Result<()> {
        self.get_mut(handle)?.invalidate();
        Ok(())
    }

    /// Dirty every layer.
    pub fn invalidate_all(&mut self) {
        for layer in self.slots.iter_mut().flatten() {
            layer.invalidate();
        }
    }

    /// Mark every layer overlapping screen rect `area`, in its own
    /// coordinates. Returns how many layers were touched.
    pub fn damage_screen_rect(&mut self, area: Rect) -> usize {
        let mut touched = 0;
        for layer in self.slots.iter_mut().flatten() {
            let origin = layer.rect();
            if layer.mark_dirty(area.offset_from(origin.x, origin.y)) {
                touched += 1;
            }
        }
        touched
    }

    /// Show or hide a layer. Returns whether the state changed.
    pub fn set_visible(&mut self, handle: LayerHandle, visible: bool) -> Result<bool> {
        let layer = self.get_mut(handle)?;
        if layer.is_visible() == visible {
            return Ok(false);
        }
        layer.set_visible(visible);
        if visible {
            layer.invalidate();
        }
        Ok(true)
    }

    /// Move a layer to a new grid-aligned origin. Returns the old rect.
    pub fn move_to(&mut self, handle: LayerHandle, x: i32, y: i32) -> Result<Rect> {
        let grid = self.grid;
        let layer = self.get_mut(handle)?;
        let old = layer.rect();
        let aligned = Rect::new(x, y, 0, 0).align_to_grid(grid);
        layer.set_origin(aligned.x, aligned.y);
        layer.invalidate();
        Ok(old)
    }

    /// Mutable access to a layer's pixels, e.g. for drawing.
    ///
    /// Callers report what they drew with [`mark_dirty`](Self::mark_dirty).
    pub fn buffer_mut(&mut self, handle: LayerHandle) -> Result<&mut PixelBuffer> {
        let layer = self.get_mut(handle)?;
        let rect = layer.rect();
        layer.buffer_mut().ok_or(CompositorError::InvalidGeometry {
            rect,
            reason: "layer has no buffer attached",
        })
    }

    /// Return a slot to the table.
    ///
    /// Layers above close the gap. A pooled buffer goes back to the pool;
    /// an owned one is returned to the caller.
    pub fn release(&mut self, handle: LayerHandle) -> Result<Option<PixelBuffer>> {
        let z = self.get(handle)?.z();
        let slot = handle.slot();

        self.z_order.remove(z);
        if z < self.z_order.len() {
            self.renumber(z..=self.z_order.len() - 1);
        }

        let buffer = self.slots[slot].take().and_then(|mut layer| layer.detach());
        self.generations[slot] = self.generations[slot].wrapping_add(1);

        log::debug!("[Compositor] released layer {:?}", handle);
        Ok(self.reclaim(buffer))
    }

    /// Whether any layer has pending pixels.
    pub fn any_needs_redraw(&self) -> bool {
        self.iter_back_to_front()
            .any(|l| l.needs_redraw() && l.is_visible() && l.is_configured())
    }

    /// Check the z-order permutation invariant.
    pub fn check_z_order(&self) -> bool {
        let occupied = self.slots.iter().flatten().count();
        if occupied != self.z_order.len() {
            return false;
        }
        let mut seen = alloc::vec![false; self.slots.len()];
        self.z_order.iter().enumerate().all(|(z, handle)| {
            let fresh = !core::mem::replace(&mut seen[handle.slot()], true);
            fresh && matches!(self.get(*handle), Ok(layer) if layer.z() == z)
        })
    }
}

impl core::fmt::Debug for LayerManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LayerManager")
            .field("count", &self.count())
            .field("capacity", &self.capacity())
            .field("z_order", &self.z_order)
            .finish()
    }
}
