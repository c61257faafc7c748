//! Layer - Placed offscreen surface
//!
//! A layer is a rectangular pixel buffer placed on screen with a z-order
//! and a dirty rectangle. The dirty rectangle is kept in layer-local
//! coordinates and is always the bounding box of everything marked since
//! the layer was last painted.

use bitflags::bitflags;

use crate::buffer::PixelBuffer;
use crate::geometry::Rect;

/// Handle into the layer table.
///
/// The generation distinguishes a live layer from an earlier occupant of
/// the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerHandle {
    slot: u8,
    generation: u16,
}

impl LayerHandle {
    pub(crate) const fn new(slot: u8, generation: u16) -> Self {
        Self { slot, generation }
    }

    /// Index of the slot in the layer table.
    pub const fn slot(self) -> usize {
        self.slot as usize
    }

    pub const fn generation(self) -> u16 {
        self.generation
    }
}

bitflags! {
    /// Layer state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LayerFlags: u8 {
        /// Layer takes part in composition and occlusion.
        const VISIBLE = 0b0001;
        /// Dirty rect holds pixels not yet on screen.
        const NEEDS_REDRAW = 0b0010;
    }
}

/// A compositing layer.
#[derive(Debug)]
pub struct Layer {
    handle: LayerHandle,
    /// Screen-space placement, grid aligned
    rect: Rect,
    /// Position in the z-order (0 = bottom)
    z: usize,
    flags: LayerFlags,
    buffer: Option<PixelBuffer>,
    /// Layer-local dirty rectangle
    dirty: Rect,
}

impl Layer {
    pub(crate) fn new(handle: LayerHandle, z: usize) -> Self {
        Self {
            handle,
            rect: Rect::EMPTY,
            z,
            flags: LayerFlags::VISIBLE | LayerFlags::NEEDS_REDRAW,
            buffer: None,
            dirty: Rect::EMPTY,
        }
    }

    pub fn handle(&self) -> LayerHandle {
        self.handle
    }

    /// Screen-space placement.
    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn z(&self) -> usize {
        self.z
    }

    pub fn flags(&self) -> LayerFlags {
        self.flags
    }

    pub fn is_visible(&self) -> bool {
        self.flags.contains(LayerFlags::VISIBLE)
    }

    pub fn needs_redraw(&self) -> bool {
        self.flags.contains(LayerFlags::NEEDS_REDRAW)
    }

    /// Whether a buffer is attached and the layer has area.
    pub fn is_configured(&self) -> bool {
        self.buffer.is_some() && !self.rect.is_empty()
    }

    /// Layer-local dirty rectangle.
    pub fn dirty_rect(&self) -> Rect {
        self.dirty
    }

    /// Dirty rectangle translated to screen space.
    pub fn dirty_screen_rect(&self) -> Rect {
        self.dirty.translate(self.rect.x, self.rect.y)
    }

    /// Local bounds `(0, 0, w, h)`.
    pub fn local_bounds(&self) -> Rect {
        Rect::new(0, 0, self.rect.width, self.rect.height)
    }

    pub fn buffer(&self) -> Option<&PixelBuffer> {
        self.buffer.as_ref()
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut PixelBuffer> {
        self.buffer.as_mut()
    }

    pub(crate) fn set_z(&mut self, z: usize) {
        self.z = z;
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.flags.set(LayerFlags::VISIBLE, visible);
    }

    pub(crate) fn set_origin(&mut self, x: i32, y: i32) {
        self.rect.x = x;
        self.rect.y = y;
    }

    /// Attach `buffer` at `rect`, returning whatever was attached before.
    pub(crate) fn attach(&mut self, rect: Rect, buffer: PixelBuffer) -> Option<PixelBuffer> {
        self.rect = rect;
        let previous = self.buffer.replace(buffer);
        self.invalidate();
        previous
    }

    pub(crate) fn detach(&mut self) -> Option<PixelBuffer> {
        self.buffer.take()
    }

    /// Accumulate `rect` (local coordinates) into the dirty rectangle.
    ///
    /// The rect is clamped to the layer first; an empty or fully outside
    /// rect leaves the layer untouched. Returns whether anything changed.
    pub(crate) fn mark_dirty(&mut self, rect: Rect) -> bool {
        let clamped = rect.clamp_to(&self.local_bounds());
        if clamped.is_empty() {
            return false;
        }

        self.dirty = if self.dirty.is_empty() {
            clamped
        } else {
            self.dirty.union(&clamped)
        };
        self.flags.insert(LayerFlags::NEEDS_REDRAW);
        true
    }

    pub(crate) fn mark_clean(&mut self) {
        self.flags.remove(LayerFlags::NEEDS_REDRAW);
        self.dirty.width = 0;
        self.dirty.height = 0;
    }

    /// Dirty the whole layer.
    pub(crate) fn invalidate(&mut self) {
        self.dirty = self.local_bounds();
        self.flags.insert(LayerFlags::NEEDS_REDRAW);
    }
}
