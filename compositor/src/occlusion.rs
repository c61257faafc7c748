//! Occlusion Map
//!
//! A coarse tile grid recording, per tile, the topmost visible layer that
//! covers it. The map is rebuilt once per frame from the top of the stack
//! down, so the first layer to claim a tile keeps it.

use alloc::vec;
use alloc::vec::Vec;

use crate::geometry::{align_up, Rect};
use crate::manager::LayerManager;

/// Slot id of the layer owning a tile, or [`TileOwner::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileOwner(u8);

impl TileOwner {
    /// No layer covers the tile; the background shows through.
    pub const NONE: TileOwner = TileOwner(u8::MAX);

    pub(crate) const fn slot(slot: usize) -> Self {
        TileOwner(slot as u8)
    }

    pub fn is_none(self) -> bool {
        self == TileOwner::NONE
    }

    /// Owning layer slot.
    pub fn owner_slot(self) -> Option<usize> {
        if self.is_none() {
            None
        } else {
            Some(self.0 as usize)
        }
    }
}

/// Inclusive-exclusive tile coordinate range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileRange {
    pub fn count(&self) -> u32 {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }
}

/// Tile ownership grid.
pub struct OcclusionMap {
    tile: u32,
    cols: u32,
    rows: u32,
    owners: Vec<TileOwner>,
    /// Depth of each slot as of the last rebuild
    slot_z: Vec<usize>,
    threshold_percent: u8,
}

impl OcclusionMap {
    /// Grid covering a `width` x `height` screen.
    pub fn new(width: u32, height: u32, tile: u32, threshold_percent: u8) -> Self {
        let cols = align_up(width as i32, tile) as u32 / tile;
        let rows = align_up(height as i32, tile) as u32 / tile;
        Self {
            tile,
            cols,
            rows,
            owners: vec![TileOwner::NONE; (cols * rows) as usize],
            slot_z: Vec::new(),
            threshold_percent,
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile
    }

    /// Grid size in tiles as `(columns, rows)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    pub fn threshold_percent(&self) -> u8 {
        self.threshold_percent
    }

    pub fn set_threshold_percent(&mut self, percent: u8) {
        self.threshold_percent = percent.min(100);
    }

    /// Forget every claim.
    pub fn clear(&mut self) {
        self.owners.fill(TileOwner::NONE);
    }

    /// Recompute ownership from the current layer stack.
    ///
    /// Layers are visited top-down; hidden layers and layers without a
    /// buffer claim nothing.
    pub fn rebuild(&mut self, layers: &LayerManager) {
        self.clear();
        self.slot_z.clear();
        self.slot_z.resize(layers.capacity(), 0);

        for layer in layers.iter_top_down() {
            let slot = layer.handle().slot();
            self.slot_z[slot] = layer.z();
            if !layer.is_visible() || !layer.is_configured() {
                continue;
            }
            let Some(range) = self.tile_range(layer.rect()) else {
                continue;
            };
            let owner = TileOwner::slot(slot);
            for ty in range.y0..range.y1 {
                let row = (ty * self.cols) as usize;
                for tx in range.x0..range.x1 {
                    let cell = &mut self.owners[row + tx as usize];
                    if cell.is_none() {
                        *cell = owner;
                    }
                }
            }
        }
    }

    /// Tiles touched by a screen rect, clipped to the grid.
    pub fn tile_range(&self, rect: Rect) -> Option<TileRange> {
        let grid = Rect::new(0, 0, self.cols * self.tile, self.rows * self.tile);
        let clipped = rect.intersection(&grid)?;
        Some(TileRange {
            x0: clipped.x as u32 / self.tile,
            y0: clipped.y as u32 / self.tile,
            x1: align_up(clipped.right(), self.tile) as u32 / self.tile,
            y1: align_up(clipped.bottom(), self.tile) as u32 / self.tile,
        })
    }

    /// Owner of tile `(tx, ty)`; out-of-grid tiles are unowned.
    pub fn owner(&self, tx: u32, ty: u32) -> TileOwner {
        if tx >= self.cols || ty >= self.rows {
            return TileOwner::NONE;
        }
        self.owners[(ty * self.cols + tx) as usize]
    }

    /// Whether the tile at `(tx, ty)` is owned by layer `slot`.
    pub fn is_owned_by(&self, tx: u32, ty: u32, slot: usize) -> bool {
        self.owner(tx, ty).owner_slot() == Some(slot)
    }

    /// Tiles of `rect` owned by a layer stacked above depth `z`.
    pub fn covered_tiles(&self, rect: Rect, z: usize) -> (u32, u32) {
        let Some(range) = self.tile_range(rect) else {
            return (0, 0);
        };
        let mut covered = 0;
        for ty in range.y0..range.y1 {
            for tx in range.x0..range.x1 {
                let above = self
                    .owner(tx, ty)
                    .owner_slot()
                    .and_then(|slot| self.slot_z.get(slot))
                    .is_some_and(|&owner_z| owner_z > z);
                if above {
                    covered += 1;
                }
            }
        }
        (covered, range.count())
    }

    /// Whether higher layers cover at least the threshold share of `rect`.
    ///
    /// A rect with no on-screen tiles is never reported as occluded.
    pub fn is_occluded(&self, rect: Rect, z: usize) -> bool {
        let (covered, total) = self.covered_tiles(rect, z);
        total > 0 && covered * 100 >= total * self.threshold_percent as u32
    }

    /// Visit maximal runs of unowned tiles inside `rect`, one row at a time,
    /// as screen rects.
    pub fn for_each_unowned(&self, rect: Rect, mut f: impl FnMut(Rect)) {
        let Some(range) = self.tile_range(rect) else {
            return;
        };
        let t = self.tile;
        for ty in range.y0..range.y1 {
            let mut run: Option<u32> = None;
            for tx in range.x0..range.x1 {
                if self.owner(tx, ty).is_none() {
                    run.get_or_insert(tx);
                } else if let Some(start) = run.take() {
                    f(Rect::new((start * t) as i32, (ty * t) as i32, (tx - start) * t, t));
                }
            }
            if let Some(start) = run {
                f(Rect::new((start * t) as i32, (ty * t) as i32, (range.x1 - start) * t, t));
            }
        }
    }
}

impl core::fmt::Debug for OcclusionMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OcclusionMap")
            .field("tile", &self.tile)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("threshold_percent", &self.threshold_percent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, HeapAllocator, PixelBuffer};
    use crate::framebuffer::PixelFormat;
    use crate::layer::LayerHandle;
    use alloc::boxed::Box;

    fn stack(rects: &[Rect]) -> (LayerManager, Vec<LayerHandle>) {
        let pool = BufferPool::new(Box::new(HeapAllocator::new(1 << 20)), 1 << 20, 4);
        let mut m = LayerManager::new(8, 8, PixelFormat::Packed4, pool);
        let handles = rects
            .iter()
            .map(|r| {
                let h = m.acquire().unwrap();
                m.configure(h, *r, PixelBuffer::new(r.width, r.height, PixelFormat::Packed4))
                    .unwrap();
                h
            })
            .collect();
        (m, handles)
    }

    #[test]
    fn test_top_layer_claims_overlap() {
        let (m, h) = stack(&[Rect::new(0, 0, 32, 32), Rect::new(16, 16, 32, 32)]);
        let mut map = OcclusionMap::new(64, 64, 8, 50);
        map.rebuild(&m);

        assert!(map.is_owned_by(0, 0, h[0].slot()));
        assert!(map.is_owned_by(2, 2, h[1].slot()));
        assert!(map.is_owned_by(3, 3, h[1].slot()));
        assert!(map.owner(7, 0).is_none());
    }

    #[test]
    fn test_hidden_layer_claims_nothing() {
        let (mut m, h) = stack(&[Rect::new(0, 0, 32, 32), Rect::new(0, 0, 32, 32)]);
        m.set_visible(h[1], false).unwrap();
        let mut map = OcclusionMap::new(64, 64, 8, 50);
        map.rebuild(&m);
        assert!(map.is_owned_by(1, 1, h[0].slot()));
    }

    #[test]
    fn test_is_occluded_threshold() {
        // Top layer covers the right half of the bottom layer
        let (m, _) = stack(&[Rect::new(0, 0, 32, 32), Rect::new(16, 0, 16, 32)]);
        let mut map = OcclusionMap::new(64, 64, 8, 50);
        map.rebuild(&m);

        assert!(map.is_occluded(Rect::new(0, 0, 32, 32), 0));
        assert!(!map.is_occluded(Rect::new(0, 0, 24, 32), 0));
        // Nothing sits above the top layer
        assert!(!map.is_occluded(Rect::new(16, 0, 16, 32), 1));

        map.set_threshold_percent(75);
        assert!(!map.is_occluded(Rect::new(0, 0, 32, 32), 0));
    }

    #[test]
    fn test_offscreen_rect_not_occluded() {
        let map = OcclusionMap::new(64, 64, 8, 50);
        assert!(!map.is_occluded(Rect::new(-32, -32, 16, 16), 0));
    }

    #[test]
    fn test_unowned_runs() {
        let (m, _) = stack(&[Rect::new(8, 0, 8, 8)]);
        let mut map = OcclusionMap::new(32, 8, 8, 50);
        map.rebuild(&m);

        let mut runs = Vec::new();
        map.for_each_unowned(Rect::new(0, 0, 32, 8), |r| runs.push(r));
        assert_eq!(runs, vec![Rect::new(0, 0, 8, 8), Rect::new(16, 0, 16, 8)]);
    }
}
