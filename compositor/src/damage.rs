//! Damage Tracking System
//!
//! Accumulates the screen regions that need to be repainted this frame,
//! across all layers. Regions are tile aligned and live in a bounded table.
//! The table may over-approximate what changed but never under-approximate
//! it: when it fills up, new damage is folded into the largest region
//! instead of being dropped.

use alloc::vec::Vec;

use crate::error::Result;
use crate::geometry::Rect;
use crate::layer::Layer;
use crate::manager::LayerManager;

/// One slot of the damage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DamageRegion {
    pub rect: Rect,
    pub active: bool,
}

/// Statistics about damage tracking
#[derive(Debug, Clone, Default)]
pub struct DamageStats {
    /// Total damage rects added
    pub total_rects: u64,
    /// Rects folded into an overlapping region on insert
    pub merged_rects: u64,
    /// Rects folded into the largest region because the table was full
    pub overflow_merges: u64,
    /// Region pairs coalesced by `merge_regions`
    pub coalesced: u64,
    /// Area of the regions at the last clear
    pub last_damage_pixels: u64,
}

/// Screen-space damage accumulator.
pub struct DamageAccumulator {
    regions: Vec<DamageRegion>,
    /// Screen bounds for clipping
    bounds: Rect,
    grid: u32,
    /// Overlap share (of either region) above which an insert merges
    merge_percent: u8,
    pub stats: DamageStats,
}

impl DamageAccumulator {
    /// Create an accumulator with `capacity` region slots.
    pub fn new(width: u32, height: u32, grid: u32, capacity: usize, merge_percent: u8) -> Self {
        Self {
            regions: alloc::vec![DamageRegion::default(); capacity.max(1)],
            bounds: Rect::new(0, 0, width, height),
            grid,
            merge_percent: merge_percent.min(100),
            stats: DamageStats::default(),
        }
    }

    /// Region slots.
    pub fn capacity(&self) -> usize {
        self.regions.len()
    }

    /// Number of active regions.
    pub fn active_count(&self) -> usize {
        self.regions.iter().filter(|r| r.active).count()
    }

    /// Check if there's any damage to process
    pub fn has_damage(&self) -> bool {
        self.regions.iter().any(|r| r.active)
    }

    /// Active region rectangles.
    pub fn regions(&self) -> impl Iterator<Item = Rect> + '_ {
        self.regions.iter().filter(|r| r.active).map(|r| r.rect)
    }

    /// Bounding box of all active regions.
    pub fn bounding_box(&self) -> Rect {
        self.regions().fold(Rect::EMPTY, |acc, r| acc.union(&r))
    }

    /// Sum of active region areas (overlaps counted twice).
    pub fn total_area(&self) -> u64 {
        self.regions().map(|r| r.area()).sum()
    }

    /// Add a damaged region given as coordinates.
    pub fn add_rect(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.add(Rect::new(x, y, width, height));
    }

    /// Add a damaged region.
    pub fn add(&mut self, rect: Rect) {
        let aligned = rect.align_to_grid(self.grid).clamp_to(&self.bounds);
        if aligned.is_empty() {
            return;
        }

        self.stats.total_rects += 1;

        let merge_percent = self.merge_percent as u64;
        for region in self.regions.iter_mut().filter(|r| r.active) {
            let Some(overlap) = region.rect.intersection(&aligned) else {
                continue;
            };
            let shared = overlap.area() * 100;
            if shared > region.rect.area() * merge_percent || shared > aligned.area() * merge_percent
            {
                region.rect = region.rect.union(&aligned);
                self.stats.merged_rects += 1;
                return;
            }
        }

        if let Some(free) = self.regions.iter_mut().find(|r| !r.active) {
            *free = DamageRegion {
                rect: aligned,
                active: true,
            };
            return;
        }

        // Table full: grow the largest region rather than lose the change
        if let Some(largest) = self.regions.iter_mut().max_by_key(|r| r.rect.area()) {
            largest.rect = largest.rect.union(&aligned);
            self.stats.overflow_merges += 1;
            log::warn!(
                "[Compositor] damage table full, merged {:?} into {:?}",
                aligned,
                largest.rect
            );
        }
    }

    /// Coalesce overlapping regions until none overlap.
    pub fn merge_regions(&mut self) {
        // O(n²) per pass over a small fixed table
        loop {
            let mut changed = false;
            for i in 0..self.regions.len() {
                if !self.regions[i].active {
                    continue;
                }
                for j in (i + 1)..self.regions.len() {
                    if self.regions[j].active && self.regions[i].rect.intersects(&self.regions[j].rect)
                    {
                        self.regions[i].rect = self.regions[i].rect.union(&self.regions[j].rect);
                        self.regions[j].active = false;
                        self.stats.coalesced += 1;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Paint every region: for each, visit layers back to front and hand
    /// `emit` the layer together with the overlap in layer-local
    /// coordinates. Regions are cleared only if every emit succeeds.
    pub fn draw_regions<F>(&mut self, layers: &LayerManager, mut emit: F) -> Result<()>
    where
        F: FnMut(&Layer, Rect) -> Result<()>,
    {
        for region in self.regions.iter().filter(|r| r.active) {
            for layer in layers.iter_back_to_front() {
                if !layer.is_visible() || !layer.is_configured() {
                    continue;
                }
                let placed = layer.rect();
                if let Some(overlap) = placed.intersection(&region.rect) {
                    emit(layer, overlap.offset_from(placed.x, placed.y))?;
                }
            }
        }
        self.clear();
        Ok(())
    }

    /// Clear all damage (after rendering)
    pub fn clear(&mut self) {
        self.stats.last_damage_pixels = self.total_area();
        for region in &mut self.regions {
            region.active = false;
        }
    }
}

impl core::fmt::Debug for DamageAccumulator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DamageAccumulator")
            .field("active", &self.active_count())
            .field("capacity", &self.capacity())
            .field("bounds", &self.bounds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, HeapAllocator, PixelBuffer};
    use crate::framebuffer::PixelFormat;
    use alloc::boxed::Box;
    use alloc::vec;

    fn accumulator(capacity: usize) -> DamageAccumulator {
        DamageAccumulator::new(640, 400, 8, capacity, 50)
    }

    #[test]
    fn test_add_aligns_and_clamps() {
        let mut d = accumulator(4);
        d.add_rect(-5, 3, 10, 2);
        assert_eq!(d.regions().collect::<Vec<_>>(), vec![Rect::new(0, 0, 8, 8)]);
        d.add_rect(700, 0, 10, 10);
        assert_eq!(d.active_count(), 1);
    }

    #[test]
    fn test_heavy_overlap_merges_in_place() {
        let mut d = accumulator(4);
        d.add_rect(0, 0, 64, 64);
        d.add_rect(8, 8, 64, 64);
        assert_eq!(d.active_count(), 1);
        assert_eq!(d.bounding_box(), Rect::new(0, 0, 72, 72));
        assert_eq!(d.stats.merged_rects, 1);
    }

    #[test]
    fn test_light_overlap_appends() {
        let mut d = accumulator(4);
        d.add_rect(0, 0, 64, 64);
        d.add_rect(56, 56, 64, 64);
        assert_eq!(d.active_count(), 2);

        d.merge_regions();
        assert_eq!(d.active_count(), 1);
        assert_eq!(d.bounding_box(), Rect::new(0, 0, 120, 120));
    }

    #[test]
    fn test_contained_rect_is_absorbed() {
        let mut d = accumulator(4);
        d.add_rect(0, 0, 128, 128);
        d.add_rect(16, 16, 8, 8);
        assert_eq!(d.active_count(), 1);
        assert_eq!(d.bounding_box(), Rect::new(0, 0, 128, 128));
    }

    #[test]
    fn test_overflow_merges_into_largest() {
        let mut d = accumulator(3);
        d.add_rect(0, 0, 8, 8);
        d.add_rect(100, 0, 64, 64);
        d.add_rect(0, 200, 16, 16);
        d.add_rect(600, 392, 8, 8);

        assert_eq!(d.active_count(), 3);
        assert_eq!(d.stats.overflow_merges, 1);
        assert!(d.regions().any(|r| r.contains_rect(&Rect::new(600, 392, 8, 8))));
        assert!(d.regions().any(|r| r.contains_rect(&Rect::new(96, 0, 72, 64))));
    }

    #[test]
    fn test_merge_regions_reaches_fixed_point() {
        let mut d = accumulator(8);
        // A chain where merging the first pair creates a new overlap
        d.add_rect(0, 0, 16, 16);
        d.add_rect(32, 32, 16, 16);
        d.add_rect(8, 8, 32, 32);
        d.merge_regions();
        assert_eq!(d.active_count(), 1);
        assert_eq!(d.bounding_box(), Rect::new(0, 0, 48, 48));
    }

    #[test]
    fn test_draw_regions_back_to_front_local() {
        let pool = BufferPool::new(Box::new(HeapAllocator::new(1 << 20)), 1 << 20, 4);
        let mut m = LayerManager::new(4, 8, PixelFormat::Packed4, pool);
        let bottom = m.acquire().unwrap();
        let top = m.acquire().unwrap();
        m.configure(bottom, Rect::new(0, 0, 64, 64), PixelBuffer::new(64, 64, PixelFormat::Packed4))
            .unwrap();
        m.configure(top, Rect::new(32, 32, 64, 64), PixelBuffer::new(64, 64, PixelFormat::Packed4))
            .unwrap();

        let mut d = accumulator(4);
        d.add_rect(40, 40, 8, 8);

        let mut seen = Vec::new();
        d.draw_regions(&m, |layer, local| {
            seen.push((layer.handle(), local));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![(bottom, Rect::new(40, 40, 8, 8)), (top, Rect::new(8, 8, 8, 8))]
        );
        assert!(!d.has_damage());
    }
}
