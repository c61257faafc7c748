//! Property 1: Dirty rect accumulation
//!
//! For any sequence of `mark_dirty` calls on a clean layer, the dirty rect
//! is the bounding union of every submitted rect after clamping it to the
//! layer. Rects that clamp to nothing leave the layer untouched.

use kpio_compositor::{
    BufferPool, HeapAllocator, LayerManager, PixelBuffer, PixelFormat, Rect,
};
use proptest::prelude::*;

fn arb_rect() -> impl Strategy<Value = Rect> {
    (-96i32..224, -96i32..224, 0u32..96, 0u32..96).prop_map(|(x, y, w, h)| Rect::new(x, y, w, h))
}

fn manager() -> LayerManager {
    let pool = BufferPool::new(Box::new(HeapAllocator::new(1 << 20)), 1 << 20, 4);
    LayerManager::new(4, 8, PixelFormat::Packed4, pool)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Final dirty rect equals the union of clamped inputs.
    #[test]
    fn dirty_rect_is_clamped_union(
        cols in 1u32..=16,
        rows in 1u32..=16,
        marks in prop::collection::vec(arb_rect(), 0..12),
    ) {
        let (w, h) = (cols * 8, rows * 8);
        let mut m = manager();
        let handle = m.acquire().unwrap();
        m.configure(handle, Rect::new(0, 0, w, h), PixelBuffer::new(w, h, PixelFormat::Packed4)).unwrap();
        m.mark_clean(handle).unwrap();

        let bounds = Rect::new(0, 0, w, h);
        let mut expected: Option<Rect> = None;
        for rect in &marks {
            let clamped = rect.clamp_to(&bounds);
            let changed = m.mark_dirty(handle, *rect).unwrap();
            prop_assert_eq!(changed, !clamped.is_empty());
            if !clamped.is_empty() {
                expected = Some(match expected {
                    Some(acc) => acc.union(&clamped),
                    None => clamped,
                });
            }
        }

        let layer = m.get(handle).unwrap();
        match expected {
            Some(rect) => {
                prop_assert_eq!(layer.dirty_rect(), rect);
                prop_assert!(layer.needs_redraw());
                prop_assert!(bounds.contains_rect(&layer.dirty_rect()));
            }
            None => {
                prop_assert!(layer.dirty_rect().is_empty());
                prop_assert!(!layer.needs_redraw());
            }
        }
    }

    /// Marking clean always zeroes the dirty rect.
    #[test]
    fn mark_clean_resets(marks in prop::collection::vec(arb_rect(), 1..8)) {
        let mut m = manager();
        let handle = m.acquire().unwrap();
        m.configure(handle, Rect::new(0, 0, 64, 64), PixelBuffer::new(64, 64, PixelFormat::Packed4)).unwrap();
        for rect in marks {
            m.mark_dirty(handle, rect).unwrap();
        }
        m.mark_clean(handle).unwrap();
        let layer = m.get(handle).unwrap();
        prop_assert!(layer.dirty_rect().is_empty());
        prop_assert!(!layer.needs_redraw());
    }
}
