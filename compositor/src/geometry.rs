//! Integer Rectangle Geometry
//!
//! Screen-space and layer-local rectangles plus the grid alignment used
//! everywhere in the compositor. Layers, damage regions and occlusion tiles
//! all live on the same 8-pixel grid, so alignment helpers are shared here.

/// Rounds `v` down to a multiple of `grid`.
#[inline]
pub fn align_down(v: i32, grid: u32) -> i32 {
    let g = grid as i32;
    v.div_euclid(g) * g
}

/// Rounds `v` up to a multiple of `grid`.
#[inline]
pub fn align_up(v: i32, grid: u32) -> i32 {
    let g = grid as i32;
    let down = align_down(v, grid);
    if down == v {
        v
    } else {
        down.saturating_add(g)
    }
}

#[inline]
fn extent(v: u32) -> i32 {
    v.min(i32::MAX as u32) as i32
}

/// An axis-aligned rectangle with a signed origin and unsigned extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// The canonical empty rectangle.
    pub const EMPTY: Rect = Rect::new(0, 0, 0, 0);

    /// Create a new rectangle
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create from edges. Inverted or degenerate edges give an empty rect.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        if right <= left || bottom <= top {
            return Rect::new(left, top, 0, 0);
        }
        Rect::new(
            left,
            top,
            (right as i64 - left as i64) as u32,
            (bottom as i64 - top as i64) as u32,
        )
    }

    /// Get the right edge (exclusive)
    #[inline]
    pub fn right(&self) -> i32 {
        self.x.saturating_add(extent(self.width))
    }

    /// Get the bottom edge (exclusive)
    #[inline]
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(extent(self.height))
    }

    /// True when the rectangle covers no pixels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Calculate area of the rectangle
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Check if this rectangle intersects with another
    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.is_empty()
            || other.is_empty()
            || self.right() <= other.x
            || other.right() <= self.x
            || self.bottom() <= other.y
            || other.bottom() <= self.y)
    }

    /// Get intersection with another rectangle
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.intersects(other) {
            return None;
        }

        Some(Rect::from_edges(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        ))
    }

    /// Bounding union. An empty operand contributes nothing.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }

        Rect::from_edges(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Check if rectangle contains a point
    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    /// Check if this rectangle contains another
    pub fn contains_rect(&self, other: &Rect) -> bool {
        !other.is_empty()
            && self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    /// Clip to `bounds`, returning an empty rect when nothing remains.
    pub fn clamp_to(&self, bounds: &Rect) -> Rect {
        self.intersection(bounds).unwrap_or(Rect::EMPTY)
    }

    /// Offset the origin. Saturates at the ends of the coordinate range.
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.width,
            self.height,
        )
    }

    /// The same rect in coordinates whose origin is `(ox, oy)`.
    pub fn offset_from(&self, ox: i32, oy: i32) -> Rect {
        Rect::new(
            self.x.saturating_sub(ox),
            self.y.saturating_sub(oy),
            self.width,
            self.height,
        )
    }

    /// Expand outward so every edge sits on a multiple of `grid`.
    pub fn align_to_grid(&self, grid: u32) -> Rect {
        if self.is_empty() {
            return Rect::new(align_down(self.x, grid), align_down(self.y, grid), 0, 0);
        }
        Rect::from_edges(
            align_down(self.x, grid),
            align_down(self.y, grid),
            align_up(self.right(), grid),
            align_up(self.bottom(), grid),
        )
    }
}
