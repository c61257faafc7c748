//! 16-color palette indices.
//!
//! The framebuffer stores palette indices, not RGB values; palette
//! programming belongs to the display driver.

/// A 4-bit palette index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color(u8);

impl Color {
    pub const BLACK: Color = Color(0);
    pub const BLUE: Color = Color(1);
    pub const GREEN: Color = Color(2);
    pub const CYAN: Color = Color(3);
    pub const RED: Color = Color(4);
    pub const MAGENTA: Color = Color(5);
    pub const BROWN: Color = Color(6);
    pub const LIGHT_GRAY: Color = Color(7);
    pub const DARK_GRAY: Color = Color(8);
    pub const LIGHT_BLUE: Color = Color(9);
    pub const LIGHT_GREEN: Color = Color(10);
    pub const LIGHT_CYAN: Color = Color(11);
    pub const LIGHT_RED: Color = Color(12);
    pub const LIGHT_MAGENTA: Color = Color(13);
    pub const YELLOW: Color = Color(14);
    pub const WHITE: Color = Color(15);

    /// Build from a palette index. Only the low nibble is kept.
    pub const fn new(index: u8) -> Self {
        Color(index & 0x0F)
    }

    /// Palette index in `0..16`.
    pub const fn index(self) -> u8 {
        self.0
    }

    /// The byte that paints two adjacent pixels in packed 4-bit mode.
    pub const fn packed_pair(self) -> u8 {
        (self.0 << 4) | self.0
    }
}

impl From<u8> for Color {
    fn from(index: u8) -> Self {
        Color::new(index)
    }
}
