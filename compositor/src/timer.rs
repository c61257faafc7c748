//! Frame timing
//!
//! The compositor only needs a monotonic tick counter and the vertical
//! blank flag; the platform supplies both.

use core::cell::Cell;

/// Monotonic clock and blanking status.
pub trait Timer {
    /// Ticks since boot. Never goes backwards.
    fn ticks(&self) -> u64;

    /// Whether the display is currently in vertical blank.
    fn in_vertical_blank(&self) -> bool;
}

/// Timer driven by hand, for hosts and tests.
///
/// Every call to `ticks` advances the clock by `step`.
#[derive(Debug)]
pub struct ManualTimer {
    now: Cell<u64>,
    step: u64,
    vblank: Cell<bool>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0),
            step: 0,
            vblank: Cell::new(true),
        }
    }

    /// Clock that advances by `step` ticks per read.
    pub fn with_step(step: u64) -> Self {
        Self {
            step,
            ..Self::new()
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.now.set(self.now.get() + ticks);
    }

    pub fn set_vblank(&self, active: bool) {
        self.vblank.set(active);
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for ManualTimer {
    fn ticks(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }

    fn in_vertical_blank(&self) -> bool {
        self.vblank.get()
    }
}
