//! Compositor configuration

use crate::color::Color;
use crate::error::{CompositorError, Result};
use crate::framebuffer::PixelFormat;
use crate::manager::MAX_LAYERS;

/// How the frame driver finds pixels to repaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepaintPolicy {
    /// Scan each dirty layer's own dirty rect, masked by the occlusion map.
    #[default]
    LayerDirty,
    /// Accumulate screen damage across layers and repaint region by region.
    DamageRegions,
}

/// How long to poll the transfer engine for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Spin until the engine reports done.
    Unbounded,
    /// Give up with a timeout after `max_polls` status reads.
    Bounded { max_polls: u32 },
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy::Bounded { max_polls: 100_000 }
    }
}

/// Compositor configuration
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    /// Screen width
    pub width: u32,
    /// Screen height
    pub height: u32,
    pub format: PixelFormat,
    /// Occlusion tile and placement grid, in pixels
    pub tile_size: u32,
    pub max_layers: usize,
    /// Damage region slots
    pub damage_capacity: usize,
    /// Overlap share above which a damage rect merges on insert
    pub merge_overlap_percent: u8,
    /// Covered share at which a region counts as occluded
    pub occlusion_threshold_percent: u8,
    /// Hardware descriptor table entries
    pub descriptor_table_size: usize,
    /// Runs shorter than this (bytes) are copied by the CPU
    pub cpu_copy_threshold: usize,
    pub cpu_copy_threshold_min: usize,
    pub cpu_copy_threshold_max: usize,
    /// Frames per threshold recalculation window
    pub threshold_recalc_frames: u32,
    /// Average bytes per frame above which the system counts as busy
    pub busy_bytes_per_frame: usize,
    pub wait_policy: WaitPolicy,
    pub repaint_policy: RepaintPolicy,
    /// Color shown where no layer covers the screen
    pub background: Color,
    /// Bytes the buffer pool may lend out
    pub pool_budget_bytes: usize,
    /// Free blocks kept per buffer size
    pub pool_max_free_per_size: usize,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 400,
            format: PixelFormat::Packed4,
            tile_size: 8,
            max_layers: 16,
            damage_capacity: 32,
            merge_overlap_percent: 50,
            occlusion_threshold_percent: 50,
            descriptor_table_size: 16,
            cpu_copy_threshold: 64,
            cpu_copy_threshold_min: 16,
            cpu_copy_threshold_max: 256,
            threshold_recalc_frames: 30,
            busy_bytes_per_frame: 16 * 1024,
            wait_policy: WaitPolicy::default(),
            repaint_policy: RepaintPolicy::default(),
            background: Color::BLACK,
            pool_budget_bytes: 256 * 1024,
            pool_max_free_per_size: 4,
        }
    }
}

impl CompositorConfig {
    /// Default configuration for a `width` x `height` screen.
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Reject settings the compositor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CompositorError::config("screen has no area"));
        }
        if self.tile_size < 2 || self.tile_size % self.format.pixels_per_byte() != 0 {
            return Err(CompositorError::config("tile size must cover whole bytes"));
        }
        if self.width % self.tile_size != 0 || self.height % self.tile_size != 0 {
            return Err(CompositorError::config("screen is not a multiple of the tile size"));
        }
        if self.max_layers == 0 || self.max_layers > MAX_LAYERS {
            return Err(CompositorError::config("layer table size out of range"));
        }
        if self.damage_capacity == 0 || self.descriptor_table_size == 0 {
            return Err(CompositorError::config("table sizes must be non-zero"));
        }
        if self.merge_overlap_percent > 100 || self.occlusion_threshold_percent > 100 {
            return Err(CompositorError::config("percentages must not exceed 100"));
        }
        if self.cpu_copy_threshold_min > self.cpu_copy_threshold
            || self.cpu_copy_threshold > self.cpu_copy_threshold_max
        {
            return Err(CompositorError::config("cpu copy threshold outside its bounds"));
        }
        Ok(())
    }
}
