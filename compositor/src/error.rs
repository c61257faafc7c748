//! Compositor error types.

use thiserror::Error;

use crate::geometry::Rect;
use crate::layer::LayerHandle;

/// Fixed-capacity resources that can run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Every layer slot is occupied.
    LayerTable,
    /// Buffer pool byte budget is spent.
    BufferPool,
    /// The memory collaborator returned no block.
    Memory,
}

/// Compositor error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompositorError {
    /// A fixed-size table or pool is exhausted.
    #[error("resource exhausted: {0:?}")]
    ResourceExhausted(Resource),

    /// Geometry or configuration that cannot be represented.
    #[error("invalid geometry: {reason} ({rect:?})")]
    InvalidGeometry { rect: Rect, reason: &'static str },

    /// Handle refers to a released or never-issued slot.
    #[error("invalid layer handle {0:?}")]
    InvalidHandle(LayerHandle),

    /// Transfer engine did not signal completion in time.
    #[error("transfer engine timed out after {polls} polls")]
    HardwareTimeout { polls: u32 },

    /// Descriptor range falls outside its source or destination buffer.
    #[error("transfer out of bounds: offset {offset} + {count} > {len}")]
    TransferOutOfBounds {
        offset: usize,
        count: usize,
        len: usize,
    },
}

impl CompositorError {
    /// Geometry error without an associated rectangle.
    pub(crate) fn config(reason: &'static str) -> Self {
        CompositorError::InvalidGeometry {
            rect: Rect::EMPTY,
            reason,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, CompositorError>;
