//! KPIO Layer Compositor
//!
//! Display compositor for the KPIO 16-color framebuffer. Applications draw
//! into layers; once per vertical blank the compositor copies whatever
//! changed to the screen through the block-transfer engine.
//!
//! # Architecture
//!
//! ```text
//!  app ──▶ LayerManager ──(dirty rects)──┐
//!   irq ──▶ DirtyInbox ──────────────────┤
//!                                        ▼
//!                                   Compositor::run_frame
//!                                        │
//!              OcclusionMap ◀── rebuild ─┤
//!         DamageAccumulator ◀── exposures┤
//!                                        ▼
//!                              TransferScheduler ──▶ TransferEngine ──▶ FrameBuffer
//! ```
//!
//! - `geometry`: rectangles and grid alignment
//! - `color`: 16-entry palette indices
//! - `framebuffer`: the hardware-visible pixel surface
//! - `buffer`: layer pixel buffers and the size-keyed buffer pool
//! - `layer` / `manager`: layers, handles and the z-order
//! - `damage`: screen-space repaint regions
//! - `occlusion`: per-tile topmost-layer ownership
//! - `transfer`: descriptor batching, CPU/hardware copy selection
//! - `timer`: tick counter and vertical blank collaborator
//! - `inbox`: damage handoff from interrupt context
//! - `compositor`: the per-frame driver

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod buffer;
pub mod color;
pub mod compositor;
pub mod config;
pub mod damage;
pub mod error;
pub mod framebuffer;
pub mod geometry;
pub mod inbox;
pub mod layer;
pub mod manager;
pub mod occlusion;
pub mod timer;
pub mod transfer;

pub use buffer::{BufferPool, HeapAllocator, PixelAllocator, PixelBuffer, PoolStats};
pub use color::Color;
pub use compositor::{Compositor, FrameReport, FrameState, FrameStats};
pub use config::{CompositorConfig, RepaintPolicy, WaitPolicy};
pub use damage::{DamageAccumulator, DamageRegion, DamageStats};
pub use error::{CompositorError, Resource, Result};
pub use framebuffer::{FrameBuffer, PixelFormat};
pub use geometry::Rect;
pub use inbox::DirtyInbox;
pub use layer::{Layer, LayerFlags, LayerHandle};
pub use manager::{LayerManager, MAX_LAYERS};
pub use occlusion::{OcclusionMap, TileOwner};
pub use timer::{ManualTimer, Timer};
pub use transfer::{
    copy_words, AdaptiveThreshold, CpuEngine, EngineStatus, SimulatedDma, TransferDescriptor,
    TransferEngine, TransferScheduler, TransferStats, TransferTarget,
};
