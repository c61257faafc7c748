//! Frame Compositor
//!
//! Drives one frame per vertical blank:
//!
//! ```text
//! WaitVsync ─▶ (anything dirty?) ─no─▶ Idle
//!                    │ yes
//!                    ▼
//!            RebuildOcclusion ─▶ EmitTransfers ─▶ ExecuteBatch ─▶ MarkClean
//! ```
//!
//! The first frame after construction or [`Compositor::reinitialize`]
//! clears the screen to the background and paints every layer in full,
//! without consulting the occlusion map.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::buffer::{BufferPool, HeapAllocator, PixelAllocator, PixelBuffer};
use crate::config::{CompositorConfig, RepaintPolicy};
use crate::damage::DamageAccumulator;
use crate::error::{CompositorError, Result};
use crate::framebuffer::FrameBuffer;
use crate::geometry::Rect;
use crate::inbox::DirtyInbox;
use crate::layer::{Layer, LayerHandle};
use crate::manager::LayerManager;
use crate::occlusion::OcclusionMap;
use crate::timer::Timer;
use crate::transfer::{
    AdaptiveThreshold, TransferDescriptor, TransferEngine, TransferScheduler, TransferStats,
    TransferTarget,
};

/// Frame pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    WaitVsync,
    /// Nothing to repaint this frame
    Idle,
    RebuildOcclusion,
    EmitTransfers,
    ExecuteBatch,
    MarkClean,
}

/// What one call to [`Compositor::run_frame`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Whether anything was written to the framebuffer
    pub painted: bool,
    /// First-frame unconditional paint
    pub full_paint: bool,
    pub layers_painted: usize,
    /// Descriptors queued this frame
    pub descriptors: u64,
    /// Bytes copied from layer buffers
    pub bytes: u64,
    /// Chains issued to the transfer engine
    pub hardware_chains: u64,
    /// Runs copied by the CPU
    pub cpu_runs: u64,
    /// Timer ticks spent in the frame
    pub ticks: u64,
}

/// Frame statistics
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub frames: u64,
    pub idle_frames: u64,
    pub painted_frames: u64,
    /// Frames abandoned on error
    pub failed_frames: u64,
    pub bytes: u64,
    pub last_frame_ticks: u64,
    pub peak_frame_ticks: u64,
}

/// Per-frame driver owning the layer stack and the framebuffer.
pub struct Compositor<E: TransferEngine, T: Timer> {
    config: CompositorConfig,
    layers: LayerManager,
    /// Screen areas to repaint across layers (exposures, region mode)
    damage: DamageAccumulator,
    occlusion: OcclusionMap,
    scheduler: TransferScheduler<E>,
    framebuffer: FrameBuffer,
    timer: T,
    inbox: Option<&'static DirtyInbox>,
    first_frame: bool,
    state: FrameState,
    stats: FrameStats,
}

impl<E: TransferEngine, T: Timer> Compositor<E, T> {
    /// Create a compositor over `framebuffer`.
    ///
    /// Layer buffers from the pool come from `allocator`.
    pub fn new(
        config: CompositorConfig,
        framebuffer: FrameBuffer,
        engine: E,
        timer: T,
        allocator: Box<dyn PixelAllocator + Send>,
    ) -> Result<Self> {
        config.validate()?;
        if framebuffer.width() != config.width
            || framebuffer.height() != config.height
            || framebuffer.format() != config.format
        {
            return Err(CompositorError::InvalidGeometry {
                rect: framebuffer.bounds(),
                reason: "framebuffer does not match the configured mode",
            });
        }

        let pool = BufferPool::new(
            allocator,
            config.pool_budget_bytes,
            config.pool_max_free_per_size,
        );
        let layers = LayerManager::new(config.max_layers, config.tile_size, config.format, pool);
        let damage = DamageAccumulator::new(
            config.width,
            config.height,
            config.tile_size,
            config.damage_capacity,
            config.merge_overlap_percent,
        );
        let occlusion = OcclusionMap::new(
            config.width,
            config.height,
            config.tile_size,
            config.occlusion_threshold_percent,
        );
        let threshold = AdaptiveThreshold::new(
            config.cpu_copy_threshold,
            config.cpu_copy_threshold_min,
            config.cpu_copy_threshold_max,
            config.threshold_recalc_frames,
            config.busy_bytes_per_frame,
        );
        let scheduler = TransferScheduler::new(engine, config.wait_policy, threshold);

        log::debug!(
            "[Compositor] initialized {}x{} {:?}, {} layers, {} descriptor slots",
            config.width,
            config.height,
            config.format,
            config.max_layers,
            scheduler.capacity()
        );

        Ok(Self {
            config,
            layers,
            damage,
            occlusion,
            scheduler,
            framebuffer,
            timer,
            inbox: None,
            first_frame: true,
            state: FrameState::WaitVsync,
            stats: FrameStats::default(),
        })
    }

    /// Compositor with a heap framebuffer and heap-backed pool.
    pub fn with_heap(config: CompositorConfig, engine: E, timer: T) -> Result<Self> {
        let framebuffer = FrameBuffer::new(config.width, config.height, config.format);
        let allocator = Box::new(HeapAllocator::new(config.pool_budget_bytes));
        Self::new(config, framebuffer, engine, timer, allocator)
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn layers(&self) -> &LayerManager {
        &self.layers
    }

    pub fn layer(&self, handle: LayerHandle) -> Result<&Layer> {
        self.layers.get(handle)
    }

    pub fn framebuffer(&self) -> &FrameBuffer {
        &self.framebuffer
    }

    pub fn damage(&self) -> &DamageAccumulator {
        &self.damage
    }

    pub fn occlusion(&self) -> &OcclusionMap {
        &self.occlusion
    }

    pub fn scheduler(&self) -> &TransferScheduler<E> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TransferScheduler<E> {
        &mut self.scheduler
    }

    pub fn transfer_stats(&self) -> &TransferStats {
        &self.scheduler.stats
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Whether the next frame is an unconditional full paint.
    pub fn is_first_frame(&self) -> bool {
        self.first_frame
    }

    pub fn acquire_layer(&mut self) -> Option<LayerHandle> {
        self.layers.acquire()
    }

    pub fn try_acquire_layer(&mut self) -> Result<LayerHandle> {
        self.layers.try_acquire()
    }

    /// Place a layer and attach `buffer`. See [`LayerManager::configure`].
    pub fn configure_layer(
        &mut self,
        handle: LayerHandle,
        rect: Rect,
        buffer: PixelBuffer,
    ) -> Result<Option<PixelBuffer>> {
        let vacated = self.footprint(handle)?;
        let previous = self.layers.configure(handle, rect, buffer)?;
        self.expose(vacated);
        Ok(previous)
    }

    /// Place a layer on a zeroed buffer from the pool.
    pub fn configure_layer_pooled(
        &mut self,
        handle: LayerHandle,
        rect: Rect,
    ) -> Result<Option<PixelBuffer>> {
        let vacated = self.footprint(handle)?;
        let previous = self.layers.configure_pooled(handle, rect)?;
        self.expose(vacated);
        Ok(previous)
    }

    /// Restack a layer. Its footprint is repainted next frame.
    pub fn set_z_order(&mut self, handle: LayerHandle, z: usize) -> Result<()> {
        let old_z = self.layers.set_z_order(handle, z)?;
        if old_z != self.layers.get(handle)?.z() {
            let footprint = self.footprint(handle)?;
            self.expose(footprint);
        }
        Ok(())
    }

    /// Report drawn pixels, in layer-local coordinates.
    pub fn mark_dirty(&mut self, handle: LayerHandle, rect: Rect) -> Result<bool> {
        self.layers.mark_dirty(handle, rect)
    }

    pub fn invalidate_layer(&mut self, handle: LayerHandle) -> Result<()> {
        self.layers.invalidate(handle)
    }

    /// Move a layer; the area it leaves is repainted from below.
    pub fn move_layer(&mut self, handle: LayerHandle, x: i32, y: i32) -> Result<()> {
        let vacated = self.footprint(handle)?;
        self.layers.move_to(handle, x, y)?;
        self.expose(vacated);
        Ok(())
    }

    pub fn set_visible(&mut self, handle: LayerHandle, visible: bool) -> Result<()> {
        let footprint = self.footprint(handle)?;
        if self.layers.set_visible(handle, visible)? && !visible {
            self.expose(footprint);
        }
        Ok(())
    }

    /// Remove a layer. Owned buffers are handed back; pooled ones return
    /// to the pool.
    pub fn release_layer(&mut self, handle: LayerHandle) -> Result<Option<PixelBuffer>> {
        let footprint = self.footprint(handle)?;
        let buffer = self.layers.release(handle)?;
        self.expose(footprint);
        Ok(buffer)
    }

    /// Pixels of a layer, for drawing. Report changes with `mark_dirty`.
    pub fn buffer_mut(&mut self, handle: LayerHandle) -> Result<&mut PixelBuffer> {
        self.layers.buffer_mut(handle)
    }

    /// On-screen rect of a layer if it currently shows anything.
    fn footprint(&self, handle: LayerHandle) -> Result<Option<Rect>> {
        let layer = self.layers.get(handle)?;
        Ok((layer.is_visible() && layer.is_configured()).then(|| layer.rect()))
    }

    fn expose(&mut self, area: Option<Rect>) {
        if let Some(rect) = area {
            self.damage.add(rect);
        }
    }

    /// Take damage posted from other contexts at the start of each frame.
    pub fn attach_inbox(&mut self, inbox: &'static DirtyInbox) {
        self.inbox = Some(inbox);
    }

    /// Repaint everything from scratch on the next frame.
    pub fn reinitialize(&mut self) {
        log::debug!("[Compositor] reinitialize, next frame repaints everything");
        self.scheduler.abort();
        self.damage.clear();
        self.first_frame = true;
        self.state = FrameState::WaitVsync;
    }

    /// Poll the timer until vertical blank begins.
    pub fn wait_for_vblank(&self, max_polls: u32) -> bool {
        for _ in 0..max_polls {
            if self.timer.in_vertical_blank() {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    /// Run one frame of the pipeline.
    ///
    /// On error the queued transfers are dropped and every layer that was
    /// dirty stays dirty, so the next frame repaints it.
    pub fn run_frame(&mut self) -> Result<FrameReport> {
        let start = self.timer.ticks();
        self.state = FrameState::WaitVsync;
        self.stats.frames += 1;
        self.drain_inbox();

        let before = self.scheduler.stats.clone();
        let outcome = if self.first_frame {
            self.paint_full()
        } else {
            self.paint_incremental()
        };
        self.scheduler.end_frame();

        let mut report = match outcome {
            Ok(report) => report,
            Err(err) => {
                self.scheduler.abort();
                self.stats.failed_frames += 1;
                self.state = FrameState::WaitVsync;
                log::warn!("[Compositor] frame {} failed: {}", self.stats.frames, err);
                return Err(err);
            }
        };

        let after = &self.scheduler.stats;
        report.descriptors = after.descriptors - before.descriptors;
        report.bytes = after.bytes - before.bytes;
        report.hardware_chains = after.hardware_chains - before.hardware_chains;
        report.cpu_runs = after.cpu_runs - before.cpu_runs;
        report.ticks = self.timer.ticks().saturating_sub(start);

        if report.painted {
            self.stats.painted_frames += 1;
            self.stats.bytes += report.bytes;
        } else {
            self.stats.idle_frames += 1;
        }
        self.stats.last_frame_ticks = report.ticks;
        self.stats.peak_frame_ticks = self.stats.peak_frame_ticks.max(report.ticks);
        if self.state != FrameState::Idle {
            self.state = FrameState::WaitVsync;
        }
        Ok(report)
    }

    fn drain_inbox(&mut self) {
        let Some(inbox) = self.inbox else {
            return;
        };
        let layers = &mut self.layers;
        let lost = inbox.drain(|handle, rect| {
            if layers.mark_dirty(handle, rect).is_err() {
                log::trace!("[Compositor] dropping post for stale layer {:?}", handle);
            }
        });
        if lost {
            self.layers.invalidate_all();
        }
    }

    /// Background everywhere, then every visible layer in full, bottom up.
    fn paint_full(&mut self) -> Result<FrameReport> {
        log::debug!("[Compositor] first frame, painting {} layers", self.layers.count());
        transition(&mut self.state, FrameState::RebuildOcclusion);
        self.occlusion.rebuild(&self.layers);
        self.damage.clear();
        self.framebuffer.fill(self.config.background);

        let painted = self.paintable(|_| true);
        transition(&mut self.state, FrameState::EmitTransfers);
        self.emit_and_execute(&painted, |layer| Some((layer.local_bounds(), false)))?;

        self.mark_clean(&painted);
        self.first_frame = false;
        Ok(FrameReport {
            painted: true,
            full_paint: true,
            layers_painted: painted.len(),
            ..FrameReport::default()
        })
    }

    fn paint_incremental(&mut self) -> Result<FrameReport> {
        if !self.damage.has_damage() && !self.layers.any_needs_redraw() {
            transition(&mut self.state, FrameState::Idle);
            return Ok(FrameReport::default());
        }

        transition(&mut self.state, FrameState::RebuildOcclusion);
        self.occlusion.rebuild(&self.layers);

        transition(&mut self.state, FrameState::EmitTransfers);
        let painted = match self.config.repaint_policy {
            RepaintPolicy::LayerDirty => self.repaint_dirty_layers()?,
            RepaintPolicy::DamageRegions => self.repaint_damage_regions()?,
        };

        self.mark_clean(&painted);
        Ok(FrameReport {
            painted: true,
            layers_painted: painted.len(),
            ..FrameReport::default()
        })
    }

    /// Each dirty layer copies the tiles it owns inside its dirty rect.
    fn repaint_dirty_layers(&mut self) -> Result<Vec<LayerHandle>> {
        if self.damage.has_damage() {
            let exposed: Vec<Rect> = self.damage.regions().collect();
            for area in exposed {
                self.layers.damage_screen_rect(area);
                self.fill_unowned(area);
            }
            self.damage.clear();
        }

        let painted = self.paintable(Layer::needs_redraw);
        self.emit_and_execute(&painted, |layer| Some((layer.dirty_rect(), true)))?;
        Ok(painted)
    }

    /// Fold dirty layers into screen damage and repaint region by region,
    /// bottom up. Mostly covered regions copy only owned tiles.
    fn repaint_damage_regions(&mut self) -> Result<Vec<LayerHandle>> {
        let painted = self.paintable(Layer::needs_redraw);
        for &handle in &painted {
            let area = self.layers.get(handle)?.dirty_screen_rect();
            self.damage.add(area);
        }
        self.damage.merge_regions();

        let regions: Vec<Rect> = self.damage.regions().collect();
        for &area in &regions {
            self.fill_unowned(area);
        }

        let tile = self.config.tile_size;
        let Self {
            layers,
            damage,
            occlusion,
            scheduler,
            framebuffer,
            state,
            ..
        } = self;
        let layers: &LayerManager = layers;
        let occlusion: &OcclusionMap = occlusion;
        let mut target = TransferTarget::new(layers, framebuffer);

        scheduler.begin_batch();
        damage.draw_regions(layers, |layer, local| {
            let screen = local.translate(layer.rect().x, layer.rect().y);
            let mask = occlusion
                .is_occluded(screen, layer.z())
                .then_some(occlusion);
            emit_rect(scheduler, &mut target, layer, local, mask, tile)
        })?;

        transition(state, FrameState::ExecuteBatch);
        if let Err(err) = scheduler.execute_batch(&mut target) {
            // Regions were consumed by draw_regions; keep them for the retry
            for area in regions {
                damage.add(area);
            }
            return Err(err);
        }
        Ok(painted)
    }

    /// Visible, configured layers passing `filter`, bottom up.
    fn paintable(&self, filter: impl Fn(&Layer) -> bool) -> Vec<LayerHandle> {
        self.layers
            .iter_back_to_front()
            .filter(|l| l.is_visible() && l.is_configured() && filter(l))
            .map(Layer::handle)
            .collect()
    }

    /// Queue `select(layer)` for every handle and run the batch. `select`
    /// yields the local rect to copy and whether to mask by tile ownership.
    fn emit_and_execute(
        &mut self,
        handles: &[LayerHandle],
        select: impl Fn(&Layer) -> Option<(Rect, bool)>,
    ) -> Result<()> {
        let tile = self.config.tile_size;
        let Self {
            layers,
            occlusion,
            scheduler,
            framebuffer,
            state,
            ..
        } = self;
        let layers: &LayerManager = layers;
        let occlusion: &OcclusionMap = occlusion;
        let mut target = TransferTarget::new(layers, framebuffer);

        scheduler.begin_batch();
        for &handle in handles {
            let layer = layers.get(handle)?;
            if let Some((local, masked)) = select(layer) {
                let mask = masked.then_some(occlusion);
                emit_rect(scheduler, &mut target, layer, local, mask, tile)?;
            }
        }

        transition(state, FrameState::ExecuteBatch);
        scheduler.execute_batch(&mut target)
    }

    /// Background color on every tile of `area` no layer covers.
    fn fill_unowned(&mut self, area: Rect) {
        let background = self.config.background;
        let framebuffer = &mut self.framebuffer;
        self.occlusion
            .for_each_unowned(area, |run| framebuffer.fill_rect(run, background));
    }

    fn mark_clean(&mut self, handles: &[LayerHandle]) {
        transition(&mut self.state, FrameState::MarkClean);
        for &handle in handles {
            // Handles come from this frame's stack
            let _ = self.layers.mark_clean(handle);
        }
    }
}

impl<E: TransferEngine, T: Timer> core::fmt::Debug for Compositor<E, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Compositor")
            .field("layers", &self.layers)
            .field("damage", &self.damage)
            .field("scheduler", &self.scheduler)
            .field("state", &self.state)
            .field("first_frame", &self.first_frame)
            .finish()
    }
}

fn transition(state: &mut FrameState, next: FrameState) {
    log::trace!("[Compositor] {:?} -> {:?}", state, next);
    *state = next;
}

/// Queue copies for `local` (layer coordinates) of `layer`.
///
/// Each scanline is walked one tile at a time. With a mask, only tiles the
/// layer owns are copied; consecutive copied tiles coalesce into one
/// descriptor per run.
fn emit_rect<E: TransferEngine>(
    scheduler: &mut TransferScheduler<E>,
    target: &mut TransferTarget<'_>,
    layer: &Layer,
    local: Rect,
    mask: Option<&OcclusionMap>,
    tile: u32,
) -> Result<()> {
    let placed = layer.rect();
    let screen = target.framebuffer().bounds();
    let Some(visible) = local
        .clamp_to(&layer.local_bounds())
        .translate(placed.x, placed.y)
        .intersection(&screen)
    else {
        return Ok(());
    };
    // Whole tiles keep every span byte aligned
    let visible = visible
        .align_to_grid(tile)
        .clamp_to(&placed)
        .clamp_to(&screen);
    if visible.is_empty() {
        return Ok(());
    }

    let slot = layer.handle().slot();
    let step = tile as i32;
    for y in visible.y..visible.bottom() {
        let ty = y as u32 / tile;
        let mut run: Option<i32> = None;
        let mut x = visible.x;
        while x < visible.right() {
            let owned = mask.map_or(true, |m| m.is_owned_by(x as u32 / tile, ty, slot));
            if owned {
                run.get_or_insert(x);
            } else if let Some(start) = run.take() {
                emit_span(scheduler, target, layer, y, start, x)?;
            }
            x += step;
        }
        if let Some(start) = run {
            emit_span(scheduler, target, layer, y, start, visible.right())?;
        }
    }
    Ok(())
}

/// One descriptor for screen pixels `[x0, x1)` of row `y`.
fn emit_span<E: TransferEngine>(
    scheduler: &mut TransferScheduler<E>,
    target: &mut TransferTarget<'_>,
    layer: &Layer,
    y: i32,
    x0: i32,
    x1: i32,
) -> Result<()> {
    let placed = layer.rect();
    let buffer = layer.buffer().ok_or(CompositorError::InvalidHandle(layer.handle()))?;
    let pixels = (x1.min(placed.right()) - x0) as u32;
    let count = buffer.format().bytes_for(pixels);

    let out_of_bounds = |len| CompositorError::TransferOutOfBounds {
        offset: 0,
        count,
        len,
    };
    let src_offset = buffer
        .offset((x0 - placed.x) as u32, (y - placed.y) as u32)
        .ok_or_else(|| out_of_bounds(buffer.len()))?;
    let dst_offset = target
        .framebuffer()
        .offset(x0 as u32, y as u32)
        .ok_or_else(|| out_of_bounds(target.framebuffer().as_bytes().len()))?;

    scheduler.add_transfer(
        TransferDescriptor {
            source: layer.handle(),
            src_offset,
            dst_offset,
            count,
        },
        target,
    )
}
