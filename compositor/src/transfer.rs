//! Batched Block Transfers
//!
//! Copies from layer buffers to the framebuffer are queued as
//! [`TransferDescriptor`]s and issued to the block-transfer engine as one
//! chain per batch. Every chain pays a fixed setup and completion cost, so
//! short runs are cheaper on the CPU; [`AdaptiveThreshold`] decides where
//! the cut-off lies and moves it with recent load.
//!
//! Whatever path a run takes, the framebuffer ends up byte-identical to
//! copying every descriptor one after another in emission order.

use alloc::vec::Vec;
use core::ops::Range;

use bitflags::bitflags;

use crate::config::WaitPolicy;
use crate::error::{CompositorError, Result};
use crate::framebuffer::FrameBuffer;
use crate::layer::LayerHandle;
use crate::manager::LayerManager;

const WORD: usize = core::mem::size_of::<u32>();

/// Copy `src` into `dst` a word at a time, finishing with a byte tail.
///
/// Copies `min(dst.len(), src.len())` bytes.
pub fn copy_words(dst: &mut [u8], src: &[u8]) {
    let len = dst.len().min(src.len());
    let split = len - len % WORD;
    let (dst_words, dst_tail) = dst[..len].split_at_mut(split);
    let (src_words, src_tail) = src[..len].split_at(split);

    for (d, s) in dst_words
        .chunks_exact_mut(WORD)
        .zip(src_words.chunks_exact(WORD))
    {
        let word = u32::from_ne_bytes([s[0], s[1], s[2], s[3]]);
        d.copy_from_slice(&word.to_ne_bytes());
    }

    for (d, s) in dst_tail.iter_mut().zip(src_tail) {
        *d = *s;
    }
}

/// One contiguous copy from a layer buffer to the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Layer whose buffer is the source
    pub source: LayerHandle,
    /// Byte offset into the layer buffer
    pub src_offset: usize,
    /// Byte offset into the framebuffer
    pub dst_offset: usize,
    /// Bytes to copy
    pub count: usize,
}

impl TransferDescriptor {
    pub fn dst_range(&self) -> Range<usize> {
        self.dst_offset..self.dst_offset + self.count
    }

    /// Whether two descriptors write any common framebuffer byte.
    pub fn overlaps_dst(&self, other: &TransferDescriptor) -> bool {
        let (a, b) = (self.dst_range(), other.dst_range());
        a.start < b.end && b.start < a.end
    }
}

/// Memory a transfer reads from and writes to.
pub struct TransferTarget<'a> {
    layers: &'a LayerManager,
    framebuffer: &'a mut FrameBuffer,
}

impl<'a> TransferTarget<'a> {
    pub fn new(layers: &'a LayerManager, framebuffer: &'a mut FrameBuffer) -> Self {
        Self {
            layers,
            framebuffer,
        }
    }

    pub fn layers(&self) -> &LayerManager {
        self.layers
    }

    pub fn framebuffer(&self) -> &FrameBuffer {
        self.framebuffer
    }

    pub fn framebuffer_mut(&mut self) -> &mut FrameBuffer {
        self.framebuffer
    }

    fn source(&self, desc: &TransferDescriptor) -> Result<&'a [u8]> {
        let layers: &'a LayerManager = self.layers;
        let buffer = layers
            .get(desc.source)?
            .buffer()
            .ok_or(CompositorError::TransferOutOfBounds {
                offset: desc.src_offset,
                count: desc.count,
                len: 0,
            })?;
        buffer.span(desc.src_offset, desc.count)
    }

    /// Block copy, as the engine performs it.
    pub fn copy(&mut self, desc: &TransferDescriptor) -> Result<()> {
        let src = self.source(desc)?;
        self.framebuffer
            .span_mut(desc.dst_offset, desc.count)?
            .copy_from_slice(src);
        Ok(())
    }

    /// Word-wise CPU copy.
    pub fn copy_cpu(&mut self, desc: &TransferDescriptor) -> Result<()> {
        let src = self.source(desc)?;
        copy_words(self.framebuffer.span_mut(desc.dst_offset, desc.count)?, src);
        Ok(())
    }
}

bitflags! {
    /// Transfer engine status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EngineStatus: u8 {
        /// A chain is in flight.
        const BUSY = 0b01;
        /// The last chain finished.
        const DONE = 0b10;
    }
}

/// Block-transfer hardware.
///
/// The scheduler drives an engine as configure, start, poll `status`
/// until `DONE`, then `clear_status`.
pub trait TransferEngine {
    /// Entries in the hardware descriptor table.
    fn table_size(&self) -> usize;

    /// Load a descriptor chain, replacing any previous one.
    fn configure(&mut self, chain: &[TransferDescriptor]);

    /// Start the loaded chain.
    fn start(&mut self, target: &mut TransferTarget<'_>) -> Result<()>;

    /// Poll the status register.
    fn status(&mut self) -> EngineStatus;

    /// Acknowledge completion.
    fn clear_status(&mut self);
}

/// Engine for machines without transfer hardware: copies run on the CPU
/// inside `start` and complete immediately.
#[derive(Debug)]
pub struct CpuEngine {
    table_size: usize,
    chain: Vec<TransferDescriptor>,
    status: EngineStatus,
}

impl CpuEngine {
    pub fn new(table_size: usize) -> Self {
        Self {
            table_size,
            chain: Vec::with_capacity(table_size),
            status: EngineStatus::empty(),
        }
    }
}

impl TransferEngine for CpuEngine {
    fn table_size(&self) -> usize {
        self.table_size
    }

    fn configure(&mut self, chain: &[TransferDescriptor]) {
        self.chain.clear();
        self.chain.extend_from_slice(chain);
    }

    fn start(&mut self, target: &mut TransferTarget<'_>) -> Result<()> {
        for desc in &self.chain {
            target.copy_cpu(desc)?;
        }
        self.status = EngineStatus::DONE;
        Ok(())
    }

    fn status(&mut self) -> EngineStatus {
        self.status
    }

    fn clear_status(&mut self) {
        self.status = EngineStatus::empty();
    }
}

/// Software model of a chained block-transfer engine.
///
/// Copies happen when the chain starts; the status register then reports
/// `BUSY` for a configurable number of polls. A stalled engine never
/// completes, which exercises the bounded wait.
#[derive(Debug)]
pub struct SimulatedDma {
    table_size: usize,
    chain: Vec<TransferDescriptor>,
    latency_polls: u32,
    remaining: u32,
    stalled: bool,
    status: EngineStatus,
    /// Chains started since creation
    pub chains_started: u64,
    /// Descriptors copied since creation
    pub descriptors_copied: u64,
}

impl SimulatedDma {
    pub fn new(table_size: usize, latency_polls: u32) -> Self {
        Self {
            table_size,
            chain: Vec::with_capacity(table_size),
            latency_polls,
            remaining: 0,
            stalled: false,
            status: EngineStatus::empty(),
            chains_started: 0,
            descriptors_copied: 0,
        }
    }

    /// An engine whose completion flag never rises.
    pub fn stalled(table_size: usize) -> Self {
        let mut dma = Self::new(table_size, 0);
        dma.stalled = true;
        dma
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }
}

impl TransferEngine for SimulatedDma {
    fn table_size(&self) -> usize {
        self.table_size
    }

    fn configure(&mut self, chain: &[TransferDescriptor]) {
        self.chain.clear();
        self.chain.extend_from_slice(chain);
    }

    fn start(&mut self, target: &mut TransferTarget<'_>) -> Result<()> {
        for desc in &self.chain {
            target.copy(desc)?;
        }
        self.chains_started += 1;
        self.descriptors_copied += self.chain.len() as u64;
        self.remaining = self.latency_polls;
        self.status = EngineStatus::BUSY;
        Ok(())
    }

    fn status(&mut self) -> EngineStatus {
        if self.status.contains(EngineStatus::BUSY) && !self.stalled {
            if self.remaining == 0 {
                self.status = EngineStatus::DONE;
            } else {
                self.remaining -= 1;
            }
        }
        self.status
    }

    fn clear_status(&mut self) {
        self.status = EngineStatus::empty();
    }
}

/// CPU/hardware cut-off that follows recent transfer volume.
#[derive(Debug, Clone)]
pub struct AdaptiveThreshold {
    current: usize,
    baseline: usize,
    min: usize,
    max: usize,
    interval_frames: u32,
    busy_bytes: usize,
    frames: u32,
    window_bytes: u64,
}

impl AdaptiveThreshold {
    /// Step used when relaxing back toward the baseline (one word pair).
    pub const STEP: usize = 2 * WORD;

    pub fn new(baseline: usize, min: usize, max: usize, interval_frames: u32, busy_bytes: usize) -> Self {
        let max = max.max(min);
        let baseline = baseline.clamp(min, max);
        Self {
            current: baseline,
            baseline,
            min,
            max,
            interval_frames: interval_frames.max(1),
            busy_bytes,
            frames: 0,
            window_bytes: 0,
        }
    }

    /// Runs shorter than this many bytes are copied by the CPU.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn prefers_cpu(&self, count: usize) -> bool {
        count < self.current
    }

    /// Feed one frame's transfer volume. Returns true when the window
    /// closed and the threshold was recalculated.
    pub fn record_frame(&mut self, bytes: usize) -> bool {
        self.frames += 1;
        self.window_bytes += bytes as u64;
        if self.frames < self.interval_frames {
            return false;
        }

        let average = (self.window_bytes / self.frames as u64) as usize;
        let previous = self.current;
        if average > self.busy_bytes {
            self.current = (self.current / 2).max(self.min);
        } else if average < self.busy_bytes / 4 && self.current < self.baseline {
            self.current = (self.current + Self::STEP).min(self.baseline).min(self.max);
        }
        self.frames = 0;
        self.window_bytes = 0;

        if previous != self.current {
            log::debug!(
                "[Compositor] cpu copy threshold {} -> {} (avg {} bytes/frame)",
                previous,
                self.current,
                average
            );
        }
        true
    }
}

/// Transfer statistics
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Descriptors queued
    pub descriptors: u64,
    /// Bytes copied by either path
    pub bytes: u64,
    /// Runs copied by the CPU
    pub cpu_runs: u64,
    pub cpu_bytes: u64,
    /// Chains issued to the engine
    pub hardware_chains: u64,
    pub hardware_descriptors: u64,
    /// Batches flushed early because the table filled
    pub full_flushes: u64,
    /// Bounded waits that expired
    pub timeouts: u64,
    /// Threshold recalculation windows closed
    pub recalculations: u64,
}

/// Descriptor queue in front of a [`TransferEngine`].
pub struct TransferScheduler<E: TransferEngine> {
    engine: E,
    batch: Vec<TransferDescriptor>,
    /// Hardware-bound descriptors awaiting issue during execution
    chain: Vec<TransferDescriptor>,
    capacity: usize,
    wait: WaitPolicy,
    threshold: AdaptiveThreshold,
    frame_bytes: usize,
    pub stats: TransferStats,
}

impl<E: TransferEngine> TransferScheduler<E> {
    pub fn new(engine: E, wait: WaitPolicy, threshold: AdaptiveThreshold) -> Self {
        let capacity = engine.table_size().max(1);
        Self {
            engine,
            batch: Vec::with_capacity(capacity),
            chain: Vec::with_capacity(capacity),
            capacity,
            wait,
            threshold,
            frame_bytes: 0,
            stats: TransferStats::default(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn threshold(&self) -> &AdaptiveThreshold {
        &self.threshold
    }

    /// Descriptors per batch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Descriptors queued and not yet executed.
    pub fn pending(&self) -> &[TransferDescriptor] {
        &self.batch
    }

    /// Start a fresh batch, discarding anything queued.
    pub fn begin_batch(&mut self) {
        self.batch.clear();
        self.chain.clear();
    }

    /// Queue a descriptor, flushing first if the batch is full.
    pub fn add_transfer(&mut self, desc: TransferDescriptor, target: &mut TransferTarget<'_>) -> Result<()> {
        if desc.count == 0 {
            return Ok(());
        }
        if self.batch.len() >= self.capacity {
            self.stats.full_flushes += 1;
            self.execute_batch(target)?;
        }
        self.batch.push(desc);
        self.stats.descriptors += 1;
        Ok(())
    }

    /// Issue everything queued. The batch is empty afterwards, whether or
    /// not execution succeeded.
    pub fn execute_batch(&mut self, target: &mut TransferTarget<'_>) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut batch = core::mem::take(&mut self.batch);
        log::trace!("[Compositor] executing batch of {} descriptors", batch.len());
        let result = self.run(&batch, target);

        batch.clear();
        self.batch = batch;
        self.chain.clear();
        result
    }

    fn run(&mut self, batch: &[TransferDescriptor], target: &mut TransferTarget<'_>) -> Result<()> {
        self.chain.clear();
        for desc in batch {
            if self.threshold.prefers_cpu(desc.count) {
                // Queued hardware writes to the same bytes must land first
                if self.chain.iter().any(|c| c.overlaps_dst(desc)) {
                    self.issue_chain(target)?;
                }
                target.copy_cpu(desc)?;
                self.stats.cpu_runs += 1;
                self.stats.cpu_bytes += desc.count as u64;
            } else {
                self.chain.push(*desc);
            }
            self.frame_bytes += desc.count;
            self.stats.bytes += desc.count as u64;
        }
        self.issue_chain(target)
    }

    fn issue_chain(&mut self, target: &mut TransferTarget<'_>) -> Result<()> {
        if self.chain.is_empty() {
            return Ok(());
        }

        self.engine.configure(&self.chain);
        self.engine.start(target)?;
        let waited = self.wait_completion();
        self.engine.clear_status();

        self.stats.hardware_chains += 1;
        self.stats.hardware_descriptors += self.chain.len() as u64;
        self.chain.clear();
        waited
    }

    /// Poll the engine until it reports completion.
    pub fn wait_completion(&mut self) -> Result<()> {
        match self.wait {
            WaitPolicy::Unbounded => loop {
                if self.engine.status().contains(EngineStatus::DONE) {
                    return Ok(());
                }
                core::hint::spin_loop();
            },
            WaitPolicy::Bounded { max_polls } => {
                for _ in 0..max_polls {
                    if self.engine.status().contains(EngineStatus::DONE) {
                        return Ok(());
                    }
                    core::hint::spin_loop();
                }
                self.stats.timeouts += 1;
                log::warn!("[Compositor] transfer engine timed out after {} polls", max_polls);
                Err(CompositorError::HardwareTimeout { polls: max_polls })
            }
        }
    }

    /// Drop queued work after a failed frame.
    pub fn abort(&mut self) {
        if !self.batch.is_empty() {
            log::debug!("[Compositor] discarding {} queued descriptors", self.batch.len());
        }
        self.batch.clear();
        self.chain.clear();
    }

    /// Close the frame for the adaptive threshold.
    pub fn end_frame(&mut self) {
        if self.threshold.record_frame(self.frame_bytes) {
            self.stats.recalculations += 1;
        }
        self.frame_bytes = 0;
    }
}

impl<E: TransferEngine> core::fmt::Debug for TransferScheduler<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransferScheduler")
            .field("pending", &self.batch.len())
            .field("capacity", &self.capacity)
            .field("threshold", &self.threshold.current())
            .finish()
    }
}
