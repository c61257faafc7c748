//! Dirty Inbox
//!
//! Handoff queue for damage reported outside the frame driver, e.g. from an
//! interrupt handler that just wrote into a layer buffer. Posting never
//! blocks: when the queue is full or momentarily locked, the post collapses
//! into an "invalidate everything" marker so the change is still repainted.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::geometry::Rect;
use crate::layer::LayerHandle;

/// Default queue depth.
pub const INBOX_CAPACITY: usize = 32;

struct Queue<const N: usize> {
    entries: [Option<(LayerHandle, Rect)>; N],
    len: usize,
    overflowed: bool,
}

/// Bounded lock-protected queue of `(layer, local rect)` damage posts.
///
/// Meant to live in a `static` and be attached to the compositor with
/// `Compositor::attach_inbox`.
pub struct DirtyInbox<const N: usize = INBOX_CAPACITY> {
    queue: Mutex<Queue<N>>,
    /// Set when a post found the queue locked
    missed: AtomicBool,
}

impl<const N: usize> DirtyInbox<N> {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                entries: [None; N],
                len: 0,
                overflowed: false,
            }),
            missed: AtomicBool::new(false),
        }
    }

    /// Report damage to a layer, in layer-local coordinates.
    ///
    /// Returns false when the post degraded to a full invalidation.
    pub fn post(&self, handle: LayerHandle, rect: Rect) -> bool {
        // Never spin here: the holder may be the code we interrupted
        let Some(mut queue) = self.queue.try_lock() else {
            self.missed.store(true, Ordering::Release);
            return false;
        };
        if queue.len == N {
            queue.overflowed = true;
            return false;
        }
        let slot = queue.len;
        queue.entries[slot] = Some((handle, rect));
        queue.len += 1;
        true
    }

    /// Ask for every layer to be repainted.
    pub fn post_invalidate(&self) {
        match self.queue.try_lock() {
            Some(mut queue) => queue.overflowed = true,
            None => self.missed.store(true, Ordering::Release),
        }
    }

    /// Number of queued posts.
    pub fn len(&self) -> usize {
        self.queue.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && !self.missed.load(Ordering::Acquire)
    }

    /// Hand every queued post to `f` and empty the queue.
    ///
    /// Returns true when precise damage was lost and the caller must
    /// invalidate every layer.
    pub fn drain(&self, mut f: impl FnMut(LayerHandle, Rect)) -> bool {
        let mut queue = self.queue.lock();
        let len = queue.len;
        for entry in queue.entries[..len].iter_mut() {
            if let Some((handle, rect)) = entry.take() {
                f(handle, rect);
            }
        }
        queue.len = 0;
        let overflowed = core::mem::replace(&mut queue.overflowed, false);
        drop(queue);

        let missed = self.missed.swap(false, Ordering::AcqRel);
        if overflowed || missed {
            log::debug!("[Compositor] dirty inbox overflowed, invalidating all layers");
        }
        overflowed || missed
    }
}

impl<const N: usize> Default for DirtyInbox<N> {
    fn default() -> Self {
        Self::new()
    }
}
