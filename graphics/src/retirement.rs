//! Deferred release of GPU resources.
//!
//! GPU commands execute asynchronously, up to the frame latency behind the
//! CPU. A resource dropped or replaced on the CPU may still be referenced by
//! frames in flight, so it is parked in a [`RetirementQueue`] tagged with the
//! frame that last could have used it and only released once the frame fence
//! reports that frame as complete.
//!
//! ```text
//! retire(buffer)                 frame 7 recording, completed = 5
//!   └─► queue: [5: a] [6: b] [7: buffer]
//!
//! drain()                        completed = 6
//!   └─► frees a, b; keeps buffer
//! ```
//!
//! Frame IDs only grow, so the queue is ordered by tag and draining from the
//! front is enough.
//!
//! [`TrackedResource`] is the owning handle that feeds the queue
//! automatically on reassignment and drop.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::FrameClock;

/// A resource waiting for the GPU to finish with it.
pub struct RetiredResource {
    /// Last frame that could reference the resource.
    pub frame_id: u64,
    resource: Box<dyn Any + Send>,
}

impl RetiredResource {
    /// Recover the resource if it has type `T`.
    pub fn downcast<T: 'static>(self) -> Option<T> {
        self.resource.downcast::<T>().ok().map(|b| *b)
    }
}

impl std::fmt::Debug for RetiredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetiredResource")
            .field("frame_id", &self.frame_id)
            .finish_non_exhaustive()
    }
}

/// FIFO of retired resources keyed by frame ID.
///
/// # Thread Safety
///
/// [`retire`](Self::retire) may be called from any thread, e.g. a worker
/// rebuilding geometry while the submission thread renders.
/// [`drain`](Self::drain) runs once per frame on the submission thread and
/// must not race with itself.
pub struct RetirementQueue {
    clock: Arc<FrameClock>,
    queue: Mutex<VecDeque<RetiredResource>>,
}

impl RetirementQueue {
    /// Create an empty queue driven by `clock`.
    pub fn new(clock: Arc<FrameClock>) -> Self {
        Self {
            clock,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// The clock used for tagging.
    pub fn clock(&self) -> &Arc<FrameClock> {
        &self.clock
    }

    /// Retire an opaque resource that may be used by the frame being recorded.
    ///
    /// Returns `true` if the resource was queued, `false` if it was released
    /// immediately.
    pub fn retire<R: Send + 'static>(&self, resource: R) -> bool {
        self.retire_at(self.clock.cur_frame_id(), resource)
    }

    /// Retire a resource whose last use is known to be `frame_id`.
    ///
    /// Resources whose frame is already GPU-complete are dropped right away.
    pub fn retire_at<R: Send + 'static>(&self, frame_id: u64, resource: R) -> bool {
        if frame_id <= self.clock.completed_frame_id() {
            drop(resource);
            return false;
        }

        let mut queue = self.queue.lock();
        // Keep the queue sorted; an earlier tag behind a later one would be
        // held back until the later frame anyway.
        let frame_id = queue.back().map_or(frame_id, |last| last.frame_id.max(frame_id));
        log::trace!("Retiring resource until frame {frame_id}");
        queue.push_back(RetiredResource {
            frame_id,
            resource: Box::new(resource),
        });
        true
    }

    /// Release everything the GPU is done with. Returns the number released.
    pub fn drain(&self) -> usize {
        let completed = self.clock.completed_frame_id();
        let released: Vec<RetiredResource> = {
            let mut queue = self.queue.lock();
            let ready = queue.iter().take_while(|r| r.frame_id <= completed).count();
            queue.drain(..ready).collect()
        };
        // Drop outside the lock: destructors may retire further resources.
        let count = released.len();
        if count > 0 {
            log::trace!("Released {count} retired resources (completed frame {completed})");
        }
        drop(released);
        count
    }

    /// Release everything regardless of GPU progress.
    ///
    /// Only valid after the GPU has been idled.
    pub fn flush_all(&self) -> usize {
        let released: Vec<RetiredResource> = self.queue.lock().drain(..).collect();
        released.len()
    }

    /// Number of resources waiting.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Frame tags of waiting resources, front to back.
    pub fn pending_frames(&self) -> Vec<u64> {
        self.queue.lock().iter().map(|r| r.frame_id).collect()
    }
}

impl Drop for RetirementQueue {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().len();
        if pending > 0 {
            log::debug!("Dropping retirement queue with {pending} resources");
        }
    }
}

static_assertions::assert_impl_all!(RetirementQueue: Send, Sync);

/// Exclusive owner of a GPU resource that defers its release.
///
/// Replacing or dropping the held resource hands it to the retirement queue
/// instead of releasing it on the spot.
pub struct TrackedResource<T: Send + 'static> {
    resource: Option<T>,
    retirement: Arc<RetirementQueue>,
}

impl<T: Send + 'static> TrackedResource<T> {
    /// Create an empty handle.
    pub fn new(retirement: Arc<RetirementQueue>) -> Self {
        Self {
            resource: None,
            retirement,
        }
    }

    /// Create a handle owning `resource`.
    pub fn with_resource(retirement: Arc<RetirementQueue>, resource: T) -> Self {
        Self {
            resource: Some(resource),
            retirement,
        }
    }

    /// The held resource.
    pub fn get(&self) -> Option<&T> {
        self.resource.as_ref()
    }

    /// Returns `true` if a resource is held.
    pub fn is_set(&self) -> bool {
        self.resource.is_some()
    }

    /// Replace the held resource, retiring the previous one.
    pub fn set(&mut self, resource: T) {
        if let Some(old) = self.resource.replace(resource) {
            self.retirement.retire(old);
        }
    }

    /// Retire the held resource and leave the handle empty.
    pub fn reset(&mut self) {
        if let Some(old) = self.resource.take() {
            self.retirement.retire(old);
        }
    }
}

impl<T: Send + 'static> Drop for TrackedResource<T> {
    fn drop(&mut self) {
        self.reset();
    }
}
