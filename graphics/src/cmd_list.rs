//! Per-frame command-list recycling.
//!
//! Every ring slot of [`FrameVersioning`](crate::FrameVersioning) owns one
//! [`CmdListPool`]. During a frame, [`CmdListPool::acquire`] hands out
//! allocator/list pairs in order, indexed by a counter that restarts at zero
//! whenever the slot is reused. Pairs are created lazily the first time the
//! counter reaches them and reset (not recreated) afterwards. Since the slot
//! is only reused once its previous frame is GPU-complete, resetting the
//! allocator is always safe.
//!
//! ```text
//! frame N   (slot 0): acquire → ctx0  acquire → ctx1  acquire → ctx2 (new)
//! frame N+k (slot 0): acquire → ctx0' acquire → ctx1'            ctx2 idle
//! ```

use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use umbra_core::pool::Poolable;

use crate::backend::{GpuCommandAllocator, GpuCommandList, GpuDevice};
use crate::error::RenderResult;
use crate::types::Transition;

/// Allocator, list and pending barriers of one pool entry.
pub struct CmdContext {
    allocator: Box<dyn GpuCommandAllocator>,
    list: Box<dyn GpuCommandList>,
    pending_barriers: Vec<Transition>,
    label: String,
    version: u32,
    open: bool,
}

impl CmdContext {
    fn flush_barriers(&mut self) {
        if !self.pending_barriers.is_empty() {
            self.list.transition(&self.pending_barriers);
            self.pending_barriers.clear();
        }
    }
}

/// Handle to a command list acquired from a [`CmdListPool`].
///
/// Cheap to clone and `Send`, so a stage built on a worker thread can record
/// into it and hand it back to the submission thread.
#[derive(Clone)]
pub struct CmdList {
    ctx: Arc<Mutex<CmdContext>>,
}

impl CmdList {
    /// Debug label, including the reuse version.
    pub fn label(&self) -> String {
        let ctx = self.ctx.lock();
        format!("{} #{}", ctx.label, ctx.version)
    }

    /// Backend id of the underlying list.
    pub fn id(&self) -> u64 {
        self.ctx.lock().list.id()
    }

    /// How many times the underlying list has been reused.
    pub fn version(&self) -> u32 {
        self.ctx.lock().version
    }

    /// Returns `true` while the list accepts commands.
    pub fn is_open(&self) -> bool {
        self.ctx.lock().open
    }

    /// Queue a resource transition. Transitions are batched until the next
    /// recorded command or [`flush_barriers`](Self::flush_barriers).
    pub fn resource_barrier(&self, transition: Transition) {
        self.ctx.lock().pending_barriers.push(transition);
    }

    /// Emit all queued transitions in one call.
    pub fn flush_barriers(&self) {
        self.ctx.lock().flush_barriers();
    }

    /// Lock the list for recording. Pending barriers are flushed first.
    pub fn record(&self) -> MappedMutexGuard<'_, dyn GpuCommandList + 'static> {
        let mut ctx = self.ctx.lock();
        ctx.flush_barriers();
        MutexGuard::map(ctx, |ctx| ctx.list.as_mut())
    }

    /// Finish recording. Closing an already closed list is a no-op.
    pub fn close(&self) -> RenderResult<()> {
        let mut ctx = self.ctx.lock();
        if ctx.open {
            ctx.flush_barriers();
            ctx.list.close()?;
            ctx.open = false;
        }
        Ok(())
    }

    /// Close (if needed) and execute on the device queue.
    pub fn submit(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        self.close()?;
        let ctx = self.ctx.lock();
        log::trace!("Submitting command list '{}' #{}", ctx.label, ctx.version);
        device.execute(&[ctx.list.as_ref()])
    }
}

impl std::fmt::Debug for CmdList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdList").field("label", &self.label()).finish()
    }
}

static_assertions::assert_impl_all!(CmdList: Send, Sync);

/// Pool of reusable command lists for one ring slot.
#[derive(Default)]
pub struct CmdListPool {
    contexts: Vec<Arc<Mutex<CmdContext>>>,
    first_free: usize,
}

impl CmdListPool {
    /// Hand out the next command list of this frame, open for recording.
    ///
    /// # Errors
    ///
    /// Allocator or list creation/reset failures are fatal.
    pub fn acquire(&mut self, device: &dyn GpuDevice, label: &str) -> RenderResult<CmdList> {
        if self.first_free == self.contexts.len() {
            let allocator = device.create_command_allocator()?;
            let list = device.create_command_list(allocator.as_ref(), label)?;
            log::debug!("Command list pool grown to {}", self.contexts.len() + 1);
            self.contexts.push(Arc::new(Mutex::new(CmdContext {
                allocator,
                list,
                pending_barriers: Vec::new(),
                label: label.to_string(),
                version: 0,
                open: true,
            })));
        } else {
            let mut ctx = self.contexts[self.first_free].lock();
            if ctx.open {
                // Abandoned by a terminated stage last time around.
                ctx.list.close()?;
            }
            let CmdContext {
                allocator, list, ..
            } = &mut *ctx;
            allocator.reset()?;
            list.reset(allocator.as_ref(), label)?;
            ctx.pending_barriers.clear();
            ctx.label = label.to_string();
            ctx.version += 1;
            ctx.open = true;
        }

        let ctx = self.contexts[self.first_free].clone();
        self.first_free += 1;
        Ok(CmdList { ctx })
    }

    /// Lists handed out this frame.
    pub fn in_use(&self) -> usize {
        self.first_free
    }

    /// Lists created so far.
    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }
}

impl Poolable for CmdListPool {
    fn new_empty() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.first_free = 0;
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::dummy::{Command, DummyDevice};
    use crate::types::ResourceState;

    #[test]
    fn test_lazy_creation_and_reuse() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::new_empty();

        let a = pool.acquire(&device, "a").unwrap();
        let b = pool.acquire(&device, "b").unwrap();
        assert_eq!(pool.capacity(), 2);
        assert_ne!(a.id(), b.id());
        a.close().unwrap();
        b.close().unwrap();

        pool.reset();
        assert_eq!(pool.in_use(), 0);

        let a2 = pool.acquire(&device, "a").unwrap();
        assert_eq!(a2.id(), a.id());
        assert_eq!(a2.version(), 1);
        assert_eq!(a2.label(), "a #1");
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_reuse_of_abandoned_list() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::new_empty();
        let list = pool.acquire(&device, "abandoned").unwrap();
        assert!(list.is_open());

        pool.reset();
        let list = pool.acquire(&device, "again").unwrap();
        assert!(list.is_open());
        assert_eq!(list.version(), 1);
    }

    #[test]
    fn test_barriers_are_batched() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::new_empty();
        let list = pool.acquire(&device, "barriers").unwrap();

        let t = |buffer| Transition {
            buffer,
            before: ResourceState::COPY_DEST,
            after: ResourceState::PREDICATION,
        };
        list.resource_barrier(t(1));
        list.resource_barrier(t(2));
        list.record().draw_indexed(6, 0);
        list.submit(&device).unwrap();

        assert_eq!(
            device.executed_commands(),
            vec![
                Command::Transition(t(1)),
                Command::Transition(t(2)),
                Command::DrawIndexed {
                    index_count: 6,
                    first_index: 0
                },
            ]
        );
    }
}
