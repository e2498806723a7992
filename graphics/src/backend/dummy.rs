//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't touch GPU hardware. Buffers are plain byte vectors,
//! command lists record into a [`Command`] log that becomes visible through
//! [`DummyDevice::queue_log`] once submitted, and fences either complete as
//! soon as they are signaled or are advanced by hand with
//! [`DummyDevice::complete_up_to`], so tests can simulate a GPU that lags
//! behind the CPU.
//!
//! Resolving queries writes `1` (visible) for every query, except for indices
//! registered with [`DummyDevice::set_occluded_queries`], which resolve to `0`.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{RenderError, RenderResult};
use crate::types::{BufferDescriptor, IndexFormat, QueryKind, Transition};

use super::{GpuBuffer, GpuCommandAllocator, GpuCommandList, GpuDevice, GpuFence, GpuQueryHeap};

/// A command recorded by a [`DummyCommandList`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Marker(String),
    Transition(Transition),
    BeginQuery { heap: u64, index: u32 },
    EndQuery { heap: u64, index: u32 },
    ResolveQueries { heap: u64, queries: Range<u32>, dst: u64, dst_offset: u64 },
    SetPredication(Option<(u64, u64)>),
    SetGeometry { buffer: u64, index_offset: u64, format: IndexFormat },
    DrawBoxes { buffer: u64, first: u64, count: u32 },
    DrawIndexed { index_count: u32, first_index: u32 },
}

/// An event observed by the dummy queue, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Execute {
        list: u64,
        label: String,
        commands: Vec<Command>,
    },
    Signal {
        value: u64,
    },
}

#[derive(Default)]
struct DummyState {
    next_id: AtomicU64,
    manual_completion: AtomicBool,
    lost: AtomicBool,
    live_buffers: AtomicUsize,
    buffers: Mutex<Vec<Weak<DummyBuffer>>>,
    fences: Mutex<Vec<Weak<DummyFence>>>,
    closed_lists: Mutex<HashMap<u64, (String, Vec<Command>)>>,
    queue: Mutex<Vec<QueueEvent>>,
    occluded: Mutex<Vec<u32>>,
}

impl DummyState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_lost(&self) -> RenderResult<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(RenderError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn find_buffer(&self, id: u64) -> Option<Arc<DummyBuffer>> {
        self.buffers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|b| b.id == id)
    }

    fn replay_resolve(&self, queries: &Range<u32>, dst: u64, dst_offset: u64) {
        let Some(buffer) = self.find_buffer(dst) else {
            log::warn!("DummyDevice: resolve into unknown buffer {dst}");
            return;
        };
        let occluded = self.occluded.lock();
        let mut data = buffer.data.lock();
        for (slot, query) in queries.clone().enumerate() {
            let value: u64 = if occluded.contains(&query) { 0 } else { 1 };
            let offset = (dst_offset + slot as u64 * 8) as usize;
            if offset + 8 <= data.len() {
                data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

/// Dummy GPU device.
#[derive(Clone, Default)]
pub struct DummyDevice {
    state: Arc<DummyState>,
}

impl DummyDevice {
    /// Create a device whose fences complete as soon as they are signaled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device whose fences only advance through
    /// [`complete_up_to`](Self::complete_up_to).
    pub fn with_manual_completion() -> Self {
        let device = Self::default();
        device.state.manual_completion.store(true, Ordering::Release);
        device
    }

    /// Let the simulated GPU finish all work up to fence value `value`.
    ///
    /// Never advances a fence past the last value signaled on it.
    pub fn complete_up_to(&self, value: u64) {
        for fence in self.state.fences.lock().iter().filter_map(Weak::upgrade) {
            let target = value.min(fence.signaled.load(Ordering::Acquire));
            fence.completed.fetch_max(target, Ordering::AcqRel);
        }
    }

    /// Let the simulated GPU finish everything submitted so far.
    pub fn complete_all(&self) {
        self.complete_up_to(u64::MAX);
    }

    /// Simulate device removal. Every later fence wait and submission fails.
    pub fn lose_device(&self) {
        self.state.lost.store(true, Ordering::Release);
    }

    /// Queries with these indices resolve to "occluded".
    pub fn set_occluded_queries(&self, indices: impl IntoIterator<Item = u32>) {
        *self.state.occluded.lock() = indices.into_iter().collect();
    }

    /// Everything the queue has seen so far.
    pub fn queue_log(&self) -> Vec<QueueEvent> {
        self.state.queue.lock().clone()
    }

    /// Commands of all executed lists, flattened in submission order.
    pub fn executed_commands(&self) -> Vec<Command> {
        self.state
            .queue
            .lock()
            .iter()
            .filter_map(|event| match event {
                QueueEvent::Execute { commands, .. } => Some(commands.clone()),
                QueueEvent::Signal { .. } => None,
            })
            .flatten()
            .collect()
    }

    /// Number of buffers that have not been dropped yet.
    pub fn live_buffer_count(&self) -> usize {
        self.state.live_buffers.load(Ordering::Acquire)
    }

    /// Snapshot of a buffer's contents, if it is still alive.
    pub fn read_buffer(&self, id: u64) -> Option<Vec<u8>> {
        self.state.find_buffer(id).map(|b| b.data.lock().clone())
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_fence(&self, initial_value: u64) -> RenderResult<Arc<dyn GpuFence>> {
        self.state.check_lost()?;
        let fence = Arc::new(DummyFence {
            completed: AtomicU64::new(initial_value),
            signaled: AtomicU64::new(initial_value),
            state: Arc::downgrade(&self.state),
        });
        self.state.fences.lock().push(Arc::downgrade(&fence));
        Ok(fence)
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RenderResult<Arc<dyn GpuBuffer>> {
        self.state.check_lost()?;
        if descriptor.size == 0 {
            return Err(RenderError::ResourceCreationFailed(format!(
                "zero-sized buffer {:?}",
                descriptor.label
            )));
        }
        log::trace!(
            "DummyDevice: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let id = self.state.next_id();
        let buffer = Arc::new(DummyBuffer {
            id,
            size: descriptor.size,
            label: descriptor.label.clone(),
            data: Mutex::new(vec![0; descriptor.size as usize]),
            state: Arc::downgrade(&self.state),
        });
        self.state.live_buffers.fetch_add(1, Ordering::AcqRel);
        self.state.buffers.lock().push(Arc::downgrade(&buffer));
        Ok(buffer)
    }

    fn create_query_heap(&self, kind: QueryKind, count: u32) -> RenderResult<Arc<dyn GpuQueryHeap>> {
        self.state.check_lost()?;
        log::trace!("DummyDevice: creating {kind:?} query heap ({count} queries)");
        Ok(Arc::new(DummyQueryHeap {
            id: self.state.next_id(),
            capacity: count,
        }))
    }

    fn create_command_allocator(&self) -> RenderResult<Box<dyn GpuCommandAllocator>> {
        self.state.check_lost()?;
        Ok(Box::new(DummyCommandAllocator {
            id: self.state.next_id(),
            resets: 0,
        }))
    }

    fn create_command_list(
        &self,
        allocator: &dyn GpuCommandAllocator,
        label: &str,
    ) -> RenderResult<Box<dyn GpuCommandList>> {
        self.state.check_lost()?;
        log::trace!(
            "DummyDevice: creating command list '{label}' on allocator {}",
            allocator.id()
        );
        Ok(Box::new(DummyCommandList {
            id: self.state.next_id(),
            label: label.to_string(),
            commands: Vec::new(),
            open: true,
            state: self.state.clone(),
        }))
    }

    fn execute(&self, lists: &[&dyn GpuCommandList]) -> RenderResult<()> {
        self.state.check_lost()?;
        for list in lists {
            let Some((label, commands)) = self.state.closed_lists.lock().remove(&list.id()) else {
                return Err(RenderError::CommandListFailed(format!(
                    "command list {} executed while open",
                    list.id()
                )));
            };
            for command in &commands {
                if let Command::ResolveQueries {
                    queries,
                    dst,
                    dst_offset,
                    ..
                } = command
                {
                    self.state.replay_resolve(queries, *dst, *dst_offset);
                }
            }
            self.state.queue.lock().push(QueueEvent::Execute {
                list: list.id(),
                label,
                commands,
            });
        }
        Ok(())
    }

    fn signal(&self, fence: &dyn GpuFence, value: u64) -> RenderResult<()> {
        self.state.check_lost()?;
        self.state.queue.lock().push(QueueEvent::Signal { value });
        // Fence identity is not visible through the trait, so every fence of
        // this device shares the queue timeline.
        for dummy in self.state.fences.lock().iter().filter_map(Weak::upgrade) {
            dummy.signaled.fetch_max(value, Ordering::AcqRel);
            if !self.state.manual_completion.load(Ordering::Acquire) {
                dummy.completed.fetch_max(value, Ordering::AcqRel);
            }
        }
        log::trace!(
            "DummyDevice: signal {value} (completed {})",
            fence.completed_value()
        );
        Ok(())
    }
}

/// Dummy fence.
pub struct DummyFence {
    completed: AtomicU64,
    signaled: AtomicU64,
    state: Weak<DummyState>,
}

impl GpuFence for DummyFence {
    fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn wait(&self, value: u64, timeout: Duration) -> RenderResult<bool> {
        let start = Instant::now();
        loop {
            if let Some(state) = self.state.upgrade() {
                state.check_lost()?;
            }
            if self.completed_value() >= value {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::yield_now();
        }
    }
}

/// Dummy buffer backed by host memory.
pub struct DummyBuffer {
    id: u64,
    size: u64,
    label: Option<String>,
    data: Mutex<Vec<u8>>,
    state: Weak<DummyState>,
}

impl GpuBuffer for DummyBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn gpu_address(&self) -> u64 {
        self.id << 32
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn write(&self, offset: u64, data: &[u8]) -> RenderResult<()> {
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(RenderError::InvalidParameter(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                self.size
            )));
        }
        self.data.lock()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for DummyBuffer {
    fn drop(&mut self) {
        log::trace!("DummyDevice: destroying buffer {:?}", self.label);
        if let Some(state) = self.state.upgrade() {
            state.live_buffers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Dummy query heap.
pub struct DummyQueryHeap {
    id: u64,
    capacity: u32,
}

impl GpuQueryHeap for DummyQueryHeap {
    fn id(&self) -> u64 {
        self.id
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Dummy command allocator.
pub struct DummyCommandAllocator {
    id: u64,
    resets: u32,
}

impl DummyCommandAllocator {
    /// How many times the allocator has been reset.
    pub fn resets(&self) -> u32 {
        self.resets
    }
}

impl GpuCommandAllocator for DummyCommandAllocator {
    fn id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self) -> RenderResult<()> {
        self.resets += 1;
        Ok(())
    }
}

/// Dummy command list.
pub struct DummyCommandList {
    id: u64,
    label: String,
    commands: Vec<Command>,
    open: bool,
    state: Arc<DummyState>,
}

impl DummyCommandList {
    fn record(&mut self, command: Command) {
        debug_assert!(self.open, "recording into closed command list '{}'", self.label);
        self.commands.push(command);
    }
}

impl GpuCommandList for DummyCommandList {
    fn id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self, _allocator: &dyn GpuCommandAllocator, label: &str) -> RenderResult<()> {
        self.state.check_lost()?;
        if self.open {
            return Err(RenderError::CommandListFailed(format!(
                "reset of open command list '{}'",
                self.label
            )));
        }
        self.label = label.to_string();
        self.commands.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> RenderResult<()> {
        self.state.check_lost()?;
        if !self.open {
            return Err(RenderError::CommandListFailed(format!(
                "command list '{}' closed twice",
                self.label
            )));
        }
        self.open = false;
        self.state
            .closed_lists
            .lock()
            .insert(self.id, (self.label.clone(), std::mem::take(&mut self.commands)));
        Ok(())
    }

    fn marker(&mut self, label: &str) {
        self.record(Command::Marker(label.to_string()));
    }

    fn transition(&mut self, transitions: &[Transition]) {
        for t in transitions {
            self.record(Command::Transition(*t));
        }
    }

    fn begin_query(&mut self, heap: &dyn GpuQueryHeap, index: u32) {
        self.record(Command::BeginQuery {
            heap: heap.id(),
            index,
        });
    }

    fn end_query(&mut self, heap: &dyn GpuQueryHeap, index: u32) {
        self.record(Command::EndQuery {
            heap: heap.id(),
            index,
        });
    }

    fn resolve_queries(
        &mut self,
        heap: &dyn GpuQueryHeap,
        queries: Range<u32>,
        dst: &dyn GpuBuffer,
        dst_offset: u64,
    ) {
        self.record(Command::ResolveQueries {
            heap: heap.id(),
            queries,
            dst: dst.id(),
            dst_offset,
        });
    }

    fn set_predication(&mut self, source: Option<(&dyn GpuBuffer, u64)>) {
        self.record(Command::SetPredication(
            source.map(|(buffer, offset)| (buffer.id(), offset)),
        ));
    }

    fn set_geometry(&mut self, buffer: &dyn GpuBuffer, index_offset: u64, format: IndexFormat) {
        self.record(Command::SetGeometry {
            buffer: buffer.id(),
            index_offset,
            format,
        });
    }

    fn draw_boxes(&mut self, boxes: &dyn GpuBuffer, first: u64, count: u32) {
        self.record(Command::DrawBoxes {
            buffer: boxes.id(),
            first,
            count,
        });
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        self.record(Command::DrawIndexed {
            index_count,
            first_index,
        });
    }
}

static_assertions::assert_impl_all!(DummyDevice: Send, Sync);
