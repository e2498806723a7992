//! GPU device abstraction layer.
//!
//! The renderer core never talks to a graphics API directly. Everything it
//! needs from the device is expressed by the traits in this module:
//!
//! - [`GpuDevice`]: resource creation, submission, queue-side fence signal
//! - [`GpuFence`]: 64-bit monotonic fence, non-blocking read and bounded wait
//! - [`GpuBuffer`], [`GpuQueryHeap`]: GPU-resident storage
//! - [`GpuCommandAllocator`], [`GpuCommandList`]: command recording
//!
//! # Available Backends
//!
//! - `dummy` (default): in-memory backend that records every command, used
//!   by tests and headless tooling
//!
//! Device/adapter creation lives outside this crate; a real backend hands an
//! `Arc<dyn GpuDevice>` to [`RenderHost::init`](crate::RenderHost::init).

#[cfg(feature = "dummy")]
pub mod dummy;

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RenderResult;
use crate::types::{BufferDescriptor, IndexFormat, QueryKind, Transition};

/// GPU device trait for abstracting the graphics API.
pub trait GpuDevice: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a fence starting at `initial_value`.
    fn create_fence(&self, initial_value: u64) -> RenderResult<Arc<dyn GpuFence>>;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RenderResult<Arc<dyn GpuBuffer>>;

    /// Create a heap of `count` hardware queries.
    fn create_query_heap(&self, kind: QueryKind, count: u32) -> RenderResult<Arc<dyn GpuQueryHeap>>;

    /// Create a command allocator.
    fn create_command_allocator(&self) -> RenderResult<Box<dyn GpuCommandAllocator>>;

    /// Create a command list recording into `allocator`. The list starts open.
    fn create_command_list(
        &self,
        allocator: &dyn GpuCommandAllocator,
        label: &str,
    ) -> RenderResult<Box<dyn GpuCommandList>>;

    /// Submit closed command lists to the queue, in order.
    fn execute(&self, lists: &[&dyn GpuCommandList]) -> RenderResult<()>;

    /// Enqueue a fence signal behind all previously submitted work.
    fn signal(&self, fence: &dyn GpuFence, value: u64) -> RenderResult<()>;
}

/// A monotonically increasing GPU timeline value.
pub trait GpuFence: Send + Sync {
    /// Last value the GPU reached. Never blocks.
    fn completed_value(&self) -> u64;

    /// Block until the fence reaches `value` or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Errors mean the device is gone.
    fn wait(&self, value: u64, timeout: Duration) -> RenderResult<bool>;
}

/// A GPU buffer.
pub trait GpuBuffer: Send + Sync {
    /// Unique resource id.
    fn id(&self) -> u64;

    /// Size in bytes.
    fn size(&self) -> u64;

    /// GPU virtual address of the first byte.
    fn gpu_address(&self) -> u64;

    /// Debug label.
    fn label(&self) -> Option<&str>;

    /// Write through a persistent CPU mapping.
    fn write(&self, offset: u64, data: &[u8]) -> RenderResult<()>;
}

/// A heap of hardware queries.
pub trait GpuQueryHeap: Send + Sync {
    /// Unique resource id.
    fn id(&self) -> u64;

    /// Number of queries in the heap.
    fn capacity(&self) -> u32;
}

/// Backing memory for command lists.
pub trait GpuCommandAllocator: Send {
    /// Unique id.
    fn id(&self) -> u64;

    /// Reclaim all memory. The GPU must be done with every list recorded
    /// from this allocator.
    fn reset(&mut self) -> RenderResult<()>;
}

/// A recordable command list.
pub trait GpuCommandList: Send {
    /// Unique id.
    fn id(&self) -> u64;

    /// Reopen for recording into `allocator`.
    fn reset(&mut self, allocator: &dyn GpuCommandAllocator, label: &str) -> RenderResult<()>;

    /// Finish recording.
    fn close(&mut self) -> RenderResult<()>;

    /// Insert a debug marker.
    fn marker(&mut self, label: &str);

    /// Record a batch of resource transitions.
    fn transition(&mut self, transitions: &[Transition]);

    /// Begin an occlusion query.
    fn begin_query(&mut self, heap: &dyn GpuQueryHeap, index: u32);

    /// End an occlusion query.
    fn end_query(&mut self, heap: &dyn GpuQueryHeap, index: u32);

    /// Copy raw results of `queries` into `dst` at `dst_offset`, 8 bytes each.
    fn resolve_queries(
        &mut self,
        heap: &dyn GpuQueryHeap,
        queries: Range<u32>,
        dst: &dyn GpuBuffer,
        dst_offset: u64,
    );

    /// Predicate subsequent draws on the 8-byte value at `offset`, or clear
    /// predication with `None`.
    fn set_predication(&mut self, source: Option<(&dyn GpuBuffer, u64)>);

    /// Bind the combined vertex/index buffer.
    fn set_geometry(&mut self, buffer: &dyn GpuBuffer, index_offset: u64, format: IndexFormat);

    /// Draw `count` boxes from a packed AABB buffer starting at `first`.
    fn draw_boxes(&mut self, boxes: &dyn GpuBuffer, first: u64, count: u32);

    /// Indexed draw from the bound geometry.
    fn draw_indexed(&mut self, index_count: u32, first_index: u32);
}
