//! # Umbra Graphics
//!
//! GPU-facing core of the Umbra renderer.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`FrameVersioning`] - Per-frame data ring paced by a GPU fence
//! - [`RetirementQueue`] / [`TrackedResource`] - Deferred release of resources the GPU may still use
//! - [`CmdListPool`] - Command-list recycling per ring slot
//! - [`hierarchy`] - Bounding volume hierarchy with per-frame culling and occlusion scheduling
//! - [`QueryBatch`] - Occlusion query batches and predication
//! - [`RenderPipeline`] - Pull-based consumption of asynchronously built render stages
//! - [`Renderer`] / [`RenderHost`] - Frame lifecycle over an explicit [`RenderContext`]
//! - A dummy backend (feature `dummy`) for testing without a GPU
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use umbra_graphics::backend::dummy::DummyDevice;
//! use umbra_graphics::{RenderHost, RendererConfig};
//!
//! let mut host = RenderHost::new(RendererConfig::default());
//! let renderer = host.init(Arc::new(DummyDevice::new())).unwrap();
//!
//! renderer.begin_frame().unwrap();
//! // append stages, then drive submission
//! renderer.submit_pending().unwrap();
//! renderer.end_frame().unwrap();
//! ```

pub mod backend;
pub mod cmd_list;
pub mod error;
pub mod frame;
pub mod hierarchy;
pub mod layer;
pub mod occlusion;
pub mod pipeline;
pub mod profiling;
pub mod renderer;
pub mod retirement;
pub mod stream_allocator;
pub mod types;

// Re-export main types for convenience
pub use backend::{GpuBuffer, GpuCommandList, GpuDevice, GpuFence, GpuQueryHeap};
pub use cmd_list::{CmdList, CmdListPool};
pub use error::{RenderError, RenderResult};
pub use frame::{FrameClock, FrameVersioning};
pub use hierarchy::{BuildParams, Bvh, HierarchyObject, ScheduleParams, TreeStructure, View};
pub use layer::{GeometryLayer, GeometrySource};
pub use occlusion::{QueryBatch, QueryHeapPool, NPOS};
pub use pipeline::{PipelineStage, Pull, RenderPipeline, RenderStage, StagePhase, WorkItem};
pub use renderer::{RenderContext, RenderHost, Renderer, RendererConfig};
pub use retirement::{RetirementQueue, TrackedResource};
pub use stream_allocator::{StreamAllocation, StreamAllocator};
pub use types::{BufferDescriptor, BufferUsage, IndexFormat, ResourceState};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// Only logs versions; all GPU state lives in a [`RenderContext`].
pub fn init() {
    umbra_core::init();
    log::info!("Umbra Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
    }
}
