//! Renderer context and per-frame lifecycle.
//!
//! [`RenderContext`] is the explicit handle every GPU-facing component is
//! built from: device, frame clock, retirement queue and the shared
//! occlusion pools. [`Renderer`] drives one frame at a time:
//!
//! ```text
//! begin_frame ──► append_stage* ──► next_work_item / submit_pending ──► end_frame
//!     │                                                                  │
//!     ├─ advance ring slot (bounded wait)                                ├─ tag stream allocations
//!     ├─ reset query cursor, reclaim streams                             ├─ signal frame fence
//!     └─ drain retired resources                                         └─ drain retired resources
//! ```
//!
//! [`RenderHost`] owns the renderer lazily: best-effort auto initialization
//! at startup, explicit idempotent [`init`](RenderHost::init) afterwards.

use std::sync::Arc;
use std::time::Duration;

use umbra_core::compute::{default_thread_count, WorkerPool};
use umbra_core::pool::Poolable;

use crate::backend::GpuDevice;
use crate::cmd_list::CmdListPool;
use crate::error::{RenderError, RenderResult};
use crate::frame::{FrameClock, FrameVersioning, DEFAULT_FENCE_TIMEOUT, MAX_FRAME_LATENCY};
use crate::occlusion::{QueryBatch, QueryHeapPool, QUERY_RESULT_SIZE};
use crate::pipeline::{PendingStage, PipelineStage, Pull, RenderPipeline, StageContext};
use crate::profiling::profile_function;
use crate::retirement::RetirementQueue;
use crate::stream_allocator::StreamAllocator;
use crate::types::{BufferUsage, QueryKind};

/// Bytes of one occlusion box in the box stream.
pub const OCCLUSION_BOX_SIZE: u64 = std::mem::size_of::<umbra_core::bounds::PackedAabb>() as u64;

/// Renderer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Frames the CPU may prepare ahead of the GPU (1..=3).
    pub max_frame_latency: usize,
    /// Grow the latency on demand instead of starting at the maximum.
    pub adaptive_latency: bool,
    /// Bounded wait on the frame fence.
    pub fence_timeout: Duration,
    /// Initial capacity of the occlusion box stream, in boxes.
    pub occlusion_box_chunk: u64,
    /// Initial capacity of the transient query results stream, in results.
    pub query_results_chunk: u64,
    /// Initial size of the shared query heap.
    pub query_heap_capacity: u32,
    /// Threads building render stages.
    pub worker_threads: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_frame_latency: MAX_FRAME_LATENCY,
            adaptive_latency: true,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            occlusion_box_chunk: 4096,
            query_results_chunk: 1024,
            query_heap_capacity: 1024,
            worker_threads: default_thread_count(),
        }
    }
}

impl RendererConfig {
    pub fn with_max_frame_latency(mut self, latency: usize) -> Self {
        self.max_frame_latency = latency;
        self
    }

    pub fn with_adaptive_latency(mut self, adaptive: bool) -> Self {
        self.adaptive_latency = adaptive;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_occlusion_box_chunk(mut self, boxes: u64) -> Self {
        self.occlusion_box_chunk = boxes;
        self
    }

    pub fn with_query_results_chunk(mut self, results: u64) -> Self {
        self.query_results_chunk = results;
        self
    }

    pub fn with_query_heap_capacity(mut self, queries: u32) -> Self {
        self.query_heap_capacity = queries;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    fn validate(&self) -> RenderResult<()> {
        if !(1..=MAX_FRAME_LATENCY).contains(&self.max_frame_latency) {
            return Err(RenderError::InvalidParameter(format!(
                "max_frame_latency {} outside 1..={MAX_FRAME_LATENCY}",
                self.max_frame_latency
            )));
        }
        if self.occlusion_box_chunk == 0
            || self.query_results_chunk == 0
            || self.query_heap_capacity == 0
        {
            return Err(RenderError::InvalidParameter(
                "occlusion stream and query heap capacities must be non-zero".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(RenderError::InvalidParameter(
                "at least one worker thread is required".into(),
            ));
        }
        Ok(())
    }
}

/// Shared GPU context handed to every component that creates or tracks
/// GPU resources.
///
/// # Thread Safety
///
/// `RenderContext` is `Send + Sync`; stage builders on worker threads hold an
/// `Arc` to it.
pub struct RenderContext {
    device: Arc<dyn GpuDevice>,
    clock: Arc<FrameClock>,
    retirement: Arc<RetirementQueue>,
    occlusion_boxes: Arc<StreamAllocator>,
    query_results: Arc<StreamAllocator>,
    query_heaps: Arc<QueryHeapPool>,
    workers: WorkerPool,
    config: RendererConfig,
}

impl RenderContext {
    fn new(device: Arc<dyn GpuDevice>, config: RendererConfig) -> RenderResult<Self> {
        let clock = Arc::new(FrameClock::new(device.as_ref())?);
        let retirement = Arc::new(RetirementQueue::new(clock.clone()));
        let occlusion_boxes = Arc::new(StreamAllocator::new(
            device.clone(),
            retirement.clone(),
            "occlusion boxes",
            BufferUsage::VERTEX | BufferUsage::SHADER_READ,
            OCCLUSION_BOX_SIZE,
            config.occlusion_box_chunk,
        )?);
        let query_results = Arc::new(StreamAllocator::new(
            device.clone(),
            retirement.clone(),
            "query results",
            BufferUsage::QUERY_RESOLVE | BufferUsage::PREDICATION,
            QUERY_RESULT_SIZE,
            config.query_results_chunk,
        )?);
        let query_heaps = Arc::new(QueryHeapPool::new(
            device.clone(),
            retirement.clone(),
            QueryKind::BinaryOcclusion,
            config.query_heap_capacity,
        )?);
        let workers = WorkerPool::new("umbra stage builder", config.worker_threads);
        Ok(Self {
            device,
            clock,
            retirement,
            occlusion_boxes,
            query_results,
            query_heaps,
            workers,
            config,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn clock(&self) -> &Arc<FrameClock> {
        &self.clock
    }

    pub fn retirement(&self) -> &Arc<RetirementQueue> {
        &self.retirement
    }

    /// Stream of packed AABBs drawn by occlusion passes.
    pub fn occlusion_boxes(&self) -> &Arc<StreamAllocator> {
        &self.occlusion_boxes
    }

    /// Stream of resolved query results for transient batches.
    pub fn query_results(&self) -> &Arc<StreamAllocator> {
        &self.query_results
    }

    pub fn query_heaps(&self) -> &Arc<QueryHeapPool> {
        &self.query_heaps
    }

    /// Threads stage builders run on.
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// A query batch resolving into the shared results stream.
    pub fn transient_batch(&self) -> QueryBatch {
        QueryBatch::transient(self.query_heaps.clone(), self.query_results.clone())
    }

    /// A query batch owning its results buffer.
    pub fn persistent_batch(&self) -> QueryBatch {
        QueryBatch::persistent(
            self.query_heaps.clone(),
            self.device.clone(),
            self.retirement.clone(),
        )
    }
}

static_assertions::assert_impl_all!(RenderContext: Send, Sync);

/// CPU-side data versioned per ring slot.
#[derive(Default)]
pub struct FrameData {
    cmd_lists: CmdListPool,
}

impl FrameData {
    pub fn cmd_lists(&self) -> &CmdListPool {
        &self.cmd_lists
    }
}

impl Poolable for FrameData {
    fn new_empty() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.cmd_lists.reset();
    }
}

/// Frame driver over a [`RenderContext`] and a [`RenderPipeline`].
pub struct Renderer {
    ctx: Arc<RenderContext>,
    frames: FrameVersioning<FrameData>,
    pipeline: RenderPipeline,
}

impl Renderer {
    /// Create a renderer on `device`.
    ///
    /// # Errors
    ///
    /// Invalid configuration or failing resource creation.
    pub fn new(device: Arc<dyn GpuDevice>, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        log::info!(
            "Creating renderer on '{}' (max frame latency {}, adaptive {})",
            device.name(),
            config.max_frame_latency,
            config.adaptive_latency
        );
        let ctx = Arc::new(RenderContext::new(device.clone(), config.clone())?);
        let mut frames =
            FrameVersioning::new(device, ctx.clock.clone(), config.max_frame_latency)
                .with_fence_timeout(config.fence_timeout);
        if !config.adaptive_latency {
            frames = frames.with_fixed_latency();
        }
        Ok(Self {
            ctx,
            frames,
            pipeline: RenderPipeline::new(),
        })
    }

    /// The shared context, for stage builders.
    pub fn context(&self) -> &Arc<RenderContext> {
        &self.ctx
    }

    pub fn cur_frame_id(&self) -> u64 {
        self.frames.cur_frame_id()
    }

    pub fn completed_frame_id(&self) -> u64 {
        self.frames.completed_frame_id()
    }

    pub fn frame_latency(&self) -> usize {
        self.frames.frame_latency()
    }

    pub fn pipeline(&self) -> &RenderPipeline {
        &self.pipeline
    }

    /// Data of the frame being recorded.
    pub fn frame_data(&self) -> Option<&FrameData> {
        self.frames.current()
    }

    /// Start recording a frame.
    ///
    /// # Errors
    ///
    /// Fence failures while waiting for the ring slot are fatal.
    pub fn begin_frame(&mut self) -> RenderResult<u64> {
        profile_function!();
        self.frames.on_frame_start()?;
        let completed = self.frames.completed_frame_id();
        self.ctx.query_heaps.on_frame_start();
        self.ctx.occlusion_boxes.reclaim(completed);
        self.ctx.query_results.reclaim(completed);
        self.ctx.retirement.drain();
        Ok(self.frames.cur_frame_id())
    }

    /// Enqueue a stage under construction.
    pub fn append_stage(&mut self, stage: PendingStage) {
        self.pipeline.append_stage(stage);
    }

    /// Enqueue an already built stage.
    pub fn append_ready(&mut self, stage: PipelineStage) {
        self.pipeline.append_ready(stage);
    }

    /// Pull the next work item of the current frame.
    ///
    /// # Panics
    ///
    /// Panics outside `begin_frame`/`end_frame`.
    pub fn next_work_item(&mut self) -> RenderResult<Pull> {
        let frame_id = self.frames.cur_frame_id();
        let Some(data) = self.frames.current_mut() else {
            panic!("next_work_item called outside of a frame");
        };
        let mut stage_ctx = StageContext {
            device: self.ctx.device.as_ref(),
            cmd_lists: &mut data.cmd_lists,
            frame_id,
        };
        self.pipeline.get_next(&mut stage_ctx)
    }

    /// Submit work items until the pipeline is exhausted or waits on a stage.
    ///
    /// Returns the number of items submitted.
    pub fn submit_pending(&mut self) -> RenderResult<usize> {
        profile_function!();
        let mut submitted = 0;
        loop {
            match self.next_work_item()? {
                Pull::Item(item) => {
                    item.submit(self.ctx.device.as_ref())?;
                    submitted += 1;
                }
                Pull::NotReady | Pull::Exhausted => return Ok(submitted),
            }
        }
    }

    /// Abandon the stage being pulled.
    pub fn terminate_stage_traverse(&mut self) {
        self.pipeline.terminate_stage_traverse();
    }

    /// Finish the frame: tag stream allocations, signal the fence and
    /// release retired resources the GPU is done with.
    ///
    /// Returns the ID of the frame just finished.
    pub fn end_frame(&mut self) -> RenderResult<u64> {
        profile_function!();
        let frame_id = self.frames.cur_frame_id();
        self.ctx.occlusion_boxes.on_frame_finish(frame_id);
        self.ctx.query_results.on_frame_finish(frame_id);
        let finished = self.frames.on_frame_finish()?;
        self.ctx.retirement.drain();
        Ok(finished)
    }

    /// Defer releasing `resource` until the GPU finished the current frame.
    pub fn retire_resource<R: Send + 'static>(&self, resource: R) {
        self.ctx.retirement.retire(resource);
    }

    /// Block until everything submitted so far is GPU-complete.
    pub fn wait_idle(&self) -> RenderResult<()> {
        self.frames.wait_for_gpu(None)?;
        self.ctx.retirement.drain();
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.pipeline.clear();
        match self.frames.wait_for_gpu(None) {
            Ok(()) => {
                let released = self.ctx.retirement.flush_all();
                log::debug!("Renderer shut down, released {released} retired resources");
            }
            Err(e) => log::error!("Failed to wait for GPU during renderer shutdown: {e}"),
        }
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("device", &self.ctx.device.name())
            .field("cur_frame_id", &self.cur_frame_id())
            .field("completed_frame_id", &self.completed_frame_id())
            .field("frame_latency", &self.frame_latency())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Lazily initialized renderer owner.
#[derive(Default)]
pub struct RenderHost {
    renderer: Option<Renderer>,
    config: RendererConfig,
}

impl RenderHost {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            renderer: None,
            config,
        }
    }

    /// Best-effort initialization at startup.
    ///
    /// Failures are logged and leave the host uninitialized; a later
    /// [`init`](Self::init) call is then required.
    pub fn try_auto_init<F>(&mut self, create_device: F) -> bool
    where
        F: FnOnce() -> RenderResult<Arc<dyn GpuDevice>>,
    {
        if self.renderer.is_some() {
            return true;
        }
        match create_device().and_then(|device| self.init(device).map(|_| ())) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Renderer auto-initialization failed ({e}), a manual call to RenderHost::init() is required"
                );
                false
            }
        }
    }

    /// Initialize on `device`. Does nothing if already initialized.
    pub fn init(&mut self, device: Arc<dyn GpuDevice>) -> RenderResult<&mut Renderer> {
        if self.renderer.is_none() {
            self.renderer = Some(Renderer::new(device, self.config.clone())?);
        } else {
            log::debug!("Renderer already initialized");
        }
        self.renderer()
    }

    pub fn is_initialized(&self) -> bool {
        self.renderer.is_some()
    }

    /// The renderer, or [`RenderError::NotInitialized`].
    pub fn renderer(&mut self) -> RenderResult<&mut Renderer> {
        self.renderer.as_mut().ok_or(RenderError::NotInitialized)
    }

    /// Drop the renderer, waiting for the GPU first.
    pub fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            log::info!("Shutting down renderer at frame {}", renderer.cur_frame_id());
        }
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyDevice, QueueEvent};
    use crate::pipeline::{RenderStage, StagePhase, WorkItem};

    fn dummy() -> (DummyDevice, Arc<dyn GpuDevice>) {
        let device = DummyDevice::with_manual_completion();
        let shared: Arc<dyn GpuDevice> = Arc::new(device.clone());
        (device, shared)
    }

    struct Marker {
        emitted: bool,
    }

    impl RenderStage for Marker {
        fn name(&self) -> &str {
            "marker"
        }

        fn next_work_item(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Option<WorkItem>> {
            if self.emitted {
                return Ok(None);
            }
            self.emitted = true;
            let cmd = ctx.acquire("marker")?;
            cmd.record().marker("hello");
            Ok(Some(WorkItem::Pass {
                stage: "marker".into(),
                phase: StagePhase::Pre,
                cmd,
            }))
        }
    }

    #[test]
    fn test_frame_lifecycle_signals_fence() {
        let (device, shared) = dummy();
        let mut renderer = Renderer::new(shared, RendererConfig::default()).unwrap();

        assert_eq!(renderer.begin_frame().unwrap(), 1);
        renderer.append_ready(PipelineStage::Stage(Box::new(Marker { emitted: false })));
        assert_eq!(renderer.submit_pending().unwrap(), 1);
        assert_eq!(renderer.end_frame().unwrap(), 1);

        let log = device.queue_log();
        assert!(matches!(log[0], QueueEvent::Execute { .. }));
        assert_eq!(log[1], QueueEvent::Signal { value: 1 });
        assert_eq!(renderer.completed_frame_id(), 0);

        device.complete_all();
        assert_eq!(renderer.completed_frame_id(), 1);
    }

    #[test]
    fn test_adaptive_latency_grows() {
        let (device, shared) = dummy();
        let mut renderer = Renderer::new(shared, RendererConfig::default()).unwrap();
        for _ in 0..3 {
            renderer.begin_frame().unwrap();
            renderer.end_frame().unwrap();
        }
        assert_eq!(renderer.frame_latency(), 3);
        device.complete_all();
    }

    #[test]
    fn test_retire_resource_waits_for_frame() {
        let (device, shared) = dummy();
        let mut renderer = Renderer::new(shared, RendererConfig::default()).unwrap();
        renderer.begin_frame().unwrap();
        renderer.retire_resource(vec![0u8; 16]);
        renderer.end_frame().unwrap();
        assert_eq!(renderer.context().retirement().len(), 1);

        device.complete_all();
        renderer.begin_frame().unwrap();
        assert!(renderer.context().retirement().is_empty());
        renderer.end_frame().unwrap();
        device.complete_all();
    }

    #[test]
    fn test_invalid_latency_rejected() {
        let (_device, shared) = dummy();
        let result = Renderer::new(shared, RendererConfig::default().with_max_frame_latency(0));
        assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = RendererConfig::default().with_query_results_chunk(0);
        assert!(matches!(config.validate(), Err(RenderError::InvalidParameter(_))));
        assert!(RendererConfig::default().validate().is_ok());
        let config = RendererConfig::default().with_worker_threads(0);
        assert!(matches!(config.validate(), Err(RenderError::InvalidParameter(_))));
    }

    #[test]
    fn test_stage_builders_share_worker_threads() {
        let (_device, shared) = dummy();
        let config = RendererConfig::default().with_worker_threads(2);
        let renderer = Renderer::new(shared, config).unwrap();
        let workers = renderer.context().workers();
        assert_eq!(workers.num_threads(), 2);

        let names: Vec<String> = (0..8)
            .map(|_| {
                workers
                    .spawn(|| std::thread::current().name().unwrap_or("").to_string())
                    .wait()
                    .unwrap()
            })
            .collect();
        assert!(names.iter().all(|n| n.starts_with("umbra stage builder ")), "{names:?}");
    }

    #[test]
    fn test_host_init_is_idempotent() {
        let mut host = RenderHost::default();
        assert_eq!(host.renderer().unwrap_err(), RenderError::NotInitialized);

        assert!(!host.try_auto_init(|| Err(RenderError::DeviceLost)));
        assert!(!host.is_initialized());

        let shared: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let first = host.init(shared.clone()).unwrap().context().clone();
        let second = host.init(shared).unwrap().context().clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(host.try_auto_init(|| Err(RenderError::DeviceLost)));

        host.shutdown();
        assert!(!host.is_initialized());
    }
}
