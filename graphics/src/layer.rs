//! Static geometry drawn through a visibility hierarchy.
//!
//! A [`GeometryLayer`] owns a [`Bvh`] over its objects and one GPU buffer
//! holding all of their vertices followed by all of their indices, written in
//! hierarchy order so that any node's inclusive range is one contiguous index
//! range:
//!
//! ```text
//! ┌──────────────────────────┬─────────────────────────────┐
//! │ positions (f32 x 3) ...  │ indices (u16 or u32) ...    │
//! └──────────────────────────┴─────────────────────────────┘
//! 0                          index_offset
//! ```
//!
//! Every frame [`build_stage`](GeometryLayer::build_stage) schedules a
//! [`View`] on a worker thread and hands back a pending [`GeometryStage`].
//! Query boxes are written to the occlusion box stream on the submission
//! thread, in the frame whose command lists draw them:
//!
//! ```text
//! Pre ─► CullRange* ─► CullToMain ─► MainRange* ─► Post
//!  │        │              │             │           │
//!  setup    query boxes    resolve into  predicated  clear
//!  batch    (chunked)      predication   draws       predication
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::GpuBuffer;
use crate::cmd_list::CmdList;
use crate::error::{RenderError, RenderResult};
use crate::hierarchy::{
    BuildParams, Bvh, DrawBatch, HierarchyObject, ScheduleParams, Unresolved, View, ViewFrustum,
};
use crate::occlusion::QueryBatch;
use crate::pipeline::{PendingStage, PipelineStage, RenderStage, StageContext, StagePhase, WorkItem};
use crate::profiling::profile_scope;
use crate::renderer::RenderContext;
use crate::retirement::TrackedResource;
use crate::stream_allocator::StreamAllocator;
use crate::types::{BufferDescriptor, BufferUsage, IndexFormat, ResourceState};

/// Queries recorded per cull pass command list.
pub const DEFAULT_QUERY_CHUNK: u32 = 256;

/// Draw batches recorded per main pass command list.
pub const DEFAULT_DRAW_CHUNK: usize = 512;

/// An object with triangle geometry.
///
/// `indices` are local to `positions` and must hold exactly
/// `3 * tri_count()` entries.
pub trait GeometrySource<const D: usize>: HierarchyObject<D> {
    fn positions(&self) -> &[[f32; 3]];
    fn indices(&self) -> &[u32];
}

/// Where a layer's geometry lives on the GPU.
#[derive(Clone)]
pub struct GeometryBinding {
    pub buffer: Arc<dyn GpuBuffer>,
    pub index_offset: u64,
    pub format: IndexFormat,
}

impl GeometryBinding {
    fn bind(&self, cmd: &CmdList) {
        cmd.record()
            .set_geometry(self.buffer.as_ref(), self.index_offset, self.format);
    }
}

/// Static objects, their hierarchy and their GPU geometry.
pub struct GeometryLayer<O, const D: usize> {
    name: String,
    ctx: Arc<RenderContext>,
    build_params: BuildParams,
    schedule_params: ScheduleParams,
    bvh: Arc<Bvh<O, D>>,
    geometry: TrackedResource<Arc<dyn GpuBuffer>>,
    binding: GeometryBinding,
    debug_batch: Arc<Mutex<QueryBatch>>,
    query_chunk: u32,
    draw_chunk: usize,
}

impl<O, const D: usize> GeometryLayer<O, D>
where
    O: GeometrySource<D> + Send + Sync + 'static,
{
    /// Build the hierarchy over `objects` and upload their geometry.
    ///
    /// # Panics
    ///
    /// Panics if `objects` is empty or an object's index count does not
    /// match its triangle count.
    pub fn new(
        name: &str,
        ctx: Arc<RenderContext>,
        objects: Vec<O>,
        build_params: BuildParams,
    ) -> RenderResult<Self> {
        let (bvh, buffer, binding) = Self::upload(name, &ctx, objects, &build_params)?;
        let geometry = TrackedResource::with_resource(ctx.retirement().clone(), buffer);
        let debug_batch = Arc::new(Mutex::new(ctx.persistent_batch()));
        Ok(Self {
            name: name.to_string(),
            ctx,
            build_params,
            schedule_params: ScheduleParams::default(),
            bvh,
            geometry,
            binding,
            debug_batch,
            query_chunk: DEFAULT_QUERY_CHUNK,
            draw_chunk: DEFAULT_DRAW_CHUNK,
        })
    }

    pub fn with_schedule_params(mut self, params: ScheduleParams) -> Self {
        self.schedule_params = params;
        self
    }

    /// Split cull and main passes into command lists of at most `queries`
    /// queries and `draws` draw batches.
    pub fn with_chunks(mut self, queries: u32, draws: usize) -> Self {
        self.query_chunk = queries.max(1);
        self.draw_chunk = draws.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bvh(&self) -> &Arc<Bvh<O, D>> {
        &self.bvh
    }

    pub fn binding(&self) -> &GeometryBinding {
        &self.binding
    }

    /// Replace all objects. The previous geometry buffer is retired.
    pub fn rebuild(&mut self, objects: Vec<O>) -> RenderResult<()> {
        let (bvh, buffer, binding) =
            Self::upload(&self.name, &self.ctx, objects, &self.build_params)?;
        self.geometry.set(buffer);
        self.bvh = bvh;
        self.binding = binding;
        Ok(())
    }

    fn upload(
        name: &str,
        ctx: &RenderContext,
        objects: Vec<O>,
        params: &BuildParams,
    ) -> RenderResult<(Arc<Bvh<O, D>>, Arc<dyn GpuBuffer>, GeometryBinding)> {
        profile_scope!("GeometryLayer::upload");
        let mut bvh = Bvh::build(objects, params.clone());

        let mut positions: Vec<[f32; 3]> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        for object in bvh.objects() {
            assert_eq!(
                object.indices().len(),
                object.tri_count() as usize * 3,
                "index count does not match triangle count"
            );
            let base = u32::try_from(positions.len()).map_err(|_| {
                RenderError::InvalidParameter(format!("layer '{name}' has too many vertices"))
            })?;
            positions.extend_from_slice(object.positions());
            indices.extend(object.indices().iter().map(|&i| base + i));
        }

        let format = IndexFormat::for_vertex_count(positions.len());
        let mut bytes: Vec<u8> = bytemuck::cast_slice(&positions).to_vec();
        let index_offset = bytes.len() as u64;
        match format {
            IndexFormat::Uint16 => {
                let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
                bytes.extend_from_slice(bytemuck::cast_slice(&narrow));
            }
            IndexFormat::Uint32 => bytes.extend_from_slice(bytemuck::cast_slice(&indices)),
        }

        let buffer = ctx.device().create_buffer(
            &BufferDescriptor::new(
                bytes.len() as u64,
                BufferUsage::VERTEX | BufferUsage::INDEX | BufferUsage::UPLOAD,
            )
            .with_label(name),
        )?;
        buffer.write(0, &bytes)?;
        log::debug!(
            "Layer '{}': {} vertices, {} triangles, {:?} indices",
            name,
            positions.len(),
            indices.len() / 3,
            format
        );

        bvh.free_objects();
        let binding = GeometryBinding {
            buffer: buffer.clone(),
            index_offset,
            format,
        };
        Ok((Arc::new(bvh), buffer, binding))
    }

    fn schedule_view(&self, frustum: ViewFrustum) -> impl FnOnce() -> View + Send + 'static {
        let bvh = self.bvh.clone();
        let params = self.schedule_params.clone();
        move || {
            let mut view = View::new();
            view.schedule(bvh.as_ref(), &frustum, &params);
            view
        }
    }

    /// Schedule this frame's view on a worker and return the pending stage.
    pub fn build_stage(&self, frustum: ViewFrustum) -> PendingStage {
        let schedule = self.schedule_view(frustum);
        let bvh = self.bvh.clone();
        let binding = self.binding.clone();
        let batch = self.ctx.transient_batch();
        let boxes = QueryBoxes::new(self.ctx.occlusion_boxes().clone());
        let name = self.name.clone();
        let query_chunk = self.query_chunk;
        let draw_chunk = self.draw_chunk;
        self.ctx.workers().spawn(move || {
            let view = schedule();
            let stats = view.stats();
            log::trace!(
                "Layer '{}': {} nodes visited, {} culled, {} queries",
                name,
                stats.visited,
                stats.culled,
                stats.queries
            );
            let stage: Box<dyn RenderStage> = Box::new(GeometryStage {
                name,
                bvh,
                view,
                boxes,
                binding,
                batch,
                phase: StagePhase::Pre,
                query_cursor: 0,
                query_chunk,
                draws: Vec::new(),
                draw_cursor: 0,
                draw_chunk,
            });
            Ok(PipelineStage::Stage(stage))
        })
    }

    /// Schedule a stage drawing this frame's query boxes, resolved into the
    /// layer's persistent batch.
    pub fn build_debug_stage(&self, frustum: ViewFrustum) -> PendingStage {
        let schedule = self.schedule_view(frustum);
        let batch = self.debug_batch.clone();
        let boxes = QueryBoxes::new(self.ctx.occlusion_boxes().clone());
        let name = format!("{} boxes", self.name);
        self.ctx.workers().spawn(move || {
            let view = schedule();
            let stage: Box<dyn RenderStage> = Box::new(QueryBoxStage {
                name,
                view,
                boxes,
                batch,
                phase: StagePhase::Pre,
            });
            Ok(PipelineStage::Stage(stage))
        })
    }
}

/// Query boxes of a view in the occlusion box stream.
///
/// Stream space is reclaimed once the frame that allocated it completes, so
/// the boxes are written again whenever a stage keeps drawing them in a
/// later frame.
struct QueryBoxes {
    stream: Arc<StreamAllocator>,
    frame_id: Option<u64>,
}

impl QueryBoxes {
    fn new(stream: Arc<StreamAllocator>) -> Self {
        Self {
            stream,
            frame_id: None,
        }
    }

    fn ensure(&mut self, view: &mut View, frame_id: u64) -> RenderResult<()> {
        if self.frame_id != Some(frame_id) {
            view.upload_boxes(&self.stream)?;
            self.frame_id = Some(frame_id);
        }
        Ok(())
    }
}

/// Occlusion-culled draw of one layer for one frame.
pub struct GeometryStage<O, const D: usize> {
    name: String,
    bvh: Arc<Bvh<O, D>>,
    view: View,
    boxes: QueryBoxes,
    binding: GeometryBinding,
    batch: QueryBatch,
    phase: StagePhase,
    query_cursor: u32,
    query_chunk: u32,
    draws: Vec<DrawBatch>,
    draw_cursor: usize,
    draw_chunk: usize,
}

impl<O, const D: usize> GeometryStage<O, D> {
    fn query_count(&self) -> u32 {
        self.view.queries().len() as u32
    }

    fn pass(&self, phase: StagePhase, cmd: CmdList) -> WorkItem {
        WorkItem::Pass {
            stage: self.name.clone(),
            phase,
            cmd,
        }
    }

    fn acquire(&self, ctx: &mut StageContext<'_>, phase: StagePhase) -> RenderResult<CmdList> {
        ctx.acquire(&format!("{} {}", self.name, phase.as_str()))
    }

    fn record_draws(&mut self, cmd: &CmdList) -> RenderResult<()> {
        let end = (self.draw_cursor + self.draw_chunk).min(self.draws.len());
        self.binding.bind(cmd);
        for index in self.draw_cursor..end {
            let draw = &self.draws[index];
            let index_count = u32::try_from((draw.tris.end - draw.tris.start) * 3);
            let first_index = u32::try_from(draw.tris.start * 3);
            let (Ok(index_count), Ok(first_index)) = (index_count, first_index) else {
                return Err(RenderError::InvalidParameter(format!(
                    "draw batch {:?} exceeds 32-bit index range",
                    draw.tris
                )));
            };
            self.batch.set(cmd, draw.predicate);
            cmd.record().draw_indexed(index_count, first_index);
        }
        self.batch.finish(cmd);
        self.draw_cursor = end;
        Ok(())
    }
}

impl<O, const D: usize> RenderStage for GeometryStage<O, D>
where
    O: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn sync(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<()> {
        self.boxes.ensure(&mut self.view, ctx.frame_id)
    }

    fn next_work_item(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Option<WorkItem>> {
        loop {
            match self.phase {
                StagePhase::Pre => {
                    let cmd = self.acquire(ctx, StagePhase::Pre)?;
                    let count = self.query_count();
                    if count > 0 {
                        self.batch.setup(count)?;
                        self.batch.sync(ctx.frame_id)?;
                    }
                    cmd.record().marker(&self.name);
                    self.phase = if count > 0 {
                        StagePhase::CullRange
                    } else {
                        StagePhase::MainRange
                    };
                    if self.phase == StagePhase::MainRange {
                        self.draws = self.view.issue(self.bvh.as_ref(), &Unresolved);
                    }
                    return Ok(Some(self.pass(StagePhase::Pre, cmd)));
                }
                StagePhase::CullRange => {
                    let count = self.query_count();
                    if self.query_cursor >= count {
                        self.phase = StagePhase::CullToMain;
                        continue;
                    }
                    let end = (self.query_cursor + self.query_chunk).min(count);
                    self.boxes.ensure(&mut self.view, ctx.frame_id)?;
                    let cmd = self.acquire(ctx, StagePhase::CullRange)?;
                    self.view
                        .issue_occlusion(self.query_cursor..end, &self.batch, &cmd);
                    self.query_cursor = end;
                    return Ok(Some(self.pass(StagePhase::CullRange, cmd)));
                }
                StagePhase::CullToMain => {
                    let cmd = self.acquire(ctx, StagePhase::CullToMain)?;
                    self.batch.resolve(&cmd, Some(ResourceState::PREDICATION));
                    // Results stay on the GPU; draws are predicated instead.
                    self.draws = self.view.issue(self.bvh.as_ref(), &Unresolved);
                    self.phase = StagePhase::MainRange;
                    return Ok(Some(self.pass(StagePhase::CullToMain, cmd)));
                }
                StagePhase::MainRange => {
                    if self.draw_cursor >= self.draws.len() {
                        self.phase = StagePhase::Post;
                        continue;
                    }
                    let cmd = self.acquire(ctx, StagePhase::MainRange)?;
                    self.record_draws(&cmd)?;
                    return Ok(Some(self.pass(StagePhase::MainRange, cmd)));
                }
                StagePhase::Post => {
                    let cmd = self.acquire(ctx, StagePhase::Post)?;
                    self.batch.finish(&cmd);
                    self.phase = StagePhase::Done;
                    return Ok(Some(self.pass(StagePhase::Post, cmd)));
                }
                StagePhase::Done => return Ok(None),
            }
        }
    }
}

/// Draws the query boxes of a view for inspection.
struct QueryBoxStage {
    name: String,
    view: View,
    boxes: QueryBoxes,
    batch: Arc<Mutex<QueryBatch>>,
    phase: StagePhase,
}

impl RenderStage for QueryBoxStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn sync(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<()> {
        if self.view.boxes().is_empty() {
            return Ok(());
        }
        self.boxes.ensure(&mut self.view, ctx.frame_id)
    }

    fn next_work_item(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Option<WorkItem>> {
        if self.phase == StagePhase::Done || self.view.boxes().is_empty() {
            return Ok(None);
        }
        self.boxes.ensure(&mut self.view, ctx.frame_id)?;
        let Some(boxes) = self.view.all_boxes() else {
            return Ok(None);
        };
        let count = self.view.queries().len() as u32;
        let phase = self.phase;
        let cmd = ctx.acquire(&format!("{} {}", self.name, phase.as_str()))?;
        match phase {
            StagePhase::Pre | StagePhase::CullRange => {
                let mut batch = self.batch.lock();
                batch.setup(count)?;
                self.view.issue_occlusion(0..count, &batch, &cmd);
                self.phase = StagePhase::CullToMain;
            }
            StagePhase::CullToMain => {
                self.batch
                    .lock()
                    .resolve(&cmd, Some(ResourceState::SHADER_RESOURCE));
                self.phase = StagePhase::MainRange;
            }
            _ => {
                let results = self.batch.lock().gpu_ptr();
                cmd.record()
                    .marker(&format!("query results @ {results:#x}"));
                cmd.record()
                    .draw_boxes(boxes.buffer.as_ref(), boxes.first, boxes.count);
                self.phase = StagePhase::Done;
            }
        }
        Ok(Some(WorkItem::Pass {
            stage: self.name.clone(),
            phase,
            cmd,
        }))
    }
}
