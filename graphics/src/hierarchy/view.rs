//! Per-frame traversal state of a [`Bvh`].
//!
//! A [`View`] is rebuilt for every camera evaluation in two passes:
//!
//! 1. [`schedule`](View::schedule) walks the tree depth first, culls nodes
//!    against the frustum, decides which nodes are drawn as a unit
//!    ([`Visibility::Atomic`]) and which are refined further
//!    ([`Visibility::Composite`]), and collects occlusion-query boxes in
//!    front-to-back order.
//! 2. [`issue`](View::issue) walks the scheduled nodes again with the query
//!    results and emits [`DrawBatch`]es.
//!
//! The view never borrows the tree; every call takes it explicitly and the
//! caller keeps the pairing consistent. Node state is indexed by
//! [`NodeId`].

use std::ops::Range;
use std::sync::Arc;

use umbra_core::bounds::{Aabb, Aabb3, PackedAabb};
use umbra_core::frustum::{projected_length, Containment, FrustumCuller};
use umbra_core::math::{transform_point4, Mat4};

use super::{Bvh, NodeExtra, NodeId};
use crate::backend::GpuBuffer;
use crate::cmd_list::CmdList;
use crate::error::RenderResult;
use crate::occlusion::{QueryBatch, NPOS};
use crate::profiling::profile_function;
use crate::stream_allocator::{StreamAllocation, StreamAllocator};

/// Camera description used for one traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewFrustum {
    culler: FrustumCuller,
    xform: Mat4,
    depth_sort_xform: Mat4,
}

impl ViewFrustum {
    /// Frustum of a view-projection matrix with [0, 1] depth.
    pub fn new(view_proj: Mat4) -> Self {
        Self {
            culler: FrustumCuller::from_matrix(&view_proj),
            xform: view_proj,
            depth_sort_xform: view_proj,
        }
    }

    /// Use a different transform for front-to-back ordering, e.g. the main
    /// camera while culling for a shadow view.
    pub fn with_depth_sort_xform(mut self, xform: Mat4) -> Self {
        self.depth_sort_xform = xform;
        self
    }

    pub fn culler(&self) -> &FrustumCuller {
        &self.culler
    }

    pub fn xform(&self) -> &Mat4 {
        &self.xform
    }
}

/// Traversal tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleParams {
    /// Stop refining fully visible nodes whose screen footprint is small.
    pub early_out: bool,
    /// Screen footprint (NDC diagonal) below which a node is drawn whole.
    pub early_out_threshold: f32,
    /// Nodes occluding less than this are tested through their children's
    /// boxes instead of their own.
    pub occluder_threshold: f32,
    /// Extent of 2D hierarchies along the missing axis.
    pub extra_axis: [f32; 2],
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            early_out: true,
            early_out_threshold: 0.05,
            occluder_threshold: 0.1,
            extra_axis: [0.0, 0.0],
        }
    }
}

impl ScheduleParams {
    pub fn with_early_out(mut self, threshold: f32) -> Self {
        self.early_out = true;
        self.early_out_threshold = threshold;
        self
    }

    pub fn without_early_out(mut self) -> Self {
        self.early_out = false;
        self
    }

    pub fn with_occluder_threshold(mut self, threshold: f32) -> Self {
        self.occluder_threshold = threshold;
        self
    }

    pub fn with_extra_axis(mut self, lo: f32, hi: f32) -> Self {
        self.extra_axis = [lo, hi];
        self
    }
}

/// Per-node traversal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Outside the frustum.
    Culled,
    /// Drawn as a unit, descendants are not visited.
    Atomic,
    /// Refined into children and exclusive objects.
    Composite,
}

/// What the occlusion query of a node covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OcclusionCullDomain {
    /// The node box.
    #[default]
    WholeNode,
    /// The boxes of the children and of the exclusive objects.
    ChildrenOnly,
    /// No query; the node box crosses the near plane.
    ForceComposite,
}

/// Result of one occlusion query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryVisibility {
    Visible,
    Occluded,
    /// Not issued or not available yet.
    Unknown,
}

/// Source of query results for [`View::issue`].
pub trait VisibilityResults {
    fn visibility(&self, query: u32) -> QueryVisibility;
}

/// Raw resolved results, non-zero meaning visible.
impl VisibilityResults for [u64] {
    fn visibility(&self, query: u32) -> QueryVisibility {
        match self.get(query as usize) {
            Some(0) => QueryVisibility::Occluded,
            Some(_) => QueryVisibility::Visible,
            None => QueryVisibility::Unknown,
        }
    }
}

/// No results on the CPU: draw everything and let predication decide.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unresolved;

impl VisibilityResults for Unresolved {
    fn visibility(&self, _query: u32) -> QueryVisibility {
        QueryVisibility::Unknown
    }
}

/// An occlusion query scheduled by a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcclusionQuery {
    pub node: NodeId,
    /// Boxes of the query, relative to the view's box list.
    pub boxes: Range<u32>,
}

/// Location of a query's boxes on the GPU.
#[derive(Clone)]
pub struct QueryGeometry {
    pub buffer: Arc<dyn GpuBuffer>,
    pub first: u64,
    pub count: u32,
}

/// A contiguous run of objects to draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawBatch {
    /// Node that emitted the first objects of the batch.
    pub node: NodeId,
    pub objects: Range<usize>,
    pub tris: Range<u64>,
    /// Query to predicate the draw on, if any.
    pub predicate: Option<u32>,
    /// Whole subtree drawn from its cluster payload.
    pub cluster: bool,
}

/// Counters of the last schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub visited: usize,
    pub culled: usize,
    pub atomic: usize,
    pub composite: usize,
    pub queries: usize,
}

#[derive(Debug, Clone)]
struct NodeState {
    visibility: Option<Visibility>,
    domain: OcclusionCullDomain,
    children: Range<u32>,
    query: u32,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            visibility: None,
            domain: OcclusionCullDomain::WholeNode,
            children: 0..0,
            query: NPOS,
        }
    }
}

/// Transient traversal state for one frustum.
#[derive(Default)]
pub struct View {
    states: Vec<NodeState>,
    child_order: Vec<NodeId>,
    queries: Vec<OcclusionQuery>,
    boxes: Vec<PackedAabb>,
    allocation: Option<StreamAllocation>,
    stats: ScheduleStats,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous traversal.
    pub fn reset(&mut self) {
        self.states.clear();
        self.child_order.clear();
        self.queries.clear();
        self.boxes.clear();
        self.allocation = None;
        self.stats = ScheduleStats::default();
    }

    /// Cull and classify `bvh` for `frustum`, collecting occlusion queries.
    pub fn schedule<O, const D: usize>(
        &mut self,
        bvh: &Bvh<O, D>,
        frustum: &ViewFrustum,
        params: &ScheduleParams,
    ) -> ScheduleStats {
        profile_function!();
        self.reset();
        self.states.resize(bvh.node_count(), NodeState::default());
        if let Some(root) = bvh.root() {
            let mut scheduler = Scheduler {
                view: self,
                frustum,
                params,
            };
            scheduler.visit(bvh, root, 0.0);
        }
        self.stats.queries = self.queries.len();
        log::trace!("View scheduled: {:?}", self.stats);
        self.stats
    }

    pub fn stats(&self) -> ScheduleStats {
        self.stats
    }

    /// Outcome for a node, `None` if it was not reached.
    pub fn visibility(&self, id: NodeId) -> Option<Visibility> {
        self.states.get(id.index()).and_then(|s| s.visibility)
    }

    pub fn cull_domain(&self, id: NodeId) -> OcclusionCullDomain {
        self.states.get(id.index()).map_or_else(Default::default, |s| s.domain)
    }

    /// Query index of a node, [`NPOS`] if it has none.
    pub fn query_index(&self, id: NodeId) -> u32 {
        self.states.get(id.index()).map_or(NPOS, |s| s.query)
    }

    /// Children of a composite node, nearest first.
    pub fn children_order(&self, id: NodeId) -> &[NodeId] {
        let range = &self.states[id.index()].children;
        &self.child_order[range.start as usize..range.end as usize]
    }

    /// Queries in issue order.
    pub fn queries(&self) -> &[OcclusionQuery] {
        &self.queries
    }

    /// All query boxes, in query order.
    pub fn boxes(&self) -> &[PackedAabb] {
        &self.boxes
    }

    /// Copy the query boxes to the GPU in one allocation.
    ///
    /// The allocation belongs to the frame open on the stream when this is
    /// called, so call it in the frame whose command lists draw the boxes.
    pub fn upload_boxes(&mut self, allocator: &StreamAllocator) -> RenderResult<()> {
        self.allocation = None;
        if self.boxes.is_empty() {
            return Ok(());
        }
        let allocation = allocator.allocate(self.boxes.len() as u32)?;
        allocation.write(0, &self.boxes)?;
        self.allocation = Some(allocation);
        Ok(())
    }

    /// GPU location of the boxes of query `index`, once uploaded.
    pub fn query_geometry(&self, index: u32) -> Option<QueryGeometry> {
        let allocation = self.allocation.as_ref()?;
        let query = self.queries.get(index as usize)?;
        Some(QueryGeometry {
            buffer: allocation.buffer().clone(),
            first: allocation.first() + query.boxes.start as u64,
            count: query.boxes.end - query.boxes.start,
        })
    }

    /// GPU location of every box, once uploaded.
    pub fn all_boxes(&self) -> Option<QueryGeometry> {
        let allocation = self.allocation.as_ref()?;
        Some(QueryGeometry {
            buffer: allocation.buffer().clone(),
            first: allocation.first(),
            count: allocation.count(),
        })
    }

    /// Record queries `range` into `cmd`, one box draw per query.
    ///
    /// # Panics
    ///
    /// Panics if the boxes were not uploaded.
    pub fn issue_occlusion(&self, range: Range<u32>, batch: &QueryBatch, cmd: &CmdList) {
        for index in range {
            let Some(geometry) = self.query_geometry(index) else {
                panic!("occlusion query {index} issued before its boxes were uploaded");
            };
            batch.start(cmd, index);
            cmd.record()
                .draw_boxes(geometry.buffer.as_ref(), geometry.first, geometry.count);
            batch.stop(cmd, index);
        }
    }

    /// Emit draw batches for the scheduled nodes.
    ///
    /// Queries reported as [`QueryVisibility::Unknown`] count as visible.
    pub fn issue<O, R, const D: usize>(&self, bvh: &Bvh<O, D>, results: &R) -> Vec<DrawBatch>
    where
        R: VisibilityResults + ?Sized,
    {
        profile_function!();
        let mut batches = Vec::new();
        if let Some(root) = bvh.root() {
            self.issue_node(bvh, root, results, &mut batches);
        }
        batches
    }

    fn issue_node<O, R, const D: usize>(
        &self,
        bvh: &Bvh<O, D>,
        id: NodeId,
        results: &R,
        batches: &mut Vec<DrawBatch>,
    ) where
        R: VisibilityResults + ?Sized,
    {
        let state = &self.states[id.index()];
        let predicate = (state.query != NPOS).then_some(state.query);
        if predicate.is_some_and(|q| results.visibility(q) == QueryVisibility::Occluded) {
            return;
        }

        let node = bvh.node(id);
        match state.visibility {
            None | Some(Visibility::Culled) => {}
            Some(Visibility::Atomic) => {
                if let NodeExtra::Cluster(_) = node.extra() {
                    push_batch(
                        batches,
                        DrawBatch {
                            node: id,
                            objects: node.objects(),
                            tris: node.tri_range(),
                            predicate,
                            cluster: true,
                        },
                    );
                } else {
                    Self::issue_subtree(bvh, id, predicate, batches);
                }
            }
            Some(Visibility::Composite) => {
                Self::issue_exclusive(bvh, id, predicate, batches);
                for &child in self.children_order(id) {
                    self.issue_node(bvh, child, results, batches);
                }
            }
        }
    }

    fn issue_subtree<O, const D: usize>(
        bvh: &Bvh<O, D>,
        id: NodeId,
        predicate: Option<u32>,
        batches: &mut Vec<DrawBatch>,
    ) {
        Self::issue_exclusive(bvh, id, predicate, batches);
        for child in bvh.node(id).children() {
            Self::issue_subtree(bvh, child, predicate, batches);
        }
    }

    fn issue_exclusive<O, const D: usize>(
        bvh: &Bvh<O, D>,
        id: NodeId,
        predicate: Option<u32>,
        batches: &mut Vec<DrawBatch>,
    ) {
        let node = bvh.node(id);
        if node.exclusive_objects().is_empty() {
            return;
        }
        push_batch(
            batches,
            DrawBatch {
                node: id,
                objects: node.exclusive_objects(),
                tris: node.exclusive_tri_range(),
                predicate,
                cluster: false,
            },
        );
    }
}

/// Append, merging with the previous batch when contiguous.
fn push_batch(batches: &mut Vec<DrawBatch>, batch: DrawBatch) {
    if let Some(last) = batches.last_mut() {
        if !last.cluster
            && !batch.cluster
            && last.predicate == batch.predicate
            && last.objects.end == batch.objects.start
        {
            last.objects.end = batch.objects.end;
            last.tris.end = batch.tris.end;
            return;
        }
    }
    batches.push(batch);
}

struct Scheduler<'a> {
    view: &'a mut View,
    frustum: &'a ViewFrustum,
    params: &'a ScheduleParams,
}

impl Scheduler<'_> {
    fn lift<const D: usize>(&self, aabb: &Aabb<D>) -> Aabb3 {
        aabb.to_3d(self.params.extra_axis)
    }

    fn visit<O, const D: usize>(&mut self, bvh: &Bvh<O, D>, id: NodeId, parent_occlusion: f32) {
        let node = bvh.node(id);
        let aabb = self.lift(node.aabb());
        self.view.stats.visited += 1;

        let containment = self.frustum.culler.classify(&aabb);
        if containment == Containment::Outside {
            self.set_visibility(id, Visibility::Culled);
            return;
        }

        let domain = if self.frustum.culler.clips_near(&aabb) {
            OcclusionCullDomain::ForceComposite
        } else if !node.is_leaf() && node.occlusion() < self.params.occluder_threshold {
            OcclusionCullDomain::ChildrenOnly
        } else {
            OcclusionCullDomain::WholeNode
        };
        self.view.states[id.index()].domain = domain;

        let atomic = node.is_leaf()
            || (self.params.early_out
                && containment == Containment::Inside
                && domain != OcclusionCullDomain::ForceComposite
                && projected_length(&self.frustum.xform, &aabb) * (1.0 - parent_occlusion)
                    < self.params.early_out_threshold);

        match domain {
            OcclusionCullDomain::WholeNode => self.push_query(id, &[aabb]),
            OcclusionCullDomain::ChildrenOnly => {
                let mut boxes: Vec<Aabb3> = node
                    .children()
                    .map(|child| self.lift(bvh.node(child).aabb()))
                    .filter(|b| self.frustum.culler.classify(b) != Containment::Outside)
                    .collect();
                if !node.exclusive_objects().is_empty() {
                    boxes.push(self.lift(node.exclusive_aabb()));
                }
                if boxes.is_empty() {
                    self.set_visibility(id, Visibility::Culled);
                    return;
                }
                self.push_query(id, &boxes);
            }
            OcclusionCullDomain::ForceComposite => {}
        }

        if atomic {
            self.set_visibility(id, Visibility::Atomic);
            return;
        }
        self.set_visibility(id, Visibility::Composite);

        let mut order: Vec<(f32, NodeId)> = node
            .children()
            .map(|child| {
                let center = self.lift(bvh.node(child).aabb()).center();
                (transform_point4(&self.frustum.depth_sort_xform, &center).z, child)
            })
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0));

        let start = self.view.child_order.len() as u32;
        self.view.child_order.extend(order.iter().map(|&(_, child)| child));
        let end = self.view.child_order.len() as u32;
        self.view.states[id.index()].children = start..end;

        for (_, child) in order {
            self.visit(bvh, child, node.occlusion());
        }
    }

    fn set_visibility(&mut self, id: NodeId, visibility: Visibility) {
        let stats = &mut self.view.stats;
        match visibility {
            Visibility::Culled => stats.culled += 1,
            Visibility::Atomic => stats.atomic += 1,
            Visibility::Composite => stats.composite += 1,
        }
        self.view.states[id.index()].visibility = Some(visibility);
    }

    fn push_query(&mut self, id: NodeId, boxes: &[Aabb3]) {
        let start = self.view.boxes.len() as u32;
        self.view.boxes.extend(boxes.iter().map(PackedAabb::from));
        let end = self.view.boxes.len() as u32;
        self.view.states[id.index()].query = self.view.queries.len() as u32;
        self.view.queries.push(OcclusionQuery {
            node: id,
            boxes: start..end,
        });
    }
}
