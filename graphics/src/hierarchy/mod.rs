//! Spatial hierarchy over static scene objects.
//!
//! A [`Bvh`] partitions a fixed array of objects by their bounding boxes into
//! a quad-, oct-, ennea- or icosept-tree. Objects are reordered in place so
//! that every node covers one contiguous range of the array:
//!
//! ```text
//! objects: [ e e | c0 c0 c0 | c1 | c3 c3 ]
//!            ^^^   ^^^^^^^^^^^^^^^^^^^^^
//!            │     children, in slot order
//!            exclusive objects of the node
//! ```
//!
//! Exclusive objects straddle the node's split and belong to no child. The
//! node's inclusive range is its exclusive range followed by all descendant
//! ranges, so a whole subtree can be drawn with a single indexed draw once
//! the geometry is uploaded in object order.
//!
//! Nodes live in one arena in depth-first preorder; [`NodeId`] is the arena
//! index. Per-frame traversal state is kept outside the tree in a [`View`].

mod build;
mod view;

pub use view::{
    DrawBatch, OcclusionCullDomain, OcclusionQuery, QueryGeometry, QueryVisibility,
    ScheduleParams, ScheduleStats, Unresolved, View, ViewFrustum, Visibility, VisibilityResults,
};

use std::ops::Range;

use umbra_core::bounds::Aabb;

use crate::profiling::profile_function;

/// Something that can be placed in a [`Bvh`].
pub trait HierarchyObject<const D: usize> {
    /// Bounds of the object.
    fn aabb(&self) -> Aabb<D>;

    /// Number of triangles the object draws.
    fn tri_count(&self) -> u32;

    /// How much of its bounds the object hides, in `[0, 1]`.
    fn occlusion(&self) -> f32 {
        1.0
    }
}

/// Branching layout of a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeStructure {
    /// 2D, 2x2 children.
    Quadtree,
    /// 3D, 2x2x2 children.
    Octree,
    /// 2D, 3x3 children. The middle row/column holds objects straddling
    /// the split.
    Enneatree,
    /// 3D, 3x3x3 children.
    Icoseptree,
}

impl TreeStructure {
    /// Maximum number of children per node.
    pub fn arity(self) -> usize {
        match self {
            Self::Quadtree => 4,
            Self::Octree => 8,
            Self::Enneatree => 9,
            Self::Icoseptree => 27,
        }
    }

    /// Number of split axes.
    pub fn dimensions(self) -> usize {
        match self {
            Self::Quadtree | Self::Enneatree => 2,
            Self::Octree | Self::Icoseptree => 3,
        }
    }

    /// Children per axis: 2 for regular splits, 3 with an internal bucket.
    pub fn radix(self) -> usize {
        match self {
            Self::Quadtree | Self::Octree => 2,
            Self::Enneatree | Self::Icoseptree => 3,
        }
    }
}

/// How the split point of a node is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SplitTechnique {
    /// Midpoint of the node bounds.
    #[default]
    Regular,
    /// Mean of the object centers.
    Mean,
}

/// Per-node payload selected at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePayload {
    #[default]
    None,
    /// Record the index range of every node's inclusive objects.
    Clusters,
}

/// Hierarchy construction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildParams {
    pub structure: TreeStructure,
    pub split: SplitTechnique,
    /// Nodes with fewer objects are not split.
    pub leaf_threshold: usize,
    /// Largest fraction of a straddling object allowed on the far side of a
    /// split for it to still descend into the child holding its center.
    pub overlap_threshold: f32,
    pub max_depth: u32,
    pub payload: NodePayload,
}

impl BuildParams {
    pub fn new(structure: TreeStructure) -> Self {
        Self {
            structure,
            split: SplitTechnique::Regular,
            leaf_threshold: 4,
            overlap_threshold: 0.25,
            max_depth: 16,
            payload: NodePayload::None,
        }
    }

    pub fn with_split(mut self, split: SplitTechnique) -> Self {
        self.split = split;
        self
    }

    pub fn with_leaf_threshold(mut self, threshold: usize) -> Self {
        self.leaf_threshold = threshold;
        self
    }

    pub fn with_overlap_threshold(mut self, threshold: f32) -> Self {
        self.overlap_threshold = threshold;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_clusters(mut self) -> Self {
        self.payload = NodePayload::Clusters;
        self
    }
}

/// Index of a node in its [`Bvh`].
///
/// Only meaningful for the tree that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Depth-first preorder index of the node.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Contiguous index range drawing a node's whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cluster {
    pub first_index: u64,
    pub index_count: u64,
}

/// Extra per-node data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeExtra {
    #[default]
    None,
    Cluster(Cluster),
}

/// A node of a [`Bvh`].
#[derive(Debug, Clone)]
pub struct Node<const D: usize> {
    pub(crate) id: NodeId,
    pub(crate) aabb: Aabb<D>,
    pub(crate) exclusive_aabb: Aabb<D>,
    pub(crate) objects: Range<usize>,
    pub(crate) exclusive_end: usize,
    pub(crate) children: Box<[Option<NodeId>]>,
    pub(crate) first_tri: u64,
    pub(crate) exclusive_tris: u64,
    pub(crate) inclusive_tris: u64,
    pub(crate) occlusion: f32,
    pub(crate) depth: u32,
    pub(crate) extra: NodeExtra,
}

impl<const D: usize> Node<D> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Bounds of all objects of the subtree.
    pub fn aabb(&self) -> &Aabb<D> {
        &self.aabb
    }

    /// Bounds of the exclusive objects. Empty if there are none.
    pub fn exclusive_aabb(&self) -> &Aabb<D> {
        &self.exclusive_aabb
    }

    /// Object range of the node and its descendants.
    pub fn objects(&self) -> Range<usize> {
        self.objects.clone()
    }

    /// Object range owned by this node alone.
    pub fn exclusive_objects(&self) -> Range<usize> {
        self.objects.start..self.exclusive_end
    }

    /// Child slots, `None` where the bucket was empty.
    pub fn child_slots(&self) -> &[Option<NodeId>] {
        &self.children
    }

    /// Present children in slot order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().flatten().copied()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    pub fn exclusive_tris(&self) -> u64 {
        self.exclusive_tris
    }

    pub fn inclusive_tris(&self) -> u64 {
        self.inclusive_tris
    }

    /// Triangle range of the whole subtree, in object order.
    pub fn tri_range(&self) -> Range<u64> {
        self.first_tri..self.first_tri + self.inclusive_tris
    }

    /// Triangle range of the exclusive objects.
    pub fn exclusive_tri_range(&self) -> Range<u64> {
        self.first_tri..self.first_tri + self.exclusive_tris
    }

    /// Estimated fraction of the node bounds hidden by its contents.
    pub fn occlusion(&self) -> f32 {
        self.occlusion
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn extra(&self) -> &NodeExtra {
        &self.extra
    }
}

/// Immutable bounding volume hierarchy over a set of objects.
pub struct Bvh<O, const D: usize> {
    objects: Vec<O>,
    object_count: usize,
    nodes: Vec<Node<D>>,
    params: BuildParams,
}

impl<O: HierarchyObject<D>, const D: usize> Bvh<O, D> {
    /// Build a hierarchy, taking ownership of `objects` and reordering them.
    ///
    /// # Panics
    ///
    /// Panics if `objects` is empty or the tree structure does not match `D`.
    pub fn build(mut objects: Vec<O>, params: BuildParams) -> Self {
        profile_function!();
        assert!(!objects.is_empty(), "cannot build a hierarchy over zero objects");
        assert_eq!(
            params.structure.dimensions(),
            D,
            "{:?} needs {}D objects",
            params.structure,
            params.structure.dimensions()
        );

        let nodes = build::build_nodes(&mut objects, &params);
        let depth = nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        log::debug!(
            "Built {:?} over {} objects: {} nodes, depth {}",
            params.structure,
            objects.len(),
            nodes.len(),
            depth
        );

        Self {
            object_count: objects.len(),
            objects,
            nodes,
            params,
        }
    }
}

impl<O, const D: usize> Bvh<O, D> {
    /// Root node, `None` after [`reset`](Self::reset).
    pub fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(NodeId(0))
    }

    pub fn node(&self, id: NodeId) -> &Node<D> {
        &self.nodes[id.index()]
    }

    /// All nodes in preorder.
    pub fn nodes(&self) -> &[Node<D>] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Objects in hierarchy order. Empty after [`free_objects`](Self::free_objects).
    pub fn objects(&self) -> &[O] {
        &self.objects
    }

    /// The exclusive objects of a node.
    ///
    /// # Panics
    ///
    /// Panics if the objects were freed.
    pub fn exclusive_objects(&self, id: NodeId) -> &[O] {
        &self.objects[self.node(id).exclusive_objects()]
    }

    /// Number of objects the tree was built over. Survives `free_objects`.
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Bounds of the whole tree.
    pub fn aabb(&self) -> Aabb<D> {
        self.nodes.first().map_or_else(Aabb::empty, |root| root.aabb)
    }

    pub fn total_tris(&self) -> u64 {
        self.nodes.first().map_or(0, |root| root.inclusive_tris)
    }

    pub fn params(&self) -> &BuildParams {
        &self.params
    }

    /// Drop the object payloads, keeping nodes and ranges.
    pub fn free_objects(&mut self) {
        self.objects = Vec::new();
    }

    /// Drop everything. The tree has no root afterwards.
    pub fn reset(&mut self) {
        self.objects = Vec::new();
        self.nodes = Vec::new();
        self.object_count = 0;
    }
}
