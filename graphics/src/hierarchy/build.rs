//! Recursive in-place partitioning.

use umbra_core::bounds::Aabb;
use umbra_core::math::VecN;

use super::{
    BuildParams, Cluster, HierarchyObject, Node, NodeExtra, NodeId, NodePayload, SplitTechnique,
};

/// Bucket key of objects that stay with the node.
const EXCLUSIVE: usize = 0;

pub(super) fn build_nodes<O: HierarchyObject<D>, const D: usize>(
    objects: &mut [O],
    params: &BuildParams,
) -> Vec<Node<D>> {
    let mut builder = Builder {
        params,
        nodes: Vec::new(),
    };
    builder.build_node(objects, 0, 0, 0);
    builder.nodes
}

struct Builder<'p, const D: usize> {
    params: &'p BuildParams,
    nodes: Vec<Node<D>>,
}

impl<const D: usize> Builder<'_, D> {
    fn build_node<O: HierarchyObject<D>>(
        &mut self,
        objects: &mut [O],
        first_object: usize,
        first_tri: u64,
        depth: u32,
    ) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        let aabb: Aabb<D> = objects.iter().map(HierarchyObject::aabb).collect();
        let arity = self.params.structure.arity();
        self.nodes.push(Node {
            id,
            aabb,
            exclusive_aabb: Aabb::empty(),
            objects: first_object..first_object + objects.len(),
            exclusive_end: first_object + objects.len(),
            children: vec![None; arity].into_boxed_slice(),
            first_tri,
            exclusive_tris: 0,
            inclusive_tris: 0,
            occlusion: 0.0,
            depth,
            extra: NodeExtra::None,
        });

        let splittable =
            objects.len() >= self.params.leaf_threshold.max(2) && depth < self.params.max_depth;
        let counts = splittable
            .then(|| self.partition(objects, &aabb))
            .flatten()
            .unwrap_or_else(|| vec![objects.len()]);

        let (exclusive, mut rest) = objects.split_at_mut(counts[EXCLUSIVE]);
        let exclusive_aabb: Aabb<D> = exclusive.iter().map(HierarchyObject::aabb).collect();
        let exclusive_tris: u64 = exclusive.iter().map(|o| o.tri_count() as u64).sum();
        let measure = aabb.measure();
        let mut visible = exclusive
            .iter()
            .map(|o| 1.0 - o.occlusion().clamp(0.0, 1.0) * coverage(&o.aabb(), measure))
            .product::<f32>();

        let mut children = vec![None; arity].into_boxed_slice();
        let mut offset = first_object + exclusive.len();
        let mut tri = first_tri + exclusive_tris;
        for (slot, &count) in counts.iter().enumerate().skip(1) {
            if count == 0 {
                continue;
            }
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(count);
            rest = tail;
            let child = self.build_node(chunk, offset, tri, depth + 1);
            let child_node = &self.nodes[child.index()];
            visible *= 1.0 - child_node.occlusion * coverage(&child_node.aabb, measure);
            tri += child_node.inclusive_tris;
            offset += count;
            children[slot - 1] = Some(child);
        }

        let node = &mut self.nodes[id.index()];
        node.exclusive_aabb = exclusive_aabb;
        node.exclusive_end = first_object + counts[EXCLUSIVE];
        node.children = children;
        node.exclusive_tris = exclusive_tris;
        node.inclusive_tris = tri - first_tri;
        node.occlusion = if measure > 0.0 { 1.0 - visible } else { 0.0 };
        if self.params.payload == NodePayload::Clusters {
            node.extra = NodeExtra::Cluster(Cluster {
                first_index: first_tri * 3,
                index_count: node.inclusive_tris * 3,
            });
        }
        id
    }

    /// Reorder `objects` into buckets. Returns the bucket sizes, exclusive
    /// bucket first, or `None` if splitting would make no progress.
    fn partition<O: HierarchyObject<D>>(
        &self,
        objects: &mut [O],
        bounds: &Aabb<D>,
    ) -> Option<Vec<usize>> {
        let pivot = match self.params.split {
            SplitTechnique::Regular => bounds.center(),
            SplitTechnique::Mean => {
                objects
                    .iter()
                    .fold(VecN::<D>::zeros(), |acc, o| acc + o.aabb().center())
                    / objects.len() as f32
            }
        };

        let mut counts = vec![0usize; self.params.structure.arity() + 1];
        for object in objects.iter() {
            counts[self.bucket(&object.aabb(), &pivot, bounds)] += 1;
        }

        let total = objects.len();
        if counts[EXCLUSIVE] == total {
            return None;
        }
        // A single child holding everything would have the node's bounds.
        if counts[EXCLUSIVE] == 0 && counts.iter().any(|&c| c == total) {
            return None;
        }

        objects.sort_by_cached_key(|o| self.bucket(&o.aabb(), &pivot, bounds));
        Some(counts)
    }

    fn bucket(&self, object: &Aabb<D>, pivot: &VecN<D>, bounds: &Aabb<D>) -> usize {
        let radix = self.params.structure.radix();
        let mut slot = 0;
        let mut stride = 1;
        for axis in 0..D {
            let side = if radix == 2 {
                self.binary_side(object, pivot[axis], axis)
            } else {
                Self::ternary_side(object, pivot[axis], bounds, axis)
            };
            match side {
                Some(side) => slot += side * stride,
                None => return EXCLUSIVE,
            }
            stride *= radix;
        }
        slot + 1
    }

    fn binary_side(&self, object: &Aabb<D>, pivot: f32, axis: usize) -> Option<usize> {
        let (lo, hi) = (object.min[axis], object.max[axis]);
        if hi <= pivot {
            return Some(0);
        }
        if lo >= pivot {
            return Some(1);
        }
        let below = (pivot - lo) / (hi - lo);
        if below.min(1.0 - below) <= self.params.overlap_threshold {
            Some(if below > 0.5 { 0 } else { 1 })
        } else {
            None
        }
    }

    fn ternary_side(object: &Aabb<D>, pivot: f32, bounds: &Aabb<D>, axis: usize) -> Option<usize> {
        let (lo, hi) = (object.min[axis], object.max[axis]);
        if hi <= pivot {
            Some(0)
        } else if lo >= pivot {
            Some(2)
        } else if hi - lo <= (bounds.max[axis] - bounds.min[axis]) * 0.5 {
            Some(1)
        } else {
            None
        }
    }
}

/// Fraction of a node's measure covered by `aabb`.
fn coverage<const D: usize>(aabb: &Aabb<D>, node_measure: f32) -> f32 {
    if node_measure > 0.0 {
        (aabb.measure() / node_measure).min(1.0)
    } else {
        0.0
    }
}
