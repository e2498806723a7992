//! Axis-aligned bounding boxes.
//!
//! [`Aabb`] is generic over its dimension so the same hierarchy code can
//! partition flat 2D layers (terrain, decals) and full 3D scenes. Anything
//! that reaches the GPU or the frustum test is lifted to 3D first with
//! [`Aabb::to_3d`].

use crate::math::{Vec3, VecN};

/// Axis-aligned bounding box in `D` dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb<const D: usize> {
    /// Minimum corner.
    pub min: VecN<D>,
    /// Maximum corner.
    pub max: VecN<D>,
}

/// 2D bounding box.
pub type Aabb2 = Aabb<2>;

/// 3D bounding box.
pub type Aabb3 = Aabb<3>;

impl<const D: usize> Aabb<D> {
    /// Create a box from its corners.
    pub fn new(min: VecN<D>, max: VecN<D>) -> Self {
        Self { min, max }
    }

    /// An inverted box that acts as the identity for [`union`](Self::union).
    pub fn empty() -> Self {
        Self {
            min: VecN::<D>::repeat(f32::INFINITY),
            max: VecN::<D>::repeat(f32::NEG_INFINITY),
        }
    }

    /// Returns `true` if the box contains no points.
    pub fn is_empty(&self) -> bool {
        (0..D).any(|i| self.min[i] > self.max[i])
    }

    /// Box center.
    pub fn center(&self) -> VecN<D> {
        (self.min + self.max) * 0.5
    }

    /// Extent along every axis.
    pub fn size(&self) -> VecN<D> {
        self.max - self.min
    }

    /// Length, area or volume depending on `D`. Zero for empty boxes.
    pub fn measure(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        self.size().iter().product()
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Grow in place to contain `other`.
    pub fn merge(&mut self, other: &Self) {
        *self = self.union(other);
    }

    /// Returns `true` if `point` lies inside or on the boundary.
    pub fn contains_point(&self, point: &VecN<D>) -> bool {
        (0..D).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }

    /// Returns `true` if `other` lies entirely inside this box.
    pub fn contains(&self, other: &Self) -> bool {
        (0..D).all(|i| other.min[i] >= self.min[i] && other.max[i] <= self.max[i])
    }

    /// Lift into 3D. Axes beyond `D` take the given `[lo, hi]` range, extra
    /// axes (when `D > 3`) are dropped.
    pub fn to_3d(&self, extra_axis: [f32; 2]) -> Aabb3 {
        let mut min = Vec3::repeat(extra_axis[0]);
        let mut max = Vec3::repeat(extra_axis[1]);
        for i in 0..D.min(3) {
            min[i] = self.min[i];
            max[i] = self.max[i];
        }
        Aabb3 { min, max }
    }
}

impl<const D: usize> Default for Aabb<D> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const D: usize> FromIterator<Aabb<D>> for Aabb<D> {
    fn from_iter<I: IntoIterator<Item = Aabb<D>>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |acc, b| acc.union(&b))
    }
}

impl Aabb3 {
    /// The eight corners, in binary order (bit 0 = x, bit 1 = y, bit 2 = z).
    pub fn corners(&self) -> [Vec3; 8] {
        std::array::from_fn(|i| {
            Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        })
    }
}

/// GPU layout of a box, as consumed by the occlusion-query box shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PackedAabb {
    pub min: [f32; 4],
    pub max: [f32; 4],
}

impl From<&Aabb3> for PackedAabb {
    fn from(aabb: &Aabb3) -> Self {
        Self {
            min: [aabb.min.x, aabb.min.y, aabb.min.z, 1.0],
            max: [aabb.max.x, aabb.max.y, aabb.max.z, 1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec2;

    fn aabb2(min: [f32; 2], max: [f32; 2]) -> Aabb2 {
        Aabb2::new(Vec2::from(min), Vec2::from(max))
    }

    #[test]
    fn test_empty_is_union_identity() {
        let b = aabb2([1.0, 2.0], [3.0, 4.0]);
        assert!(Aabb2::empty().is_empty());
        assert_eq!(Aabb2::empty().union(&b), b);
        assert_eq!(Aabb2::empty().measure(), 0.0);
    }

    #[test]
    fn test_measure_and_center() {
        let b = aabb2([0.0, 0.0], [4.0, 2.0]);
        assert_eq!(b.measure(), 8.0);
        assert_eq!(b.center(), Vec2::new(2.0, 1.0));
        assert_eq!(b.size(), Vec2::new(4.0, 2.0));
    }

    #[test]
    fn test_collect_union() {
        let total: Aabb2 = [
            aabb2([0.0, 0.0], [1.0, 1.0]),
            aabb2([-1.0, 2.0], [0.5, 3.0]),
        ]
        .into_iter()
        .collect();
        assert_eq!(total, aabb2([-1.0, 0.0], [1.0, 3.0]));
        assert!(total.contains(&aabb2([0.0, 0.0], [1.0, 1.0])));
        assert!(total.contains_point(&Vec2::new(-1.0, 3.0)));
        assert!(!total.contains_point(&Vec2::new(-1.5, 1.0)));
    }

    #[test]
    fn test_lift_to_3d() {
        let b = aabb2([1.0, 2.0], [3.0, 4.0]).to_3d([-0.5, 0.5]);
        assert_eq!(b.min, Vec3::new(1.0, 2.0, -0.5));
        assert_eq!(b.max, Vec3::new(3.0, 4.0, 0.5));
    }

    #[test]
    fn test_corners_span_box() {
        let b = Aabb3::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 2.0, 3.0));
        let corners = b.corners();
        assert_eq!(corners[0], b.min);
        assert_eq!(corners[7], b.max);
        assert_eq!(corners[5], Vec3::new(1.0, 0.0, 3.0));
    }

    #[test]
    fn test_packed_layout() {
        assert_eq!(std::mem::size_of::<PackedAabb>(), 32);
        let b = Aabb3::new(Vec3::new(0.0, 1.0, 2.0), Vec3::new(3.0, 4.0, 5.0));
        let packed = PackedAabb::from(&b);
        let bytes: &[u8] = bytemuck::bytes_of(&packed);
        assert_eq!(bytes.len(), 32);
        assert_eq!(packed.max[2], 5.0);
    }
}
