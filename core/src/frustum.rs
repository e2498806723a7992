//! View-frustum culling.
//!
//! [`FrustumCuller`] extracts the six clip planes from a view-projection
//! matrix (depth range [0, 1]) and classifies boxes against them.

use crate::bounds::Aabb3;
use crate::math::{Mat4, Vec3, Vec4};

/// Result of testing a box against the frustum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// Completely outside at least one plane.
    Outside,
    /// Crosses one or more planes.
    Intersecting,
    /// Completely inside all planes.
    Inside,
}

/// Plane indices as extracted by [`FrustumCuller::from_matrix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrustumPlane {
    Left = 0,
    Right = 1,
    Bottom = 2,
    Top = 3,
    Near = 4,
    Far = 5,
}

/// Six inward-facing normalized planes, `dot(plane, (p, 1)) >= 0` inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumCuller {
    planes: [Vec4; 6],
}

impl FrustumCuller {
    /// Extract planes from a view-projection matrix.
    pub fn from_matrix(m: &Mat4) -> Self {
        let row = |i: usize| -> Vec4 { m.row(i).transpose() };
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let len = p.xyz().norm();
            if len > f32::EPSILON { p / len } else { p }
        });
        Self { planes }
    }

    /// Access a single plane.
    pub fn plane(&self, plane: FrustumPlane) -> Vec4 {
        self.planes[plane as usize]
    }

    fn signed_distances(plane: &Vec4, aabb: &Aabb3) -> (f32, f32) {
        let n = plane.xyz();
        let positive = Vec3::new(
            if n.x >= 0.0 { aabb.max.x } else { aabb.min.x },
            if n.y >= 0.0 { aabb.max.y } else { aabb.min.y },
            if n.z >= 0.0 { aabb.max.z } else { aabb.min.z },
        );
        let negative = Vec3::new(
            if n.x >= 0.0 { aabb.min.x } else { aabb.max.x },
            if n.y >= 0.0 { aabb.min.y } else { aabb.max.y },
            if n.z >= 0.0 { aabb.min.z } else { aabb.max.z },
        );
        (n.dot(&negative) + plane.w, n.dot(&positive) + plane.w)
    }

    /// Classify a box against all six planes.
    pub fn classify(&self, aabb: &Aabb3) -> Containment {
        let mut result = Containment::Inside;
        for plane in &self.planes {
            let (near, far) = Self::signed_distances(plane, aabb);
            if far < 0.0 {
                return Containment::Outside;
            }
            if near < 0.0 {
                result = Containment::Intersecting;
            }
        }
        result
    }

    /// Returns `true` if the box straddles the near plane.
    ///
    /// Rasterized query boxes that cross the near plane get clipped and can
    /// report false occlusion, so such nodes must not be tested as a whole.
    pub fn clips_near(&self, aabb: &Aabb3) -> bool {
        let (near, far) = Self::signed_distances(&self.planes[FrustumPlane::Near as usize], aabb);
        near < 0.0 && far >= 0.0
    }
}

/// Diagonal length of the box's screen-space footprint in NDC units.
///
/// Returns `f32::INFINITY` if any corner lies behind the eye.
pub fn projected_length(xform: &Mat4, aabb: &Aabb3) -> f32 {
    let mut lo = [f32::INFINITY; 2];
    let mut hi = [f32::NEG_INFINITY; 2];
    for corner in aabb.corners() {
        let clip = xform * Vec4::new(corner.x, corner.y, corner.z, 1.0);
        if clip.w <= f32::EPSILON {
            return f32::INFINITY;
        }
        for axis in 0..2 {
            let ndc = clip[axis] / clip.w;
            lo[axis] = lo[axis].min(ndc);
            hi[axis] = hi[axis].max(ndc);
        }
    }
    ((hi[0] - lo[0]).powi(2) + (hi[1] - lo[1]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{look_at_rh, perspective_rh};

    fn camera() -> Mat4 {
        let proj = perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let view = look_at_rh(
            &Vec3::new(0.0, 0.0, 0.0),
            &Vec3::new(0.0, 0.0, -1.0),
            &Vec3::new(0.0, 1.0, 0.0),
        );
        proj * view
    }

    fn cube(center: Vec3, half: f32) -> Aabb3 {
        Aabb3::new(center - Vec3::repeat(half), center + Vec3::repeat(half))
    }

    #[test]
    fn test_box_in_front_is_inside() {
        let culler = FrustumCuller::from_matrix(&camera());
        assert_eq!(
            culler.classify(&cube(Vec3::new(0.0, 0.0, -10.0), 1.0)),
            Containment::Inside
        );
    }

    #[test]
    fn test_box_behind_is_outside() {
        let culler = FrustumCuller::from_matrix(&camera());
        assert_eq!(
            culler.classify(&cube(Vec3::new(0.0, 0.0, 10.0), 1.0)),
            Containment::Outside
        );
    }

    #[test]
    fn test_box_on_side_plane_intersects() {
        let culler = FrustumCuller::from_matrix(&camera());
        // 90 degree fov: the left plane passes through x = z at depth 10.
        assert_eq!(
            culler.classify(&cube(Vec3::new(-10.0, 0.0, -10.0), 1.0)),
            Containment::Intersecting
        );
    }

    #[test]
    fn test_clips_near() {
        let culler = FrustumCuller::from_matrix(&camera());
        assert!(culler.clips_near(&cube(Vec3::zeros(), 1.0)));
        assert!(!culler.clips_near(&cube(Vec3::new(0.0, 0.0, -10.0), 1.0)));
    }

    #[test]
    fn test_projected_length_shrinks_with_distance() {
        let m = camera();
        let near = projected_length(&m, &cube(Vec3::new(0.0, 0.0, -5.0), 1.0));
        let far = projected_length(&m, &cube(Vec3::new(0.0, 0.0, -50.0), 1.0));
        assert!(near > far);
        assert!(far > 0.0);
        assert_eq!(projected_length(&m, &cube(Vec3::zeros(), 1.0)), f32::INFINITY);
    }
}
