//! Math type aliases and helper functions.
//!
//! All rendering math is f32 on top of `nalgebra`.

pub use nalgebra;

/// 2D vector (f32).
pub type Vec2 = nalgebra::Vector2<f32>;

/// 3D vector (f32).
pub type Vec3 = nalgebra::Vector3<f32>;

/// 4D vector (f32).
pub type Vec4 = nalgebra::Vector4<f32>;

/// 4x4 matrix (f32).
pub type Mat4 = nalgebra::Matrix4<f32>;

/// Const-dimension f32 vector, used by dimension-generic bounds.
pub type VecN<const D: usize> = nalgebra::SVector<f32, D>;

/// Build a right-handed perspective projection with depth range [0, 1].
pub fn perspective_rh(yfov: f32, aspect: f32, znear: f32, zfar: f32) -> Mat4 {
    let f = 1.0 / (yfov / 2.0).tan();
    let nf = 1.0 / (znear - zfar);
    #[rustfmt::skip]
    let result = Mat4::new(
        f / aspect, 0.0,  0.0,              0.0,
        0.0,        f,    0.0,              0.0,
        0.0,        0.0,  zfar * nf,        znear * zfar * nf,
        0.0,        0.0,  -1.0,             0.0,
    );
    result
}

/// Build a right-handed orthographic projection with depth range [0, 1].
pub fn orthographic_rh(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    let rml = right - left;
    let tmb = top - bottom;
    let fmn = far - near;
    #[rustfmt::skip]
    let result = Mat4::new(
        2.0 / rml, 0.0,       0.0,         -(right + left) / rml,
        0.0,       2.0 / tmb, 0.0,         -(top + bottom) / tmb,
        0.0,       0.0,       -1.0 / fmn,  -near / fmn,
        0.0,       0.0,       0.0,          1.0,
    );
    result
}

/// Right-handed look-at view matrix.
pub fn look_at_rh(eye: &Vec3, target: &Vec3, up: &Vec3) -> Mat4 {
    let eye_point = nalgebra::Point3::from(*eye);
    let target_point = nalgebra::Point3::from(*target);
    nalgebra::Isometry3::look_at_rh(&eye_point, &target_point, up).to_homogeneous()
}

/// Transform a point by a 4x4 matrix, returning the homogeneous result.
pub fn transform_point4(m: &Mat4, p: &Vec3) -> Vec4 {
    m * Vec4::new(p.x, p.y, p.z, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perspective_maps_near_far_to_unit_depth() {
        let proj = perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 1.0, 100.0);

        let near = transform_point4(&proj, &Vec3::new(0.0, 0.0, -1.0));
        assert!((near.z / near.w).abs() < 1e-5);

        let far = transform_point4(&proj, &Vec3::new(0.0, 0.0, -100.0));
        assert!((far.z / far.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_look_at_moves_target_onto_negative_z() {
        let view = look_at_rh(
            &Vec3::new(0.0, 0.0, 10.0),
            &Vec3::zeros(),
            &Vec3::new(0.0, 1.0, 0.0),
        );
        let p = transform_point4(&view, &Vec3::zeros());
        assert!((p.z + 10.0).abs() < 1e-5);
        assert!(p.x.abs() < 1e-5 && p.y.abs() < 1e-5);
    }

    #[test]
    fn test_orthographic_center() {
        let proj = orthographic_rh(-2.0, 2.0, -1.0, 1.0, 0.0, 10.0);
        let p = transform_point4(&proj, &Vec3::new(0.0, 0.0, -5.0));
        assert!(p.x.abs() < 1e-6);
        assert!((p.z - 0.5).abs() < 1e-6);
    }
}
