//! Math primitives for the ray renderer.
//!
//! - glam re-export (`Vec3`, `Vec4`, `Mat4`, ...)
//! - [`Interval`] and [`Aabb`] for bounding volumes
//! - [`Ray`] with a cached reciprocal direction for slab tests
//! - [`Mat4Ext`] helpers for instance transforms

// Re-export glam for convenience
pub use glam::*;

mod aabb;
mod interval;
mod ray;
mod transform;

pub use aabb::Aabb;
pub use interval::Interval;
pub use ray::Ray;
pub use transform::Mat4Ext;

/// Largest distance a ray is allowed to travel.
pub const MAX_DIST: f32 = 3.402_823_4e30;

/// Smallest meaningful float difference used to guard divisions.
pub const FLT_EPS: f32 = 1e-7;

/// Rec. 709 luminance of a linear color.
#[inline]
pub fn luminance(c: Vec3) -> f32 {
    0.212671 * c.x + 0.715160 * c.y + 0.072169 * c.z
}

/// Linear interpolation between two scalars.
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Fractional part that stays in [0, 1) for negative inputs too.
#[inline]
pub fn fract(x: f32) -> f32 {
    x - x.floor()
}

/// Build an orthonormal basis `(tangent, bitangent)` around `n`.
///
/// Duff et al. 2017, branchless and continuous except at `n.z == -1`.
pub fn build_orthonormal_basis(n: Vec3) -> (Vec3, Vec3) {
    let sign = 1.0_f32.copysign(n.z);
    let a = -1.0 / (sign + n.z);
    let b = n.x * n.y * a;
    let t = Vec3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x);
    let bt = Vec3::new(b, sign + n.y * n.y * a, -n.y);
    (t, bt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_operations() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);
        let c = a + b;
        assert_eq!(c, Vec3::new(5.0, 7.0, 9.0));
    }

    #[test]
    fn test_luminance_white() {
        assert!((luminance(Vec3::ONE) - 1.0).abs() < 1e-4);
        assert_eq!(luminance(Vec3::ZERO), 0.0);
    }

    #[test]
    fn test_fract_negative() {
        assert!((fract(-0.25) - 0.75).abs() < 1e-6);
        assert!((fract(1.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_orthonormal_basis() {
        for n in [Vec3::Z, -Vec3::Z, Vec3::X, Vec3::new(1.0, 1.0, 1.0).normalize()] {
            let (t, b) = build_orthonormal_basis(n);
            assert!(t.dot(n).abs() < 1e-5);
            assert!(b.dot(n).abs() < 1e-5);
            assert!(t.dot(b).abs() < 1e-5);
            assert!((t.length() - 1.0).abs() < 1e-5);
        }
    }
}
