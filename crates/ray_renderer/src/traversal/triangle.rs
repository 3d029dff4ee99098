//! Ray/triangle test on precomputed plane equations.

use ray_core::TriAccel;
use ray_math::Vec3;

/// Intersection with one triangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriHit {
    pub t: f32,
    /// Weight of the second vertex.
    pub u: f32,
    /// Weight of the third vertex.
    pub v: f32,
    /// The ray travels along the geometric normal.
    pub backfacing: bool,
}

#[inline]
fn plane(p: &[f32; 4], x: Vec3) -> f32 {
    p[0] * x.x + p[1] * x.y + p[2] * x.z + p[3]
}

/// Hit with `0 < t <= t_max`; `t == t_max` is kept so equal-distance ties
/// can still be decided by the caller.
#[inline]
pub fn intersect_tri(o: Vec3, d: Vec3, tri: &TriAccel, t_max: f32) -> Option<TriHit> {
    let n = tri.normal();
    let det = n.dot(d);
    if det.abs() < 1e-30 {
        return None;
    }
    let t = -plane(&tri.n_plane, o) / det;
    if !(t > 0.0 && t <= t_max) {
        return None;
    }
    let p = o + d * t;
    let u = plane(&tri.u_plane, p);
    let v = plane(&tri.v_plane, p);
    if u < 0.0 || v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some(TriHit {
        t,
        u,
        v,
        backfacing: det > 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_tri() -> TriAccel {
        // Front face looks toward +Z
        TriAccel::new(Vec3::ZERO, Vec3::X, Vec3::Y)
    }

    #[test]
    fn test_front_hit() {
        let hit = intersect_tri(Vec3::new(0.25, 0.25, 2.0), -Vec3::Z, &unit_tri(), 10.0).unwrap();
        assert!((hit.t - 2.0).abs() < 1e-6);
        assert!((hit.u - 0.25).abs() < 1e-6);
        assert!((hit.v - 0.25).abs() < 1e-6);
        assert!(!hit.backfacing);
    }

    #[test]
    fn test_back_hit() {
        let hit = intersect_tri(Vec3::new(0.1, 0.6, -1.0), Vec3::Z, &unit_tri(), 10.0).unwrap();
        assert!(hit.backfacing);
        assert!((hit.v - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_misses() {
        let tri = unit_tri();
        // Outside the edges
        assert!(intersect_tri(Vec3::new(0.8, 0.8, 1.0), -Vec3::Z, &tri, 10.0).is_none());
        // Behind the origin
        assert!(intersect_tri(Vec3::new(0.2, 0.2, 1.0), Vec3::Z, &tri, 10.0).is_none());
        // Beyond t_max
        assert!(intersect_tri(Vec3::new(0.2, 0.2, 5.0), -Vec3::Z, &tri, 4.0).is_none());
        // Parallel
        assert!(intersect_tri(Vec3::new(0.2, 0.2, 1.0), Vec3::X, &tri, 10.0).is_none());
    }

    #[test]
    fn test_degenerate_never_hit() {
        let tri = TriAccel::new(Vec3::ZERO, Vec3::X, Vec3::X * 2.0);
        assert!(intersect_tri(Vec3::new(0.5, 0.0, 1.0), -Vec3::Z, &tri, 10.0).is_none());
    }
}
