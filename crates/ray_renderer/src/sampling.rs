//! Small sampling and geometry helpers shared by ray generation and shading.

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI};

use ray_math::{build_orthonormal_basis, fract, Vec2, Vec3};

use crate::ray::PixelCoord;

/// Integer finalizer used to decorrelate pixels.
#[inline]
pub fn hash(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x85eb_ca6b);
    x ^= x >> 13;
    x = x.wrapping_mul(0xc2b2_ae35);
    x ^= x >> 16;
    x
}

/// Uniform float in [0, 1) from the low mantissa bits of `m`.
#[inline]
pub fn construct_float(m: u32) -> f32 {
    const MANTISSA: u32 = 0x007f_ffff;
    const ONE: u32 = 0x3f80_0000;
    f32::from_bits((m & MANTISSA) | ONE) - 1.0
}

/// Cranley-Patterson rotation of a pixel.
#[inline]
pub fn sample_offset(px_hash: u32) -> Vec2 {
    Vec2::new(construct_float(px_hash), construct_float(hash(px_hash)))
}

/// Hash of pixel `(x, y)`, or of its 4x4 block when sampling coherently.
#[inline]
pub fn pixel_hash(x: u32, y: u32, w: u32, coherent: bool) -> u32 {
    if coherent {
        hash((y / 4) * w.div_ceil(4) + x / 4)
    } else {
        hash(y * w + x)
    }
}

/// Per-pixel view of an iteration's sample vector.
#[derive(Clone, Copy, Debug)]
pub struct PixelSampler<'a> {
    seq: &'a [f32],
    w: u32,
    coherent: bool,
}

impl<'a> PixelSampler<'a> {
    /// `w` is the frame width used to index pixels.
    pub fn new(seq: &'a [f32], w: u32, coherent: bool) -> Self {
        Self { seq, w, coherent }
    }

    #[inline]
    pub fn offset(&self, xy: PixelCoord) -> Vec2 {
        sample_offset(pixel_hash(xy.x(), xy.y(), self.w, self.coherent))
    }

    /// Dimension `dim` rotated by `offset`.
    #[inline]
    pub fn get(&self, dim: usize, offset: f32) -> f32 {
        fract(self.seq.get(dim).copied().unwrap_or(0.5) + offset)
    }

    /// Dimensions `dim` and `dim + 1` rotated by the two offset components.
    #[inline]
    pub fn get2(&self, dim: usize, offset: Vec2) -> (f32, f32) {
        (self.get(dim, offset.x), self.get(dim + 1, offset.y))
    }
}

/// Concentric mapping of the unit square onto the unit disk.
pub fn concentric_disk(r1: f32, r2: f32) -> Vec2 {
    let offset = Vec2::new(2.0 * r1 - 1.0, 2.0 * r2 - 1.0);
    if offset == Vec2::ZERO {
        return Vec2::ZERO;
    }
    let (r, theta) = if offset.x.abs() > offset.y.abs() {
        (offset.x, FRAC_PI_4 * (offset.y / offset.x))
    } else {
        (offset.y, FRAC_PI_2 - FRAC_PI_4 * (offset.x / offset.y))
    };
    let (sin, cos) = theta.sin_cos();
    Vec2::new(r * cos, r * sin)
}

/// Point of a disk of `radius` at distance one along `n`.
pub fn map_to_cone(r1: f32, r2: f32, n: Vec3, radius: f32) -> Vec3 {
    let uv = concentric_disk(r1, r2) * radius;
    let (t, b) = build_orthonormal_basis(n);
    n + uv.x * t + uv.y * b
}

/// Cosine-weighted direction around `n`; pdf is `cos / PI`.
pub fn sample_cosine_hemisphere(r1: f32, r2: f32, n: Vec3) -> Vec3 {
    let phi = 2.0 * PI * r2;
    let (sin_phi, cos_phi) = phi.sin_cos();
    let dir = r1.sqrt();
    let k = (1.0 - r1).max(0.0).sqrt();
    let (t, b) = build_orthonormal_basis(n);
    (dir * cos_phi * t + dir * sin_phi * b + k * n).normalize()
}

/// Uniform direction over the hemisphere around `n`; pdf is `1 / (2 PI)`.
pub fn sample_uniform_hemisphere(r1: f32, r2: f32, n: Vec3) -> Vec3 {
    let phi = 2.0 * PI * r2;
    let (sin_phi, cos_phi) = phi.sin_cos();
    let cos_theta = r1;
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let (t, b) = build_orthonormal_basis(n);
    (sin_theta * cos_phi * t + sin_theta * sin_phi * b + cos_theta * n).normalize()
}

#[inline]
pub fn power_heuristic(a: f32, b: f32) -> f32 {
    let t = a * a;
    t / (b * b + t)
}

#[inline]
pub fn safe_div(a: f32, b: f32) -> f32 {
    if b.abs() < ray_math::FLT_EPS {
        0.0
    } else {
        a / b
    }
}

#[inline]
pub fn safe_normalize(v: Vec3) -> Vec3 {
    v.try_normalize().unwrap_or(Vec3::ZERO)
}

/// Mirror `i` around `n`, with `dot = i.n` supplied by the caller.
#[inline]
pub fn reflect(i: Vec3, n: Vec3, dot: f32) -> Vec3 {
    i - 2.0 * dot * n
}

/// Push a hit point off the surface along `n` by a few ulps.
///
/// Wächter and Binder, "A Fast and Robust Method for Avoiding
/// Self-Intersection", Ray Tracing Gems ch. 6.
pub fn offset_ray(p: Vec3, n: Vec3) -> Vec3 {
    const ORIGIN: f32 = 1.0 / 32.0;
    const FLOAT_SCALE: f32 = 1.0 / 65536.0;
    const INT_SCALE: f32 = 256.0;

    let offset = |p: f32, n: f32| {
        let of_i = (INT_SCALE * n) as i32;
        let bits = p.to_bits() as i32;
        let p_i = f32::from_bits(if p < 0.0 { bits - of_i } else { bits + of_i } as u32);
        if p.abs() < ORIGIN {
            p + FLOAT_SCALE * n
        } else {
            p_i
        }
    };
    Vec3::new(offset(p.x, n.x), offset(p.y, n.y), offset(p.z, n.z))
}

/// Unpolarized fresnel reflectance of a dielectric, `1` on total internal reflection.
pub fn fresnel_dielectric_cos(cosi: f32, eta: f32) -> f32 {
    let c = cosi.abs();
    let g = eta * eta - 1.0 + c * c;
    if g <= 0.0 {
        return 1.0;
    }
    let g = g.sqrt();
    let a = (g - c) / (g + c);
    let b = (c * (g + c) - 1.0) / (c * (g - c) + 1.0);
    0.5 * a * a * (1.0 + b * b)
}

/// Express `v` in the `(t, b, n)` frame.
#[inline]
pub fn world_to_tangent(v: Vec3, t: Vec3, b: Vec3, n: Vec3) -> Vec3 {
    Vec3::new(v.dot(t), v.dot(b), v.dot(n))
}

/// Inverse of [`world_to_tangent`].
#[inline]
pub fn tangent_to_world(v: Vec3, t: Vec3, b: Vec3, n: Vec3) -> Vec3 {
    v.x * t + v.y * b + v.z * n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construct_float_range() {
        for i in 0..1000u32 {
            let f = construct_float(hash(i));
            assert!((0.0..1.0).contains(&f));
        }
        assert_eq!(construct_float(0), 0.0);
    }

    #[test]
    fn test_coherent_pixel_hash_shares_blocks() {
        assert_eq!(pixel_hash(0, 0, 64, true), pixel_hash(3, 3, 64, true));
        assert_ne!(pixel_hash(0, 0, 64, true), pixel_hash(4, 0, 64, true));
        assert_ne!(pixel_hash(0, 0, 64, false), pixel_hash(1, 0, 64, false));
    }

    #[test]
    fn test_concentric_disk_stays_inside() {
        for i in 0..17 {
            for j in 0..17 {
                let p = concentric_disk(i as f32 / 16.0, j as f32 / 16.0);
                assert!(p.length() <= 1.0 + 1e-5);
            }
        }
        assert_eq!(concentric_disk(0.5, 0.5), Vec2::ZERO);
        assert!((concentric_disk(1.0, 0.5) - Vec2::X).length() < 1e-5);
    }

    #[test]
    fn test_hemisphere_samples_face_normal() {
        let n = Vec3::new(0.3, -0.8, 0.2).normalize();
        for i in 0..32 {
            let r1 = (i as f32 + 0.5) / 32.0;
            let r2 = ((i * 13) % 32) as f32 / 32.0;
            assert!(sample_cosine_hemisphere(r1, r2, n).dot(n) >= -1e-5);
            assert!(sample_uniform_hemisphere(r1, r2, n).dot(n) >= -1e-5);
        }
    }

    #[test]
    fn test_fresnel_limits() {
        // Normal incidence on glass
        let f0 = fresnel_dielectric_cos(1.0, 1.5);
        assert!((f0 - 0.04).abs() < 1e-4);
        // Grazing angle reflects everything
        assert!(fresnel_dielectric_cos(1e-4, 1.5) > 0.99);
        // Total internal reflection
        assert_eq!(fresnel_dielectric_cos(0.1, 1.0 / 1.5), 1.0);
    }

    #[test]
    fn test_offset_ray_moves_along_normal() {
        for p in [Vec3::ZERO, Vec3::new(100.0, -50.0, 3.0)] {
            let n = Vec3::Y;
            let q = offset_ray(p, n);
            assert!(q.y > p.y);
            assert_eq!(q.x, p.x);
            assert!((q - p).length() < 1e-2);
        }
    }

    #[test]
    fn test_power_heuristic() {
        assert_eq!(power_heuristic(1.0, 1.0), 0.5);
        assert!(power_heuristic(1e6, 1.0) > 0.999);
        assert_eq!(safe_div(1.0, 0.0), 0.0);
    }

    #[test]
    fn test_tangent_frame_round_trip() {
        let n = Vec3::new(0.0, 0.6, 0.8);
        let (t, b) = build_orthonormal_basis(n);
        let v = Vec3::new(0.2, -0.4, 0.9);
        let back = tangent_to_world(world_to_tangent(v, t, b, n), t, b, n);
        assert!((back - v).length() < 1e-5);
    }
}
