//! Closures used by the shading nodes.
//!
//! Evaluation returns `f * cos` together with the pdf of sampling the same
//! direction. Microfacet lobes work in tangent space with `z` along the
//! shading normal. Delta lobes report a pdf of [`DELTA_PDF`] and scale
//! their color by the same amount, so `col / pdf` stays the lobe weight.

use std::f32::consts::PI;

use ray_math::Vec3;

use crate::sampling::{
    fresnel_dielectric_cos, reflect, sample_cosine_hemisphere, sample_uniform_hemisphere, tangent_to_world,
    world_to_tangent,
};

/// Pdf stored for perfectly specular events.
pub const DELTA_PDF: f32 = 1e6;
/// Below this squared alpha a microfacet lobe is treated as a mirror.
pub const DELTA_ALPHA2: f32 = 1e-7;
/// Shadowing roughness of the clearcoat lobe.
const CLEARCOAT_G_ALPHA: f32 = 0.25;

/// `f * cos` and pdf for one direction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BsdfEval {
    pub col: Vec3,
    pub pdf: f32,
}

impl BsdfEval {
    pub const ZERO: Self = Self { col: Vec3::ZERO, pdf: 0.0 };

    #[inline]
    fn delta(col: Vec3) -> Self {
        Self {
            col: col * DELTA_PDF,
            pdf: DELTA_PDF,
        }
    }

    /// Throughput multiplier of a sampled direction.
    #[inline]
    pub fn weight(&self) -> Vec3 {
        if self.pdf > 0.0 {
            self.col / self.pdf
        } else {
            Vec3::ZERO
        }
    }
}

/// A sampled direction with its evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BsdfSample {
    pub dir: Vec3,
    pub eval: BsdfEval,
}

/// Shading frame: tangent, bitangent and normal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frame {
    pub t: Vec3,
    pub b: Vec3,
    pub n: Vec3,
}

impl Frame {
    #[inline]
    pub fn to_local(&self, v: Vec3) -> Vec3 {
        world_to_tangent(v, self.t, self.b, self.n)
    }

    #[inline]
    pub fn to_world(&self, v: Vec3) -> Vec3 {
        tangent_to_world(v, self.t, self.b, self.n)
    }
}

#[inline]
pub fn schlick_weight(u: f32) -> f32 {
    let m = (1.0 - u).clamp(0.0, 1.0);
    let m2 = m * m;
    m2 * m2 * m
}

/// Ior matching a principled `specular` amount.
#[inline]
pub fn specular_ior(specular: f32) -> f32 {
    2.0 / (1.0 - (0.08 * specular).sqrt()) - 1.0
}

/// GGX normal distribution.
pub fn d_ggx(h: Vec3, ax: f32, ay: f32) -> f32 {
    if h.z == 0.0 {
        return 0.0;
    }
    let sx = -h.x / (h.z * ax);
    let sy = -h.y / (h.z * ay);
    let s1 = 1.0 + sx * sx + sy * sy;
    let cos4 = h.z * h.z * h.z * h.z;
    1.0 / (s1 * s1 * PI * ax * ay * cos4)
}

/// Smith masking for one direction.
pub fn g1(v: Vec3, ax: f32, ay: f32) -> f32 {
    if v.z == 0.0 {
        return 0.0;
    }
    let tan2 = (ax * ax * v.x * v.x + ay * ay * v.y * v.y) / (v.z * v.z);
    let lambda = 0.5 * (-1.0 + (1.0 + tan2).sqrt());
    1.0 / (1.0 + lambda)
}

/// Generalized Trowbridge-Reitz with `gamma = 1`.
pub fn d_gtr1(n_dot_h: f32, a: f32) -> f32 {
    if a >= 1.0 {
        return 1.0 / PI;
    }
    let a2 = a * a;
    let t = 1.0 + (a2 - 1.0) * n_dot_h * n_dot_h;
    (a2 - 1.0) / (PI * a2.ln() * t)
}

/// Sample a visible normal (tangent space) for view direction `v`.
pub fn sample_ggx_vndf(v: Vec3, ax: f32, ay: f32, r1: f32, r2: f32) -> Vec3 {
    let vh = Vec3::new(ax * v.x, ay * v.y, v.z).normalize();
    let lensq = vh.x * vh.x + vh.y * vh.y;
    let t1 = if lensq > 0.0 {
        Vec3::new(-vh.y, vh.x, 0.0) / lensq.sqrt()
    } else {
        Vec3::X
    };
    let t2 = vh.cross(t1);

    let r = r1.sqrt();
    let phi = 2.0 * PI * r2;
    let p1 = r * phi.cos();
    let mut p2 = r * phi.sin();
    let s = 0.5 * (1.0 + vh.z);
    p2 = (1.0 - s) * (1.0 - p1 * p1).max(0.0).sqrt() + s * p2;

    let nh = t1 * p1 + t2 * p2 + vh * (1.0 - p1 * p1 - p2 * p2).max(0.0).sqrt();
    Vec3::new(ax * nh.x, ay * nh.y, nh.z.max(0.0)).normalize()
}

// Oren-Nayar

pub fn eval_oren_diffuse(v: Vec3, n: Vec3, l: Vec3, roughness: f32, base: Vec3) -> BsdfEval {
    let sigma = roughness;
    let div = 1.0 / (PI + ((3.0 * PI - 4.0) / 6.0) * sigma);
    let a = div;
    let b = sigma * div;

    let nl = n.dot(l).max(0.0);
    let nv = n.dot(v).max(0.0);
    let mut t = l.dot(v) - nl * nv;
    if t > 0.0 {
        t /= nl.max(nv) + f32::MIN_POSITIVE;
    }
    BsdfEval {
        col: base * (nl * (a + b * t)),
        pdf: 0.5 / PI,
    }
}

pub fn sample_oren_diffuse(frame: &Frame, i: Vec3, roughness: f32, base: Vec3, r1: f32, r2: f32) -> BsdfSample {
    let dir = sample_uniform_hemisphere(r1, r2, frame.n);
    BsdfSample {
        dir,
        eval: eval_oren_diffuse(-i, frame.n, dir, roughness, base),
    }
}

// Principled diffuse with retro-reflection and sheen. The color is not
// divided by pi and carries no cosine; callers apply `N.L / pi`.

pub fn eval_principled_diffuse(
    v: Vec3,
    n: Vec3,
    l: Vec3,
    roughness: f32,
    base: Vec3,
    sheen: Vec3,
    uniform_sampling: bool,
) -> BsdfEval {
    let pdf = if uniform_sampling { 0.5 / PI } else { n.dot(l).max(0.0) / PI };

    let fl = schlick_weight(n.dot(l));
    let fv = schlick_weight(n.dot(v));
    let mut h = (l + v).normalize_or_zero();
    if v.dot(h) < 0.0 {
        h = -h;
    }
    let l_dot_h = l.dot(h);
    let fd90 = 0.5 + 2.0 * l_dot_h * l_dot_h * roughness;
    let fd = (1.0 + (fd90 - 1.0) * fl) * (1.0 + (fd90 - 1.0) * fv);

    let col = base * fd + sheen * (PI * schlick_weight(l_dot_h));
    BsdfEval { col, pdf }
}

pub fn sample_principled_diffuse(
    frame: &Frame,
    i: Vec3,
    roughness: f32,
    base: Vec3,
    sheen: Vec3,
    uniform_sampling: bool,
    r1: f32,
    r2: f32,
) -> BsdfSample {
    let dir = if uniform_sampling {
        sample_uniform_hemisphere(r1, r2, frame.n)
    } else {
        sample_cosine_hemisphere(r1, r2, frame.n)
    };
    BsdfSample {
        dir,
        eval: eval_principled_diffuse(-i, frame.n, dir, roughness, base, sheen, uniform_sampling),
    }
}

// GGX reflection

/// Fresnel-weighted tint: `spec_col` at normal incidence, white at grazing.
#[inline]
fn fresnel_tint(cos: f32, spec_ior: f32, spec_f0: f32, spec_col: Vec3) -> Vec3 {
    let fh = if spec_f0 < 1.0 {
        (fresnel_dielectric_cos(cos, spec_ior) - spec_f0) / (1.0 - spec_f0)
    } else {
        1.0
    };
    spec_col.lerp(Vec3::ONE, fh.clamp(0.0, 1.0))
}

pub fn eval_ggx_specular(
    view: Vec3,
    h: Vec3,
    refl: Vec3,
    ax: f32,
    ay: f32,
    spec_ior: f32,
    spec_f0: f32,
    spec_col: Vec3,
) -> BsdfEval {
    let d = d_ggx(h, ax, ay);
    let g1v = g1(view, ax, ay);
    let g = g1v * g1(refl, ax, ay);
    let f = fresnel_tint(view.dot(h), spec_ior, spec_f0, spec_col);

    let denom = 4.0 * (view.z * refl.z).abs();
    let coeff = if denom != 0.0 { d * g / denom } else { 0.0 };
    let col = f * coeff * refl.z.max(0.0);

    let v_dot_h = view.dot(h);
    let mut pdf = d * g1v * v_dot_h.max(0.0) / view.z.abs().max(f32::MIN_POSITIVE);
    let div = 4.0 * v_dot_h;
    pdf = if div != 0.0 { pdf / div } else { 0.0 };
    BsdfEval { col, pdf: pdf.max(0.0) }
}

pub fn sample_ggx_specular(
    frame: &Frame,
    i: Vec3,
    roughness: f32,
    spec_ior: f32,
    spec_f0: f32,
    spec_col: Vec3,
    r1: f32,
    r2: f32,
) -> BsdfSample {
    let alpha = roughness * roughness;
    if alpha * alpha < DELTA_ALPHA2 {
        let dir = reflect(i, frame.n, frame.n.dot(i));
        let f = fresnel_tint(dir.dot(frame.n), spec_ior, spec_f0, spec_col);
        return BsdfSample {
            dir,
            eval: BsdfEval::delta(f),
        };
    }

    let view = frame.to_local(-i).normalize();
    let h = sample_ggx_vndf(view, alpha, alpha, r1, r2);
    let refl = reflect(-view, h, -h.dot(view)).normalize();
    BsdfSample {
        dir: frame.to_world(refl),
        eval: eval_ggx_specular(view, h, refl, alpha, alpha, spec_ior, spec_f0, spec_col),
    }
}

// GGX refraction. `eta` is the ratio of the incident to the transmitted ior.

/// Half vector of a refraction event, oriented along the normal.
pub fn refraction_half_vector(view: Vec3, refr: Vec3, eta: f32) -> Vec3 {
    let h = -(view * eta + refr).normalize_or_zero();
    if h.z < 0.0 {
        -h
    } else {
        h
    }
}

pub fn eval_ggx_refraction(view: Vec3, h: Vec3, refr: Vec3, alpha: f32, eta: f32, refr_col: Vec3) -> BsdfEval {
    if refr.z >= 0.0 || view.z <= 0.0 {
        return BsdfEval::ZERO;
    }
    let d = d_ggx(h, alpha, alpha);
    let g1o = g1(refr, alpha, alpha);
    let g1i = g1(view, alpha, alpha);

    let denom = refr.dot(h) + view.dot(h) * eta;
    if denom == 0.0 {
        return BsdfEval::ZERO;
    }
    let jacobian = (-refr.dot(h)).max(0.0) / (denom * denom);
    let v_dot_h = view.dot(h).max(0.0);

    let f = d * g1i * g1o * v_dot_h * jacobian / view.z;
    let pdf = d * g1o * v_dot_h * jacobian / view.z;
    BsdfEval {
        col: refr_col * f,
        pdf,
    }
}

/// `None` on total internal reflection.
pub fn sample_ggx_refraction(
    frame: &Frame,
    i: Vec3,
    roughness: f32,
    eta: f32,
    refr_col: Vec3,
    r1: f32,
    r2: f32,
) -> Option<BsdfSample> {
    let alpha = roughness * roughness;
    if alpha * alpha < DELTA_ALPHA2 {
        let cosi = -i.dot(frame.n);
        let cost2 = 1.0 - eta * eta * (1.0 - cosi * cosi);
        if cost2 < 0.0 {
            return None;
        }
        let m = eta * cosi - cost2.sqrt();
        return Some(BsdfSample {
            dir: (i * eta + frame.n * m).normalize(),
            eval: BsdfEval::delta(refr_col),
        });
    }

    let view = frame.to_local(-i).normalize();
    let h = sample_ggx_vndf(view, alpha, alpha, r1, r2);
    let cosi = view.dot(h);
    let cost2 = 1.0 - eta * eta * (1.0 - cosi * cosi);
    if cost2 < 0.0 {
        return None;
    }
    let m = eta * cosi - cost2.sqrt();
    let refr = (-view * eta + h * m).normalize();
    Some(BsdfSample {
        dir: frame.to_world(refr),
        eval: eval_ggx_refraction(view, h, refr, alpha, eta, refr_col),
    })
}

// Clearcoat. Callers scale the result by 0.25.

pub fn eval_clearcoat(view: Vec3, h: Vec3, refl: Vec3, alpha: f32, coat_ior: f32, coat_f0: f32) -> BsdfEval {
    let d = d_gtr1(h.z, alpha);
    let g = g1(view, CLEARCOAT_G_ALPHA, CLEARCOAT_G_ALPHA) * g1(refl, CLEARCOAT_G_ALPHA, CLEARCOAT_G_ALPHA);
    let f = fresnel_tint(refl.dot(h), coat_ior, coat_f0, Vec3::splat(0.04));

    let denom = 4.0 * (view.z * refl.z).abs();
    let coeff = if denom != 0.0 { d * g / denom } else { 0.0 };
    let col = f * coeff * refl.z.max(0.0);

    let v_dot_h = view.dot(h);
    let pdf = if v_dot_h > 0.0 { d * h.z.max(0.0) / (4.0 * v_dot_h) } else { 0.0 };
    BsdfEval { col, pdf }
}

pub fn sample_clearcoat(frame: &Frame, i: Vec3, alpha: f32, coat_ior: f32, coat_f0: f32, r1: f32, r2: f32) -> BsdfSample {
    if alpha * alpha < DELTA_ALPHA2 {
        let dir = reflect(i, frame.n, frame.n.dot(i));
        let f = fresnel_tint(dir.dot(frame.n), coat_ior, coat_f0, Vec3::splat(0.04));
        return BsdfSample {
            dir,
            eval: BsdfEval::delta(f),
        };
    }

    let view = frame.to_local(-i).normalize();
    let a2 = alpha * alpha;
    let cos_theta = ((1.0 - a2.powf(1.0 - r1)) / (1.0 - a2)).max(0.0).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let phi = 2.0 * PI * r2;
    let mut h = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
    if h.dot(view) < 0.0 {
        h = -h;
    }
    let refl = reflect(-view, h, -h.dot(view)).normalize();
    BsdfSample {
        dir: frame.to_world(refl),
        eval: eval_clearcoat(view, h, refl, alpha, coat_ior, coat_f0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up_frame() -> Frame {
        Frame {
            t: Vec3::X,
            b: Vec3::Y,
            n: Vec3::Z,
        }
    }

    fn grid(n: u32) -> impl Iterator<Item = (f32, f32)> {
        (0..n * n).map(move |k| ((k % n) as f32 + 0.5) / n as f32)
            .zip((0..n * n).map(move |k| ((k / n) as f32 + 0.5) / n as f32))
    }

    #[test]
    fn test_lambert_albedo_is_one() {
        let frame = up_frame();
        let i = Vec3::new(0.3, 0.0, -1.0).normalize();
        let mut sum = Vec3::ZERO;
        let n = 64;
        for (r1, r2) in grid(n) {
            sum += sample_oren_diffuse(&frame, i, 0.0, Vec3::ONE, r1, r2).eval.weight();
        }
        let albedo = sum / (n * n) as f32;
        assert!((albedo.x - 1.0).abs() < 0.02, "albedo {albedo}");
    }

    #[test]
    fn test_principled_diffuse_sheen_adds_energy() {
        let n = Vec3::Z;
        let v = Vec3::new(0.8, 0.0, 0.6);
        let l = Vec3::new(-0.8, 0.0, 0.6);
        let plain = eval_principled_diffuse(v, n, l, 0.5, Vec3::splat(0.5), Vec3::ZERO, false);
        let sheen = eval_principled_diffuse(v, n, l, 0.5, Vec3::splat(0.5), Vec3::ONE, false);
        assert!(sheen.col.x > plain.col.x);
        assert!((plain.pdf - 0.6 / PI).abs() < 1e-6);
    }

    #[test]
    fn test_ggx_sample_weight_is_bounded() {
        let frame = up_frame();
        let i = Vec3::new(0.5, 0.2, -1.0).normalize();
        for roughness in [0.2, 0.5, 0.9] {
            for (r1, r2) in grid(8) {
                let s = sample_ggx_specular(&frame, i, roughness, 1.5, 0.04, Vec3::ONE, r1, r2);
                if s.eval.pdf == 0.0 {
                    continue;
                }
                assert!(s.dir.z >= -1e-4 || s.eval.col == Vec3::ZERO);
                let w = s.eval.weight();
                assert!(w.max_element() <= 1.0 + 1e-3, "weight {w} at roughness {roughness}");
            }
        }
    }

    #[test]
    fn test_ggx_eval_matches_sample() {
        let frame = up_frame();
        let i = Vec3::new(0.1, -0.3, -1.0).normalize();
        let s = sample_ggx_specular(&frame, i, 0.6, 1.5, 0.04, Vec3::ONE, 0.3, 0.7);
        let view = -i;
        let h = (view + s.dir).normalize();
        let e = eval_ggx_specular(view, h, s.dir, 0.36, 0.36, 1.5, 0.04, Vec3::ONE);
        assert!((e.pdf - s.eval.pdf).abs() <= 1e-3 * s.eval.pdf.max(1.0));
        assert!((e.col - s.eval.col).length() <= 1e-3 * s.eval.col.length().max(1.0));
    }

    #[test]
    fn test_mirror_is_delta() {
        let frame = up_frame();
        let i = Vec3::new(1.0, 0.0, -1.0).normalize();
        let s = sample_ggx_specular(&frame, i, 0.0, 1.5, 0.04, Vec3::ONE, 0.5, 0.5);
        assert_eq!(s.eval.pdf, DELTA_PDF);
        assert!((s.dir - Vec3::new(1.0, 0.0, 1.0).normalize()).length() < 1e-5);
        assert!((s.eval.weight() - Vec3::ONE).length() < 1e-5);
    }

    #[test]
    fn test_smooth_refraction_bends_toward_normal() {
        let frame = up_frame();
        let i = Vec3::new(1.0, 0.0, -1.0).normalize();
        let s = sample_ggx_refraction(&frame, i, 0.0, 1.0 / 1.5, Vec3::ONE, 0.5, 0.5).unwrap();
        assert!(s.dir.z < 0.0);
        // Snell: sin_t = sin_i / 1.5
        let sin_t = (s.dir.x * s.dir.x + s.dir.y * s.dir.y).sqrt();
        assert!((sin_t - (0.5f32).sqrt() / 1.5).abs() < 1e-4);
    }

    #[test]
    fn test_total_internal_reflection() {
        let frame = up_frame();
        let grazing = Vec3::new(1.0, 0.0, -0.2).normalize();
        assert!(sample_ggx_refraction(&frame, grazing, 0.0, 1.5, Vec3::ONE, 0.5, 0.5).is_none());
    }

    #[test]
    fn test_rough_refraction_transmits() {
        let frame = up_frame();
        let i = Vec3::new(0.2, 0.0, -1.0).normalize();
        let s = sample_ggx_refraction(&frame, i, 0.5, 1.0 / 1.5, Vec3::ONE, 0.4, 0.6).unwrap();
        assert!(s.dir.z < 0.0);
        assert!(s.eval.pdf > 0.0);
        let h = refraction_half_vector(-i, s.dir, 1.0 / 1.5);
        assert!(h.z > 0.0);
    }

    #[test]
    fn test_clearcoat_reflects_upwards() {
        let frame = up_frame();
        let i = Vec3::new(0.3, 0.1, -1.0).normalize();
        let ior = specular_ior(1.0);
        let f0 = fresnel_dielectric_cos(1.0, ior);
        let s = sample_clearcoat(&frame, i, 0.09, ior, f0, 0.25, 0.75);
        assert!(s.dir.z > 0.0);
        assert!(s.eval.pdf > 0.0);
    }

    #[test]
    fn test_specular_ior() {
        assert!((specular_ior(0.5) - 1.5).abs() < 1e-5);
        assert!((specular_ior(0.0) - 1.0).abs() < 1e-6);
    }
}
