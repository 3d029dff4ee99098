//! Surface shading.
//!
//! Each hit produces a color contribution, at most one continuation ray and
//! at most one shadow ray. Batches are shaded in parallel and the outputs are
//! committed in input order, so the ray lists stay deterministic.

pub mod bsdf;
pub mod env;
pub mod light;
pub mod surface;

use ray_core::{Material, SceneSnapshot, ShadingNode};
use ray_math::{build_orthonormal_basis, luminance, Mat4Ext, Vec2, Vec3, Vec4, FLT_EPS, MAX_DIST};
use rayon::prelude::*;

use crate::ray::{HitData, RayData, ShadowRay};
use crate::region::Rect;
use crate::sampling::{fresnel_dielectric_cos, offset_ray, power_heuristic, reflect, PixelSampler};
use crate::sequence::{
    rand_dim, RAND_DIM_BSDF_PICK, RAND_DIM_BSDF_U, RAND_DIM_LIGHT_PICK, RAND_DIM_LIGHT_U, RAND_DIM_TERMINATE,
};
use crate::settings::PassSettings;

use bsdf::{
    eval_clearcoat, eval_ggx_refraction, eval_ggx_specular, eval_oren_diffuse, eval_principled_diffuse,
    refraction_half_vector, sample_clearcoat, sample_ggx_refraction, sample_ggx_specular, sample_oren_diffuse,
    sample_principled_diffuse, specular_ior, BsdfEval, Frame, DELTA_ALPHA2, DELTA_PDF,
};
use env::miss_color;
use light::{light_hit_color, sample_light_source, LightSample};
use surface::{mix_factor, sample_texture, MAX_MIX_DEPTH};

/// Everything one hit hands back to the render loop.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ShadeResult {
    /// Contribution already multiplied by the ray throughput.
    pub col: Vec3,
    pub secondary: Option<RayData>,
    pub shadow: Option<ShadowRay>,
    /// Surface albedo at the hit.
    pub base_color: Vec3,
    /// Shading normal and hit distance.
    pub depth_normal: Vec4,
}

/// Region-local outputs of [`shade_primary`].
pub struct PrimaryTargets<'a> {
    pub temp: &'a mut [Vec4],
    pub base_color: Option<&'a mut [Vec4]>,
    pub depth_normals: Option<&'a mut [Vec4]>,
}

#[inline]
fn clamp_color(c: Vec3, limit: f32) -> Vec3 {
    if limit > 0.0 {
        c.min(Vec3::splat(limit))
    } else {
        c
    }
}

/// Shade camera rays and write one color per pixel into `targets.temp`.
#[allow(clippy::too_many_arguments)]
pub fn shade_primary(
    ps: &PassSettings,
    rays: &[RayData],
    hits: &[HitData],
    sampler: &PixelSampler<'_>,
    sc: &SceneSnapshot,
    rect: &Rect,
    targets: PrimaryTargets<'_>,
    out_secondary: &mut Vec<RayData>,
    out_shadow: &mut Vec<ShadowRay>,
) {
    let results: Vec<ShadeResult> = rays
        .par_iter()
        .zip(hits.par_iter())
        .map(|(ray, hit)| shade_ray(ps, hit, ray, sampler, sc))
        .collect();

    let PrimaryTargets {
        temp,
        mut base_color,
        mut depth_normals,
    } = targets;
    for (ray, res) in rays.iter().zip(results) {
        let (x, y) = (ray.xy.x(), ray.xy.y());
        if !rect.contains(x, y) {
            continue;
        }
        let idx = rect.local_index(x, y);
        let col = if ps.skip_direct_lighting {
            Vec3::ZERO
        } else {
            clamp_color(res.col, ps.clamp_direct)
        };
        temp[idx] = col.extend(1.0);
        if let Some(out) = base_color.as_deref_mut() {
            out[idx] = res.base_color.extend(1.0);
        }
        if let Some(out) = depth_normals.as_deref_mut() {
            out[idx] = res.depth_normal;
        }
        if let Some(r) = res.secondary {
            if !ps.skip_indirect_lighting {
                out_secondary.push(r);
            }
        }
        if let Some(sh) = res.shadow {
            if !ps.skip_direct_lighting {
                out_shadow.push(sh);
            }
        }
    }
}

/// Shade bounced rays and add their contributions to `temp`.
#[allow(clippy::too_many_arguments)]
pub fn shade_secondary(
    ps: &PassSettings,
    rays: &[RayData],
    hits: &[HitData],
    sampler: &PixelSampler<'_>,
    sc: &SceneSnapshot,
    rect: &Rect,
    temp: &mut [Vec4],
    out_secondary: &mut Vec<RayData>,
    out_shadow: &mut Vec<ShadowRay>,
) {
    let results: Vec<ShadeResult> = rays
        .par_iter()
        .zip(hits.par_iter())
        .map(|(ray, hit)| shade_ray(ps, hit, ray, sampler, sc))
        .collect();

    for (ray, res) in rays.iter().zip(results) {
        let (x, y) = (ray.xy.x(), ray.xy.y());
        if !rect.contains(x, y) {
            continue;
        }
        let col = clamp_color(res.col, ps.clamp_indirect);
        temp[rect.local_index(x, y)] += col.extend(0.0);
        out_secondary.extend(res.secondary);
        out_shadow.extend(res.shadow);
    }
}

/// Geometry of a shading point in world space.
struct SurfacePoint {
    p: Vec3,
    /// Shading normal facing the incoming ray's side.
    n: Vec3,
    /// Geometric normal on the incoming ray's side.
    plane_n: Vec3,
    tangent: Vec3,
    uv: Vec2,
    /// Texture LOD before the texture resolution term.
    lambda: f32,
    tri_area: f32,
}

impl SurfacePoint {
    fn new(sc: &SceneSnapshot, hit: &HitData, ray: &RayData) -> Option<Self> {
        let mi = sc.mesh_instances.get(hit.obj_index as usize)?;
        let tr = sc.transforms.get(mi.tr_index as usize)?;
        let [v1, v2, v3] = sc.triangle_vertices(hit.prim_index);
        let w = 1.0 - hit.u - hit.v;

        let e1 = v2.p - v1.p;
        let e2 = v3.p - v1.p;
        let mut n = tr
            .inv_xform
            .transform_normal_by_inverse(v1.n * w + v2.n * hit.u + v3.n * hit.v)
            .normalize_or_zero();
        let mut plane_n = tr.inv_xform.transform_normal_by_inverse(e1.cross(e2)).normalize_or_zero();
        let tangent = tr
            .xform
            .transform_vector3(v1.b * w + v2.b * hit.u + v3.b * hit.v);
        if hit.backfacing {
            n = -n;
            plane_n = -plane_n;
        }

        let uv = v1.t * w + v2.t * hit.u + v3.t * hit.v;
        let pa = tr.xform.transform_vector3(e1).cross(tr.xform.transform_vector3(e2)).length();
        let ta = (v2.t - v1.t).perp_dot(v3.t - v1.t).abs();
        let cone_width = ray.cone_width + ray.cone_spread * hit.t;
        let lambda = if ta > 0.0 && pa > 0.0 && cone_width > 0.0 {
            0.5 * (ta / pa).log2() + cone_width.log2()
        } else {
            f32::NEG_INFINITY
        };

        Some(Self {
            p: ray.o + ray.d * hit.t,
            n,
            plane_n,
            tangent,
            uv,
            lambda,
            tri_area: 0.5 * pa,
        })
    }

    fn frame(&self) -> Frame {
        let n = self.n;
        match n.cross(self.tangent).try_normalize() {
            Some(b) => Frame { t: b.cross(n), b, n },
            None => {
                let (t, b) = build_orthonormal_basis(n);
                Frame { t, b, n }
            }
        }
    }

    fn tex(&self, sc: &SceneSnapshot, tex: Option<u32>) -> Vec4 {
        let Some(t) = tex.and_then(|t| sc.textures.get(t as usize)) else {
            return Vec4::ONE;
        };
        let res = (t.width() as f32 * t.height() as f32).max(1.0);
        let lod = (self.lambda + 0.5 * res.log2()).max(0.0);
        t.sample(self.uv, if lod.is_finite() { lod } else { 0.0 })
    }
}

/// Per-hit shading state handed to the node evaluators.
struct ShadeCtx<'a> {
    ps: &'a PassSettings,
    sc: &'a SceneSnapshot,
    ray: &'a RayData,
    hit: &'a HitData,
    sp: &'a SurfacePoint,
    frame: Frame,
    ls: Option<LightSample>,
    base: Vec3,
    roughness: f32,
    mix_weight: f32,
    ext_ior: f32,
    /// BSDF sample numbers.
    bu: f32,
    bv: f32,
}

/// Node output before shadow-ray scheduling.
#[derive(Default)]
struct NodeOut {
    /// Emission and other unshadowed light (excluding throughput).
    emitted: Vec3,
    /// Light-sample contribution (excluding throughput).
    direct: Vec3,
    new_ray: Option<RayData>,
}

impl ShadeCtx<'_> {
    fn can_bounce(&self, depth_of_kind: u8, max_of_kind: u8) -> bool {
        depth_of_kind < max_of_kind && self.ray.depth.bounce_depth() < self.ps.max_total_depth as u32
    }

    fn child_ray(&self) -> RayData {
        RayData {
            cone_width: self.ray.cone_width + self.ray.cone_spread * self.hit.t,
            ..*self.ray
        }
    }

    fn reflected(&self, dir: Vec3, eval: BsdfEval, scale: f32) -> RayData {
        RayData {
            o: offset_ray(self.sp.p, self.sp.plane_n),
            d: dir,
            c: self.ray.c * eval.col * (self.mix_weight * scale / eval.pdf),
            pdf: eval.pdf,
            ..self.child_ray()
        }
    }

    fn mis(&self, ls: &LightSample, bsdf_pdf: f32) -> f32 {
        if ls.mis {
            power_heuristic(ls.pdf, bsdf_pdf)
        } else {
            1.0
        }
    }

    fn local(&self, v: Vec3) -> Vec3 {
        self.frame.to_local(v)
    }

    /// Emission MIS weight for a bounced ray landing on an emissive triangle.
    fn emission_weight(&self, mat: &Material) -> f32 {
        if !self.ray.depth.is_bounced() || !mat.multiple_importance {
            return 1.0;
        }
        let cos = self.ray.d.dot(self.sp.plane_n).abs();
        if cos <= 0.0 || self.sp.tri_area <= 0.0 {
            return 1.0;
        }
        let light_pdf = self.hit.t * self.hit.t / (self.sp.tri_area * cos);
        power_heuristic(self.ray.pdf, light_pdf)
    }
}

/// Shade one ray/hit pair without committing anything.
pub fn shade_ray(
    ps: &PassSettings,
    hit: &HitData,
    ray: &RayData,
    sampler: &PixelSampler<'_>,
    sc: &SceneSnapshot,
) -> ShadeResult {
    let mut res = ShadeResult::default();
    if !hit.mask {
        res.col = ray.c * miss_color(ray, ps, sc);
        return res;
    }
    if let Some(li) = hit.light_index() {
        if let Some(light) = sc.lights.get(li as usize) {
            res.col = ray.c * light_hit_color(ray, hit.t, light, sc);
        }
        return res;
    }
    let Some(mut mat_index) = sc
        .tri_materials
        .get(hit.prim_index as usize)
        .and_then(|tm| tm.material(hit.backfacing))
    else {
        return res;
    };
    let Some(mut sp) = SurfacePoint::new(sc, hit, ray) else {
        return res;
    };

    let off = sampler.offset(ray.xy);
    let dim = rand_dim(ray.depth.total());
    let i = ray.d;
    let ext_ior = ray.ior.peek(hit.backfacing);

    // Resolve the mix tree
    let mut mix_rand = sampler.get(dim + RAND_DIM_BSDF_PICK, off.x);
    let mut mix_weight = 1.0;
    for _ in 0..MAX_MIX_DEPTH {
        let mat = &sc.materials[mat_index as usize];
        let (ShadingNode::Mix, Some([first, second])) = (mat.node, mat.mix_materials) else {
            break;
        };
        let mut mix_val = mix_factor(sc, mat, sp.uv, 0.0);
        if mat.ior != 0.0 {
            let eta = if hit.backfacing { ext_ior / mat.ior } else { mat.ior / ext_ior };
            mix_val *= fresnel_dielectric_cos(i.dot(sp.n), eta).clamp(0.0, 1.0);
        }
        if mix_rand > mix_val {
            if mat.mix_add {
                mix_weight /= 1.0 - mix_val;
            }
            mat_index = first;
            mix_rand = if mix_val < 1.0 { (mix_rand - mix_val) / (1.0 - mix_val) } else { 0.0 };
        } else {
            if mat.mix_add && mix_val > 0.0 {
                mix_weight /= mix_val;
            }
            mat_index = second;
            mix_rand = if mix_val > 0.0 { mix_rand / mix_val } else { 0.0 };
        }
    }
    let mat = &sc.materials[mat_index as usize];

    if mat.normal_map.is_some() {
        let frame = sp.frame();
        let c = sp.tex(sc, mat.normal_map).truncate() * 2.0 - Vec3::ONE;
        let mapped = (frame.t * c.x + frame.b * c.y + frame.n).normalize_or_zero();
        let blended = sp.n.lerp(mapped, mat.normal_map_intensity).normalize_or_zero();
        // Keep the reflected view direction above the geometric surface
        if reflect(i, blended, blended.dot(i)).dot(sp.plane_n) > 0.0 {
            sp.n = blended;
        }
    }
    let frame = sp.frame();

    let ls = match mat.node {
        ShadingNode::Emissive | ShadingNode::Transparent | ShadingNode::Mix => None,
        _ => {
            let (lu, lv) = sampler.get2(dim + RAND_DIM_LIGHT_U, off);
            sample_light_source(sp.p, sp.n, sc, sampler.get(dim + RAND_DIM_LIGHT_PICK, off.x), lu, lv)
        }
    };

    let mut base = mat.base_color * sp.tex(sc, mat.base_texture).truncate();
    if ps.lighting_only {
        base = Vec3::ONE;
    }
    res.base_color = base;
    res.depth_normal = sp.n.extend(hit.t);

    let (bu, bv) = sampler.get2(dim + RAND_DIM_BSDF_U, off);
    let ctx = ShadeCtx {
        ps,
        sc,
        ray,
        hit,
        sp: &sp,
        frame,
        ls,
        base,
        roughness: mat.roughness * sp.tex(sc, mat.roughness_texture).x,
        mix_weight,
        ext_ior,
        bu,
        bv,
    };

    let out = match mat.node {
        ShadingNode::Diffuse => shade_diffuse(&ctx),
        ShadingNode::Glossy => shade_glossy(&ctx),
        ShadingNode::Refractive => shade_refractive(&ctx, mat),
        ShadingNode::Emissive => NodeOut {
            emitted: base * (mat.strength * mix_weight * ctx.emission_weight(mat)),
            ..Default::default()
        },
        ShadingNode::Transparent => shade_transparent(&ctx),
        ShadingNode::Principled => shade_principled(&ctx, mat, mix_rand),
        ShadingNode::Mix => NodeOut::default(),
    };

    res.col = ray.c * out.emitted;

    if let Some(mut new_ray) = out.new_ray {
        let lum = new_ray.c.max_element();
        let can_terminate = ray.depth.bounce_depth() > ps.min_total_depth as u32;
        let q = if can_terminate { (1.0 - lum).max(0.05) } else { 0.0 };
        let p = sampler.get(dim + RAND_DIM_TERMINATE, off.x);
        if p >= q && lum > 0.0 && new_ray.pdf > 0.0 {
            new_ray.pdf = new_ray.pdf.min(DELTA_PDF);
            new_ray.c /= 1.0 - q;
            res.secondary = Some(new_ray);
        }
    }

    if let Some(ls) = ctx.ls {
        let sh_c = ray.c * out.direct;
        if sh_c.max_element() > 0.0 {
            if ls.cast_shadow {
                let side = if ls.l.dot(sp.plane_n) < 0.0 { -sp.plane_n } else { sp.plane_n };
                let o = offset_ray(sp.p, side);
                let (d, dist) = if ls.dist >= MAX_DIST {
                    (ls.l, MAX_DIST)
                } else {
                    let to = ls.lp - o;
                    let dist = to.length();
                    (if dist > FLT_EPS { to / dist } else { ls.l }, dist)
                };
                res.shadow = Some(ShadowRay {
                    o,
                    d,
                    dist,
                    c: sh_c,
                    xy: ray.xy,
                    depth: ray.depth,
                    from_env: ls.from_env,
                });
            } else {
                res.col += sh_c;
            }
        }
    }
    res
}

fn shade_diffuse(ctx: &ShadeCtx<'_>) -> NodeOut {
    let mut out = NodeOut::default();
    let n = ctx.frame.n;
    if let Some(ls) = &ctx.ls {
        if ls.l.dot(n) > 0.0 {
            let f = eval_oren_diffuse(-ctx.ray.d, n, ls.l, ctx.roughness, ctx.base);
            out.direct = ls.col * f.col * (ctx.mix_weight * ctx.mis(ls, f.pdf) / ls.pdf);
        }
    }
    if ctx.can_bounce(ctx.ray.depth.diffuse(), ctx.ps.max_diff_depth) {
        let s = sample_oren_diffuse(&ctx.frame, ctx.ray.d, ctx.roughness, ctx.base, ctx.bu, ctx.bv);
        if s.eval.pdf > 0.0 {
            out.new_ray = Some(RayData {
                depth: ctx.ray.depth.add_diffuse(),
                ..ctx.reflected(s.dir, s.eval, 1.0)
            });
        }
    }
    out
}

/// Ior and normal-incidence reflectance of glossy nodes.
const GLOSSY_SPECULAR: f32 = 0.5;

fn shade_glossy(ctx: &ShadeCtx<'_>) -> NodeOut {
    let mut out = NodeOut::default();
    let spec_ior = specular_ior(GLOSSY_SPECULAR);
    let spec_f0 = fresnel_dielectric_cos(1.0, spec_ior);
    let alpha = ctx.roughness * ctx.roughness;

    if let Some(ls) = &ctx.ls {
        if alpha * alpha >= DELTA_ALPHA2 && ls.l.dot(ctx.frame.n) > 0.0 {
            let h = (ls.l - ctx.ray.d).normalize_or_zero();
            let f = eval_ggx_specular(
                ctx.local(-ctx.ray.d),
                ctx.local(h),
                ctx.local(ls.l),
                alpha,
                alpha,
                spec_ior,
                spec_f0,
                ctx.base,
            );
            out.direct = ls.col * f.col * (ctx.mix_weight * ctx.mis(ls, f.pdf) / ls.pdf);
        }
    }
    if ctx.can_bounce(ctx.ray.depth.specular(), ctx.ps.max_spec_depth) {
        let s = sample_ggx_specular(
            &ctx.frame,
            ctx.ray.d,
            ctx.roughness,
            spec_ior,
            spec_f0,
            ctx.base,
            ctx.bu,
            ctx.bv,
        );
        if s.eval.pdf > 0.0 {
            out.new_ray = Some(RayData {
                depth: ctx.ray.depth.add_specular(),
                ..ctx.reflected(s.dir, s.eval, 1.0)
            });
        }
    }
    out
}

fn shade_refractive(ctx: &ShadeCtx<'_>, mat: &Material) -> NodeOut {
    let mut out = NodeOut::default();
    let backfacing = ctx.hit.backfacing;
    let eta = if backfacing { mat.ior / ctx.ext_ior } else { ctx.ext_ior / mat.ior };
    let alpha = ctx.roughness * ctx.roughness;

    if let Some(ls) = &ctx.ls {
        if alpha * alpha >= DELTA_ALPHA2 && ls.l.dot(ctx.frame.n) < 0.0 {
            let view = ctx.local(-ctx.ray.d);
            let refr = ctx.local(ls.l);
            let h = refraction_half_vector(view, refr, eta);
            let f = eval_ggx_refraction(view, h, refr, alpha, eta, ctx.base);
            out.direct = ls.col * f.col * (ctx.mix_weight * ctx.mis(ls, f.pdf) / ls.pdf);
        }
    }
    if ctx.can_bounce(ctx.ray.depth.refraction(), ctx.ps.max_refr_depth) {
        if let Some(s) = sample_ggx_refraction(&ctx.frame, ctx.ray.d, ctx.roughness, eta, ctx.base, ctx.bu, ctx.bv) {
            if s.eval.pdf > 0.0 {
                out.new_ray = Some(refracted_ray(ctx, s.dir, s.eval, 1.0, mat.ior));
            }
        }
    }
    out
}

fn refracted_ray(ctx: &ShadeCtx<'_>, dir: Vec3, eval: BsdfEval, scale: f32, int_ior: f32) -> RayData {
    let mut ior = ctx.ray.ior;
    if ctx.hit.backfacing {
        ior.pop();
    } else {
        ior.push(int_ior);
    }
    RayData {
        o: offset_ray(ctx.sp.p, -ctx.sp.plane_n),
        d: dir,
        c: ctx.ray.c * eval.col * (ctx.mix_weight * scale / eval.pdf),
        pdf: eval.pdf,
        ior,
        depth: ctx.ray.depth.add_refraction(),
        ..ctx.child_ray()
    }
}

/// Transparent leaves normally get stepped over during traversal; one that
/// is reached here (through a fresnel-weighted mix) continues straight on.
fn shade_transparent(ctx: &ShadeCtx<'_>) -> NodeOut {
    let mut out = NodeOut::default();
    if ctx.ray.depth.transparency() < ctx.ps.max_transp_depth {
        out.new_ray = Some(RayData {
            o: offset_ray(ctx.sp.p, -ctx.sp.plane_n),
            c: ctx.ray.c * ctx.base * ctx.mix_weight,
            depth: ctx.ray.depth.add_transparency(),
            ..ctx.child_ray()
        });
    }
    out
}

/// Relative weights of the principled lobes, normalized to sum to one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LobeWeights {
    pub diffuse: f32,
    pub specular: f32,
    pub clearcoat: f32,
    pub refraction: f32,
}

impl LobeWeights {
    pub fn new(base_lum: f32, spec_lum: f32, specular: f32, metallic: f32, transmission: f32, clearcoat: f32) -> Self {
        let final_transmission = transmission * (1.0 - metallic);
        let mut w = Self {
            diffuse: base_lum * (1.0 - metallic) * (1.0 - transmission),
            specular: if specular != 0.0 || metallic != 0.0 {
                spec_lum * (1.0 - final_transmission)
            } else {
                0.0
            },
            clearcoat: 0.25 * clearcoat * (1.0 - metallic),
            refraction: final_transmission * base_lum,
        };
        let total = w.diffuse + w.specular + w.clearcoat + w.refraction;
        if total > 0.0 {
            w.diffuse /= total;
            w.specular /= total;
            w.clearcoat /= total;
            w.refraction /= total;
        }
        w
    }
}

fn shade_principled(ctx: &ShadeCtx<'_>, mat: &Material, mix_rand: f32) -> NodeOut {
    let mut out = NodeOut::default();
    let sc = ctx.sc;
    let sp = ctx.sp;
    let i = ctx.ray.d;
    let n = ctx.frame.n;
    let base = ctx.base;
    let roughness = ctx.roughness;

    if mat.strength > 0.0 && mat.emission_color != Vec3::ZERO {
        let emission = mat.emission_color * sp.tex(sc, mat.emission_texture).truncate();
        out.emitted = emission * (mat.strength * ctx.mix_weight * ctx.emission_weight(mat));
    }

    let metallic = mat.metallic * sp.tex(sc, mat.metallic_texture).x;
    let specular = mat.specular * sp.tex(sc, mat.specular_texture).x;
    let base_lum = luminance(base);
    let tint = if base_lum > 0.0 { base / base_lum } else { Vec3::ZERO };

    let sheen_col = Vec3::ONE.lerp(tint, mat.sheen_tint) * mat.sheen;
    let spec_col = (Vec3::ONE.lerp(tint, mat.specular_tint) * (specular * 0.08)).lerp(base, metallic);
    let spec_ior = specular_ior(specular);
    let spec_f0 = fresnel_dielectric_cos(1.0, spec_ior);
    let coat_ior = specular_ior(mat.clearcoat);
    let coat_f0 = fresnel_dielectric_cos(1.0, coat_ior);
    let trans_roughness = 1.0 - (1.0 - roughness) * (1.0 - mat.transmission_roughness);
    let trans_eta = if ctx.hit.backfacing {
        mat.ior / ctx.ext_ior
    } else {
        ctx.ext_ior / mat.ior
    };
    let trans_fresnel = fresnel_dielectric_cos(i.dot(n), 1.0 / trans_eta);

    let fn_approx = if spec_f0 < 1.0 {
        (fresnel_dielectric_cos(i.dot(n), spec_ior) - spec_f0) / (1.0 - spec_f0)
    } else {
        1.0
    };
    let spec_lum = luminance(spec_col.lerp(Vec3::ONE, fn_approx));
    let lobes = LobeWeights::new(
        base_lum + (1.0 - base_lum) * mat.sheen,
        spec_lum,
        specular,
        metallic,
        mat.transmission,
        mat.clearcoat,
    );

    let alpha = roughness * roughness;
    let coat_alpha = mat.clearcoat_roughness * mat.clearcoat_roughness;
    let trans_alpha = trans_roughness * trans_roughness;

    if let Some(ls) = &ctx.ls {
        let n_dot_l = n.dot(ls.l);
        let view = ctx.local(-i);
        let light = ctx.local(ls.l);
        let h = ctx.local((ls.l - i).normalize_or_zero());
        let mut lcol = Vec3::ZERO;
        let mut bsdf_pdf = 0.0;

        if lobes.diffuse > 0.0 && n_dot_l > 0.0 {
            let f = eval_principled_diffuse(-i, n, ls.l, roughness, base, sheen_col, false);
            bsdf_pdf += lobes.diffuse * f.pdf;
            lcol += ls.col * f.col * ((1.0 - metallic) * n_dot_l / (std::f32::consts::PI * ls.pdf));
        }
        if lobes.specular > 0.0 && alpha * alpha >= DELTA_ALPHA2 && n_dot_l > 0.0 {
            let f = eval_ggx_specular(view, h, light, alpha, alpha, spec_ior, spec_f0, spec_col);
            bsdf_pdf += lobes.specular * f.pdf;
            lcol += ls.col * f.col / ls.pdf;
        }
        if lobes.clearcoat > 0.0 && coat_alpha * coat_alpha >= DELTA_ALPHA2 && n_dot_l > 0.0 {
            let f = eval_clearcoat(view, h, light, coat_alpha, coat_ior, coat_f0);
            bsdf_pdf += lobes.clearcoat * f.pdf;
            lcol += ls.col * f.col * (0.25 / ls.pdf);
        }
        if lobes.refraction > 0.0 {
            if trans_fresnel != 0.0 && alpha * alpha >= DELTA_ALPHA2 && n_dot_l > 0.0 {
                let f = eval_ggx_specular(view, h, light, alpha, alpha, 1.0, 0.0, Vec3::ONE);
                bsdf_pdf += lobes.refraction * trans_fresnel * f.pdf;
                lcol += ls.col * f.col * (trans_fresnel / ls.pdf);
            }
            if trans_fresnel != 1.0 && trans_alpha * trans_alpha >= DELTA_ALPHA2 && n_dot_l < 0.0 {
                let h = refraction_half_vector(view, light, trans_eta);
                let f = eval_ggx_refraction(view, h, light, trans_alpha, trans_eta, base);
                bsdf_pdf += lobes.refraction * (1.0 - trans_fresnel) * f.pdf;
                lcol += ls.col * f.col * ((1.0 - trans_fresnel) / ls.pdf);
            }
        }
        out.direct = lcol * (ctx.mix_weight * ctx.mis(ls, bsdf_pdf));
    }

    let depth = ctx.ray.depth;
    let (bu, bv) = (ctx.bu, ctx.bv);
    if mix_rand < lobes.diffuse {
        if ctx.can_bounce(depth.diffuse(), ctx.ps.max_diff_depth) {
            let s = sample_principled_diffuse(&ctx.frame, i, roughness, base, sheen_col, false, bu, bv);
            if s.eval.pdf > 0.0 {
                let weight = s.eval.col * ((1.0 - metallic) / lobes.diffuse);
                out.new_ray = Some(RayData {
                    o: offset_ray(sp.p, sp.plane_n),
                    d: s.dir,
                    c: ctx.ray.c * weight * ctx.mix_weight,
                    pdf: s.eval.pdf,
                    depth: depth.add_diffuse(),
                    ..ctx.child_ray()
                });
            }
        }
    } else if mix_rand < lobes.diffuse + lobes.specular {
        if ctx.can_bounce(depth.specular(), ctx.ps.max_spec_depth) {
            let s = sample_ggx_specular(&ctx.frame, i, roughness, spec_ior, spec_f0, spec_col, bu, bv);
            out.new_ray = lobe_ray(ctx, s.dir, s.eval, lobes.specular, 1.0).map(|r| RayData {
                depth: depth.add_specular(),
                ..r
            });
        }
    } else if mix_rand < lobes.diffuse + lobes.specular + lobes.clearcoat {
        if ctx.can_bounce(depth.specular(), ctx.ps.max_spec_depth) {
            let s = sample_clearcoat(&ctx.frame, i, coat_alpha, coat_ior, coat_f0, bu, bv);
            out.new_ray = lobe_ray(ctx, s.dir, s.eval, lobes.clearcoat, 0.25).map(|r| RayData {
                depth: depth.add_specular(),
                ..r
            });
        }
    } else if lobes.refraction > 0.0 {
        let local_rand = (mix_rand - lobes.diffuse - lobes.specular - lobes.clearcoat) / lobes.refraction;
        if local_rand < trans_fresnel {
            if ctx.can_bounce(depth.specular(), ctx.ps.max_spec_depth) {
                let s = sample_ggx_specular(&ctx.frame, i, roughness, 1.0, 0.0, Vec3::ONE, bu, bv);
                out.new_ray = lobe_ray(ctx, s.dir, s.eval, lobes.refraction, 1.0).map(|r| RayData {
                    depth: depth.add_specular(),
                    ..r
                });
            }
        } else if ctx.can_bounce(depth.refraction(), ctx.ps.max_refr_depth) {
            if let Some(s) = sample_ggx_refraction(&ctx.frame, i, trans_roughness, trans_eta, base, bu, bv) {
                if s.eval.pdf > 0.0 {
                    let mut eval = s.eval;
                    eval.pdf *= lobes.refraction;
                    out.new_ray = Some(refracted_ray(ctx, s.dir, eval, 1.0, mat.ior));
                }
            }
        }
    }
    out
}

/// Reflected ray for a lobe picked with probability `lobe_pdf`.
fn lobe_ray(ctx: &ShadeCtx<'_>, dir: Vec3, mut eval: BsdfEval, lobe_pdf: f32, scale: f32) -> Option<RayData> {
    eval.pdf *= lobe_pdf;
    (eval.pdf > 0.0).then(|| ctx.reflected(dir, eval, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::{PixelCoord, RayDepth};
    use crate::sequence::HALTON_COUNT;
    use ray_core::{LightDesc, MeshDesc, PrincipledDesc, RectLightDesc, Scene, ShadingNodeDesc};
    use ray_math::Mat4;

    fn floor_scene(mat: impl Into<ray_core::MaterialDesc>) -> Scene {
        let mut scene = Scene::new();
        let m = scene.add_material(mat).unwrap();
        let positions = vec![
            Vec3::new(-1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(-1.0, 0.0, 1.0),
        ];
        let mesh = scene
            .add_mesh(&MeshDesc::new("floor", positions, vec![0, 2, 1, 0, 3, 2], m, None))
            .unwrap();
        scene.add_mesh_instance(mesh, Mat4::IDENTITY).unwrap();
        scene.add_light(&LightDesc::Rect(RectLightDesc {
            transform: Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)),
            visible: false,
            ..Default::default()
        }));
        scene.finalize();
        scene
    }

    fn down_ray() -> (RayData, HitData) {
        let ray = RayData {
            o: Vec3::new(0.05, 2.0, 0.05),
            d: Vec3::new(0.0, -1.0, 0.0),
            xy: PixelCoord::new(1, 1),
            ..Default::default()
        };
        let hit = HitData {
            mask: true,
            obj_index: 0,
            prim_index: 0,
            backfacing: false,
            t: 2.0,
            u: 0.3,
            v: 0.3,
            xy: ray.xy,
        };
        (ray, hit)
    }

    #[test]
    fn test_diffuse_schedules_shadow_and_bounce() {
        let scene = floor_scene(ShadingNodeDesc::diffuse(Vec3::splat(0.8)));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (ray, hit) = down_ray();

        let res = shade_ray(&PassSettings::default(), &hit, &ray, &sampler, sc);
        assert_eq!(res.col, Vec3::ZERO);
        let shadow = res.shadow.expect("light above the floor");
        assert!(shadow.d.y > 0.0);
        assert!(shadow.dist > 0.5 && shadow.dist < 2.0);
        assert!(shadow.c.max_element() > 0.0);

        let bounce = res.secondary.expect("diffuse bounce");
        assert_eq!(bounce.depth, RayDepth::PRIMARY.add_diffuse());
        assert!(bounce.d.y > 0.0);
        assert!((res.base_color - Vec3::splat(0.8)).length() < 1e-6);
        assert!((res.depth_normal.truncate() - Vec3::Y).length() < 1e-5);
        assert!((res.depth_normal.w - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_emissive_surface_returns_emission() {
        let scene = floor_scene(ShadingNodeDesc::emissive(Vec3::new(1.0, 0.5, 0.25), 2.0));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (ray, hit) = down_ray();

        let res = shade_ray(&PassSettings::default(), &hit, &ray, &sampler, sc);
        assert!((res.col - Vec3::new(2.0, 1.0, 0.5)).length() < 1e-5);
        assert!(res.secondary.is_none());
        assert!(res.shadow.is_none());
    }

    #[test]
    fn test_depth_limit_stops_bounces() {
        let scene = floor_scene(ShadingNodeDesc::diffuse(Vec3::ONE));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (ray, hit) = down_ray();
        let ps = PassSettings {
            max_diff_depth: 0,
            ..Default::default()
        };
        let res = shade_ray(&ps, &hit, &ray, &sampler, sc);
        assert!(res.secondary.is_none());
    }

    #[test]
    fn test_transparency_hops_keep_bounce_budget() {
        let scene = floor_scene(ShadingNodeDesc::diffuse(Vec3::splat(0.8)));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (mut ray, hit) = down_ray();
        ray.depth = RayDepth::PRIMARY.add_transparency();
        let ps = PassSettings {
            max_total_depth: 1,
            ..Default::default()
        };

        let res = shade_ray(&ps, &hit, &ray, &sampler, sc);
        let bounce = res.secondary.expect("diffuse bounce after a transparent hop");
        assert_eq!(bounce.depth, ray.depth.add_diffuse());

        ray.depth = RayDepth::PRIMARY.add_diffuse();
        assert!(shade_ray(&ps, &hit, &ray, &sampler, sc).secondary.is_none());
    }

    #[test]
    fn test_russian_roulette_waits_for_min_depth() {
        let scene = floor_scene(ShadingNodeDesc::diffuse(Vec3::splat(1e-4)));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (mut ray, hit) = down_ray();
        let ps = PassSettings {
            max_diff_depth: 8,
            max_total_depth: 8,
            min_total_depth: 2,
            ..Default::default()
        };

        ray.depth = RayDepth::PRIMARY.add_diffuse().add_diffuse();
        let bounce = shade_ray(&ps, &hit, &ray, &sampler, sc)
            .secondary
            .expect("no termination at the minimum depth");
        // Forced continuation leaves the throughput unscaled
        assert!(bounce.c.max_element() < 1e-3);

        ray.depth = ray.depth.add_diffuse();
        assert!(shade_ray(&ps, &hit, &ray, &sampler, sc).secondary.is_none());
    }

    fn shade_emissive_pixel(ps: &PassSettings, primary: bool) -> Vec4 {
        let scene = floor_scene(ShadingNodeDesc::emissive(Vec3::ONE, 5.0));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (ray, hit) = down_ray();
        let rect = Rect::new(0, 0, 4, 4);
        let mut temp = vec![Vec4::ZERO; rect.area()];
        let (mut secondary, mut shadow) = (Vec::new(), Vec::new());
        if primary {
            let targets = PrimaryTargets {
                temp: &mut temp,
                base_color: None,
                depth_normals: None,
            };
            shade_primary(ps, &[ray], &[hit], &sampler, sc, &rect, targets, &mut secondary, &mut shadow);
        } else {
            shade_secondary(ps, &[ray], &[hit], &sampler, sc, &rect, &mut temp, &mut secondary, &mut shadow);
        }
        temp[rect.local_index(1, 1)]
    }

    #[test]
    fn test_primary_clamps_direct_light() {
        let open = shade_emissive_pixel(&PassSettings::default(), true);
        assert!((open - Vec4::new(5.0, 5.0, 5.0, 1.0)).length() < 1e-4);

        let ps = PassSettings {
            clamp_direct: 1.0,
            clamp_indirect: 3.0,
            ..Default::default()
        };
        let clamped = shade_emissive_pixel(&ps, true);
        assert!((clamped - Vec4::ONE).length() < 1e-5);
    }

    #[test]
    fn test_secondary_clamps_indirect_light() {
        let ps = PassSettings {
            clamp_direct: 1.0,
            clamp_indirect: 2.0,
            ..Default::default()
        };
        let clamped = shade_emissive_pixel(&ps, false);
        assert!((clamped - Vec4::new(2.0, 2.0, 2.0, 0.0)).length() < 1e-5);
        let open = shade_emissive_pixel(&PassSettings::default(), false);
        assert!((open.truncate() - Vec3::splat(5.0)).length() < 1e-4);
    }

    #[test]
    fn test_mirror_metal_reflects_exactly() {
        let scene = floor_scene(PrincipledDesc::metal(Vec3::ONE, 0.0));
        let sc = scene.snapshot().unwrap();
        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let (ray, hit) = down_ray();

        let res = shade_ray(&PassSettings::default(), &hit, &ray, &sampler, sc);
        let r = res.secondary.expect("mirror bounce");
        assert!((r.d - Vec3::Y).length() < 1e-5);
        assert!((r.c - Vec3::ONE).length() < 1e-4);
        assert_eq!(r.depth, RayDepth::PRIMARY.add_specular());
        // No diffuse part and a delta lobe: nothing for the light sample
        assert!(res.shadow.is_none());
    }

    #[test]
    fn test_lobe_weights_normalize() {
        let w = LobeWeights::new(0.5, 0.04, 0.5, 0.0, 0.0, 1.0);
        let sum = w.diffuse + w.specular + w.clearcoat + w.refraction;
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(w.refraction, 0.0);

        let metal = LobeWeights::new(0.5, 0.9, 0.5, 1.0, 0.0, 0.0);
        assert_eq!(metal.diffuse, 0.0);
        assert!((metal.specular - 1.0).abs() < 1e-6);
    }
}
