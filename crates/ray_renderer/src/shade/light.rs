//! Light sampling for next-event estimation and radiance of directly hit lights.
//!
//! Pdfs are in solid angle and do not include the light pick probability;
//! the sampled color is scaled by the light count instead.

use std::f32::consts::PI;

use ray_core::{Light, LightKind, SceneSnapshot, ShadingNode};
use ray_math::{Vec3, FLT_EPS, MAX_DIST};

use crate::ray::RayData;
use crate::sampling::{concentric_disk, map_to_cone, power_heuristic, sample_uniform_hemisphere};

use super::env::{env_radiance, UNIFORM_ENV_PDF};
use super::surface::{sample_texture, surface_uv};

/// One light sample as seen from a shading point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightSample {
    pub col: Vec3,
    /// Unit direction from the shading point to the sample.
    pub l: Vec3,
    /// Sampled point, far along `l` for lights at infinity.
    pub lp: Vec3,
    pub pdf: f32,
    /// Distance to `lp`, [`MAX_DIST`] for lights at infinity.
    pub dist: f32,
    pub cast_shadow: bool,
    pub from_env: bool,
    /// Weight against BSDF sampling with the power heuristic.
    pub mis: bool,
}

impl LightSample {
    fn towards(p: Vec3, lp: Vec3, col: Vec3, light: &Light) -> Option<(Self, f32)> {
        let to = lp - p;
        let dist = to.length();
        if dist <= FLT_EPS {
            return None;
        }
        Some((
            Self {
                col,
                l: to / dist,
                lp,
                pdf: 0.0,
                dist,
                cast_shadow: light.cast_shadow,
                from_env: false,
                mis: light.visible,
            },
            dist,
        ))
    }

    fn infinite(p: Vec3, l: Vec3, col: Vec3, pdf: f32, light: &Light) -> Self {
        Self {
            col,
            l,
            lp: p + l * MAX_DIST,
            pdf,
            dist: MAX_DIST,
            cast_shadow: light.cast_shadow,
            from_env: false,
            mis: light.visible,
        }
    }
}

/// Attenuation of a spot cone for light leaving along `emit_dir`.
#[inline]
fn spot_factor(emit_dir: Vec3, dir: Vec3, spot: f32, blend: f32) -> f32 {
    if spot >= PI {
        return 1.0;
    }
    let angle = emit_dir.dot(dir).clamp(-1.0, 1.0).acos();
    if angle > spot {
        return 0.0;
    }
    if blend > 0.0 {
        ((spot - angle) / blend).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Pick one light uniformly and sample a point on it.
///
/// `n` orients environment samples when no quad-tree is available.
pub fn sample_light_source(
    p: Vec3,
    n: Vec3,
    sc: &SceneSnapshot,
    pick: f32,
    r1: f32,
    r2: f32,
) -> Option<LightSample> {
    let count = sc.li_indices.len();
    if count == 0 {
        return None;
    }
    let idx = ((pick * count as f32) as usize).min(count - 1);
    let light = sc.lights.get(sc.li_indices[idx] as usize)?;
    let mut ls = sample_light(p, n, light, sc, r1, r2)?;
    if !(ls.pdf > 0.0) || ls.col.max_element() <= 0.0 {
        return None;
    }
    ls.col *= count as f32;
    Some(ls)
}

fn sample_light(p: Vec3, n: Vec3, light: &Light, sc: &SceneSnapshot, r1: f32, r2: f32) -> Option<LightSample> {
    match light.kind {
        LightKind::Sphere {
            pos,
            radius,
            area,
            dir,
            spot,
            blend,
        } => {
            if radius > 0.0 {
                let away = (p - pos).normalize_or_zero();
                let surf_n = sample_uniform_hemisphere(r1, r2, away);
                let (mut ls, dist) = LightSample::towards(p, pos + surf_n * radius, light.color, light)?;
                let cos = -ls.l.dot(surf_n);
                if cos <= 0.0 {
                    return None;
                }
                ls.pdf = dist * dist / (0.5 * area * cos);
                ls.col *= spot_factor(-ls.l, dir, spot, blend);
                Some(ls)
            } else {
                let (mut ls, dist) = LightSample::towards(p, pos, light.color, light)?;
                ls.pdf = dist * dist;
                ls.mis = false;
                ls.col *= spot_factor(-ls.l, dir, spot, blend);
                Some(ls)
            }
        }
        LightKind::Directional { dir, angle } => {
            if angle > 0.0 {
                let radius = angle.tan();
                let l = map_to_cone(r1, r2, dir, radius).normalize();
                let cos = l.dot(dir);
                let disk = PI * radius * radius;
                Some(LightSample::infinite(
                    p,
                    l,
                    light.color / disk,
                    1.0 / (disk * cos * cos * cos),
                    light,
                ))
            } else {
                let mut ls = LightSample::infinite(p, dir, light.color, 1.0, light);
                ls.mis = false;
                Some(ls)
            }
        }
        LightKind::Rect { pos, u, v, area } => {
            let lp = pos + u * (r1 - 0.5) + v * (r2 - 0.5);
            planar_sample(p, lp, u, v, area, light, sc)
        }
        LightKind::Disk { pos, u, v, area } => {
            let d = concentric_disk(r1, r2) * 0.5;
            let lp = pos + u * d.x + v * d.y;
            planar_sample(p, lp, u, v, area, light, sc)
        }
        LightKind::Line {
            pos,
            axis,
            radius,
            height,
            area,
        } => {
            let to_p = p - pos;
            let side = (to_p - axis * to_p.dot(axis)).try_normalize()?;
            let other = axis.cross(side);
            let phi = (r2 - 0.5) * PI;
            let normal = side * phi.cos() + other * phi.sin();
            let lp = pos + axis * ((r1 - 0.5) * height) + normal * radius;
            let (mut ls, dist) = LightSample::towards(p, lp, light.color, light)?;
            let cos = -ls.l.dot(normal);
            if cos <= 0.0 {
                return None;
            }
            ls.pdf = dist * dist / (0.5 * area * cos);
            Some(ls)
        }
        LightKind::Triangle { tri_index, xform_index } => {
            let mi = sc.mesh_instances.get(xform_index as usize)?;
            let xform = sc.transforms.get(mi.tr_index as usize)?.xform;
            let [v1, v2, v3] = sc.triangle_vertices(tri_index);
            let (p1, p2, p3) = (
                xform.transform_point3(v1.p),
                xform.transform_point3(v2.p),
                xform.transform_point3(v3.p),
            );
            let su = r1.sqrt();
            let (bu, bv) = (su * (1.0 - r2), su * r2);
            let lp = p1 * (1.0 - bu - bv) + p2 * bu + p3 * bv;

            let cross = (p2 - p1).cross(p3 - p1);
            let tri_area = 0.5 * cross.length();
            let light_n = cross.try_normalize()?;

            let mut col = light.color;
            if let Some(mat) = sc.tri_materials[tri_index as usize]
                .material(false)
                .and_then(|m| sc.materials.get(m as usize))
            {
                let tex = if mat.node == ShadingNode::Emissive {
                    mat.base_texture
                } else {
                    mat.emission_texture
                };
                if tex.is_some() {
                    let uv = surface_uv(sc, tri_index, bu, bv);
                    col *= sample_texture(sc, tex, uv, 0.0).truncate();
                }
            }

            let (mut ls, dist) = LightSample::towards(p, lp, col, light)?;
            let cos = -ls.l.dot(light_n);
            if cos <= 0.0 {
                return None;
            }
            ls.pdf = dist * dist / (tri_area * cos);
            ls.mis = true;
            Some(ls)
        }
        LightKind::Env => {
            let (l, pdf) = match &sc.env.qtree {
                Some(qtree) => qtree.sample(r1, r2),
                None => (sample_uniform_hemisphere(r1, r2, n), UNIFORM_ENV_PDF),
            };
            let mut ls = LightSample::infinite(p, l, env_radiance(sc, l), pdf, light);
            ls.from_env = true;
            ls.mis = true;
            Some(ls)
        }
    }
}

fn planar_sample(p: Vec3, lp: Vec3, u: Vec3, v: Vec3, area: f32, light: &Light, sc: &SceneSnapshot) -> Option<LightSample> {
    let (mut ls, dist) = LightSample::towards(p, lp, light.color, light)?;
    let cos = -ls.l.dot(Light::planar_normal(u, v));
    if cos <= 0.0 {
        return None;
    }
    ls.pdf = dist * dist / (area * cos);
    if light.sky_portal {
        ls.col *= env_radiance(sc, ls.l);
        ls.from_env = true;
    }
    Some(ls)
}

/// Radiance carried back by a bounced ray that hit `light` at distance `t`,
/// weighted against light sampling.
pub fn light_hit_color(ray: &RayData, t: f32, light: &Light, sc: &SceneSnapshot) -> Vec3 {
    let i = ray.d;
    let (col, pdf) = match light.kind {
        LightKind::Sphere {
            pos,
            area,
            dir,
            spot,
            blend,
            ..
        } => {
            let normal = (ray.o + i * t - pos).normalize_or_zero();
            let cos = (-i.dot(normal)).max(FLT_EPS);
            (
                light.color * spot_factor(-i, dir, spot, blend),
                t * t / (0.5 * area * cos),
            )
        }
        LightKind::Directional { dir, angle } => {
            let radius = angle.tan();
            let disk = PI * radius * radius;
            let cos = i.dot(dir).max(FLT_EPS);
            (light.color / disk, 1.0 / (disk * cos * cos * cos))
        }
        LightKind::Rect { u, v, area, .. } | LightKind::Disk { u, v, area, .. } => {
            let cos = (-i.dot(Light::planar_normal(u, v))).max(FLT_EPS);
            let mut col = light.color;
            if light.sky_portal {
                col *= env_radiance(sc, i);
            }
            (col, t * t / (area * cos))
        }
        LightKind::Line { pos, axis, area, .. } => {
            let x = ray.o + i * t - pos;
            let normal = (x - axis * x.dot(axis)).normalize_or_zero();
            let cos = (-i.dot(normal)).max(FLT_EPS);
            (light.color, t * t / (0.5 * area * cos))
        }
        LightKind::Triangle { .. } | LightKind::Env => return Vec3::ZERO,
    };
    col * power_heuristic(ray.pdf, pdf)
}
