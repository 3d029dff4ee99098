//! Scene traversal: closest-hit, any-hit and the batch passes built on them.
//!
//! [`Traversal`] is the seam between the render loop and the acceleration
//! structure. [`SoftwareTraversal`] walks the binary or 8-wide BVH stored in
//! the snapshot; a hardware ray-query path would implement the same trait.

pub mod triangle;
pub mod walk;

use ray_core::{LightKind, SceneSnapshot, ShadingNode};
use ray_math::{Vec3, Vec4, MAX_DIST};
use rayon::prelude::*;

use crate::ray::{HitData, PixelCoord, RayData, ShadowRay};
use crate::region::Rect;
use crate::sampling::{offset_ray, PixelSampler};
use crate::sequence::{rand_dim, RAND_DIM_BSDF_PICK, RAND_DIM_TERMINATE};
use crate::settings::{Capabilities, PassSettings, RendererSettings};
use crate::shade::surface::{geometric_normal, pick_material, surface_uv, transparent_share};

use walk::walk_scene;

/// Shadow rays stop this fraction short of their target.
pub const SHADOW_DIST_EPS: f32 = 1e-4;
/// Minimum distance for a sky portal to block a shadow ray.
pub const PORTAL_HIT_EPS: f32 = 1e-4;

/// Ray queries against a scene snapshot.
pub trait Traversal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Nearest triangle hit in `(0, t_max]`.
    ///
    /// Hits at an identical distance resolve to the lowest primitive index.
    fn closest_hit(&self, sc: &SceneSnapshot, o: Vec3, d: Vec3, t_max: f32) -> Option<HitData>;

    /// Any hit in `(0, t_max]`.
    ///
    /// Returns `(hit, true)` as soon as a solid triangle is found, otherwise
    /// the nearest non-solid hit with `false`.
    fn any_hit(&self, sc: &SceneSnapshot, o: Vec3, d: Vec3, t_max: f32) -> Option<(HitData, bool)>;
}

/// BVH walk on the CPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareTraversal {
    pub wide: bool,
}

impl SoftwareTraversal {
    pub fn new(wide: bool) -> Self {
        Self { wide }
    }
}

fn make_hit(obj: u32, prim: u32, h: &triangle::TriHit) -> HitData {
    HitData {
        mask: true,
        obj_index: obj as i32,
        prim_index: prim,
        backfacing: h.backfacing,
        t: h.t,
        u: h.u,
        v: h.v,
        xy: PixelCoord::default(),
    }
}

impl Traversal for SoftwareTraversal {
    fn name(&self) -> &'static str {
        if self.wide {
            "software (8-wide BVH)"
        } else {
            "software (binary BVH)"
        }
    }

    fn closest_hit(&self, sc: &SceneSnapshot, o: Vec3, d: Vec3, t_max: f32) -> Option<HitData> {
        let mut best: Option<HitData> = None;
        let mut limit = t_max;
        walk_scene(sc, self.wide, o, d, &mut limit, |obj, prim, h, t_max| {
            let closer = match &best {
                None => true,
                Some(b) => h.t < b.t || (h.t == b.t && prim < b.prim_index),
            };
            if closer {
                best = Some(make_hit(obj, prim, &h));
                *t_max = h.t;
            }
            false
        });
        best
    }

    fn any_hit(&self, sc: &SceneSnapshot, o: Vec3, d: Vec3, t_max: f32) -> Option<(HitData, bool)> {
        let mut solid: Option<HitData> = None;
        let mut nearest: Option<HitData> = None;
        let mut limit = t_max;
        walk_scene(sc, self.wide, o, d, &mut limit, |obj, prim, h, _| {
            let hit = make_hit(obj, prim, &h);
            if sc.tri_materials[prim as usize].is_solid(h.backfacing) {
                solid = Some(hit);
                return true;
            }
            if nearest.map_or(true, |n| hit.is_closer_than(n.t, n.prim_index)) {
                nearest = Some(hit);
            }
            false
        });
        solid.map(|h| (h, true)).or(nearest.map(|h| (h, false)))
    }
}

/// Pick the traversal for a renderer.
///
/// The hardware ray-query path is never present on the CPU device, so a
/// request for it falls back to the software walk.
pub fn select_traversal(settings: &RendererSettings, caps: &Capabilities) -> Box<dyn Traversal> {
    if settings.use_hwrt && !caps.hardware_ray_query {
        log::info!("Hardware ray query unavailable on {}, using BVH traversal", caps.device_name);
    }
    let wide = settings.use_wide_bvh && caps.wide_bvh;
    Box::new(SoftwareTraversal::new(wide))
}

/// Closest hit for every ray, stepping through transparent surfaces.
///
/// A ray that ends inside the transparency loop (depth limit or Russian
/// roulette) comes back as a miss with zero throughput. `hits[i]` belongs to
/// `rays[i]`; travelled distance is folded into `hit.t` so that
/// `ray.o + ray.d * hit.t` is the shading point.
pub fn intersect_scene(
    rays: &mut [RayData],
    ps: &PassSettings,
    sampler: &PixelSampler<'_>,
    sc: &SceneSnapshot,
    traversal: &dyn Traversal,
    hits: &mut Vec<HitData>,
) {
    hits.clear();
    hits.resize(rays.len(), HitData::miss(MAX_DIST, PixelCoord::default()));
    rays.par_iter_mut()
        .zip(hits.par_iter_mut())
        .for_each(|(ray, hit)| {
            *hit = intersect_ray(ray, ps, sampler, sc, traversal);
        });
}

fn intersect_ray(
    ray: &mut RayData,
    ps: &PassSettings,
    sampler: &PixelSampler<'_>,
    sc: &SceneSnapshot,
    traversal: &dyn Traversal,
) -> HitData {
    let off = sampler.offset(ray.xy);
    let d = ray.d;
    let mut o = ray.o;
    let mut travelled = 0.0;

    loop {
        let Some(mut hit) = traversal.closest_hit(sc, o, d, MAX_DIST) else {
            return HitData::miss(MAX_DIST, ray.xy);
        };
        hit.xy = ray.xy;
        hit.t += travelled;

        let tm = sc.tri_materials[hit.prim_index as usize];
        if tm.is_solid(hit.backfacing) {
            return hit;
        }
        let Some(mat_index) = tm.material(hit.backfacing) else {
            return hit;
        };

        let dim = rand_dim(ray.depth.total());
        let uv = surface_uv(sc, hit.prim_index, hit.u, hit.v);
        let mat = pick_material(sc, mat_index, sampler.get(dim + RAND_DIM_BSDF_PICK, off.x), uv);
        let mat = &sc.materials[mat as usize];
        if mat.node != ShadingNode::Transparent {
            return hit;
        }

        if ray.depth.transparency() >= ps.max_transp_depth {
            ray.c = Vec3::ZERO;
            return HitData::miss(MAX_DIST, ray.xy);
        }
        ray.c *= mat.base_color;
        if ray.depth.transparency() >= ps.min_transp_depth {
            let q = (1.0 - ray.c.max_element()).max(0.05);
            if sampler.get(dim + RAND_DIM_TERMINATE, off.y) < q {
                ray.c = Vec3::ZERO;
                return HitData::miss(MAX_DIST, ray.xy);
            }
            ray.c /= 1.0 - q;
        }
        ray.depth = ray.depth.add_transparency();

        let local_t = hit.t - travelled;
        let p = o + d * local_t;
        let n = geometric_normal(sc, &hit);
        o = offset_ray(p, if n.dot(d) > 0.0 { n } else { -n });
        travelled = hit.t + (o - p).dot(d);
    }
}

/// Test bounced rays against the visible analytic lights.
///
/// A light hit replaces the triangle hit when it is closer, or when the
/// light does not cast shadows. Sky portals are only considered for rays
/// that left the scene.
pub fn intersect_area_lights(rays: &[RayData], sc: &SceneSnapshot, hits: &mut [HitData]) {
    if sc.visible_lights.is_empty() {
        return;
    }
    rays.par_iter().zip(hits.par_iter_mut()).for_each(|(ray, hit)| {
        let scene_hit = hit.mask;
        for &li in &sc.visible_lights {
            let light = &sc.lights[li as usize];
            if light.sky_portal && scene_hit {
                continue;
            }
            let limit = if light.cast_shadow || !hit.mask { hit.t } else { MAX_DIST };
            if let Some(t) = intersect_light_shape(&light.kind, ray.o, ray.d, scene_hit, limit) {
                hit.set_light(li, t);
            }
        }
    });
}

/// Distance to an analytic light surface, or `None`.
///
/// Directional lights are seen by misses only and report `MAX_DIST`.
pub(crate) fn intersect_light_shape(kind: &LightKind, o: Vec3, d: Vec3, scene_hit: bool, limit: f32) -> Option<f32> {
    let t = match *kind {
        LightKind::Sphere { pos, radius, .. } => {
            let oc = pos - o;
            let b = oc.dot(d);
            let det = b * b - oc.length_squared() + radius * radius;
            if det < 0.0 {
                return None;
            }
            let det = det.sqrt();
            let (t1, t2) = (b - det, b + det);
            if t1 > ray_math::FLT_EPS {
                t1
            } else if t2 > ray_math::FLT_EPS {
                t2
            } else {
                return None;
            }
        }
        LightKind::Directional { dir, angle } => {
            if scene_hit || angle <= 0.0 {
                return None;
            }
            if d.dot(dir) < angle.cos() {
                return None;
            }
            MAX_DIST
        }
        LightKind::Rect { pos, u, v, .. } => {
            let (t, a1, a2) = planar_hit(pos, u, v, o, d)?;
            if a1.abs() > 0.5 || a2.abs() > 0.5 {
                return None;
            }
            t
        }
        LightKind::Disk { pos, u, v, .. } => {
            let (t, a1, a2) = planar_hit(pos, u, v, o, d)?;
            if (a1 * a1 + a2 * a2).sqrt() > 0.5 {
                return None;
            }
            t
        }
        LightKind::Line { pos, axis, radius, height, .. } => {
            let od = o - pos;
            let d_perp = d - axis * d.dot(axis);
            let o_perp = od - axis * od.dot(axis);
            let a = d_perp.length_squared();
            if a < 1e-12 {
                return None;
            }
            let b = 2.0 * d_perp.dot(o_perp);
            let c = o_perp.length_squared() - radius * radius;
            let det = b * b - 4.0 * a * c;
            if det < 0.0 {
                return None;
            }
            let det = det.sqrt();
            let t = [(-b - det) / (2.0 * a), (-b + det) / (2.0 * a)]
                .into_iter()
                .find(|&t| t > ray_math::FLT_EPS && (od + d * t).dot(axis).abs() <= 0.5 * height)?;
            t
        }
        LightKind::Triangle { .. } | LightKind::Env => return None,
    };
    (t < limit).then_some(t)
}

/// One-sided hit against the plane spanned by `u` and `v` around `pos`.
/// Returns the distance and the two normalized plane coordinates.
pub(crate) fn planar_hit(pos: Vec3, u: Vec3, v: Vec3, o: Vec3, d: Vec3) -> Option<(f32, f32, f32)> {
    let n = u.cross(v).normalize_or_zero();
    let cos = d.dot(n);
    if cos >= 0.0 {
        return None;
    }
    let t = (pos - o).dot(n) / cos;
    if t <= ray_math::FLT_EPS {
        return None;
    }
    let p = o + d * t - pos;
    let a1 = p.dot(u) / u.length_squared();
    let a2 = p.dot(v) / v.length_squared();
    Some((t, a1, a2))
}

/// Trace shadow rays and add the unoccluded contributions to `temp`.
///
/// `temp` covers `rect`; contributions are clamped per ray by `clamp`
/// (zero disables clamping). Accumulation happens in submission order.
pub fn trace_shadow_rays(
    rays: &[ShadowRay],
    ps: &PassSettings,
    sc: &SceneSnapshot,
    traversal: &dyn Traversal,
    clamp: f32,
    rect: &Rect,
    temp: &mut [Vec4],
) {
    let visible: Vec<Vec3> = rays
        .par_iter()
        .map(|sh| shadow_throughput(sh, ps, sc, traversal))
        .collect();

    for (sh, mut c) in rays.iter().zip(visible) {
        if c.max_element() <= 0.0 {
            continue;
        }
        if clamp > 0.0 {
            c = c.min(Vec3::splat(clamp));
        }
        let (x, y) = (sh.xy.x(), sh.xy.y());
        if !rect.contains(x, y) {
            continue;
        }
        let px = &mut temp[rect.local_index(x, y)];
        *px += c.extend(0.0);
    }
}

fn shadow_throughput(sh: &ShadowRay, ps: &PassSettings, sc: &SceneSnapshot, traversal: &dyn Traversal) -> Vec3 {
    let mut remaining = if sh.dist >= MAX_DIST {
        MAX_DIST
    } else {
        sh.dist * (1.0 - SHADOW_DIST_EPS)
    };
    if sh.from_env && blocked_by_portal(sh, sc, remaining) {
        return Vec3::ZERO;
    }

    let mut c = sh.c;
    let mut o = sh.o;
    let mut transp_depth = sh.depth.transparency();
    while c.max_element() > 0.0 {
        let Some((hit, solid)) = traversal.any_hit(sc, o, sh.d, remaining) else {
            break;
        };
        if solid || transp_depth >= ps.max_transp_depth {
            return Vec3::ZERO;
        }
        let tm = sc.tri_materials[hit.prim_index as usize];
        let Some(mat_index) = tm.material(hit.backfacing) else {
            return Vec3::ZERO;
        };
        let uv = surface_uv(sc, hit.prim_index, hit.u, hit.v);
        c *= transparent_share(sc, mat_index, uv);

        let prev = o;
        let p = o + sh.d * hit.t;
        let n = geometric_normal(sc, &hit);
        o = offset_ray(p, if n.dot(sh.d) > 0.0 { n } else { -n });
        remaining -= (o - prev).dot(sh.d);
        if remaining <= 0.0 {
            break;
        }
        transp_depth = transp_depth.saturating_add(1);
    }
    c
}

fn blocked_by_portal(sh: &ShadowRay, sc: &SceneSnapshot, limit: f32) -> bool {
    sc.blocker_lights.iter().any(|&li| {
        let (pos, u, v, disk) = match sc.lights[li as usize].kind {
            LightKind::Rect { pos, u, v, .. } => (pos, u, v, false),
            LightKind::Disk { pos, u, v, .. } => (pos, u, v, true),
            _ => return false,
        };
        let n = u.cross(v).normalize_or_zero();
        let cos = sh.d.dot(n);
        if cos.abs() < 1e-12 {
            return false;
        }
        let t = (pos - sh.o).dot(n) / cos;
        if t <= PORTAL_HIT_EPS || t >= limit {
            return false;
        }
        let p = sh.o + sh.d * t - pos;
        let a1 = p.dot(u) / u.length_squared();
        let a2 = p.dot(v) / v.length_squared();
        let inside = if disk {
            (a1 * a1 + a2 * a2).sqrt() <= 0.5
        } else {
            a1.abs() <= 0.5 && a2.abs() <= 0.5
        };
        // Rays passing the portal from its emitting side are blocked
        inside && cos < 0.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::RayDepth;
    use crate::sequence::HALTON_COUNT;
    use ray_core::{LightDesc, MeshDesc, RectLightDesc, Scene, ShadingNodeDesc};
    use ray_math::Mat4;

    fn quad(y: f32) -> Vec<Vec3> {
        vec![
            Vec3::new(-1.0, y, -1.0),
            Vec3::new(1.0, y, -1.0),
            Vec3::new(1.0, y, 1.0),
            Vec3::new(-1.0, y, 1.0),
        ]
    }

    fn build(scene: &mut Scene) -> &SceneSnapshot {
        scene.finalize();
        scene.snapshot().expect("finalized")
    }

    fn coincident_scene() -> Scene {
        // Two identical quads in one mesh: triangles 0/1 and 2/3 overlap
        let mut scene = Scene::new();
        let m = scene.add_material(ShadingNodeDesc::diffuse(Vec3::ONE)).unwrap();
        let mut positions = quad(0.0);
        positions.extend(quad(0.0));
        let indices = vec![0, 2, 1, 0, 3, 2, 4, 6, 5, 4, 7, 6];
        let mesh = scene.add_mesh(&MeshDesc::new("dup", positions, indices, m, None)).unwrap();
        scene.add_mesh_instance(mesh, Mat4::IDENTITY).unwrap();
        scene
    }

    #[test]
    fn test_closest_hit_tie_breaks_on_primitive_index() {
        let mut scene = coincident_scene();
        let sc = build(&mut scene);
        let o = Vec3::new(0.3, 2.0, 0.2);
        let d = Vec3::new(0.0, -1.0, 0.0);

        for wide in [false, true] {
            let tr = SoftwareTraversal::new(wide);
            let hit = tr.closest_hit(sc, o, d, MAX_DIST).unwrap();
            assert!((hit.t - 2.0).abs() < 1e-5);
            // The two candidates are the overlapping triangles; the lower index wins
            let tris: Vec<u32> = (0..sc.tris.len() as u32)
                .filter(|&i| triangle::intersect_tri(o, d, &sc.tris[i as usize], MAX_DIST).is_some())
                .collect();
            assert_eq!(tris.len(), 2);
            assert_eq!(hit.prim_index, tris[0]);
        }
    }

    #[test]
    fn test_binary_and_wide_agree() {
        let mut scene = Scene::new();
        let m = scene.add_material(ShadingNodeDesc::diffuse(Vec3::ONE)).unwrap();
        let mesh = scene
            .add_mesh(&MeshDesc::new("quad", quad(0.0), vec![0, 2, 1, 0, 3, 2], m, None))
            .unwrap();
        for i in 0..6 {
            scene
                .add_mesh_instance(mesh, Mat4::from_translation(Vec3::new(i as f32 * 0.5, i as f32, 0.0)))
                .unwrap();
        }
        let sc = build(&mut scene);
        let binary = SoftwareTraversal::new(false);
        let wide = SoftwareTraversal::new(true);
        for k in 0..32 {
            let o = Vec3::new(-2.0 + k as f32 * 0.2, 10.0, 0.1 * (k % 5) as f32);
            let d = Vec3::new(0.05, -1.0, 0.0).normalize();
            let a = binary.closest_hit(sc, o, d, MAX_DIST);
            let b = wide.closest_hit(sc, o, d, MAX_DIST);
            assert_eq!(a.is_some(), b.is_some());
            if let (Some(a), Some(b)) = (a, b) {
                assert_eq!(a.prim_index, b.prim_index);
                assert_eq!(a.obj_index, b.obj_index);
                assert!((a.t - b.t).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_any_hit_reports_solid() {
        let mut scene = coincident_scene();
        let sc = build(&mut scene);
        let tr = SoftwareTraversal::new(false);
        let (hit, solid) = tr
            .any_hit(sc, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, -1.0, 0.0), 10.0)
            .unwrap();
        assert!(solid);
        assert!((hit.t - 1.0).abs() < 1e-5);
        // Target closer than the occluder
        assert!(tr
            .any_hit(sc, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, -1.0, 0.0), 0.5)
            .is_none());
    }

    #[test]
    fn test_transparent_layer_is_stepped_through() {
        let mut scene = Scene::new();
        let glass = scene
            .add_material(ShadingNodeDesc::transparent(Vec3::new(0.5, 0.5, 0.5)))
            .unwrap();
        let floor = scene.add_material(ShadingNodeDesc::diffuse(Vec3::ONE)).unwrap();
        let top = scene
            .add_mesh(&MeshDesc::new("top", quad(1.0), vec![0, 2, 1, 0, 3, 2], glass, None))
            .unwrap();
        let bottom = scene
            .add_mesh(&MeshDesc::new("bottom", quad(0.0), vec![0, 2, 1, 0, 3, 2], floor, None))
            .unwrap();
        scene.add_mesh_instance(top, Mat4::IDENTITY).unwrap();
        scene.add_mesh_instance(bottom, Mat4::IDENTITY).unwrap();
        let sc = build(&mut scene);

        let seq = vec![0.5; HALTON_COUNT];
        let sampler = PixelSampler::new(&seq, 4, false);
        let ps = PassSettings::default();
        let tr = SoftwareTraversal::new(false);
        let mut rays = vec![RayData {
            o: Vec3::new(0.1, 3.0, 0.1),
            d: Vec3::new(0.0, -1.0, 0.0),
            ..Default::default()
        }];
        let mut hits = Vec::new();
        intersect_scene(&mut rays, &ps, &sampler, sc, &tr, &mut hits);

        assert!(hits[0].mask);
        assert!((hits[0].t - 3.0).abs() < 1e-3);
        assert!((rays[0].c - Vec3::splat(0.5)).length() < 1e-5);
        assert_eq!(rays[0].depth.transparency(), 1);
    }

    #[test]
    fn test_area_light_hit_and_shadow() {
        let mut scene = Scene::new();
        let floor = scene.add_material(ShadingNodeDesc::diffuse(Vec3::ONE)).unwrap();
        let mesh = scene
            .add_mesh(&MeshDesc::new("floor", quad(0.0), vec![0, 2, 1, 0, 3, 2], floor, None))
            .unwrap();
        scene.add_mesh_instance(mesh, Mat4::IDENTITY).unwrap();
        scene.add_light(&LightDesc::Rect(RectLightDesc {
            transform: Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)),
            visible: true,
            ..Default::default()
        }));
        let sc = build(&mut scene);

        // Bounced ray from the floor upwards sees the light from below
        let rays = vec![RayData {
            o: Vec3::new(0.0, 0.01, 0.0),
            d: Vec3::Y,
            depth: RayDepth::PRIMARY.add_diffuse(),
            ..Default::default()
        }];
        let mut hits = vec![HitData::miss(MAX_DIST, PixelCoord::default())];
        intersect_area_lights(&rays, sc, &mut hits);
        assert_eq!(hits[0].light_index(), Some(0));
        assert!((hits[0].t - 0.99).abs() < 1e-4);

        // The floor occludes a shadow ray shot through it
        let ps = PassSettings::default();
        let tr = SoftwareTraversal::new(true);
        let rect = Rect::new(0, 0, 1, 1);
        let mut temp = vec![Vec4::ZERO; 1];
        let shadow = ShadowRay {
            o: Vec3::new(0.0, -1.0, 0.0),
            d: Vec3::Y,
            dist: 2.0,
            c: Vec3::ONE,
            xy: PixelCoord::new(0, 0),
            depth: RayDepth::PRIMARY,
            from_env: false,
        };
        trace_shadow_rays(&[shadow], &ps, sc, &tr, 0.0, &rect, &mut temp);
        assert_eq!(temp[0], Vec4::ZERO);

        let open = ShadowRay {
            o: Vec3::new(0.0, 0.01, 0.0),
            ..shadow
        };
        trace_shadow_rays(&[open], &ps, sc, &tr, 0.5, &rect, &mut temp);
        assert!((temp[0].truncate() - Vec3::splat(0.5)).length() < 1e-6);
    }
}
