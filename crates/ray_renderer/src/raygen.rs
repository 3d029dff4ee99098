//! Primary ray generation.
//!
//! - Perspective and orthographic cameras with box or tent pixel filters
//! - Thin-lens depth of field, lens shift and clip start
//! - The geometry camera, which rasterizes a mesh instance in UV space and
//!   shoots one ray per covered texel straight at the surface

use ray_core::{CameraDesc, CameraKind, PixelFilter, SceneSnapshot};
use ray_math::{fract, Mat4Ext, Vec2, Vec3};

use crate::ray::{HitData, IorStack, PixelCoord, RayData, RayDepth};
use crate::region::Rect;
use crate::sampling::{concentric_disk, pixel_hash, safe_normalize, sample_offset};
use crate::sequence::{RAND_DIM_FILTER_U, RAND_DIM_FILTER_V, RAND_DIM_LENS_U, RAND_DIM_LENS_V};

/// Texels on a shared UV edge count as covered by either triangle.
const UV_EDGE_EPS: f32 = 1e-6;

/// Camera frame and projection constants for one pass.
struct Projection {
    origin: Vec3,
    side: Vec3,
    up: Vec3,
    fwd: Vec3,
    ortho: bool,
    /// Image aspect ratio.
    k: f32,
    /// Half height of the image plane at the focus distance.
    fov_k: f32,
    focus: f32,
    shift: [f32; 2],
    spread: f32,
    lens_radius: f32,
    clip_start: f32,
}

impl Projection {
    fn new(cam: &CameraDesc, w: u32, h: u32) -> Self {
        let (side, up, fwd) = cam.basis();
        let temp = (0.5 * cam.fov.to_radians()).tan();
        let focus = cam.focus_distance.max(1e-4);
        let lens_radius = if cam.fstop > 0.0 {
            let coc = 0.5 * cam.focal_length / cam.fstop;
            0.5 * coc * cam.sensor_height
        } else {
            0.0
        };
        Self {
            origin: cam.origin,
            side,
            up,
            fwd,
            ortho: cam.kind == CameraKind::Ortho,
            k: w as f32 / h as f32,
            fov_k: temp * focus,
            focus,
            shift: cam.shift,
            spread: (2.0 * temp / h as f32).atan(),
            lens_radius,
            clip_start: cam.clip_start,
        }
    }

    /// Point on the focal plane through image position `(x, y)`.
    fn plane_point(&self, x: f32, y: f32, w: u32, h: u32) -> Vec3 {
        let px = 2.0 * self.fov_k * (x / w as f32 + self.shift[0] / self.k) - self.fov_k;
        let py = 2.0 * self.fov_k * (-y / h as f32 + self.shift[1]) + self.fov_k;
        self.origin + self.k * px * self.side + py * self.up + self.focus * self.fwd
    }

    fn ray(&self, x: f32, y: f32, w: u32, h: u32, lens: Vec2) -> (Vec3, Vec3) {
        let target = self.plane_point(x, y, w, h);
        if self.ortho {
            let o = target - self.focus * self.fwd;
            return (o + self.clip_start * self.fwd, self.fwd);
        }
        let lens_offset = concentric_disk(lens.x, lens.y) * self.lens_radius;
        let origin = self.origin + self.side * lens_offset.x + self.up * lens_offset.y;
        let d = safe_normalize(target - origin);
        let along = d.dot(self.fwd);
        let o = if along > 0.0 {
            origin + d * (self.clip_start / along)
        } else {
            origin
        };
        (o, d)
    }
}

/// Jitter inside a pixel for a uniform `r`, centered on zero for the tent filter.
#[inline]
fn filter_offset(filter: PixelFilter, r: f32) -> f32 {
    match filter {
        PixelFilter::Box => r,
        PixelFilter::Tent => {
            let t = if r < 0.5 {
                (2.0 * r).sqrt() - 1.0
            } else {
                1.0 - (2.0 - 2.0 * r).sqrt()
            };
            0.5 + t
        }
    }
}

/// One camera ray per pixel of `rect` in row-major order.
///
/// `required_samples` covers `rect`; pixels whose count is below `iteration`
/// have converged and get no ray. `sample` is the iteration's sample vector.
#[allow(clippy::too_many_arguments)]
pub fn generate_primary_rays(
    cam: &CameraDesc,
    rect: Rect,
    w: u32,
    h: u32,
    sample: &[f32],
    required_samples: Option<&[u16]>,
    iteration: u32,
    coherent: bool,
    out: &mut Vec<RayData>,
) {
    out.clear();
    if rect.is_empty() || w == 0 || h == 0 || sample.len() <= RAND_DIM_LENS_V {
        return;
    }
    let proj = Projection::new(cam, w, h);
    let cone_width = if proj.ortho { 2.0 * proj.fov_k / h as f32 } else { 0.0 };
    let cone_spread = if proj.ortho { 0.0 } else { proj.spread };

    out.reserve(rect.area());
    for y in rect.y..rect.y + rect.h {
        for x in rect.x..rect.x + rect.w {
            if let Some(required) = required_samples {
                if (required[rect.local_index(x, y)] as u32) < iteration {
                    continue;
                }
            }
            let off = sample_offset(pixel_hash(x, y, w, coherent));
            let rx = fract(sample[RAND_DIM_FILTER_U] + off.x);
            let ry = fract(sample[RAND_DIM_FILTER_V] + off.y);
            let lens = Vec2::new(
                fract(sample[RAND_DIM_LENS_U] + off.x),
                fract(sample[RAND_DIM_LENS_V] + off.y),
            );

            let fx = x as f32 + filter_offset(cam.filter, rx);
            let fy = y as f32 + filter_offset(cam.filter, ry);
            let (o, d) = proj.ray(fx, fy, w, h, lens);

            out.push(RayData {
                o,
                d,
                c: Vec3::ONE,
                pdf: 1e6,
                ior: IorStack::default(),
                cone_width,
                cone_spread,
                xy: PixelCoord::new(x, y),
                depth: RayDepth::PRIMARY,
            });
        }
    }
}

/// Rays for the geometry (lightmap) camera.
///
/// Each texel of `rect` covered by instance `mi_index` in UV space gets a ray
/// one unit above the surface looking down its normal, together with the
/// matching hit so the trace step can be skipped. The first triangle covering
/// a texel wins.
#[allow(clippy::too_many_arguments)]
pub fn sample_mesh_in_texture_space(
    sc: &SceneSnapshot,
    mi_index: u32,
    rect: Rect,
    w: u32,
    h: u32,
    sample: &[f32],
    out_rays: &mut Vec<RayData>,
    out_hits: &mut Vec<HitData>,
) {
    out_rays.clear();
    out_hits.clear();
    let Some(mi) = sc.mesh_instances.get(mi_index as usize) else {
        log::warn!("Geometry camera references missing mesh instance {mi_index}");
        return;
    };
    if rect.is_empty() || sample.len() <= RAND_DIM_FILTER_V {
        return;
    }
    let mesh = &sc.meshes[mi.mesh_index as usize];
    let tr = &sc.transforms[mi.tr_index as usize];
    let jitter = Vec2::new(sample[RAND_DIM_FILTER_U], sample[RAND_DIM_FILTER_V]);

    let mut covered = vec![false; rect.area()];
    let size = Vec2::new(w as f32, h as f32);

    for tri in mesh.tris_index..mesh.tris_index + mesh.tris_count {
        let [v0, v1, v2] = sc.triangle_vertices(tri);
        let t0 = v0.t * size;
        let t1 = v1.t * size;
        let t2 = v2.t * size;
        let area = (t1 - t0).perp_dot(t2 - t0);
        if area.abs() < 1e-12 {
            continue;
        }

        let lo = t0.min(t1).min(t2).floor().max(Vec2::new(rect.x as f32, rect.y as f32));
        let hi = t0
            .max(t1)
            .max(t2)
            .ceil()
            .min(Vec2::new((rect.x + rect.w) as f32, (rect.y + rect.h) as f32));
        if hi.x <= lo.x || hi.y <= lo.y {
            continue;
        }

        for y in lo.y as u32..hi.y as u32 {
            for x in lo.x as u32..hi.x as u32 {
                let local = rect.local_index(x, y);
                if covered[local] {
                    continue;
                }
                let p = Vec2::new(x as f32, y as f32) + jitter;
                let u = (p - t0).perp_dot(t2 - t0) / area;
                let v = (t1 - t0).perp_dot(p - t0) / area;
                if u < -UV_EDGE_EPS || v < -UV_EDGE_EPS || u + v > 1.0 + UV_EDGE_EPS {
                    continue;
                }
                covered[local] = true;

                let bw = 1.0 - u - v;
                let p_ls = v0.p * bw + v1.p * u + v2.p * v;
                let n_ls = v0.n * bw + v1.n * u + v2.n * v;
                let pos = tr.xform.transform_point3(p_ls);
                let n = safe_normalize(tr.inv_xform.transform_normal_by_inverse(n_ls));
                if n == Vec3::ZERO {
                    continue;
                }

                let xy = PixelCoord::new(x, y);
                out_rays.push(RayData {
                    o: pos + n,
                    d: -n,
                    xy,
                    ..Default::default()
                });
                out_hits.push(HitData {
                    mask: true,
                    obj_index: mi_index as i32,
                    prim_index: tri,
                    backfacing: false,
                    t: 1.0,
                    u,
                    v,
                    xy,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::update_sequence;
    use ray_core::{quad_positions, MeshDesc, Scene, ShadingNodeDesc};
    use ray_math::{Mat4, Vec3};

    fn seq() -> Vec<f32> {
        update_sequence(0)[crate::sequence::HALTON_COUNT..2 * crate::sequence::HALTON_COUNT].to_vec()
    }

    #[test]
    fn test_one_ray_per_pixel() {
        let cam = CameraDesc::new().look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let mut rays = Vec::new();
        generate_primary_rays(&cam, Rect::new(4, 2, 8, 4), 32, 16, &seq(), None, 1, false, &mut rays);
        assert_eq!(rays.len(), 32);
        assert_eq!(rays[0].xy, PixelCoord::new(4, 2));
        assert_eq!(rays[31].xy, PixelCoord::new(11, 5));
        for r in &rays {
            assert!((r.d.length() - 1.0).abs() < 1e-5);
            assert!(r.d.z < 0.0);
            assert_eq!(r.pdf, 1e6);
            assert_eq!(r.depth, RayDepth::PRIMARY);
        }
    }

    #[test]
    fn test_center_pixel_looks_forward() {
        let cam = CameraDesc::new()
            .look_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y)
            .with_filter(PixelFilter::Box);
        let proj = Projection::new(&cam, 64, 64);
        let (o, d) = proj.ray(32.0, 32.0, 64, 64, Vec2::splat(0.5));
        assert_eq!(o, Vec3::ZERO);
        assert!((d - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);

        // Top-left corner points up and to the left
        let (_, corner) = proj.ray(0.0, 0.0, 64, 64, Vec2::splat(0.5));
        assert!(corner.x < 0.0 && corner.y > 0.0);
    }

    #[test]
    fn test_converged_pixels_are_skipped() {
        let cam = CameraDesc::new();
        let rect = Rect::new(0, 0, 4, 1);
        let required = [5u16, 2, 5, 3];
        let mut rays = Vec::new();
        generate_primary_rays(&cam, rect, 4, 1, &seq(), Some(&required), 3, false, &mut rays);
        let xs: Vec<u32> = rays.iter().map(|r| r.xy.x()).collect();
        assert_eq!(xs, vec![0, 2, 3]);
    }

    #[test]
    fn test_degenerate_rect_gives_no_rays() {
        let mut rays = vec![RayData::default()];
        generate_primary_rays(&CameraDesc::new(), Rect::new(3, 3, 0, 5), 8, 8, &seq(), None, 1, false, &mut rays);
        assert!(rays.is_empty());
    }

    #[test]
    fn test_tent_filter_range() {
        for i in 0..=16 {
            let r = (i as f32 / 16.0).min(0.999);
            let o = filter_offset(PixelFilter::Tent, r);
            assert!((-0.5..=1.5).contains(&o));
        }
        assert!((filter_offset(PixelFilter::Tent, 0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_clip_start_and_ortho() {
        let mut cam = CameraDesc::new().look_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y);
        cam.clip_start = 2.0;
        let proj = Projection::new(&cam, 16, 16);
        let (o, _) = proj.ray(8.0, 8.0, 16, 16, Vec2::splat(0.5));
        assert!((o.z + 2.0).abs() < 1e-5);

        let ortho = Projection::new(&cam.clone().with_kind(CameraKind::Ortho), 16, 16);
        let (o1, d1) = ortho.ray(0.0, 8.0, 16, 16, Vec2::splat(0.5));
        let (o2, d2) = ortho.ray(16.0, 8.0, 16, 16, Vec2::splat(0.5));
        assert_eq!(d1, d2);
        assert!(o2.x > o1.x);
    }

    #[test]
    fn test_lens_offsets_origin() {
        let cam = CameraDesc::new()
            .look_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y)
            .with_lens(50.0, 2.0, 3.0);
        let proj = Projection::new(&cam, 16, 16);
        let (o, d) = proj.ray(8.0, 8.0, 16, 16, Vec2::new(0.9, 0.5));
        assert!(o.x > 0.0);
        // Rays through the same pixel converge on the focal plane
        let target = o + d * (3.0 / d.dot(Vec3::new(0.0, 0.0, -1.0)));
        assert!((target - Vec3::new(0.0, 0.0, -3.0)).length() < 1e-3);
    }

    #[test]
    fn test_geometry_camera_covers_unwrap() {
        let mut scene = Scene::new();
        let mat = scene.add_material(ShadingNodeDesc::diffuse(Vec3::ONE)).unwrap();
        let (positions, indices) = quad_positions(
            Vec3::new(-1.0, 0.0, -1.0),
            Vec3::new(-1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, -1.0),
        );
        let desc = MeshDesc::new("floor", positions, indices, mat, None).with_uvs(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
        ]);
        let mesh = scene.add_mesh(&desc).unwrap();
        scene.add_mesh_instance(mesh, Mat4::from_translation(Vec3::Y)).unwrap();
        scene.finalize();
        let sc = scene.snapshot().unwrap();

        let mut rays = Vec::new();
        let mut hits = Vec::new();
        let sample = vec![0.5; crate::sequence::HALTON_COUNT];
        sample_mesh_in_texture_space(sc, 0, Rect::new(0, 0, 8, 8), 8, 8, &sample, &mut rays, &mut hits);
        assert_eq!(rays.len(), 64);
        assert_eq!(hits.len(), 64);
        for (r, hit) in rays.iter().zip(&hits) {
            assert!((r.d - Vec3::new(0.0, -1.0, 0.0)).length() < 1e-4);
            assert!((r.o.y - 2.0).abs() < 1e-4);
            assert!(hit.mask && hit.t == 1.0);
        }
    }
}
