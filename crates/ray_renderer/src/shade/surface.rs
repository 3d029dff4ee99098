//! Surface attributes and material-tree helpers shared by traversal and shading.

use ray_core::{Material, SceneSnapshot, ShadingNode};
use ray_math::{Mat4Ext, Vec2, Vec3, Vec4};

use crate::ray::HitData;

/// Mix trees deeper than this are cut off.
pub const MAX_MIX_DEPTH: u32 = 16;

/// Interpolated texture coordinates at barycentrics `(u, v)`.
pub fn surface_uv(sc: &SceneSnapshot, tri: u32, u: f32, v: f32) -> Vec2 {
    let [v1, v2, v3] = sc.triangle_vertices(tri);
    v1.t * (1.0 - u - v) + v2.t * u + v3.t * v
}

/// World-space geometric normal of the hit triangle (front side).
pub fn geometric_normal(sc: &SceneSnapshot, hit: &HitData) -> Vec3 {
    let n = sc.tris[hit.prim_index as usize].normal();
    match sc
        .mesh_instances
        .get(hit.obj_index.max(0) as usize)
        .and_then(|mi| sc.transforms.get(mi.tr_index as usize))
    {
        Some(tr) => tr.inv_xform.transform_normal_by_inverse(n).normalize_or_zero(),
        None => n.normalize_or_zero(),
    }
}

/// Sample an optional texture, white when absent.
#[inline]
pub fn sample_texture(sc: &SceneSnapshot, tex: Option<u32>, uv: Vec2, lod: f32) -> Vec4 {
    tex.and_then(|t| sc.textures.get(t as usize))
        .map_or(Vec4::ONE, |t| t.sample(uv, lod))
}

/// Mix factor of a mix node, texture included.
#[inline]
pub fn mix_factor(sc: &SceneSnapshot, mat: &Material, uv: Vec2, lod: f32) -> f32 {
    (mat.strength * sample_texture(sc, mat.base_texture, uv, lod).x).clamp(0.0, 1.0)
}

/// Resolve a mix tree to one leaf using `rand`, ignoring fresnel weighting.
pub fn pick_material(sc: &SceneSnapshot, mut index: u32, mut rand: f32, uv: Vec2) -> u32 {
    for _ in 0..MAX_MIX_DEPTH {
        let mat = &sc.materials[index as usize];
        let (ShadingNode::Mix, Some([first, second])) = (mat.node, mat.mix_materials) else {
            break;
        };
        let m = mix_factor(sc, mat, uv, 0.0);
        if rand > m {
            index = first;
            rand = (rand - m) / (1.0 - m);
        } else {
            index = second;
            rand /= m;
        }
    }
    index
}

/// Fraction of light a material lets through unchanged in direction.
///
/// Transparent nodes pass their base color; mix nodes blend the shares of
/// their children; everything else is opaque.
pub fn transparent_share(sc: &SceneSnapshot, index: u32, uv: Vec2) -> Vec3 {
    share(sc, index, uv, 0)
}

fn share(sc: &SceneSnapshot, index: u32, uv: Vec2, depth: u32) -> Vec3 {
    let Some(mat) = sc.materials.get(index as usize) else {
        return Vec3::ZERO;
    };
    match (mat.node, mat.mix_materials) {
        (ShadingNode::Transparent, _) => mat.base_color,
        (ShadingNode::Mix, Some([first, second])) if depth < MAX_MIX_DEPTH => {
            let m = mix_factor(sc, mat, uv, 0.0);
            share(sc, first, uv, depth + 1) * (1.0 - m) + share(sc, second, uv, depth + 1) * m
        }
        _ => Vec3::ZERO,
    }
}
