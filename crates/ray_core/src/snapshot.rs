//! Read-only scene data consumed by the renderer.
//!
//! Every index stored here is valid or one of the explicit sentinels
//! ([`INVALID_INDEX`], [`NO_MATERIAL`](crate::material::NO_MATERIAL)).

use bytemuck::{Pod, Zeroable};
use ray_math::{Aabb, Mat4, Vec2, Vec3};

use crate::bvh::{BvhNode, WideBvhNode, INVALID_INDEX};
use crate::environment::Environment;
use crate::light::Light;
use crate::material::{Material, TriMaterial};
use crate::texture::Texture;

/// Shading attributes of one vertex (object space).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vertex {
    pub p: Vec3,
    pub n: Vec3,
    pub b: Vec3,
    pub t: Vec2,
}

/// Triangle stored as three plane equations.
///
/// `n_plane` is the (unnormalized) geometric plane; `u_plane` and `v_plane`
/// evaluate to the barycentric coordinates of a point on that plane.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TriAccel {
    pub n_plane: [f32; 4],
    pub u_plane: [f32; 4],
    pub v_plane: [f32; 4],
}

impl TriAccel {
    pub fn new(p0: Vec3, p1: Vec3, p2: Vec3) -> Self {
        let e1 = p1 - p0;
        let e2 = p2 - p0;
        let n = e1.cross(e2);
        let len2 = n.length_squared();
        if len2 < 1e-30 {
            // Degenerate triangles can never be hit
            return Self::zeroed();
        }
        let n1 = e2.cross(n) / len2;
        let n2 = n.cross(e1) / len2;
        Self {
            n_plane: [n.x, n.y, n.z, -n.dot(p0)],
            u_plane: [n1.x, n1.y, n1.z, -n1.dot(p0)],
            v_plane: [n2.x, n2.y, n2.z, -n2.dot(p0)],
        }
    }

    #[inline]
    pub fn normal(&self) -> Vec3 {
        Vec3::new(self.n_plane[0], self.n_plane[1], self.n_plane[2])
    }
}

/// Per-mesh ranges in the shared arrays.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshData {
    /// Bottom-level root in [`SceneSnapshot::nodes`].
    pub node_index: u32,
    /// Bottom-level root in [`SceneSnapshot::wide_nodes`].
    pub wide_node_index: u32,
    /// First global triangle.
    pub tris_index: u32,
    pub tris_count: u32,
    pub bounds: Aabb,
}

/// Placed copy of a mesh.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshInstance {
    /// World-space bounds.
    pub bounds: Aabb,
    pub mesh_index: u32,
    pub tr_index: u32,
}

/// Object-to-world matrix and its inverse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub xform: Mat4,
    pub inv_xform: Mat4,
}

impl Transform {
    pub fn new(xform: Mat4) -> Self {
        Self {
            xform,
            inv_xform: xform.inverse(),
        }
    }
}

/// Everything the renderer needs from a finalized scene.
///
/// Global triangle `i` owns `vtx_indices[3i..3i + 3]`, `tris[i]` and
/// `tri_materials[i]`. Triangles are stored in BVH order per mesh.
#[derive(Clone, Debug)]
pub struct SceneSnapshot {
    pub env: Environment,
    pub mesh_instances: Vec<MeshInstance>,
    pub mi_indices: Vec<u32>,
    pub meshes: Vec<MeshData>,
    pub transforms: Vec<Transform>,
    pub vertices: Vec<Vertex>,
    pub vtx_indices: Vec<u32>,
    pub nodes: Vec<BvhNode>,
    pub wide_nodes: Vec<WideBvhNode>,
    pub tris: Vec<TriAccel>,
    pub tri_materials: Vec<TriMaterial>,
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
    pub lights: Vec<Light>,
    /// Lights picked by next-event estimation.
    pub li_indices: Vec<u32>,
    /// Lights that rays can hit directly.
    pub visible_lights: Vec<u32>,
    /// Sky portals.
    pub blocker_lights: Vec<u32>,
    /// Top-level root in `nodes`, [`INVALID_INDEX`] for an empty scene.
    pub root_node: u32,
    /// Top-level root in `wide_nodes`.
    pub wide_root_node: u32,
    pub root_bounds: Aabb,
}

impl Default for SceneSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl SceneSnapshot {
    /// An empty scene that every traversal treats as all-miss.
    pub fn empty() -> Self {
        Self {
            env: Environment::default(),
            mesh_instances: Vec::new(),
            mi_indices: Vec::new(),
            meshes: Vec::new(),
            transforms: Vec::new(),
            vertices: Vec::new(),
            vtx_indices: Vec::new(),
            nodes: Vec::new(),
            wide_nodes: Vec::new(),
            tris: Vec::new(),
            tri_materials: Vec::new(),
            materials: Vec::new(),
            textures: Vec::new(),
            lights: Vec::new(),
            li_indices: Vec::new(),
            visible_lights: Vec::new(),
            blocker_lights: Vec::new(),
            root_node: INVALID_INDEX,
            wide_root_node: INVALID_INDEX,
            root_bounds: Aabb::EMPTY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root_node == INVALID_INDEX
    }

    /// The three vertices of global triangle `tri`.
    #[inline]
    pub fn triangle_vertices(&self, tri: u32) -> [&Vertex; 3] {
        let base = tri as usize * 3;
        [
            &self.vertices[self.vtx_indices[base] as usize],
            &self.vertices[self.vtx_indices[base + 1] as usize],
            &self.vertices[self.vtx_indices[base + 2] as usize],
        ]
    }

    /// Follow `mix_materials` to check whether a transparent node is reachable.
    pub fn material_may_be_transparent(&self, index: u32) -> bool {
        may_be_transparent(&self.materials, index, 0)
    }
}

pub(crate) fn may_be_transparent(materials: &[Material], index: u32, depth: u32) -> bool {
    use crate::material::ShadingNode;

    let Some(mat) = materials.get(index as usize) else {
        return false;
    };
    match mat.node {
        ShadingNode::Transparent => true,
        ShadingNode::Mix if depth < 16 => mat
            .mix_materials
            .map(|[a, b]| {
                may_be_transparent(materials, a, depth + 1) || may_be_transparent(materials, b, depth + 1)
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_accel_barycentrics() {
        let p0 = Vec3::new(0.0, 0.0, 0.0);
        let p1 = Vec3::new(2.0, 0.0, 0.0);
        let p2 = Vec3::new(0.0, 3.0, 0.0);
        let tri = TriAccel::new(p0, p1, p2);

        let p = p0 + 0.25 * (p1 - p0) + 0.5 * (p2 - p0);
        let eval = |plane: [f32; 4]| plane[0] * p.x + plane[1] * p.y + plane[2] * p.z + plane[3];
        assert!((eval(tri.u_plane) - 0.25).abs() < 1e-6);
        assert!((eval(tri.v_plane) - 0.5).abs() < 1e-6);
        assert!(eval(tri.n_plane).abs() < 1e-6);
        assert!(tri.normal().z > 0.0);
    }

    #[test]
    fn test_degenerate_triangle_is_zeroed() {
        let tri = TriAccel::new(Vec3::ZERO, Vec3::X, Vec3::X * 2.0);
        assert_eq!(tri, TriAccel::zeroed());
    }

    #[test]
    fn test_empty_snapshot() {
        let sc = SceneSnapshot::empty();
        assert!(sc.is_empty());
        assert_eq!(sc.wide_root_node, INVALID_INDEX);
    }
}
