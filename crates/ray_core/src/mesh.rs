//! Triangle meshes.
//!
//! A mesh owns its vertex attributes and a list of material groups. Winding
//! is counter-clockwise: the geometric normal `(p1 - p0) x (p2 - p0)` points
//! out of the front face.

use ray_math::{Aabb, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{SceneError, SceneResult};
use crate::scene::MaterialHandle;

/// A run of triangles sharing front/back materials.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshGroup {
    pub front_material: MaterialHandle,
    /// `None` means backfaces shade black.
    #[serde(default)]
    pub back_material: Option<MaterialHandle>,
    /// First index (not triangle) of the group.
    pub index_offset: u32,
    pub index_count: u32,
}

/// Mesh upload description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshDesc {
    pub name: String,
    pub positions: Vec<Vec3>,
    #[serde(default)]
    pub normals: Option<Vec<Vec3>>,
    #[serde(default)]
    pub uvs: Option<Vec<Vec2>>,
    pub indices: Vec<u32>,
    pub groups: Vec<MeshGroup>,
}

impl MeshDesc {
    /// A mesh with one material covering every triangle.
    pub fn new(
        name: impl Into<String>,
        positions: Vec<Vec3>,
        indices: Vec<u32>,
        front: MaterialHandle,
        back: Option<MaterialHandle>,
    ) -> Self {
        let index_count = indices.len() as u32;
        Self {
            name: name.into(),
            positions,
            normals: None,
            uvs: None,
            indices,
            groups: vec![MeshGroup {
                front_material: front,
                back_material: back,
                index_offset: 0,
                index_count,
            }],
        }
    }

    pub fn with_uvs(mut self, uvs: Vec<Vec2>) -> Self {
        self.uvs = Some(uvs);
        self
    }

    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Self {
        self.normals = Some(normals);
        self
    }
}

/// Validated mesh geometry with complete per-vertex attributes.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
    pub groups: Vec<MeshGroup>,
    pub bounds: Aabb,
}

impl Mesh {
    /// Validate a description and fill in missing normals, uvs and tangents.
    pub fn from_desc(desc: &MeshDesc) -> SceneResult<Self> {
        let invalid = |reason: String| SceneError::InvalidMesh {
            name: desc.name.clone(),
            reason,
        };
        let vertex_count = desc.positions.len();
        if desc.indices.len() % 3 != 0 {
            return Err(invalid(format!(
                "index count {} is not a multiple of 3",
                desc.indices.len()
            )));
        }
        if let Some(&bad) = desc.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(invalid(format!("index {} out of range ({} vertices)", bad, vertex_count)));
        }
        for group in &desc.groups {
            let end = group.index_offset as usize + group.index_count as usize;
            if group.index_offset % 3 != 0 || group.index_count % 3 != 0 || end > desc.indices.len() {
                return Err(invalid(format!(
                    "group [{}, {}) does not cover whole triangles",
                    group.index_offset, end
                )));
            }
        }

        let uvs = match &desc.uvs {
            Some(uvs) if uvs.len() == vertex_count => uvs.clone(),
            Some(uvs) => {
                return Err(invalid(format!(
                    "{} uvs for {} vertices",
                    uvs.len(),
                    vertex_count
                )))
            }
            None => vec![Vec2::ZERO; vertex_count],
        };

        let mut mesh = Self {
            name: desc.name.clone(),
            positions: desc.positions.clone(),
            normals: Vec::new(),
            tangents: Vec::new(),
            uvs,
            indices: desc.indices.clone(),
            groups: desc.groups.clone(),
            bounds: Aabb::from_point_cloud(&desc.positions),
        };

        match &desc.normals {
            Some(normals) if normals.len() == vertex_count => mesh.normals = normals.clone(),
            Some(normals) => {
                // Face-varying normals cannot be used per vertex
                log::debug!(
                    "Normals array length ({}) doesn't match vertex count ({}), computing smooth normals",
                    normals.len(),
                    vertex_count
                );
                mesh.compute_normals();
            }
            None => mesh.compute_normals(),
        }
        mesh.compute_tangents();

        Ok(mesh)
    }

    /// Compute smooth vertex normals by averaging area-weighted face normals.
    pub fn compute_normals(&mut self) {
        let mut normals = vec![Vec3::ZERO; self.positions.len()];

        for face in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [face[0] as usize, face[1] as usize, face[2] as usize];
            let p0 = self.positions[i0];
            let face_normal = (self.positions[i1] - p0).cross(self.positions[i2] - p0);

            normals[i0] += face_normal;
            normals[i1] += face_normal;
            normals[i2] += face_normal;
        }

        for normal in &mut normals {
            *normal = normal.try_normalize().unwrap_or(Vec3::Y);
        }
        self.normals = normals;
    }

    /// Tangents along increasing `u`, orthogonalized against the normal.
    fn compute_tangents(&mut self) {
        let mut tangents = vec![Vec3::ZERO; self.positions.len()];

        for face in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [face[0] as usize, face[1] as usize, face[2] as usize];
            let e1 = self.positions[i1] - self.positions[i0];
            let e2 = self.positions[i2] - self.positions[i0];
            let d1 = self.uvs[i1] - self.uvs[i0];
            let d2 = self.uvs[i2] - self.uvs[i0];
            let det = d1.x * d2.y - d2.x * d1.y;
            if det.abs() < 1e-12 {
                continue;
            }
            let t = (e1 * d2.y - e2 * d1.y) / det;
            tangents[i0] += t;
            tangents[i1] += t;
            tangents[i2] += t;
        }

        for (t, n) in tangents.iter_mut().zip(&self.normals) {
            let ortho = *t - *n * n.dot(*t);
            *t = ortho
                .try_normalize()
                .unwrap_or_else(|| ray_math::build_orthonormal_basis(*n).0);
        }
        self.tangents = tangents;
    }

    /// Get the number of triangles in the mesh.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get the number of vertices in the mesh.
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Group that owns triangle `tri`, if any.
    pub fn group_of(&self, tri: usize) -> Option<&MeshGroup> {
        let index = tri as u32 * 3;
        self.groups
            .iter()
            .find(|g| index >= g.index_offset && index < g.index_offset + g.index_count)
    }
}

/// Two-triangle quad `p0 p1 p2 p3` (counter-clockwise around the front face).
pub fn quad_positions(p0: Vec3, p1: Vec3, p2: Vec3, p3: Vec3) -> (Vec<Vec3>, Vec<u32>) {
    (vec![p0, p1, p2, p3], vec![0, 1, 2, 0, 2, 3])
}
