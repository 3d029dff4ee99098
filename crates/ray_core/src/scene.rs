//! Scene builder.
//!
//! Objects are added through `add_*` calls that return typed handles. Nothing
//! is visible to the renderer until [`Scene::finalize`] flattens everything
//! into a [`SceneSnapshot`]. Cameras are the exception: they are read on
//! every render call and can change between passes without re-finalizing.

use std::any::Any;

use ray_math::{Aabb, Mat4, Mat4Ext, Vec3};
use serde::{Deserialize, Serialize};

use crate::bvh::{build_bvh, convert_to_wide, INVALID_INDEX};
use crate::camera::CameraDesc;
use crate::environment::{Environment, EnvironmentDesc};
use crate::error::{SceneError, SceneResult};
use crate::light::{Light, LightDesc, LightKind};
use crate::material::{Material, MaterialDesc, ShadingNode, ShadingNodeDesc, TriMaterial, MATERIAL_INDEX_BITS};
use crate::mesh::{Mesh, MeshDesc};
use crate::snapshot::{may_be_transparent, MeshData, MeshInstance, SceneSnapshot, TriAccel, Transform, Vertex};
use crate::texture::{Texture, TextureDesc};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// Index of a texture in the scene.
    TextureHandle
);
handle!(
    /// Index of a material in the scene.
    MaterialHandle
);
handle!(MeshHandle);
handle!(MeshInstanceHandle);
handle!(LightHandle);
handle!(CameraHandle);

/// Backend-neutral view of a scene, checked by the renderer on every call.
pub trait SceneBase: Send + Sync {
    /// Name of the backend that created the scene.
    fn backend(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// Backend name of the reference CPU scene.
pub const CPU_BACKEND: &str = "cpu";

#[derive(Clone, Debug)]
struct InstanceDesc {
    mesh: MeshHandle,
    xform: Mat4,
}

/// The reference CPU scene.
#[derive(Debug, Default)]
pub struct Scene {
    meshes: Vec<Mesh>,
    materials: Vec<Material>,
    textures: Vec<Texture>,
    lights: Vec<LightDesc>,
    instances: Vec<InstanceDesc>,
    cameras: Vec<CameraDesc>,
    current_camera: Option<CameraHandle>,
    environment: EnvironmentDesc,
    snapshot: Option<SceneSnapshot>,
}

impl SceneBase for Scene {
    fn backend(&self) -> &'static str {
        CPU_BACKEND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last finalized snapshot, `None` until `finalize` ran after the last edit.
    pub fn snapshot(&self) -> Option<&SceneSnapshot> {
        self.snapshot.as_ref()
    }

    fn invalidate(&mut self) {
        self.snapshot = None;
    }

    // =========================================================================
    // Textures and materials
    // =========================================================================

    pub fn add_texture(&mut self, desc: &TextureDesc) -> SceneResult<TextureHandle> {
        let texture = Texture::from_desc(desc)?;
        log::debug!(
            "Added texture: {} ({}x{}, {} levels, {:.1} KB)",
            texture.name,
            texture.width(),
            texture.height(),
            texture.level_count(),
            texture.size_bytes() as f32 / 1024.0
        );
        self.textures.push(texture);
        self.invalidate();
        Ok(TextureHandle(self.textures.len() as u32 - 1))
    }

    pub fn add_material(&mut self, desc: impl Into<MaterialDesc>) -> SceneResult<MaterialHandle> {
        match desc.into() {
            MaterialDesc::Node(node) => {
                self.check_node(&node)?;
                self.push_material(Material::from_node(&node))
            }
            MaterialDesc::Principled(p) => {
                for tex in [
                    p.base_texture,
                    p.specular_texture,
                    p.metallic_texture,
                    p.roughness_texture,
                    p.emission_texture,
                    p.normal_map,
                ] {
                    self.check_texture(tex)?;
                }
                let principled = self.push_material(Material::from_principled(&p))?;
                if p.alpha >= 1.0 {
                    return Ok(principled);
                }
                // Partial coverage: blend with a clear node
                let clear = self.push_material(Material::from_node(&ShadingNodeDesc::transparent(Vec3::ONE)))?;
                let mix = ShadingNodeDesc::mix(p.alpha.clamp(0.0, 1.0), clear, principled);
                self.push_material(Material::from_node(&mix))
            }
        }
    }

    fn check_node(&self, node: &ShadingNodeDesc) -> SceneResult<()> {
        for tex in [node.base_texture, node.roughness_texture, node.normal_map] {
            self.check_texture(tex)?;
        }
        match (node.node, node.mix_materials) {
            (ShadingNode::Mix, None) => Err(SceneError::InvalidMaterial(
                "mix node without child materials".into(),
            )),
            (ShadingNode::Principled, _) => Err(SceneError::InvalidMaterial(
                "principled materials are added through PrincipledDesc".into(),
            )),
            (_, Some(children)) => children.iter().try_for_each(|&m| self.check_material(m)),
            _ => Ok(()),
        }
    }

    fn push_material(&mut self, material: Material) -> SceneResult<MaterialHandle> {
        if self.materials.len() >= MATERIAL_INDEX_BITS as usize {
            return Err(SceneError::LimitExceeded {
                kind: "materials",
                limit: MATERIAL_INDEX_BITS as usize,
            });
        }
        self.materials.push(material);
        self.invalidate();
        Ok(MaterialHandle(self.materials.len() as u32 - 1))
    }

    fn check_texture(&self, tex: Option<TextureHandle>) -> SceneResult<()> {
        match tex {
            Some(TextureHandle(i)) if i as usize >= self.textures.len() => Err(SceneError::InvalidHandle {
                kind: "texture",
                index: i,
            }),
            _ => Ok(()),
        }
    }

    fn check_material(&self, mat: MaterialHandle) -> SceneResult<()> {
        if mat.0 as usize >= self.materials.len() {
            return Err(SceneError::InvalidHandle {
                kind: "material",
                index: mat.0,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    pub fn add_mesh(&mut self, desc: &MeshDesc) -> SceneResult<MeshHandle> {
        for group in &desc.groups {
            self.check_material(group.front_material)?;
            if let Some(back) = group.back_material {
                self.check_material(back)?;
            }
        }
        let mesh = Mesh::from_desc(desc)?;
        log::debug!(
            "Added mesh: {} ({} vertices, {} triangles)",
            mesh.name,
            mesh.vertex_count(),
            mesh.triangle_count()
        );
        self.meshes.push(mesh);
        self.invalidate();
        Ok(MeshHandle(self.meshes.len() as u32 - 1))
    }

    pub fn add_mesh_instance(&mut self, mesh: MeshHandle, xform: Mat4) -> SceneResult<MeshInstanceHandle> {
        if mesh.0 as usize >= self.meshes.len() {
            return Err(SceneError::InvalidHandle {
                kind: "mesh",
                index: mesh.0,
            });
        }
        self.instances.push(InstanceDesc { mesh, xform });
        self.invalidate();
        Ok(MeshInstanceHandle(self.instances.len() as u32 - 1))
    }

    pub fn set_mesh_instance_transform(&mut self, mi: MeshInstanceHandle, xform: Mat4) -> SceneResult<()> {
        let instance = self
            .instances
            .get_mut(mi.0 as usize)
            .ok_or(SceneError::InvalidHandle {
                kind: "mesh instance",
                index: mi.0,
            })?;
        instance.xform = xform;
        self.invalidate();
        Ok(())
    }

    // =========================================================================
    // Lights, environment and cameras
    // =========================================================================

    pub fn add_light(&mut self, desc: &LightDesc) -> LightHandle {
        self.lights.push(desc.clone());
        self.invalidate();
        LightHandle(self.lights.len() as u32 - 1)
    }

    pub fn set_environment(&mut self, desc: &EnvironmentDesc) -> SceneResult<()> {
        self.check_texture(desc.env_map)?;
        self.check_texture(desc.back_map)?;
        self.environment = desc.clone();
        self.invalidate();
        Ok(())
    }

    /// Add a camera; the first camera becomes the current one.
    pub fn add_camera(&mut self, desc: CameraDesc) -> CameraHandle {
        self.cameras.push(desc);
        let handle = CameraHandle(self.cameras.len() as u32 - 1);
        if self.current_camera.is_none() {
            self.current_camera = Some(handle);
        }
        handle
    }

    pub fn get_camera(&self, cam: CameraHandle) -> SceneResult<&CameraDesc> {
        self.cameras.get(cam.0 as usize).ok_or(SceneError::InvalidHandle {
            kind: "camera",
            index: cam.0,
        })
    }

    pub fn set_camera(&mut self, cam: CameraHandle, desc: CameraDesc) -> SceneResult<()> {
        let slot = self.cameras.get_mut(cam.0 as usize).ok_or(SceneError::InvalidHandle {
            kind: "camera",
            index: cam.0,
        })?;
        *slot = desc;
        Ok(())
    }

    pub fn set_current_camera(&mut self, cam: CameraHandle) -> SceneResult<()> {
        self.get_camera(cam)?;
        self.current_camera = Some(cam);
        Ok(())
    }

    pub fn current_camera(&self) -> Option<&CameraDesc> {
        self.current_camera.and_then(|c| self.cameras.get(c.0 as usize))
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Flatten the scene into a snapshot and build the acceleration structures.
    pub fn finalize(&mut self) {
        let mut sc = SceneSnapshot::empty();
        sc.materials = self.materials.clone();
        sc.textures = self.textures.clone();

        let solid: Vec<bool> = (0..self.materials.len() as u32)
            .map(|i| !may_be_transparent(&self.materials, i, 0))
            .collect();

        // Bottom level, one tree per mesh
        for mesh in &self.meshes {
            let vert_offset = sc.vertices.len() as u32;
            sc.vertices.extend((0..mesh.vertex_count()).map(|i| Vertex {
                p: mesh.positions[i],
                n: mesh.normals[i],
                b: mesh.tangents[i],
                t: mesh.uvs[i],
            }));

            let tri_bounds: Vec<Aabb> = mesh
                .indices
                .chunks_exact(3)
                .map(|f| {
                    Aabb::from_point_cloud(&[
                        mesh.positions[f[0] as usize],
                        mesh.positions[f[1] as usize],
                        mesh.positions[f[2] as usize],
                    ])
                })
                .collect();

            let tris_index = sc.tris.len() as u32;
            let mut order = Vec::with_capacity(tri_bounds.len());
            let node_index = build_bvh(&tri_bounds, tris_index, &mut sc.nodes, &mut order);

            for &tri in &order {
                let face = &mesh.indices[tri as usize * 3..tri as usize * 3 + 3];
                sc.vtx_indices.extend(face.iter().map(|&i| i + vert_offset));
                sc.tris.push(TriAccel::new(
                    mesh.positions[face[0] as usize],
                    mesh.positions[face[1] as usize],
                    mesh.positions[face[2] as usize],
                ));
                let materials = mesh.group_of(tri as usize).map_or(TriMaterial::new(None, None), |g| {
                    let side = |m: u32| (m, solid[m as usize]);
                    TriMaterial::new(
                        Some(side(g.front_material.0)),
                        g.back_material.map(|b| side(b.0)),
                    )
                });
                sc.tri_materials.push(materials);
            }

            let wide_node_index = convert_to_wide(&sc.nodes, node_index, &mut sc.wide_nodes);
            sc.meshes.push(MeshData {
                node_index,
                wide_node_index,
                tris_index,
                tris_count: order.len() as u32,
                bounds: mesh.bounds,
            });
        }

        // Top level over instances of non-empty meshes
        let mut tlas_members = Vec::new();
        let mut tlas_bounds = Vec::new();
        for (i, inst) in self.instances.iter().enumerate() {
            let mesh = &sc.meshes[inst.mesh.0 as usize];
            let bounds = if mesh.tris_count > 0 {
                inst.xform.transform_aabb(&mesh.bounds)
            } else {
                Aabb::EMPTY
            };
            sc.transforms.push(Transform::new(inst.xform));
            sc.mesh_instances.push(MeshInstance {
                bounds,
                mesh_index: inst.mesh.0,
                tr_index: i as u32,
            });
            if mesh.tris_count > 0 {
                tlas_members.push(i as u32);
                tlas_bounds.push(bounds);
                sc.root_bounds = Aabb::surrounding(&sc.root_bounds, &bounds);
            }
        }
        let mut order = Vec::with_capacity(tlas_members.len());
        sc.root_node = build_bvh(&tlas_bounds, 0, &mut sc.nodes, &mut order);
        sc.mi_indices = order.iter().map(|&k| tlas_members[k as usize]).collect();
        sc.wide_root_node = convert_to_wide(&sc.nodes, sc.root_node, &mut sc.wide_nodes);

        // Lights
        sc.lights = self.lights.iter().map(Light::from_desc).collect();
        for (i, inst) in sc.mesh_instances.iter().enumerate() {
            let mesh = &sc.meshes[inst.mesh_index as usize];
            for tri in mesh.tris_index..mesh.tris_index + mesh.tris_count {
                let Some(mi) = sc.tri_materials[tri as usize].material(false) else {
                    continue;
                };
                let mat = &sc.materials[mi as usize];
                if mat.is_emissive() && mat.multiple_importance {
                    sc.lights.push(Light {
                        kind: LightKind::Triangle {
                            tri_index: tri,
                            xform_index: i as u32,
                        },
                        color: mat.emitted_radiance(),
                        cast_shadow: true,
                        visible: false,
                        sky_portal: false,
                    });
                }
            }
        }
        let env_texture = self
            .environment
            .env_map
            .and_then(|t| self.textures.get(t.0 as usize));
        sc.env = Environment::from_desc(&self.environment, env_texture);
        let has_portals = sc.lights.iter().any(|l| l.sky_portal);
        if sc.env.is_light() && !has_portals {
            sc.lights.push(Light {
                kind: LightKind::Env,
                color: sc.env.env_col,
                cast_shadow: true,
                visible: false,
                sky_portal: false,
            });
        }
        for (i, light) in sc.lights.iter().enumerate() {
            let i = i as u32;
            sc.li_indices.push(i);
            if light.sky_portal {
                sc.blocker_lights.push(i);
            }
            if light.visible && !matches!(light.kind, LightKind::Triangle { .. } | LightKind::Env) {
                sc.visible_lights.push(i);
            }
        }

        log::info!(
            "Finalized scene: {} meshes, {} instances, {} triangles, {} BVH nodes ({} wide), {} lights",
            sc.meshes.len(),
            sc.mesh_instances.len(),
            sc.tris.len(),
            sc.nodes.len(),
            sc.wide_nodes.len(),
            sc.lights.len()
        );
        if sc.root_node == INVALID_INDEX {
            log::debug!("Scene has no geometry, traversal will be skipped");
        }
        self.snapshot = Some(sc);
    }
}
