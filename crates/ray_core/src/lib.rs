//! Scene description for the ray renderer.
//!
//! - [`Scene`] builder with typed handles for meshes, materials, textures,
//!   lights, cameras and mesh instances
//! - [`SceneSnapshot`], the flattened read-only form produced by
//!   [`Scene::finalize`]
//! - Binary and 8-wide BVHs shared by the top and bottom level
//! - Environment importance sampling ([`EnvQTree`])

pub mod bvh;
pub mod camera;
pub mod environment;
pub mod error;
pub mod light;
pub mod material;
pub mod mesh;
pub mod scene;
pub mod snapshot;
pub mod texture;

pub use bvh::{BvhNode, WideBvhNode, INVALID_INDEX};
pub use camera::{CameraDesc, CameraKind, DisplayType, PassDesc, PixelFilter};
pub use environment::{dir_to_latlong, latlong_to_dir, EnvQTree, Environment, EnvironmentDesc};
pub use error::{SceneError, SceneResult};
pub use light::{
    DirectionalLightDesc, DiskLightDesc, Light, LightDesc, LightKind, LineLightDesc, RectLightDesc,
    SphereLightDesc, SpotLightDesc,
};
pub use material::{Material, MaterialDesc, PrincipledDesc, ShadingNode, ShadingNodeDesc, TriMaterial};
pub use mesh::{quad_positions, Mesh, MeshDesc, MeshGroup};
pub use scene::{
    CameraHandle, LightHandle, MaterialHandle, MeshHandle, MeshInstanceHandle, Scene, SceneBase,
    TextureHandle, CPU_BACKEND,
};
pub use snapshot::{MeshData, MeshInstance, SceneSnapshot, TriAccel, Transform, Vertex};
pub use texture::{MipLevel, TexelData, Texture, TextureDesc};
