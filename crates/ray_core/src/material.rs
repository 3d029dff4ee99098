//! Material descriptions and their flattened snapshot form.
//!
//! Two description types exist: [`ShadingNodeDesc`] for the single-lobe nodes
//! (diffuse, glossy, refractive, emissive, mix, transparent) and
//! [`PrincipledDesc`] for the layered principled material.

use ray_math::Vec3;
use serde::{Deserialize, Serialize};

use crate::scene::{MaterialHandle, TextureHandle};

/// Shading node kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadingNode {
    Diffuse,
    Glossy,
    Refractive,
    Emissive,
    Mix,
    Transparent,
    Principled,
}

/// Description of a single shading node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadingNodeDesc {
    pub node: ShadingNode,
    pub base_color: Vec3,
    pub base_texture: Option<TextureHandle>,
    pub roughness: f32,
    pub roughness_texture: Option<TextureHandle>,
    /// Emission strength (emissive), or mix factor (mix).
    pub strength: f32,
    /// Mix nodes use it for a fresnel-driven factor when non-zero.
    pub ior: f32,
    /// Glossy tint toward the base color.
    pub tint: f32,
    pub mix_materials: Option<[MaterialHandle; 2]>,
    /// Mix node adds both children instead of blending them.
    pub mix_add: bool,
    /// Emissive surfaces become importance-sampled lights.
    pub multiple_importance: bool,
    pub normal_map: Option<TextureHandle>,
    pub normal_map_intensity: f32,
}

impl Default for ShadingNodeDesc {
    fn default() -> Self {
        Self {
            node: ShadingNode::Diffuse,
            base_color: Vec3::splat(0.5),
            base_texture: None,
            roughness: 0.0,
            roughness_texture: None,
            strength: 1.0,
            ior: 1.0,
            tint: 0.0,
            mix_materials: None,
            mix_add: false,
            multiple_importance: false,
            normal_map: None,
            normal_map_intensity: 1.0,
        }
    }
}

impl ShadingNodeDesc {
    pub fn diffuse(base_color: Vec3) -> Self {
        Self {
            node: ShadingNode::Diffuse,
            base_color,
            ..Default::default()
        }
    }

    pub fn glossy(base_color: Vec3, roughness: f32) -> Self {
        Self {
            node: ShadingNode::Glossy,
            base_color,
            roughness,
            ..Default::default()
        }
    }

    pub fn refractive(base_color: Vec3, roughness: f32, ior: f32) -> Self {
        Self {
            node: ShadingNode::Refractive,
            base_color,
            roughness,
            ior,
            ..Default::default()
        }
    }

    pub fn emissive(base_color: Vec3, strength: f32) -> Self {
        Self {
            node: ShadingNode::Emissive,
            base_color,
            strength,
            ..Default::default()
        }
    }

    pub fn transparent(base_color: Vec3) -> Self {
        Self {
            node: ShadingNode::Transparent,
            base_color,
            ..Default::default()
        }
    }

    /// Blend two materials, `factor` is the probability of picking the second one.
    pub fn mix(factor: f32, first: MaterialHandle, second: MaterialHandle) -> Self {
        Self {
            node: ShadingNode::Mix,
            strength: factor,
            ior: 0.0,
            mix_materials: Some([first, second]),
            ..Default::default()
        }
    }

    pub fn with_multiple_importance(mut self, enabled: bool) -> Self {
        self.multiple_importance = enabled;
        self
    }

    pub fn with_base_texture(mut self, texture: TextureHandle) -> Self {
        self.base_texture = Some(texture);
        self
    }
}

/// Layered principled material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrincipledDesc {
    pub base_color: Vec3,
    pub base_texture: Option<TextureHandle>,
    pub specular: f32,
    pub specular_texture: Option<TextureHandle>,
    pub specular_tint: f32,
    pub metallic: f32,
    pub metallic_texture: Option<TextureHandle>,
    pub roughness: f32,
    pub roughness_texture: Option<TextureHandle>,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_roughness: f32,
    pub ior: f32,
    pub transmission: f32,
    pub transmission_roughness: f32,
    pub emission_color: Vec3,
    pub emission_strength: f32,
    pub emission_texture: Option<TextureHandle>,
    /// Below one the material is mixed with a transparent node.
    pub alpha: f32,
    pub normal_map: Option<TextureHandle>,
    pub normal_map_intensity: f32,
}

impl Default for PrincipledDesc {
    fn default() -> Self {
        Self {
            base_color: Vec3::ONE,
            base_texture: None,
            specular: 0.5,
            specular_texture: None,
            specular_tint: 0.0,
            metallic: 0.0,
            metallic_texture: None,
            roughness: 0.5,
            roughness_texture: None,
            sheen: 0.0,
            sheen_tint: 0.5,
            clearcoat: 0.0,
            clearcoat_roughness: 0.0,
            ior: 1.45,
            transmission: 0.0,
            transmission_roughness: 0.0,
            emission_color: Vec3::ZERO,
            emission_strength: 0.0,
            emission_texture: None,
            alpha: 1.0,
            normal_map: None,
            normal_map_intensity: 1.0,
        }
    }
}

impl PrincipledDesc {
    /// Perfect or rough conductor.
    pub fn metal(base_color: Vec3, roughness: f32) -> Self {
        Self {
            base_color,
            metallic: 1.0,
            roughness,
            ..Default::default()
        }
    }

    pub fn with_emission(mut self, color: Vec3, strength: f32) -> Self {
        self.emission_color = color;
        self.emission_strength = strength;
        self
    }
}

/// Any material description accepted by [`Scene::add_material`](crate::Scene::add_material).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaterialDesc {
    Node(ShadingNodeDesc),
    Principled(PrincipledDesc),
}

impl From<ShadingNodeDesc> for MaterialDesc {
    fn from(desc: ShadingNodeDesc) -> Self {
        MaterialDesc::Node(desc)
    }
}

impl From<PrincipledDesc> for MaterialDesc {
    fn from(desc: PrincipledDesc) -> Self {
        MaterialDesc::Principled(desc)
    }
}

/// Flattened material as seen by the shader. Texture and material references
/// are plain indices into the snapshot tables.
#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub node: ShadingNode,
    pub base_color: Vec3,
    pub base_texture: Option<u32>,
    pub roughness: f32,
    pub roughness_texture: Option<u32>,
    pub metallic: f32,
    pub metallic_texture: Option<u32>,
    pub specular: f32,
    pub specular_texture: Option<u32>,
    pub specular_tint: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_roughness: f32,
    pub transmission: f32,
    pub transmission_roughness: f32,
    pub ior: f32,
    pub strength: f32,
    pub tint: f32,
    pub emission_color: Vec3,
    pub emission_texture: Option<u32>,
    pub mix_materials: Option<[u32; 2]>,
    pub mix_add: bool,
    pub multiple_importance: bool,
    pub normal_map: Option<u32>,
    pub normal_map_intensity: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            node: ShadingNode::Diffuse,
            base_color: Vec3::splat(0.5),
            base_texture: None,
            roughness: 0.0,
            roughness_texture: None,
            metallic: 0.0,
            metallic_texture: None,
            specular: 0.0,
            specular_texture: None,
            specular_tint: 0.0,
            sheen: 0.0,
            sheen_tint: 0.0,
            clearcoat: 0.0,
            clearcoat_roughness: 0.0,
            transmission: 0.0,
            transmission_roughness: 0.0,
            ior: 1.0,
            strength: 1.0,
            tint: 0.0,
            emission_color: Vec3::ZERO,
            emission_texture: None,
            mix_materials: None,
            mix_add: false,
            multiple_importance: false,
            normal_map: None,
            normal_map_intensity: 1.0,
        }
    }
}

impl Material {
    pub(crate) fn from_node(desc: &ShadingNodeDesc) -> Self {
        Self {
            node: desc.node,
            base_color: desc.base_color,
            base_texture: desc.base_texture.map(|t| t.0),
            roughness: desc.roughness,
            roughness_texture: desc.roughness_texture.map(|t| t.0),
            ior: desc.ior,
            strength: desc.strength,
            tint: desc.tint,
            mix_materials: desc.mix_materials.map(|[a, b]| [a.0, b.0]),
            mix_add: desc.mix_add,
            multiple_importance: desc.multiple_importance,
            normal_map: desc.normal_map.map(|t| t.0),
            normal_map_intensity: desc.normal_map_intensity,
            ..Default::default()
        }
    }

    pub(crate) fn from_principled(desc: &PrincipledDesc) -> Self {
        Self {
            node: ShadingNode::Principled,
            base_color: desc.base_color,
            base_texture: desc.base_texture.map(|t| t.0),
            roughness: desc.roughness,
            roughness_texture: desc.roughness_texture.map(|t| t.0),
            metallic: desc.metallic,
            metallic_texture: desc.metallic_texture.map(|t| t.0),
            specular: desc.specular,
            specular_texture: desc.specular_texture.map(|t| t.0),
            specular_tint: desc.specular_tint,
            sheen: desc.sheen,
            sheen_tint: desc.sheen_tint,
            clearcoat: desc.clearcoat,
            clearcoat_roughness: desc.clearcoat_roughness,
            transmission: desc.transmission,
            transmission_roughness: desc.transmission_roughness,
            ior: desc.ior,
            strength: desc.emission_strength,
            emission_color: desc.emission_color,
            emission_texture: desc.emission_texture.map(|t| t.0),
            multiple_importance: desc.emission_strength > 0.0,
            normal_map: desc.normal_map.map(|t| t.0),
            normal_map_intensity: desc.normal_map_intensity,
            ..Default::default()
        }
    }

    /// Whether this material emits light on its own (mix children excluded).
    pub fn is_emissive(&self) -> bool {
        match self.node {
            ShadingNode::Emissive => self.strength > 0.0,
            ShadingNode::Principled => self.strength > 0.0 && self.emission_color != Vec3::ZERO,
            _ => false,
        }
    }

    /// Radiance emitted by the untextured material.
    pub fn emitted_radiance(&self) -> Vec3 {
        match self.node {
            ShadingNode::Emissive => self.base_color * self.strength,
            ShadingNode::Principled => self.emission_color * self.strength,
            _ => Vec3::ZERO,
        }
    }
}

/// Material indices packed per triangle.
pub const MATERIAL_SOLID_BIT: u16 = 0x8000;
pub const MATERIAL_INDEX_BITS: u16 = 0x3fff;
pub const NO_MATERIAL: u16 = 0xffff;

/// Front/back material of a triangle plus a "solid" flag per side.
///
/// A side is solid when no transparent node is reachable through its mix
/// tree, which lets shadow and transparency loops stop without shading.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TriMaterial {
    front_mi: u16,
    back_mi: u16,
}

impl TriMaterial {
    pub fn new(front: Option<(u32, bool)>, back: Option<(u32, bool)>) -> Self {
        let pack = |side: Option<(u32, bool)>| match side {
            Some((index, solid)) => {
                (index as u16 & MATERIAL_INDEX_BITS) | if solid { MATERIAL_SOLID_BIT } else { 0 }
            }
            None => NO_MATERIAL,
        };
        Self {
            front_mi: pack(front),
            back_mi: pack(back),
        }
    }

    #[inline]
    fn side(&self, backfacing: bool) -> u16 {
        if backfacing {
            self.back_mi
        } else {
            self.front_mi
        }
    }

    /// Material index of the side that was hit, `None` when that side has no material.
    #[inline]
    pub fn material(&self, backfacing: bool) -> Option<u32> {
        match self.side(backfacing) {
            NO_MATERIAL => None,
            mi => Some((mi & MATERIAL_INDEX_BITS) as u32),
        }
    }

    /// A side without material counts as solid (it shades black).
    #[inline]
    pub fn is_solid(&self, backfacing: bool) -> bool {
        self.side(backfacing) & MATERIAL_SOLID_BIT != 0
    }
}
