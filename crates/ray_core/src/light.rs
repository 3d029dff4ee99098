//! Light descriptions and their world-space snapshot form.

use std::f32::consts::PI;

use ray_math::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Point/sphere light, optionally restricted to a cone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphereLightDesc {
    pub color: Vec3,
    pub position: Vec3,
    pub radius: f32,
    pub cast_shadow: bool,
    pub visible: bool,
}

impl Default for SphereLightDesc {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            position: Vec3::ZERO,
            radius: 1.0,
            cast_shadow: true,
            visible: true,
        }
    }
}

/// Sphere light with a spot cone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotLightDesc {
    pub color: Vec3,
    pub position: Vec3,
    pub direction: Vec3,
    pub radius: f32,
    /// Full cone angle in degrees.
    pub spot_size: f32,
    /// Softness of the cone edge in [0, 1].
    pub spot_blend: f32,
    pub cast_shadow: bool,
    pub visible: bool,
}

impl Default for SpotLightDesc {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            position: Vec3::ZERO,
            direction: Vec3::new(0.0, -1.0, 0.0),
            radius: 1.0,
            spot_size: 45.0,
            spot_blend: 0.15,
            cast_shadow: true,
            visible: true,
        }
    }
}

/// Light at infinity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionalLightDesc {
    pub color: Vec3,
    /// Direction the light travels in.
    pub direction: Vec3,
    /// Apparent angular diameter in degrees, `0` for a hard sun.
    pub angle: f32,
    pub cast_shadow: bool,
}

impl Default for DirectionalLightDesc {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            direction: Vec3::new(0.0, -1.0, 0.0),
            angle: 0.0,
            cast_shadow: true,
        }
    }
}

/// Rectangle in the local XZ plane emitting toward local -Y.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectLightDesc {
    pub color: Vec3,
    pub width: f32,
    pub height: f32,
    pub transform: Mat4,
    pub sky_portal: bool,
    pub cast_shadow: bool,
    pub visible: bool,
}

impl Default for RectLightDesc {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            width: 1.0,
            height: 1.0,
            transform: Mat4::IDENTITY,
            sky_portal: false,
            cast_shadow: true,
            visible: true,
        }
    }
}

/// Ellipse in the local XZ plane emitting toward local -Y.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLightDesc {
    pub color: Vec3,
    pub size_x: f32,
    pub size_y: f32,
    pub transform: Mat4,
    pub sky_portal: bool,
    pub cast_shadow: bool,
    pub visible: bool,
}

impl Default for DiskLightDesc {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            size_x: 1.0,
            size_y: 1.0,
            transform: Mat4::IDENTITY,
            sky_portal: false,
            cast_shadow: true,
            visible: true,
        }
    }
}

/// Cylinder along local Z.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineLightDesc {
    pub color: Vec3,
    pub radius: f32,
    pub height: f32,
    pub transform: Mat4,
    pub cast_shadow: bool,
    pub visible: bool,
}

impl Default for LineLightDesc {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            radius: 0.05,
            height: 1.0,
            transform: Mat4::IDENTITY,
            cast_shadow: true,
            visible: true,
        }
    }
}

/// Any light accepted by [`Scene::add_light`](crate::Scene::add_light).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LightDesc {
    Sphere(SphereLightDesc),
    Spot(SpotLightDesc),
    Directional(DirectionalLightDesc),
    Rect(RectLightDesc),
    Disk(DiskLightDesc),
    Line(LineLightDesc),
}

/// World-space light shape.
#[derive(Clone, Debug, PartialEq)]
pub enum LightKind {
    Sphere {
        pos: Vec3,
        radius: f32,
        area: f32,
        dir: Vec3,
        /// Half cone angle in radians (`PI` for an omni light).
        spot: f32,
        blend: f32,
    },
    Directional {
        dir: Vec3,
        /// Half angle in radians.
        angle: f32,
    },
    Rect {
        pos: Vec3,
        u: Vec3,
        v: Vec3,
        area: f32,
    },
    Disk {
        pos: Vec3,
        u: Vec3,
        v: Vec3,
        area: f32,
    },
    Line {
        pos: Vec3,
        /// Unit axis of the cylinder.
        axis: Vec3,
        radius: f32,
        height: f32,
        area: f32,
    },
    /// Emissive mesh triangle; `tri_index` is global, `xform_index` places it.
    Triangle { tri_index: u32, xform_index: u32 },
    Env,
}

/// A light in the snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub cast_shadow: bool,
    pub visible: bool,
    pub sky_portal: bool,
}

impl Light {
    /// The world-space form of a light description.
    pub fn from_desc(desc: &LightDesc) -> Self {
        match desc {
            LightDesc::Sphere(d) => Self {
                kind: LightKind::Sphere {
                    pos: d.position,
                    radius: d.radius,
                    area: 4.0 * PI * d.radius * d.radius,
                    dir: Vec3::new(0.0, -1.0, 0.0),
                    spot: PI,
                    blend: 0.0,
                },
                color: d.color,
                cast_shadow: d.cast_shadow,
                visible: d.visible && d.radius > 0.0,
                sky_portal: false,
            },
            LightDesc::Spot(d) => Self {
                kind: LightKind::Sphere {
                    pos: d.position,
                    radius: d.radius,
                    area: 4.0 * PI * d.radius * d.radius,
                    dir: d.direction.normalize_or_zero(),
                    spot: 0.5 * PI * d.spot_size / 180.0,
                    blend: d.spot_blend * d.spot_blend,
                },
                color: d.color,
                cast_shadow: d.cast_shadow,
                visible: d.visible && d.radius > 0.0,
                sky_portal: false,
            },
            LightDesc::Directional(d) => Self {
                kind: LightKind::Directional {
                    dir: -d.direction.normalize_or_zero(),
                    angle: d.angle * PI / 360.0,
                },
                color: d.color,
                cast_shadow: d.cast_shadow,
                visible: d.angle > 0.0,
                sky_portal: false,
            },
            LightDesc::Rect(d) => {
                let u = d.transform.transform_vector3(Vec3::X * d.width);
                let v = d.transform.transform_vector3(Vec3::Z * d.height);
                Self {
                    kind: LightKind::Rect {
                        pos: d.transform.transform_point3(Vec3::ZERO),
                        u,
                        v,
                        area: u.cross(v).length(),
                    },
                    color: d.color,
                    cast_shadow: d.cast_shadow,
                    visible: d.visible,
                    sky_portal: d.sky_portal,
                }
            }
            LightDesc::Disk(d) => {
                let u = d.transform.transform_vector3(Vec3::X * d.size_x);
                let v = d.transform.transform_vector3(Vec3::Z * d.size_y);
                Self {
                    kind: LightKind::Disk {
                        pos: d.transform.transform_point3(Vec3::ZERO),
                        u,
                        v,
                        area: 0.25 * PI * u.cross(v).length(),
                    },
                    color: d.color,
                    cast_shadow: d.cast_shadow,
                    visible: d.visible,
                    sky_portal: d.sky_portal,
                }
            }
            LightDesc::Line(d) => {
                let axis = d.transform.transform_vector3(Vec3::Z).normalize_or_zero();
                let scale = d.transform.transform_vector3(Vec3::Z).length();
                let height = d.height * scale;
                Self {
                    kind: LightKind::Line {
                        pos: d.transform.transform_point3(Vec3::ZERO),
                        axis,
                        radius: d.radius,
                        height,
                        area: 2.0 * PI * d.radius * height,
                    },
                    color: d.color,
                    cast_shadow: d.cast_shadow,
                    visible: d.visible,
                    sky_portal: false,
                }
            }
        }
    }

    /// Emitting normal of planar lights.
    pub fn planar_normal(u: Vec3, v: Vec3) -> Vec3 {
        u.cross(v).normalize_or_zero()
    }
}
