//! Environment lighting and its importance-sampling quad-tree.
//!
//! Environment maps are lat-long. `v = 0` is straight up (+Y), `u` wraps
//! around the vertical axis and is offset by the map rotation.

use std::f32::consts::PI;

use ray_math::{luminance, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::scene::TextureHandle;
use crate::texture::Texture;

/// Environment description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentDesc {
    /// Radiance seen by bounced rays.
    pub env_col: Vec3,
    pub env_map: Option<TextureHandle>,
    /// Rotation around +Y in radians.
    pub env_map_rotation: f32,
    /// Radiance seen by camera rays.
    pub back_col: Vec3,
    pub back_map: Option<TextureHandle>,
    pub back_map_rotation: f32,
    /// Sample the environment as a light and weight misses with MIS.
    pub multiple_importance: bool,
}

impl Default for EnvironmentDesc {
    fn default() -> Self {
        Self {
            env_col: Vec3::ZERO,
            env_map: None,
            env_map_rotation: 0.0,
            back_col: Vec3::ZERO,
            back_map: None,
            back_map_rotation: 0.0,
            multiple_importance: true,
        }
    }
}

impl EnvironmentDesc {
    /// Same constant color for camera and bounced rays.
    pub fn uniform(color: Vec3) -> Self {
        Self {
            env_col: color,
            back_col: color,
            ..Default::default()
        }
    }
}

/// Snapshot form of the environment.
#[derive(Clone, Debug)]
pub struct Environment {
    pub env_col: Vec3,
    pub env_map: Option<u32>,
    pub env_map_rotation: f32,
    pub back_col: Vec3,
    pub back_map: Option<u32>,
    pub back_map_rotation: f32,
    pub multiple_importance: bool,
    pub qtree: Option<EnvQTree>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::from_desc(&EnvironmentDesc::default(), None)
    }
}

impl Environment {
    /// Build the snapshot form; `env_texture` is the resolved `env_map`.
    pub fn from_desc(desc: &EnvironmentDesc, env_texture: Option<&Texture>) -> Self {
        let qtree = match env_texture {
            Some(tex) if desc.multiple_importance => EnvQTree::build(tex, desc.env_col)
                .map(|q| q.with_rotation(desc.env_map_rotation)),
            _ => None,
        };
        Self {
            env_col: desc.env_col,
            env_map: desc.env_map.map(|t| t.0),
            env_map_rotation: desc.env_map_rotation,
            back_col: desc.back_col,
            back_map: desc.back_map.map(|t| t.0),
            back_map_rotation: desc.back_map_rotation,
            multiple_importance: desc.multiple_importance,
            qtree,
        }
    }

    /// True when sampling the environment as a light can contribute.
    pub fn is_light(&self) -> bool {
        self.multiple_importance && self.env_col.max_element() > 0.0
    }
}

/// Lat-long coordinates of a world direction.
pub fn dir_to_latlong(dir: Vec3, rotation: f32) -> Vec2 {
    let theta = dir.y.clamp(-1.0, 1.0).acos();
    let phi = dir.z.atan2(dir.x);
    let u = ray_math::fract(0.5 + (phi + rotation) / (2.0 * PI));
    Vec2::new(u, theta / PI)
}

/// Inverse of [`dir_to_latlong`].
pub fn latlong_to_dir(uv: Vec2, rotation: f32) -> Vec3 {
    let phi = (uv.x - 0.5) * 2.0 * PI - rotation;
    let theta = uv.y * PI;
    let (sin_theta, cos_theta) = theta.sin_cos();
    let (sin_phi, cos_phi) = phi.sin_cos();
    Vec3::new(sin_theta * cos_phi, cos_theta, sin_theta * sin_phi)
}

/// Resolution of the finest quad-tree level.
const QTREE_MAX_RES: u32 = 64;

/// Luminance pyramid over lat-long space.
///
/// Each level halves the resolution; a cell holds the sum of its four
/// children. Sampling walks from the root picking children by weight, then
/// jitters uniformly inside the leaf cell.
#[derive(Clone, Debug)]
pub struct EnvQTree {
    /// `levels[0]` is the finest `res x res` grid, the last level is 1x1.
    levels: Vec<Vec<f32>>,
    res: u32,
    rotation: f32,
}

impl EnvQTree {
    /// `None` when the map carries no energy.
    pub fn build(tex: &Texture, tint: Vec3) -> Option<Self> {
        let res = tex
            .width()
            .max(tex.height())
            .next_power_of_two()
            .clamp(1, QTREE_MAX_RES);

        let mut finest = vec![0.0; (res * res) as usize];
        const SUB: u32 = 4;
        for y in 0..res {
            for x in 0..res {
                let mut sum = 0.0;
                for sy in 0..SUB {
                    for sx in 0..SUB {
                        let uv = Vec2::new(
                            (x as f32 + (sx as f32 + 0.5) / SUB as f32) / res as f32,
                            (y as f32 + (sy as f32 + 0.5) / SUB as f32) / res as f32,
                        );
                        let c = tex.sample(uv, 0.0).truncate() * tint;
                        sum += luminance(c).max(0.0) * (uv.y * PI).sin();
                    }
                }
                finest[(y * res + x) as usize] = sum / (SUB * SUB) as f32;
            }
        }

        let mut levels = vec![finest];
        let mut level_res = res;
        while level_res > 1 {
            let prev = levels.last()?;
            let next_res = level_res / 2;
            let mut next = vec![0.0; (next_res * next_res) as usize];
            for y in 0..next_res {
                for x in 0..next_res {
                    let at = |cx: u32, cy: u32| prev[(cy * level_res + cx) as usize];
                    next[(y * next_res + x) as usize] = at(2 * x, 2 * y)
                        + at(2 * x + 1, 2 * y)
                        + at(2 * x, 2 * y + 1)
                        + at(2 * x + 1, 2 * y + 1);
                }
            }
            levels.push(next);
            level_res = next_res;
        }

        let total = *levels.last()?.first()?;
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        Some(Self {
            levels,
            res,
            rotation: 0.0,
        })
    }

    /// Rotation applied when mapping directions (the env map's rotation).
    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }

    fn total(&self) -> f32 {
        self.levels.last().and_then(|l| l.first()).copied().unwrap_or(0.0)
    }

    /// Sample a direction from two uniform numbers. Returns `(dir, pdf)` with
    /// the pdf in solid angle.
    pub fn sample(&self, mut r1: f32, mut r2: f32) -> (Vec3, f32) {
        let (mut x, mut y) = (0u32, 0u32);
        for lvl in (0..self.levels.len() - 1).rev() {
            let level = &self.levels[lvl];
            let level_res = self.res >> lvl;
            x *= 2;
            y *= 2;
            let at = |cx: u32, cy: u32| level[(cy * level_res + cx) as usize];
            let left = at(x, y) + at(x, y + 1);
            let right = at(x + 1, y) + at(x + 1, y + 1);
            let total = left + right;
            if total <= 0.0 {
                break;
            }
            let p_left = left / total;
            let (top, bottom) = if r1 < p_left {
                r1 /= p_left;
                (at(x, y), at(x, y + 1))
            } else {
                r1 = (r1 - p_left) / (1.0 - p_left);
                x += 1;
                (at(x, y), at(x, y + 1))
            };
            let p_top = top / (top + bottom);
            if r2 < p_top {
                r2 /= p_top;
            } else {
                r2 = (r2 - p_top) / (1.0 - p_top);
                y += 1;
            }
            r1 = r1.clamp(0.0, 0.999_999);
            r2 = r2.clamp(0.0, 0.999_999);
        }

        let uv = Vec2::new(
            (x as f32 + r1) / self.res as f32,
            (y as f32 + r2) / self.res as f32,
        );
        let dir = latlong_to_dir(uv, self.rotation);
        (dir, self.pdf_uv(x, y, uv.y))
    }

    /// Solid-angle pdf of sampling `dir`.
    pub fn pdf(&self, dir: Vec3) -> f32 {
        let uv = dir_to_latlong(dir, self.rotation);
        let x = ((uv.x * self.res as f32) as u32).min(self.res - 1);
        let y = ((uv.y * self.res as f32) as u32).min(self.res - 1);
        self.pdf_uv(x, y, uv.y)
    }

    fn pdf_uv(&self, x: u32, y: u32, v: f32) -> f32 {
        let sin_theta = (v * PI).sin();
        if sin_theta <= 0.0 {
            return 0.0;
        }
        let value = self.levels[0][(y * self.res + x) as usize];
        let pdf_uv = value / self.total() * (self.res * self.res) as f32;
        pdf_uv / (2.0 * PI * PI * sin_theta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::{TexelData, TextureDesc};
    use ray_math::Vec4;

    fn bright_spot_map() -> Texture {
        // 8x4 black map with one bright texel
        let mut data = vec![0.0f32; 8 * 4 * 4];
        for px in data.chunks_exact_mut(4) {
            px.copy_from_slice(&[0.01, 0.01, 0.01, 1.0]);
        }
        let idx = (1 * 8 + 5) * 4;
        data[idx..idx + 4].copy_from_slice(&[100.0, 100.0, 100.0, 1.0]);
        Texture::from_desc(&TextureDesc {
            name: "spot".into(),
            width: 8,
            height: 4,
            data: TexelData::Rgba32f(data),
            is_srgb: false,
            generate_mipmaps: false,
        })
        .unwrap()
    }

    #[test]
    fn test_latlong_round_trip() {
        for dir in [
            Vec3::new(0.3, 0.5, -0.8).normalize(),
            Vec3::new(-1.0, 0.1, 0.2).normalize(),
        ] {
            let uv = dir_to_latlong(dir, 0.7);
            let back = latlong_to_dir(uv, 0.7);
            assert!((dir - back).length() < 1e-4);
        }
        // Straight up maps to the top row
        assert!(dir_to_latlong(Vec3::Y, 0.0).y < 1e-4);
    }

    #[test]
    fn test_qtree_pdf_matches_sample() {
        let qtree = EnvQTree::build(&bright_spot_map(), Vec3::ONE).unwrap();
        for i in 0..16 {
            let r1 = (i as f32 + 0.5) / 16.0;
            let r2 = ((i * 7) % 16) as f32 / 16.0 + 0.01;
            let (dir, pdf) = qtree.sample(r1, r2);
            assert!(pdf > 0.0);
            assert!((qtree.pdf(dir) - pdf).abs() <= 1e-2 * pdf);
        }
    }

    #[test]
    fn test_qtree_prefers_bright_texel() {
        let qtree = EnvQTree::build(&bright_spot_map(), Vec3::ONE).unwrap();
        let bright = latlong_to_dir(Vec2::new(5.5 / 8.0, 1.5 / 4.0), 0.0);
        let dim = latlong_to_dir(Vec2::new(1.5 / 8.0, 2.5 / 4.0), 0.0);
        assert!(qtree.pdf(bright) > 50.0 * qtree.pdf(dim));
    }

    #[test]
    fn test_black_map_has_no_qtree() {
        let tex = Texture::from_desc(&TextureDesc::solid("black", Vec4::new(0.0, 0.0, 0.0, 1.0))).unwrap();
        assert!(EnvQTree::build(&tex, Vec3::ONE).is_none());
    }
}
