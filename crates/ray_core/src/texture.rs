//! Textures with mip chains.
//!
//! Texels are converted to linear RGBA floats on upload. Sampling is bilinear
//! on a single mip level chosen by the caller (ray-cone LOD in the shader).
//! Texture space has `(0, 0)` at the top-left texel and wraps in both axes.

use ray_math::{Vec2, Vec4};
use serde::{Deserialize, Serialize};

use crate::error::{SceneError, SceneResult};

/// Raw texel storage accepted by [`TextureDesc`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "snake_case")]
pub enum TexelData {
    Rgba8(Vec<u8>),
    Rgb8(Vec<u8>),
    R8(Vec<u8>),
    Rgba32f(Vec<f32>),
}

impl TexelData {
    fn channels(&self) -> usize {
        match self {
            TexelData::Rgba8(_) | TexelData::Rgba32f(_) => 4,
            TexelData::Rgb8(_) => 3,
            TexelData::R8(_) => 1,
        }
    }

    fn len(&self) -> usize {
        match self {
            TexelData::Rgba8(d) | TexelData::Rgb8(d) | TexelData::R8(d) => d.len(),
            TexelData::Rgba32f(d) => d.len(),
        }
    }
}

/// Texture upload description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub data: TexelData,
    /// 8-bit color data is sRGB encoded and gets decoded to linear.
    #[serde(default)]
    pub is_srgb: bool,
    #[serde(default = "default_true")]
    pub generate_mipmaps: bool,
}

fn default_true() -> bool {
    true
}

impl TextureDesc {
    /// Wrap an already decoded RGBA8 image.
    pub fn from_rgba_image(name: impl Into<String>, img: &image::RgbaImage, is_srgb: bool) -> Self {
        let (width, height) = img.dimensions();
        Self {
            name: name.into(),
            width,
            height,
            data: TexelData::Rgba8(img.as_raw().clone()),
            is_srgb,
            generate_mipmaps: true,
        }
    }

    /// A single-texel texture of one color.
    pub fn solid(name: impl Into<String>, color: Vec4) -> Self {
        Self {
            name: name.into(),
            width: 1,
            height: 1,
            data: TexelData::Rgba32f(color.to_array().to_vec()),
            is_srgb: false,
            generate_mipmaps: false,
        }
    }
}

/// One level of a mip chain.
#[derive(Clone, Debug)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Vec4>,
}

impl MipLevel {
    #[inline]
    fn fetch(&self, x: i64, y: i64) -> Vec4 {
        let x = x.rem_euclid(self.width as i64) as usize;
        let y = y.rem_euclid(self.height as i64) as usize;
        self.pixels[y * self.width as usize + x]
    }
}

/// A texture ready for sampling.
#[derive(Clone, Debug)]
pub struct Texture {
    pub name: String,
    levels: Vec<MipLevel>,
}

impl Texture {
    /// Validate and convert a texture description.
    pub fn from_desc(desc: &TextureDesc) -> SceneResult<Self> {
        let invalid = |reason: String| SceneError::InvalidTexture {
            name: desc.name.clone(),
            reason,
        };
        if desc.width == 0 || desc.height == 0 {
            return Err(invalid(format!("zero size {}x{}", desc.width, desc.height)));
        }
        let texel_count = desc.width as usize * desc.height as usize;
        let expected = texel_count * desc.data.channels();
        if desc.data.len() != expected {
            return Err(invalid(format!(
                "expected {} values, got {}",
                expected,
                desc.data.len()
            )));
        }

        let decode = |v: u8| {
            if desc.is_srgb {
                srgb_to_linear(v)
            } else {
                v as f32 / 255.0
            }
        };
        let pixels: Vec<Vec4> = match &desc.data {
            TexelData::Rgba8(d) => d
                .chunks_exact(4)
                .map(|p| Vec4::new(decode(p[0]), decode(p[1]), decode(p[2]), p[3] as f32 / 255.0))
                .collect(),
            TexelData::Rgb8(d) => d
                .chunks_exact(3)
                .map(|p| Vec4::new(decode(p[0]), decode(p[1]), decode(p[2]), 1.0))
                .collect(),
            TexelData::R8(d) => d
                .iter()
                .map(|&v| {
                    let c = v as f32 / 255.0;
                    Vec4::new(c, c, c, 1.0)
                })
                .collect(),
            TexelData::Rgba32f(d) => d
                .chunks_exact(4)
                .map(|p| Vec4::new(p[0], p[1], p[2], p[3]))
                .collect(),
        };

        let mut levels = vec![MipLevel {
            width: desc.width,
            height: desc.height,
            pixels,
        }];
        if desc.generate_mipmaps {
            while let Some(next) = levels.last().and_then(downsample) {
                levels.push(next);
            }
        }

        Ok(Self {
            name: desc.name.clone(),
            levels,
        })
    }

    pub fn width(&self) -> u32 {
        self.levels[0].width
    }

    pub fn height(&self) -> u32 {
        self.levels[0].height
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, lod: usize) -> &MipLevel {
        &self.levels[lod.min(self.levels.len() - 1)]
    }

    /// Bilinear sample of mip level `lod` (fractional LODs are floored).
    pub fn sample(&self, uv: Vec2, lod: f32) -> Vec4 {
        let level = self.level(lod.max(0.0) as usize);

        let x = uv.x * level.width as f32 - 0.5;
        let y = uv.y * level.height as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let p00 = level.fetch(x0, y0);
        let p10 = level.fetch(x0 + 1, y0);
        let p01 = level.fetch(x0, y0 + 1);
        let p11 = level.fetch(x0 + 1, y0 + 1);

        let top = p00.lerp(p10, fx);
        let bottom = p01.lerp(p11, fx);
        top.lerp(bottom, fy)
    }

    /// Get total size in bytes (approximate).
    pub fn size_bytes(&self) -> usize {
        self.levels
            .iter()
            .map(|l| l.pixels.len() * std::mem::size_of::<Vec4>())
            .sum()
    }
}

/// 2x2 box filter, `None` once the level is 1x1.
fn downsample(src: &MipLevel) -> Option<MipLevel> {
    if src.width == 1 && src.height == 1 {
        return None;
    }
    let width = (src.width / 2).max(1);
    let height = (src.height / 2).max(1);
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let sx = (x * 2).min(src.width as i64 - 1);
            let sy = (y * 2).min(src.height as i64 - 1);
            let sx1 = (sx + 1).min(src.width as i64 - 1);
            let sy1 = (sy + 1).min(src.height as i64 - 1);
            let sum = src.fetch(sx, sy) + src.fetch(sx1, sy) + src.fetch(sx, sy1) + src.fetch(sx1, sy1);
            pixels.push(sum * 0.25);
        }
    }
    Some(MipLevel {
        width,
        height,
        pixels,
    })
}

/// Convert sRGB byte value to linear float.
fn srgb_to_linear(value: u8) -> f32 {
    let v = value as f32 / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}
