//! Renderer settings, device capabilities and per-pass settings.

use ray_core::PassDesc;
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};
use crate::sequence::MAX_BOUNCES;

/// Largest frame side; pixel coordinates are packed into 16 bits per axis.
pub const MAX_FRAME_SIZE: u32 = 0xffff;

/// Construction-time renderer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    pub w: u32,
    pub h: u32,
    /// Substring of the device name to run on, `None` picks the default.
    pub preferred_device: Option<String>,
    pub use_tex_compression: bool,
    /// Prefer the hardware ray query when the device supports it.
    pub use_hwrt: bool,
    pub use_bindless: bool,
    /// Traverse the 8-wide BVH instead of the binary one.
    pub use_wide_bvh: bool,
    /// Sort secondary rays by origin cell before tracing them.
    pub sort_secondary_rays: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            w: 256,
            h: 256,
            preferred_device: None,
            use_tex_compression: false,
            use_hwrt: true,
            use_bindless: true,
            use_wide_bvh: true,
            sort_secondary_rays: true,
        }
    }
}

impl RendererSettings {
    pub fn new(w: u32, h: u32) -> Self {
        Self {
            w,
            h,
            ..Default::default()
        }
    }

    pub fn with_wide_bvh(mut self, enabled: bool) -> Self {
        self.use_wide_bvh = enabled;
        self
    }

    pub fn with_hwrt(mut self, enabled: bool) -> Self {
        self.use_hwrt = enabled;
        self
    }

    pub fn with_ray_sorting(mut self, enabled: bool) -> Self {
        self.sort_secondary_rays = enabled;
        self
    }

    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.preferred_device = Some(name.into());
        self
    }

    /// Parse settings from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> RenderResult<Self> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| RenderError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> RenderResult<()> {
        validate_size(self.w, self.h)
    }
}

pub(crate) fn validate_size(w: u32, h: u32) -> RenderResult<()> {
    if w == 0 || h == 0 {
        return Err(RenderError::InvalidSettings(format!("frame size {w}x{h} is empty")));
    }
    if w > MAX_FRAME_SIZE || h > MAX_FRAME_SIZE {
        return Err(RenderError::InvalidSettings(format!(
            "frame size {w}x{h} exceeds {MAX_FRAME_SIZE}"
        )));
    }
    Ok(())
}

/// What the selected device can do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub device_name: String,
    pub hardware_ray_query: bool,
    pub wide_bvh: bool,
    pub bindless: bool,
    pub texture_compression: bool,
}

impl Capabilities {
    /// The reference CPU device.
    pub fn cpu() -> Self {
        Self {
            device_name: "cpu".into(),
            hardware_ray_query: false,
            wide_bvh: true,
            bindless: true,
            texture_compression: false,
        }
    }

    /// Pick the device named by `preferred`, if any.
    pub fn select(preferred: Option<&str>) -> RenderResult<Self> {
        let cpu = Self::cpu();
        match preferred {
            Some(name) if !cpu.device_name.contains(&name.to_lowercase()) => {
                Err(RenderError::DeviceNotFound(name.to_string()))
            }
            _ => Ok(cpu),
        }
    }
}

/// Per-pass settings snapshotted from the active camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PassSettings {
    pub max_diff_depth: u8,
    pub max_spec_depth: u8,
    pub max_refr_depth: u8,
    pub max_transp_depth: u8,
    pub max_total_depth: u8,
    pub min_total_depth: u8,
    pub min_transp_depth: u8,
    pub clamp_direct: f32,
    pub clamp_indirect: f32,
    pub min_samples: Option<u32>,
    pub variance_threshold: f32,
    pub skip_direct_lighting: bool,
    pub skip_indirect_lighting: bool,
    pub lighting_only: bool,
    pub no_background: bool,
    pub clamp_final: bool,
    pub output_sh: bool,
    pub output_base_color: bool,
    pub output_depth_normals: bool,
    pub coherent_sampling: bool,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self::from(&PassDesc::default())
    }
}

impl From<&PassDesc> for PassSettings {
    fn from(p: &PassDesc) -> Self {
        let max_total = p.max_total_depth.min(MAX_BOUNCES as u8);
        Self {
            max_diff_depth: p.max_diff_depth,
            max_spec_depth: p.max_spec_depth,
            max_refr_depth: p.max_refr_depth,
            max_transp_depth: p.max_transp_depth,
            max_total_depth: max_total,
            min_total_depth: p.min_total_depth,
            min_transp_depth: p.min_transp_depth,
            clamp_direct: p.clamp_direct,
            clamp_indirect: p.clamp_indirect,
            min_samples: p.min_samples,
            variance_threshold: p.variance_threshold,
            skip_direct_lighting: p.skip_direct_lighting,
            skip_indirect_lighting: p.skip_indirect_lighting,
            lighting_only: p.lighting_only,
            no_background: p.no_background,
            clamp_final: p.clamp_final,
            output_sh: p.output_sh,
            output_base_color: p.output_base_color,
            output_depth_normals: p.output_depth_normals,
            coherent_sampling: p.coherent_sampling,
        }
    }
}

impl PassSettings {
    /// Adaptive sampling is on when a minimum sample count is set.
    pub fn adaptive(&self) -> bool {
        self.min_samples.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_json() {
        let settings = RendererSettings::from_json(r#"{ "w": 640, "h": 360, "use_wide_bvh": false }"#).unwrap();
        assert_eq!(settings.w, 640);
        assert_eq!(settings.h, 360);
        assert!(!settings.use_wide_bvh);
        assert!(settings.sort_secondary_rays);
    }

    #[test]
    fn test_settings_rejects_empty_frame() {
        let err = RendererSettings::from_json(r#"{ "w": 0 }"#).unwrap_err();
        assert!(matches!(err, RenderError::InvalidSettings(_)));
        assert!(RendererSettings::from_json("{ not json").is_err());
        assert!(RendererSettings::new(70_000, 10).validate().is_err());
    }

    #[test]
    fn test_device_selection() {
        assert!(Capabilities::select(None).is_ok());
        assert!(Capabilities::select(Some("CPU")).is_ok());
        assert_eq!(
            Capabilities::select(Some("gpu0")),
            Err(RenderError::DeviceNotFound("gpu0".into()))
        );
        assert!(!Capabilities::cpu().hardware_ray_query);
    }

    #[test]
    fn test_pass_settings_clamp_total_depth() {
        let desc = PassDesc {
            max_total_depth: 200,
            ..Default::default()
        };
        let ps = PassSettings::from(&desc);
        assert_eq!(ps.max_total_depth as usize, MAX_BOUNCES);
        assert!(!ps.adaptive());
    }
}
