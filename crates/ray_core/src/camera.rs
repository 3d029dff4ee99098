//! Camera descriptions.
//!
//! A camera carries both the projection (perspective, orthographic or the
//! lightmap "geometry" camera) and the per-pass render settings: bounce
//! budgets, firefly clamps, output flags and adaptive sampling controls.

use ray_math::Vec3;
use serde::{Deserialize, Serialize};

/// Projection used to generate primary rays.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraKind {
    Persp,
    Ortho,
    /// Bakes a mesh instance in texture space (lightmaps).
    Geo { mi_index: u32 },
}

/// Reconstruction filter for sub-pixel jitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFilter {
    Box,
    Tent,
}

/// Output transfer applied when tonemapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Linear,
    Srgb,
}

/// Per-pass bounce budgets and output toggles.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassDesc {
    pub max_diff_depth: u8,
    pub max_spec_depth: u8,
    pub max_refr_depth: u8,
    pub max_transp_depth: u8,
    pub max_total_depth: u8,
    /// Russian roulette starts above this total depth.
    pub min_total_depth: u8,
    pub min_transp_depth: u8,
    /// Per-channel cap for directly lit samples, `0` disables.
    pub clamp_direct: f32,
    /// Per-channel cap for indirect samples, `0` disables.
    pub clamp_indirect: f32,
    /// Iterations before adaptive sampling may stop pixels, `None` disables it.
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
    /// Share random offsets over 4x4 pixel blocks.
    pub coherent_sampling: bool,
}

impl Default for PassDesc {
    fn default() -> Self {
        Self {
            max_diff_depth: 4,
            max_spec_depth: 8,
            max_refr_depth: 8,
            max_transp_depth: 8,
            max_total_depth: 8,
            min_total_depth: 2,
            min_transp_depth: 2,
            clamp_direct: 0.0,
            clamp_indirect: 0.0,
            min_samples: None,
            variance_threshold: 0.0,
            skip_direct_lighting: false,
            skip_indirect_lighting: false,
            lighting_only: false,
            no_background: false,
            clamp_final: false,
            output_sh: false,
            output_base_color: false,
            output_depth_normals: false,
            coherent_sampling: false,
        }
    }
}

/// Camera description stored by the scene.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraDesc {
    pub kind: CameraKind,
    pub filter: PixelFilter,
    pub dtype: DisplayType,
    pub origin: Vec3,
    pub fwd: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees (ortho: view height is derived from it).
    pub fov: f32,
    pub shift: [f32; 2],
    /// Exposure in stops.
    pub exposure: f32,
    pub gamma: f32,
    pub sensor_height: f32,
    pub focus_distance: f32,
    pub focal_length: f32,
    /// `0` disables depth of field.
    pub fstop: f32,
    pub clip_start: f32,
    pub clip_end: f32,
    pub pass: PassDesc,
}

impl Default for CameraDesc {
    fn default() -> Self {
        Self {
            kind: CameraKind::Persp,
            filter: PixelFilter::Tent,
            dtype: DisplayType::Srgb,
            origin: Vec3::ZERO,
            fwd: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::Y,
            fov: 45.0,
            shift: [0.0, 0.0],
            exposure: 0.0,
            gamma: 1.0,
            sensor_height: 0.036,
            focus_distance: 1.0,
            focal_length: 0.0,
            fstop: 0.0,
            clip_start: 0.0,
            clip_end: ray_math::MAX_DIST,
            pass: PassDesc::default(),
        }
    }
}

impl CameraDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position the camera at `from` looking toward `to`.
    pub fn look_at(mut self, from: Vec3, to: Vec3, up: Vec3) -> Self {
        self.origin = from;
        self.fwd = (to - from).normalize_or_zero();
        self.up = up;
        self
    }

    pub fn with_kind(mut self, kind: CameraKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_fov(mut self, fov: f32) -> Self {
        self.fov = fov;
        self
    }

    pub fn with_filter(mut self, filter: PixelFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_display(mut self, dtype: DisplayType, gamma: f32, exposure: f32) -> Self {
        self.dtype = dtype;
        self.gamma = gamma;
        self.exposure = exposure;
        self
    }

    /// Enable thin-lens depth of field.
    pub fn with_lens(mut self, focal_length: f32, fstop: f32, focus_distance: f32) -> Self {
        self.focal_length = focal_length;
        self.fstop = fstop;
        self.focus_distance = focus_distance;
        self
    }

    pub fn with_pass(mut self, pass: PassDesc) -> Self {
        self.pass = pass;
        self
    }

    /// Orthonormal `(side, up, fwd)` frame of the camera.
    ///
    /// Falls back to a world axis when `up` is parallel to `fwd`.
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let fwd = self.fwd.normalize_or_zero();
        let fwd = if fwd == Vec3::ZERO {
            Vec3::new(0.0, 0.0, -1.0)
        } else {
            fwd
        };
        let mut side = fwd.cross(self.up);
        if side.length_squared() < 1e-12 {
            side = fwd.cross(if fwd.y.abs() < 0.9 { Vec3::Y } else { Vec3::Z });
        }
        let side = side.normalize();
        let up = side.cross(fwd);
        (side, up, fwd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_basis_is_orthonormal() {
        let cam = CameraDesc::new().look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let (side, up, fwd) = cam.basis();

        assert!((fwd - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
        assert!((side - Vec3::X).length() < 1e-5);
        assert!((up - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_camera_basis_degenerate_up() {
        let cam = CameraDesc::new().look_at(Vec3::new(0.0, 2.0, 0.0), Vec3::ZERO, Vec3::Y);
        let (side, up, fwd) = cam.basis();
        assert!(side.dot(fwd).abs() < 1e-5);
        assert!(up.dot(fwd).abs() < 1e-5);
        assert!((side.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_camera_desc_from_json() {
        let json = r#"{
            "kind": { "type": "geo", "mi_index": 3 },
            "fov": 60.0,
            "pass": { "max_total_depth": 4, "output_sh": true }
        }"#;
        let cam: CameraDesc = serde_json::from_str(json).unwrap();
        assert_eq!(cam.kind, CameraKind::Geo { mi_index: 3 });
        assert_eq!(cam.fov, 60.0);
        assert_eq!(cam.pass.max_total_depth, 4);
        assert!(cam.pass.output_sh);
        // Untouched fields keep their defaults
        assert_eq!(cam.pass.max_diff_depth, 4);
        assert_eq!(cam.filter, PixelFilter::Tent);
    }
}
