//! Frame buffers and incremental accumulation.
//!
//! A [`Framebuffer`] is a plain grid of linear RGBA pixels, optionally paired
//! with L1 spherical-harmonic data for lightmap baking. [`Frame`] groups the
//! buffers one renderer accumulates into: the running mean, the two
//! half-sample means used for variance, the tonemapped display buffer and
//! the denoised result.

use std::f32::consts::PI;
use std::path::Path;

use ray_core::{CameraDesc, DisplayType};
use ray_math::{Vec3, Vec4, FLT_EPS};

use crate::error::{RenderError, RenderResult};
use crate::region::Rect;
use crate::settings::PassSettings;

/// L1 spherical-harmonic basis constants.
pub const SH_Y0: f32 = 0.282_095;
pub const SH_Y1: f32 = 0.488_603;

/// Converged pixels store the iteration they stopped at; the rest keep this.
pub const REQUIRED_SAMPLES_UNLIMITED: u16 = u16::MAX;

/// Per-pixel L1 spherical-harmonic coefficients.
///
/// While a pass is being shaded `coeff_r` holds the basis of the sample
/// direction and `coeff_g[0]` the sample weight; [`Framebuffer::compute_sh_data`]
/// turns that into radiance coefficients.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShL1Data {
    pub coeff_r: [f32; 4],
    pub coeff_g: [f32; 4],
    pub coeff_b: [f32; 4],
}

impl ShL1Data {
    fn mix(&mut self, other: &ShL1Data, k: f32) {
        for j in 0..4 {
            self.coeff_r[j] += (other.coeff_r[j] - self.coeff_r[j]) * k;
            self.coeff_g[j] += (other.coeff_g[j] - self.coeff_g[j]) * k;
            self.coeff_b[j] += (other.coeff_b[j] - self.coeff_b[j]) * k;
        }
    }
}

/// Grid of linear RGBA pixels in row-major order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Framebuffer {
    w: u32,
    h: u32,
    pixels: Vec<Vec4>,
    sh_data: Vec<ShL1Data>,
}

impl Framebuffer {
    pub fn new(w: u32, h: u32) -> Self {
        let mut fb = Self::default();
        fb.resize(w, h, false);
        fb
    }

    /// Reallocate to `w x h`, cleared. SH data exists only with `alloc_sh`.
    pub fn resize(&mut self, w: u32, h: u32, alloc_sh: bool) {
        let n = w as usize * h as usize;
        self.w = w;
        self.h = h;
        self.pixels.clear();
        self.pixels.resize(n, Vec4::ZERO);
        self.sh_data.clear();
        if alloc_sh {
            self.sh_data.resize(n, ShL1Data::default());
        }
    }

    /// Add or drop SH storage without touching the pixels.
    pub fn set_sh_enabled(&mut self, enabled: bool) {
        if enabled && self.sh_data.is_empty() {
            self.sh_data.resize(self.pixels.len(), ShL1Data::default());
        } else if !enabled {
            self.sh_data = Vec::new();
        }
    }

    #[inline]
    pub fn w(&self) -> u32 {
        self.w
    }

    #[inline]
    pub fn h(&self) -> u32 {
        self.h
    }

    #[inline]
    pub fn has_sh(&self) -> bool {
        !self.sh_data.is_empty()
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.w as usize + x as usize
    }

    pub fn pixels(&self) -> &[Vec4] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Vec4] {
        &mut self.pixels
    }

    /// Pixels as raw bytes, four `f32` per pixel.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    pub fn sh_data(&self) -> &[ShL1Data] {
        &self.sh_data
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Vec4 {
        self.pixels[self.index(x, y)]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, p: Vec4) {
        let i = self.index(x, y);
        self.pixels[i] = p;
    }

    pub fn clear(&mut self, color: Vec4) {
        self.pixels.fill(color);
        self.sh_data.fill(ShL1Data::default());
    }

    /// Zero the sample weights of `rect`.
    pub fn reset_sample_data(&mut self, rect: &Rect) {
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let i = self.index(x, y);
                if let Some(sh) = self.sh_data.get_mut(i) {
                    sh.coeff_g[0] = 0.0;
                }
            }
        }
    }

    /// Store the SH basis of the sample direction taken at `(x, y)`.
    pub fn set_sample_dir(&mut self, x: u32, y: u32, dir: Vec3) {
        let i = self.index(x, y);
        if let Some(sh) = self.sh_data.get_mut(i) {
            sh.coeff_r = [SH_Y0, SH_Y1 * dir.y, SH_Y1 * dir.z, SH_Y1 * dir.x];
        }
    }

    pub fn add_sample_weight(&mut self, x: u32, y: u32, weight: f32) {
        let i = self.index(x, y);
        if let Some(sh) = self.sh_data.get_mut(i) {
            sh.coeff_g[0] += weight;
        }
    }

    /// Project the pixel radiance of `rect` onto the stored sample basis.
    pub fn compute_sh_data(&mut self, rect: &Rect) {
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let i = self.index(x, y);
                let Some(sh) = self.sh_data.get_mut(i) else {
                    continue;
                };
                let inv_weight = if sh.coeff_g[0] > FLT_EPS {
                    2.0 * PI / sh.coeff_g[0]
                } else {
                    0.0
                };
                let p = self.pixels[i].truncate() * inv_weight;
                let basis = sh.coeff_r;
                for j in 0..4 {
                    sh.coeff_r[j] = basis[j] * p.x;
                    sh.coeff_g[j] = basis[j] * p.y;
                    sh.coeff_b[j] = basis[j] * p.z;
                }
            }
        }
    }

    /// `p += (n - p) * k` over `rect`, where `other` holds just the pixels of `rect`.
    pub fn mix_with(&mut self, other: &Framebuffer, rect: &Rect, k: f32) {
        self.mix_with_filtered(other, rect, k, |_| true);
    }

    /// [`mix_with`](Self::mix_with) restricted to pixels for which `keep`
    /// returns true; `keep` receives the frame index.
    pub fn mix_with_filtered(&mut self, other: &Framebuffer, rect: &Rect, k: f32, keep: impl Fn(usize) -> bool) {
        for y in 0..rect.h {
            for x in 0..rect.w {
                let i = self.index(rect.x + x, rect.y + y);
                if !keep(i) {
                    continue;
                }
                let n = other.pixel(x, y);
                let p = &mut self.pixels[i];
                *p += (n - *p) * k;
            }
        }
    }

    /// Same update for SH coefficients; both buffers must carry SH data.
    pub fn mix_with_sh(&mut self, other: &Framebuffer, rect: &Rect, k: f32) {
        if self.sh_data.is_empty() || other.sh_data.is_empty() {
            return;
        }
        for y in 0..rect.h {
            for x in 0..rect.w {
                let i = self.index(rect.x + x, rect.y + y);
                let src = other.sh_data[other.index(x, y)];
                self.sh_data[i].mix(&src, k);
            }
        }
    }

    /// Write `f(src)` into `rect`; both buffers cover the whole frame.
    pub fn copy_from(&mut self, src: &Framebuffer, rect: &Rect, f: impl Fn(Vec4) -> Vec4) {
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let i = self.index(x, y);
                self.pixels[i] = f(src.pixels[i]);
            }
        }
    }

    /// Save as an 8-bit RGBA PNG; values are clamped to `[0, 1]`.
    pub fn save_png(&self, path: impl AsRef<Path>) -> RenderResult<()> {
        let path = path.as_ref();
        let bytes: Vec<u8> = self
            .pixels
            .iter()
            .flat_map(|p| p.to_array())
            .map(|c| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8)
            .collect();
        image::save_buffer_with_format(path, &bytes, self.w, self.h, image::ColorType::Rgba8, image::ImageFormat::Png)
            .map_err(|e| RenderError::ImageWrite(format!("{}: {e}", path.display())))?;
        log::info!("Saved {}x{} image to {}", self.w, self.h, path.display());
        Ok(())
    }
}

/// Display transform applied when copying the running mean to the display buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TonemapParams {
    pub srgb: bool,
    pub gamma: f32,
    pub clamp: bool,
    /// Exposure in stops.
    pub exposure: f32,
}

impl Default for TonemapParams {
    fn default() -> Self {
        Self {
            srgb: true,
            gamma: 1.0,
            clamp: false,
            exposure: 0.0,
        }
    }
}

impl TonemapParams {
    pub fn from_camera(cam: &CameraDesc) -> Self {
        Self {
            srgb: cam.dtype == DisplayType::Srgb,
            gamma: cam.gamma,
            clamp: cam.pass.clamp_final,
            exposure: cam.exposure,
        }
    }

    /// Exposure, then sRGB encoding, gamma and clamping in that order. Alpha passes through.
    pub fn apply(&self, p: Vec4) -> Vec4 {
        let mut c = p.truncate() * self.exposure.exp2();
        if self.srgb {
            c = Vec3::new(srgb_encode(c.x), srgb_encode(c.y), srgb_encode(c.z));
        }
        if self.gamma != 1.0 {
            c = c.powf(1.0 / self.gamma);
        }
        if self.clamp {
            c = c.clamp(Vec3::ZERO, Vec3::ONE);
        }
        c.extend(p.w)
    }
}

#[inline]
fn srgb_encode(c: f32) -> f32 {
    if c > 0.003_130_8 {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    } else {
        12.92 * c
    }
}

/// Invertible range compression used around the learned filter.
#[inline]
pub fn reversible_tonemap(c: Vec3) -> Vec3 {
    c / (1.0 + c.max_element().max(0.0))
}

#[inline]
pub fn reversible_tonemap_invert(c: Vec3) -> Vec3 {
    let m = c.max_element().min(1.0 - FLT_EPS);
    c / (1.0 - m)
}

/// Region-local results of one pass, ready to be committed to a [`Frame`].
///
/// Every buffer is `rect.w x rect.h`.
#[derive(Clone, Debug, Default)]
pub struct RegionBuffers {
    pub temp: Framebuffer,
    pub base_color: Framebuffer,
    pub depth_normals: Framebuffer,
}

impl RegionBuffers {
    /// Size the buffers for `rect` and zero them.
    pub fn prepare(&mut self, rect: &Rect, ps: &PassSettings) {
        self.temp.resize(rect.w, rect.h, ps.output_sh);
        let aux = |enabled: bool| if enabled { (rect.w, rect.h) } else { (0, 0) };
        let (w, h) = aux(ps.output_base_color);
        self.base_color.resize(w, h, false);
        let (w, h) = aux(ps.output_depth_normals);
        self.depth_normals.resize(w, h, false);
    }
}

/// Accumulation buffers of one renderer.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    w: u32,
    h: u32,
    /// Running mean of all committed passes.
    pub clean: Framebuffer,
    /// Running means of the odd and the even passes.
    pub dual: [Framebuffer; 2],
    /// Tonemapped display buffer.
    pub final_buf: Framebuffer,
    /// Denoised linear result.
    pub filtered: Framebuffer,
    variance_raw: Vec<f32>,
    /// Box-filtered per-pixel variance of the mean.
    pub variance: Vec<f32>,
    pub required_samples: Vec<u16>,
    pub base_color: Option<Framebuffer>,
    pub depth_normals: Option<Framebuffer>,
    /// Display transform of the last committed pass.
    pub tonemap: TonemapParams,
}

impl Frame {
    pub fn new(w: u32, h: u32) -> Self {
        let mut frame = Self::default();
        frame.resize(w, h);
        frame
    }

    #[inline]
    pub fn w(&self) -> u32 {
        self.w
    }

    #[inline]
    pub fn h(&self) -> u32 {
        self.h
    }

    /// Reallocate every buffer at the new size, cleared. Aux buffers are dropped.
    pub fn resize(&mut self, w: u32, h: u32) {
        let n = w as usize * h as usize;
        self.w = w;
        self.h = h;
        for fb in [&mut self.clean, &mut self.final_buf, &mut self.filtered] {
            fb.resize(w, h, false);
        }
        for fb in &mut self.dual {
            fb.resize(w, h, false);
        }
        self.variance_raw = vec![0.0; n];
        self.variance = vec![0.0; n];
        self.required_samples = vec![REQUIRED_SAMPLES_UNLIMITED; n];
        self.base_color = None;
        self.depth_normals = None;
    }

    /// Fill the color buffers with `color` and restart adaptive sampling.
    pub fn clear(&mut self, color: Vec4) {
        for fb in [&mut self.clean, &mut self.final_buf, &mut self.filtered] {
            fb.clear(color);
        }
        for fb in &mut self.dual {
            fb.clear(color);
        }
        self.variance_raw.fill(0.0);
        self.variance.fill(0.0);
        self.required_samples.fill(REQUIRED_SAMPLES_UNLIMITED);
        for fb in [&mut self.base_color, &mut self.depth_normals].into_iter().flatten() {
            fb.clear(Vec4::ZERO);
        }
    }

    /// Allocate the aux buffers the pass asks for and free the others.
    pub fn ensure_aux(&mut self, ps: &PassSettings) {
        let (w, h) = (self.w, self.h);
        let sync = |slot: &mut Option<Framebuffer>, enabled: bool| match (enabled, slot.is_some()) {
            (true, false) => *slot = Some(Framebuffer::new(w, h)),
            (false, true) => *slot = None,
            _ => {}
        };
        sync(&mut self.base_color, ps.output_base_color);
        sync(&mut self.depth_normals, ps.output_depth_normals);
        self.clean.set_sh_enabled(ps.output_sh);
    }

    /// Copy of the required-sample counts of `rect`, row-major.
    pub fn region_required_samples(&self, rect: &Rect) -> Vec<u16> {
        let mut out = Vec::with_capacity(rect.area());
        for y in rect.y..rect.y + rect.h {
            let row = y as usize * self.w as usize;
            out.extend_from_slice(&self.required_samples[row + rect.x as usize..row + (rect.x + rect.w) as usize]);
        }
        out
    }

    /// Fold one pass over `rect` into the running means and refresh the display.
    ///
    /// With adaptive sampling, pixels that had already converged before this
    /// pass received no samples and are left untouched.
    pub fn commit(&mut self, rect: &Rect, iteration: u32, pass: &RegionBuffers, ps: &PassSettings, tonemap: TonemapParams) {
        if iteration == 0 || rect.is_empty() {
            return;
        }
        let k = 1.0 / iteration as f32;
        let half_k = 1.0 / iteration.div_ceil(2) as f32;
        let required = &self.required_samples;
        let active = |i: usize| !ps.adaptive() || u32::from(required[i]) >= iteration;

        self.clean.mix_with_filtered(&pass.temp, rect, k, active);
        self.dual[((iteration - 1) % 2) as usize].mix_with_filtered(&pass.temp, rect, half_k, active);
        if ps.output_sh {
            self.clean.mix_with_sh(&pass.temp, rect, k);
        }
        if let Some(fb) = self.base_color.as_mut() {
            fb.mix_with_filtered(&pass.base_color, rect, k, active);
        }
        if let Some(fb) = self.depth_normals.as_mut() {
            fb.mix_with_filtered(&pass.depth_normals, rect, k, active);
        }

        self.update_variance(rect);
        if let Some(min_samples) = ps.min_samples {
            if iteration > min_samples {
                self.update_required_samples(rect, iteration, ps.variance_threshold);
            }
        }

        self.tonemap = tonemap;
        self.final_buf.copy_from(&self.clean, rect, |p| tonemap.apply(p));
    }

    fn update_variance(&mut self, rect: &Rect) {
        let w = self.w as usize;
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let i = y as usize * w + x as usize;
                let d = (self.dual[0].pixels()[i] - self.dual[1].pixels()[i]).truncate();
                self.variance_raw[i] = (d * d).max_element() / 4.0;
            }
        }
        // 3x3 box filter, clipped at the frame border
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let (mut sum, mut count) = (0.0, 0.0);
                for ny in y.saturating_sub(1)..=(y + 1).min(self.h - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(self.w - 1) {
                        sum += self.variance_raw[ny as usize * w + nx as usize];
                        count += 1.0;
                    }
                }
                self.variance[y as usize * w + x as usize] = sum / count;
            }
        }
    }

    fn update_required_samples(&mut self, rect: &Rect, iteration: u32, threshold: f32) {
        let w = self.w as usize;
        let stop = iteration.min(u32::from(REQUIRED_SAMPLES_UNLIMITED) - 1) as u16;
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let i = y as usize * w + x as usize;
                if self.required_samples[i] == REQUIRED_SAMPLES_UNLIMITED && self.variance[i] < threshold {
                    self.required_samples[i] = stop;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn region_pass(rect: &Rect, rng: &mut StdRng) -> RegionBuffers {
        let mut pass = RegionBuffers::default();
        pass.prepare(rect, &PassSettings::default());
        for p in pass.temp.pixels_mut() {
            *p = Vec4::new(rng.gen_range(0.0..4.0), rng.gen_range(0.0..4.0), rng.gen_range(0.0..4.0), 1.0);
        }
        pass
    }

    #[test]
    fn test_incremental_mean_matches_sum() {
        let rect = Rect::new(2, 1, 5, 3);
        let mut frame = Frame::new(8, 6);
        let mut rng = StdRng::seed_from_u64(11);
        let mut sum = vec![Vec4::ZERO; rect.area()];
        let n = 64;
        for it in 1..=n {
            let pass = region_pass(&rect, &mut rng);
            for (s, p) in sum.iter_mut().zip(pass.temp.pixels()) {
                *s += *p;
            }
            frame.commit(&rect, it, &pass, &PassSettings::default(), TonemapParams::default());
        }
        for y in 0..rect.h {
            for x in 0..rect.w {
                let mean = sum[rect.local_index(rect.x + x, rect.y + y)] / n as f32;
                let got = frame.clean.pixel(rect.x + x, rect.y + y);
                assert!((got - mean).abs().max_element() < 1e-4, "{got} vs {mean}");
            }
        }
        // Pixels outside the region stay untouched
        assert_eq!(frame.clean.pixel(0, 0), Vec4::ZERO);
    }

    #[test]
    fn test_dual_buffers_split_passes() {
        let rect = Rect::new(0, 0, 1, 1);
        let mut frame = Frame::new(1, 1);
        for (it, v) in [(1, 1.0), (2, 3.0), (3, 5.0), (4, 7.0)] {
            let mut pass = RegionBuffers::default();
            pass.prepare(&rect, &PassSettings::default());
            pass.temp.pixels_mut()[0] = Vec4::new(v, v, v, 1.0);
            frame.commit(&rect, it, &pass, &PassSettings::default(), TonemapParams::default());
        }
        assert!((frame.dual[0].pixel(0, 0).x - 3.0).abs() < 1e-6);
        assert!((frame.dual[1].pixel(0, 0).x - 5.0).abs() < 1e-6);
        assert!((frame.clean.pixel(0, 0).x - 4.0).abs() < 1e-6);
        // (3 - 5)^2 / 4
        assert!((frame.variance[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_sampling_freezes_converged_pixels() {
        let rect = Rect::new(0, 0, 5, 1);
        let mut frame = Frame::new(5, 1);
        let ps = PassSettings {
            min_samples: Some(2),
            variance_threshold: 0.01,
            ..Default::default()
        };
        let mut pass = RegionBuffers::default();
        pass.prepare(&rect, &ps);
        for it in 1..=3 {
            // The last pixel alternates, the others are constant
            let noisy = if it % 2 == 0 { 0.0 } else { 2.0 };
            pass.temp.pixels_mut().fill(Vec4::ONE);
            pass.temp.pixels_mut()[4] = Vec4::splat(noisy);
            frame.commit(&rect, it, &pass, &ps, TonemapParams::default());
        }
        assert_eq!(frame.required_samples[0], 3);
        assert_eq!(frame.required_samples[4], REQUIRED_SAMPLES_UNLIMITED);

        // A converged pixel ignores later passes
        pass.temp.pixels_mut()[0] = Vec4::splat(100.0);
        frame.commit(&rect, 4, &pass, &ps, TonemapParams::default());
        assert!((frame.clean.pixel(0, 0).x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_clears_everything() {
        let mut frame = Frame::new(4, 4);
        frame.clear(Vec4::ONE);
        frame.resize(3, 2);
        assert_eq!((frame.final_buf.w(), frame.final_buf.h()), (3, 2));
        assert_eq!(frame.final_buf.pixels().len(), 6);
        assert!(frame.final_buf.pixels().iter().all(|p| *p == Vec4::ZERO));
        assert!(frame.clean.pixels().iter().all(|p| *p == Vec4::ZERO));
        assert!(frame.base_color.is_none());
    }

    #[test]
    fn test_tonemap_order() {
        let linear = TonemapParams {
            srgb: false,
            gamma: 2.0,
            clamp: true,
            exposure: 1.0,
        };
        let out = linear.apply(Vec4::new(0.125, 1.0, 0.0, 0.5));
        assert!((out.x - 0.5).abs() < 1e-6);
        assert_eq!(out.y, 1.0);
        assert_eq!(out.w, 0.5);

        let srgb = TonemapParams::default();
        assert!((srgb.apply(Vec4::splat(0.001)).x - 0.01292).abs() < 1e-6);
        assert!((srgb.apply(Vec4::splat(1.0)).x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_reversible_tonemap_inverts() {
        let c = Vec3::new(4.0, 0.5, 0.0);
        let t = reversible_tonemap(c);
        assert!(t.max_element() < 1.0);
        assert!((reversible_tonemap_invert(t) - c).length() < 1e-4);
    }

    #[test]
    fn test_sh_projection() {
        let rect = Rect::new(0, 0, 1, 1);
        let mut fb = Framebuffer::default();
        fb.resize(1, 1, true);
        fb.set_pixel(0, 0, Vec4::new(1.0, 2.0, 3.0, 1.0));
        fb.reset_sample_data(&rect);
        fb.set_sample_dir(0, 0, Vec3::Y);
        fb.add_sample_weight(0, 0, 2.0 * PI);
        fb.compute_sh_data(&rect);
        let sh = fb.sh_data()[0];
        assert!((sh.coeff_r[0] - SH_Y0).abs() < 1e-6);
        assert!((sh.coeff_g[1] - 2.0 * SH_Y1).abs() < 1e-5);
        assert!((sh.coeff_b[3]).abs() < 1e-6);
    }
}
