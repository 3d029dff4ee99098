//! The region renderer.
//!
//! Each [`Renderer::render_scene`] call adds one sample per pixel to one
//! region: generate camera rays, trace, shade, resolve shadows, bounce until
//! the depth budget runs out, then fold the result into the running mean.

use std::ops::Deref;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use ray_core::{CameraKind, Scene, SceneBase, CPU_BACKEND};
use ray_math::Vec4;

use crate::denoise::{self, NlmParams, UNet, UNetWeights};
use crate::error::RenderResult;
use crate::framebuffer::{Frame, Framebuffer, TonemapParams};
use crate::pool::{PassData, PassPool};
use crate::raygen::{generate_primary_rays, sample_mesh_in_texture_space};
use crate::region::{Rect, RegionContext};
use crate::sampling::PixelSampler;
use crate::settings::{validate_size, Capabilities, PassSettings, RendererSettings};
use crate::shade::{shade_primary, shade_secondary, PrimaryTargets};
use crate::sort::{sort_rays, SortGrid, MIN_SORT_RAYS};
use crate::stats::{RenderStats, StageTimer};
use crate::traversal::{intersect_area_lights, intersect_scene, select_traversal, trace_shadow_rays, Traversal};

/// Extra frame buffers a caller can read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxBuffer {
    BaseColor,
    DepthNormals,
    /// Denoised linear color.
    Filtered,
}

/// Read access to one frame buffer; holds the frame lock while alive.
pub struct PixelsRef<'a>(MappedMutexGuard<'a, Framebuffer>);

impl PixelsRef<'_> {
    /// Pixels per row.
    pub fn row_pitch(&self) -> u32 {
        self.0.w()
    }
}

impl Deref for PixelsRef<'_> {
    type Target = Framebuffer;

    fn deref(&self) -> &Framebuffer {
        &self.0
    }
}

/// CPU path tracer accumulating into one frame.
pub struct Renderer {
    settings: RendererSettings,
    caps: Capabilities,
    traversal: Box<dyn Traversal>,
    frame: Mutex<Frame>,
    pool: PassPool,
    stats: Mutex<RenderStats>,
    nlm: NlmParams,
    unet: Mutex<Option<UNet>>,
}

impl Renderer {
    pub fn new(settings: RendererSettings) -> RenderResult<Self> {
        settings.validate()?;
        let caps = Capabilities::select(settings.preferred_device.as_deref())?;
        let traversal = select_traversal(&settings, &caps);
        log::info!(
            "Created {}x{} renderer on {} ({})",
            settings.w,
            settings.h,
            caps.device_name,
            traversal.name()
        );
        Ok(Self {
            frame: Mutex::new(Frame::new(settings.w, settings.h)),
            settings,
            caps,
            traversal,
            pool: PassPool::new(),
            stats: Mutex::new(RenderStats::default()),
            nlm: NlmParams::default(),
            unet: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn size(&self) -> (u32, u32) {
        (self.settings.w, self.settings.h)
    }

    /// An empty scene of this renderer's backend.
    pub fn create_scene(&self) -> Scene {
        Scene::new()
    }

    pub fn set_nlm_params(&mut self, params: NlmParams) {
        self.nlm = params;
    }

    /// Install the learned filter's weights.
    pub fn set_unet_weights(&self, weights: UNetWeights) -> RenderResult<()> {
        let unet = UNet::new(weights)?;
        *self.unet.lock() = Some(unet);
        Ok(())
    }

    /// Reallocate the frame. Every buffer comes back cleared.
    pub fn resize(&mut self, w: u32, h: u32) -> RenderResult<()> {
        validate_size(w, h)?;
        if (w, h) == self.size() {
            return Ok(());
        }
        self.settings.w = w;
        self.settings.h = h;
        self.frame.get_mut().resize(w, h);
        self.pool.clear();
        if let Some(unet) = self.unet.get_mut() {
            unet.resize(w, h);
        }
        log::debug!("Resized renderer to {w}x{h}");
        Ok(())
    }

    /// Fill the color buffers with `color`. Regions must be cleared by their owners.
    pub fn clear(&self, color: Vec4) {
        self.frame.lock().clear(color);
    }

    /// Display buffer when `tonemap` is set, the linear running mean otherwise.
    pub fn get_pixels_ref(&self, tonemap: bool) -> PixelsRef<'_> {
        let frame = self.frame.lock();
        PixelsRef(MutexGuard::map(frame, |f| if tonemap { &mut f.final_buf } else { &mut f.clean }))
    }

    /// `None` when the buffer was not requested by the last camera.
    pub fn get_aux_pixels_ref(&self, kind: AuxBuffer) -> Option<PixelsRef<'_>> {
        let frame = self.frame.lock();
        MutexGuard::try_map(frame, |f| match kind {
            AuxBuffer::BaseColor => f.base_color.as_mut(),
            AuxBuffer::DepthNormals => f.depth_normals.as_mut(),
            AuxBuffer::Filtered => Some(&mut f.filtered),
        })
        .ok()
        .map(PixelsRef)
    }

    /// The running mean with its SH coefficients, when the camera bakes them.
    pub fn get_sh_data_ref(&self) -> Option<PixelsRef<'_>> {
        let frame = self.frame.lock();
        MutexGuard::try_map(frame, |f| f.clean.has_sh().then_some(&mut f.clean))
            .ok()
            .map(PixelsRef)
    }

    pub fn get_stats(&self) -> RenderStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = RenderStats::default();
    }

    /// Render one pass over `region`.
    ///
    /// Scenes from another backend and scenes that were not finalized are
    /// skipped without touching the region or the frame.
    pub fn render_scene(&self, scene: &dyn SceneBase, region: &mut RegionContext) {
        let Some(scene) = scene.as_any().downcast_ref::<Scene>() else {
            log::warn!("Ignoring scene from the '{}' backend, expected '{CPU_BACKEND}'", scene.backend());
            return;
        };
        let Some(sc) = scene.snapshot() else {
            log::warn!("Ignoring render of a scene that was not finalized");
            return;
        };
        let Some(cam) = scene.current_camera() else {
            log::warn!("Ignoring render of a scene without a camera");
            return;
        };
        let (w, h) = self.size();
        let rect = region.rect.resolve(w, h);
        if rect.is_empty() {
            return;
        }

        let ps = PassSettings::from(&cam.pass);
        let tonemap = TonemapParams::from_camera(cam);
        let mut stats = RenderStats {
            passes: 1,
            ..Default::default()
        };
        let mut timer = StageTimer::start();

        let mut guard = self.pool.checkout();
        let PassData {
            rays,
            shadow_rays,
            hits,
            sort,
            region: buffers,
            required_samples,
        } = &mut *guard;

        {
            let mut frame = self.frame.lock();
            frame.ensure_aux(&ps);
            required_samples.clear();
            if ps.adaptive() {
                *required_samples = frame.region_required_samples(&rect);
            }
        }
        buffers.prepare(&rect, &ps);

        let iteration = region.advance();
        let sample = region.sample();
        let sampler = PixelSampler::new(sample, w, ps.coherent_sampling);
        let traversal = &*self.traversal;
        let local = Rect::new(0, 0, rect.w, rect.h);

        // Camera rays
        {
            let (primary, next) = rays.split();
            let geo = match cam.kind {
                CameraKind::Geo { mi_index } => Some(mi_index),
                _ => None,
            };
            match geo {
                Some(mi_index) => sample_mesh_in_texture_space(sc, mi_index, rect, w, h, sample, primary, hits),
                None => {
                    let required = ps.adaptive().then_some(required_samples.as_slice());
                    generate_primary_rays(cam, rect, w, h, sample, required, iteration, ps.coherent_sampling, primary);
                }
            }
            stats.time_primary_ray_gen_us = timer.lap();

            if geo.is_none() {
                intersect_scene(primary, &ps, &sampler, sc, traversal, hits);
            }
            stats.time_primary_trace_us = timer.lap();

            shadow_rays.clear();
            let targets = PrimaryTargets {
                temp: buffers.temp.pixels_mut(),
                base_color: if ps.output_base_color {
                    Some(buffers.base_color.pixels_mut())
                } else {
                    None
                },
                depth_normals: if ps.output_depth_normals {
                    Some(buffers.depth_normals.pixels_mut())
                } else {
                    None
                },
            };
            shade_primary(&ps, primary, hits, &sampler, sc, &rect, targets, next, shadow_rays);
            if ps.output_sh {
                buffers.temp.reset_sample_data(&local);
                for r in next.iter() {
                    let (x, y) = (r.xy.x() - rect.x, r.xy.y() - rect.y);
                    buffers.temp.set_sample_dir(x, y, r.d);
                    buffers.temp.add_sample_weight(x, y, 1.0);
                }
            }
            stats.time_primary_shade_us = timer.lap();

            trace_shadow_rays(shadow_rays, &ps, sc, traversal, ps.clamp_direct, &rect, buffers.temp.pixels_mut());
            stats.time_primary_shadow_us = timer.lap();
            log::debug!(
                "Pass {iteration} over {}x{}: {} primary, {} bounced, {} shadow rays",
                rect.w,
                rect.h,
                primary.len(),
                next.len(),
                shadow_rays.len()
            );
        }
        rays.swap();

        // Bounces, plus one round per allowed transparent hop
        for _ in 0..u32::from(ps.max_total_depth) + u32::from(ps.max_transp_depth) {
            if ps.skip_indirect_lighting || rays.current().is_empty() {
                break;
            }
            let (cur, next) = rays.split();
            if self.settings.sort_secondary_rays && cur.len() >= MIN_SORT_RAYS && !sc.is_empty() {
                sort_rays(cur, &SortGrid::from_bounds(&sc.root_bounds), sort);
            }
            stats.time_secondary_sort_us += timer.lap();

            intersect_scene(cur, &ps, &sampler, sc, traversal, hits);
            intersect_area_lights(cur, sc, hits);
            stats.time_secondary_trace_us += timer.lap();

            shadow_rays.clear();
            shade_secondary(&ps, cur, hits, &sampler, sc, &rect, buffers.temp.pixels_mut(), next, shadow_rays);
            stats.time_secondary_shade_us += timer.lap();

            trace_shadow_rays(shadow_rays, &ps, sc, traversal, ps.clamp_indirect, &rect, buffers.temp.pixels_mut());
            stats.time_secondary_shadow_us += timer.lap();
            rays.swap();
        }
        rays.clear();

        if ps.output_sh {
            buffers.temp.compute_sh_data(&local);
        }
        self.frame.lock().commit(&rect, iteration, buffers, &ps, tonemap);
        self.stats.lock().merge(&stats);
    }

    /// Joint NLM over `region`, guided by the aux buffers that exist.
    pub fn denoise_image(&self, region: &RegionContext) {
        let timer = std::time::Instant::now();
        denoise::nlm_denoise(&mut self.frame.lock(), &self.nlm, &region.rect);
        self.add_denoise_time(timer);
    }

    /// One pass of the learned filter over `region`.
    ///
    /// Calls must follow pass order, and a pass may only start on a region once
    /// the previous pass finished on every neighbouring region.
    pub fn denoise_image_pass(&self, pass: usize, region: &RegionContext) {
        let timer = std::time::Instant::now();
        let mut unet = self.unet.lock();
        let Some(unet) = unet.as_mut() else {
            log::warn!("Learned denoiser has no weights");
            return;
        };
        let (w, h) = self.size();
        let rect = region.rect.resolve(w, h);
        let mut frame = self.frame.lock();
        if pass == 0 {
            // The first convolution reads one pixel around the region
            let x0 = rect.x.saturating_sub(1);
            let y0 = rect.y.saturating_sub(1);
            let grown = Rect::new(x0, y0, rect.x + rect.w + 1 - x0, rect.y + rect.h + 1 - y0).resolve(w, h);
            unet.prepare_input(&frame, &grown);
        }
        unet.run_pass(pass, &rect);
        if pass + 1 == denoise::unet::PASS_COUNT {
            unet.write_output(&mut frame, &rect);
        }
        drop(frame);
        self.add_denoise_time(timer);
    }

    /// Every pass of the learned filter over all `regions`, scheduled by the task graph.
    pub fn denoise_image_unet(&self, regions: &[RegionContext]) {
        let timer = std::time::Instant::now();
        let mut unet = self.unet.lock();
        let Some(unet) = unet.as_mut() else {
            log::warn!("Learned denoiser has no weights");
            return;
        };
        let (w, h) = self.size();
        let tiles: Vec<Rect> = regions.iter().map(|r| r.rect.resolve(w, h)).collect();
        let mut frame = self.frame.lock();
        unet.run_all(&frame, &tiles);
        if tiles.is_empty() {
            unet.write_output(&mut frame, &Rect::default());
        }
        for tile in &tiles {
            unet.write_output(&mut frame, tile);
        }
        drop(frame);
        self.add_denoise_time(timer);
    }

    fn add_denoise_time(&self, start: std::time::Instant) {
        let us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.stats.lock().time_denoise_us += us;
    }
}
