//! Bucket tiling for progressive renders.
//!
//! The frame is cut into square buckets ordered from the centre outward.
//! Each bucket owns a [`RegionContext`], so buckets accumulate independently
//! and can be rendered in parallel with rayon.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use ray_core::SceneBase;

use crate::region::{Rect, RegionContext};
use crate::renderer::Renderer;

/// Default bucket side in pixels.
pub const DEFAULT_BUCKET_SIZE: u32 = 64;

/// Cut a `width x height` frame into buckets, nearest to the centre first.
pub fn generate_buckets(width: u32, height: u32, bucket_size: u32) -> Vec<Rect> {
    let size = bucket_size.max(1);
    let mut buckets = Vec::new();
    for y in (0..height).step_by(size as usize) {
        for x in (0..width).step_by(size as usize) {
            buckets.push(Rect::new(x, y, size.min(width - x), size.min(height - y)));
        }
    }
    sort_spiral(&mut buckets, width, height);
    buckets
}

/// Stable sort by distance of the bucket centre to the frame centre.
fn sort_spiral(buckets: &mut [Rect], width: u32, height: u32) {
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let dist = |b: &Rect| {
        let dx = b.x as f32 + b.w as f32 / 2.0 - cx;
        let dy = b.y as f32 + b.h as f32 / 2.0 - cy;
        dx * dx + dy * dy
    };
    buckets.sort_by(|a, b| dist(a).total_cmp(&dist(b)));
}

/// One context per bucket of a `width x height` frame.
pub fn bucket_regions(width: u32, height: u32, bucket_size: u32) -> Vec<RegionContext> {
    generate_buckets(width, height, bucket_size)
        .into_iter()
        .map(RegionContext::new)
        .collect()
}

/// Cooperative stop request shared with the render threads.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Render `samples` passes into every region, regions in parallel.
///
/// The flag is checked before each pass; returns `false` when the render
/// was cancelled.
pub fn render_tiles(
    renderer: &Renderer,
    scene: &dyn SceneBase,
    regions: &mut [RegionContext],
    samples: u32,
    cancel: &CancelFlag,
) -> bool {
    regions.par_iter_mut().for_each(|region| {
        for _ in 0..samples {
            if cancel.is_cancelled() {
                return;
            }
            renderer.render_scene(scene, region);
        }
    });
    let done = !cancel.is_cancelled();
    log::debug!(
        "Rendered {} buckets x {samples} samples{}",
        regions.len(),
        if done { "" } else { " (cancelled)" }
    );
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RendererSettings;
    use ray_core::{CameraDesc, DisplayType, MeshDesc, Scene, ShadingNodeDesc};
    use ray_math::{Mat4, Vec3};

    #[test]
    fn test_generate_buckets_exact_fit() {
        let buckets = generate_buckets(128, 128, 64);
        assert_eq!(buckets.len(), 4);
        let total: usize = buckets.iter().map(Rect::area).sum();
        assert_eq!(total, 128 * 128);
    }

    #[test]
    fn test_generate_buckets_partial_fit() {
        let buckets = generate_buckets(100, 70, 64);
        assert_eq!(buckets.len(), 4);
        let total: usize = buckets.iter().map(Rect::area).sum();
        assert_eq!(total, 100 * 70);
        assert!(buckets.iter().any(|b| b.w == 36 && b.h == 6));
    }

    #[test]
    fn test_spiral_order() {
        let buckets = generate_buckets(192, 192, 64);
        assert_eq!(buckets.len(), 9);
        assert_eq!((buckets[0].x, buckets[0].y), (64, 64));
    }

    fn emissive_scene() -> Scene {
        let mut scene = Scene::new();
        let m = scene.add_material(ShadingNodeDesc::emissive(Vec3::ONE, 1.0)).unwrap();
        let positions = vec![
            Vec3::new(-10.0, 0.0, -10.0),
            Vec3::new(10.0, 0.0, -10.0),
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(-10.0, 0.0, 10.0),
        ];
        let mesh = scene
            .add_mesh(&MeshDesc::new("ground", positions, vec![0, 2, 1, 0, 3, 2], m, None))
            .unwrap();
        scene.add_mesh_instance(mesh, Mat4::IDENTITY).unwrap();
        scene.add_camera(
            CameraDesc::default()
                .look_at(Vec3::new(0.0, 2.0, 0.0), Vec3::ZERO, Vec3::Z)
                .with_display(DisplayType::Linear, 1.0, 0.0),
        );
        scene.finalize();
        scene
    }

    #[test]
    fn test_render_tiles_covers_frame() {
        let renderer = Renderer::new(RendererSettings::new(20, 12)).unwrap();
        let scene = emissive_scene();
        let mut regions = bucket_regions(20, 12, 8);
        assert!(render_tiles(&renderer, &scene, &mut regions, 2, &CancelFlag::new()));
        assert!(regions.iter().all(|r| r.iteration() == 2));
        let pixels = renderer.get_pixels_ref(false);
        assert!(pixels.pixels().iter().all(|p| (p.x - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_cancelled_render_stops_early() {
        let renderer = Renderer::new(RendererSettings::new(16, 16)).unwrap();
        let scene = emissive_scene();
        let mut regions = bucket_regions(16, 16, 8);
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(!render_tiles(&renderer, &scene, &mut regions, 4, &cancel));
        assert!(regions.iter().all(|r| r.iteration() == 0));
        cancel.reset();
        assert!(!cancel.is_cancelled());
    }
}
