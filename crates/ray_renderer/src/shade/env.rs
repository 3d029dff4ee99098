//! Environment radiance for rays that leave the scene.

use std::f32::consts::PI;

use ray_core::{dir_to_latlong, LightKind, SceneSnapshot};
use ray_math::Vec3;

use crate::ray::RayData;
use crate::sampling::power_heuristic;
use crate::settings::PassSettings;

use super::surface::sample_texture;

/// Pdf of environment light samples drawn without a quad-tree.
pub const UNIFORM_ENV_PDF: f32 = 0.5 / PI;

/// Radiance of the lighting environment along `dir`.
pub fn env_radiance(sc: &SceneSnapshot, dir: Vec3) -> Vec3 {
    let env = &sc.env;
    let map = match env.env_map {
        Some(_) => sample_texture(sc, env.env_map, dir_to_latlong(dir, env.env_map_rotation), 0.0).truncate(),
        None => Vec3::ONE,
    };
    env.env_col * map
}

/// Radiance of the background seen by camera rays along `dir`.
pub fn background_radiance(sc: &SceneSnapshot, dir: Vec3) -> Vec3 {
    let env = &sc.env;
    let map = match env.back_map {
        Some(_) => sample_texture(sc, env.back_map, dir_to_latlong(dir, env.back_map_rotation), 0.0).truncate(),
        None => Vec3::ONE,
    };
    env.back_col * map
}

/// Whether the environment takes part in light sampling.
#[inline]
pub fn env_is_sampled(sc: &SceneSnapshot) -> bool {
    sc.lights.last().is_some_and(|l| l.kind == LightKind::Env)
}

/// Solid-angle pdf of sampling `dir` from the environment light.
pub fn env_light_pdf(sc: &SceneSnapshot, dir: Vec3) -> f32 {
    match &sc.env.qtree {
        Some(qtree) => qtree.pdf(dir),
        None => UNIFORM_ENV_PDF,
    }
}

/// Contribution of a miss, not yet multiplied by the ray throughput.
///
/// Bounced rays see the lighting environment, weighted against light
/// sampling when the environment is a light. Camera rays (including those
/// that only passed through transparent surfaces) see the background.
pub fn miss_color(ray: &RayData, ps: &PassSettings, sc: &SceneSnapshot) -> Vec3 {
    if ray.depth.is_bounced() {
        let mut col = env_radiance(sc, ray.d);
        if env_is_sampled(sc) {
            col *= power_heuristic(ray.pdf, env_light_pdf(sc, ray.d));
        }
        col
    } else if ps.no_background {
        Vec3::ZERO
    } else {
        background_radiance(sc, ray.d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::RayDepth;
    use ray_core::{EnvironmentDesc, Scene};

    fn env_scene(desc: EnvironmentDesc) -> Scene {
        let mut scene = Scene::new();
        scene.set_environment(&desc).unwrap();
        scene.finalize();
        scene
    }

    #[test]
    fn test_camera_rays_see_background() {
        let scene = env_scene(EnvironmentDesc {
            env_col: Vec3::splat(2.0),
            back_col: Vec3::new(0.1, 0.2, 0.3),
            multiple_importance: false,
            ..Default::default()
        });
        let sc = scene.snapshot().unwrap();
        let ps = PassSettings::default();

        let camera = RayData::default();
        assert_eq!(miss_color(&camera, &ps, sc), Vec3::new(0.1, 0.2, 0.3));

        let bounced = RayData {
            depth: RayDepth::PRIMARY.add_diffuse(),
            ..Default::default()
        };
        assert_eq!(miss_color(&bounced, &ps, sc), Vec3::splat(2.0));

        let hidden = PassSettings {
            no_background: true,
            ..Default::default()
        };
        assert_eq!(miss_color(&camera, &hidden, sc), Vec3::ZERO);
    }

    #[test]
    fn test_sampled_environment_is_mis_weighted() {
        let scene = env_scene(EnvironmentDesc::uniform(Vec3::ONE));
        let sc = scene.snapshot().unwrap();
        assert!(env_is_sampled(sc));

        let ray = RayData {
            depth: RayDepth::PRIMARY.add_diffuse(),
            pdf: UNIFORM_ENV_PDF,
            ..Default::default()
        };
        let col = miss_color(&ray, &PassSettings::default(), sc);
        assert!((col - Vec3::splat(0.5)).length() < 1e-5);
    }
}
