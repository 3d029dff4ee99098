//! Renders a diffuse quad under a rect light and saves a PNG.
//!
//! ```text
//! cargo run --example render_quad --release -- [samples] [output.png]
//! ```

use anyhow::{Context, Result};
use ray_renderer::ray_core::{
    quad_positions, CameraDesc, DisplayType, LightDesc, MeshDesc, PassDesc, PrincipledDesc, RectLightDesc, Scene,
    ShadingNodeDesc,
};
use ray_renderer::ray_math::{Mat4, Vec3};
use ray_renderer::{bucket_regions, render_tiles, AuxBuffer, CancelFlag, Renderer, RendererSettings};

const WIDTH: u32 = 512;
const HEIGHT: u32 = 384;

fn build_scene() -> Result<Scene> {
    let mut scene = Scene::new();

    let floor = scene.add_material(ShadingNodeDesc::diffuse(Vec3::splat(0.8)))?;
    let (positions, indices) = quad_positions(
        Vec3::new(-2.0, 0.0, -2.0),
        Vec3::new(-2.0, 0.0, 2.0),
        Vec3::new(2.0, 0.0, 2.0),
        Vec3::new(2.0, 0.0, -2.0),
    );
    let mesh = scene.add_mesh(&MeshDesc::new("floor", positions, indices, floor, None))?;
    scene.add_mesh_instance(mesh, Mat4::IDENTITY)?;

    // A small metal panel standing on the floor
    let metal = scene.add_material(PrincipledDesc::metal(Vec3::new(0.9, 0.7, 0.5), 0.2))?;
    let (positions, indices) = quad_positions(
        Vec3::new(-0.5, 0.0, -0.8),
        Vec3::new(0.5, 0.0, -0.8),
        Vec3::new(0.5, 0.8, -0.8),
        Vec3::new(-0.5, 0.8, -0.8),
    );
    let panel = scene.add_mesh(&MeshDesc::new("panel", positions, indices, metal, Some(metal)))?;
    scene.add_mesh_instance(panel, Mat4::IDENTITY)?;

    scene.add_light(&LightDesc::Rect(RectLightDesc {
        color: Vec3::splat(4.0),
        transform: Mat4::from_translation(Vec3::new(0.0, 1.5, 0.0)),
        ..Default::default()
    }));

    scene.add_camera(
        CameraDesc::default()
            .look_at(Vec3::new(0.0, 1.6, 3.5), Vec3::new(0.0, 0.2, 0.0), Vec3::Y)
            .with_fov(40.0)
            .with_display(DisplayType::Srgb, 1.0, 0.0)
            .with_pass(PassDesc {
                max_total_depth: 4,
                output_base_color: true,
                output_depth_normals: true,
                ..Default::default()
            }),
    );
    scene.finalize();
    Ok(scene)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let samples: u32 = match args.next() {
        Some(s) => s.parse().context("samples must be a number")?,
        None => 64,
    };
    let output = args.next().unwrap_or_else(|| "render_quad.png".to_string());

    let start = std::time::Instant::now();
    let scene = build_scene()?;
    log::info!("Scene built in {:?}", start.elapsed());

    let renderer = Renderer::new(RendererSettings::new(WIDTH, HEIGHT))?;
    let mut regions = bucket_regions(WIDTH, HEIGHT, 64);

    let start = std::time::Instant::now();
    render_tiles(&renderer, &scene, &mut regions, samples, &CancelFlag::new());
    log::info!("Rendered {samples} spp in {:?}", start.elapsed());

    for region in &regions {
        renderer.denoise_image(region);
    }

    let stats = renderer.get_stats();
    log::info!(
        "Passes: {}, primary trace {} ms, secondary trace {} ms, denoise {} ms",
        stats.passes,
        stats.time_primary_trace_us / 1000,
        stats.time_secondary_trace_us / 1000,
        stats.time_denoise_us / 1000
    );

    renderer.get_pixels_ref(true).save_png(&output)?;
    if let Some(base) = renderer.get_aux_pixels_ref(AuxBuffer::BaseColor) {
        base.save_png(output.replace(".png", "_albedo.png"))?;
    }
    Ok(())
}
