/// Headless procedural placement run
/// Generates the terrain mesh and entity points once, draws one offscreen
/// frame and reports the counts.
///
/// Usage: procedural-placement [config.toml]

use anyhow::{Context, Result};
use glam::Vec4;
use procedural_placement::gpu::backend::VertexArrayKind;
use procedural_placement::{
    recording_scene, wgpu_scene, world_data_for, GeneratorConfig, WgpuBackend, WgpuContext,
};
use std::path::Path;

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,procedural_placement=debug"),
    )
    .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GeneratorConfig::load(Path::new(&path))
            .with_context(|| format!("loading config {}", path))?,
        None => GeneratorConfig::default(),
    };

    let world_data = world_data_for(&config).context("preparing world data")?;

    match pollster::block_on(WgpuContext::headless()) {
        Ok(ctx) => run_on_device(ctx, &config, &world_data),
        Err(e) => {
            log::warn!("[Main] {}; running kernels on the CPU instead", e);
            run_recorded(&config, &world_data)
        }
    }
}

fn run_on_device(ctx: WgpuContext, config: &GeneratorConfig, world_data: &image::RgbaImage) -> Result<()> {
    let mut backend = WgpuBackend::new(ctx, config.output.target_size);
    backend.set_clear_color(config.scene.clear_color);

    let mut scene = wgpu_scene(&backend, config, world_data).context("compiling kernels")?;
    scene.startup(&mut backend).context("startup generation")?;

    let [width, height] = config.output.target_size;
    let view_proj = scene.view_projection(width as f32 / height.max(1) as f32);
    let transforms = *scene.transforms();
    backend.set_draw_uniforms(
        VertexArrayKind::Surface,
        view_proj,
        transforms.terrain_model(),
        Vec4::ONE,
    );
    backend.set_draw_uniforms(
        VertexArrayKind::Points,
        view_proj,
        transforms.entity_model(),
        Vec4::from_array(config.scene.point_color),
    );

    backend.begin_frame()?;
    scene.draw(&mut backend)?;
    let draws = backend.end_frame()?;

    let status = scene.status();
    log::info!(
        "[Main] Frame drew {} batches: {} vertices, {} indices, {} points",
        draws,
        status.vertex_count,
        status.index_count,
        status.point_count
    );

    // Diagnostic only: the frame itself never waits on this count
    if let Some(set) = scene.placement().points() {
        let accepted = backend.read_u32(&set.buffer, 0)?;
        log::info!("[Main] Kernel accepted {} of {} candidates", accepted, set.max_points);
    }

    scene.release(&mut backend);
    Ok(())
}

fn run_recorded(config: &GeneratorConfig, world_data: &image::RgbaImage) -> Result<()> {
    let mut backend = procedural_placement::RecordingBackend::new();
    let mut scene = recording_scene(config, world_data)?;
    scene.startup(&mut backend).context("startup generation")?;
    scene.draw(&mut backend)?;

    if let Some(set) = scene.placement().points() {
        let accepted = backend.read_u32(&set.buffer, 0).unwrap_or(0);
        log::info!("[Main] Kernel accepted {} of {} candidates", accepted, set.max_points);
    }
    log::info!(
        "[Main] {} commands recorded, {} synchronization hazards",
        backend.commands().len(),
        backend.hazards().len()
    );
    log::info!("[Main] {:?}", scene.status());

    scene.release(&mut backend);
    Ok(())
}
