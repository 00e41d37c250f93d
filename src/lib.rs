pub mod config;
pub mod constants;
pub mod error;
pub mod gpu;
pub mod scene;
pub mod world_gpu;

use gpu::recording::RecordedTexture;
use gpu::wgpu_backend::WgpuTexture;
use image::RgbaImage;

pub use config::GeneratorConfig;
pub use error::{GenError, GenResult, GpuErrorContext};
pub use gpu::{
    ArenaLayout, BarrierKind, DispatchGrid, GpuBackend, MemoryRegion, RecordingBackend,
    RegionSpec, ThreadCount, WgpuBackend, WgpuContext, WorkGroupShape, WorkGroupSizer,
};
pub use scene::{Scene, SceneStatus, SceneTransforms};
pub use world_gpu::{
    GenerationState, MeshDrawMode, PlacementBounds, PlacementPipeline, PointCountSource,
    TerrainMeshPipeline,
};

/// Commonly used types for driving generation
pub mod prelude {
    pub use crate::config::GeneratorConfig;
    pub use crate::error::{GenError, GenResult};
    pub use crate::gpu::backend::{BarrierKind, GpuBackend};
    pub use crate::gpu::dispatch::{ComputeKernel, DispatchGrid, WorkGroupShape};
    pub use crate::scene::{Scene, SceneStatus};
    pub use crate::world_gpu::{GenerationState, MeshDrawMode, PlacementBounds, PointCountSource};
}

/// Scene running the kernels through their CPU renditions
pub fn recording_scene(config: &GeneratorConfig, world_data: &RgbaImage) -> GenResult<Scene<RecordingBackend>> {
    let (width, height) = world_data.dimensions();
    let texture = RecordedTexture::from_rgba("World Data", width, height, world_data.as_raw().clone())?;
    Ok(Scene::new(
        config,
        world_gpu::heightmap_kernel(),
        world_gpu::placement_kernel(),
        texture,
    ))
}

/// Scene with kernels compiled for a wgpu device
pub fn wgpu_scene(
    backend: &WgpuBackend,
    config: &GeneratorConfig,
    world_data: &RgbaImage,
) -> GenResult<Scene<WgpuBackend>> {
    use constants::kernels;

    let (width, height) = world_data.dimensions();
    let texture = WgpuTexture::from_rgba(backend.context(), "World Data", width, height, world_data.as_raw())?;
    let heightmap = backend.compile_kernel(
        kernels::HEIGHTMAP_LABEL,
        world_gpu::HEIGHTMAP_WGSL,
        kernels::HEIGHTMAP_ENTRY,
    )?;
    let placement = backend.compile_kernel(
        kernels::PLACEMENT_LABEL,
        world_gpu::PLACEMENT_WGSL,
        kernels::PLACEMENT_ENTRY,
    )?;
    Ok(Scene::new(config, heightmap, placement, texture))
}

/// World data named by the config, or a synthesized one
pub fn world_data_for(config: &GeneratorConfig) -> GenResult<RgbaImage> {
    match &config.world_data {
        Some(path) => world_gpu::world_data::load(path),
        None => {
            log::info!("[WorldData] No image configured, synthesizing 256x256");
            Ok(world_gpu::world_data::synthesize(256, 256))
        }
    }
}
