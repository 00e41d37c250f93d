//! Scene orchestration
//!
//! Owns both generation pipelines over one shared world-data texture and
//! is the surface the frame loop (or a UI) drives: regeneration triggers,
//! per-frame drawing and counts for display.

use crate::config::GeneratorConfig;
use crate::error::GenResult;
use crate::gpu::backend::GpuBackend;
use crate::gpu::dispatch::DispatchGrid;
use crate::world_gpu::{
    GenerationState, MeshDrawMode, PlacementBounds, PlacementPipeline, TerrainMeshPipeline,
};
use glam::{Mat4, Vec3};
use serde::Serialize;

/// Model transforms of the terrain and the points placed on it
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SceneTransforms {
    pub terrain_scale: Vec3,
    pub terrain_offset: Vec3,
    pub entity_lift: f32,
}

impl SceneTransforms {
    /// Mesh space is the unit square in XZ; it is centred, then scaled
    pub fn terrain_model(&self) -> Mat4 {
        Mat4::from_scale(self.terrain_scale) * Mat4::from_translation(self.terrain_offset)
    }

    /// Points share the terrain's frame, lifted slightly off the surface
    pub fn entity_model(&self) -> Mat4 {
        self.terrain_model() * Mat4::from_translation(Vec3::new(0.0, self.entity_lift, 0.0))
    }
}

impl From<&GeneratorConfig> for SceneTransforms {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            terrain_scale: Vec3::from_array(config.scene.terrain_scale),
            terrain_offset: Vec3::from_array(config.scene.terrain_offset),
            entity_lift: config.scene.entity_lift,
        }
    }
}

/// Counts and states for display
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct SceneStatus {
    pub mesh_state: GenerationState,
    pub vertex_count: u32,
    pub index_count: u32,
    pub placement_state: GenerationState,
    pub point_count: u32,
    pub max_points: u32,
}

pub struct Scene<G: GpuBackend> {
    terrain: TerrainMeshPipeline<G>,
    placement: PlacementPipeline<G>,
    mesh_grid: DispatchGrid,
    mesh_draw_mode: MeshDrawMode,
    initial_bounds: PlacementBounds,
    initial_grid: DispatchGrid,
    transforms: SceneTransforms,
}

impl<G: GpuBackend> Scene<G> {
    pub fn new(
        config: &GeneratorConfig,
        terrain_kernel: G::Kernel,
        placement_kernel: G::Kernel,
        world_data: G::Texture,
    ) -> Self {
        let config = config.clone().sanitized();
        Self {
            terrain: TerrainMeshPipeline::new(terrain_kernel, world_data.clone()),
            placement: PlacementPipeline::new(
                placement_kernel,
                world_data,
                config.placement.count_source,
            ),
            mesh_grid: config.mesh.work_groups,
            mesh_draw_mode: config.mesh.draw_mode,
            initial_bounds: config.placement.bounds,
            initial_grid: config.placement.work_groups,
            transforms: SceneTransforms::from(&config),
        }
    }

    /// Generate the mesh, then the entities on top of it
    pub fn startup(&mut self, backend: &mut G) -> GenResult<()> {
        log::info!("[Scene] Startup generation");
        self.terrain.generate_mesh(backend, self.mesh_grid)?;
        self.placement
            .generate_entities(backend, self.initial_bounds, self.initial_grid)?;
        log::info!("[Scene] Ready: {:?}", self.status());
        Ok(())
    }

    /// Regenerate the terrain with a new grid (clamped to one group per axis)
    ///
    /// The grid is kept only if the mesh is; a failure leaves `mesh_grid`
    /// describing the mesh still drawn.
    pub fn regenerate_mesh(&mut self, backend: &mut G, grid: DispatchGrid) -> GenResult<()> {
        let grid = grid.clamped();
        self.terrain.generate_mesh(backend, grid)?;
        self.mesh_grid = grid;
        Ok(())
    }

    /// Regenerate the entities with their current bounds and grid
    pub fn regenerate_entities(&mut self, backend: &mut G) -> GenResult<()> {
        self.placement.regenerate(backend)
    }

    pub fn set_placement_bounds(&mut self, backend: &mut G, bounds: PlacementBounds) -> GenResult<bool> {
        self.placement.set_bounds(backend, bounds)
    }

    pub fn set_placement_grid(&mut self, backend: &mut G, grid: DispatchGrid) -> GenResult<bool> {
        self.placement.set_dispatch_grid(backend, grid)
    }

    pub fn set_mesh_draw_mode(&mut self, mode: MeshDrawMode) {
        self.mesh_draw_mode = mode;
    }

    /// Swap the world data both pipelines read and regenerate everything
    ///
    /// Each pipeline takes the new texture only when its own regeneration
    /// succeeds. A failed mesh leaves both on the old data; a failed
    /// placement leaves the points (and their texture) as they were.
    pub fn set_world_data(&mut self, backend: &mut G, world_data: G::Texture) -> GenResult<()> {
        self.terrain
            .generate_mesh_from(backend, self.mesh_grid, world_data.clone())?;
        self.placement
            .generate_entities_from(backend, world_data)
            .map_err(|e| {
                log::warn!("[Scene] Terrain switched to new world data, entities did not");
                e
            })
    }

    /// Per-frame draw: only previously bound state is touched
    pub fn draw(&self, backend: &mut G) -> GenResult<()> {
        self.terrain.draw(backend, self.mesh_draw_mode)?;
        self.placement.draw(backend)
    }

    pub fn status(&self) -> SceneStatus {
        SceneStatus {
            mesh_state: self.terrain.state(),
            vertex_count: self.terrain.vertex_count(),
            index_count: self.terrain.index_count(),
            placement_state: self.placement.state(),
            point_count: self.placement.point_count(),
            max_points: self.placement.max_points(),
        }
    }

    pub fn transforms(&self) -> &SceneTransforms {
        &self.transforms
    }

    pub fn terrain(&self) -> &TerrainMeshPipeline<G> {
        &self.terrain
    }

    pub fn placement(&self) -> &PlacementPipeline<G> {
        &self.placement
    }

    pub fn mesh_grid(&self) -> DispatchGrid {
        self.mesh_grid
    }

    /// Camera looking down onto the terrain from its south edge
    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        let extent = self.transforms.terrain_scale;
        let eye = Vec3::new(0.0, extent.x * 0.6, extent.z * 0.9);
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(45f32.to_radians(), aspect.max(0.01), 0.1, 100.0);
        projection * view
    }

    /// Give back every buffer the pipelines hold
    pub fn release(&mut self, backend: &mut G) {
        self.terrain.release(backend);
        self.placement.release(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn test_terrain_is_centred_then_scaled() {
        let transforms = SceneTransforms::from(&GeneratorConfig::default());
        let model = transforms.terrain_model();

        let corner = model * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((corner.x + 5.0).abs() < 1e-5);
        assert!((corner.z + 3.81).abs() < 1e-5);

        let far = model * Vec4::new(1.0, 1.0, 1.0, 1.0);
        assert!((far.x - 5.0).abs() < 1e-5);
        assert!((far.y - 0.52).abs() < 1e-5);
    }

    #[test]
    fn test_entities_are_lifted_in_local_space() {
        let transforms = SceneTransforms::from(&GeneratorConfig::default());
        let ground = transforms.terrain_model() * Vec4::new(0.5, 0.0, 0.5, 1.0);
        let point = transforms.entity_model() * Vec4::new(0.5, 0.0, 0.5, 1.0);

        assert!((point.y - ground.y - 0.1 * 0.52).abs() < 1e-5);
        assert_eq!(point.x, ground.x);
    }
}
