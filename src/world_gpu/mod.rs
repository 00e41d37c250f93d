//! GPU-resident world generation
//!
//! Terrain and entity points are produced by compute kernels writing
//! directly into the buffers later draw calls read. The CPU only sizes,
//! lays out, dispatches and orders the work.
//!
//! Key components:
//! - TerrainMeshPipeline: vertex grid + triangle indices from world data
//! - PlacementPipeline: counter-headed point set with atomic append
//! - reference: CPU kernel bodies for headless runs

pub mod placement;
pub mod reference;
pub mod state;
pub mod terrain_mesh;
pub mod world_data;

#[cfg(test)]
mod tests;

pub use placement::{
    placement_layout, PlacementBounds, PlacementParams, PlacementPipeline, PlacementSet,
    PointCountSource,
};
pub use reference::{heightmap_kernel, placement_kernel, pcg_hash};
pub use state::GenerationState;
pub use terrain_mesh::{mesh_layouts, MeshDrawMode, TerrainMesh, TerrainMeshPipeline};

/// WGSL source of the terrain mesh kernel
pub const HEIGHTMAP_WGSL: &str = include_str!("shaders/heightmap.wgsl");

/// WGSL source of the placement kernel
pub const PLACEMENT_WGSL: &str = include_str!("shaders/placement.wgsl");
