//! Generator configuration
//!
//! Loaded from TOML. Every section is optional and falls back to the
//! defaults in `constants::defaults`. Values are sanitized on load: grids
//! are clamped to one work group per axis and bounds are normalized.

use crate::constants::defaults;
use crate::error::GenResult;
use crate::gpu::dispatch::DispatchGrid;
use crate::world_gpu::{MeshDrawMode, PlacementBounds, PointCountSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub work_groups: DispatchGrid,
    pub draw_mode: MeshDrawMode,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            work_groups: DispatchGrid::from(defaults::MESH_WORK_GROUPS),
            draw_mode: MeshDrawMode::Surface,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub bounds: PlacementBounds,
    pub work_groups: DispatchGrid,
    pub count_source: PointCountSource,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            bounds: PlacementBounds::default(),
            work_groups: DispatchGrid::from(defaults::PLACEMENT_WORK_GROUPS),
            count_source: PointCountSource::Capacity,
        }
    }
}

/// Where the terrain sits in the world and how points are shown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub terrain_scale: [f32; 3],
    pub terrain_offset: [f32; 3],
    pub entity_lift: f32,
    pub point_color: [f32; 4],
    pub clear_color: [f32; 4],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            terrain_scale: defaults::TERRAIN_SCALE,
            terrain_offset: defaults::TERRAIN_OFFSET,
            entity_lift: defaults::ENTITY_LIFT,
            point_color: defaults::POINT_COLOR,
            clear_color: defaults::CLEAR_COLOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub target_size: [u32; 2],
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target_size: defaults::TARGET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// World-data image; synthesized when absent
    pub world_data: Option<PathBuf>,
    pub mesh: MeshConfig,
    pub placement: PlacementConfig,
    pub scene: SceneConfig,
    pub output: OutputConfig,
}

impl GeneratorConfig {
    /// Read and sanitize a TOML file
    pub fn load(path: &Path) -> GenResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;

        // Relative image paths are relative to the config file
        if let (Some(image), Some(dir)) = (&config.world_data, path.parent()) {
            if image.is_relative() {
                config.world_data = Some(dir.join(image));
            }
        }

        log::info!("[Config] Loaded {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> GenResult<Self> {
        let config: Self = toml::from_str(text)?;
        Ok(config.sanitized())
    }

    pub fn to_toml_string(&self) -> GenResult<String> {
        toml::to_string_pretty(self).map_err(|e| crate::error::GenError::Config(e.to_string()))
    }

    /// Clamp grids and normalize bounds
    pub fn sanitized(mut self) -> Self {
        self.mesh.work_groups = self.mesh.work_groups.clamped();
        self.placement.work_groups = self.placement.work_groups.clamped();
        self.placement.bounds = self.placement.bounds.normalized();
        self.output.target_size = [
            self.output.target_size[0].max(1),
            self.output.target_size[1].max(1),
        ];
        self
    }
}
