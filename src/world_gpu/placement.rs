//! Entity placement
//!
//! The placement buffer is a 16-byte counter header followed by a point
//! array sized for one point per kernel thread. The kernel appends accepted
//! points through an atomic increment of the header, so the array is
//! compacted on the GPU and only the first `count` slots are meaningful.

use crate::constants::{attributes, bindings, defaults, regions, strides};
use crate::error::GenResult;
use crate::gpu::arena::{ArenaLayout, MemoryRegion, RegionSpec};
use crate::gpu::backend::{
    AttributeFormat, BarrierKind, BufferUsages, DrawPrimitive, GpuBackend, KernelBindings,
    VertexArray, VertexArrayKind,
};
use crate::gpu::dispatch::{DispatchGrid, ThreadCount, WorkGroupSizer};
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use serde::{Deserialize, Serialize};

use super::state::GenerationState;

/// Texture-space rectangle candidates are drawn from
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlacementBounds {
    pub min: Vec2,
    pub max: Vec2,
}

impl PlacementBounds {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Reorder components so `min <= max` on both axes
    pub fn normalized(self) -> Self {
        Self {
            min: self.min.min(self.max),
            max: self.min.max(self.max),
        }
    }

    pub fn extent(&self) -> Vec2 {
        self.max - self.min
    }
}

impl Default for PlacementBounds {
    fn default() -> Self {
        Self::new(
            Vec2::from_array(defaults::PLACEMENT_MIN),
            Vec2::from_array(defaults::PLACEMENT_MAX),
        )
    }
}

/// Uniform block read by the placement kernel
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct PlacementParams {
    pub tex_coord_offset: [f32; 2],
    pub tex_coord_scale: [f32; 2],
}

impl From<PlacementBounds> for PlacementParams {
    fn from(bounds: PlacementBounds) -> Self {
        Self {
            tex_coord_offset: bounds.min.to_array(),
            tex_coord_scale: bounds.extent().to_array(),
        }
    }
}

/// Where the draw call takes its point count from
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointCountSource {
    /// Draw the reserved capacity; unused slots render as leftovers
    #[default]
    Capacity,
    /// Draw the kernel's own count, read on the GPU from the header
    Indirect,
}

impl PointCountSource {
    /// Initial header contents: `{count, instance_count, first_vertex, first_instance}`
    fn header(self) -> [u32; 4] {
        match self {
            PointCountSource::Capacity => [0; 4],
            PointCountSource::Indirect => [0, 1, 0, 0],
        }
    }
}

/// Region layout of a placement buffer for `max_points`
pub fn placement_layout(max_points: u64) -> GenResult<ArenaLayout> {
    ArenaLayout::new(&[
        RegionSpec::new(regions::COUNTER, strides::COUNTER_HEADER, 1),
        RegionSpec::new(regions::POINTS, strides::POINT, max_points),
    ])
}

/// A generated placement buffer and the vertex state that reads it
#[derive(Debug)]
pub struct PlacementSet<B> {
    pub buffer: B,
    pub layout: ArenaLayout,
    pub vertex_array: VertexArray<B>,
    pub bounds: PlacementBounds,
    pub grid: DispatchGrid,
    pub threads: ThreadCount,
    pub max_points: u32,
    pub point_count: u32,
}

impl<B> PlacementSet<B> {
    fn release<G: GpuBackend<Buffer = B>>(self, backend: &mut G) {
        drop(self.vertex_array);
        backend.release(self.buffer);
    }
}

/// Owns the placement kernel and the current point set
pub struct PlacementPipeline<G: GpuBackend> {
    kernel: G::Kernel,
    sizer: WorkGroupSizer,
    world_data: G::Texture,
    count_source: PointCountSource,
    bounds: PlacementBounds,
    grid: DispatchGrid,
    state: GenerationState,
    current: Option<PlacementSet<G::Buffer>>,
}

impl<G: GpuBackend> PlacementPipeline<G> {
    pub fn new(kernel: G::Kernel, world_data: G::Texture, count_source: PointCountSource) -> Self {
        Self {
            kernel,
            sizer: WorkGroupSizer::new(),
            world_data,
            count_source,
            bounds: PlacementBounds::default(),
            grid: DispatchGrid::from(defaults::PLACEMENT_WORK_GROUPS),
            state: GenerationState::Uninitialized,
            current: None,
        }
    }

    /// Regenerate points inside `bounds` with `grid` work groups
    ///
    /// `bounds` is normalized first and never causes an error. The bounds
    /// and grid become the pipeline's inputs only once the new points are
    /// ready; a failed attempt leaves them describing the drawn set.
    pub fn generate_entities(
        &mut self,
        backend: &mut G,
        bounds: PlacementBounds,
        grid: DispatchGrid,
    ) -> GenResult<()> {
        self.generate(backend, bounds.normalized(), grid, None)
    }

    /// Regenerate from new world data, which is kept only if the points are
    pub fn generate_entities_from(&mut self, backend: &mut G, world_data: G::Texture) -> GenResult<()> {
        self.generate(backend, self.bounds, self.grid, Some(world_data))
    }

    /// Regenerate with the current bounds and grid
    pub fn regenerate(&mut self, backend: &mut G) -> GenResult<()> {
        self.generate(backend, self.bounds, self.grid, None)
    }

    /// Change the bounds, regenerating only if they differ after normalizing
    ///
    /// Returns whether a regeneration ran.
    pub fn set_bounds(&mut self, backend: &mut G, bounds: PlacementBounds) -> GenResult<bool> {
        let bounds = bounds.normalized();
        if bounds == self.bounds && self.state.is_ready() {
            return Ok(false);
        }
        self.generate(backend, bounds, self.grid, None)?;
        Ok(true)
    }

    /// Change the dispatch grid, regenerating only if it differs
    ///
    /// Axes are clamped to one work group.
    pub fn set_dispatch_grid(&mut self, backend: &mut G, grid: DispatchGrid) -> GenResult<bool> {
        let grid = grid.clamped();
        if grid == self.grid && self.state.is_ready() {
            return Ok(false);
        }
        self.generate(backend, self.bounds, grid, None)?;
        Ok(true)
    }

    fn generate(
        &mut self,
        backend: &mut G,
        bounds: PlacementBounds,
        grid: DispatchGrid,
        world_data: Option<G::Texture>,
    ) -> GenResult<()> {
        let previous = self.state;
        self.state = GenerationState::Generating;

        let built = self.sizer.size_dispatch(&self.kernel, grid).and_then(|threads| {
            let texture = world_data.as_ref().unwrap_or(&self.world_data);
            self.build(backend, bounds, grid, threads, texture)
        });

        match built {
            Ok(set) => {
                log::info!(
                    "[Placement] Reserved {} points in {:?}..{:?} (grid {:?}, {:?})",
                    set.max_points,
                    set.bounds.min,
                    set.bounds.max,
                    set.grid.as_array(),
                    self.count_source
                );
                if let Some(old) = self.current.replace(set) {
                    old.release(backend);
                }
                self.bounds = bounds;
                self.grid = grid;
                if let Some(world_data) = world_data {
                    self.world_data = world_data;
                }
                self.state = GenerationState::Ready;
                Ok(())
            }
            Err(e) => {
                log::warn!("[Placement] Regeneration failed, keeping previous points: {}", e);
                self.state = previous;
                Err(e)
            }
        }
    }

    fn build(
        &self,
        backend: &mut G,
        bounds: PlacementBounds,
        grid: DispatchGrid,
        threads: ThreadCount,
        world_data: &G::Texture,
    ) -> GenResult<PlacementSet<G::Buffer>> {
        let max_points = threads.max_points();
        let layout = placement_layout(max_points as u64)?;

        log::debug!(
            "[Placement] Buffer {} bytes for {} points",
            layout.total_size(),
            max_points
        );

        let mut usage = BufferUsages::STORAGE
            | BufferUsages::VERTEX
            | BufferUsages::COPY_DST
            | BufferUsages::COPY_SRC;
        if self.count_source == PointCountSource::Indirect {
            usage |= BufferUsages::INDIRECT;
        }

        let buffer = backend.allocate("Placement Points", layout.total_size(), usage)?;

        match self.populate(backend, &buffer, &layout, bounds, grid, world_data) {
            Ok(vertex_array) => Ok(PlacementSet {
                buffer,
                layout,
                vertex_array,
                bounds,
                grid,
                threads,
                max_points,
                point_count: max_points,
            }),
            Err(e) => {
                backend.release(buffer);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        backend: &mut G,
        buffer: &G::Buffer,
        layout: &ArenaLayout,
        bounds: PlacementBounds,
        grid: DispatchGrid,
        world_data: &G::Texture,
    ) -> GenResult<VertexArray<G::Buffer>> {
        let counter = layout.require(regions::COUNTER)?;
        let points = layout.require(regions::POINTS)?;

        backend.write_bytes(buffer, counter.offset, bytemuck::cast_slice(&self.count_source.header()))?;
        backend.insert_barrier(BarrierKind::CpuWriteToKernel);

        // Counter and points bound together so the kernel can append
        let whole = MemoryRegion {
            name: "placement".to_string(),
            element_stride: strides::POINT,
            element_count: layout.total_size() / strides::POINT,
            offset: 0,
            size: layout.total_size(),
        };
        let params = PlacementParams::from(bounds);

        let kernel_bindings = KernelBindings::new()
            .storage(bindings::placement::OUTPUT, buffer, &whole)
            .texture(bindings::WORLD_DATA_UNIT, world_data)
            .params(bytemuck::bytes_of(&params));

        backend.dispatch(&self.kernel, &kernel_bindings, grid)?;

        // Counter authoritative, then points readable as vertices
        backend.insert_barrier(BarrierKind::StorageToStorage);
        backend.insert_barrier(BarrierKind::StorageToVertex);

        let mut vertex_array = VertexArray::new(VertexArrayKind::Points);
        vertex_array.bind_vertex_source(
            attributes::POSITION,
            buffer.clone(),
            points,
            AttributeFormat::Float32x3,
        );
        Ok(vertex_array)
    }

    /// Draw the current points; nothing is drawn while `point_count` is zero
    pub fn draw(&self, backend: &mut G) -> GenResult<()> {
        let set = match &self.current {
            Some(set) if set.point_count > 0 => set,
            _ => return Ok(()),
        };

        let primitive = match self.count_source {
            PointCountSource::Capacity => DrawPrimitive::Points {
                count: set.point_count,
            },
            PointCountSource::Indirect => DrawPrimitive::PointsIndirect {
                args: &set.buffer,
                offset: set.layout.require(regions::COUNTER)?.offset,
            },
        };
        backend.draw(&set.vertex_array, primitive)
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Bounds of the drawn points (the initial bounds before any success)
    pub fn bounds(&self) -> PlacementBounds {
        self.bounds
    }

    pub fn dispatch_grid(&self) -> DispatchGrid {
        self.grid
    }

    pub fn count_source(&self) -> PointCountSource {
        self.count_source
    }

    /// Points drawn per frame
    pub fn point_count(&self) -> u32 {
        self.current.as_ref().map_or(0, |s| s.point_count)
    }

    pub fn max_points(&self) -> u32 {
        self.current.as_ref().map_or(0, |s| s.max_points)
    }

    pub fn points(&self) -> Option<&PlacementSet<G::Buffer>> {
        self.current.as_ref()
    }

    pub fn release(&mut self, backend: &mut G) {
        if let Some(set) = self.current.take() {
            set.release(backend);
        }
        self.state = GenerationState::Uninitialized;
    }
}
