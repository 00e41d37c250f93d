//! Terrain mesh generation
//!
//! A compute kernel writes a regular vertex grid straight into a vertex
//! buffer (position, normal and texcoord regions) and an index buffer. The
//! same regions are then described as vertex attribute streams, so the
//! mesh never passes through the CPU.

use crate::constants::{attributes, bindings, regions, strides};
use crate::error::GenResult;
use crate::gpu::arena::{ArenaLayout, RegionSpec};
use crate::gpu::backend::{
    AttributeFormat, BarrierKind, BufferUsages, DrawPrimitive, GpuBackend, KernelBindings,
    VertexArray, VertexArrayKind,
};
use crate::gpu::dispatch::{ComputeKernel, DispatchGrid, ThreadCount, WorkGroupSizer};
use serde::{Deserialize, Serialize};

use super::state::GenerationState;

/// How the terrain is drawn each frame
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshDrawMode {
    /// Indexed triangles over the full index range
    #[default]
    Surface,
    /// One point per generated vertex
    Vertices,
}

/// Region layouts of the two mesh buffers
pub fn mesh_layouts(vertex_count: u64, index_count: u64) -> GenResult<(ArenaLayout, ArenaLayout)> {
    let vertex = ArenaLayout::new(&[
        RegionSpec::new(regions::POSITION, strides::POSITION, vertex_count),
        RegionSpec::new(regions::NORMAL, strides::NORMAL, vertex_count),
        RegionSpec::new(regions::TEXCOORD, strides::TEXCOORD, vertex_count),
    ])?;
    let index = ArenaLayout::new(&[RegionSpec::new(regions::INDEX, strides::INDEX, index_count)])?;
    Ok((vertex, index))
}

/// A fully generated mesh and the vertex state that reads it
#[derive(Debug)]
pub struct TerrainMesh<B> {
    pub vertex_buffer: B,
    pub index_buffer: B,
    pub vertex_layout: ArenaLayout,
    pub index_layout: ArenaLayout,
    pub vertex_array: VertexArray<B>,
    pub grid: DispatchGrid,
    pub threads: ThreadCount,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl<B> TerrainMesh<B> {
    fn release<G: GpuBackend<Buffer = B>>(self, backend: &mut G) {
        // Vertex state goes first so the buffers have no other holders
        drop(self.vertex_array);
        backend.release(self.vertex_buffer);
        backend.release(self.index_buffer);
    }
}

/// Owns the terrain kernel, its sizer and the current mesh
pub struct TerrainMeshPipeline<G: GpuBackend> {
    kernel: G::Kernel,
    sizer: WorkGroupSizer,
    world_data: G::Texture,
    state: GenerationState,
    current: Option<TerrainMesh<G::Buffer>>,
}

impl<G: GpuBackend> TerrainMeshPipeline<G> {
    pub fn new(kernel: G::Kernel, world_data: G::Texture) -> Self {
        Self {
            kernel,
            sizer: WorkGroupSizer::new(),
            world_data,
            state: GenerationState::Uninitialized,
            current: None,
        }
    }

    /// Regenerate the mesh for `grid` work groups
    ///
    /// On failure nothing observable changes: the previous mesh, its counts
    /// and its state are kept, and any buffer allocated for the attempt is
    /// released.
    pub fn generate_mesh(&mut self, backend: &mut G, grid: DispatchGrid) -> GenResult<()> {
        self.generate(backend, grid, None)
    }

    /// Regenerate from new world data, which is kept only if the mesh is
    pub fn generate_mesh_from(
        &mut self,
        backend: &mut G,
        grid: DispatchGrid,
        world_data: G::Texture,
    ) -> GenResult<()> {
        self.generate(backend, grid, Some(world_data))
    }

    fn generate(&mut self, backend: &mut G, grid: DispatchGrid, world_data: Option<G::Texture>) -> GenResult<()> {
        let previous = self.state;
        self.state = GenerationState::Generating;

        let built = self.sizer.size_dispatch(&self.kernel, grid).and_then(|threads| {
            let texture = world_data.as_ref().unwrap_or(&self.world_data);
            self.build(backend, grid, threads, texture)
        });
        match built {
            Ok(mesh) => {
                log::info!(
                    "[TerrainMesh] Generated {} vertices, {} indices (grid {:?})",
                    mesh.vertex_count,
                    mesh.index_count,
                    grid.as_array()
                );
                // Old buffers go only once the new mesh is complete
                if let Some(old) = self.current.replace(mesh) {
                    old.release(backend);
                }
                if let Some(world_data) = world_data {
                    self.world_data = world_data;
                }
                self.state = GenerationState::Ready;
                Ok(())
            }
            Err(e) => {
                log::warn!("[TerrainMesh] Regeneration failed, keeping previous mesh: {}", e);
                self.state = previous;
                Err(e)
            }
        }
    }

    fn build(
        &self,
        backend: &mut G,
        grid: DispatchGrid,
        threads: ThreadCount,
        world_data: &G::Texture,
    ) -> GenResult<TerrainMesh<G::Buffer>> {
        let vertex_count = threads.grid_vertex_count();
        let index_count = threads.grid_index_count();

        let (vertex_layout, index_layout) = mesh_layouts(vertex_count as u64, index_count as u64)?;
        log::debug!(
            "[TerrainMesh] Vertex buffer {} bytes, index buffer {} bytes",
            vertex_layout.total_size(),
            index_layout.total_size()
        );

        let vertex_buffer = backend.allocate(
            "Terrain Vertices",
            vertex_layout.total_size(),
            BufferUsages::STORAGE | BufferUsages::VERTEX | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        )?;
        let index_buffer = match backend.allocate(
            "Terrain Indices",
            index_layout.total_size(),
            BufferUsages::STORAGE | BufferUsages::INDEX | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.release(vertex_buffer);
                return Err(e);
            }
        };

        match self.populate(
            backend,
            &vertex_buffer,
            &index_buffer,
            &vertex_layout,
            &index_layout,
            grid,
            world_data,
        ) {
            Ok(vertex_array) => Ok(TerrainMesh {
                vertex_buffer,
                index_buffer,
                vertex_layout,
                index_layout,
                vertex_array,
                grid,
                threads,
                vertex_count,
                index_count,
            }),
            Err(e) => {
                backend.release(vertex_buffer);
                backend.release(index_buffer);
                Err(e)
            }
        }
    }

    /// Dispatch into freshly allocated buffers and describe them as vertex state
    fn populate(
        &self,
        backend: &mut G,
        vertex_buffer: &G::Buffer,
        index_buffer: &G::Buffer,
        vertex_layout: &ArenaLayout,
        index_layout: &ArenaLayout,
        grid: DispatchGrid,
        world_data: &G::Texture,
    ) -> GenResult<VertexArray<G::Buffer>> {
        let position = vertex_layout.require(regions::POSITION)?;
        let normal = vertex_layout.require(regions::NORMAL)?;
        let texcoord = vertex_layout.require(regions::TEXCOORD)?;
        let index = index_layout.require(regions::INDEX)?;

        let kernel_bindings = KernelBindings::new()
            .storage(bindings::mesh::POSITIONS, vertex_buffer, position)
            .storage(bindings::mesh::NORMALS, vertex_buffer, normal)
            .storage(bindings::mesh::TEXCOORDS, vertex_buffer, texcoord)
            .storage(bindings::mesh::INDICES, index_buffer, index)
            .texture(bindings::WORLD_DATA_UNIT, world_data);

        backend.dispatch(&self.kernel, &kernel_bindings, grid)?;
        backend.insert_barrier(BarrierKind::StorageToVertex);

        let mut vertex_array = VertexArray::new(VertexArrayKind::Surface);
        vertex_array.bind_vertex_source(
            attributes::POSITION,
            vertex_buffer.clone(),
            position,
            AttributeFormat::Float32x3,
        );
        vertex_array.bind_vertex_source(
            attributes::NORMAL,
            vertex_buffer.clone(),
            normal,
            AttributeFormat::Float32x3,
        );
        vertex_array.bind_vertex_source(
            attributes::TEXCOORD,
            vertex_buffer.clone(),
            texcoord,
            AttributeFormat::Float32x2,
        );
        vertex_array.bind_index_source(index_buffer.clone(), index);

        Ok(vertex_array)
    }

    /// Draw the current mesh; a no-op before the first successful generation
    pub fn draw(&self, backend: &mut G, mode: MeshDrawMode) -> GenResult<()> {
        let mesh = match &self.current {
            Some(mesh) => mesh,
            None => return Ok(()),
        };

        let primitive = match mode {
            MeshDrawMode::Surface => DrawPrimitive::Indexed {
                count: mesh.index_count,
            },
            MeshDrawMode::Vertices => DrawPrimitive::Points {
                count: mesh.vertex_count,
            },
        };
        backend.draw(&mesh.vertex_array, primitive)
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn vertex_count(&self) -> u32 {
        self.current.as_ref().map_or(0, |m| m.vertex_count)
    }

    pub fn index_count(&self) -> u32 {
        self.current.as_ref().map_or(0, |m| m.index_count)
    }

    pub fn mesh(&self) -> Option<&TerrainMesh<G::Buffer>> {
        self.current.as_ref()
    }

    pub fn kernel_label(&self) -> &str {
        self.kernel.label()
    }

    /// Release the current mesh buffers
    pub fn release(&mut self, backend: &mut G) {
        if let Some(mesh) = self.current.take() {
            mesh.release(backend);
        }
        self.state = GenerationState::Uninitialized;
    }
}
