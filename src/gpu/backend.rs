//! The GPU seam the pipelines drive
//!
//! Pipelines never talk to a graphics API directly. They describe what to
//! allocate, bind, dispatch and draw in terms of [`MemoryRegion`]s, and a
//! [`GpuBackend`] turns that into API calls. Two backends exist: wgpu for
//! real devices and a recording backend for headless runs and tests.

use super::arena::MemoryRegion;
use super::dispatch::{ComputeKernel, DispatchGrid};
use crate::error::GenResult;
use std::fmt;

pub use wgpu::BufferUsages;

/// Which memory effects a barrier makes visible to which consumer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// Kernel storage writes visible to vertex attribute fetch
    StorageToVertex,
    /// CPU-issued buffer writes visible to kernel reads
    CpuWriteToKernel,
    /// Kernel storage writes visible to later storage reads
    StorageToStorage,
}

/// One region bound as a kernel storage target
#[derive(Debug)]
pub struct StorageBinding<'a, B> {
    pub index: u32,
    pub buffer: &'a B,
    pub region: MemoryRegion,
}

/// A texture bound to a sampling unit
#[derive(Debug)]
pub struct TextureBinding<'a, T> {
    pub unit: u32,
    pub texture: &'a T,
}

/// Everything a kernel reads or writes in one dispatch
#[derive(Debug)]
pub struct KernelBindings<'a, B, T> {
    pub storage: Vec<StorageBinding<'a, B>>,
    pub textures: Vec<TextureBinding<'a, T>>,
    pub params: Option<&'a [u8]>,
}

impl<'a, B, T> KernelBindings<'a, B, T> {
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            textures: Vec::new(),
            params: None,
        }
    }

    pub fn storage(mut self, index: u32, buffer: &'a B, region: &MemoryRegion) -> Self {
        self.storage.push(StorageBinding {
            index,
            buffer,
            region: region.clone(),
        });
        self
    }

    pub fn texture(mut self, unit: u32, texture: &'a T) -> Self {
        self.textures.push(TextureBinding { unit, texture });
        self
    }

    pub fn params(mut self, bytes: &'a [u8]) -> Self {
        self.params = Some(bytes);
        self
    }
}

impl<'a, B, T> Default for KernelBindings<'a, B, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Component layout of a vertex attribute
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttributeFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl AttributeFormat {
    /// Bytes actually read per vertex (may be less than the stride)
    pub fn size(self) -> u64 {
        match self {
            AttributeFormat::Float32x2 => 8,
            AttributeFormat::Float32x3 => 12,
            AttributeFormat::Float32x4 => 16,
        }
    }

    pub fn to_wgpu(self) -> wgpu::VertexFormat {
        match self {
            AttributeFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            AttributeFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            AttributeFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        }
    }
}

/// A buffer range read as one vertex attribute stream
#[derive(Clone, Debug)]
pub struct VertexSource<B> {
    pub location: u32,
    pub buffer: B,
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
    pub format: AttributeFormat,
}

/// A buffer range read as u32 indices
#[derive(Clone, Debug)]
pub struct IndexSource<B> {
    pub buffer: B,
    pub offset: u64,
    pub size: u64,
}

/// Which fixed draw configuration a vertex array feeds
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VertexArrayKind {
    /// Position, normal and texcoord streams of the terrain
    Surface,
    /// Position-only stream of placed points
    Points,
}

/// Vertex input state: attribute streams plus an optional index stream
///
/// Re-described from scratch whenever the underlying buffer is
/// reallocated; it never outlives the buffers it names.
#[derive(Clone, Debug)]
pub struct VertexArray<B> {
    pub kind: VertexArrayKind,
    pub sources: Vec<VertexSource<B>>,
    pub index: Option<IndexSource<B>>,
}

impl<B> VertexArray<B> {
    pub fn new(kind: VertexArrayKind) -> Self {
        Self {
            kind,
            sources: Vec::new(),
            index: None,
        }
    }

    /// Bind `region` of `buffer` as the stream for `location`
    pub fn bind_vertex_source(
        &mut self,
        location: u32,
        buffer: B,
        region: &MemoryRegion,
        format: AttributeFormat,
    ) {
        self.sources.retain(|s| s.location != location);
        self.sources.push(VertexSource {
            location,
            buffer,
            offset: region.offset,
            size: region.size,
            stride: region.element_stride,
            format,
        });
        self.sources.sort_by_key(|s| s.location);
    }

    /// Bind `region` of `buffer` as the index stream
    pub fn bind_index_source(&mut self, buffer: B, region: &MemoryRegion) {
        self.index = Some(IndexSource {
            buffer,
            offset: region.offset,
            size: region.size,
        });
    }

    pub fn source(&self, location: u32) -> Option<&VertexSource<B>> {
        self.sources.iter().find(|s| s.location == location)
    }

    /// Vertices every stream can supply
    pub fn vertex_capacity(&self) -> u64 {
        self.sources
            .iter()
            .map(|s| if s.stride == 0 { 0 } else { s.size / s.stride })
            .min()
            .unwrap_or(0)
    }
}

/// What one draw call reads
#[derive(Debug)]
pub enum DrawPrimitive<'a, B> {
    /// Triangle list over `count` indices of the index stream
    Indexed { count: u32 },
    /// `count` points from the vertex streams
    Points { count: u32 },
    /// Points with the count read on the GPU from draw-indirect arguments
    PointsIndirect { args: &'a B, offset: u64 },
}

/// Graphics API operations the pipelines rely on
pub trait GpuBackend {
    type Buffer: Clone + fmt::Debug;
    type Texture: Clone + fmt::Debug;
    type Kernel: ComputeKernel;

    /// Create uninitialised GPU memory of `size` bytes
    fn allocate(&mut self, label: &str, size: u64, usage: BufferUsages) -> GenResult<Self::Buffer>;

    /// Write CPU bytes into a buffer at `offset`
    fn write_bytes(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> GenResult<()>;

    /// Launch `grid` work groups of `kernel` against `bindings`
    fn dispatch(
        &mut self,
        kernel: &Self::Kernel,
        bindings: &KernelBindings<'_, Self::Buffer, Self::Texture>,
        grid: DispatchGrid,
    ) -> GenResult<()>;

    /// Order earlier memory effects before later reads of `kind`
    fn insert_barrier(&mut self, kind: BarrierKind);

    /// Draw from previously described vertex state
    fn draw(
        &mut self,
        vertex_array: &VertexArray<Self::Buffer>,
        primitive: DrawPrimitive<'_, Self::Buffer>,
    ) -> GenResult<()>;

    /// Give a buffer's memory back
    fn release(&mut self, buffer: Self::Buffer);
}
