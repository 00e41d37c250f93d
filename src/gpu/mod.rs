//! GPU buffer layout and dispatch coordination
//!
//! Sizing of compute dispatches, packing of typed regions into buffers and
//! the backend seam the generation pipelines are written against.

pub mod arena;
pub mod backend;
pub mod dispatch;
pub mod recording;
pub mod wgpu_backend;

pub use arena::{layout, ArenaLayout, MemoryRegion, RegionSpec};
pub use backend::{
    AttributeFormat, BarrierKind, BufferUsages, DrawPrimitive, GpuBackend, KernelBindings,
    VertexArray, VertexArrayKind,
};
pub use dispatch::{
    size_dispatch, ComputeKernel, DispatchGrid, ThreadCount, WorkGroupShape, WorkGroupSizer,
};
pub use recording::{GpuCommand, RecordedBuffer, RecordedTexture, RecordingBackend, RecordingKernel};
pub use wgpu_backend::{WgpuBackend, WgpuBuffer, WgpuContext, WgpuKernel, WgpuTexture};
