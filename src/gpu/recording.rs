//! Headless recording backend
//!
//! Keeps buffer memory as plain byte vectors, records every command the
//! pipelines issue and runs kernels through optional CPU simulations. It
//! also tracks the synchronization edges: a dispatch reading unfenced CPU
//! writes, or a draw reading unfenced kernel writes, is logged as a
//! [`SyncHazard`].

use super::arena::MemoryRegion;
use super::backend::{
    BarrierKind, BufferUsages, DrawPrimitive, GpuBackend, KernelBindings, VertexArray,
    VertexArrayKind,
};
use super::dispatch::{size_dispatch, ComputeKernel, DispatchGrid, ThreadCount, WorkGroupShape};
use crate::error::{allocation_error, dispatch_error, GenError, GenResult};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Byte pattern freshly allocated memory is filled with
pub const UNINITIALIZED_BYTE: u8 = 0xAB;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Handle to a recorded buffer
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordedBuffer {
    pub id: BufferId,
    pub label: String,
    pub size: u64,
}

/// RGBA8 texture held in CPU memory
#[derive(Clone, Debug)]
pub struct RecordedTexture {
    pub label: String,
    pub width: u32,
    pub height: u32,
    texels: Arc<Vec<u8>>,
}

impl RecordedTexture {
    pub fn from_rgba(label: &str, width: u32, height: u32, texels: Vec<u8>) -> GenResult<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || texels.len() != expected {
            return Err(GenError::Texture {
                path: label.into(),
                message: format!(
                    "{}x{} RGBA texture needs {} bytes, got {}",
                    width,
                    height,
                    expected,
                    texels.len()
                ),
            });
        }
        Ok(Self {
            label: label.to_string(),
            width,
            height,
            texels: Arc::new(texels),
        })
    }

    /// Texel at integer coordinates, clamped to the edge
    pub fn load(&self, x: i64, y: i64) -> [u8; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        let i = (y * self.width as usize + x) * 4;
        [
            self.texels[i],
            self.texels[i + 1],
            self.texels[i + 2],
            self.texels[i + 3],
        ]
    }

    /// Nearest texel at normalized coordinates, channels in 0..=1
    pub fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        let x = (u * self.width as f32).floor() as i64;
        let y = (v * self.height as f32).floor() as i64;
        self.load(x, y).map(|c| c as f32 / 255.0)
    }
}

/// CPU stand-in for a kernel body
pub type KernelSimulation = dyn Fn(&mut SimulatedDispatch<'_>) -> GenResult<()> + Send + Sync;

/// A kernel known only by its shape and, optionally, a CPU simulation
#[derive(Clone)]
pub struct RecordingKernel {
    label: String,
    shape: WorkGroupShape,
    simulation: Option<Arc<KernelSimulation>>,
}

impl RecordingKernel {
    pub fn new(label: &str, shape: WorkGroupShape) -> Self {
        Self {
            label: label.to_string(),
            shape,
            simulation: None,
        }
    }

    pub fn with_simulation<F>(mut self, simulation: F) -> Self
    where
        F: Fn(&mut SimulatedDispatch<'_>) -> GenResult<()> + Send + Sync + 'static,
    {
        self.simulation = Some(Arc::new(simulation));
        self
    }
}

impl fmt::Debug for RecordingKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingKernel")
            .field("label", &self.label)
            .field("shape", &self.shape)
            .field("simulated", &self.simulation.is_some())
            .finish()
    }
}

impl ComputeKernel for RecordingKernel {
    fn label(&self) -> &str {
        &self.label
    }

    fn work_group_shape(&self) -> WorkGroupShape {
        self.shape
    }
}

/// View of one dispatch handed to a kernel simulation
pub struct SimulatedDispatch<'a> {
    pub grid: DispatchGrid,
    pub threads: ThreadCount,
    params: Option<&'a [u8]>,
    storage: Vec<(u32, BufferId, MemoryRegion)>,
    textures: Vec<(u32, RecordedTexture)>,
    memory: &'a mut HashMap<BufferId, Vec<u8>>,
}

impl<'a> SimulatedDispatch<'a> {
    pub fn params(&self) -> Option<&[u8]> {
        self.params
    }

    pub fn texture(&self, unit: u32) -> Option<&RecordedTexture> {
        self.textures.iter().find(|(u, _)| *u == unit).map(|(_, t)| t)
    }

    /// Bytes of the region bound at storage `index`
    pub fn storage_mut(&mut self, index: u32) -> GenResult<&mut [u8]> {
        let (_, id, region) = self
            .storage
            .iter()
            .find(|(i, _, _)| *i == index)
            .ok_or_else(|| dispatch_error("simulation", format!("no storage bound at {}", index)))?;
        let bytes = self
            .memory
            .get_mut(id)
            .ok_or_else(|| dispatch_error("simulation", format!("buffer {:?} released", id)))?;
        Ok(&mut bytes[region.offset as usize..region.end() as usize])
    }
}

/// How a draw was asked to count its primitives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedPrimitive {
    Indexed(u32),
    Points(u32),
    PointsIndirect { buffer: BufferId, offset: u64 },
}

/// One vertex stream as seen by a recorded draw
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedSource {
    pub location: u32,
    pub buffer: BufferId,
    pub offset: u64,
    pub stride: u64,
}

/// Everything the pipelines asked the backend to do, in order
#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    Allocate {
        buffer: BufferId,
        label: String,
        size: u64,
        usage: BufferUsages,
    },
    Write {
        buffer: BufferId,
        offset: u64,
        len: u64,
    },
    Dispatch {
        kernel: String,
        grid: DispatchGrid,
        storage: Vec<(u32, BufferId, MemoryRegion)>,
        textures: Vec<u32>,
        params: Option<Vec<u8>>,
    },
    Barrier(BarrierKind),
    Draw {
        kind: VertexArrayKind,
        primitive: RecordedPrimitive,
        sources: Vec<RecordedSource>,
        index: Option<(BufferId, u64)>,
    },
    Release(BufferId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HazardKind {
    /// Kernel read bytes the CPU wrote without a `CpuWriteToKernel` barrier
    UnfencedCpuWrite,
    /// Kernel read bytes another dispatch wrote without `StorageToStorage`
    UnfencedStorageRead,
    /// Draw read bytes a kernel wrote without `StorageToVertex`
    UnfencedVertexRead,
}

/// A missing barrier observed while recording
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncHazard {
    pub kind: HazardKind,
    pub buffer: BufferId,
    pub detail: String,
}

/// Backend that records instead of executing
#[derive(Default)]
pub struct RecordingBackend {
    next_id: u64,
    memory: HashMap<BufferId, Vec<u8>>,
    commands: Vec<GpuCommand>,
    hazards: Vec<SyncHazard>,

    unfenced_cpu_writes: HashSet<BufferId>,
    unfenced_storage_for_storage: HashSet<BufferId>,
    unfenced_storage_for_vertex: HashSet<BufferId>,

    max_buffer_size: Option<u64>,
    allocation_failure: Option<(u32, String)>,
    dispatch_failure: Option<String>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject allocations larger than `size`, like a device limit
    pub fn with_max_buffer_size(mut self, size: u64) -> Self {
        self.max_buffer_size = Some(size);
        self
    }

    /// Fail the allocation `skip` allocations from now (0 = the next one)
    pub fn fail_allocation_after(&mut self, skip: u32, reason: &str) {
        self.allocation_failure = Some((skip, reason.to_string()));
    }

    /// Fail the next dispatch
    pub fn fail_next_dispatch(&mut self, reason: &str) {
        self.dispatch_failure = Some(reason.to_string());
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn hazards(&self) -> &[SyncHazard] {
        &self.hazards
    }

    /// Number of buffers allocated and not yet released
    pub fn live_buffers(&self) -> usize {
        self.memory.len()
    }

    pub fn is_live(&self, buffer: &RecordedBuffer) -> bool {
        self.memory.contains_key(&buffer.id)
    }

    pub fn barriers(&self) -> Vec<BarrierKind> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Barrier(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn read_bytes(&self, buffer: &RecordedBuffer) -> Option<&[u8]> {
        self.memory.get(&buffer.id).map(|b| b.as_slice())
    }

    pub fn read_u32(&self, buffer: &RecordedBuffer, offset: u64) -> Option<u32> {
        let bytes = self.read_bytes(buffer)?;
        let start = offset as usize;
        let word = bytes.get(start..start + 4)?;
        Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }

    fn live_memory(&self, buffer: &RecordedBuffer, what: &str) -> GenResult<&Vec<u8>> {
        self.memory.get(&buffer.id).ok_or_else(|| {
            dispatch_error(what, format!("buffer '{}' ({:?}) was released", buffer.label, buffer.id))
        })
    }

    fn check_range(&self, buffer: &RecordedBuffer, offset: u64, size: u64, what: &str) -> GenResult<()> {
        let memory = self.live_memory(buffer, what)?;
        let end = offset.checked_add(size).unwrap_or(u64::MAX);
        if end > memory.len() as u64 {
            return Err(dispatch_error(
                what,
                format!(
                    "range {}..{} exceeds '{}' ({} bytes)",
                    offset,
                    end,
                    buffer.label,
                    memory.len()
                ),
            ));
        }
        Ok(())
    }

    fn hazard(&mut self, kind: HazardKind, buffer: BufferId, detail: String) {
        log::warn!("[RecordingBackend] {:?} on {:?}: {}", kind, buffer, detail);
        self.hazards.push(SyncHazard { kind, buffer, detail });
    }

    fn check_draw_ranges(
        &self,
        vertex_array: &VertexArray<RecordedBuffer>,
        primitive: &DrawPrimitive<'_, RecordedBuffer>,
    ) -> GenResult<()> {
        let to_draw = |e: GenError| GenError::Draw(e.to_string());

        for source in &vertex_array.sources {
            self.check_range(&source.buffer, source.offset, source.size, "draw")
                .map_err(to_draw)?;
        }

        match primitive {
            DrawPrimitive::Indexed { count } => {
                let index = vertex_array
                    .index
                    .as_ref()
                    .ok_or_else(|| GenError::Draw("indexed draw without index source".into()))?;
                self.check_range(&index.buffer, index.offset, index.size, "draw")
                    .map_err(to_draw)?;
                if *count as u64 * 4 > index.size {
                    return Err(GenError::Draw(format!(
                        "{} indices exceed index source of {} bytes",
                        count, index.size
                    )));
                }
            }
            DrawPrimitive::Points { count } => {
                if *count as u64 > vertex_array.vertex_capacity() {
                    return Err(GenError::Draw(format!(
                        "{} points exceed vertex capacity {}",
                        count,
                        vertex_array.vertex_capacity()
                    )));
                }
            }
            DrawPrimitive::PointsIndirect { args, offset } => {
                self.check_range(args, *offset, 16, "draw").map_err(to_draw)?;
            }
        }
        Ok(())
    }
}

impl GpuBackend for RecordingBackend {
    type Buffer = RecordedBuffer;
    type Texture = RecordedTexture;
    type Kernel = RecordingKernel;

    fn allocate(&mut self, label: &str, size: u64, usage: BufferUsages) -> GenResult<RecordedBuffer> {
        if let Some((skip, reason)) = self.allocation_failure.take() {
            if skip == 0 {
                return Err(allocation_error(label, size, reason));
            }
            self.allocation_failure = Some((skip - 1, reason));
        }

        if let Some(max) = self.max_buffer_size {
            if size > max {
                return Err(allocation_error(
                    label,
                    size,
                    format!("exceeds max buffer size {}", max),
                ));
            }
        }

        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.memory.insert(id, vec![UNINITIALIZED_BYTE; size as usize]);
        self.commands.push(GpuCommand::Allocate {
            buffer: id,
            label: label.to_string(),
            size,
            usage,
        });

        Ok(RecordedBuffer {
            id,
            label: label.to_string(),
            size,
        })
    }

    fn write_bytes(&mut self, buffer: &RecordedBuffer, offset: u64, data: &[u8]) -> GenResult<()> {
        self.check_range(buffer, offset, data.len() as u64, "write")?;
        if let Some(memory) = self.memory.get_mut(&buffer.id) {
            memory[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        self.unfenced_cpu_writes.insert(buffer.id);
        self.commands.push(GpuCommand::Write {
            buffer: buffer.id,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: &RecordingKernel,
        bindings: &KernelBindings<'_, RecordedBuffer, RecordedTexture>,
        grid: DispatchGrid,
    ) -> GenResult<()> {
        if let Some(reason) = self.dispatch_failure.take() {
            return Err(dispatch_error(&kernel.label, reason));
        }

        let threads = size_dispatch(kernel.shape, grid)?;

        for binding in &bindings.storage {
            self.check_range(binding.buffer, binding.region.offset, binding.region.size, &kernel.label)?;
        }

        for binding in &bindings.storage {
            let id = binding.buffer.id;
            if self.unfenced_cpu_writes.contains(&id) {
                self.hazard(
                    HazardKind::UnfencedCpuWrite,
                    id,
                    format!("'{}' reads CPU writes without a barrier", kernel.label),
                );
            }
            if self.unfenced_storage_for_storage.contains(&id) {
                self.hazard(
                    HazardKind::UnfencedStorageRead,
                    id,
                    format!("'{}' reads kernel writes without a barrier", kernel.label),
                );
            }
        }

        let storage: Vec<_> = bindings
            .storage
            .iter()
            .map(|b| (b.index, b.buffer.id, b.region.clone()))
            .collect();

        self.commands.push(GpuCommand::Dispatch {
            kernel: kernel.label.clone(),
            grid,
            storage: storage.clone(),
            textures: bindings.textures.iter().map(|t| t.unit).collect(),
            params: bindings.params.map(|p| p.to_vec()),
        });

        if let Some(simulation) = &kernel.simulation {
            let mut view = SimulatedDispatch {
                grid,
                threads,
                params: bindings.params,
                storage: storage.clone(),
                textures: bindings
                    .textures
                    .iter()
                    .map(|t| (t.unit, t.texture.clone()))
                    .collect(),
                memory: &mut self.memory,
            };
            simulation(&mut view)?;
        }

        for (_, id, _) in storage {
            self.unfenced_storage_for_storage.insert(id);
            self.unfenced_storage_for_vertex.insert(id);
        }
        Ok(())
    }

    fn insert_barrier(&mut self, kind: BarrierKind) {
        match kind {
            BarrierKind::CpuWriteToKernel => self.unfenced_cpu_writes.clear(),
            BarrierKind::StorageToStorage => self.unfenced_storage_for_storage.clear(),
            BarrierKind::StorageToVertex => self.unfenced_storage_for_vertex.clear(),
        }
        self.commands.push(GpuCommand::Barrier(kind));
    }

    fn draw(
        &mut self,
        vertex_array: &VertexArray<RecordedBuffer>,
        primitive: DrawPrimitive<'_, RecordedBuffer>,
    ) -> GenResult<()> {
        self.check_draw_ranges(vertex_array, &primitive)?;

        let mut read: Vec<BufferId> = vertex_array.sources.iter().map(|s| s.buffer.id).collect();
        if let (DrawPrimitive::Indexed { .. }, Some(index)) = (&primitive, &vertex_array.index) {
            read.push(index.buffer.id);
        }
        if let DrawPrimitive::PointsIndirect { args, .. } = &primitive {
            read.push(args.id);
        }
        read.sort();
        read.dedup();
        for id in read {
            if self.unfenced_storage_for_vertex.contains(&id) {
                self.hazard(
                    HazardKind::UnfencedVertexRead,
                    id,
                    format!("{:?} draw reads kernel writes without a barrier", vertex_array.kind),
                );
            }
        }

        let primitive = match primitive {
            DrawPrimitive::Indexed { count } => RecordedPrimitive::Indexed(count),
            DrawPrimitive::Points { count } => RecordedPrimitive::Points(count),
            DrawPrimitive::PointsIndirect { args, offset } => RecordedPrimitive::PointsIndirect {
                buffer: args.id,
                offset,
            },
        };

        self.commands.push(GpuCommand::Draw {
            kind: vertex_array.kind,
            primitive,
            sources: vertex_array
                .sources
                .iter()
                .map(|s| RecordedSource {
                    location: s.location,
                    buffer: s.buffer.id,
                    offset: s.offset,
                    stride: s.stride,
                })
                .collect(),
            index: vertex_array.index.as_ref().map(|i| (i.buffer.id, i.offset)),
        });
        Ok(())
    }

    fn release(&mut self, buffer: RecordedBuffer) {
        self.memory.remove(&buffer.id);
        self.unfenced_cpu_writes.remove(&buffer.id);
        self.unfenced_storage_for_storage.remove(&buffer.id);
        self.unfenced_storage_for_vertex.remove(&buffer.id);
        self.commands.push(GpuCommand::Release(buffer.id));
    }
}
