//! wgpu implementation of the GPU seam
//!
//! wgpu has no explicit memory barrier. Each dispatch is encoded and
//! submitted on its own, and the queue executes submissions in order with
//! resource transitions tracked between them, so a barrier only has to be
//! recorded. `queue.write_buffer` lands before the next submission, which
//! keeps CPU writes ordered after everything already submitted.

mod kernel;
mod render;
mod texture;

pub use kernel::{reflect_wgsl, KernelReflection, WgpuKernel};
pub use render::{DrawUniforms, OffscreenTarget, COLOR_FORMAT, DEPTH_FORMAT};
pub use texture::WgpuTexture;

use crate::constants::{attributes, groups, strides};
use crate::error::{allocation_error, dispatch_error, GenError, GenResult, GpuErrorContext};
use crate::gpu::backend::{
    AttributeFormat, BarrierKind, BufferUsages, DrawPrimitive, GpuBackend, KernelBindings,
    VertexArray, VertexArrayKind,
};
use crate::gpu::dispatch::{size_dispatch, ComputeKernel, DispatchGrid};
use glam::{Mat4, Vec4};
use render::{PendingDraw, PendingPrimitive, PipelineKind, RenderPipelines};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Device and queue shared by everything created on them
#[derive(Clone)]
pub struct WgpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl WgpuContext {
    /// Request a device without any presentation surface
    pub async fn headless() -> GenResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| dispatch_error("WgpuContext", "no suitable GPU adapter"))?;

        let info = adapter.get_info();
        log::info!(
            "[WgpuContext] Using adapter '{}' ({:?})",
            info.name,
            info.backend
        );

        // Downlevel adapters may lack compute entirely
        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(dispatch_error(
                "WgpuContext",
                "adapter does not support compute shaders",
            ));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Procedural Placement Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| dispatch_error("WgpuContext", e))?;

        Ok(Self::from_parts(Arc::new(device), Arc::new(queue)))
    }

    pub fn from_parts(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }
}

impl fmt::Debug for WgpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuContext")
            .field("max_buffer_size", &self.device.limits().max_buffer_size)
            .finish()
    }
}

/// A GPU buffer plus the size that was requested for it
#[derive(Clone, Debug)]
pub struct WgpuBuffer {
    raw: Arc<wgpu::Buffer>,
    label: String,
    size: u64,
    usage: BufferUsages,
}

impl WgpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes requested at allocation; the raw buffer may be padded
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Backend issuing real wgpu commands
pub struct WgpuBackend {
    ctx: WgpuContext,
    pipelines: RenderPipelines,
    target: OffscreenTarget,
    clear_color: wgpu::Color,
    frame: Option<Vec<PendingDraw>>,
    barriers_issued: u64,
    dispatches_submitted: u64,
}

impl WgpuBackend {
    pub fn new(ctx: WgpuContext, target_size: [u32; 2]) -> Self {
        let pipelines = RenderPipelines::new(&ctx);
        let target = OffscreenTarget::new(&ctx, target_size[0], target_size[1]);

        log::info!(
            "[WgpuBackend] Offscreen target {}x{}",
            target.width,
            target.height
        );

        Self {
            ctx,
            pipelines,
            target,
            clear_color: wgpu::Color::BLACK,
            frame: None,
            barriers_issued: 0,
            dispatches_submitted: 0,
        }
    }

    pub fn context(&self) -> &WgpuContext {
        &self.ctx
    }

    pub fn target(&self) -> &OffscreenTarget {
        &self.target
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = wgpu::Color {
            r: rgba[0] as f64,
            g: rgba[1] as f64,
            b: rgba[2] as f64,
            a: rgba[3] as f64,
        };
    }

    /// Uniforms used by every later draw of `kind`
    pub fn set_draw_uniforms(&mut self, kind: VertexArrayKind, view_proj: Mat4, model: Mat4, color: Vec4) {
        self.pipelines
            .write_uniforms(&self.ctx, kind, &DrawUniforms::new(view_proj, model, color));
    }

    /// Compile a WGSL compute kernel on this device
    pub fn compile_kernel(&self, label: &str, source: &str, entry_point: &str) -> GenResult<WgpuKernel> {
        WgpuKernel::from_wgsl(&self.ctx, label, source, entry_point)
    }

    pub fn barriers_issued(&self) -> u64 {
        self.barriers_issued
    }

    pub fn dispatches_submitted(&self) -> u64 {
        self.dispatches_submitted
    }

    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    /// Start collecting draws for the offscreen target
    pub fn begin_frame(&mut self) -> GenResult<()> {
        if self.frame.is_some() {
            return Err(GenError::Draw("frame already active".into()));
        }
        self.frame = Some(Vec::new());
        Ok(())
    }

    /// Replay the collected draws in one render pass and submit it
    pub fn end_frame(&mut self) -> GenResult<usize> {
        let draws = self
            .frame
            .take()
            .ok_or_else(|| GenError::Draw("no active frame".into()))?;

        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Encoder"),
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Frame Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &draws {
                pass.set_pipeline(self.pipelines.pipeline(draw.pipeline));
                pass.set_bind_group(0, self.pipelines.bind_group(draw.uniforms), &[]);

                for (slot, buffer, offset, size) in &draw.vertex_buffers {
                    pass.set_vertex_buffer(*slot, buffer.raw.slice(*offset..*offset + *size));
                }

                match &draw.primitive {
                    PendingPrimitive::Indexed(count) => {
                        if let Some((buffer, offset, size)) = &draw.index {
                            pass.set_index_buffer(
                                buffer.raw.slice(*offset..*offset + *size),
                                wgpu::IndexFormat::Uint32,
                            );
                            pass.draw_indexed(0..*count, 0, 0..1);
                        }
                    }
                    PendingPrimitive::Points(count) => pass.draw(0..*count, 0..1),
                    PendingPrimitive::Indirect(buffer, offset) => {
                        pass.draw_indirect(&buffer.raw, *offset)
                    }
                }
            }
        }

        self.ctx.queue.submit(Some(encoder.finish()));

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(GenError::Draw(error.to_string()));
        }

        log::trace!("[WgpuBackend] Frame submitted with {} draws", draws.len());
        Ok(draws.len())
    }

    /// Copy `len` bytes back to the CPU, blocking until the GPU is done
    ///
    /// Only for diagnostics and tests; the pipelines never read back.
    pub fn read_bytes(&self, buffer: &WgpuBuffer, offset: u64, len: u64) -> GenResult<Vec<u8>> {
        if offset % 4 != 0 || len % 4 != 0 || offset + len > buffer.size {
            return Err(dispatch_error(
                "readback",
                format!("range {}..{} of '{}' not readable", offset, offset + len, buffer.label),
            ));
        }
        if !buffer.usage.contains(BufferUsages::COPY_SRC) {
            return Err(dispatch_error(
                "readback",
                format!("'{}' was not allocated with COPY_SRC", buffer.label),
            ));
        }

        let device = &self.ctx.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: len.max(4),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&buffer.raw, offset, &staging, 0, len);
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(0..len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        rx.recv().gpu_context("readback")?.gpu_context("readback")?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    pub fn read_u32(&self, buffer: &WgpuBuffer, offset: u64) -> GenResult<u32> {
        let bytes = self.read_bytes(buffer, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn check_bindings(
        &self,
        kernel: &WgpuKernel,
        bindings: &KernelBindings<'_, WgpuBuffer, WgpuTexture>,
    ) -> GenResult<()> {
        let label = kernel.label();
        let mismatch = |what: &str, declared: &BTreeSet<u32>, supplied: &BTreeSet<u32>| {
            dispatch_error(
                label,
                format!("{} bindings declared {:?}, supplied {:?}", what, declared, supplied),
            )
        };

        let storage: BTreeSet<u32> = bindings.storage.iter().map(|b| b.index).collect();
        let declared = kernel.declared(groups::STORAGE_GROUP);
        if storage != declared || storage.len() != bindings.storage.len() {
            return Err(mismatch("storage", &declared, &storage));
        }

        let textures: BTreeSet<u32> = bindings.textures.iter().map(|t| t.unit).collect();
        let declared = kernel.declared(groups::TEXTURE_GROUP);
        if textures != declared || textures.len() != bindings.textures.len() {
            return Err(mismatch("texture", &declared, &textures));
        }

        let declared = kernel.declared(groups::PARAMS_GROUP);
        if declared.is_empty() == bindings.params.is_some() {
            return Err(dispatch_error(
                label,
                format!(
                    "params declared {:?}, supplied {}",
                    declared,
                    bindings.params.is_some()
                ),
            ));
        }

        let limits = self.ctx.device.limits();
        let alignment = limits.min_storage_buffer_offset_alignment as u64;
        for binding in &bindings.storage {
            let region = &binding.region;
            if region.offset % alignment != 0 {
                return Err(dispatch_error(
                    label,
                    format!(
                        "region '{}' offset {} is not a multiple of {}",
                        region.name, region.offset, alignment
                    ),
                ));
            }
            if region.end() > binding.buffer.size {
                return Err(dispatch_error(
                    label,
                    format!(
                        "region '{}' ends at {} past '{}' ({} bytes)",
                        region.name,
                        region.end(),
                        binding.buffer.label,
                        binding.buffer.size
                    ),
                ));
            }
            if region.size > limits.max_storage_buffer_binding_size as u64 {
                return Err(dispatch_error(
                    label,
                    format!("region '{}' exceeds max storage binding size", region.name),
                ));
            }
        }
        Ok(())
    }

    /// Translate a vertex array into a replayable draw
    fn prepare_draw(
        vertex_array: &VertexArray<WgpuBuffer>,
        primitive: DrawPrimitive<'_, WgpuBuffer>,
    ) -> GenResult<Option<PendingDraw>> {
        let expect = |location: u32, stride: u64, format: AttributeFormat| -> GenResult<(u32, WgpuBuffer, u64, u64)> {
            let source = vertex_array.source(location).ok_or_else(|| {
                GenError::Draw(format!("{:?} draw missing location {}", vertex_array.kind, location))
            })?;
            if source.stride != stride || source.format != format {
                return Err(GenError::Draw(format!(
                    "location {} bound with stride {} {:?}, pipeline expects {} {:?}",
                    location, source.stride, source.format, stride, format
                )));
            }
            if source.offset + source.size > source.buffer.size {
                return Err(GenError::Draw(format!(
                    "location {} range exceeds '{}'",
                    location, source.buffer.label
                )));
            }
            Ok((location, source.buffer.clone(), source.offset, source.size))
        };

        let position = || expect(attributes::POSITION, strides::POSITION, AttributeFormat::Float32x3);

        let (pipeline, vertex_buffers, index, primitive) = match (vertex_array.kind, primitive) {
            (VertexArrayKind::Surface, DrawPrimitive::Indexed { count }) => {
                let index = vertex_array
                    .index
                    .as_ref()
                    .ok_or_else(|| GenError::Draw("indexed draw without index source".into()))?;
                if count as u64 * strides::INDEX > index.size {
                    return Err(GenError::Draw(format!(
                        "{} indices exceed index source of {} bytes",
                        count, index.size
                    )));
                }
                if count == 0 {
                    return Ok(None);
                }
                let buffers = vec![
                    position()?,
                    expect(attributes::NORMAL, strides::NORMAL, AttributeFormat::Float32x3)?,
                    expect(attributes::TEXCOORD, strides::TEXCOORD, AttributeFormat::Float32x2)?,
                ];
                (
                    PipelineKind::Triangles,
                    buffers,
                    Some((index.buffer.clone(), index.offset, index.size)),
                    PendingPrimitive::Indexed(count),
                )
            }
            (VertexArrayKind::Points, DrawPrimitive::Indexed { .. }) => {
                return Err(GenError::Draw("point arrays cannot be drawn indexed".into()));
            }
            (_, DrawPrimitive::Points { count }) => {
                if count as u64 > vertex_array.vertex_capacity() {
                    return Err(GenError::Draw(format!(
                        "{} points exceed vertex capacity {}",
                        count,
                        vertex_array.vertex_capacity()
                    )));
                }
                if count == 0 {
                    return Ok(None);
                }
                (PipelineKind::Points, vec![position()?], None, PendingPrimitive::Points(count))
            }
            (_, DrawPrimitive::PointsIndirect { args, offset }) => {
                if !args.usage.contains(BufferUsages::INDIRECT) || offset + 16 > args.size {
                    return Err(GenError::Draw(format!(
                        "'{}' cannot supply indirect arguments at {}",
                        args.label, offset
                    )));
                }
                (
                    PipelineKind::Points,
                    vec![position()?],
                    None,
                    PendingPrimitive::Indirect(args.clone(), offset),
                )
            }
        };

        // Position-only pipelines read slot 0
        let vertex_buffers = vertex_buffers
            .into_iter()
            .enumerate()
            .map(|(slot, (_, buffer, offset, size))| (slot as u32, buffer, offset, size))
            .collect();

        Ok(Some(PendingDraw {
            uniforms: vertex_array.kind,
            pipeline,
            vertex_buffers,
            index,
            primitive,
        }))
    }
}

impl GpuBackend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type Texture = WgpuTexture;
    type Kernel = WgpuKernel;

    fn allocate(&mut self, label: &str, size: u64, usage: BufferUsages) -> GenResult<WgpuBuffer> {
        let device = &self.ctx.device;
        let max = device.limits().max_buffer_size;

        // Copies and storage views work in whole words
        let padded = (size.max(4) + 3) & !3;
        if padded > max {
            return Err(allocation_error(
                label,
                size,
                format!("exceeds device max_buffer_size {}", max),
            ));
        }

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let raw = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage,
            mapped_at_creation: false,
        });

        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());

        if let Some(error) = out_of_memory.or(validation) {
            raw.destroy();
            return Err(allocation_error(label, size, error));
        }

        log::debug!("[WgpuBackend] Allocated '{}' ({} bytes)", label, padded);

        Ok(WgpuBuffer {
            raw: Arc::new(raw),
            label: label.to_string(),
            size,
            usage,
        })
    }

    fn write_bytes(&mut self, buffer: &WgpuBuffer, offset: u64, data: &[u8]) -> GenResult<()> {
        let len = data.len() as u64;
        if offset % 4 != 0 || len % 4 != 0 {
            return Err(dispatch_error(
                "write",
                format!("unaligned write of {} bytes at {} into '{}'", len, offset, buffer.label),
            ));
        }
        if offset + len > buffer.size {
            return Err(dispatch_error(
                "write",
                format!("write {}..{} exceeds '{}'", offset, offset + len, buffer.label),
            ));
        }
        self.ctx.queue.write_buffer(&buffer.raw, offset, data);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: &WgpuKernel,
        bindings: &KernelBindings<'_, WgpuBuffer, WgpuTexture>,
        grid: DispatchGrid,
    ) -> GenResult<()> {
        let label = kernel.label();
        let threads = size_dispatch(kernel.work_group_shape(), grid)?;

        let max_groups = self.ctx.device.limits().max_compute_workgroups_per_dimension;
        if grid.as_array().iter().any(|&g| g > max_groups) {
            return Err(dispatch_error(
                label,
                format!("grid {:?} exceeds {} work groups per axis", grid.as_array(), max_groups),
            ));
        }

        self.check_bindings(kernel, bindings)?;

        let device = &self.ctx.device;
        let pipeline = kernel.pipeline();
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut bind_groups: Vec<(u32, wgpu::BindGroup)> = Vec::with_capacity(3);

        if !bindings.storage.is_empty() {
            let entries: Vec<_> = bindings
                .storage
                .iter()
                .map(|b| {
                    // Empty regions still need a non-zero binding
                    let (offset, size) = if b.region.is_empty() {
                        (0, 4)
                    } else {
                        (b.region.offset, b.region.size)
                    };
                    wgpu::BindGroupEntry {
                        binding: b.index,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &b.buffer.raw,
                            offset,
                            size: wgpu::BufferSize::new(size),
                        }),
                    }
                })
                .collect();
            bind_groups.push((
                groups::STORAGE_GROUP,
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Kernel Storage"),
                    layout: &pipeline.get_bind_group_layout(groups::STORAGE_GROUP),
                    entries: &entries,
                }),
            ));
        }

        if !bindings.textures.is_empty() {
            let entries: Vec<_> = bindings
                .textures
                .iter()
                .map(|t| wgpu::BindGroupEntry {
                    binding: t.unit,
                    resource: wgpu::BindingResource::TextureView(t.texture.view()),
                })
                .collect();
            bind_groups.push((
                groups::TEXTURE_GROUP,
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Kernel Textures"),
                    layout: &pipeline.get_bind_group_layout(groups::TEXTURE_GROUP),
                    entries: &entries,
                }),
            ));
        }

        let params_buffer = bindings.params.map(|params| {
            let mut contents = params.to_vec();
            contents.resize((contents.len().max(16) + 15) & !15, 0);
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Kernel Params"),
                contents: &contents,
                usage: wgpu::BufferUsages::UNIFORM,
            })
        });
        if let Some(buffer) = &params_buffer {
            bind_groups.push((
                groups::PARAMS_GROUP,
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Kernel Params"),
                    layout: &pipeline.get_bind_group_layout(groups::PARAMS_GROUP),
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: buffer.as_entire_binding(),
                    }],
                }),
            ));
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            for (group, bind_group) in &bind_groups {
                pass.set_bind_group(*group, bind_group, &[]);
            }
            pass.dispatch_workgroups(grid.x, grid.y, grid.z);
        }
        self.ctx.queue.submit(Some(encoder.finish()));

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(dispatch_error(label, error));
        }

        self.dispatches_submitted += 1;
        log::debug!(
            "[WgpuBackend] Dispatched '{}' grid {:?} -> {:?} threads",
            label,
            grid.as_array(),
            threads.as_array()
        );
        Ok(())
    }

    fn insert_barrier(&mut self, kind: BarrierKind) {
        // Submission order already provides the edge
        self.barriers_issued += 1;
        log::trace!("[WgpuBackend] Barrier {:?}", kind);
    }

    fn draw(
        &mut self,
        vertex_array: &VertexArray<WgpuBuffer>,
        primitive: DrawPrimitive<'_, WgpuBuffer>,
    ) -> GenResult<()> {
        if self.frame.is_none() {
            return Err(GenError::Draw("draw outside begin_frame/end_frame".into()));
        }
        let pending = Self::prepare_draw(vertex_array, primitive)?;
        if let (Some(frame), Some(draw)) = (self.frame.as_mut(), pending) {
            frame.push(draw);
        }
        Ok(())
    }

    fn release(&mut self, buffer: WgpuBuffer) {
        log::trace!("[WgpuBackend] Releasing '{}'", buffer.label);
        // Draws queued in the current frame keep their own Arc
        if Arc::strong_count(&buffer.raw) == 1 {
            buffer.raw.destroy();
        }
    }
}
