//! Fixed render pipelines and the offscreen frame they draw into
//!
//! Vertex buffer layouts mirror the strides the generation pipelines lay
//! out, so a vertex array described against a freshly generated buffer can
//! be drawn without rebuilding any pipeline.

use crate::constants::{attributes, strides};
use crate::gpu::backend::VertexArrayKind;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::{WgpuBuffer, WgpuContext};

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const SURFACE_WGSL: &str = include_str!("shaders/surface.wgsl");
const POINTS_WGSL: &str = include_str!("shaders/points.wgsl");

/// Per-kind draw uniforms
/// Total size: 144 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DrawUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
}

impl DrawUniforms {
    pub fn new(view_proj: Mat4, model: Mat4, color: Vec4) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            model: model.to_cols_array_2d(),
            color: color.to_array(),
        }
    }
}

impl Default for DrawUniforms {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY, Vec4::ONE)
    }
}

/// Color and depth attachments owned by the backend
pub struct OffscreenTarget {
    pub color: wgpu::Texture,
    pub color_view: wgpu::TextureView,
    pub depth_view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl OffscreenTarget {
    pub fn new(ctx: &WgpuContext, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        };

        let color = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Color"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let depth = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Depth"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            color,
            color_view,
            depth_view,
            width: size.width,
            height: size.height,
        }
    }
}

/// Which fixed pipeline a draw goes through
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    Triangles,
    Points,
}

#[derive(Debug)]
pub enum PendingPrimitive {
    Indexed(u32),
    Points(u32),
    Indirect(WgpuBuffer, u64),
}

/// A draw recorded during the frame and replayed at `end_frame`
#[derive(Debug)]
pub struct PendingDraw {
    pub uniforms: VertexArrayKind,
    pub pipeline: PipelineKind,
    /// (slot, buffer, offset, size)
    pub vertex_buffers: Vec<(u32, WgpuBuffer, u64, u64)>,
    pub index: Option<(WgpuBuffer, u64, u64)>,
    pub primitive: PendingPrimitive,
}

/// Render pipelines and their uniform buffers
pub struct RenderPipelines {
    pub triangles: wgpu::RenderPipeline,
    pub points: wgpu::RenderPipeline,
    surface_uniforms: wgpu::Buffer,
    points_uniforms: wgpu::Buffer,
    surface_bind_group: wgpu::BindGroup,
    points_bind_group: wgpu::BindGroup,
}

impl RenderPipelines {
    pub fn new(ctx: &WgpuContext) -> Self {
        let device = &ctx.device;

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Draw Uniforms Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<DrawUniforms>() as u64),
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Draw Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let uniform_buffer = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: std::mem::size_of::<DrawUniforms>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let surface_uniforms = uniform_buffer("Surface Uniforms");
        let points_uniforms = uniform_buffer("Points Uniforms");

        let bind_group = |label, buffer: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            })
        };
        let surface_bind_group = bind_group("Surface Uniforms Bind Group", &surface_uniforms);
        let points_bind_group = bind_group("Points Uniforms Bind Group", &points_uniforms);

        let surface_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Surface Shader"),
            source: wgpu::ShaderSource::Wgsl(SURFACE_WGSL.into()),
        });
        let points_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Points Shader"),
            source: wgpu::ShaderSource::Wgsl(POINTS_WGSL.into()),
        });

        const POSITION: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
            offset: 0,
            shader_location: attributes::POSITION,
            format: wgpu::VertexFormat::Float32x3,
        }];
        const NORMAL: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
            offset: 0,
            shader_location: attributes::NORMAL,
            format: wgpu::VertexFormat::Float32x3,
        }];
        const TEXCOORD: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
            offset: 0,
            shader_location: attributes::TEXCOORD,
            format: wgpu::VertexFormat::Float32x2,
        }];

        // One buffer slot per region, each with the region's own stride
        let surface_buffers = [
            wgpu::VertexBufferLayout {
                array_stride: strides::POSITION,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &POSITION,
            },
            wgpu::VertexBufferLayout {
                array_stride: strides::NORMAL,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &NORMAL,
            },
            wgpu::VertexBufferLayout {
                array_stride: strides::TEXCOORD,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &TEXCOORD,
            },
        ];
        let point_buffers = [wgpu::VertexBufferLayout {
            array_stride: strides::POINT,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &POSITION,
        }];

        let pipeline = |label, shader: &wgpu::ShaderModule, buffers: &[wgpu::VertexBufferLayout<'_>], topology| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: "vs_main",
                    buffers,
                },
                primitive: wgpu::PrimitiveState {
                    topology,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
            })
        };

        let triangles = pipeline(
            "Surface Pipeline",
            &surface_shader,
            &surface_buffers,
            wgpu::PrimitiveTopology::TriangleList,
        );
        let points = pipeline(
            "Points Pipeline",
            &points_shader,
            &point_buffers,
            wgpu::PrimitiveTopology::PointList,
        );

        let pipelines = Self {
            triangles,
            points,
            surface_uniforms,
            points_uniforms,
            surface_bind_group,
            points_bind_group,
        };
        pipelines.write_uniforms(ctx, VertexArrayKind::Surface, &DrawUniforms::default());
        pipelines.write_uniforms(ctx, VertexArrayKind::Points, &DrawUniforms::default());
        pipelines
    }

    pub fn write_uniforms(&self, ctx: &WgpuContext, kind: VertexArrayKind, uniforms: &DrawUniforms) {
        let buffer = match kind {
            VertexArrayKind::Surface => &self.surface_uniforms,
            VertexArrayKind::Points => &self.points_uniforms,
        };
        ctx.queue.write_buffer(buffer, 0, bytemuck::bytes_of(uniforms));
    }

    pub fn bind_group(&self, kind: VertexArrayKind) -> &wgpu::BindGroup {
        match kind {
            VertexArrayKind::Surface => &self.surface_bind_group,
            VertexArrayKind::Points => &self.points_bind_group,
        }
    }

    pub fn pipeline(&self, kind: PipelineKind) -> &wgpu::RenderPipeline {
        match kind {
            PipelineKind::Triangles => &self.triangles,
            PipelineKind::Points => &self.points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::naga;

    fn vertex_locations(source: &str) -> Vec<u32> {
        let module = naga::front::wgsl::parse_str(source).unwrap();
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .unwrap();

        let vs = module.entry_points.iter().find(|ep| ep.name == "vs_main").unwrap();
        let mut locations = Vec::new();
        for arg in &vs.function.arguments {
            match &arg.binding {
                Some(naga::Binding::Location { location, .. }) => locations.push(*location),
                _ => {
                    if let naga::TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                        for member in members {
                            if let Some(naga::Binding::Location { location, .. }) = &member.binding {
                                locations.push(*location);
                            }
                        }
                    }
                }
            }
        }
        locations.sort();
        locations
    }

    #[test]
    fn test_uniform_block_size() {
        assert_eq!(std::mem::size_of::<DrawUniforms>(), 144);
    }

    #[test]
    fn test_surface_shader_reads_all_streams() {
        assert_eq!(
            vertex_locations(SURFACE_WGSL),
            vec![attributes::POSITION, attributes::NORMAL, attributes::TEXCOORD]
        );
    }

    #[test]
    fn test_points_shader_reads_position_only() {
        assert_eq!(vertex_locations(POINTS_WGSL), vec![attributes::POSITION]);
    }
}
