//! World-data textures

use crate::error::{GenError, GenResult};
use std::sync::Arc;

use super::WgpuContext;

/// An RGBA8 texture readable by kernels
#[derive(Clone, Debug)]
pub struct WgpuTexture {
    label: String,
    texture: Arc<wgpu::Texture>,
    view: Arc<wgpu::TextureView>,
    width: u32,
    height: u32,
}

impl WgpuTexture {
    /// Upload raw RGBA8 texels
    pub fn from_rgba(
        ctx: &WgpuContext,
        label: &str,
        width: u32,
        height: u32,
        texels: &[u8],
    ) -> GenResult<Self> {
        if width == 0 || height == 0 || texels.len() != width as usize * height as usize * 4 {
            return Err(GenError::Texture {
                path: label.into(),
                message: format!("{}x{} RGBA texture got {} bytes", width, height, texels.len()),
            });
        }

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        ctx.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            texels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            label: label.to_string(),
            texture: Arc::new(texture),
            view: Arc::new(view),
            width,
            height,
        })
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn raw(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
