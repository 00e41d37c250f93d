//! World-data images
//!
//! Red carries terrain height, green carries placement density. Both are
//! read by the kernels at texel resolution without filtering.

use crate::error::{GenError, GenResult};
use image::{Rgba, RgbaImage};
use std::path::Path;

/// Decode an image file into RGBA8
pub fn load(path: &Path) -> GenResult<RgbaImage> {
    let image = image::open(path).map_err(|e| GenError::Texture {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let rgba = image.to_rgba8();
    log::info!(
        "[WorldData] Loaded {} ({}x{})",
        path.display(),
        rgba.width(),
        rgba.height()
    );
    Ok(rgba)
}

/// Rolling hills with denser vegetation in the valleys
pub fn synthesize(width: u32, height: u32) -> RgbaImage {
    let (w, h) = (width.max(1), height.max(1));
    RgbaImage::from_fn(w, h, |x, y| {
        let u = x as f32 / w as f32;
        let v = y as f32 / h as f32;
        let tau = std::f32::consts::TAU;

        let hills = 0.5
            + 0.25 * (u * tau * 2.0).sin() * (v * tau * 1.5).cos()
            + 0.15 * ((u + v) * tau * 3.0).sin();
        let hills = hills.clamp(0.0, 1.0);
        let density = (1.0 - hills).powf(1.5);

        Rgba([
            (hills * 255.0).round() as u8,
            (density * 255.0).round() as u8,
            0,
            255,
        ])
    })
}

/// Uniform world data: flat height, fixed density
pub fn uniform(width: u32, height: u32, height_value: u8, density: u8) -> RgbaImage {
    RgbaImage::from_pixel(width.max(1), height.max(1), Rgba([height_value, density, 0, 255]))
}
