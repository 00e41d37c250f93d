//! CPU renditions of the generation kernels
//!
//! They follow the WGSL kernels' data contracts exactly (same buffer
//! layouts, same hash, same acceptance rule) so headless runs through the
//! recording backend produce real geometry and real counter values.

use crate::constants::{bindings, kernels};
use crate::error::{dispatch_error, GenResult};
use crate::gpu::dispatch::WorkGroupShape;
use crate::gpu::recording::{RecordedTexture, RecordingKernel, SimulatedDispatch};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

use super::placement::PlacementParams;

/// Work-group shape the heightmap kernel is compiled with
pub const HEIGHTMAP_SHAPE: WorkGroupShape = WorkGroupShape::new(8, 8, 1);

/// Work-group shape the placement kernel is compiled with
pub const PLACEMENT_SHAPE: WorkGroupShape = WorkGroupShape::new(4, 4, 1);

/// Recording kernel that runs the heightmap body on the CPU
pub fn heightmap_kernel() -> RecordingKernel {
    RecordingKernel::new(kernels::HEIGHTMAP_LABEL, HEIGHTMAP_SHAPE).with_simulation(simulate_heightmap)
}

/// Recording kernel that runs the placement body on the CPU
pub fn placement_kernel() -> RecordingKernel {
    RecordingKernel::new(kernels::PLACEMENT_LABEL, PLACEMENT_SHAPE).with_simulation(simulate_placement)
}

/// PCG hash shared with the placement kernel
#[inline]
pub fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747796405).wrapping_add(2891336453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277803737);
    (word >> 22) ^ word
}

#[inline]
fn unit(h: u32) -> f32 {
    (h & 0xffff) as f32 / 65536.0
}

fn world_data<'a>(dispatch: &'a SimulatedDispatch<'_>, kernel: &str) -> GenResult<&'a RecordedTexture> {
    dispatch
        .texture(bindings::WORLD_DATA_UNIT)
        .ok_or_else(|| dispatch_error(kernel, "no world data bound"))
}

fn simulate_heightmap(dispatch: &mut SimulatedDispatch<'_>) -> GenResult<()> {
    let (sx, sy) = (dispatch.threads.x, dispatch.threads.y);
    let texture = world_data(dispatch, kernels::HEIGHTMAP_LABEL)?.clone();

    let step = [
        1.0 / (sx.saturating_sub(1).max(1)) as f32,
        1.0 / (sy.saturating_sub(1).max(1)) as f32,
    ];
    let height = |u: f32, v: f32| texture.sample(u, v)[0];

    let vertices: Vec<([f32; 4], [f32; 4], [f32; 2])> = (0..sx * sy)
        .into_par_iter()
        .map(|vertex| {
            let (x, y) = (vertex % sx, vertex / sx);
            let (u, v) = (x as f32 * step[0], y as f32 * step[1]);
            let h = height(u, v);

            let dx = (height(u + step[0], v) - height(u - step[0], v)) / (2.0 * step[0]);
            let dz = (height(u, v + step[1]) - height(u, v - step[1])) / (2.0 * step[1]);
            let n = glam::Vec3::new(-dx, 1.0, -dz).normalize();

            ([u, h, v, 1.0], [n.x, n.y, n.z, 0.0], [u, v])
        })
        .collect();

    let positions: Vec<[f32; 4]> = vertices.iter().map(|v| v.0).collect();
    let normals: Vec<[f32; 4]> = vertices.iter().map(|v| v.1).collect();
    let texcoords: Vec<[f32; 2]> = vertices.iter().map(|v| v.2).collect();

    let mut indices = Vec::with_capacity((sx.saturating_sub(1) * sy.saturating_sub(1) * 6) as usize);
    for y in 0..sy.saturating_sub(1) {
        for x in 0..sx.saturating_sub(1) {
            let i00 = y * sx + x;
            let i10 = i00 + 1;
            let i01 = i00 + sx;
            let i11 = i01 + 1;
            indices.extend_from_slice(&[i00, i01, i10, i10, i01, i11]);
        }
    }

    write_region(dispatch, bindings::mesh::POSITIONS, bytemuck::cast_slice(&positions))?;
    write_region(dispatch, bindings::mesh::NORMALS, bytemuck::cast_slice(&normals))?;
    write_region(dispatch, bindings::mesh::TEXCOORDS, bytemuck::cast_slice(&texcoords))?;
    write_region(dispatch, bindings::mesh::INDICES, bytemuck::cast_slice(&indices))?;
    Ok(())
}

fn write_region(dispatch: &mut SimulatedDispatch<'_>, index: u32, bytes: &[u8]) -> GenResult<()> {
    let region = dispatch.storage_mut(index)?;
    if region.len() < bytes.len() {
        return Err(dispatch_error(
            "simulation",
            format!("binding {} holds {} bytes, kernel writes {}", index, region.len(), bytes.len()),
        ));
    }
    region[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn simulate_placement(dispatch: &mut SimulatedDispatch<'_>) -> GenResult<()> {
    let (sx, sy) = (dispatch.threads.x, dispatch.threads.y);
    let texture = world_data(dispatch, kernels::PLACEMENT_LABEL)?.clone();
    let params: PlacementParams = dispatch
        .params()
        .filter(|p| p.len() >= std::mem::size_of::<PlacementParams>())
        .map(|p| bytemuck::pod_read_unaligned(&p[..std::mem::size_of::<PlacementParams>()]))
        .ok_or_else(|| dispatch_error(kernels::PLACEMENT_LABEL, "missing placement params"))?;

    let output = dispatch.storage_mut(bindings::placement::OUTPUT)?;
    if output.len() < 16 {
        return Err(dispatch_error(kernels::PLACEMENT_LABEL, "output smaller than its header"));
    }
    let capacity = ((output.len() - 16) / 16) as u32;
    let counter = AtomicU32::new(u32::from_le_bytes([output[0], output[1], output[2], output[3]]));

    let accepted: Vec<(u32, [f32; 4])> = (0..sx * sy)
        .into_par_iter()
        .filter_map(|cell| {
            let (x, y) = (cell % sx, cell / sx);
            let h0 = pcg_hash(cell);
            let h1 = pcg_hash(h0);
            let h2 = pcg_hash(h1);

            let local = [
                (x as f32 + unit(h0)) / sx as f32,
                (y as f32 + unit(h1)) / sy as f32,
            ];
            let u = params.tex_coord_offset[0] + local[0] * params.tex_coord_scale[0];
            let v = params.tex_coord_offset[1] + local[1] * params.tex_coord_scale[1];
            let data = texture.sample(u, v);

            if unit(h2) >= data[1] {
                return None;
            }
            let slot = counter.fetch_add(1, Ordering::Relaxed);
            (slot < capacity).then_some((slot, [u, data[0], v, 1.0]))
        })
        .collect();

    output[0..4].copy_from_slice(&counter.load(Ordering::Relaxed).to_le_bytes());
    for (slot, point) in accepted {
        let start = 16 + slot as usize * 16;
        output[start..start + 16].copy_from_slice(bytemuck::cast_slice(&point));
    }
    Ok(())
}
