use super::*;
use crate::constants::{bindings, kernels, regions, strides};
use crate::error::GenError;
use crate::gpu::arena::ArenaLayout;
use crate::gpu::backend::BarrierKind;
use crate::gpu::dispatch::DispatchGrid;
use crate::gpu::recording::{GpuCommand, RecordedPrimitive, RecordedTexture, RecordingBackend};
use glam::Vec2;
use image::RgbaImage;
use wgpu::naga;

type Recording = RecordingBackend;

fn texture(image: RgbaImage) -> RecordedTexture {
    let (w, h) = image.dimensions();
    RecordedTexture::from_rgba("world", w, h, image.into_raw()).unwrap()
}

fn terrain(image: RgbaImage) -> TerrainMeshPipeline<Recording> {
    TerrainMeshPipeline::new(heightmap_kernel(), texture(image))
}

fn placement(image: RgbaImage, source: PointCountSource) -> PlacementPipeline<Recording> {
    PlacementPipeline::new(placement_kernel(), texture(image), source)
}

fn u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse(source: &str) -> naga::Module {
    naga::front::wgsl::parse_str(source).unwrap_or_else(|e| panic!("{}", e.emit_to_string(source)))
}

fn bindings_in_group(module: &naga::Module, group: u32) -> Vec<u32> {
    let mut found: Vec<u32> = module
        .global_variables
        .iter()
        .filter_map(|(_, v)| v.binding.as_ref())
        .filter(|b| b.group == group)
        .map(|b| b.binding)
        .collect();
    found.sort();
    found
}

#[test]
fn test_kernel_sources_validate_and_match_shapes() {
    for (source, entry, shape) in [
        (HEIGHTMAP_WGSL, kernels::HEIGHTMAP_ENTRY, reference::HEIGHTMAP_SHAPE),
        (PLACEMENT_WGSL, kernels::PLACEMENT_ENTRY, reference::PLACEMENT_SHAPE),
    ] {
        let module = parse(source);
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();

        let ep = module
            .entry_points
            .iter()
            .find(|ep| ep.name == entry)
            .expect("entry point present");
        assert_eq!(ep.workgroup_size, shape.as_array(), "{}", entry);
    }
}

#[test]
fn test_kernel_bindings_match_constants() {
    let heightmap = parse(HEIGHTMAP_WGSL);
    assert_eq!(
        bindings_in_group(&heightmap, 0),
        vec![
            bindings::mesh::POSITIONS,
            bindings::mesh::NORMALS,
            bindings::mesh::TEXCOORDS,
            bindings::mesh::INDICES
        ]
    );
    assert_eq!(bindings_in_group(&heightmap, 1), vec![bindings::WORLD_DATA_UNIT]);

    let placement = parse(PLACEMENT_WGSL);
    assert_eq!(bindings_in_group(&placement, 0), vec![bindings::placement::OUTPUT]);
    assert_eq!(bindings_in_group(&placement, 1), vec![bindings::WORLD_DATA_UNIT]);
    assert_eq!(bindings_in_group(&placement, 2), vec![0]);
}

#[test]
fn test_mesh_single_group() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(32, 32));

    assert_eq!(pipeline.state(), GenerationState::Uninitialized);
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).unwrap();

    assert_eq!(pipeline.state(), GenerationState::Ready);
    assert_eq!(pipeline.vertex_count(), 64);
    assert_eq!(pipeline.index_count(), 7 * 7 * 6);
    assert!(backend.hazards().is_empty());
    assert_eq!(backend.barriers(), vec![BarrierKind::StorageToVertex]);
}

#[test]
fn test_mesh_vertex_array_uses_region_offsets() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(2, 1)).unwrap();

    let mesh = pipeline.mesh().unwrap();
    let vertices = 16 * 8u64;
    let offsets: Vec<(u64, u64)> = mesh
        .vertex_array
        .sources
        .iter()
        .map(|s| (s.offset, s.stride))
        .collect();
    assert_eq!(
        offsets,
        vec![
            (0, strides::POSITION),
            (vertices * 16, strides::NORMAL),
            (vertices * 32, strides::TEXCOORD),
        ]
    );
    assert_eq!(mesh.vertex_layout.total_size(), vertices * 40);
    assert_eq!(mesh.index_layout.total_size(), 15 * 7 * 6 * 4);
}

#[test]
fn test_mesh_kernel_output_is_a_valid_grid() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::uniform(8, 8, 128, 0));
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).unwrap();

    let mesh = pipeline.mesh().unwrap();
    let bytes = backend.read_bytes(&mesh.index_buffer).unwrap();
    let indices = u32s(bytes);
    assert!(indices.iter().all(|&i| i < pipeline.vertex_count()));
    assert_eq!(&indices[..6], &[0, 8, 1, 1, 8, 9]);

    // Flat world: every position has the same height and an upward normal
    let vertex_bytes = backend.read_bytes(&mesh.vertex_buffer).unwrap();
    let floats = f32s(vertex_bytes);
    let normals = &floats[64 * 4..64 * 8];
    for n in normals.chunks(4) {
        assert!((n[1] - 1.0).abs() < 1e-6);
    }
    let height = 128.0 / 255.0;
    for p in floats[..64 * 4].chunks(4) {
        assert!((p[1] - height).abs() < 1e-6);
    }
}

#[test]
fn test_mesh_regeneration_is_idempotent() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));

    pipeline.generate_mesh(&mut backend, DispatchGrid::new(3, 2)).unwrap();
    let first: ArenaLayout = pipeline.mesh().unwrap().vertex_layout.clone();
    let first_index = pipeline.mesh().unwrap().index_layout.clone();

    pipeline.generate_mesh(&mut backend, DispatchGrid::new(3, 2)).unwrap();
    let mesh = pipeline.mesh().unwrap();

    assert_eq!(mesh.vertex_layout, first);
    assert_eq!(mesh.index_layout, first_index);
    // Previous buffers were released after the new ones were ready
    assert_eq!(backend.live_buffers(), 2);
}

#[test]
fn test_failed_allocation_keeps_previous_mesh() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(2, 2)).unwrap();

    let before = pipeline.mesh().unwrap();
    let (vertex_id, index_id) = (before.vertex_buffer.id, before.index_buffer.id);
    let counts = (pipeline.vertex_count(), pipeline.index_count());

    // Vertex buffer succeeds, index buffer fails
    backend.fail_allocation_after(1, "out of device memory");
    let err = pipeline
        .generate_mesh(&mut backend, DispatchGrid::new(4, 4))
        .unwrap_err();

    assert!(matches!(err, GenError::Allocation { .. }));
    assert_eq!(pipeline.state(), GenerationState::Ready);
    assert_eq!((pipeline.vertex_count(), pipeline.index_count()), counts);
    let after = pipeline.mesh().unwrap();
    assert_eq!((after.vertex_buffer.id, after.index_buffer.id), (vertex_id, index_id));
    assert!(backend.is_live(&after.vertex_buffer));
    assert_eq!(backend.live_buffers(), 2);
}

#[test]
fn test_failed_dispatch_keeps_previous_mesh() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).unwrap();

    backend.fail_next_dispatch("device lost");
    let err = pipeline
        .generate_mesh(&mut backend, DispatchGrid::new(2, 2))
        .unwrap_err();

    assert!(err.is_gpu_failure());
    assert_eq!(pipeline.vertex_count(), 64);
    assert_eq!(backend.live_buffers(), 2);
}

#[test]
fn test_first_failure_stays_uninitialized() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));

    backend.fail_allocation_after(0, "out of device memory");
    assert!(pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).is_err());
    assert_eq!(pipeline.state(), GenerationState::Uninitialized);
    assert_eq!(pipeline.vertex_count(), 0);

    // Drawing before any mesh exists is a no-op
    pipeline.draw(&mut backend, MeshDrawMode::Surface).unwrap();
    assert!(!backend.commands().iter().any(|c| matches!(c, GpuCommand::Draw { .. })));
}

#[test]
fn test_zero_grid_is_invalid_dispatch() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));
    let err = pipeline
        .generate_mesh(&mut backend, DispatchGrid::new(0, 1))
        .unwrap_err();
    assert!(matches!(err, GenError::InvalidDispatch { .. }));
    assert_eq!(backend.live_buffers(), 0);
}

#[test]
fn test_mesh_draw_modes() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).unwrap();
    backend.clear_commands();

    pipeline.draw(&mut backend, MeshDrawMode::Surface).unwrap();
    pipeline.draw(&mut backend, MeshDrawMode::Vertices).unwrap();

    let primitives: Vec<RecordedPrimitive> = backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            GpuCommand::Draw { primitive, .. } => Some(primitive.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        primitives,
        vec![RecordedPrimitive::Indexed(294), RecordedPrimitive::Points(64)]
    );
    assert!(backend.hazards().is_empty());
}

#[test]
fn test_placement_sequence_and_capacity() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(64, 64), PointCountSource::Capacity);

    pipeline
        .generate_entities(&mut backend, PlacementBounds::default(), DispatchGrid::new(8, 8))
        .unwrap();

    assert_eq!(
        backend.barriers(),
        vec![
            BarrierKind::CpuWriteToKernel,
            BarrierKind::StorageToStorage,
            BarrierKind::StorageToVertex
        ]
    );
    assert!(backend.hazards().is_empty());

    let set = pipeline.points().unwrap();
    assert_eq!(set.max_points, 32 * 32);
    assert_eq!(pipeline.point_count(), set.max_points);
    assert_eq!(set.layout.total_size(), 16 + 32 * 32 * 16);

    let count = backend.read_u32(&set.buffer, 0).unwrap();
    assert!(count <= set.max_points);

    // Point stream skips the counter header
    let source = &set.vertex_array.sources[0];
    assert_eq!(source.offset, strides::COUNTER_HEADER);
    assert_eq!(source.stride, strides::POINT);
}

#[test]
fn test_placement_header_written_before_dispatch() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::uniform(4, 4, 0, 0), PointCountSource::Capacity);
    pipeline
        .generate_entities(&mut backend, PlacementBounds::default(), DispatchGrid::new(1, 1))
        .unwrap();

    let kinds: Vec<&str> = backend
        .commands()
        .iter()
        .map(|c| match c {
            GpuCommand::Allocate { .. } => "allocate",
            GpuCommand::Write { .. } => "write",
            GpuCommand::Barrier(_) => "barrier",
            GpuCommand::Dispatch { .. } => "dispatch",
            GpuCommand::Draw { .. } => "draw",
            GpuCommand::Release(_) => "release",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["allocate", "write", "barrier", "dispatch", "barrier", "barrier"]
    );

    // Zero density: nothing accepted, capacity still drawn
    let set = pipeline.points().unwrap();
    assert_eq!(backend.read_u32(&set.buffer, 0), Some(0));
    assert_eq!(pipeline.point_count(), 16);
}

#[test]
fn test_full_density_fills_capacity_exactly() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::uniform(4, 4, 50, 255), PointCountSource::Capacity);
    pipeline
        .generate_entities(&mut backend, PlacementBounds::default(), DispatchGrid::new(2, 3))
        .unwrap();

    let set = pipeline.points().unwrap();
    assert_eq!(backend.read_u32(&set.buffer, 0), Some(set.max_points));

    // Every point lies inside the bounds
    let bytes = backend.read_bytes(&set.buffer).unwrap();
    let floats = f32s(&bytes[16..]);
    let bounds = pipeline.bounds();
    for p in floats.chunks(4) {
        assert!(p[0] >= bounds.min.x && p[0] <= bounds.max.x);
        assert!(p[2] >= bounds.min.y && p[2] <= bounds.max.y);
    }
}

#[test]
fn test_bounds_are_normalized_before_dispatch() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);

    let bounds = PlacementBounds::new(Vec2::new(0.5, 0.6), Vec2::new(0.3, 0.6));
    pipeline
        .generate_entities(&mut backend, bounds, DispatchGrid::new(1, 1))
        .unwrap();

    assert_eq!(pipeline.bounds().min, Vec2::new(0.3, 0.6));
    assert_eq!(pipeline.bounds().max, Vec2::new(0.5, 0.6));

    let params = backend
        .commands()
        .iter()
        .find_map(|c| match c {
            GpuCommand::Dispatch { params, .. } => params.clone(),
            _ => None,
        })
        .unwrap();
    let params: PlacementParams = bytemuck::pod_read_unaligned(&params);
    assert_eq!(params.tex_coord_offset, [0.3, 0.6]);
    assert!((params.tex_coord_scale[0] - 0.2).abs() < 1e-6);
    assert_eq!(params.tex_coord_scale[1], 0.0);
}

#[test]
fn test_indirect_count_source() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::uniform(4, 4, 0, 255), PointCountSource::Indirect);
    pipeline
        .generate_entities(&mut backend, PlacementBounds::default(), DispatchGrid::new(1, 1))
        .unwrap();

    let set = pipeline.points().unwrap();
    assert_eq!(backend.read_u32(&set.buffer, 0), Some(16));
    assert_eq!(backend.read_u32(&set.buffer, 4), Some(1));

    backend.clear_commands();
    pipeline.draw(&mut backend).unwrap();
    let draw = backend.commands().last().unwrap();
    assert!(matches!(
        draw,
        GpuCommand::Draw {
            primitive: RecordedPrimitive::PointsIndirect { offset: 0, .. },
            ..
        }
    ));
}

#[test]
fn test_set_bounds_only_regenerates_on_change() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);
    pipeline.regenerate(&mut backend).unwrap();
    let dispatches = |b: &Recording| {
        b.commands()
            .iter()
            .filter(|c| matches!(c, GpuCommand::Dispatch { .. }))
            .count()
    };
    assert_eq!(dispatches(&backend), 1);

    // Same rectangle given with swapped corners
    let current = pipeline.bounds();
    let swapped = PlacementBounds::new(current.max, current.min);
    assert!(!pipeline.set_bounds(&mut backend, swapped).unwrap());
    assert_eq!(dispatches(&backend), 1);

    assert!(pipeline
        .set_bounds(&mut backend, PlacementBounds::new(Vec2::ZERO, Vec2::ONE))
        .unwrap());
    assert!(!pipeline.set_dispatch_grid(&mut backend, DispatchGrid::new(8, 8)).unwrap());
    assert!(pipeline.set_dispatch_grid(&mut backend, DispatchGrid::new(0, 2)).unwrap());
    assert_eq!(pipeline.dispatch_grid(), DispatchGrid::new(1, 2));
    assert_eq!(dispatches(&backend), 3);
    assert_eq!(backend.live_buffers(), 1);
}

#[test]
fn test_placement_failure_containment() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);
    pipeline.regenerate(&mut backend).unwrap();
    let id = pipeline.points().unwrap().buffer.id;
    let points = pipeline.point_count();

    backend.fail_next_dispatch("kernel fault");
    assert!(pipeline
        .generate_entities(&mut backend, PlacementBounds::default(), DispatchGrid::new(2, 2))
        .is_err());

    assert_eq!(pipeline.points().unwrap().buffer.id, id);
    assert_eq!(pipeline.point_count(), points);
    assert_eq!(pipeline.state(), GenerationState::Ready);
    assert_eq!(backend.live_buffers(), 1);
}

#[test]
fn test_placement_allocation_failure_keeps_points() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);
    pipeline.regenerate(&mut backend).unwrap();
    let id = pipeline.points().unwrap().buffer.id;
    let (points, max_points) = (pipeline.point_count(), pipeline.max_points());

    backend.fail_allocation_after(0, "out of device memory");
    let err = pipeline
        .generate_entities(&mut backend, PlacementBounds::default(), DispatchGrid::new(16, 16))
        .unwrap_err();

    assert!(matches!(err, GenError::Allocation { .. }));
    assert_eq!(pipeline.points().unwrap().buffer.id, id);
    assert_eq!(pipeline.point_count(), points);
    assert_eq!(pipeline.max_points(), max_points);
    assert_eq!(pipeline.dispatch_grid(), DispatchGrid::new(8, 8));
    assert_eq!(pipeline.state(), GenerationState::Ready);
    assert_eq!(backend.live_buffers(), 1);
}

#[test]
fn test_failed_bounds_change_is_retried() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);
    pipeline.regenerate(&mut backend).unwrap();
    let drawn = pipeline.points().unwrap().bounds;
    let wanted = PlacementBounds::new(Vec2::ZERO, Vec2::ONE);

    backend.fail_allocation_after(0, "out of device memory");
    assert!(pipeline.set_bounds(&mut backend, wanted).is_err());

    // Reported inputs still describe the points being drawn
    assert_eq!(pipeline.bounds(), drawn);
    assert_eq!(pipeline.points().unwrap().bounds, drawn);

    // Same request once memory is available again actually regenerates
    assert!(pipeline.set_bounds(&mut backend, wanted).unwrap());
    assert_eq!(pipeline.bounds(), wanted);
    assert_eq!(pipeline.points().unwrap().bounds, wanted);
    assert_eq!(backend.live_buffers(), 1);
}

#[test]
fn test_failed_grid_change_is_retried() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);
    pipeline.regenerate(&mut backend).unwrap();

    backend.fail_next_dispatch("kernel fault");
    assert!(pipeline.set_dispatch_grid(&mut backend, DispatchGrid::new(2, 2)).is_err());
    assert_eq!(pipeline.dispatch_grid(), DispatchGrid::new(8, 8));
    assert_eq!(pipeline.points().unwrap().grid, DispatchGrid::new(8, 8));

    assert!(pipeline.set_dispatch_grid(&mut backend, DispatchGrid::new(2, 2)).unwrap());
    assert_eq!(pipeline.dispatch_grid(), DispatchGrid::new(2, 2));
    assert_eq!(pipeline.max_points(), 8 * 8);
}

#[test]
fn test_world_data_kept_only_on_success() {
    let mut backend = Recording::new();
    let mut pipeline = placement(world_data::uniform(8, 8, 10, 255), PointCountSource::Capacity);
    pipeline.regenerate(&mut backend).unwrap();
    let full = pipeline.max_points();

    backend.fail_next_dispatch("kernel fault");
    assert!(pipeline
        .generate_entities_from(&mut backend, texture(world_data::uniform(8, 8, 10, 0)))
        .is_err());

    // Still reading the dense texture: every candidate is accepted
    pipeline.regenerate(&mut backend).unwrap();
    let set = pipeline.points().unwrap();
    assert_eq!(backend.read_u32(&set.buffer, 0), Some(full));

    pipeline
        .generate_entities_from(&mut backend, texture(world_data::uniform(8, 8, 10, 0)))
        .unwrap();
    let set = pipeline.points().unwrap();
    assert_eq!(backend.read_u32(&set.buffer, 0), Some(0));
}

#[test]
fn test_mesh_world_data_kept_only_on_success() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::uniform(8, 8, 0, 0));
    pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).unwrap();

    backend.fail_next_dispatch("kernel fault");
    assert!(pipeline
        .generate_mesh_from(&mut backend, DispatchGrid::new(1, 1), texture(world_data::uniform(8, 8, 255, 0)))
        .is_err());

    pipeline.generate_mesh(&mut backend, DispatchGrid::new(1, 1)).unwrap();
    let mesh = pipeline.mesh().unwrap();
    let position = mesh.vertex_layout.require(regions::POSITION).unwrap();
    let bytes = backend.read_bytes(&mesh.vertex_buffer).unwrap();
    let heights: Vec<f32> = f32s(&bytes[position.offset as usize..position.end() as usize])
        .chunks_exact(4)
        .map(|p| p[1])
        .collect();
    assert!(heights.iter().all(|&h| h == 0.0));
}

#[test]
fn test_oversized_mesh_grid_is_invalid_dispatch() {
    let mut backend = Recording::new();
    let mut pipeline = terrain(world_data::synthesize(16, 16));
    let err = pipeline
        .generate_mesh(&mut backend, DispatchGrid::new(1, 67_108_863))
        .unwrap_err();
    assert!(matches!(err, GenError::InvalidDispatch { .. }));
    assert_eq!(pipeline.state(), GenerationState::Uninitialized);
    assert!(backend.commands().is_empty());
}

#[test]
fn test_placement_draw_skipped_without_points() {
    let mut backend = Recording::new();
    let pipeline = placement(world_data::synthesize(16, 16), PointCountSource::Capacity);
    pipeline.draw(&mut backend).unwrap();
    assert!(backend.commands().is_empty());
}
