use super::*;

fn mesh_specs(vertex_count: u64) -> Vec<RegionSpec> {
    vec![
        RegionSpec::new("position", 16, vertex_count),
        RegionSpec::new("normal", 16, vertex_count),
        RegionSpec::new("texcoord", 8, vertex_count),
    ]
}

#[test]
fn test_empty_layout() {
    let arena = ArenaLayout::new(&[]).unwrap();
    assert_eq!(arena.total_size(), 0);
    assert!(arena.regions().is_empty());
}

#[test]
fn test_mesh_regions_packed() {
    let arena = ArenaLayout::new(&mesh_specs(4096)).unwrap();

    let position = arena.region("position").unwrap();
    let normal = arena.region("normal").unwrap();
    let texcoord = arena.region("texcoord").unwrap();

    assert_eq!((position.offset, position.size), (0, 65536));
    assert_eq!((normal.offset, normal.size), (65536, 65536));
    assert_eq!((texcoord.offset, texcoord.size), (131072, 32768));
    assert_eq!(arena.total_size(), 163840);
}

#[test]
fn test_packing_properties() {
    let strides = [4u64, 8, 16, 12, 1, 32];
    for count in [0u64, 1, 3, 17, 1000] {
        let specs: Vec<_> = strides
            .iter()
            .enumerate()
            .map(|(i, &s)| RegionSpec::new(format!("r{i}"), s, count + i as u64))
            .collect();
        let arena = ArenaLayout::new(&specs).unwrap();

        let mut cursor = 0;
        for (spec, region) in specs.iter().zip(arena.regions()) {
            assert_eq!(region.offset, cursor);
            assert_eq!(region.size, spec.stride * spec.count);
            cursor = region.end();
        }
        assert_eq!(arena.total_size(), cursor);

        let sum: u64 = arena.regions().iter().map(|r| r.size).sum();
        assert_eq!(arena.total_size(), sum);
        assert!(arena.regions().windows(2).all(|w| w[0].offset <= w[1].offset));
    }
}

#[test]
fn test_zero_count_region_does_not_advance() {
    let specs = vec![
        RegionSpec::new("a", 16, 2),
        RegionSpec::new("empty", 16, 0),
        RegionSpec::new("b", 4, 3),
    ];
    let arena = ArenaLayout::new(&specs).unwrap();

    let empty = arena.region("empty").unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.offset, 32);
    assert_eq!(arena.region("b").unwrap().offset, 32);
    assert_eq!(arena.total_size(), 44);
}

#[test]
fn test_offsets_are_stride_multiples_for_uniform_strides() {
    let arena = ArenaLayout::new(&[
        RegionSpec::new("counter", 16, 1),
        RegionSpec::new("points", 16, 256),
    ])
    .unwrap();
    for region in arena.regions() {
        assert_eq!(region.offset % region.element_stride, 0);
    }
}

#[test]
fn test_overflow_is_invalid_layout() {
    let result = ArenaLayout::new(&[RegionSpec::new("huge", u64::MAX, 2)]);
    assert!(matches!(result, Err(GenError::InvalidLayout { .. })));

    let result = ArenaLayout::new(&[
        RegionSpec::new("a", u64::MAX / 2, 1),
        RegionSpec::new("b", u64::MAX / 2, 1),
        RegionSpec::new("c", u64::MAX / 2, 1),
    ]);
    assert!(matches!(result, Err(GenError::InvalidLayout { .. })));
}

#[test]
fn test_duplicate_names_rejected() {
    let result = ArenaLayout::new(&[RegionSpec::new("a", 4, 1), RegionSpec::new("a", 4, 1)]);
    assert!(matches!(result, Err(GenError::InvalidLayout { region, .. }) if region == "a"));
}

#[test]
fn test_layout_is_deterministic() {
    let a = ArenaLayout::new(&mesh_specs(576)).unwrap();
    let b = ArenaLayout::new(&mesh_specs(576)).unwrap();
    assert_eq!(a, b);

    let (map, total) = layout(&mesh_specs(576)).unwrap();
    assert_eq!(total, a.total_size());
    assert_eq!(map["normal"], *a.region("normal").unwrap());
}

#[test]
fn test_require_missing_region() {
    let arena = ArenaLayout::new(&mesh_specs(1)).unwrap();
    assert!(arena.require("index").is_err());
    assert!(arena.require("position").is_ok());
}
