// Procedural Placement Constants - SINGLE SOURCE OF TRUTH
//
// Strides, binding indices and defaults shared by the pipelines, the
// backends and the WGSL kernels. Kernel sources must agree with these.

/// Per-element strides of every region the pipelines lay out
///
/// Strides are chosen by the call site, already padded for the consuming
/// stage: storage-buffer layout rounds vec3 up to 16 bytes.
pub mod strides {
    /// Position stored as vec4<f32>
    pub const POSITION: u64 = 16;

    /// Normal stored as vec4<f32>
    pub const NORMAL: u64 = 16;

    /// Texture coordinate stored as vec2<f32>
    pub const TEXCOORD: u64 = 8;

    /// Index stored as u32
    pub const INDEX: u64 = 4;

    /// Placed point stored as vec4<f32>
    pub const POINT: u64 = 16;

    /// Counter header: one counter slot padded to a vec4
    pub const COUNTER_HEADER: u64 = 16;
}

/// Region names used in arena layouts
pub mod regions {
    pub const POSITION: &str = "position";
    pub const NORMAL: &str = "normal";
    pub const TEXCOORD: &str = "texcoord";
    pub const INDEX: &str = "index";
    pub const COUNTER: &str = "counter";
    pub const POINTS: &str = "points";
}

/// Kernel binding indices
pub mod bindings {
    /// Terrain mesh kernel storage outputs
    pub mod mesh {
        pub const POSITIONS: u32 = 0;
        pub const NORMALS: u32 = 1;
        pub const TEXCOORDS: u32 = 2;
        pub const INDICES: u32 = 3;
    }

    /// Placement kernel storage target (counter + point array)
    pub mod placement {
        pub const OUTPUT: u32 = 0;
    }

    /// Sampling unit of the world-data texture
    pub const WORLD_DATA_UNIT: u32 = 0;
}

/// Vertex attribute locations
pub mod attributes {
    pub const POSITION: u32 = 0;
    pub const NORMAL: u32 = 1;
    pub const TEXCOORD: u32 = 2;
}

/// Bind group indices used by the wgpu backend
pub mod groups {
    pub const STORAGE_GROUP: u32 = 0;
    pub const TEXTURE_GROUP: u32 = 1;
    pub const PARAMS_GROUP: u32 = 2;
}

/// Kernel entry points and labels
pub mod kernels {
    pub const HEIGHTMAP_LABEL: &str = "heightmap";
    pub const HEIGHTMAP_ENTRY: &str = "generate_heightmap";
    pub const PLACEMENT_LABEL: &str = "placement";
    pub const PLACEMENT_ENTRY: &str = "place_entities";
}

/// Defaults taken from the interactive demo
pub mod defaults {
    pub const MESH_WORK_GROUPS: [u32; 2] = [8, 8];
    pub const PLACEMENT_WORK_GROUPS: [u32; 2] = [8, 8];
    pub const PLACEMENT_MIN: [f32; 2] = [0.3, 0.25];
    pub const PLACEMENT_MAX: [f32; 2] = [0.5, 0.6];
    pub const TERRAIN_SCALE: [f32; 3] = [10.0, 0.52, 7.62];
    pub const TERRAIN_OFFSET: [f32; 3] = [-0.5, 0.0, -0.5];
    pub const ENTITY_LIFT: f32 = 0.1;
    pub const POINT_COLOR: [f32; 4] = [1.0, 0.2, 0.2, 1.0];
    pub const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.12, 1.0];
    pub const TARGET_SIZE: [u32; 2] = [1280, 720];
}
