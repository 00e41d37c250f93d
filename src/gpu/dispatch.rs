//! Work-group sizing
//!
//! A compute kernel spawns `WorkGroupShape` threads per work group; the
//! caller picks how many work groups to launch (`DispatchGrid`). The product
//! is the number of threads along each axis, which the pipelines turn into
//! element counts.

use crate::error::{GenError, GenResult};
use serde::{Deserialize, Serialize};

/// Threads spawned per work group, fixed when the kernel is compiled
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkGroupShape {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkGroupShape {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[u32; 3]> for WorkGroupShape {
    fn from(v: [u32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Number of work groups launched by one dispatch
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchGrid {
    pub x: u32,
    pub y: u32,
    #[serde(default = "one")]
    pub z: u32,
}

fn one() -> u32 {
    1
}

impl DispatchGrid {
    /// A 2D grid (z = 1)
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }

    pub const fn new_3d(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Clamp every axis to at least one work group
    ///
    /// This is the caller-facing contract used by UI and config input;
    /// the sizer itself rejects zero axes.
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.max(1),
            y: self.y.max(1),
            z: self.z.max(1),
        }
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Default for DispatchGrid {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl From<[u32; 2]> for DispatchGrid {
    fn from(v: [u32; 2]) -> Self {
        Self::new(v[0], v[1])
    }
}

impl From<glam::UVec2> for DispatchGrid {
    fn from(v: glam::UVec2) -> Self {
        Self::new(v.x, v.y)
    }
}

/// Total threads along each axis: `grid * shape`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ThreadCount {
    /// Vertices of a regular grid mesh, one per thread in the XY plane
    #[inline]
    pub fn grid_vertex_count(&self) -> u32 {
        self.x * self.y
    }

    /// Indices of a regular grid mesh: two triangles per interior quad
    ///
    /// Zero when either axis has fewer than two threads. Counts produced by
    /// `size_dispatch` always fit; see `checked_grid_index_count`.
    #[inline]
    pub fn grid_index_count(&self) -> u32 {
        self.checked_grid_index_count().unwrap_or(u32::MAX)
    }

    /// Index count, or `None` when it does not fit a u32
    pub fn checked_grid_index_count(&self) -> Option<u32> {
        self.x
            .saturating_sub(1)
            .checked_mul(self.y.saturating_sub(1))?
            .checked_mul(6)
    }

    /// Upper bound on points a one-point-per-thread kernel can emit
    #[inline]
    pub fn max_points(&self) -> u32 {
        self.x * self.y
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Combine a work-group shape with a dispatch grid
///
/// Pure: the result depends only on the inputs. Fails when a grid axis is
/// zero or when an axis product does not fit the GPU's 32-bit thread ids.
pub fn size_dispatch(shape: WorkGroupShape, grid: DispatchGrid) -> GenResult<ThreadCount> {
    if grid.x == 0 || grid.y == 0 || grid.z == 0 {
        return Err(GenError::InvalidDispatch {
            grid: grid.as_array(),
            reason: "every axis must launch at least one work group",
        });
    }

    let axis = |g: u32, s: u32| {
        g.checked_mul(s).ok_or(GenError::InvalidDispatch {
            grid: grid.as_array(),
            reason: "thread count overflows u32",
        })
    };

    let threads = ThreadCount {
        x: axis(grid.x, shape.x)?,
        y: axis(grid.y, shape.y)?,
        z: axis(grid.z, shape.z)?,
    };

    // Element counts derived from x*y must also stay addressable
    threads.x.checked_mul(threads.y).ok_or(GenError::InvalidDispatch {
        grid: grid.as_array(),
        reason: "x*y thread count overflows u32",
    })?;
    threads.checked_grid_index_count().ok_or(GenError::InvalidDispatch {
        grid: grid.as_array(),
        reason: "grid mesh index count overflows u32",
    })?;

    Ok(threads)
}

/// Anything that can report its compiled work-group shape
pub trait ComputeKernel {
    /// Human-readable name for diagnostics
    fn label(&self) -> &str;

    /// Threads per work group, fixed at compile time
    fn work_group_shape(&self) -> WorkGroupShape;
}

/// Sizes dispatches for one kernel, querying its shape once
#[derive(Debug, Default)]
pub struct WorkGroupSizer {
    cached_shape: Option<WorkGroupShape>,
}

impl WorkGroupSizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread count for `grid` dispatched on `kernel`
    pub fn size_dispatch<K: ComputeKernel + ?Sized>(
        &mut self,
        kernel: &K,
        grid: DispatchGrid,
    ) -> GenResult<ThreadCount> {
        let shape = *self
            .cached_shape
            .get_or_insert_with(|| kernel.work_group_shape());
        size_dispatch(shape, grid)
    }

    /// Shape read on the first sizing, if any
    pub fn cached_shape(&self) -> Option<WorkGroupShape> {
        self.cached_shape
    }
}
