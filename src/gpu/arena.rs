//! GPU memory arena
//!
//! Packs named regions back to back inside one buffer. Alignment policy is
//! the caller's: each region's stride must already satisfy the stage that
//! consumes it, the arena never inserts padding of its own.

use crate::error::{GenError, GenResult};
use std::collections::HashMap;

/// A region request: `count` elements of `stride` bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionSpec {
    pub name: String,
    pub stride: u64,
    pub count: u64,
}

impl RegionSpec {
    pub fn new(name: impl Into<String>, stride: u64, count: u64) -> Self {
        Self {
            name: name.into(),
            stride,
            count,
        }
    }
}

/// A laid-out byte range inside a buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub element_stride: u64,
    pub element_count: u64,
    pub offset: u64,
    pub size: u64,
}

impl MemoryRegion {
    /// One past the last byte of the region
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Result of laying out a list of regions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArenaLayout {
    regions: Vec<MemoryRegion>,
    index: HashMap<String, usize>,
    total_size: u64,
}

impl ArenaLayout {
    /// Walk the specs in declaration order with a running cursor
    pub fn new(specs: &[RegionSpec]) -> GenResult<Self> {
        let mut regions = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        let mut cursor: u64 = 0;

        for spec in specs {
            let size = spec.stride.checked_mul(spec.count).ok_or_else(|| GenError::InvalidLayout {
                region: spec.name.clone(),
                reason: format!("{} elements of {} bytes overflow u64", spec.count, spec.stride),
            })?;

            if index.insert(spec.name.clone(), regions.len()).is_some() {
                return Err(GenError::InvalidLayout {
                    region: spec.name.clone(),
                    reason: "region declared twice".to_string(),
                });
            }

            regions.push(MemoryRegion {
                name: spec.name.clone(),
                element_stride: spec.stride,
                element_count: spec.count,
                offset: cursor,
                size,
            });

            cursor = cursor.checked_add(size).ok_or_else(|| GenError::InvalidLayout {
                region: spec.name.clone(),
                reason: "total size overflows u64".to_string(),
            })?;
        }

        log::trace!("[ArenaLayout] {} regions, {} bytes", regions.len(), cursor);

        Ok(Self {
            regions,
            index,
            total_size: cursor,
        })
    }

    /// Total bytes the owning buffer must hold
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Region by name
    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.index.get(name).map(|&i| &self.regions[i])
    }

    /// Region by name, as a layout error when absent
    pub fn require(&self, name: &str) -> GenResult<&MemoryRegion> {
        self.region(name).ok_or_else(|| GenError::InvalidLayout {
            region: name.to_string(),
            reason: "region not present in layout".to_string(),
        })
    }

    /// Regions in declaration order
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

/// Lay out `specs`, returning the region map and the total size
pub fn layout(specs: &[RegionSpec]) -> GenResult<(HashMap<String, MemoryRegion>, u64)> {
    let arena = ArenaLayout::new(specs)?;
    let total = arena.total_size();
    let map = arena
        .regions
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();
    Ok((map, total))
}

#[cfg(test)]
mod tests;
