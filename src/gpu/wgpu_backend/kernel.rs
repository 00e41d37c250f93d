//! Compute kernels compiled from WGSL
//!
//! The work-group shape is read from the entry point of the parsed module,
//! so it always matches what the driver was handed.

use crate::error::{GenError, GenResult};
use crate::gpu::dispatch::{ComputeKernel, WorkGroupShape};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use wgpu::naga;

use super::WgpuContext;

/// A compiled compute pipeline plus what its module declares
#[derive(Debug)]
pub struct WgpuKernel {
    label: String,
    shape: WorkGroupShape,
    pipeline: wgpu::ComputePipeline,
    /// group -> binding indices the module declares
    bindings: BTreeMap<u32, BTreeSet<u32>>,
}

/// What a WGSL module declares for one compute entry point
pub struct KernelReflection {
    pub module: naga::Module,
    pub shape: WorkGroupShape,
    /// group -> binding indices
    pub bindings: BTreeMap<u32, BTreeSet<u32>>,
}

/// Parse and validate `source`, reading the shape and bindings of `entry_point`
///
/// Needs no device; every failure is a `Compile` error.
pub fn reflect_wgsl(label: &str, source: &str, entry_point: &str) -> GenResult<KernelReflection> {
    let compile_error = |message: String| GenError::Compile {
        kernel: label.to_string(),
        message,
    };

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| compile_error(e.emit_to_string(source)))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| compile_error(e.into_inner().to_string()))?;

    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == entry_point && ep.stage == naga::ShaderStage::Compute)
        .ok_or_else(|| compile_error(format!("no compute entry point '{}'", entry_point)))?;
    let shape = WorkGroupShape::from(entry.workgroup_size);

    let mut bindings: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for (_, var) in module.global_variables.iter() {
        if let Some(rb) = &var.binding {
            bindings.entry(rb.group).or_default().insert(rb.binding);
        }
    }

    Ok(KernelReflection {
        module,
        shape,
        bindings,
    })
}

impl WgpuKernel {
    /// Compile `source`, using `entry_point` as the kernel
    pub fn from_wgsl(
        ctx: &WgpuContext,
        label: &str,
        source: &str,
        entry_point: &str,
    ) -> GenResult<Self> {
        let KernelReflection {
            module,
            shape,
            bindings,
        } = reflect_wgsl(label, source, entry_point)?;

        log::debug!(
            "[WgpuKernel] '{}' entry '{}' work group {:?}, bindings {:?}",
            label,
            entry_point,
            shape.as_array(),
            bindings
        );

        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Naga(Cow::Owned(module)),
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: None,
            module: &shader,
            entry_point,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(GenError::Compile {
                kernel: label.to_string(),
                message: error.to_string(),
            });
        }

        log::info!("[WgpuKernel] Compiled '{}'", label);

        Ok(Self {
            label: label.to_string(),
            shape,
            pipeline,
            bindings,
        })
    }

    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    /// Binding indices the module declares in `group`
    pub fn declared(&self, group: u32) -> BTreeSet<u32> {
        self.bindings.get(&group).cloned().unwrap_or_default()
    }
}

impl ComputeKernel for WgpuKernel {
    fn label(&self) -> &str {
        &self.label
    }

    fn work_group_shape(&self) -> WorkGroupShape {
        self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::kernels;
    use crate::world_gpu::{HEIGHTMAP_WGSL, PLACEMENT_WGSL};

    #[test]
    fn test_reflects_shipped_kernels() {
        let heightmap = reflect_wgsl("heightmap", HEIGHTMAP_WGSL, kernels::HEIGHTMAP_ENTRY).unwrap();
        assert_eq!(heightmap.shape, WorkGroupShape::new(8, 8, 1));
        assert_eq!(heightmap.bindings[&0], BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(heightmap.bindings[&1], BTreeSet::from([0]));

        let placement = reflect_wgsl("placement", PLACEMENT_WGSL, kernels::PLACEMENT_ENTRY).unwrap();
        assert_eq!(placement.shape, WorkGroupShape::new(4, 4, 1));
        assert!(placement.bindings.contains_key(&2));
    }

    #[test]
    fn test_malformed_source_is_compile_error() {
        let err = reflect_wgsl("broken", "@compute @workgroup_size(8 fn main() {}", "main")
            .err()
            .unwrap();
        assert!(matches!(err, GenError::Compile { ref kernel, .. } if kernel == "broken"));
    }

    #[test]
    fn test_invalid_module_is_compile_error() {
        // Parses, but the return type does not match
        let source = "fn f() -> u32 { return 1.0; }\n@compute @workgroup_size(1) fn main() { }";
        let err = reflect_wgsl("typed", source, "main").err().unwrap();
        assert!(matches!(err, GenError::Compile { .. }));
    }

    #[test]
    fn test_missing_entry_point_is_compile_error() {
        let err = reflect_wgsl("heightmap", HEIGHTMAP_WGSL, "no_such_entry").err().unwrap();
        match err {
            GenError::Compile { message, .. } => assert!(message.contains("no_such_entry")),
            other => panic!("expected Compile, got {:?}", other),
        }
    }

    #[test]
    fn test_non_compute_entry_is_rejected() {
        let source = "@vertex fn vs() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }";
        let err = reflect_wgsl("vertex", source, "vs").err().unwrap();
        assert!(matches!(err, GenError::Compile { .. }));
    }
}
