//! Compute pipeline construction and dispatch.
//!
//! Every kernel in this crate is dispatched through [`KernelDispatch`]: bind
//! groups are created at record time from whatever buffer currently backs
//! each handle, so a buffer that grew (and was therefore reallocated) since
//! the last tick is picked up without any re-registration step.

use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, Buffer, ComputePass, ComputePipeline, Device,
};

/// Workgroup size of the per-element kernels.
pub const WORKGROUP_SIZE: u32 = 64;

/// Builds a compute pipeline from an embedded wgsl module.
///
/// The bind group layouts are derived from the shader, so the binding slots
/// listed at the dispatch site must match the slots the entry point actually
/// uses.
pub fn compute_pipeline(
    device: &Device,
    label: &str,
    source: &str,
    entry_point: &str,
) -> ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: None,
        module: &module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Helper struct for dispatching a kernel.
pub struct KernelDispatch<'a, 'b> {
    device: &'a Device,
    pass: &'a mut ComputePass<'b>,
    pipeline: &'a ComputePipeline,
    bind_groups: Vec<(u32, BindGroup)>,
}

impl<'a, 'b> KernelDispatch<'a, 'b> {
    /// Initializes a dispatch for the given compute `pipeline`.
    pub fn new(
        device: &'a Device,
        pass: &'a mut ComputePass<'b>,
        pipeline: &'a ComputePipeline,
    ) -> Self {
        Self {
            device,
            pass,
            pipeline,
            bind_groups: Vec::new(),
        }
    }

    /// Binds `buffers` to the bind group 0, at consecutive slots starting at 0.
    pub fn bind0<const N: usize>(self, buffers: [&Buffer; N]) -> Self {
        self.bind(0, buffers)
    }

    /// Binds `buffers` to the given bind `group`, at consecutive slots
    /// starting at 0.
    pub fn bind<const N: usize>(self, group: u32, buffers: [&Buffer; N]) -> Self {
        let entries = buffers
            .iter()
            .enumerate()
            .map(|(slot, buffer)| BindGroupEntry {
                binding: slot as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.bind_entries(group, entries)
    }

    /// Binds buffers to explicit slots of the given bind `group`.
    ///
    /// Use this form for entry points that only reference a sparse subset of
    /// the slots declared by their module.
    pub fn bind_at<const N: usize>(self, group: u32, buffers: [(&Buffer, u32); N]) -> Self {
        let entries = buffers
            .iter()
            .map(|(buffer, slot)| BindGroupEntry {
                binding: *slot,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.bind_entries(group, entries)
    }

    fn bind_entries(mut self, group: u32, entries: Vec<BindGroupEntry>) -> Self {
        let layout = self.pipeline.get_bind_group_layout(group);
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &entries,
        });
        self.bind_groups.push((group, bind_group));
        self
    }

    /// Records the dispatch with the given number of workgroups.
    ///
    /// A zero-sized dispatch records nothing.
    pub fn dispatch(self, workgroups: u32) {
        if workgroups == 0 {
            return;
        }
        self.pass.set_pipeline(self.pipeline);
        for (group, bind_group) in &self.bind_groups {
            self.pass.set_bind_group(*group, bind_group, &[]);
        }
        self.pass.dispatch_workgroups(workgroups, 1, 1);
    }
}
