use std::sync::Arc;
use wgpu::{
    Adapter, Backends, Device, DeviceDescriptor, Features, Instance, InstanceDescriptor, Limits,
    PowerPreference, Queue, RequestAdapterOptions,
};

/// Helper struct to initialize the gpu device and its queue.
pub struct GpuInstance {
    _instance: Instance,
    adapter: Adapter,
    device: Arc<Device>,
    queue: Queue,
}

impl GpuInstance {
    /// Initializes the gpu instance, selecting a high-performance adapter.
    ///
    /// The storage-buffer limits are raised above the defaults: the wider
    /// population kernels bind up to 16 storage buffers per stage, and the
    /// point/hull arrays of a dense world outgrow the default binding size.
    pub async fn new() -> anyhow::Result<Self> {
        let backends = Backends::all();
        let instance_desc = InstanceDescriptor {
            backends,
            ..Default::default()
        };
        let instance = Instance::new(&instance_desc);
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|_| anyhow::anyhow!("Failed to initialize gpu adapter."))?;
        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: None,
                required_features: Features::empty(),
                required_limits: Limits {
                    max_storage_buffers_per_shader_stage: 16,
                    max_buffer_size: 600_000_000,
                    max_storage_buffer_binding_size: 600_000_000,
                    ..Default::default()
                },
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;

        Ok(Self {
            _instance: instance,
            adapter,
            device: Arc::new(device),
            queue,
        })
    }

    /// The gpu device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The gpu device, shared.
    pub fn device_arc(&self) -> Arc<Device> {
        self.device.clone()
    }

    /// The queue of the gpu device.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The adapter the device was initialized from.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

/// Convenience extension for starting compute passes.
pub trait CommandEncoderExt {
    /// Begins a labeled compute pass with no timestamp writes.
    fn compute_pass(&mut self, label: &str) -> wgpu::ComputePass<'_>;
}

impl CommandEncoderExt for wgpu::CommandEncoder {
    fn compute_pass(&mut self, label: &str) -> wgpu::ComputePass<'_> {
        self.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        })
    }
}
