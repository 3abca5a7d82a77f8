//! Growable, type-tagged device buffers.
//!
//! Two growth policies exist. Persistent buffers hold the long-lived object
//! population: growth allocates a larger zero-initialized buffer, copies the
//! old contents into its prefix and drops the old allocation. Transient
//! buffers are rebuilt from scratch every tick (key banks, match tables,
//! reactions, shift maps): growth replaces the allocation without copying.
//!
//! Handles are the stable identity of a buffer. Consumers never cache the
//! raw `wgpu::Buffer` across ticks; bind groups are created at record time
//! from [`GpuBuffer::buffer`], so a reallocation is picked up by the next
//! dispatch with no registration machinery.

use std::marker::PhantomData;
use bytemuck::Pod;
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, CommandEncoder, ComputePass, Device, Queue};

use crate::error::SimError;
use crate::kernel::{compute_pipeline, KernelDispatch, WORKGROUP_SIZE};

/// Growth policy for a device buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Contents are preserved on resize.
    Persistent,
    /// Contents are discarded on resize.
    Transient,
}

/// Items added per growth step of a persistent buffer.
///
/// Wide records grow in smaller steps so a step stays in the same byte
/// ballpark across categories.
fn growth_step(item_bytes: u64) -> u64 {
    if item_bytes >= 64 {
        8192
    } else {
        32768
    }
}

pub(crate) fn grown_capacity(
    policy: GrowthPolicy,
    current_items: u64,
    item_bytes: u64,
    required_items: u64,
) -> u64 {
    match policy {
        GrowthPolicy::Persistent => {
            let step = growth_step(item_bytes);
            let mut capacity = current_items;
            while capacity < required_items {
                capacity += step;
            }
            capacity
        }
        GrowthPolicy::Transient => required_items.next_power_of_two(),
    }
}

/// A typed device buffer with a logical length and a growth policy.
pub struct GpuBuffer<T> {
    buffer: Buffer,
    len: u32,
    capacity: u64,
    label: &'static str,
    policy: GrowthPolicy,
    usages: BufferUsages,
    _phantom: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Allocates a zero-initialized buffer with the given item capacity.
    pub fn init(
        device: &Device,
        label: &'static str,
        capacity: u64,
        policy: GrowthPolicy,
        usages: BufferUsages,
    ) -> Self {
        let capacity = capacity.max(1);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: capacity * size_of::<T>() as u64,
            usage: usages,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len: 0,
            capacity,
            label,
            policy,
            usages,
            _phantom: PhantomData,
        }
    }

    /// Allocates a zeroed storage buffer usable as a copy source and target.
    pub fn storage(
        device: &Device,
        label: &'static str,
        capacity: u64,
        policy: GrowthPolicy,
    ) -> Self {
        Self::init(
            device,
            label,
            capacity,
            policy,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        )
    }

    /// Number of live items.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Item capacity of the current allocation.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The buffer currently backing this handle.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Sets the live item count. The caller is responsible for having
    /// ensured capacity first.
    pub fn set_len(&mut self, len: u32) {
        debug_assert!(len as u64 <= self.capacity);
        self.len = len;
    }

    /// Grows the allocation so it can hold at least `required` items.
    ///
    /// Growth never partially succeeds: either the new allocation is live
    /// (with the old contents copied in, for persistent buffers) or the
    /// buffer is untouched and a fatal capacity error is returned.
    pub fn ensure_capacity(
        &mut self,
        device: &Device,
        queue: &Queue,
        required: u64,
    ) -> Result<(), SimError> {
        if required <= self.capacity {
            return Ok(());
        }
        let item_bytes = size_of::<T>() as u64;
        let new_capacity = grown_capacity(self.policy, self.capacity, item_bytes, required);
        let new_bytes = new_capacity * item_bytes;
        let limit = device
            .limits()
            .max_buffer_size
            .min(device.limits().max_storage_buffer_binding_size as u64);
        if new_bytes > limit {
            return Err(SimError::Capacity {
                buffer: self.label,
                requested_bytes: new_bytes,
                limit,
            });
        }

        let new_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(self.label),
            size: new_bytes,
            usage: self.usages,
            mapped_at_creation: false,
        });
        if self.policy == GrowthPolicy::Persistent {
            let mut encoder = device.create_command_encoder(&Default::default());
            encoder.copy_buffer_to_buffer(
                &self.buffer,
                0,
                &new_buffer,
                0,
                self.capacity * item_bytes,
            );
            queue.submit(Some(encoder.finish()));
        }
        log::debug!(
            "buffer `{}` grew {} -> {} items",
            self.label,
            self.capacity,
            new_capacity
        );
        self.buffer = new_buffer;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Uploads `data` starting at item `first`.
    pub fn write(&self, queue: &Queue, first: u64, data: &[T]) {
        if data.is_empty() {
            return;
        }
        debug_assert!(first + data.len() as u64 <= self.capacity);
        queue.write_buffer(
            &self.buffer,
            first * size_of::<T>() as u64,
            bytemuck::cast_slice(data),
        );
    }

    /// Zeroes the whole allocation.
    pub fn clear(&self, encoder: &mut CommandEncoder) {
        encoder.clear_buffer(&self.buffer, 0, None);
    }

    /// Copies `items` items from `src` into this buffer.
    pub fn copy_from(&self, encoder: &mut CommandEncoder, src: &GpuBuffer<T>, items: u64) {
        if items == 0 {
            return;
        }
        debug_assert!(items <= src.capacity && items <= self.capacity);
        encoder.copy_buffer_to_buffer(
            &src.buffer,
            0,
            &self.buffer,
            0,
            items * size_of::<T>() as u64,
        );
    }

    /// Reads `count` items starting at item `first` back to the host.
    ///
    /// Blocks on the device. This is the synchronization point between the
    /// simulation phases that size buffers from device-computed totals.
    pub fn read_range(
        &self,
        device: &Device,
        queue: &Queue,
        first: u64,
        count: u64,
    ) -> Result<Vec<T>, SimError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        debug_assert!(first + count <= self.capacity);
        let item_bytes = size_of::<T>() as u64;
        let byte_len = count * item_bytes;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: byte_len,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&self.buffer, first * item_bytes, &staging, 0, byte_len);
        queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::PollType::Wait);
        match rx.recv() {
            Ok(Ok(())) => {
                let data = slice.get_mapped_range();
                let out = bytemuck::cast_slice(&data).to_vec();
                drop(data);
                staging.unmap();
                Ok(out)
            }
            _ => Err(SimError::dispatch(format!(
                "readback of buffer `{}` failed to map",
                self.label
            ))),
        }
    }

    /// Reads the live items back to the host.
    pub fn read(&self, device: &Device, queue: &Queue) -> Result<Vec<T>, SimError> {
        self.read_range(device, queue, 0, self.len as u64)
    }

    /// Reads a single item back to the host.
    pub fn read_one(&self, device: &Device, queue: &Queue, item: u64) -> Result<T, SimError> {
        let values = self.read_range(device, queue, item, 1)?;
        values.into_iter().next().ok_or_else(|| {
            SimError::dispatch(format!("readback of buffer `{}` was empty", self.label))
        })
    }
}

/// Uploads a small pod value as a fresh uniform buffer.
///
/// Phase parameters change between dispatches inside a single submission, so
/// each dispatch gets its own throwaway uniform rather than sharing one
/// queue-written block.
pub fn uniform_params<T: Pod>(device: &Device, params: &T) -> Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("params"),
        contents: bytemuck::bytes_of(params),
        usage: BufferUsages::UNIFORM,
    })
}

#[derive(Copy, Clone, Debug, Pod, bytemuck::Zeroable)]
#[repr(C)]
struct FillParams {
    len: u32,
    value: i32,
    pad0: u32,
    pad1: u32,
}

/// Fills `i32` storage with a constant, used to reset shift and slot maps to
/// their "no object" sentinel.
pub struct WgFill {
    fill_i32: wgpu::ComputePipeline,
}

impl WgFill {
    pub const SRC: &'static str = include_str!("fill.wgsl");

    pub fn new(device: &Device) -> Self {
        Self {
            fill_i32: compute_pipeline(device, "fill_i32", Self::SRC, "fill_i32"),
        }
    }

    /// Fills the first `words` 32-bit words of `buffer` with `value`.
    pub fn fill_i32(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        buffer: &Buffer,
        words: u32,
        value: i32,
    ) {
        if words == 0 {
            return;
        }
        let params = uniform_params(
            device,
            &FillParams {
                len: words,
                value,
                pad0: 0,
                pad1: 0,
            },
        );
        KernelDispatch::new(device, pass, &self.fill_i32)
            .bind0([&params, buffer])
            .dispatch(words.div_ceil(WORKGROUP_SIZE));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpu::{CommandEncoderExt, GpuInstance};

    #[test]
    fn growth_policy_math() {
        // Persistent growth moves in fixed steps from the current capacity.
        assert_eq!(
            grown_capacity(GrowthPolicy::Persistent, 1024, 16, 1025),
            1024 + 32768
        );
        assert_eq!(
            grown_capacity(GrowthPolicy::Persistent, 0, 16, 100_000),
            4 * 32768
        );
        // Wide records use the smaller step.
        assert_eq!(
            grown_capacity(GrowthPolicy::Persistent, 0, 64, 10_000),
            2 * 8192
        );
        // Transient growth rounds up to a power of two, no copy implied.
        assert_eq!(grown_capacity(GrowthPolicy::Transient, 64, 4, 100), 128);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn persistent_growth_preserves_contents() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let device = gpu.device();
        let mut buffer = GpuBuffer::<u32>::storage(device, "test", 256, GrowthPolicy::Persistent);
        let values: Vec<u32> = (0..256).collect();
        buffer.write(gpu.queue(), 0, &values);
        buffer.set_len(256);

        buffer
            .ensure_capacity(device, gpu.queue(), 50_000)
            .unwrap();
        assert!(buffer.capacity() >= 50_000);

        let read = buffer
            .read_range(device, gpu.queue(), 0, 300)
            .unwrap();
        assert_eq!(&read[..256], &values[..]);
        // The grown tail is zero-initialized.
        assert!(read[256..].iter().all(|v| *v == 0));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn fill_writes_sentinel() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let device = gpu.device();
        let fill = WgFill::new(device);
        let buffer = GpuBuffer::<i32>::storage(device, "test", 100, GrowthPolicy::Transient);

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("fill");
            fill.fill_i32(device, &mut pass, buffer.buffer(), 100, -1);
        }
        gpu.queue().submit(Some(encoder.finish()));

        let read = buffer.read_range(device, gpu.queue(), 0, 100).unwrap();
        assert!(read.iter().all(|v| *v == -1));
    }
}
