//! Read-only render snapshot of the world.
//!
//! The physics thread refreshes the mirror once per tick, after compaction,
//! with plain buffer-to-buffer copies on a dedicated submission. Renderers
//! bind the mirror's buffers and never the live set, so a tick in flight
//! cannot shear a frame being drawn.

use wgpu::{Device, Queue};

use crate::error::SimError;
use crate::objects::{GpuObjectSet, InitialCapacity, RowCounts};

/// A second [`GpuObjectSet`] holding the latest complete tick.
pub struct RenderMirror {
    objects: GpuObjectSet,
    frame: u64,
}

impl RenderMirror {
    pub fn new(device: &Device) -> Self {
        Self {
            objects: GpuObjectSet::new(device, &InitialCapacity::small()),
            frame: 0,
        }
    }

    /// The mirrored population. A refresh replaces its contents wholesale.
    pub fn objects(&self) -> &GpuObjectSet {
        &self.objects
    }

    /// Row counts captured by the latest refresh.
    pub fn counts(&self) -> RowCounts {
        self.objects.row_counts()
    }

    /// Number of refreshes taken so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Copies the live arrays of `src` into the mirror.
    pub fn refresh(
        &mut self,
        device: &Device,
        queue: &Queue,
        src: &GpuObjectSet,
    ) -> Result<(), SimError> {
        self.objects
            .ensure_object_capacity(device, queue, &src.row_counts())?;
        let mut encoder = device.create_command_encoder(&Default::default());
        src.record_copy_into(&mut encoder, &mut self.objects);
        queue.submit(Some(encoder.finish()));
        self.frame += 1;
        Ok(())
    }
}
