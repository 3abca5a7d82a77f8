//! In-place removal of deleted entities and everything they own.
//!
//! Deletion cascades: an entity takes its hulls, points, edges and bones
//! with it. A per-entity counting pass feeds the fused delete scan, whose
//! offsets become per-object shift distances; chunked movers then slide
//! every surviving row down over the holes, rewriting cross-references
//! against the shift tables as they go. Object order is preserved, so the
//! grouped-by-entity layout the rest of the engine relies on survives.
//!
//! Recording splits once, after the scan: the host reads the six delete
//! totals back both to skip the move entirely on quiet frames and to shrink
//! the population counters afterwards.

use wgpu::{ComputePass, ComputePipeline, Device, Queue};

use crate::buffers::{uniform_params, GpuBuffer, GrowthPolicy, WgFill};
use crate::error::SimError;
use crate::gpu::CommandEncoderExt;
use crate::kernel::{compute_pipeline, KernelDispatch, WORKGROUP_SIZE};
use crate::objects::GpuObjectSet;
use crate::scan::{DeleteScanWorkspace, WgDeleteScan};

const MARK_SRC: &str = include_str!("compact_mark.wgsl");
const POINTS_SRC: &str = include_str!("compact_points.wgsl");
const EDGES_SRC: &str = include_str!("compact_edges.wgsl");
const HULLS_SRC: &str = include_str!("compact_hulls.wgsl");
const ENTITIES_SRC: &str = include_str!("compact_entities.wgsl");
const BONES_SRC: &str = include_str!("compact_bones.wgsl");

/// Rows per mover chunk. Matches the mover workgroup size: a chunk reads
/// all of its rows before its barrier and writes after, and chunks are
/// recorded low to high so writes never land ahead of unread rows.
const MOVE_CHUNK: u32 = 256;

#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct MarkParams {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

impl MarkParams {
    fn new(count: u32) -> Self {
        Self {
            count,
            pad0: 0,
            pad1: 0,
            pad2: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct MoveParams {
    start: u32,
    count: u32,
    pad0: u32,
    pad1: u32,
}

impl MoveParams {
    fn new(start: u32, count: u32) -> Self {
        Self {
            start,
            count,
            pad0: 0,
            pad1: 0,
        }
    }
}

fn chunk_starts(count: u32) -> impl Iterator<Item = u32> {
    (0..count).step_by(MOVE_CHUNK as usize)
}

/// Rows removed by one compaction pass, per category.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionTotals {
    pub points: u32,
    pub edges: u32,
    pub hulls: u32,
    pub entities: u32,
    pub hull_bones: u32,
    pub entity_bones: u32,
}

impl CompactionTotals {
    pub fn is_empty(&self) -> bool {
        self.entities == 0
    }
}

/// Compaction engine: delete counting, the fused offset scan and the six
/// category movers.
pub struct WgCompact {
    count_deletes: ComputePipeline,
    mark_shifts: ComputePipeline,
    move_points: ComputePipeline,
    move_edges: ComputePipeline,
    move_hulls: ComputePipeline,
    move_entities: ComputePipeline,
    move_hull_bones: ComputePipeline,
    move_entity_bones: ComputePipeline,
    fill: WgFill,
    delete_scan: WgDeleteScan,
    scan_workspace: DeleteScanWorkspace,

    counts2: GpuBuffer<[u32; 2]>,
    counts4: GpuBuffer<[u32; 4]>,
    offsets2: GpuBuffer<[u32; 2]>,
    offsets4: GpuBuffer<[u32; 4]>,
    point_shifts: GpuBuffer<i32>,
    edge_shifts: GpuBuffer<i32>,
    hull_shifts: GpuBuffer<i32>,
    hull_bone_shifts: GpuBuffer<i32>,
    entity_bone_shifts: GpuBuffer<i32>,
}

impl WgCompact {
    pub fn new(device: &Device) -> Self {
        use GrowthPolicy::Transient;
        Self {
            count_deletes: compute_pipeline(device, "count_deletes", MARK_SRC, "count_deletes"),
            mark_shifts: compute_pipeline(device, "mark_shifts", MARK_SRC, "mark_shifts"),
            move_points: compute_pipeline(device, "compact_points", POINTS_SRC, "compact_points"),
            move_edges: compute_pipeline(device, "compact_edges", EDGES_SRC, "compact_edges"),
            move_hulls: compute_pipeline(device, "compact_hulls", HULLS_SRC, "compact_hulls"),
            move_entities: compute_pipeline(
                device,
                "compact_entities",
                ENTITIES_SRC,
                "compact_entities",
            ),
            move_hull_bones: compute_pipeline(
                device,
                "compact_hull_bones",
                BONES_SRC,
                "compact_hull_bones",
            ),
            move_entity_bones: compute_pipeline(
                device,
                "compact_entity_bones",
                BONES_SRC,
                "compact_entity_bones",
            ),
            fill: WgFill::new(device),
            delete_scan: WgDeleteScan::new(device),
            scan_workspace: DeleteScanWorkspace::new(),

            counts2: GpuBuffer::storage(device, "delete counts2", 1, Transient),
            counts4: GpuBuffer::storage(device, "delete counts4", 1, Transient),
            offsets2: GpuBuffer::storage(device, "delete offsets2", 1, Transient),
            offsets4: GpuBuffer::storage(device, "delete offsets4", 1, Transient),
            point_shifts: GpuBuffer::storage(device, "point_shifts", 1, Transient),
            edge_shifts: GpuBuffer::storage(device, "edge_shifts", 1, Transient),
            hull_shifts: GpuBuffer::storage(device, "hull_shifts", 1, Transient),
            hull_bone_shifts: GpuBuffer::storage(device, "hull_bone_shifts", 1, Transient),
            entity_bone_shifts: GpuBuffer::storage(device, "entity_bone_shifts", 1, Transient),
        }
    }

    /// Sizes the scratch structures against the current population.
    pub fn reserve(
        &mut self,
        device: &Device,
        queue: &Queue,
        objects: &GpuObjectSet,
    ) -> Result<(), SimError> {
        let entities = objects.entity_count() as u64;
        self.counts2.ensure_capacity(device, queue, entities)?;
        self.counts4.ensure_capacity(device, queue, entities)?;
        self.offsets2.ensure_capacity(device, queue, entities)?;
        self.offsets4.ensure_capacity(device, queue, entities)?;
        self.point_shifts
            .ensure_capacity(device, queue, objects.point_count() as u64)?;
        self.edge_shifts
            .ensure_capacity(device, queue, objects.edge_count() as u64)?;
        self.hull_shifts
            .ensure_capacity(device, queue, objects.hull_count() as u64)?;
        self.hull_bone_shifts
            .ensure_capacity(device, queue, objects.hull_bone_count() as u64)?;
        self.entity_bone_shifts
            .ensure_capacity(device, queue, objects.entity_bone_count() as u64)?;
        self.scan_workspace
            .reserve(device, queue, objects.entity_count())
    }

    /// Tallies each entity's delete cascade and scans the offsets.
    pub fn count_and_scan(
        &mut self,
        device: &Device,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
    ) {
        let count = objects.entity_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &MarkParams::new(count));
        KernelDispatch::new(device, pass, &self.count_deletes)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.entity_flags.buffer(), 1),
                    (objects.entity_hull_tables.buffer(), 2),
                    (objects.entity_bone_tables.buffer(), 3),
                    (objects.hull_point_tables.buffer(), 4),
                    (objects.hull_edge_tables.buffer(), 5),
                    (objects.hull_bone_tables.buffer(), 6),
                    (self.counts2.buffer(), 7),
                    (self.counts4.buffer(), 8),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
        self.delete_scan.scan_out(
            device,
            pass,
            &mut self.scan_workspace,
            self.counts2.buffer(),
            self.counts4.buffer(),
            self.offsets2.buffer(),
            self.offsets4.buffer(),
            count,
        );
    }

    /// Reads back the totals of the last recorded [`Self::count_and_scan`].
    pub fn read_totals(&self, device: &Device, queue: &Queue) -> Result<CompactionTotals, SimError> {
        let (t2, t4) = self.scan_workspace.read_totals(device, queue)?;
        Ok(CompactionTotals {
            points: t4[0],
            edges: t2[0],
            hulls: t4[1],
            entities: t4[2],
            hull_bones: t2[1],
            entity_bones: t4[3],
        })
    }

    /// Resets the shift tables to the dead sentinel and publishes the live
    /// shifts.
    pub fn mark_shifts(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.entity_count();
        if count == 0 {
            return;
        }
        self.fill
            .fill_i32(device, pass, self.point_shifts.buffer(), objects.point_count(), -1);
        self.fill
            .fill_i32(device, pass, self.edge_shifts.buffer(), objects.edge_count(), -1);
        self.fill
            .fill_i32(device, pass, self.hull_shifts.buffer(), objects.hull_count(), -1);
        self.fill.fill_i32(
            device,
            pass,
            self.hull_bone_shifts.buffer(),
            objects.hull_bone_count(),
            -1,
        );
        self.fill.fill_i32(
            device,
            pass,
            self.entity_bone_shifts.buffer(),
            objects.entity_bone_count(),
            -1,
        );
        let params = uniform_params(device, &MarkParams::new(count));
        KernelDispatch::new(device, pass, &self.mark_shifts)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.entity_flags.buffer(), 1),
                    (objects.entity_hull_tables.buffer(), 2),
                    (objects.entity_bone_tables.buffer(), 3),
                    (objects.hull_point_tables.buffer(), 4),
                    (objects.hull_edge_tables.buffer(), 5),
                    (objects.hull_bone_tables.buffer(), 6),
                    (self.offsets2.buffer(), 7),
                    (self.offsets4.buffer(), 8),
                    (self.point_shifts.buffer(), 9),
                    (self.edge_shifts.buffer(), 10),
                    (self.hull_shifts.buffer(), 11),
                    (self.hull_bone_shifts.buffer(), 12),
                    (self.entity_bone_shifts.buffer(), 13),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Slides every surviving row down over the deleted ones.
    pub fn move_objects(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        for start in chunk_starts(objects.point_count()) {
            let params = uniform_params(device, &MoveParams::new(start, objects.point_count()));
            KernelDispatch::new(device, pass, &self.move_points)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (self.point_shifts.buffer(), 1),
                        (self.hull_shifts.buffer(), 2),
                        (self.hull_bone_shifts.buffer(), 3),
                        (objects.points.buffer(), 4),
                        (objects.point_hulls.buffer(), 5),
                        (objects.point_flags.buffer(), 6),
                        (objects.point_hits.buffer(), 7),
                        (objects.point_bone_tables.buffer(), 8),
                    ],
                )
                .dispatch(1);
        }
        for start in chunk_starts(objects.edge_count()) {
            let params = uniform_params(device, &MoveParams::new(start, objects.edge_count()));
            KernelDispatch::new(device, pass, &self.move_edges)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (self.edge_shifts.buffer(), 1),
                        (self.point_shifts.buffer(), 2),
                        (objects.edges.buffer(), 3),
                        (objects.edge_lengths.buffer(), 4),
                        (objects.edge_flags.buffer(), 5),
                        (objects.edge_pins.buffer(), 6),
                    ],
                )
                .dispatch(1);
        }
        for start in chunk_starts(objects.hull_count()) {
            let params = uniform_params(device, &MoveParams::new(start, objects.hull_count()));
            KernelDispatch::new(device, pass, &self.move_hulls)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (self.hull_shifts.buffer(), 1),
                        (self.point_shifts.buffer(), 2),
                        (self.edge_shifts.buffer(), 3),
                        (self.hull_bone_shifts.buffer(), 4),
                        (self.offsets4.buffer(), 5),
                        (objects.hulls.buffer(), 6),
                        (objects.hull_scale_rots.buffer(), 7),
                        (objects.hull_flags.buffer(), 8),
                        (objects.hull_entity_ids.buffer(), 9),
                        (objects.hull_point_tables.buffer(), 10),
                        (objects.hull_edge_tables.buffer(), 11),
                        (objects.hull_bone_tables.buffer(), 12),
                        (objects.hull_materials.buffer(), 13),
                        (objects.hull_integrities.buffer(), 14),
                    ],
                )
                .dispatch(1);
        }
        for start in chunk_starts(objects.entity_count()) {
            let params = uniform_params(device, &MoveParams::new(start, objects.entity_count()));
            KernelDispatch::new(device, pass, &self.move_entities)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (self.offsets4.buffer(), 1),
                        (self.hull_shifts.buffer(), 2),
                        (self.entity_bone_shifts.buffer(), 3),
                        (objects.entities.buffer(), 4),
                        (objects.entity_root_hulls.buffer(), 5),
                        (objects.entity_hull_tables.buffer(), 6),
                        (objects.entity_bone_tables.buffer(), 7),
                        (objects.entity_masses.buffer(), 8),
                        (objects.entity_accels.buffer(), 9),
                        (objects.entity_flags.buffer(), 10),
                        (objects.entity_model_ids.buffer(), 11),
                    ],
                )
                .dispatch(1);
        }
        for start in chunk_starts(objects.hull_bone_count()) {
            let params = uniform_params(device, &MoveParams::new(start, objects.hull_bone_count()));
            KernelDispatch::new(device, pass, &self.move_hull_bones)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (self.hull_bone_shifts.buffer(), 1),
                        (objects.hull_bones.buffer(), 3),
                        (objects.hull_bone_bind_poses.buffer(), 4),
                    ],
                )
                .dispatch(1);
        }
        for start in chunk_starts(objects.entity_bone_count()) {
            let params =
                uniform_params(device, &MoveParams::new(start, objects.entity_bone_count()));
            KernelDispatch::new(device, pass, &self.move_entity_bones)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (self.entity_bone_shifts.buffer(), 2),
                        (objects.entity_bones.buffer(), 5),
                        (objects.entity_bone_refs.buffer(), 6),
                        (objects.entity_bone_parents.buffer(), 7),
                    ],
                )
                .dispatch(1);
        }
    }

    /// Shrinks the population counters by the removed totals.
    pub fn apply_totals(&self, objects: &mut GpuObjectSet, totals: &CompactionTotals) {
        objects.set_point_count(objects.point_count() - totals.points);
        objects.set_edge_count(objects.edge_count() - totals.edges);
        objects.set_hull_count(objects.hull_count() - totals.hulls);
        objects.set_entity_count(objects.entity_count() - totals.entities);
        objects.set_hull_bone_count(objects.hull_bone_count() - totals.hull_bones);
        objects.set_entity_bone_count(objects.entity_bone_count() - totals.entity_bones);
    }

    /// Runs a full compaction round: count, scan, read the totals back and,
    /// when anything died, move the survivors and shrink the counters.
    pub fn run(
        &mut self,
        device: &Device,
        queue: &Queue,
        objects: &mut GpuObjectSet,
    ) -> Result<CompactionTotals, SimError> {
        if objects.entity_count() == 0 {
            return Ok(CompactionTotals::default());
        }
        self.reserve(device, queue, objects)?;

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("compact count");
            self.count_and_scan(device, &mut pass, objects);
        }
        queue.submit(Some(encoder.finish()));

        let totals = self.read_totals(device, queue)?;
        if totals.is_empty() {
            return Ok(totals);
        }

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("compact move");
            self.mark_shifts(device, &mut pass, objects);
            self.move_objects(device, &mut pass, objects);
        }
        queue.submit(Some(encoder.finish()));

        self.apply_totals(objects, &totals);
        log::debug!(
            "compacted: {} entities, {} hulls, {} points, {} edges removed",
            totals.entities,
            totals.hulls,
            totals.points,
            totals.edges,
        );
        Ok(totals)
    }
}
