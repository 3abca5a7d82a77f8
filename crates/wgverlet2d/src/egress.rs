//! World egress: extraction of departing entities into drainable batches.
//!
//! Three exits share one classification pass. Entities that left the
//! partition bounds are copied whole into a standby object set, rebased to
//! a zero-based frame so the drained [`ObjectBatch`] merges into another
//! partition unchanged. Entities whose integrity ran out reduce to debris
//! records, and collected entities to their model ids; both beat sector
//! departure when flags overlap. Every exiting entity is flagged deleted
//! on the source so compaction reclaims its rows the same frame.
//!
//! Two destination sets alternate: the set written this frame is read back
//! on the next one, so a drain never races the copies into the other set.

use wgpu::{CommandEncoder, ComputePass, ComputePipeline, Device, Queue};

use crate::buffers::{uniform_params, GpuBuffer, GrowthPolicy};
use crate::error::SimError;
use crate::gpu::CommandEncoderExt;
use crate::kernel::{compute_pipeline, KernelDispatch, WORKGROUP_SIZE};
use crate::objects::{GpuObjectSet, InitialCapacity, ObjectBatch, RowCounts};

const PREPARE_SRC: &str = include_str!("egress_prepare.wgsl");
const POINTS_SRC: &str = include_str!("egress_points.wgsl");
const EDGES_SRC: &str = include_str!("egress_edges.wgsl");
const HULLS_SRC: &str = include_str!("egress_hulls.wgsl");
const ENTITIES_SRC: &str = include_str!("egress_entities.wgsl");
const BONES_SRC: &str = include_str!("egress_bones.wgsl");

const CTR_POINTS: usize = 0;
const CTR_EDGES: usize = 1;
const CTR_HULLS: usize = 2;
const CTR_ENTITIES: usize = 3;
const CTR_HULL_BONES: usize = 4;
const CTR_ENTITY_BONES: usize = 5;
const CTR_BROKEN: usize = 6;
const CTR_COLLECTED: usize = 7;
const COUNTER_SLOTS: u64 = 8;

#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct EgressParams {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

impl EgressParams {
    fn new(count: u32) -> Self {
        Self {
            count,
            pad0: 0,
            pad1: 0,
            pad2: 0,
        }
    }
}

/// Debris record left behind by a broken entity.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Debris {
    pub model_id: i32,
    pub position: [f32; 2],
}

/// Everything one egress cycle pulled out of the world.
#[derive(Clone, Debug, Default)]
pub struct EgressOutput {
    /// Departed entities, self-contained and mergeable elsewhere.
    pub batch: ObjectBatch,
    pub broken: Vec<Debris>,
    pub collected: Vec<i32>,
}

struct EgressSet {
    objects: GpuObjectSet,
    broken_models: GpuBuffer<i32>,
    broken_positions: GpuBuffer<[f32; 2]>,
    collected_models: GpuBuffer<i32>,
    pending: bool,
}

impl EgressSet {
    fn new(device: &Device) -> Self {
        use GrowthPolicy::Persistent;
        Self {
            objects: GpuObjectSet::new(device, &InitialCapacity::small()),
            broken_models: GpuBuffer::storage(device, "broken_models", 1, Persistent),
            broken_positions: GpuBuffer::storage(device, "broken_positions", 1, Persistent),
            collected_models: GpuBuffer::storage(device, "collected_models", 1, Persistent),
            pending: false,
        }
    }
}

/// Egress engine: the classification pass, the per-category copy kernels
/// and the pair of alternating destination sets.
pub struct WgEgress {
    prepare: ComputePipeline,
    copy_points: ComputePipeline,
    copy_edges: ComputePipeline,
    copy_hull_poses: ComputePipeline,
    copy_hull_tables: ComputePipeline,
    copy_entity_poses: ComputePipeline,
    copy_entity_tables: ComputePipeline,
    copy_hull_bones: ComputePipeline,
    copy_entity_bones: ComputePipeline,

    counters: GpuBuffer<u32>,
    slots2: GpuBuffer<[u32; 2]>,
    slots4: GpuBuffer<[u32; 4]>,
    marks: GpuBuffer<u32>,
    sets: [EgressSet; 2],
    active: usize,
}

impl WgEgress {
    pub fn new(device: &Device) -> Self {
        use GrowthPolicy::Transient;
        let mut counters = GpuBuffer::storage(device, "egress counters", COUNTER_SLOTS, Transient);
        counters.set_len(COUNTER_SLOTS as u32);
        Self {
            prepare: compute_pipeline(device, "egress_prepare", PREPARE_SRC, "egress_prepare"),
            copy_points: compute_pipeline(device, "egress_points", POINTS_SRC, "egress_points"),
            copy_edges: compute_pipeline(device, "egress_edges", EDGES_SRC, "egress_edges"),
            copy_hull_poses: compute_pipeline(
                device,
                "egress_hull_poses",
                HULLS_SRC,
                "egress_hull_poses",
            ),
            copy_hull_tables: compute_pipeline(
                device,
                "egress_hull_tables",
                HULLS_SRC,
                "egress_hull_tables",
            ),
            copy_entity_poses: compute_pipeline(
                device,
                "egress_entity_poses",
                ENTITIES_SRC,
                "egress_entity_poses",
            ),
            copy_entity_tables: compute_pipeline(
                device,
                "egress_entity_tables",
                ENTITIES_SRC,
                "egress_entity_tables",
            ),
            copy_hull_bones: compute_pipeline(
                device,
                "egress_hull_bones",
                BONES_SRC,
                "egress_hull_bones",
            ),
            copy_entity_bones: compute_pipeline(
                device,
                "egress_entity_bones",
                BONES_SRC,
                "egress_entity_bones",
            ),

            counters,
            slots2: GpuBuffer::storage(device, "egress slots2", 1, Transient),
            slots4: GpuBuffer::storage(device, "egress slots4", 1, Transient),
            marks: GpuBuffer::storage(device, "egress marks", 1, Transient),
            sets: [EgressSet::new(device), EgressSet::new(device)],
            active: 0,
        }
    }

    /// Sizes the slot maps and the active destination set so a frame where
    /// everything departs at once still fits.
    pub fn reserve(
        &mut self,
        device: &Device,
        queue: &Queue,
        objects: &GpuObjectSet,
    ) -> Result<(), SimError> {
        let entities = objects.entity_count() as u64;
        self.slots2.ensure_capacity(device, queue, entities)?;
        self.slots4.ensure_capacity(device, queue, entities)?;
        self.marks.ensure_capacity(device, queue, entities)?;
        let set = &mut self.sets[self.active];
        set.objects
            .ensure_object_capacity(device, queue, &objects.row_counts())?;
        set.broken_models.ensure_capacity(device, queue, entities)?;
        set.broken_positions
            .ensure_capacity(device, queue, entities)?;
        set.collected_models
            .ensure_capacity(device, queue, entities)?;
        Ok(())
    }

    /// Records the classification and copy passes into `encoder`.
    pub fn record(&self, device: &Device, encoder: &mut CommandEncoder, objects: &GpuObjectSet) {
        self.counters.clear(encoder);
        self.marks.clear(encoder);
        let mut pass = encoder.compute_pass("egress");
        self.record_prepare(device, &mut pass, objects);
        self.record_copies(device, &mut pass, objects);
    }

    fn record_prepare(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.entity_count();
        let set = &self.sets[self.active];
        let params = uniform_params(device, &EgressParams::new(count));
        KernelDispatch::new(device, pass, &self.prepare)
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
                    (objects.entities.buffer(), 7),
                    (objects.entity_model_ids.buffer(), 8),
                    (self.counters.buffer(), 9),
                    (self.slots2.buffer(), 10),
                    (self.slots4.buffer(), 11),
                    (self.marks.buffer(), 12),
                    (set.broken_models.buffer(), 13),
                    (set.broken_positions.buffer(), 14),
                    (set.collected_models.buffer(), 15),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    fn record_copies(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.entity_count();
        let dst = &self.sets[self.active].objects;
        let groups = count.div_ceil(WORKGROUP_SIZE);
        let params = uniform_params(device, &EgressParams::new(count));

        KernelDispatch::new(device, pass, &self.copy_points)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots2.buffer(), 2),
                    (self.slots4.buffer(), 3),
                    (objects.entity_hull_tables.buffer(), 4),
                    (objects.hull_point_tables.buffer(), 5),
                    (objects.hull_bone_tables.buffer(), 6),
                    (objects.points.buffer(), 7),
                    (objects.point_flags.buffer(), 8),
                    (objects.point_hits.buffer(), 9),
                    (objects.point_bone_tables.buffer(), 10),
                    (dst.points.buffer(), 11),
                    (dst.point_hulls.buffer(), 12),
                    (dst.point_flags.buffer(), 13),
                    (dst.point_hits.buffer(), 14),
                    (dst.point_bone_tables.buffer(), 15),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_edges)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots2.buffer(), 2),
                    (self.slots4.buffer(), 3),
                    (objects.entity_hull_tables.buffer(), 4),
                    (objects.hull_edge_tables.buffer(), 5),
                    (objects.hull_point_tables.buffer(), 6),
                    (objects.edges.buffer(), 7),
                    (objects.edge_lengths.buffer(), 8),
                    (objects.edge_flags.buffer(), 9),
                    (objects.edge_pins.buffer(), 10),
                    (dst.edges.buffer(), 11),
                    (dst.edge_lengths.buffer(), 12),
                    (dst.edge_flags.buffer(), 13),
                    (dst.edge_pins.buffer(), 14),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_hull_poses)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots4.buffer(), 3),
                    (objects.entity_hull_tables.buffer(), 4),
                    (objects.hulls.buffer(), 8),
                    (objects.hull_scale_rots.buffer(), 9),
                    (objects.hull_flags.buffer(), 10),
                    (objects.hull_materials.buffer(), 11),
                    (objects.hull_integrities.buffer(), 12),
                    (dst.hulls.buffer(), 13),
                    (dst.hull_scale_rots.buffer(), 14),
                    (dst.hull_flags.buffer(), 15),
                    (dst.hull_materials.buffer(), 16),
                    (dst.hull_integrities.buffer(), 17),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_hull_tables)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots2.buffer(), 2),
                    (self.slots4.buffer(), 3),
                    (objects.entity_hull_tables.buffer(), 4),
                    (objects.hull_point_tables.buffer(), 5),
                    (objects.hull_edge_tables.buffer(), 6),
                    (objects.hull_bone_tables.buffer(), 7),
                    (dst.hull_entity_ids.buffer(), 18),
                    (dst.hull_point_tables.buffer(), 19),
                    (dst.hull_edge_tables.buffer(), 20),
                    (dst.hull_bone_tables.buffer(), 21),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_entity_poses)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots4.buffer(), 2),
                    (objects.entities.buffer(), 3),
                    (objects.entity_masses.buffer(), 4),
                    (objects.entity_accels.buffer(), 5),
                    (objects.entity_flags.buffer(), 6),
                    (objects.entity_model_ids.buffer(), 7),
                    (dst.entities.buffer(), 8),
                    (dst.entity_masses.buffer(), 9),
                    (dst.entity_accels.buffer(), 10),
                    (dst.entity_flags.buffer(), 11),
                    (dst.entity_model_ids.buffer(), 12),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_entity_tables)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots4.buffer(), 2),
                    (objects.entity_root_hulls.buffer(), 13),
                    (objects.entity_hull_tables.buffer(), 14),
                    (objects.entity_bone_tables.buffer(), 15),
                    (dst.entity_root_hulls.buffer(), 16),
                    (dst.entity_hull_tables.buffer(), 17),
                    (dst.entity_bone_tables.buffer(), 18),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_hull_bones)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots2.buffer(), 2),
                    (objects.entity_hull_tables.buffer(), 4),
                    (objects.hull_bone_tables.buffer(), 5),
                    (objects.hull_bones.buffer(), 7),
                    (objects.hull_bone_bind_poses.buffer(), 8),
                    (dst.hull_bones.buffer(), 12),
                    (dst.hull_bone_bind_poses.buffer(), 13),
                ],
            )
            .dispatch(groups);

        KernelDispatch::new(device, pass, &self.copy_entity_bones)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.marks.buffer(), 1),
                    (self.slots4.buffer(), 3),
                    (objects.entity_bone_tables.buffer(), 6),
                    (objects.entity_bones.buffer(), 9),
                    (objects.entity_bone_refs.buffer(), 10),
                    (objects.entity_bone_parents.buffer(), 11),
                    (dst.entity_bones.buffer(), 14),
                    (dst.entity_bone_refs.buffer(), 15),
                    (dst.entity_bone_parents.buffer(), 16),
                ],
            )
            .dispatch(groups);
    }

    /// Reads the extraction counters back and publishes the active set's
    /// lengths from them.
    fn apply_counts(&mut self, device: &Device, queue: &Queue) -> Result<(), SimError> {
        let counts = self.counters.read(device, queue)?;
        let rows = RowCounts {
            points: counts[CTR_POINTS],
            edges: counts[CTR_EDGES],
            hulls: counts[CTR_HULLS],
            entities: counts[CTR_ENTITIES],
            hull_bones: counts[CTR_HULL_BONES],
            entity_bones: counts[CTR_ENTITY_BONES],
        };
        let set = &mut self.sets[self.active];
        set.objects.set_row_counts(&rows);
        set.broken_models.set_len(counts[CTR_BROKEN]);
        set.broken_positions.set_len(counts[CTR_BROKEN]);
        set.collected_models.set_len(counts[CTR_COLLECTED]);
        set.pending =
            rows.entities > 0 || counts[CTR_BROKEN] > 0 || counts[CTR_COLLECTED] > 0;
        if set.pending {
            log::debug!(
                "egress: {} entities out, {} broken, {} collected",
                rows.entities,
                counts[CTR_BROKEN],
                counts[CTR_COLLECTED],
            );
        }
        Ok(())
    }

    fn take_output(
        &mut self,
        device: &Device,
        queue: &Queue,
        index: usize,
    ) -> Result<Option<EgressOutput>, SimError> {
        let set = &mut self.sets[index];
        if !set.pending {
            return Ok(None);
        }
        let batch = set.objects.read_all(device, queue)?;
        let models = set.broken_models.read(device, queue)?;
        let positions = set.broken_positions.read(device, queue)?;
        let broken = models
            .iter()
            .zip(&positions)
            .map(|(model, pos)| Debris {
                model_id: *model,
                position: *pos,
            })
            .collect();
        let collected = set.collected_models.read(device, queue)?;
        set.pending = false;
        Ok(Some(EgressOutput {
            batch,
            broken,
            collected,
        }))
    }

    /// Runs one egress cycle and returns the previous cycle's extraction,
    /// if any. The set written now is drained on the next call.
    pub fn run(
        &mut self,
        device: &Device,
        queue: &Queue,
        objects: &GpuObjectSet,
    ) -> Result<Option<EgressOutput>, SimError> {
        if objects.entity_count() > 0 {
            self.reserve(device, queue, objects)?;
            let mut encoder = device.create_command_encoder(&Default::default());
            self.record(device, &mut encoder, objects);
            queue.submit(Some(encoder.finish()));
            self.apply_counts(device, queue)?;
        }
        let output = self.take_output(device, queue, 1 - self.active)?;
        self.active ^= 1;
        Ok(output)
    }

    /// Drains whatever extractions are still buffered, oldest first. Called
    /// at shutdown so departures recorded on the final frames are not lost.
    pub fn drain_remaining(
        &mut self,
        device: &Device,
        queue: &Queue,
    ) -> Result<Vec<EgressOutput>, SimError> {
        let mut outputs = Vec::new();
        for index in [1 - self.active, self.active] {
            if let Some(output) = self.take_output(device, queue, index)? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod test {
    use nalgebra::point;

    use crate::compact::WgCompact;
    use crate::gpu::GpuInstance;
    use crate::objects::{
        entity_flags, hull_flags, GpuObjectSet, InitialCapacity, ObjectBatch, EMPTY_POINT_BONE_TABLE,
        EMPTY_TABLE,
    };
    use crate::shapes;

    use super::{Debris, WgEgress};

    async fn setup(batch: ObjectBatch) -> Option<(GpuInstance, GpuObjectSet, WgEgress)> {
        let Ok(gpu) = GpuInstance::new().await else {
            return None;
        };
        let mut objects = GpuObjectSet::new(gpu.device(), &InitialCapacity::small());
        objects
            .merge_batch(gpu.device(), gpu.queue(), &batch)
            .unwrap();
        let egress = WgEgress::new(gpu.device());
        Some((gpu, objects, egress))
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn sector_out_entities_are_extracted() {
        let mut batch = ObjectBatch::new();
        shapes::block(&mut batch, point![0.0, 0.0], 2.0, 1.0, 0.5, 0.0, 1);
        let leaver = shapes::block(&mut batch, point![100.0, 50.0], 2.0, 1.0, 0.5, 0.0, 2);
        let Some((gpu, mut objects, mut egress)) = setup(batch).await else {
            return;
        };
        let device = gpu.device();
        objects.write_entity_flags(gpu.queue(), leaver, entity_flags::SECTOR_OUT);

        assert!(egress.run(device, gpu.queue(), &objects).unwrap().is_none());
        let output = egress
            .run(device, gpu.queue(), &objects)
            .unwrap()
            .expect("extraction surfaces on the second cycle");

        output.batch.validate().unwrap();
        assert_eq!(output.batch.entities.len(), 1);
        assert_eq!(output.batch.entity_model_ids, vec![2]);
        assert_eq!(output.batch.points.len(), 4);
        assert_eq!(output.batch.edges.len(), 6);
        assert_eq!(output.batch.hull_point_tables, vec![[0, 3]]);
        assert_eq!(output.batch.entity_hull_tables, vec![[0, 0]]);
        assert_eq!(output.batch.entity_flags, vec![0]);
        assert!((output.batch.entities[0][0] - 100.0).abs() < 1.0e-6);
        assert!((output.batch.points[0][0] - 99.0).abs() < 1.0e-6);
        assert!(output.broken.is_empty());
        assert!(output.collected.is_empty());

        // The source copy is flagged deleted and compaction reclaims it.
        let flags = objects.entity_flags.read(device, gpu.queue()).unwrap();
        assert_ne!(flags[leaver.0 as usize] & entity_flags::DELETED, 0);
        let mut compact = WgCompact::new(device);
        compact.run(device, gpu.queue(), &mut objects).unwrap();
        assert_eq!(objects.entity_count(), 1);

        // The drained batch merges back into a world unchanged.
        objects
            .merge_batch(device, gpu.queue(), &output.batch)
            .unwrap();
        assert_eq!(objects.entity_count(), 2);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn broken_entities_become_debris() {
        let mut batch = ObjectBatch::new();
        let breaks = shapes::block(&mut batch, point![-5.0, 3.0], 2.0, 1.0, 0.5, 0.0, 42);
        shapes::block(&mut batch, point![5.0, 0.0], 2.0, 1.0, 0.5, 0.0, 1);
        let Some((gpu, objects, mut egress)) = setup(batch).await else {
            return;
        };
        objects.write_entity_flags(gpu.queue(), breaks, entity_flags::BROKEN);

        assert!(egress
            .run(gpu.device(), gpu.queue(), &objects)
            .unwrap()
            .is_none());
        let output = egress
            .run(gpu.device(), gpu.queue(), &objects)
            .unwrap()
            .unwrap();

        assert!(output.batch.is_empty());
        assert_eq!(
            output.broken,
            vec![Debris {
                model_id: 42,
                position: [-5.0, 3.0],
            }]
        );
        assert!(output.collected.is_empty());
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn collected_entities_report_their_models() {
        let mut batch = ObjectBatch::new();
        let coin = shapes::particle(&mut batch, point![1.0, 1.0], 0.5, 0.1, 0.5, 0.0, 5);
        let gem = shapes::particle(&mut batch, point![2.0, 1.0], 0.5, 0.1, 0.5, 0.0, 6);
        let Some((gpu, objects, mut egress)) = setup(batch).await else {
            return;
        };
        objects.write_entity_flags(gpu.queue(), coin, entity_flags::COLLECTED);
        objects.write_entity_flags(gpu.queue(), gem, entity_flags::COLLECTED);

        egress.run(gpu.device(), gpu.queue(), &objects).unwrap();
        let output = egress
            .run(gpu.device(), gpu.queue(), &objects)
            .unwrap()
            .unwrap();

        assert!(output.batch.is_empty());
        assert!(output.broken.is_empty());
        let mut collected = output.collected;
        collected.sort_unstable();
        assert_eq!(collected, vec![5, 6]);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn breakage_beats_sector_departure() {
        let mut batch = ObjectBatch::new();
        let both = shapes::block(&mut batch, point![0.0, 0.0], 2.0, 1.0, 0.5, 0.0, 7);
        let Some((gpu, objects, mut egress)) = setup(batch).await else {
            return;
        };
        objects.write_entity_flags(
            gpu.queue(),
            both,
            entity_flags::BROKEN | entity_flags::SECTOR_OUT,
        );

        egress.run(gpu.device(), gpu.queue(), &objects).unwrap();
        let output = egress
            .run(gpu.device(), gpu.queue(), &objects)
            .unwrap()
            .unwrap();

        assert!(output.batch.is_empty());
        assert_eq!(output.broken.len(), 1);
        assert_eq!(output.broken[0].model_id, 7);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn outputs_surface_one_cycle_later() {
        let mut batch = ObjectBatch::new();
        let first = shapes::block(&mut batch, point![0.0, 0.0], 2.0, 1.0, 0.5, 0.0, 1);
        let second = shapes::block(&mut batch, point![10.0, 0.0], 2.0, 1.0, 0.5, 0.0, 2);
        let third = shapes::block(&mut batch, point![20.0, 0.0], 2.0, 1.0, 0.5, 0.0, 3);
        let Some((gpu, objects, mut egress)) = setup(batch).await else {
            return;
        };
        let device = gpu.device();

        objects.write_entity_flags(gpu.queue(), first, entity_flags::SECTOR_OUT);
        assert!(egress.run(device, gpu.queue(), &objects).unwrap().is_none());

        objects.write_entity_flags(gpu.queue(), second, entity_flags::SECTOR_OUT);
        let one = egress.run(device, gpu.queue(), &objects).unwrap().unwrap();
        assert_eq!(one.batch.entity_model_ids, vec![1]);

        let two = egress.run(device, gpu.queue(), &objects).unwrap().unwrap();
        assert_eq!(two.batch.entity_model_ids, vec![2]);
        assert!(egress.run(device, gpu.queue(), &objects).unwrap().is_none());

        // A departure still buffered at shutdown comes out of the drain.
        objects.write_entity_flags(gpu.queue(), third, entity_flags::SECTOR_OUT);
        assert!(egress.run(device, gpu.queue(), &objects).unwrap().is_none());
        let rest = egress.drain_remaining(device, gpu.queue()).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].batch.entity_model_ids, vec![3]);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn multi_hull_entities_stay_contiguous() {
        let mut batch = ObjectBatch::new();
        shapes::block(&mut batch, point![-20.0, 0.0], 2.0, 1.0, 0.5, 0.0, 1);

        // A two-circle compound body sharing one entity.
        let entity = batch.next_entity();
        let h0 = batch.next_hull();
        let p0 = batch.create_point([0.0, 0.0, 0.0, 0.0], h0, 0, EMPTY_POINT_BONE_TABLE);
        let h0 = batch.create_hull(
            [0.0, 0.0],
            [2.0, 1.0],
            [0.0, 0.0],
            [p0.into(), p0.into()],
            EMPTY_TABLE,
            EMPTY_TABLE,
            hull_flags::IS_CIRCLE | hull_flags::NO_BONES,
            entity,
            0.5,
            0.0,
        );
        let h1 = batch.next_hull();
        let p1 = batch.create_point([3.0, 0.0, 3.0, 0.0], h1, 0, EMPTY_POINT_BONE_TABLE);
        let h1 = batch.create_hull(
            [3.0, 0.0],
            [2.0, 1.0],
            [0.0, 0.0],
            [p1.into(), p1.into()],
            EMPTY_TABLE,
            EMPTY_TABLE,
            hull_flags::IS_CIRCLE | hull_flags::NO_BONES,
            entity,
            0.5,
            0.0,
        );
        let compound = batch.create_entity(
            [0.0, 0.0],
            h0,
            [h0.into(), h1.into()],
            EMPTY_TABLE,
            2.0,
            9,
            0,
        );
        batch.validate().unwrap();

        let Some((gpu, objects, mut egress)) = setup(batch).await else {
            return;
        };
        objects.write_entity_flags(gpu.queue(), compound, entity_flags::SECTOR_OUT);

        egress.run(gpu.device(), gpu.queue(), &objects).unwrap();
        let output = egress
            .run(gpu.device(), gpu.queue(), &objects)
            .unwrap()
            .unwrap();

        output.batch.validate().unwrap();
        assert_eq!(output.batch.hulls.len(), 2);
        assert_eq!(output.batch.points.len(), 2);
        assert_eq!(output.batch.point_hulls, vec![0, 1]);
        assert_eq!(output.batch.hull_point_tables, vec![[0, 0], [1, 1]]);
        assert_eq!(output.batch.entity_hull_tables, vec![[0, 1]]);
        assert_eq!(output.batch.entity_root_hulls, vec![0]);
        assert!((output.batch.points[1][0] - 3.0).abs() < 1.0e-6);
    }
}
