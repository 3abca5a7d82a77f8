//! SAT narrow phase and reaction pipeline.
//!
//! Each candidate pair owns three fixed slots in the reaction buffer, so the
//! collide pass needs no allocation cursor and the host can size the buffer
//! before recording. Reactions are then binned per point with a count scan
//! and a scatter, and the apply pass folds the mean of each point's bin into
//! its verlet state.

use bytemuck::{Pod, Zeroable};
use wgpu::{ComputePass, ComputePipeline, Device, Queue};

use crate::buffers::{uniform_params, GpuBuffer, GrowthPolicy};
use crate::config::SimConfig;
use crate::error::SimError;
use crate::kernel::{compute_pipeline, KernelDispatch, WORKGROUP_SIZE};
use crate::objects::GpuObjectSet;
use crate::scan::{ScanWorkspace, WgScan};

const SAT_SRC: &str = include_str!("sat.wgsl");
const REACTIONS_SRC: &str = include_str!("reactions.wgsl");

/// Reaction slots reserved per candidate pair: a primary contact point plus
/// the two endpoints of the opposing edge.
pub const REACTIONS_PER_CANDIDATE: u32 = 3;

/// A single collision response targeting one point.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Reaction {
    /// Target point index, or `-1` for an unused slot.
    pub point: i32,
    pub pad: u32,
    pub pos_delta: [f32; 2],
    pub prev_delta: [f32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SatParams {
    count: u32,
    deep_threshold: f32,
    pad0: u32,
    pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SortParams {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

/// Narrow phase engine: SAT contact tests plus the per-point reaction
/// sort-and-average pipeline.
pub struct WgNarrowPhase {
    sat_collide: ComputePipeline,
    sort_reactions: ComputePipeline,
    apply_reactions: ComputePipeline,
    reactions_in: GpuBuffer<Reaction>,
    reactions_out: GpuBuffer<Reaction>,
    reaction_scan: ScanWorkspace,
}

impl WgNarrowPhase {
    pub fn new(device: &Device) -> Self {
        Self {
            sat_collide: compute_pipeline(device, "sat_collide", SAT_SRC, "sat_collide"),
            sort_reactions: compute_pipeline(
                device,
                "sort_reactions",
                REACTIONS_SRC,
                "sort_reactions",
            ),
            apply_reactions: compute_pipeline(
                device,
                "apply_reactions",
                REACTIONS_SRC,
                "apply_reactions",
            ),
            reactions_in: GpuBuffer::storage(device, "reactions_in", 1, GrowthPolicy::Transient),
            reactions_out: GpuBuffer::storage(device, "reactions_out", 1, GrowthPolicy::Transient),
            reaction_scan: ScanWorkspace::new(),
        }
    }

    /// Sizes the reaction buffers for a tick's candidate count.
    pub fn reserve(
        &mut self,
        device: &Device,
        queue: &Queue,
        candidate_count: u32,
        point_count: u32,
    ) -> Result<(), SimError> {
        let slots = candidate_count as u64 * REACTIONS_PER_CANDIDATE as u64;
        self.reactions_in.ensure_capacity(device, queue, slots)?;
        self.reactions_in.set_len(slots as u32);
        self.reactions_out.ensure_capacity(device, queue, slots)?;
        self.reaction_scan.reserve(device, queue, point_count)
    }

    /// Runs the SAT test over the candidate pairs and fills the slot-reserved
    /// reaction buffer. `point_reaction_counts` must be zeroed beforehand.
    pub fn collide(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
        candidates: &GpuBuffer<[i32; 2]>,
        config: &SimConfig,
    ) {
        let count = candidates.len();
        if count == 0 {
            return;
        }
        let params = uniform_params(
            device,
            &SatParams {
                count,
                deep_threshold: config.deep_contact_threshold,
                pad0: 0,
                pad1: 0,
            },
        );
        KernelDispatch::new(device, pass, &self.sat_collide)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (candidates.buffer(), 1),
                    (objects.points.buffer(), 2),
                    (objects.hull_point_tables.buffer(), 3),
                    (objects.hull_edge_tables.buffer(), 4),
                    (objects.edges.buffer(), 5),
                    (objects.edge_flags.buffer(), 6),
                    (objects.hull_flags.buffer(), 7),
                    (objects.hull_scale_rots.buffer(), 8),
                    (objects.hull_entity_ids.buffer(), 9),
                    (objects.entity_masses.buffer(), 10),
                    (objects.entity_flags.buffer(), 11),
                    (objects.hull_materials.buffer(), 12),
                    (objects.hull_integrities.buffer(), 13),
                    (self.reactions_in.buffer(), 14),
                    (objects.point_reaction_counts.buffer(), 15),
                    (objects.point_hits.buffer(), 16),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Scans the per-point reaction counts into slice offsets.
    pub fn scan_reaction_counts(
        &mut self,
        device: &Device,
        scan: &WgScan,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
    ) {
        scan.scan_out(
            device,
            pass,
            &mut self.reaction_scan,
            objects.point_reaction_counts.buffer(),
            objects.point_reaction_offsets.buffer(),
            objects.point_count(),
        );
    }

    /// Scatters reactions into per-point slices. `point_reaction_counts` must
    /// be zeroed again before this records; the scatter reuses it as cursor
    /// storage and leaves the counts restored.
    pub fn sort(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let slots = self.reactions_in.len();
        if slots == 0 {
            return;
        }
        let params = uniform_params(
            device,
            &SortParams {
                count: slots,
                pad0: 0,
                pad1: 0,
                pad2: 0,
            },
        );
        KernelDispatch::new(device, pass, &self.sort_reactions)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.reactions_in.buffer(), 1),
                    (objects.point_reaction_offsets.buffer(), 2),
                    (objects.point_reaction_counts.buffer(), 3),
                    (self.reactions_out.buffer(), 4),
                ],
            )
            .dispatch(slots.div_ceil(WORKGROUP_SIZE));
    }

    /// Applies the mean reaction of every contacted point.
    pub fn apply(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.point_count();
        if count == 0 || self.reactions_in.is_empty() {
            return;
        }
        let params = uniform_params(
            device,
            &SortParams {
                count,
                pad0: 0,
                pad1: 0,
                pad2: 0,
            },
        );
        KernelDispatch::new(device, pass, &self.apply_reactions)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.point_reaction_offsets.buffer(), 2),
                    (objects.point_reaction_counts.buffer(), 3),
                    (self.reactions_out.buffer(), 4),
                    (objects.points.buffer(), 5),
                    (objects.point_hits.buffer(), 6),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Total reactions emitted by the last collide pass.
    pub fn reaction_total(&self, device: &Device, queue: &Queue) -> Result<u32, SimError> {
        self.reaction_scan.read_total(device, queue)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use nalgebra::point;

    use crate::buffers::{GpuBuffer, GrowthPolicy};
    use crate::config::SimConfig;
    use crate::gpu::{CommandEncoderExt, GpuInstance};
    use crate::objects::{entity_flags, GpuObjectSet, InitialCapacity, ObjectBatch};
    use crate::scan::WgScan;
    use crate::shapes;

    use super::WgNarrowPhase;

    struct Fixture {
        gpu: GpuInstance,
        objects: GpuObjectSet,
        narrow: WgNarrowPhase,
        scan: WgScan,
        candidates: GpuBuffer<[i32; 2]>,
    }

    async fn setup(batch: ObjectBatch, pairs: &[[i32; 2]]) -> Option<Fixture> {
        let Ok(gpu) = GpuInstance::new().await else {
            return None;
        };
        let device = gpu.device();
        let mut objects = GpuObjectSet::new(device, &InitialCapacity::small());
        objects.merge_batch(device, gpu.queue(), &batch).unwrap();
        objects.ensure_frame_capacity(device, gpu.queue()).unwrap();

        let mut candidates = GpuBuffer::storage(
            device,
            "test candidates",
            pairs.len().max(1) as u64,
            GrowthPolicy::Transient,
        );
        candidates.write(gpu.queue(), 0, pairs);
        candidates.set_len(pairs.len() as u32);

        let mut narrow = WgNarrowPhase::new(device);
        narrow
            .reserve(
                device,
                gpu.queue(),
                pairs.len() as u32,
                objects.point_count(),
            )
            .unwrap();
        let scan = WgScan::new(device);
        Some(Fixture {
            gpu,
            objects,
            narrow,
            scan,
            candidates,
        })
    }

    /// Collide, bin and apply in one submission, clearing the count array
    /// around the scan exactly as the simulation step does.
    fn run_narrow_phase(fixture: &mut Fixture, config: &SimConfig) {
        let device = fixture.gpu.device();
        let mut encoder = device.create_command_encoder(&Default::default());
        fixture.objects.point_reaction_counts.clear(&mut encoder);
        {
            let mut pass = encoder.compute_pass("narrow collide");
            fixture.narrow.collide(
                device,
                &mut pass,
                &fixture.objects,
                &fixture.candidates,
                config,
            );
            fixture
                .narrow
                .scan_reaction_counts(device, &fixture.scan, &mut pass, &fixture.objects);
        }
        fixture.objects.point_reaction_counts.clear(&mut encoder);
        {
            let mut pass = encoder.compute_pass("narrow apply");
            fixture.narrow.sort(device, &mut pass, &fixture.objects);
            fixture.narrow.apply(device, &mut pass, &fixture.objects);
        }
        fixture.gpu.queue().submit(Some(encoder.finish()));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn equal_circles_split_the_correction() {
        let mut batch = ObjectBatch::new();
        shapes::particle(&mut batch, point![0.0, 0.0], 1.0, 1.0, 0.0, 0.0, 0);
        shapes::particle(&mut batch, point![1.0, 0.0], 1.0, 1.0, 0.0, 0.0, 0);
        let Some(mut fixture) = setup(batch, &[[0, 1]]).await else {
            return;
        };

        run_narrow_phase(&mut fixture, &SimConfig::default());

        // Overlap is 1.0, so each equal-mass circle backs off by 0.5.
        let points = fixture
            .objects
            .points
            .read(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_relative_eq!(points[0][0], -0.5, epsilon = 1.0e-4);
        assert_relative_eq!(points[1][0], 1.5, epsilon = 1.0e-4);
        let total = fixture
            .narrow
            .reaction_total(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_eq!(total, 2);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn static_hulls_absorb_nothing() {
        let mut batch = ObjectBatch::new();
        shapes::static_block(&mut batch, point![0.0, 0.0], 10.0, 0.5, 0.0, 0);
        shapes::block(&mut batch, point![0.0, 5.5], 2.0, 1.0, 0.5, 0.0, 0);
        let Some(mut fixture) = setup(batch, &[[0, 1]]).await else {
            return;
        };

        run_narrow_phase(&mut fixture, &SimConfig::default());

        let points = fixture
            .objects
            .points
            .read(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        // The floor's corners have not moved.
        assert_relative_eq!(points[0][1], -5.0, epsilon = 1.0e-5);
        assert_relative_eq!(points[2][1], 5.0, epsilon = 1.0e-5);
        // The block's deepest corner took the whole correction and sits on
        // the floor surface now.
        assert!(
            points[4..8].iter().any(|p| (p[1] - 5.0).abs() < 1.0e-4),
            "no block corner reached the floor surface",
        );
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn sensors_detect_without_reacting() {
        use crate::objects::hull_flags;

        let mut batch = ObjectBatch::new();
        shapes::particle_with_flags(
            &mut batch,
            point![0.0, 0.0],
            1.0,
            1.0,
            0.0,
            0.0,
            0,
            hull_flags::IS_SENSOR,
        );
        shapes::particle(&mut batch, point![1.0, 0.0], 1.0, 1.0, 0.0, 0.0, 0);
        // The third particle is out of reach of the sensor.
        shapes::particle(&mut batch, point![10.0, 0.0], 1.0, 1.0, 0.0, 0.0, 0);
        let Some(mut fixture) = setup(batch, &[[0, 1], [0, 2]]).await else {
            return;
        };

        run_narrow_phase(&mut fixture, &SimConfig::default());

        // The overlap leaves positions alone and emits no reactions.
        let points = fixture
            .objects
            .points
            .read(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_relative_eq!(points[0][0], 0.0, epsilon = 1.0e-6);
        assert_relative_eq!(points[1][0], 1.0, epsilon = 1.0e-6);
        let total = fixture
            .narrow
            .reaction_total(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_eq!(total, 0);

        // The overlap is still observable: both contacted points took a hit,
        // the out-of-reach one did not.
        let hits = fixture
            .objects
            .point_hits
            .read(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_eq!(hits, vec![1, 1, 0]);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn deep_contacts_chip_integrity_and_break_entities() {
        let mut batch = ObjectBatch::new();
        shapes::particle(&mut batch, point![0.0, 0.0], 2.0, 1.0, 0.0, 0.0, 0);
        shapes::particle(&mut batch, point![0.5, 0.0], 2.0, 1.0, 0.0, 0.0, 0);
        // Overlap 3.5 is far beyond the deep contact threshold.
        batch.hull_integrities[0] = 1;
        let Some(mut fixture) = setup(batch, &[[0, 1]]).await else {
            return;
        };

        run_narrow_phase(&mut fixture, &SimConfig::default());

        let integrities = fixture
            .objects
            .hull_integrities
            .read(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_eq!(integrities[0], 0);
        assert_eq!(integrities[1], 99);
        let flags = fixture
            .objects
            .entity_flags
            .read(fixture.gpu.device(), fixture.gpu.queue())
            .unwrap();
        assert_ne!(flags[0] & entity_flags::BROKEN, 0);
        assert_eq!(flags[1] & entity_flags::BROKEN, 0);
    }
}
