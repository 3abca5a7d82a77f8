//! The simulation pipeline orchestrating one tick of the world.
//!
//! A tick is a fixed sequence: integrate, rebuild the broad-phase hash,
//! narrow-phase contacts, reaction application, edge relaxation and the
//! hull/entity position re-derives. The sequence is recorded as five ordered
//! submissions; the splits sit where the host must read a device-computed
//! total back to size the next phase's buffers (key bank length, match
//! capacity, match count) or fence a phase for its timing (reaction total,
//! the solve wait).
//!
//! Frame-end maintenance (egress extraction, compaction of deleted rows, the
//! render mirror refresh) runs once per frame, after the sub-ticks, through
//! [`PhysicsPipeline::end_frame`].

use web_time::Instant;
use wgpu::{Device, Queue};

use crate::broad_phase::WgBroadPhase;
use crate::compact::{CompactionTotals, WgCompact};
use crate::config::SimConfig;
use crate::diagnostics::RunStats;
use crate::egress::{EgressOutput, WgEgress};
use crate::error::SimError;
use crate::gpu::CommandEncoderExt;
use crate::grid::UniformGrid;
use crate::integrate::WgIntegrator;
use crate::mirror::RenderMirror;
use crate::narrow_phase::WgNarrowPhase;
use crate::objects::{BatchPlacement, GpuObjectSet, InitialCapacity, ObjectBatch};
use crate::scan::WgScan;

/// Results of the per-frame maintenance pass.
#[derive(Debug, Default)]
pub struct FrameEnd {
    /// Entities extracted two cycles ago, ready for the sector collaborator.
    pub egress: Option<EgressOutput>,
    /// Rows reclaimed by compaction this frame.
    pub compacted: CompactionTotals,
    /// Timings of the egress and compaction passes.
    pub stats: RunStats,
}

/// The engines and device population of one world partition.
pub struct PhysicsPipeline {
    config: SimConfig,
    objects: GpuObjectSet,
    scan: WgScan,
    broad_phase: WgBroadPhase,
    narrow_phase: WgNarrowPhase,
    integrator: WgIntegrator,
    compact: WgCompact,
    egress: WgEgress,
    mirror: RenderMirror,
}

impl PhysicsPipeline {
    pub fn new(device: &Device, config: SimConfig) -> Self {
        Self::with_capacity(device, config, &InitialCapacity::default())
    }

    pub fn with_capacity(
        device: &Device,
        config: SimConfig,
        capacity: &InitialCapacity,
    ) -> Self {
        Self {
            objects: GpuObjectSet::new(device, capacity),
            scan: WgScan::new(device),
            broad_phase: WgBroadPhase::new(device, UniformGrid::new(config.grid)),
            narrow_phase: WgNarrowPhase::new(device),
            integrator: WgIntegrator::new(device),
            compact: WgCompact::new(device),
            egress: WgEgress::new(device),
            mirror: RenderMirror::new(device),
            config,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// The live device population.
    pub fn objects(&self) -> &GpuObjectSet {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut GpuObjectSet {
        &mut self.objects
    }

    /// The read-only snapshot refreshed by [`Self::end_frame`].
    pub fn mirror(&self) -> &RenderMirror {
        &self.mirror
    }

    /// Stages a new population into the world. The sanctioned ingress path:
    /// rows append at the live tails after capacity is ensured.
    pub fn merge_batch(
        &mut self,
        device: &Device,
        queue: &Queue,
        batch: &ObjectBatch,
    ) -> Result<BatchPlacement, SimError> {
        self.objects.merge_batch(device, queue, batch)
    }

    /// Advances the world by one sub-tick of `dt` seconds.
    pub fn step(&mut self, device: &Device, queue: &Queue, dt: f32) -> Result<RunStats, SimError> {
        let mut stats = RunStats::default();
        let cycle_start = Instant::now();

        self.objects.ensure_frame_capacity(device, queue)?;
        self.broad_phase
            .reserve_frame(device, queue, self.objects.hull_count())?;

        // Integration and the first broad-phase stage share a submission;
        // the AABB kernel reads positions the integrator just wrote, and
        // within one queue the passes execute in recording order.
        let integrate_start = Instant::now();
        let mut encoder = device.create_command_encoder(&Default::default());
        self.broad_phase.clear_frame_state(&mut encoder);
        {
            let mut pass = encoder.compute_pass("integrate");
            self.integrator
                .integrate(device, &mut pass, &self.objects, &self.config, dt);
        }
        {
            let mut pass = encoder.compute_pass("broad aabb");
            self.broad_phase.update_aabbs(device, &mut pass, &self.objects);
            self.broad_phase
                .scan_key_counts(device, &self.scan, &mut pass, &self.objects);
            self.broad_phase
                .locate_in_bounds(device, &mut pass, &self.objects);
        }
        self.broad_phase.stage_bank_total(&mut encoder);
        queue.submit(Some(encoder.finish()));
        stats.integrate = integrate_start.elapsed();

        let broad_start = Instant::now();
        let (in_bounds, bank_size) = self.broad_phase.read_bank_totals(device, queue)?;
        self.broad_phase
            .reserve_bank(device, queue, bank_size, in_bounds)?;

        let mut encoder = device.create_command_encoder(&Default::default());
        self.broad_phase.clear_cell_directory(&mut encoder);
        {
            let mut pass = encoder.compute_pass("broad bank");
            self.broad_phase.build_bank(device, &mut pass, &self.objects);
            self.broad_phase
                .scan_cell_counts(device, &self.scan, &mut pass);
            self.broad_phase.build_map(device, &mut pass, &self.objects);
            self.broad_phase
                .count_candidates(device, &mut pass, &self.objects);
            self.broad_phase
                .scan_candidate_counts(device, &self.scan, &mut pass);
        }
        self.broad_phase.stage_match_capacity(&mut encoder);
        queue.submit(Some(encoder.finish()));

        let capacity = self.broad_phase.read_match_capacity(device, queue)?;
        self.broad_phase.reserve_matches(device, queue, capacity)?;

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("broad collide");
            self.broad_phase.collide(device, &mut pass, &self.objects);
        }
        queue.submit(Some(encoder.finish()));

        let candidate_count = self.broad_phase.read_match_count(device, queue)?;
        self.broad_phase
            .reserve_candidates(device, queue, candidate_count)?;
        stats.aabb_collide = broad_start.elapsed();
        stats.candidate_pairs = candidate_count;

        self.narrow_phase
            .reserve(device, queue, candidate_count, self.objects.point_count())?;

        // Candidate finalization, the narrow phase and reaction binning run
        // in one submission; the reaction-total readback doubles as its
        // fence, so the timing covers the device work.
        let narrow_start = Instant::now();
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("broad finalize");
            self.broad_phase.finalize(device, &mut pass);
        }
        self.objects.point_reaction_counts.clear(&mut encoder);
        {
            let mut pass = encoder.compute_pass("narrow collide");
            self.narrow_phase.collide(
                device,
                &mut pass,
                &self.objects,
                self.broad_phase.candidates(),
                &self.config,
            );
            self.narrow_phase
                .scan_reaction_counts(device, &self.scan, &mut pass, &self.objects);
        }
        self.objects.point_reaction_counts.clear(&mut encoder);
        {
            let mut pass = encoder.compute_pass("narrow apply");
            self.narrow_phase.sort(device, &mut pass, &self.objects);
            self.narrow_phase.apply(device, &mut pass, &self.objects);
        }
        queue.submit(Some(encoder.finish()));

        stats.reactions = self.narrow_phase.reaction_total(device, queue)?;
        stats.sat_collide = narrow_start.elapsed();

        let solve_start = Instant::now();
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("solve");
            self.integrator
                .resolve_constraints(device, &mut pass, &self.objects, &self.config, 1);
            self.integrator.move_hulls(device, &mut pass, &self.objects);
            self.integrator
                .move_entities(device, &mut pass, &self.objects, &self.config);
            self.integrator.resolve_constraints(
                device,
                &mut pass,
                &self.objects,
                &self.config,
                self.config.edge_steps,
            );
        }
        queue.submit(Some(encoder.finish()));
        let _ = device.poll(wgpu::PollType::Wait);
        stats.resolve_constraints = solve_start.elapsed();
        stats.cycle = cycle_start.elapsed();
        Ok(stats)
    }

    /// Runs the per-frame maintenance pass: departure extraction, compaction
    /// of everything flagged deleted, the render mirror refresh and the
    /// acceleration reset.
    pub fn end_frame(&mut self, device: &Device, queue: &Queue) -> Result<FrameEnd, SimError> {
        let mut out = FrameEnd::default();
        let cycle_start = Instant::now();

        let egress_start = Instant::now();
        out.egress = self.egress.run(device, queue, &self.objects)?;
        out.stats.egress = egress_start.elapsed();

        let compact_start = Instant::now();
        out.compacted = self.compact.run(device, queue, &mut self.objects)?;
        out.stats.compact = compact_start.elapsed();

        self.mirror.refresh(device, queue, &self.objects)?;

        // Accelerations are per-frame impulses from gameplay; a fresh frame
        // starts from gravity alone.
        let mut encoder = device.create_command_encoder(&Default::default());
        self.objects.entity_accels.clear(&mut encoder);
        queue.submit(Some(encoder.finish()));

        out.stats.cycle = cycle_start.elapsed();
        Ok(out)
    }

    /// Extractions still buffered in the egress sets. Call at shutdown,
    /// after the last frame, so no departure is lost.
    pub fn drain_egress(
        &mut self,
        device: &Device,
        queue: &Queue,
    ) -> Result<Vec<EgressOutput>, SimError> {
        self.egress.drain_remaining(device, queue)
    }
}
