//! Spatial hash broad phase.
//!
//! Each tick rebuilds the hash from scratch: hull AABBs are binned into a
//! uniform grid, a key bank and per-cell key map are assembled from scanned
//! per-hull and per-cell populations, and AABB overlap tests over the map
//! slices produce the candidate pair buffer the narrow phase consumes.
//!
//! The phase sizes its own buffers from device-computed totals, so recording
//! is split where the host has to read a counter back: after the key count
//! scan, after the candidate count scan, and after the collide pass.

use wgpu::{CommandEncoder, ComputePass, ComputePipeline, Device, Queue};

use crate::buffers::{uniform_params, GpuBuffer, GrowthPolicy};
use crate::error::SimError;
use crate::grid::UniformGrid;
use crate::kernel::{compute_pipeline, KernelDispatch, WORKGROUP_SIZE};
use crate::objects::GpuObjectSet;
use crate::scan::{ScanWorkspace, WgScan};

const AABB_SRC: &str = include_str!("hull_aabb.wgsl");
const BANK_SRC: &str = include_str!("key_bank.wgsl");
const CANDIDATES_SRC: &str = include_str!("candidates.wgsl");

const CTR_IN_BOUNDS: u64 = 0;
const CTR_BANK_SIZE: u64 = 1;
const CTR_MATCH_CAPACITY: u64 = 2;
const CTR_MATCHES_USED: u64 = 3;
const COUNTER_SLOTS: u64 = 8;

/// Hard ceiling on broad-phase match slots. Hitting it means the simulation
/// degenerated (everything overlapping everything), not that more memory is
/// needed.
pub const MAX_MATCH_SLOTS: u32 = 100_000_000;

/// Broad phase engine: pipelines plus the frame-scoped hash structures.
pub struct WgBroadPhase {
    grid: UniformGrid,
    calculate_hull_aabbs: ComputePipeline,
    build_key_bank: ComputePipeline,
    build_key_map: ComputePipeline,
    locate_in_bounds: ComputePipeline,
    count_candidates: ComputePipeline,
    aabb_collide: ComputePipeline,
    finalize_candidates: ComputePipeline,

    counters: GpuBuffer<u32>,
    cell_counts: GpuBuffer<u32>,
    cell_offsets: GpuBuffer<u32>,
    cell_cursors: GpuBuffer<u32>,
    key_bank: GpuBuffer<i32>,
    key_map: GpuBuffer<i32>,
    in_bounds: GpuBuffer<u32>,
    candidate_counts: GpuBuffer<u32>,
    candidate_offsets: GpuBuffer<u32>,
    matches: GpuBuffer<i32>,
    matches_used: GpuBuffer<u32>,
    candidates: GpuBuffer<[i32; 2]>,

    key_scan: ScanWorkspace,
    cell_scan: ScanWorkspace,
    candidate_scan: ScanWorkspace,
}

impl WgBroadPhase {
    pub fn new(device: &Device, grid: UniformGrid) -> Self {
        use GrowthPolicy::Transient;
        let cells = grid.directory_length() as u64;
        let mut counters =
            GpuBuffer::storage(device, "broad counters", COUNTER_SLOTS, Transient);
        counters.set_len(COUNTER_SLOTS as u32);
        Self {
            grid,
            calculate_hull_aabbs: compute_pipeline(
                device,
                "calculate_hull_aabbs",
                AABB_SRC,
                "calculate_hull_aabbs",
            ),
            build_key_bank: compute_pipeline(device, "build_key_bank", BANK_SRC, "build_key_bank"),
            build_key_map: compute_pipeline(device, "build_key_map", BANK_SRC, "build_key_map"),
            locate_in_bounds: compute_pipeline(
                device,
                "locate_in_bounds",
                CANDIDATES_SRC,
                "locate_in_bounds",
            ),
            count_candidates: compute_pipeline(
                device,
                "count_candidates",
                CANDIDATES_SRC,
                "count_candidates",
            ),
            aabb_collide: compute_pipeline(device, "aabb_collide", CANDIDATES_SRC, "aabb_collide"),
            finalize_candidates: compute_pipeline(
                device,
                "finalize_candidates",
                CANDIDATES_SRC,
                "finalize_candidates",
            ),

            counters,
            cell_counts: GpuBuffer::storage(device, "cell_counts", cells, Transient),
            cell_offsets: GpuBuffer::storage(device, "cell_offsets", cells, Transient),
            cell_cursors: GpuBuffer::storage(device, "cell_cursors", cells, Transient),
            key_bank: GpuBuffer::storage(device, "key_bank", 1, Transient),
            key_map: GpuBuffer::storage(device, "key_map", 1, Transient),
            in_bounds: GpuBuffer::storage(device, "in_bounds", 1, Transient),
            candidate_counts: GpuBuffer::storage(device, "candidate_counts", 1, Transient),
            candidate_offsets: GpuBuffer::storage(device, "candidate_offsets", 1, Transient),
            matches: GpuBuffer::storage(device, "matches", 1, Transient),
            matches_used: GpuBuffer::storage(device, "matches_used", 1, Transient),
            candidates: GpuBuffer::storage(device, "candidates", 1, Transient),

            key_scan: ScanWorkspace::new(),
            cell_scan: ScanWorkspace::new(),
            candidate_scan: ScanWorkspace::new(),
        }
    }

    pub fn grid(&self) -> &UniformGrid {
        &self.grid
    }

    /// The consolidated candidate pairs of the last finalized tick.
    pub fn candidates(&self) -> &GpuBuffer<[i32; 2]> {
        &self.candidates
    }

    pub fn candidate_count(&self) -> u32 {
        self.candidates.len()
    }

    /// Grows the per-hull structures ahead of a tick.
    pub fn reserve_frame(
        &mut self,
        device: &Device,
        queue: &Queue,
        hull_count: u32,
    ) -> Result<(), SimError> {
        self.in_bounds
            .ensure_capacity(device, queue, hull_count as u64)?;
        self.key_scan.reserve(device, queue, hull_count)?;
        self.cell_scan
            .reserve(device, queue, self.grid.directory_length())?;
        Ok(())
    }

    /// Zeroes the counter block. Record before the first dispatch of a tick.
    pub fn clear_frame_state(&self, encoder: &mut CommandEncoder) {
        self.counters.clear(encoder);
    }

    /// Zeroes the cell directory. Record before [`Self::build_bank`].
    pub fn clear_cell_directory(&self, encoder: &mut CommandEncoder) {
        self.cell_counts.clear(encoder);
        self.cell_cursors.clear(encoder);
    }

    /// Rebuilds hull AABBs, cell spans and per-hull key counts.
    pub fn update_aabbs(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.hull_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.calculate_hull_aabbs)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.points.buffer(), 1),
                    (objects.hull_scale_rots.buffer(), 2),
                    (objects.hull_flags.buffer(), 3),
                    (objects.hull_point_tables.buffer(), 4),
                    (objects.hull_aabbs.buffer(), 5),
                    (objects.hull_aabb_cells.buffer(), 6),
                    (objects.hull_key_counts.buffer(), 7),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Scans per-hull key counts into bank offsets.
    pub fn scan_key_counts(
        &mut self,
        device: &Device,
        scan: &WgScan,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
    ) {
        scan.scan_out(
            device,
            pass,
            &mut self.key_scan,
            objects.hull_key_counts.buffer(),
            objects.hull_key_offsets.buffer(),
            objects.hull_count(),
        );
    }

    /// Compacts in-bounds hull indices behind the counter block cursor.
    pub fn locate_in_bounds(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.hull_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.locate_in_bounds)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.hull_flags.buffer(), 1),
                    (self.in_bounds.buffer(), 2),
                    (self.counters.buffer(), 3),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Stages the key count scan total into the counter block.
    pub fn stage_bank_total(&self, encoder: &mut CommandEncoder) {
        self.key_scan
            .copy_total_to(encoder, self.counters.buffer(), CTR_BANK_SIZE * 4);
    }

    /// Reads back `(in_bounds hulls, key bank length)`.
    pub fn read_bank_totals(&self, device: &Device, queue: &Queue) -> Result<(u32, u32), SimError> {
        let values = self.counters.read_range(device, queue, CTR_IN_BOUNDS, 2)?;
        Ok((
            values[CTR_IN_BOUNDS as usize],
            values[CTR_BANK_SIZE as usize],
        ))
    }

    /// Sizes the bank, map and per-in-bounds-hull arrays from the totals of
    /// the first phase.
    pub fn reserve_bank(
        &mut self,
        device: &Device,
        queue: &Queue,
        bank_size: u32,
        in_bounds_count: u32,
    ) -> Result<(), SimError> {
        self.key_bank
            .ensure_capacity(device, queue, bank_size as u64)?;
        self.key_map
            .ensure_capacity(device, queue, bank_size as u64)?;
        self.in_bounds.set_len(in_bounds_count);
        self.candidate_counts
            .ensure_capacity(device, queue, in_bounds_count as u64)?;
        self.candidate_offsets
            .ensure_capacity(device, queue, in_bounds_count as u64)?;
        self.matches_used
            .ensure_capacity(device, queue, in_bounds_count as u64)?;
        self.candidate_scan.reserve(device, queue, in_bounds_count)
    }

    /// Writes each hull's keys into the bank and tallies cell populations.
    pub fn build_bank(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.hull_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.build_key_bank)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.hull_aabb_cells.buffer(), 1),
                    (objects.hull_key_offsets.buffer(), 2),
                    (objects.hull_key_counts.buffer(), 3),
                    (self.key_bank.buffer(), 4),
                    (self.cell_counts.buffer(), 5),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Scans cell populations into cell offsets.
    pub fn scan_cell_counts(&mut self, device: &Device, scan: &WgScan, pass: &mut ComputePass) {
        scan.scan_out(
            device,
            pass,
            &mut self.cell_scan,
            self.cell_counts.buffer(),
            self.cell_offsets.buffer(),
            self.grid.directory_length(),
        );
    }

    /// Scatters hull ids into per-cell key map slices.
    pub fn build_map(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.hull_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.build_key_map)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.hull_key_offsets.buffer(), 2),
                    (objects.hull_key_counts.buffer(), 3),
                    (self.key_bank.buffer(), 4),
                    (self.cell_offsets.buffer(), 6),
                    (self.cell_cursors.buffer(), 7),
                    (self.key_map.buffer(), 8),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Upper-bounds match slots per in-bounds hull.
    pub fn count_candidates(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = self.in_bounds.len();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.count_candidates)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.in_bounds.buffer(), 2),
                    (objects.hull_key_counts.buffer(), 4),
                    (objects.hull_key_offsets.buffer(), 5),
                    (self.key_bank.buffer(), 6),
                    (self.cell_counts.buffer(), 7),
                    (self.candidate_counts.buffer(), 11),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Scans candidate counts into match slice offsets.
    pub fn scan_candidate_counts(&mut self, device: &Device, scan: &WgScan, pass: &mut ComputePass) {
        scan.scan_out(
            device,
            pass,
            &mut self.candidate_scan,
            self.candidate_counts.buffer(),
            self.candidate_offsets.buffer(),
            self.in_bounds.len(),
        );
    }

    /// Stages the candidate count scan total into the counter block.
    pub fn stage_match_capacity(&self, encoder: &mut CommandEncoder) {
        self.candidate_scan
            .copy_total_to(encoder, self.counters.buffer(), CTR_MATCH_CAPACITY * 4);
    }

    pub fn read_match_capacity(&self, device: &Device, queue: &Queue) -> Result<u32, SimError> {
        self.counters.read_one(device, queue, CTR_MATCH_CAPACITY)
    }

    /// Sizes the match scratch buffer, rejecting degenerate workloads.
    pub fn reserve_matches(
        &mut self,
        device: &Device,
        queue: &Queue,
        capacity: u32,
    ) -> Result<(), SimError> {
        if capacity > MAX_MATCH_SLOTS {
            return Err(SimError::invariant(format!(
                "broad phase requested {capacity} match slots (limit {MAX_MATCH_SLOTS})",
            )));
        }
        self.matches.ensure_capacity(device, queue, capacity as u64)
    }

    /// Tests AABB overlap over the key map and fills the match slices.
    pub fn collide(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = self.in_bounds.len();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.aabb_collide)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.hull_flags.buffer(), 1),
                    (self.in_bounds.buffer(), 2),
                    (self.counters.buffer(), 3),
                    (objects.hull_key_counts.buffer(), 4),
                    (objects.hull_key_offsets.buffer(), 5),
                    (self.key_bank.buffer(), 6),
                    (self.cell_counts.buffer(), 7),
                    (self.cell_offsets.buffer(), 8),
                    (self.key_map.buffer(), 9),
                    (objects.hull_aabbs.buffer(), 10),
                    (self.candidate_offsets.buffer(), 12),
                    (self.matches.buffer(), 13),
                    (self.matches_used.buffer(), 14),
                    (objects.hull_entity_ids.buffer(), 15),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    pub fn read_match_count(&self, device: &Device, queue: &Queue) -> Result<u32, SimError> {
        self.counters.read_one(device, queue, CTR_MATCHES_USED)
    }

    /// Sizes the consolidated candidate buffer.
    pub fn reserve_candidates(
        &mut self,
        device: &Device,
        queue: &Queue,
        count: u32,
    ) -> Result<(), SimError> {
        self.candidates
            .ensure_capacity(device, queue, count as u64)?;
        self.candidates.set_len(count);
        Ok(())
    }

    /// Packs used match slices into the candidate buffer.
    pub fn finalize(&self, device: &Device, pass: &mut ComputePass) {
        let count = self.in_bounds.len();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &self.grid.params(count));
        KernelDispatch::new(device, pass, &self.finalize_candidates)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (self.in_bounds.buffer(), 2),
                    (self.counters.buffer(), 3),
                    (self.candidate_offsets.buffer(), 12),
                    (self.matches.buffer(), 13),
                    (self.matches_used.buffer(), 14),
                    (self.candidates.buffer(), 16),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }
}

#[cfg(test)]
mod test {
    use nalgebra::point;
    use rand::prelude::*;

    use crate::config::GridConfig;
    use crate::gpu::{CommandEncoderExt, GpuInstance};
    use crate::grid::UniformGrid;
    use crate::objects::{hull_flags, GpuObjectSet, InitialCapacity, ObjectBatch};
    use crate::scan::WgScan;
    use crate::shapes;

    use super::WgBroadPhase;

    fn aabbs_overlap(a: &[f32; 4], b: &[f32; 4]) -> bool {
        a[0] <= b[2] && b[0] <= a[2] && a[1] <= b[3] && b[1] <= a[3]
    }

    /// Runs the full phase sequence, submitting wherever the host has to
    /// read a device total back.
    async fn run_broad_phase(
        gpu: &GpuInstance,
        phase: &mut WgBroadPhase,
        scan: &WgScan,
        objects: &mut GpuObjectSet,
    ) {
        let device = gpu.device();
        let queue = gpu.queue();

        objects.ensure_frame_capacity(device, queue).unwrap();
        phase
            .reserve_frame(device, queue, objects.hull_count())
            .unwrap();

        let mut encoder = device.create_command_encoder(&Default::default());
        phase.clear_frame_state(&mut encoder);
        {
            let mut pass = encoder.compute_pass("broad aabb");
            phase.update_aabbs(device, &mut pass, objects);
            phase.scan_key_counts(device, scan, &mut pass, objects);
            phase.locate_in_bounds(device, &mut pass, objects);
        }
        phase.stage_bank_total(&mut encoder);
        queue.submit(Some(encoder.finish()));

        let (in_bounds, bank_size) = phase.read_bank_totals(device, queue).unwrap();
        phase
            .reserve_bank(device, queue, bank_size, in_bounds)
            .unwrap();

        let mut encoder = device.create_command_encoder(&Default::default());
        phase.clear_cell_directory(&mut encoder);
        {
            let mut pass = encoder.compute_pass("broad bank");
            phase.build_bank(device, &mut pass, objects);
            phase.scan_cell_counts(device, scan, &mut pass);
            phase.build_map(device, &mut pass, objects);
            phase.count_candidates(device, &mut pass, objects);
            phase.scan_candidate_counts(device, scan, &mut pass);
        }
        phase.stage_match_capacity(&mut encoder);
        queue.submit(Some(encoder.finish()));

        let capacity = phase.read_match_capacity(device, queue).unwrap();
        phase.reserve_matches(device, queue, capacity).unwrap();

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("broad collide");
            phase.collide(device, &mut pass, objects);
        }
        queue.submit(Some(encoder.finish()));

        let used = phase.read_match_count(device, queue).unwrap();
        phase.reserve_candidates(device, queue, used).unwrap();

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("broad finalize");
            phase.finalize(device, &mut pass);
        }
        queue.submit(Some(encoder.finish()));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn candidates_match_brute_force() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let device = gpu.device();

        // A crowded random scene kept well inside the grid interior.
        let mut rng = StdRng::seed_from_u64(7);
        let mut batch = ObjectBatch::new();
        for k in 0..120 {
            let x = rng.gen_range(-40.0..40.0);
            let y = rng.gen_range(-40.0..40.0);
            let size = rng.gen_range(1.0..4.0);
            if k % 3 == 0 {
                shapes::particle(&mut batch, point![x, y], size * 0.5, 1.0, 0.5, 0.0, 0);
            } else {
                shapes::block(&mut batch, point![x, y], size, 1.0, 0.5, 0.0, 0);
            }
        }

        let mut objects = GpuObjectSet::new(device, &InitialCapacity::small());
        objects.merge_batch(device, gpu.queue(), &batch).unwrap();

        let grid = UniformGrid::new(GridConfig {
            origin: [-60.0, -60.0],
            width: 120.0,
            height: 120.0,
            x_subdivisions: 24,
            y_subdivisions: 24,
        });
        let mut phase = WgBroadPhase::new(device, grid);
        let scan = WgScan::new(device);

        run_broad_phase(&gpu, &mut phase, &scan, &mut objects).await;

        let aabbs = objects.hull_aabbs.read_range(
            device,
            gpu.queue(),
            0,
            objects.hull_count() as u64,
        )
        .unwrap();
        let entity_ids = objects.hull_entity_ids.read(device, gpu.queue()).unwrap();

        let mut expected: Vec<(i32, i32)> = Vec::new();
        for a in 0..aabbs.len() {
            for b in a + 1..aabbs.len() {
                if entity_ids[a] == entity_ids[b] {
                    continue;
                }
                if aabbs_overlap(&aabbs[a], &aabbs[b]) {
                    expected.push((a as i32, b as i32));
                }
            }
        }

        let mut got: Vec<(i32, i32)> = phase
            .candidates()
            .read(device, gpu.queue())
            .unwrap()
            .iter()
            .map(|pair| (pair[0], pair[1]))
            .collect();
        got.sort_unstable();
        expected.sort_unstable();
        assert_eq!(got, expected);
        // Every emitted pair keeps the lower index first.
        assert!(got.iter().all(|(a, b)| a < b));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn hulls_outside_the_grid_emit_nothing() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let device = gpu.device();

        let mut batch = ObjectBatch::new();
        // Two overlapping blocks inside, one far outside the grid.
        shapes::block(&mut batch, point![0.0, 0.0], 4.0, 1.0, 0.5, 0.0, 0);
        shapes::block(&mut batch, point![1.0, 1.0], 4.0, 1.0, 0.5, 0.0, 0);
        shapes::block(&mut batch, point![500.0, 500.0], 4.0, 1.0, 0.5, 0.0, 0);

        let mut objects = GpuObjectSet::new(device, &InitialCapacity::small());
        objects.merge_batch(device, gpu.queue(), &batch).unwrap();

        let grid = UniformGrid::new(GridConfig {
            origin: [-60.0, -60.0],
            width: 120.0,
            height: 120.0,
            x_subdivisions: 12,
            y_subdivisions: 12,
        });
        let mut phase = WgBroadPhase::new(device, grid);
        let scan = WgScan::new(device);

        run_broad_phase(&gpu, &mut phase, &scan, &mut objects).await;

        let pairs = phase.candidates().read(device, gpu.queue()).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0], [0, 1]);

        let flags = objects.hull_flags.read(device, gpu.queue()).unwrap();
        assert_eq!(flags[2] & hull_flags::OUT_OF_BOUNDS, hull_flags::OUT_OF_BOUNDS);
        assert_eq!(flags[0] & hull_flags::OUT_OF_BOUNDS, 0);
    }
}
