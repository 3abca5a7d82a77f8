//! Parallel exclusive prefix sums.
//!
//! The scan runs as a cascade: a per-block exclusive scan that emits block
//! totals, a recursive scan of those totals, and a completion sweep that adds
//! each block's scanned base back onto its elements. `N <= 256` degenerates
//! to the single-block pass with no sweep, and `N == 0` records nothing;
//! callers never special-case either.
//!
//! The top of the cascade always holds the array's grand total in a
//! one-element stage, which the simulation phases copy into their counter
//! blocks instead of re-reducing on the host.

use bytemuck::Pod;
use wgpu::{Buffer, CommandEncoder, ComputePass, ComputePipeline, Device, Queue};

use crate::buffers::{uniform_params, GpuBuffer, GrowthPolicy};
use crate::error::SimError;
use crate::kernel::{compute_pipeline, KernelDispatch};

/// Elements scanned per workgroup.
pub const SCAN_BLOCK: u32 = 256;

#[derive(Copy, Clone, Debug, Pod, bytemuck::Zeroable)]
#[repr(C)]
struct ScanParams {
    len: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

impl ScanParams {
    fn new(len: u32) -> Self {
        Self {
            len,
            pad0: 0,
            pad1: 0,
            pad2: 0,
        }
    }
}

fn level_lens(n: u32) -> Vec<u32> {
    let mut lens = Vec::new();
    let mut cur = n;
    loop {
        cur = cur.div_ceil(SCAN_BLOCK);
        lens.push(cur);
        if cur == 1 {
            return lens;
        }
    }
}

/// Stage ladder backing a scan of up to the reserved length.
pub struct ScanWorkspace {
    stages: Vec<GpuBuffer<u32>>,
    total_stage: Option<usize>,
}

impl ScanWorkspace {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            total_stage: None,
        }
    }

    /// Ensures the ladder can scan `n` elements.
    pub fn reserve(&mut self, device: &Device, queue: &Queue, n: u32) -> Result<(), SimError> {
        if n == 0 {
            return Ok(());
        }
        let lens = level_lens(n);
        while self.stages.len() < lens.len() {
            self.stages.push(GpuBuffer::storage(
                device,
                "scan stage",
                SCAN_BLOCK as u64,
                GrowthPolicy::Transient,
            ));
        }
        for (stage, len) in self.stages.iter_mut().zip(lens.iter()) {
            stage.ensure_capacity(device, queue, *len as u64)?;
        }
        Ok(())
    }

    /// Copies the grand total of the last recorded scan into `dst`.
    ///
    /// Record this on the same encoder as the scan; `dst` must hold a `u32`
    /// at `dst_offset`. When the last scan was empty nothing is copied (the
    /// caller's counter block is expected to be zeroed).
    pub fn copy_total_to(&self, encoder: &mut CommandEncoder, dst: &Buffer, dst_offset: u64) {
        if let Some(stage) = self.total_stage {
            encoder.copy_buffer_to_buffer(self.stages[stage].buffer(), 0, dst, dst_offset, 4);
        }
    }

    /// Reads the grand total of the last recorded scan back to the host.
    pub fn read_total(&self, device: &Device, queue: &Queue) -> Result<u32, SimError> {
        match self.total_stage {
            None => Ok(0),
            Some(stage) => self.stages[stage].read_one(device, queue, 0),
        }
    }
}

impl Default for ScanWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive prefix sum over `u32` arrays.
pub struct WgScan {
    scan_block: ComputePipeline,
    scan_block_out: ComputePipeline,
    add_block_sums: ComputePipeline,
}

impl WgScan {
    pub const SRC: &'static str = include_str!("scan.wgsl");

    pub fn new(device: &Device) -> Self {
        Self {
            scan_block: compute_pipeline(device, "scan_block", Self::SRC, "scan_block"),
            scan_block_out: compute_pipeline(device, "scan_block_out", Self::SRC, "scan_block_out"),
            add_block_sums: compute_pipeline(device, "add_block_sums", Self::SRC, "add_block_sums"),
        }
    }

    /// Records an in-place exclusive scan of the first `n` elements of `data`.
    pub fn scan(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        workspace: &mut ScanWorkspace,
        data: &Buffer,
        n: u32,
    ) {
        self.scan_inner(device, pass, workspace, data, None, n);
    }

    /// Records an out-of-place exclusive scan: `src` is preserved and the
    /// scan lands in `dst`.
    pub fn scan_out(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        workspace: &mut ScanWorkspace,
        src: &Buffer,
        dst: &Buffer,
        n: u32,
    ) {
        self.scan_inner(device, pass, workspace, src, Some(dst), n);
    }

    fn scan_inner(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        workspace: &mut ScanWorkspace,
        data: &Buffer,
        dst: Option<&Buffer>,
        n: u32,
    ) {
        if n == 0 {
            workspace.total_stage = None;
            return;
        }
        let lens = level_lens(n);
        debug_assert!(workspace.stages.len() >= lens.len());

        let params = uniform_params(device, &ScanParams::new(n));
        let stage0 = workspace.stages[0].buffer();
        match dst {
            None => {
                KernelDispatch::new(device, pass, &self.scan_block)
                    .bind_at(0, [(&params, 0), (data, 1), (stage0, 2)])
                    .dispatch(lens[0]);
            }
            Some(dst) => {
                KernelDispatch::new(device, pass, &self.scan_block_out)
                    .bind_at(0, [(&params, 0), (data, 1), (stage0, 2), (dst, 3)])
                    .dispatch(lens[0]);
            }
        }

        for j in 0..lens.len() - 1 {
            let params = uniform_params(device, &ScanParams::new(lens[j]));
            KernelDispatch::new(device, pass, &self.scan_block)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (workspace.stages[j].buffer(), 1),
                        (workspace.stages[j + 1].buffer(), 2),
                    ],
                )
                .dispatch(lens[j + 1]);
        }

        for j in (0..lens.len() - 1).rev() {
            // The top stage is a raw total, not a scan; it is never swept back.
            if lens[j + 1] > 1 {
                let params = uniform_params(device, &ScanParams::new(lens[j]));
                KernelDispatch::new(device, pass, &self.add_block_sums)
                    .bind_at(
                        0,
                        [
                            (&params, 0),
                            (workspace.stages[j].buffer(), 1),
                            (workspace.stages[j + 1].buffer(), 2),
                        ],
                    )
                    .dispatch(lens[j + 1]);
            }
        }
        if lens[0] > 1 {
            let params = uniform_params(device, &ScanParams::new(n));
            let target = dst.unwrap_or(data);
            KernelDispatch::new(device, pass, &self.add_block_sums)
                .bind_at(0, [(&params, 0), (target, 1), (stage0, 2)])
                .dispatch(lens[0]);
        }
        workspace.total_stage = Some(lens.len() - 1);
    }
}

/// Reference implementation of the exclusive scan.
pub fn eval_cpu(values: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0u32;
    for v in values {
        out.push(sum);
        sum = sum.wrapping_add(*v);
    }
    out
}

/// Stage ladders for the fused vec2 + vec4 delete scan.
pub struct DeleteScanWorkspace {
    stages2: Vec<GpuBuffer<[u32; 2]>>,
    stages4: Vec<GpuBuffer<[u32; 4]>>,
    total_stage: Option<usize>,
}

impl DeleteScanWorkspace {
    pub fn new() -> Self {
        Self {
            stages2: Vec::new(),
            stages4: Vec::new(),
            total_stage: None,
        }
    }

    pub fn reserve(&mut self, device: &Device, queue: &Queue, n: u32) -> Result<(), SimError> {
        if n == 0 {
            return Ok(());
        }
        let lens = level_lens(n);
        while self.stages2.len() < lens.len() {
            self.stages2.push(GpuBuffer::storage(
                device,
                "delete scan stage2",
                SCAN_BLOCK as u64,
                GrowthPolicy::Transient,
            ));
            self.stages4.push(GpuBuffer::storage(
                device,
                "delete scan stage4",
                SCAN_BLOCK as u64,
                GrowthPolicy::Transient,
            ));
        }
        for (j, len) in lens.iter().enumerate() {
            self.stages2[j].ensure_capacity(device, queue, *len as u64)?;
            self.stages4[j].ensure_capacity(device, queue, *len as u64)?;
        }
        Ok(())
    }

    /// Reads back the six grand totals of the last recorded delete scan:
    /// `(edges, hull bones)` and `(points, hulls, entities, entity bones)`.
    pub fn read_totals(
        &self,
        device: &Device,
        queue: &Queue,
    ) -> Result<([u32; 2], [u32; 4]), SimError> {
        match self.total_stage {
            None => Ok(([0; 2], [0; 4])),
            Some(stage) => Ok((
                self.stages2[stage].read_one(device, queue, 0)?,
                self.stages4[stage].read_one(device, queue, 0)?,
            )),
        }
    }
}

impl Default for DeleteScanWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Fused exclusive scan over the per-entity delete counters: a `vec2<u32>`
/// array and a `vec4<u32>` array scanned in a single cascade.
pub struct WgDeleteScan {
    scan_block: ComputePipeline,
    scan_block_out: ComputePipeline,
    add_block_sums: ComputePipeline,
}

impl WgDeleteScan {
    pub const SRC: &'static str = include_str!("compact_scan.wgsl");

    pub fn new(device: &Device) -> Self {
        Self {
            scan_block: compute_pipeline(device, "delete_scan_block", Self::SRC, "scan_block"),
            scan_block_out: compute_pipeline(
                device,
                "delete_scan_block_out",
                Self::SRC,
                "scan_block_out",
            ),
            add_block_sums: compute_pipeline(
                device,
                "delete_add_block_sums",
                Self::SRC,
                "add_block_sums",
            ),
        }
    }

    /// Records the fused out-of-place scan of (`src2`, `src4`) into
    /// (`dst2`, `dst4`).
    #[allow(clippy::too_many_arguments)]
    pub fn scan_out(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        workspace: &mut DeleteScanWorkspace,
        src2: &Buffer,
        src4: &Buffer,
        dst2: &Buffer,
        dst4: &Buffer,
        n: u32,
    ) {
        if n == 0 {
            workspace.total_stage = None;
            return;
        }
        let lens = level_lens(n);
        debug_assert!(workspace.stages2.len() >= lens.len());

        let params = uniform_params(device, &ScanParams::new(n));
        KernelDispatch::new(device, pass, &self.scan_block_out)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (src2, 1),
                    (workspace.stages2[0].buffer(), 2),
                    (dst2, 3),
                    (src4, 4),
                    (workspace.stages4[0].buffer(), 5),
                    (dst4, 6),
                ],
            )
            .dispatch(lens[0]);

        for j in 0..lens.len() - 1 {
            let params = uniform_params(device, &ScanParams::new(lens[j]));
            KernelDispatch::new(device, pass, &self.scan_block)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (workspace.stages2[j].buffer(), 1),
                        (workspace.stages2[j + 1].buffer(), 2),
                        (workspace.stages4[j].buffer(), 4),
                        (workspace.stages4[j + 1].buffer(), 5),
                    ],
                )
                .dispatch(lens[j + 1]);
        }

        for j in (0..lens.len() - 1).rev() {
            if lens[j + 1] > 1 {
                let params = uniform_params(device, &ScanParams::new(lens[j]));
                KernelDispatch::new(device, pass, &self.add_block_sums)
                    .bind_at(
                        0,
                        [
                            (&params, 0),
                            (workspace.stages2[j].buffer(), 1),
                            (workspace.stages2[j + 1].buffer(), 2),
                            (workspace.stages4[j].buffer(), 4),
                            (workspace.stages4[j + 1].buffer(), 5),
                        ],
                    )
                    .dispatch(lens[j + 1]);
            }
        }
        if lens[0] > 1 {
            let params = uniform_params(device, &ScanParams::new(n));
            KernelDispatch::new(device, pass, &self.add_block_sums)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (dst2, 1),
                        (workspace.stages2[0].buffer(), 2),
                        (dst4, 4),
                        (workspace.stages4[0].buffer(), 5),
                    ],
                )
                .dispatch(lens[0]);
        }
        workspace.total_stage = Some(lens.len() - 1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpu::{CommandEncoderExt, GpuInstance};
    use rand::prelude::*;

    #[test]
    fn cpu_reference() {
        assert_eq!(eval_cpu(&[]), Vec::<u32>::new());
        assert_eq!(eval_cpu(&[7]), vec![0]);
        assert_eq!(eval_cpu(&[1, 2, 3, 4]), vec![0, 1, 3, 6]);
    }

    #[test]
    fn ladder_shape() {
        assert_eq!(level_lens(1), vec![1]);
        assert_eq!(level_lens(256), vec![1]);
        assert_eq!(level_lens(257), vec![2, 1]);
        assert_eq!(level_lens(65536), vec![256, 1]);
        assert_eq!(level_lens(65537), vec![257, 2, 1]);
    }

    async fn check_scan_len(gpu: &GpuInstance, scan: &WgScan, n: u32) {
        let device = gpu.device();
        let mut rng = StdRng::seed_from_u64(n as u64 + 1);
        let values: Vec<u32> = (0..n).map(|_| rng.gen_range(0..100)).collect();
        let expected = eval_cpu(&values);
        let total: u32 = values.iter().sum();

        let mut data = GpuBuffer::<u32>::storage(device, "scan in", n.max(1) as u64, GrowthPolicy::Transient);
        data.write(gpu.queue(), 0, &values);
        data.set_len(n);
        let mut out = GpuBuffer::<u32>::storage(device, "scan out", n.max(1) as u64, GrowthPolicy::Transient);
        out.set_len(n);

        let mut workspace = ScanWorkspace::new();
        workspace.reserve(device, gpu.queue(), n).unwrap();

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("scan");
            scan.scan_out(device, &mut pass, &mut workspace, data.buffer(), out.buffer(), n);
        }
        gpu.queue().submit(Some(encoder.finish()));

        assert_eq!(out.read(device, gpu.queue()).unwrap(), expected, "n = {}", n);
        // Out-of-place scans leave the source untouched.
        assert_eq!(data.read(device, gpu.queue()).unwrap(), values);
        assert_eq!(workspace.read_total(device, gpu.queue()).unwrap(), total);

        // In-place variant.
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("scan");
            scan.scan(device, &mut pass, &mut workspace, data.buffer(), n);
        }
        gpu.queue().submit(Some(encoder.finish()));
        assert_eq!(data.read(device, gpu.queue()).unwrap(), expected, "n = {}", n);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn gpu_scan_matches_reference() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let scan = WgScan::new(gpu.device());
        for n in [0u32, 1, 2, 255, 256, 257, 1024, 15071, 65537] {
            check_scan_len(&gpu, &scan, n).await;
        }
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn gpu_delete_scan_matches_reference() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let device = gpu.device();
        let scan = WgDeleteScan::new(device);
        let n = 15071u32;
        let mut rng = StdRng::seed_from_u64(42);
        let v2: Vec<[u32; 2]> = (0..n).map(|_| [rng.gen_range(0..5), rng.gen_range(0..5)]).collect();
        let v4: Vec<[u32; 4]> = (0..n)
            .map(|_| [rng.gen_range(0..5), rng.gen_range(0..5), rng.gen_range(0..5), rng.gen_range(0..5)])
            .collect();

        let mut src2 = GpuBuffer::<[u32; 2]>::storage(device, "src2", n as u64, GrowthPolicy::Transient);
        let mut src4 = GpuBuffer::<[u32; 4]>::storage(device, "src4", n as u64, GrowthPolicy::Transient);
        let mut dst2 = GpuBuffer::<[u32; 2]>::storage(device, "dst2", n as u64, GrowthPolicy::Transient);
        let mut dst4 = GpuBuffer::<[u32; 4]>::storage(device, "dst4", n as u64, GrowthPolicy::Transient);
        src2.write(gpu.queue(), 0, &v2);
        src4.write(gpu.queue(), 0, &v4);
        src2.set_len(n);
        src4.set_len(n);
        dst2.set_len(n);
        dst4.set_len(n);

        let mut workspace = DeleteScanWorkspace::new();
        workspace.reserve(device, gpu.queue(), n).unwrap();

        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.compute_pass("delete scan");
            scan.scan_out(
                device,
                &mut pass,
                &mut workspace,
                src2.buffer(),
                src4.buffer(),
                dst2.buffer(),
                dst4.buffer(),
                n,
            );
        }
        gpu.queue().submit(Some(encoder.finish()));

        let got2 = dst2.read(device, gpu.queue()).unwrap();
        let got4 = dst4.read(device, gpu.queue()).unwrap();
        for lane in 0..2 {
            let expected = eval_cpu(&v2.iter().map(|v| v[lane]).collect::<Vec<_>>());
            let got: Vec<u32> = got2.iter().map(|v| v[lane]).collect();
            assert_eq!(got, expected, "vec2 lane {}", lane);
        }
        for lane in 0..4 {
            let expected = eval_cpu(&v4.iter().map(|v| v[lane]).collect::<Vec<_>>());
            let got: Vec<u32> = got4.iter().map(|v| v[lane]).collect();
            assert_eq!(got, expected, "vec4 lane {}", lane);
        }

        let (t2, t4) = workspace.read_totals(device, gpu.queue()).unwrap();
        for lane in 0..2 {
            assert_eq!(t2[lane], v2.iter().map(|v| v[lane]).sum::<u32>());
        }
        for lane in 0..4 {
            assert_eq!(t4[lane], v4.iter().map(|v| v[lane]).sum::<u32>());
        }
    }
}
