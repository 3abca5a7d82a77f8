use bytemuck::{Pod, Zeroable};
use wgpu::{ComputePass, ComputePipeline, Device};

use crate::buffers::uniform_params;
use crate::config::SimConfig;
use crate::kernel::{compute_pipeline, KernelDispatch, WORKGROUP_SIZE};
use crate::objects::GpuObjectSet;

const SRC: &str = include_str!("integrate.wgsl");

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SolverParams {
    gravity: [f32; 2],
    bounds_min: [f32; 2],
    bounds_max: [f32; 2],
    dt: f32,
    damping: f32,
    count: u32,
    process_all: u32,
    pad: [u32; 2],
}

impl SolverParams {
    fn new(config: &SimConfig, dt: f32, count: u32, process_all: bool) -> Self {
        Self {
            gravity: config.gravity,
            bounds_min: config.bounds.min,
            bounds_max: config.bounds.max,
            dt,
            damping: config.damping,
            count,
            process_all: process_all as u32,
            pad: [0; 2],
        }
    }
}

/// Verlet integrator and distance-constraint solver.
///
/// The solver never moves a point shared between hulls because hulls do not
/// share points; iterating edges per hull is therefore race free even though
/// every hull relaxes in parallel.
pub struct WgIntegrator {
    integrate: ComputePipeline,
    resolve_constraints: ComputePipeline,
    move_hulls: ComputePipeline,
    move_entities: ComputePipeline,
}

impl WgIntegrator {
    pub fn new(device: &Device) -> Self {
        Self {
            integrate: compute_pipeline(device, "integrate", SRC, "integrate"),
            resolve_constraints: compute_pipeline(device, "resolve_constraints", SRC, "resolve_constraints"),
            move_hulls: compute_pipeline(device, "move_hulls", SRC, "move_hulls"),
            move_entities: compute_pipeline(device, "move_entities", SRC, "move_entities"),
        }
    }

    /// Advances every non-static, non-pinned point by one damped verlet step.
    pub fn integrate(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
        config: &SimConfig,
        dt: f32,
    ) {
        let count = objects.point_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &SolverParams::new(config, dt, count, false));
        KernelDispatch::new(device, pass, &self.integrate)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.points.buffer(), 1),
                    (objects.point_flags.buffer(), 2),
                    (objects.point_hulls.buffer(), 3),
                    (objects.hull_flags.buffer(), 4),
                    (objects.hull_entity_ids.buffer(), 5),
                    (objects.entity_accels.buffer(), 6),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Runs `steps` relaxation passes over every hull's edge constraints.
    /// Interior bracing edges only participate in the final pass.
    pub fn resolve_constraints(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
        config: &SimConfig,
        steps: u32,
    ) {
        let count = objects.hull_count();
        if count == 0 {
            return;
        }
        for step in 0..steps {
            let process_all = step + 1 == steps;
            let params = uniform_params(device, &SolverParams::new(config, 0.0, count, process_all));
            KernelDispatch::new(device, pass, &self.resolve_constraints)
                .bind_at(
                    0,
                    [
                        (&params, 0),
                        (objects.points.buffer(), 1),
                        (objects.point_flags.buffer(), 2),
                        (objects.hull_flags.buffer(), 4),
                        (objects.edges.buffer(), 7),
                        (objects.edge_lengths.buffer(), 8),
                        (objects.edge_flags.buffer(), 9),
                        (objects.edge_pins.buffer(), 10),
                        (objects.hull_edge_tables.buffer(), 13),
                    ],
                )
                .dispatch(count.div_ceil(WORKGROUP_SIZE));
        }
    }

    /// Re-centers hull transforms on the mean of their points.
    pub fn move_hulls(&self, device: &Device, pass: &mut ComputePass, objects: &GpuObjectSet) {
        let count = objects.hull_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(
            device,
            &SolverParams::new(&SimConfig::default(), 0.0, count, false),
        );
        KernelDispatch::new(device, pass, &self.move_hulls)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.points.buffer(), 1),
                    (objects.hulls.buffer(), 11),
                    (objects.hull_point_tables.buffer(), 12),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }

    /// Re-derives entity positions from root hulls and flags entities that
    /// drifted outside the partition bounds.
    pub fn move_entities(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        objects: &GpuObjectSet,
        config: &SimConfig,
    ) {
        let count = objects.entity_count();
        if count == 0 {
            return;
        }
        let params = uniform_params(device, &SolverParams::new(config, 0.0, count, false));
        KernelDispatch::new(device, pass, &self.move_entities)
            .bind_at(
                0,
                [
                    (&params, 0),
                    (objects.hulls.buffer(), 11),
                    (objects.entities.buffer(), 14),
                    (objects.entity_root_hulls.buffer(), 15),
                    (objects.entity_flags.buffer(), 16),
                ],
            )
            .dispatch(count.div_ceil(WORKGROUP_SIZE));
    }
}
