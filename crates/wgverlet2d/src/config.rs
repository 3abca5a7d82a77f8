//! Simulation configuration.
//!
//! All tuning values are explicit and passed at construction time. Nothing in
//! the crate reads globals or environment state.

use serde::{Deserialize, Serialize};

/// Global simulation tuning values.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// World-space gravity applied to every non-static point.
    pub gravity: [f32; 2],
    /// Velocity damping applied by the verlet integrator each tick.
    pub damping: f32,
    /// Relaxation passes over the edge constraints at the end of a tick.
    pub edge_steps: u32,
    /// Seconds simulated per frame by the fixed-timestep runner.
    pub tick_rate: f32,
    /// Sub-ticks per frame. The integrator step is `tick_rate / sub_steps`.
    pub sub_steps: u32,
    /// Upper bound on sub-ticks executed per frame before time is dropped.
    pub max_sub_steps: u32,
    /// Penetration depth beyond which a contact chips hull integrity.
    pub deep_contact_threshold: f32,
    /// Rectangle an entity must stay inside to remain in this partition.
    pub bounds: WorldBounds,
    /// Broad-phase grid geometry.
    pub grid: GridConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, -98.0],
            damping: 0.990,
            edge_steps: 8,
            tick_rate: 1.0 / 24.0,
            sub_steps: 16,
            max_sub_steps: 16,
            deep_contact_threshold: 1.0,
            bounds: WorldBounds::default(),
            grid: GridConfig::default(),
        }
    }
}

impl SimConfig {
    /// The integrator timestep implied by the frame rate and sub-step count.
    pub fn fixed_time_step(&self) -> f32 {
        self.tick_rate / self.sub_steps as f32
    }
}

/// Axis-aligned rectangle bounding the entities of this world partition.
///
/// An entity whose position leaves this rectangle is flagged for egress and
/// handed to the sector collaborator at the end of the frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldBounds {
    pub min: [f32; 2],
    pub max: [f32; 2],
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min: [-960.0, -540.0],
            max: [960.0, 540.0],
        }
    }
}

/// Uniform-grid geometry for the broad phase.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// World-space position of cell (0, 0)'s min corner.
    pub origin: [f32; 2],
    /// World-space extent covered by the grid.
    pub width: f32,
    pub height: f32,
    /// Cell counts along each axis.
    pub x_subdivisions: u32,
    pub y_subdivisions: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            origin: [-960.0, -540.0],
            width: 1920.0,
            height: 1080.0,
            x_subdivisions: 120,
            y_subdivisions: 120,
        }
    }
}
