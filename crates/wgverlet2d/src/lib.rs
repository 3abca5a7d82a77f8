//! GPU-resident 2D verlet soft/rigid body simulation on WebGPU/WGSL.
//!
//! **wgverlet2d** simulates thousands of point-mass meshes connected by
//! distance constraints entirely on the GPU via `wgpu` compute, and keeps
//! the device-resident population densely packed as bodies are created,
//! destroyed and migrated between world partitions every frame. All state
//! lives in flat structure-of-arrays buffers addressed by integer rows;
//! cross-references are rewritten in place whenever compaction closes the
//! holes left by deleted entities.
//!
//! The crate splits into leaf engines (`buffers`, `scan`, `broad_phase`,
//! `narrow_phase`, `integrate`, `compact`, `egress`) and an orchestration
//! layer: [`pipeline::PhysicsPipeline`] for one tick, and
//! [`runner::PhysicsRunner`] for a fixed-timestep thread.

#![doc = include_str!("../README.md")]
#![allow(clippy::too_many_arguments)]

pub mod broad_phase;
pub mod buffers;
pub mod compact;
pub mod config;
pub mod diagnostics;
pub mod egress;
pub mod error;
pub mod gpu;
pub mod grid;
pub mod ids;
pub mod integrate;
pub mod kernel;
pub mod mirror;
pub mod narrow_phase;
pub mod objects;
pub mod pipeline;
pub mod runner;
pub mod scan;
pub mod shapes;

pub use config::{GridConfig, SimConfig, WorldBounds};
pub use error::SimError;
pub use gpu::GpuInstance;
pub use pipeline::PhysicsPipeline;
pub use runner::PhysicsRunner;
