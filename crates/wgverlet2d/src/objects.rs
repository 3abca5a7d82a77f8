//! The device-resident object population.
//!
//! Six object categories live in structure-of-arrays form, one buffer per
//! attribute, densely indexed. Cross-references are `i32` rows with `-1` for
//! "none"; tables are inclusive `(start, end)` ranges with `(0, -1)` as the
//! canonical empty range.
//!
//! Creation is staged on the host in an [`ObjectBatch`] with batch-local
//! indices, then committed with [`GpuObjectSet::merge_batch`], which rebases
//! every reference by the live tails and appends. The same batch form comes
//! back out of the egress path, so a batch drained from one world partition
//! can be merged into another unchanged.

use wgpu::{CommandEncoder, Device, Queue};

use crate::buffers::{GpuBuffer, GrowthPolicy};
use crate::error::SimError;
use crate::ids::{EdgeId, EntityBoneId, EntityId, HullBoneId, HullId, PointId};

/// Hull flag bits. Mirrored by the wgsl kernels.
pub mod hull_flags {
    pub const IS_STATIC: u32 = 1;
    pub const IS_CIRCLE: u32 = 1 << 1;
    pub const IS_POLYGON: u32 = 1 << 2;
    pub const NO_BONES: u32 = 1 << 3;
    pub const OUT_OF_BOUNDS: u32 = 1 << 4;
    pub const IS_SENSOR: u32 = 1 << 5;
}

/// Edge flag bits.
pub mod edge_flags {
    /// Interior bracing edge, skipped by the collision silhouette and only
    /// relaxed on the final constraint pass.
    pub const INTERIOR: u32 = 1;
}

/// Point flag bits.
pub mod point_flags {
    pub const INTERIOR: u32 = 1;
    /// Pinned points are excluded from integration and reactions.
    pub const PINNED: u32 = 1 << 1;
}

/// Entity flag bits.
pub mod entity_flags {
    /// Marked for removal by the next compaction pass. Dependent objects are
    /// dead transitively through their ownership tables.
    pub const DELETED: u32 = 1;
    /// Left the partition bounds; egressed to the sector collaborator.
    pub const SECTOR_OUT: u32 = 1 << 1;
    /// Integrity reached zero; captured as a debris record.
    pub const BROKEN: u32 = 1 << 2;
    /// Collected by gameplay; captured as a collection record.
    pub const COLLECTED: u32 = 1 << 3;
}

/// Empty inclusive range.
pub const EMPTY_TABLE: [i32; 2] = [0, -1];
/// Bone table of a point with no bone influences.
pub const EMPTY_POINT_BONE_TABLE: [i32; 4] = [-1, -1, -1, -1];

fn rebase_index(index: i32, base: u32) -> i32 {
    if index < 0 {
        index
    } else {
        index + base as i32
    }
}

fn rebase_table(table: [i32; 2], base: u32) -> [i32; 2] {
    if table[1] >= table[0] {
        [table[0] + base as i32, table[1] + base as i32]
    } else {
        EMPTY_TABLE
    }
}

/// Host-staged population with batch-local indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectBatch {
    pub points: Vec<[f32; 4]>,
    pub point_hulls: Vec<i32>,
    pub point_flags: Vec<u32>,
    pub point_hits: Vec<u32>,
    pub point_bone_tables: Vec<[i32; 4]>,

    pub edges: Vec<[i32; 2]>,
    pub edge_lengths: Vec<f32>,
    pub edge_flags: Vec<u32>,
    pub edge_pins: Vec<i32>,

    pub hulls: Vec<[f32; 4]>,
    pub hull_scale_rots: Vec<[f32; 4]>,
    pub hull_flags: Vec<u32>,
    pub hull_entity_ids: Vec<i32>,
    pub hull_point_tables: Vec<[i32; 2]>,
    pub hull_edge_tables: Vec<[i32; 2]>,
    pub hull_bone_tables: Vec<[i32; 2]>,
    pub hull_materials: Vec<[f32; 2]>,
    pub hull_integrities: Vec<u32>,

    pub entities: Vec<[f32; 4]>,
    pub entity_root_hulls: Vec<i32>,
    pub entity_hull_tables: Vec<[i32; 2]>,
    pub entity_bone_tables: Vec<[i32; 2]>,
    pub entity_masses: Vec<f32>,
    pub entity_accels: Vec<[f32; 2]>,
    pub entity_flags: Vec<u32>,
    pub entity_model_ids: Vec<i32>,

    pub hull_bones: Vec<[[f32; 4]; 4]>,
    pub hull_bone_bind_poses: Vec<i32>,

    pub entity_bones: Vec<[[f32; 4]; 4]>,
    pub entity_bone_refs: Vec<i32>,
    pub entity_bone_parents: Vec<i32>,
}

impl ObjectBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.hulls.is_empty()
            && self.points.is_empty()
            && self.edges.is_empty()
    }

    /// Index the next created point will take.
    pub fn next_point(&self) -> PointId {
        PointId(self.points.len() as u32)
    }

    pub fn next_edge(&self) -> EdgeId {
        EdgeId(self.edges.len() as u32)
    }

    pub fn next_hull(&self) -> HullId {
        HullId(self.hulls.len() as u32)
    }

    pub fn next_entity(&self) -> EntityId {
        EntityId(self.entities.len() as u32)
    }

    pub fn next_hull_bone(&self) -> HullBoneId {
        HullBoneId(self.hull_bones.len() as u32)
    }

    pub fn next_entity_bone(&self) -> EntityBoneId {
        EntityBoneId(self.entity_bones.len() as u32)
    }

    /// Appends a point. `pos` packs (x, y, prev_x, prev_y).
    pub fn create_point(
        &mut self,
        pos: [f32; 4],
        hull: HullId,
        flags: u32,
        bone_table: [i32; 4],
    ) -> PointId {
        let id = self.next_point();
        self.points.push(pos);
        self.point_hulls.push(hull.0 as i32);
        self.point_flags.push(flags);
        self.point_hits.push(0);
        self.point_bone_tables.push(bone_table);
        id
    }

    pub fn create_edge(
        &mut self,
        p0: PointId,
        p1: PointId,
        length: f32,
        flags: u32,
        pin: Option<PointId>,
    ) -> EdgeId {
        let id = self.next_edge();
        self.edges.push([p0.0 as i32, p1.0 as i32]);
        self.edge_lengths.push(length);
        self.edge_flags.push(flags);
        self.edge_pins.push(pin.map_or(-1, |p| p.0 as i32));
        id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_hull(
        &mut self,
        pos: [f32; 2],
        scale: [f32; 2],
        rotation: [f32; 2],
        point_table: [i32; 2],
        edge_table: [i32; 2],
        bone_table: [i32; 2],
        flags: u32,
        entity: EntityId,
        friction: f32,
        restitution: f32,
    ) -> HullId {
        let id = self.next_hull();
        self.hulls.push([pos[0], pos[1], pos[0], pos[1]]);
        self.hull_scale_rots
            .push([scale[0], scale[1], rotation[0], rotation[1]]);
        self.hull_flags.push(flags);
        self.hull_entity_ids.push(entity.0 as i32);
        self.hull_point_tables.push(point_table);
        self.hull_edge_tables.push(edge_table);
        self.hull_bone_tables.push(bone_table);
        self.hull_materials.push([friction, restitution]);
        self.hull_integrities.push(100);
        id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_entity(
        &mut self,
        pos: [f32; 2],
        root_hull: HullId,
        hull_table: [i32; 2],
        bone_table: [i32; 2],
        mass: f32,
        model_id: i32,
        flags: u32,
    ) -> EntityId {
        let id = self.next_entity();
        self.entities.push([pos[0], pos[1], pos[0], pos[1]]);
        self.entity_root_hulls.push(root_hull.0 as i32);
        self.entity_hull_tables.push(hull_table);
        self.entity_bone_tables.push(bone_table);
        self.entity_masses.push(mass);
        self.entity_accels.push([0.0, 0.0]);
        self.entity_flags.push(flags);
        self.entity_model_ids.push(model_id);
        id
    }

    pub fn create_hull_bone(&mut self, bone: [[f32; 4]; 4], bind_pose: i32) -> HullBoneId {
        let id = self.next_hull_bone();
        self.hull_bones.push(bone);
        self.hull_bone_bind_poses.push(bind_pose);
        id
    }

    pub fn create_entity_bone(
        &mut self,
        bone: [[f32; 4]; 4],
        reference: i32,
        parent: Option<EntityBoneId>,
    ) -> EntityBoneId {
        let id = self.next_entity_bone();
        self.entity_bones.push(bone);
        self.entity_bone_refs.push(reference);
        self.entity_bone_parents
            .push(parent.map_or(-1, |p| p.0 as i32));
        id
    }

    /// Checks internal consistency: sibling attribute lengths agree and
    /// every cross-reference resolves inside the batch.
    pub fn validate(&self) -> Result<(), SimError> {
        let np = self.points.len();
        let ne = self.edges.len();
        let nh = self.hulls.len();
        let nn = self.entities.len();
        let nhb = self.hull_bones.len();
        let nnb = self.entity_bones.len();

        let sized = self.point_hulls.len() == np
            && self.point_flags.len() == np
            && self.point_hits.len() == np
            && self.point_bone_tables.len() == np
            && self.edge_lengths.len() == ne
            && self.edge_flags.len() == ne
            && self.edge_pins.len() == ne
            && self.hull_scale_rots.len() == nh
            && self.hull_flags.len() == nh
            && self.hull_entity_ids.len() == nh
            && self.hull_point_tables.len() == nh
            && self.hull_edge_tables.len() == nh
            && self.hull_bone_tables.len() == nh
            && self.hull_materials.len() == nh
            && self.hull_integrities.len() == nh
            && self.entity_root_hulls.len() == nn
            && self.entity_hull_tables.len() == nn
            && self.entity_bone_tables.len() == nn
            && self.entity_masses.len() == nn
            && self.entity_accels.len() == nn
            && self.entity_flags.len() == nn
            && self.entity_model_ids.len() == nn
            && self.hull_bone_bind_poses.len() == nhb
            && self.entity_bone_refs.len() == nnb
            && self.entity_bone_parents.len() == nnb;
        if !sized {
            return Err(SimError::invariant("batch attribute lengths disagree"));
        }

        let in_range = |index: i32, len: usize| index >= 0 && (index as usize) < len;
        let table_ok = |table: [i32; 2], len: usize| {
            table[1] < table[0] || (table[0] >= 0 && (table[1] as usize) < len)
        };

        for hull in &self.point_hulls {
            if !in_range(*hull, nh) {
                return Err(SimError::invariant("point references missing hull"));
            }
        }
        for table in &self.point_bone_tables {
            for bone in table {
                if *bone >= 0 && !in_range(*bone, nhb) {
                    return Err(SimError::invariant("point references missing hull bone"));
                }
            }
        }
        for (edge, pin) in self.edges.iter().zip(&self.edge_pins) {
            if !in_range(edge[0], np) || !in_range(edge[1], np) {
                return Err(SimError::invariant("edge references missing point"));
            }
            if *pin >= 0 && !in_range(*pin, np) {
                return Err(SimError::invariant("edge pin references missing point"));
            }
        }
        for entity in &self.hull_entity_ids {
            if !in_range(*entity, nn) {
                return Err(SimError::invariant("hull references missing entity"));
            }
        }
        for (i, _) in self.hulls.iter().enumerate() {
            if !table_ok(self.hull_point_tables[i], np)
                || !table_ok(self.hull_edge_tables[i], ne)
                || !table_ok(self.hull_bone_tables[i], nhb)
            {
                return Err(SimError::invariant("hull table out of range"));
            }
        }
        for (i, root) in self.entity_root_hulls.iter().enumerate() {
            if !in_range(*root, nh)
                || !table_ok(self.entity_hull_tables[i], nh)
                || !table_ok(self.entity_bone_tables[i], nnb)
            {
                return Err(SimError::invariant("entity table out of range"));
            }
        }
        for parent in &self.entity_bone_parents {
            if *parent >= 0 && !in_range(*parent, nnb) {
                return Err(SimError::invariant("entity bone parent out of range"));
            }
        }
        Ok(())
    }
}

/// Base rows assigned to a merged batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchPlacement {
    pub first_point: u32,
    pub first_edge: u32,
    pub first_hull: u32,
    pub first_entity: u32,
    pub first_hull_bone: u32,
    pub first_entity_bone: u32,
}

/// Row counts per object category.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub points: u32,
    pub edges: u32,
    pub hulls: u32,
    pub entities: u32,
    pub hull_bones: u32,
    pub entity_bones: u32,
}

/// Initial item capacities of the persistent population buffers.
#[derive(Copy, Clone, Debug)]
pub struct InitialCapacity {
    pub points: u64,
    pub edges: u64,
    pub hulls: u64,
    pub entities: u64,
    pub hull_bones: u64,
    pub entity_bones: u64,
}

impl Default for InitialCapacity {
    fn default() -> Self {
        Self {
            points: 50_000,
            edges: 24_000,
            hulls: 10_000,
            entities: 10_000,
            hull_bones: 10_000,
            entity_bones: 10_000,
        }
    }
}

impl InitialCapacity {
    /// A small layout for worlds that stage handfuls of objects (egress
    /// targets, tests).
    pub fn small() -> Self {
        Self {
            points: 1024,
            edges: 1024,
            hulls: 256,
            entities: 256,
            hull_bones: 256,
            entity_bones: 256,
        }
    }
}

/// The device-resident population: every SoA attribute of the six object
/// categories, plus the per-frame per-object arrays sized alongside them.
pub struct GpuObjectSet {
    pub points: GpuBuffer<[f32; 4]>,
    pub point_hulls: GpuBuffer<i32>,
    pub point_flags: GpuBuffer<u32>,
    pub point_hits: GpuBuffer<u32>,
    pub point_bone_tables: GpuBuffer<[i32; 4]>,

    pub edges: GpuBuffer<[i32; 2]>,
    pub edge_lengths: GpuBuffer<f32>,
    pub edge_flags: GpuBuffer<u32>,
    pub edge_pins: GpuBuffer<i32>,

    pub hulls: GpuBuffer<[f32; 4]>,
    pub hull_scale_rots: GpuBuffer<[f32; 4]>,
    pub hull_flags: GpuBuffer<u32>,
    pub hull_entity_ids: GpuBuffer<i32>,
    pub hull_point_tables: GpuBuffer<[i32; 2]>,
    pub hull_edge_tables: GpuBuffer<[i32; 2]>,
    pub hull_bone_tables: GpuBuffer<[i32; 2]>,
    pub hull_materials: GpuBuffer<[f32; 2]>,
    pub hull_integrities: GpuBuffer<u32>,

    pub entities: GpuBuffer<[f32; 4]>,
    pub entity_root_hulls: GpuBuffer<i32>,
    pub entity_hull_tables: GpuBuffer<[i32; 2]>,
    pub entity_bone_tables: GpuBuffer<[i32; 2]>,
    pub entity_masses: GpuBuffer<f32>,
    pub entity_accels: GpuBuffer<[f32; 2]>,
    pub entity_flags: GpuBuffer<u32>,
    pub entity_model_ids: GpuBuffer<i32>,

    pub hull_bones: GpuBuffer<[[f32; 4]; 4]>,
    pub hull_bone_bind_poses: GpuBuffer<i32>,

    pub entity_bones: GpuBuffer<[[f32; 4]; 4]>,
    pub entity_bone_refs: GpuBuffer<i32>,
    pub entity_bone_parents: GpuBuffer<i32>,

    // Per-frame arrays, rebuilt every tick.
    pub hull_aabbs: GpuBuffer<[f32; 4]>,
    pub hull_aabb_cells: GpuBuffer<[i32; 4]>,
    pub hull_key_counts: GpuBuffer<u32>,
    pub hull_key_offsets: GpuBuffer<u32>,
    pub point_reaction_counts: GpuBuffer<u32>,
    pub point_reaction_offsets: GpuBuffer<u32>,
}

impl GpuObjectSet {
    pub fn new(device: &Device, capacity: &InitialCapacity) -> Self {
        use GrowthPolicy::{Persistent, Transient};
        Self {
            points: GpuBuffer::storage(device, "points", capacity.points, Persistent),
            point_hulls: GpuBuffer::storage(device, "point_hulls", capacity.points, Persistent),
            point_flags: GpuBuffer::storage(device, "point_flags", capacity.points, Persistent),
            point_hits: GpuBuffer::storage(device, "point_hits", capacity.points, Persistent),
            point_bone_tables: GpuBuffer::storage(
                device,
                "point_bone_tables",
                capacity.points,
                Persistent,
            ),

            edges: GpuBuffer::storage(device, "edges", capacity.edges, Persistent),
            edge_lengths: GpuBuffer::storage(device, "edge_lengths", capacity.edges, Persistent),
            edge_flags: GpuBuffer::storage(device, "edge_flags", capacity.edges, Persistent),
            edge_pins: GpuBuffer::storage(device, "edge_pins", capacity.edges, Persistent),

            hulls: GpuBuffer::storage(device, "hulls", capacity.hulls, Persistent),
            hull_scale_rots: GpuBuffer::storage(
                device,
                "hull_scale_rots",
                capacity.hulls,
                Persistent,
            ),
            hull_flags: GpuBuffer::storage(device, "hull_flags", capacity.hulls, Persistent),
            hull_entity_ids: GpuBuffer::storage(
                device,
                "hull_entity_ids",
                capacity.hulls,
                Persistent,
            ),
            hull_point_tables: GpuBuffer::storage(
                device,
                "hull_point_tables",
                capacity.hulls,
                Persistent,
            ),
            hull_edge_tables: GpuBuffer::storage(
                device,
                "hull_edge_tables",
                capacity.hulls,
                Persistent,
            ),
            hull_bone_tables: GpuBuffer::storage(
                device,
                "hull_bone_tables",
                capacity.hulls,
                Persistent,
            ),
            hull_materials: GpuBuffer::storage(
                device,
                "hull_materials",
                capacity.hulls,
                Persistent,
            ),
            hull_integrities: GpuBuffer::storage(
                device,
                "hull_integrities",
                capacity.hulls,
                Persistent,
            ),

            entities: GpuBuffer::storage(device, "entities", capacity.entities, Persistent),
            entity_root_hulls: GpuBuffer::storage(
                device,
                "entity_root_hulls",
                capacity.entities,
                Persistent,
            ),
            entity_hull_tables: GpuBuffer::storage(
                device,
                "entity_hull_tables",
                capacity.entities,
                Persistent,
            ),
            entity_bone_tables: GpuBuffer::storage(
                device,
                "entity_bone_tables",
                capacity.entities,
                Persistent,
            ),
            entity_masses: GpuBuffer::storage(
                device,
                "entity_masses",
                capacity.entities,
                Persistent,
            ),
            entity_accels: GpuBuffer::storage(
                device,
                "entity_accels",
                capacity.entities,
                Persistent,
            ),
            entity_flags: GpuBuffer::storage(
                device,
                "entity_flags",
                capacity.entities,
                Persistent,
            ),
            entity_model_ids: GpuBuffer::storage(
                device,
                "entity_model_ids",
                capacity.entities,
                Persistent,
            ),

            hull_bones: GpuBuffer::storage(device, "hull_bones", capacity.hull_bones, Persistent),
            hull_bone_bind_poses: GpuBuffer::storage(
                device,
                "hull_bone_bind_poses",
                capacity.hull_bones,
                Persistent,
            ),

            entity_bones: GpuBuffer::storage(
                device,
                "entity_bones",
                capacity.entity_bones,
                Persistent,
            ),
            entity_bone_refs: GpuBuffer::storage(
                device,
                "entity_bone_refs",
                capacity.entity_bones,
                Persistent,
            ),
            entity_bone_parents: GpuBuffer::storage(
                device,
                "entity_bone_parents",
                capacity.entity_bones,
                Persistent,
            ),

            hull_aabbs: GpuBuffer::storage(device, "hull_aabbs", capacity.hulls, Transient),
            hull_aabb_cells: GpuBuffer::storage(
                device,
                "hull_aabb_cells",
                capacity.hulls,
                Transient,
            ),
            hull_key_counts: GpuBuffer::storage(
                device,
                "hull_key_counts",
                capacity.hulls,
                Transient,
            ),
            hull_key_offsets: GpuBuffer::storage(
                device,
                "hull_key_offsets",
                capacity.hulls,
                Transient,
            ),
            point_reaction_counts: GpuBuffer::storage(
                device,
                "point_reaction_counts",
                capacity.points,
                Transient,
            ),
            point_reaction_offsets: GpuBuffer::storage(
                device,
                "point_reaction_offsets",
                capacity.points,
                Transient,
            ),
        }
    }

    pub fn point_count(&self) -> u32 {
        self.points.len()
    }

    pub fn edge_count(&self) -> u32 {
        self.edges.len()
    }

    pub fn hull_count(&self) -> u32 {
        self.hulls.len()
    }

    pub fn entity_count(&self) -> u32 {
        self.entities.len()
    }

    pub fn hull_bone_count(&self) -> u32 {
        self.hull_bones.len()
    }

    pub fn entity_bone_count(&self) -> u32 {
        self.entity_bones.len()
    }

    /// Grows the per-frame arrays to the live object counts.
    pub fn ensure_frame_capacity(&mut self, device: &Device, queue: &Queue) -> Result<(), SimError> {
        let hulls = self.hull_count() as u64;
        let points = self.point_count() as u64;
        self.hull_aabbs.ensure_capacity(device, queue, hulls)?;
        self.hull_aabb_cells.ensure_capacity(device, queue, hulls)?;
        self.hull_key_counts.ensure_capacity(device, queue, hulls)?;
        self.hull_key_offsets.ensure_capacity(device, queue, hulls)?;
        self.point_reaction_counts
            .ensure_capacity(device, queue, points)?;
        self.point_reaction_offsets
            .ensure_capacity(device, queue, points)?;
        Ok(())
    }

    pub(crate) fn set_point_count(&mut self, n: u32) {
        self.points.set_len(n);
        self.point_hulls.set_len(n);
        self.point_flags.set_len(n);
        self.point_hits.set_len(n);
        self.point_bone_tables.set_len(n);
    }

    pub(crate) fn set_edge_count(&mut self, n: u32) {
        self.edges.set_len(n);
        self.edge_lengths.set_len(n);
        self.edge_flags.set_len(n);
        self.edge_pins.set_len(n);
    }

    pub(crate) fn set_hull_count(&mut self, n: u32) {
        self.hulls.set_len(n);
        self.hull_scale_rots.set_len(n);
        self.hull_flags.set_len(n);
        self.hull_entity_ids.set_len(n);
        self.hull_point_tables.set_len(n);
        self.hull_edge_tables.set_len(n);
        self.hull_bone_tables.set_len(n);
        self.hull_materials.set_len(n);
        self.hull_integrities.set_len(n);
    }

    pub(crate) fn set_entity_count(&mut self, n: u32) {
        self.entities.set_len(n);
        self.entity_root_hulls.set_len(n);
        self.entity_hull_tables.set_len(n);
        self.entity_bone_tables.set_len(n);
        self.entity_masses.set_len(n);
        self.entity_accels.set_len(n);
        self.entity_flags.set_len(n);
        self.entity_model_ids.set_len(n);
    }

    pub(crate) fn set_hull_bone_count(&mut self, n: u32) {
        self.hull_bones.set_len(n);
        self.hull_bone_bind_poses.set_len(n);
    }

    pub(crate) fn set_entity_bone_count(&mut self, n: u32) {
        self.entity_bones.set_len(n);
        self.entity_bone_refs.set_len(n);
        self.entity_bone_parents.set_len(n);
    }

    pub fn row_counts(&self) -> RowCounts {
        RowCounts {
            points: self.point_count(),
            edges: self.edge_count(),
            hulls: self.hull_count(),
            entities: self.entity_count(),
            hull_bones: self.hull_bone_count(),
            entity_bones: self.entity_bone_count(),
        }
    }

    pub(crate) fn set_row_counts(&mut self, rows: &RowCounts) {
        self.set_point_count(rows.points);
        self.set_edge_count(rows.edges);
        self.set_hull_count(rows.hulls);
        self.set_entity_count(rows.entities);
        self.set_hull_bone_count(rows.hull_bones);
        self.set_entity_bone_count(rows.entity_bones);
    }

    /// Grows every persistent array to hold at least `rows` per category.
    pub(crate) fn ensure_object_capacity(
        &mut self,
        device: &Device,
        queue: &Queue,
        rows: &RowCounts,
    ) -> Result<(), SimError> {
        let np = rows.points as u64;
        let ne = rows.edges as u64;
        let nh = rows.hulls as u64;
        let nn = rows.entities as u64;
        let nhb = rows.hull_bones as u64;
        let nnb = rows.entity_bones as u64;

        self.points.ensure_capacity(device, queue, np)?;
        self.point_hulls.ensure_capacity(device, queue, np)?;
        self.point_flags.ensure_capacity(device, queue, np)?;
        self.point_hits.ensure_capacity(device, queue, np)?;
        self.point_bone_tables.ensure_capacity(device, queue, np)?;
        self.edges.ensure_capacity(device, queue, ne)?;
        self.edge_lengths.ensure_capacity(device, queue, ne)?;
        self.edge_flags.ensure_capacity(device, queue, ne)?;
        self.edge_pins.ensure_capacity(device, queue, ne)?;
        self.hulls.ensure_capacity(device, queue, nh)?;
        self.hull_scale_rots.ensure_capacity(device, queue, nh)?;
        self.hull_flags.ensure_capacity(device, queue, nh)?;
        self.hull_entity_ids.ensure_capacity(device, queue, nh)?;
        self.hull_point_tables.ensure_capacity(device, queue, nh)?;
        self.hull_edge_tables.ensure_capacity(device, queue, nh)?;
        self.hull_bone_tables.ensure_capacity(device, queue, nh)?;
        self.hull_materials.ensure_capacity(device, queue, nh)?;
        self.hull_integrities.ensure_capacity(device, queue, nh)?;
        self.entities.ensure_capacity(device, queue, nn)?;
        self.entity_root_hulls.ensure_capacity(device, queue, nn)?;
        self.entity_hull_tables.ensure_capacity(device, queue, nn)?;
        self.entity_bone_tables.ensure_capacity(device, queue, nn)?;
        self.entity_masses.ensure_capacity(device, queue, nn)?;
        self.entity_accels.ensure_capacity(device, queue, nn)?;
        self.entity_flags.ensure_capacity(device, queue, nn)?;
        self.entity_model_ids.ensure_capacity(device, queue, nn)?;
        self.hull_bones.ensure_capacity(device, queue, nhb)?;
        self.hull_bone_bind_poses
            .ensure_capacity(device, queue, nhb)?;
        self.entity_bones.ensure_capacity(device, queue, nnb)?;
        self.entity_bone_refs.ensure_capacity(device, queue, nnb)?;
        self.entity_bone_parents
            .ensure_capacity(device, queue, nnb)?;
        Ok(())
    }

    /// Appends a validated batch, rebasing its internal references by the
    /// live tails.
    pub fn merge_batch(
        &mut self,
        device: &Device,
        queue: &Queue,
        batch: &ObjectBatch,
    ) -> Result<BatchPlacement, SimError> {
        batch.validate()?;

        let placement = BatchPlacement {
            first_point: self.point_count(),
            first_edge: self.edge_count(),
            first_hull: self.hull_count(),
            first_entity: self.entity_count(),
            first_hull_bone: self.hull_bone_count(),
            first_entity_bone: self.entity_bone_count(),
        };
        let np = batch.points.len() as u32;
        let ne = batch.edges.len() as u32;
        let nh = batch.hulls.len() as u32;
        let nn = batch.entities.len() as u32;
        let nhb = batch.hull_bones.len() as u32;
        let nnb = batch.entity_bones.len() as u32;

        let pb = placement.first_point;
        let eb = placement.first_edge;
        let hb = placement.first_hull;
        let nb = placement.first_entity;
        let hbb = placement.first_hull_bone;
        let nbb = placement.first_entity_bone;

        self.ensure_object_capacity(
            device,
            queue,
            &RowCounts {
                points: pb + np,
                edges: eb + ne,
                hulls: hb + nh,
                entities: nb + nn,
                hull_bones: hbb + nhb,
                entity_bones: nbb + nnb,
            },
        )?;

        self.points.write(queue, pb as u64, &batch.points);
        let point_hulls: Vec<i32> = batch
            .point_hulls
            .iter()
            .map(|h| rebase_index(*h, hb))
            .collect();
        self.point_hulls.write(queue, pb as u64, &point_hulls);
        self.point_flags.write(queue, pb as u64, &batch.point_flags);
        self.point_hits.write(queue, pb as u64, &batch.point_hits);
        let point_bones: Vec<[i32; 4]> = batch
            .point_bone_tables
            .iter()
            .map(|t| t.map(|b| rebase_index(b, hbb)))
            .collect();
        self.point_bone_tables.write(queue, pb as u64, &point_bones);

        let edges: Vec<[i32; 2]> = batch
            .edges
            .iter()
            .map(|e| [rebase_index(e[0], pb), rebase_index(e[1], pb)])
            .collect();
        self.edges.write(queue, eb as u64, &edges);
        self.edge_lengths
            .write(queue, eb as u64, &batch.edge_lengths);
        self.edge_flags.write(queue, eb as u64, &batch.edge_flags);
        let edge_pins: Vec<i32> = batch
            .edge_pins
            .iter()
            .map(|p| rebase_index(*p, pb))
            .collect();
        self.edge_pins.write(queue, eb as u64, &edge_pins);

        self.hulls.write(queue, hb as u64, &batch.hulls);
        self.hull_scale_rots
            .write(queue, hb as u64, &batch.hull_scale_rots);
        self.hull_flags.write(queue, hb as u64, &batch.hull_flags);
        let hull_entities: Vec<i32> = batch
            .hull_entity_ids
            .iter()
            .map(|e| rebase_index(*e, nb))
            .collect();
        self.hull_entity_ids.write(queue, hb as u64, &hull_entities);
        let point_tables: Vec<[i32; 2]> = batch
            .hull_point_tables
            .iter()
            .map(|t| rebase_table(*t, pb))
            .collect();
        self.hull_point_tables.write(queue, hb as u64, &point_tables);
        let edge_tables: Vec<[i32; 2]> = batch
            .hull_edge_tables
            .iter()
            .map(|t| rebase_table(*t, eb))
            .collect();
        self.hull_edge_tables.write(queue, hb as u64, &edge_tables);
        let bone_tables: Vec<[i32; 2]> = batch
            .hull_bone_tables
            .iter()
            .map(|t| rebase_table(*t, hbb))
            .collect();
        self.hull_bone_tables.write(queue, hb as u64, &bone_tables);
        self.hull_materials
            .write(queue, hb as u64, &batch.hull_materials);
        self.hull_integrities
            .write(queue, hb as u64, &batch.hull_integrities);

        self.entities.write(queue, nb as u64, &batch.entities);
        let roots: Vec<i32> = batch
            .entity_root_hulls
            .iter()
            .map(|h| rebase_index(*h, hb))
            .collect();
        self.entity_root_hulls.write(queue, nb as u64, &roots);
        let hull_tables: Vec<[i32; 2]> = batch
            .entity_hull_tables
            .iter()
            .map(|t| rebase_table(*t, hb))
            .collect();
        self.entity_hull_tables.write(queue, nb as u64, &hull_tables);
        let entity_bone_tables: Vec<[i32; 2]> = batch
            .entity_bone_tables
            .iter()
            .map(|t| rebase_table(*t, nbb))
            .collect();
        self.entity_bone_tables
            .write(queue, nb as u64, &entity_bone_tables);
        self.entity_masses
            .write(queue, nb as u64, &batch.entity_masses);
        self.entity_accels
            .write(queue, nb as u64, &batch.entity_accels);
        self.entity_flags
            .write(queue, nb as u64, &batch.entity_flags);
        self.entity_model_ids
            .write(queue, nb as u64, &batch.entity_model_ids);

        self.hull_bones.write(queue, hbb as u64, &batch.hull_bones);
        self.hull_bone_bind_poses
            .write(queue, hbb as u64, &batch.hull_bone_bind_poses);
        self.entity_bones
            .write(queue, nbb as u64, &batch.entity_bones);
        self.entity_bone_refs
            .write(queue, nbb as u64, &batch.entity_bone_refs);
        let parents: Vec<i32> = batch
            .entity_bone_parents
            .iter()
            .map(|p| rebase_index(*p, nbb))
            .collect();
        self.entity_bone_parents.write(queue, nbb as u64, &parents);

        self.set_point_count(pb + np);
        self.set_edge_count(eb + ne);
        self.set_hull_count(hb + nh);
        self.set_entity_count(nb + nn);
        self.set_hull_bone_count(hbb + nhb);
        self.set_entity_bone_count(nbb + nnb);

        log::debug!(
            "merged batch: {} entities, {} hulls, {} points, {} edges",
            nn,
            nh,
            np,
            ne
        );
        Ok(placement)
    }

    /// Reads the whole persistent population back to the host as a batch.
    ///
    /// The returned batch is self-contained relative to row zero of this
    /// set; it is only directly mergeable elsewhere when this set holds a
    /// rebased copy (the egress sets do).
    pub fn read_all(&self, device: &Device, queue: &Queue) -> Result<ObjectBatch, SimError> {
        Ok(ObjectBatch {
            points: self.points.read(device, queue)?,
            point_hulls: self.point_hulls.read(device, queue)?,
            point_flags: self.point_flags.read(device, queue)?,
            point_hits: self.point_hits.read(device, queue)?,
            point_bone_tables: self.point_bone_tables.read(device, queue)?,
            edges: self.edges.read(device, queue)?,
            edge_lengths: self.edge_lengths.read(device, queue)?,
            edge_flags: self.edge_flags.read(device, queue)?,
            edge_pins: self.edge_pins.read(device, queue)?,
            hulls: self.hulls.read(device, queue)?,
            hull_scale_rots: self.hull_scale_rots.read(device, queue)?,
            hull_flags: self.hull_flags.read(device, queue)?,
            hull_entity_ids: self.hull_entity_ids.read(device, queue)?,
            hull_point_tables: self.hull_point_tables.read(device, queue)?,
            hull_edge_tables: self.hull_edge_tables.read(device, queue)?,
            hull_bone_tables: self.hull_bone_tables.read(device, queue)?,
            hull_materials: self.hull_materials.read(device, queue)?,
            hull_integrities: self.hull_integrities.read(device, queue)?,
            entities: self.entities.read(device, queue)?,
            entity_root_hulls: self.entity_root_hulls.read(device, queue)?,
            entity_hull_tables: self.entity_hull_tables.read(device, queue)?,
            entity_bone_tables: self.entity_bone_tables.read(device, queue)?,
            entity_masses: self.entity_masses.read(device, queue)?,
            entity_accels: self.entity_accels.read(device, queue)?,
            entity_flags: self.entity_flags.read(device, queue)?,
            entity_model_ids: self.entity_model_ids.read(device, queue)?,
            hull_bones: self.hull_bones.read(device, queue)?,
            hull_bone_bind_poses: self.hull_bone_bind_poses.read(device, queue)?,
            entity_bones: self.entity_bones.read(device, queue)?,
            entity_bone_refs: self.entity_bone_refs.read(device, queue)?,
            entity_bone_parents: self.entity_bone_parents.read(device, queue)?,
        })
    }

    /// Records wholesale copies of every persistent array into `dst` and
    /// adopts this set's counts there. `dst` must already have the capacity.
    pub(crate) fn record_copy_into(&self, encoder: &mut CommandEncoder, dst: &mut GpuObjectSet) {
        let points = self.point_count() as u64;
        let edges = self.edge_count() as u64;
        let hulls = self.hull_count() as u64;
        let entities = self.entity_count() as u64;
        let hull_bones = self.hull_bone_count() as u64;
        let entity_bones = self.entity_bone_count() as u64;

        dst.points.copy_from(encoder, &self.points, points);
        dst.point_hulls.copy_from(encoder, &self.point_hulls, points);
        dst.point_flags.copy_from(encoder, &self.point_flags, points);
        dst.point_hits.copy_from(encoder, &self.point_hits, points);
        dst.point_bone_tables
            .copy_from(encoder, &self.point_bone_tables, points);

        dst.edges.copy_from(encoder, &self.edges, edges);
        dst.edge_lengths.copy_from(encoder, &self.edge_lengths, edges);
        dst.edge_flags.copy_from(encoder, &self.edge_flags, edges);
        dst.edge_pins.copy_from(encoder, &self.edge_pins, edges);

        dst.hulls.copy_from(encoder, &self.hulls, hulls);
        dst.hull_scale_rots
            .copy_from(encoder, &self.hull_scale_rots, hulls);
        dst.hull_flags.copy_from(encoder, &self.hull_flags, hulls);
        dst.hull_entity_ids
            .copy_from(encoder, &self.hull_entity_ids, hulls);
        dst.hull_point_tables
            .copy_from(encoder, &self.hull_point_tables, hulls);
        dst.hull_edge_tables
            .copy_from(encoder, &self.hull_edge_tables, hulls);
        dst.hull_bone_tables
            .copy_from(encoder, &self.hull_bone_tables, hulls);
        dst.hull_materials
            .copy_from(encoder, &self.hull_materials, hulls);
        dst.hull_integrities
            .copy_from(encoder, &self.hull_integrities, hulls);

        dst.entities.copy_from(encoder, &self.entities, entities);
        dst.entity_root_hulls
            .copy_from(encoder, &self.entity_root_hulls, entities);
        dst.entity_hull_tables
            .copy_from(encoder, &self.entity_hull_tables, entities);
        dst.entity_bone_tables
            .copy_from(encoder, &self.entity_bone_tables, entities);
        dst.entity_masses
            .copy_from(encoder, &self.entity_masses, entities);
        dst.entity_accels
            .copy_from(encoder, &self.entity_accels, entities);
        dst.entity_flags
            .copy_from(encoder, &self.entity_flags, entities);
        dst.entity_model_ids
            .copy_from(encoder, &self.entity_model_ids, entities);

        dst.hull_bones.copy_from(encoder, &self.hull_bones, hull_bones);
        dst.hull_bone_bind_poses
            .copy_from(encoder, &self.hull_bone_bind_poses, hull_bones);

        dst.entity_bones
            .copy_from(encoder, &self.entity_bones, entity_bones);
        dst.entity_bone_refs
            .copy_from(encoder, &self.entity_bone_refs, entity_bones);
        dst.entity_bone_parents
            .copy_from(encoder, &self.entity_bone_parents, entity_bones);

        dst.set_row_counts(&self.row_counts());
    }

    /// Uploads externally animated hull bone transforms.
    pub fn write_hull_bones(&self, queue: &Queue, first: HullBoneId, bones: &[[[f32; 4]; 4]]) {
        self.hull_bones.write(queue, first.0 as u64, bones);
    }

    /// Uploads externally animated entity bone transforms.
    pub fn write_entity_bones(&self, queue: &Queue, first: EntityBoneId, bones: &[[[f32; 4]; 4]]) {
        self.entity_bones.write(queue, first.0 as u64, bones);
    }

    /// Sets an entity's acceleration for the coming ticks.
    pub fn write_entity_accel(&self, queue: &Queue, entity: EntityId, accel: [f32; 2]) {
        self.entity_accels.write(queue, entity.0 as u64, &[accel]);
    }

    /// Overwrites an entity's flag word.
    pub fn write_entity_flags(&self, queue: &Queue, entity: EntityId, flags: u32) {
        self.entity_flags.write(queue, entity.0 as u64, &[flags]);
    }

    /// Marks an entity for removal by the next compaction pass.
    pub fn mark_deleted(&self, queue: &Queue, entity: EntityId) {
        self.write_entity_flags(queue, entity, entity_flags::DELETED);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_tables_stay_canonical() {
        assert_eq!(rebase_table(EMPTY_TABLE, 100), EMPTY_TABLE);
        assert_eq!(rebase_table([2, 5], 10), [12, 15]);
        assert_eq!(rebase_index(-1, 10), -1);
        assert_eq!(rebase_index(3, 10), 13);
    }

    #[test]
    fn batch_validation_catches_dangling_refs() {
        let mut batch = ObjectBatch::new();
        let hull = batch.next_hull();
        let entity = batch.next_entity();
        let p = batch.create_point([0.0; 4], hull, 0, EMPTY_POINT_BONE_TABLE);
        batch.create_hull(
            [0.0, 0.0],
            [1.0, 1.0],
            [0.0, 0.0],
            [p.0 as i32, p.0 as i32],
            EMPTY_TABLE,
            EMPTY_TABLE,
            hull_flags::IS_CIRCLE,
            entity,
            0.5,
            0.5,
        );
        batch.create_entity(
            [0.0, 0.0],
            hull,
            [hull.0 as i32, hull.0 as i32],
            EMPTY_TABLE,
            1.0,
            -1,
            0,
        );
        assert!(batch.validate().is_ok());

        let mut broken = batch.clone();
        broken.point_hulls[0] = 7;
        assert!(broken.validate().is_err());

        let mut broken = batch.clone();
        broken.entity_root_hulls[0] = -2;
        assert!(broken.validate().is_err());
    }
}

