//! Object archetype factories.
//!
//! Each factory stages one complete entity into an [`ObjectBatch`]: points,
//! edges, a hull and the entity row, with tables laid out contiguously.
//! Polygon points wind counter-clockwise.

use nalgebra::Point2;

use crate::ids::EntityId;
use crate::objects::{
    edge_flags, hull_flags, ObjectBatch, EMPTY_POINT_BONE_TABLE, EMPTY_TABLE,
};

fn dist(a: Point2<f32>, b: Point2<f32>) -> f32 {
    (b - a).norm()
}

/// A single-point circle body.
pub fn particle(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    radius: f32,
    mass: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
) -> EntityId {
    particle_with_flags(
        batch, center, radius, mass, friction, restitution, model_id, 0,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn particle_with_flags(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    radius: f32,
    mass: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
    extra_hull_flags: u32,
) -> EntityId {
    let hull = batch.next_hull();
    let entity = batch.next_entity();
    let p = batch.create_point(
        [center.x, center.y, center.x, center.y],
        hull,
        0,
        EMPTY_POINT_BONE_TABLE,
    );
    let hull = batch.create_hull(
        [center.x, center.y],
        [radius * 2.0, radius],
        [0.0, 0.0],
        [p.into(), p.into()],
        EMPTY_TABLE,
        EMPTY_TABLE,
        hull_flags::IS_CIRCLE | hull_flags::NO_BONES | extra_hull_flags,
        entity,
        friction,
        restitution,
    );
    batch.create_entity(
        [center.x, center.y],
        hull,
        [hull.into(), hull.into()],
        EMPTY_TABLE,
        mass,
        model_id,
        0,
    )
}

/// A four-point square body: four perimeter edges plus two interior braces.
pub fn block(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    size: f32,
    mass: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
) -> EntityId {
    block_with_flags(
        batch, center, size, mass, friction, restitution, model_id, 0,
    )
}

/// A square body that never moves. Static hulls take part in collisions but
/// receive no reactions and are skipped by the integrator.
pub fn static_block(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    size: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
) -> EntityId {
    block_with_flags(
        batch,
        center,
        size,
        0.0,
        friction,
        restitution,
        model_id,
        hull_flags::IS_STATIC,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn block_with_flags(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    size: f32,
    mass: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
    extra_hull_flags: u32,
) -> EntityId {
    let half = size * 0.5;
    let corners = [
        Point2::new(center.x - half, center.y - half),
        Point2::new(center.x + half, center.y - half),
        Point2::new(center.x + half, center.y + half),
        Point2::new(center.x - half, center.y + half),
    ];
    polygon_with_flags(
        batch,
        center,
        [size, size],
        &corners,
        true,
        mass,
        friction,
        restitution,
        model_id,
        extra_hull_flags,
    )
}

/// A three-point triangle body with vertices on the circumradius `size`.
pub fn triangle(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    size: f32,
    mass: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
) -> EntityId {
    let mut corners = [Point2::origin(); 3];
    for (i, corner) in corners.iter_mut().enumerate() {
        let angle = std::f32::consts::FRAC_PI_2 + i as f32 * std::f32::consts::TAU / 3.0;
        *corner = Point2::new(center.x + size * angle.cos(), center.y + size * angle.sin());
    }
    polygon_with_flags(
        batch,
        center,
        [size * 2.0, size * 2.0],
        &corners,
        false,
        mass,
        friction,
        restitution,
        model_id,
        0,
    )
}

/// Stages a convex polygon from counter-clockwise `corners`.
///
/// `braced` adds the two diagonal interior edges of a quad; triangles are
/// rigid from their perimeter alone.
#[allow(clippy::too_many_arguments)]
fn polygon_with_flags(
    batch: &mut ObjectBatch,
    center: Point2<f32>,
    scale: [f32; 2],
    corners: &[Point2<f32>],
    braced: bool,
    mass: f32,
    friction: f32,
    restitution: f32,
    model_id: i32,
    extra_hull_flags: u32,
) -> EntityId {
    let hull = batch.next_hull();
    let entity = batch.next_entity();

    let mut points = Vec::with_capacity(corners.len());
    for corner in corners {
        points.push(batch.create_point(
            [corner.x, corner.y, corner.x, corner.y],
            hull,
            0,
            EMPTY_POINT_BONE_TABLE,
        ));
    }

    let first_edge = batch.next_edge();
    let mut last_edge = first_edge;
    for i in 0..points.len() {
        let j = (i + 1) % points.len();
        last_edge = batch.create_edge(
            points[i],
            points[j],
            dist(corners[i], corners[j]),
            0,
            None,
        );
    }
    if braced {
        debug_assert_eq!(points.len(), 4);
        batch.create_edge(
            points[0],
            points[2],
            dist(corners[0], corners[2]),
            edge_flags::INTERIOR,
            None,
        );
        last_edge = batch.create_edge(
            points[1],
            points[3],
            dist(corners[1], corners[3]),
            edge_flags::INTERIOR,
            None,
        );
    }

    let hull = batch.create_hull(
        [center.x, center.y],
        scale,
        [0.0, 0.0],
        [points[0].0 as i32, points[points.len() - 1].0 as i32],
        [first_edge.0 as i32, last_edge.0 as i32],
        EMPTY_TABLE,
        hull_flags::IS_POLYGON | hull_flags::NO_BONES | extra_hull_flags,
        entity,
        friction,
        restitution,
    );
    batch.create_entity(
        [center.x, center.y],
        hull,
        [hull.into(), hull.into()],
        EMPTY_TABLE,
        mass,
        model_id,
        0,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn particle_layout() {
        let mut batch = ObjectBatch::new();
        let entity = particle(&mut batch, Point2::new(1.0, 2.0), 0.5, 1.0, 0.2, 0.5, 7);
        assert_eq!(entity.0, 0);
        assert_eq!(batch.points.len(), 1);
        assert_eq!(batch.edges.len(), 0);
        assert_eq!(batch.hulls.len(), 1);
        assert_eq!(batch.hull_point_tables[0], [0, 0]);
        assert_eq!(batch.hull_edge_tables[0], EMPTY_TABLE);
        assert_eq!(batch.hull_scale_rots[0], [1.0, 0.5, 0.0, 0.0]);
        assert_ne!(batch.hull_flags[0] & hull_flags::IS_CIRCLE, 0);
        assert_eq!(batch.entity_model_ids[0], 7);
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn block_layout() {
        let mut batch = ObjectBatch::new();
        block(&mut batch, Point2::new(0.0, 0.0), 2.0, 4.0, 0.2, 0.5, -1);
        assert_eq!(batch.points.len(), 4);
        assert_eq!(batch.edges.len(), 6);
        assert_eq!(batch.hull_point_tables[0], [0, 3]);
        assert_eq!(batch.hull_edge_tables[0], [0, 5]);
        // Perimeter edges rest at the side length, braces at the diagonal.
        for i in 0..4 {
            assert_relative_eq!(batch.edge_lengths[i], 2.0, epsilon = 1.0e-5);
            assert_eq!(batch.edge_flags[i], 0);
        }
        for i in 4..6 {
            assert_relative_eq!(batch.edge_lengths[i], 2.0 * 2.0f32.sqrt(), epsilon = 1.0e-5);
            assert_eq!(batch.edge_flags[i], edge_flags::INTERIOR);
        }
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn stacked_bodies_have_contiguous_tables() {
        let mut batch = ObjectBatch::new();
        block(&mut batch, Point2::new(0.0, 0.0), 2.0, 4.0, 0.2, 0.5, -1);
        let second = triangle(&mut batch, Point2::new(5.0, 0.0), 1.0, 1.0, 0.2, 0.5, -1);
        assert_eq!(second.0, 1);
        assert_eq!(batch.hull_point_tables[1], [4, 6]);
        assert_eq!(batch.hull_edge_tables[1], [6, 8]);
        assert_eq!(batch.entity_hull_tables[1], [1, 1]);
        assert_eq!(batch.hull_entity_ids[1], 1);
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn static_block_is_static() {
        let mut batch = ObjectBatch::new();
        static_block(&mut batch, Point2::new(0.0, -10.0), 10.0, 0.5, 0.0, -1);
        assert_ne!(batch.hull_flags[0] & hull_flags::IS_STATIC, 0);
        assert!(batch.validate().is_ok());
    }
}
