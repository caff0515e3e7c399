//! Grid math and the integer geometry predicates shared by the contour and mesher
//! stages.
//!
//! Everything here works on the xz-plane; y is carried along untouched. The predicates
//! are exact (integer arithmetic) so the triangulator and the hole merger agree on
//! orientation no matter how degenerate the input.

use glam::{IVec4, UVec4, Vec3};

/// Gets the standard width (x-axis) offset for the specified direction.
#[inline]
pub(crate) fn dir_offset_x(dir: usize) -> i32 {
    const OFFSET: [i32; 4] = [-1, 0, 1, 0];
    OFFSET[dir & 0x03]
}

/// Gets the standard height (z-axis) offset for the specified direction.
#[inline]
pub(crate) fn dir_offset_z(dir: usize) -> i32 {
    const OFFSET: [i32; 4] = [0, 1, 0, -1];
    OFFSET[dir & 0x03]
}

/// Computes the axis-aligned bounding box of a set of vertices.
///
/// Returns `(Vec3::MAX, Vec3::MIN)` for an empty slice.
pub fn calc_bounds(vertices: &[Vec3]) -> (Vec3, Vec3) {
    vertices.iter().fold((Vec3::MAX, Vec3::MIN), |(min, max), v| {
        (min.min(*v), max.max(*v))
    })
}

/// Computes the voxel grid size spanned by `[min_bounds, max_bounds]` at `cell_size`.
pub fn calc_grid_size(min_bounds: Vec3, max_bounds: Vec3, cell_size: f32) -> (i32, i32) {
    let width = ((max_bounds.x - min_bounds.x) / cell_size + 0.5) as i32;
    let height = ((max_bounds.z - min_bounds.z) / cell_size + 0.5) as i32;
    (width, height)
}

/// Twice the signed area of triangle `(a, b, c)` on the xz-plane.
///
/// Negative when `c` lies to the left of the directed edge `a -> b`.
#[inline]
pub(crate) fn area2(a: IVec4, b: IVec4, c: IVec4) -> i32 {
    (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
}

#[inline]
pub(crate) fn left(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
fn collinear(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area2(a, b, c) == 0
}

/// Proper intersection of segments `a-b` and `c-d`: they cross at a point interior to
/// both. Shared endpoints and collinear overlaps do not count.
pub(crate) fn intersect_prop(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }

    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// True when `c` lies on the closed segment `a-b`. Requires the three points to be
/// collinear.
fn between(a: IVec4, b: IVec4, c: IVec4) -> bool {
    if !collinear(a, b, c) {
        return false;
    }

    // If a-b is not vertical, check betweenness on x; else on z.
    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
    } else {
        (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
    }
}

/// Intersection of segments `a-b` and `c-d`, proper or improper.
pub(crate) fn intersect(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

/// True when the diagonal from vertex `i` of `vertices` to `point` stays inside the
/// cone spanned by the edges meeting at `i`.
pub(crate) fn in_cone(i: usize, vertices: &[UVec4], point: UVec4) -> bool {
    let point_i = vertices[i].as_ivec4();
    let point_next = vertices[(i + 1) % vertices.len()].as_ivec4();
    let point_prev = vertices[(vertices.len() + i - 1) % vertices.len()].as_ivec4();
    let point = point.as_ivec4();

    if left_on(point_prev, point_i, point_next) {
        // Convex corner.
        return left(point_i, point, point_prev) && left(point, point_i, point_next);
    }

    // Reflex corner.
    !(left_on(point_i, point, point_next) && left_on(point, point_i, point_prev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{ivec4, uvec4, Vec3};

    #[test]
    fn bounds_of_two_vertices() {
        let (min, max) = calc_bounds(&[Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.0, 2.0, 6.0)]);
        assert_eq!(min, Vec3::new(0.0, 2.0, 3.0));
        assert_eq!(max, Vec3::new(1.0, 2.0, 6.0));
    }

    #[test]
    fn grid_size_rounds_to_nearest_cell() {
        let (min, max) = calc_bounds(&[Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.0, 2.0, 6.0)]);
        let (width, height) = calc_grid_size(min, max, 1.5);
        assert_eq!(width, 1);
        assert_eq!(height, 2);
    }

    #[test]
    fn signed_area_orientation() {
        let a = ivec4(0, 0, 0, 0);
        let b = ivec4(2, 0, 0, 0);
        let c = ivec4(0, 0, 2, 0);
        // c lies right of a->b in this coordinate convention.
        assert!(area2(a, b, c) > 0);
        assert!(left(a, c, b));
        assert!(left_on(a, c, b));
        assert!(left_on(a, b, ivec4(4, 0, 0, 0)));
        assert!(!left(a, b, ivec4(4, 0, 0, 0)));
    }

    #[test]
    fn proper_and_improper_intersection() {
        let a = ivec4(0, 0, 0, 0);
        let b = ivec4(4, 0, 4, 0);
        let c = ivec4(0, 0, 4, 0);
        let d = ivec4(4, 0, 0, 0);
        assert!(intersect_prop(a, b, c, d));
        assert!(intersect(a, b, c, d));

        // Sharing an endpoint is an improper intersection only.
        let e = ivec4(8, 0, 8, 0);
        assert!(!intersect_prop(a, b, b, e));
        assert!(intersect(a, b, b, e));

        // Fully disjoint.
        assert!(!intersect(a, d, c, ivec4(0, 0, 8, 0)));
    }

    #[test]
    fn cone_test_at_convex_corner() {
        // A unit square walked counter-clockwise in contour space.
        let square = [
            uvec4(0, 0, 0, 0),
            uvec4(0, 0, 2, 0),
            uvec4(2, 0, 2, 0),
            uvec4(2, 0, 0, 0),
        ];
        // The opposite corner is inside the cone at vertex 0, an outside point is not.
        assert!(in_cone(0, &square, uvec4(1, 0, 1, 0)));
    }
}
