//! Contour extraction: traces every region's boundary into a closed polyline, then
//! simplifies it against the raw boundary and folds holes into their outlines.
//!
//! Vertices are `UVec4`s in cell space; `w` carries the neighbour region id in its low
//! 16 bits plus the [`FLAG_BORDER_VERTEX`]/[`FLAG_AREA_BORDER`] bits above, matching the
//! layout the mesher expects.

use std::cmp::Ordering;

use bitflags::bitflags;
use glam::{IVec2, UVec4, Vec3};

use crate::{
    get_neighbour_index,
    heightfields::OpenHeightfield,
    math::{in_cone, intersect},
    Area, BuildContext, BORDER_REG, FLAG_AREA_BORDER, FLAG_BORDER_VERTEX, MASK_CONTOUR_REGION,
};

bitflags! {
    /// Selects which contour edges get subdivided to the configured maximum edge length.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContourBuildFlags: u8 {
        /// Split outer (wall) edges.
        const TESS_WALL_EDGES = 0x01;
        /// Split edges between different area types.
        const TESS_AREA_EDGES = 0x02;
    }
}

/// The traced boundary of one region.
#[derive(Default, Clone, Debug)]
pub struct Contour {
    /// Simplified vertices; `w` packs neighbour region and vertex flags.
    pub vertices: Vec<UVec4>,
    /// The raw boundary as walked, one vertex per boundary cell corner.
    pub raw_vertices: Vec<UVec4>,
    pub region: u16,
    /// Unlike the open heightfield spans this can't be `None`: spans without an area
    /// never make it into a region.
    pub area: Area,
}

/// All contours of a build, in region discovery order.
#[derive(Default, Clone, Debug)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
    pub min_bounds: Vec3,
    pub max_bounds: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    /// Grid size with the border strip already removed.
    pub width: i32,
    pub height: i32,
    pub border_size: u16,
    pub max_error: f32,
}

#[derive(Default, Clone, Copy)]
struct ContourHole {
    contour: usize,
    min_x: u32,
    min_z: u32,
    leftmost_vertex: u32,
}

#[derive(Default, Clone)]
struct ContourRegion {
    outline: Option<usize>,
    holes: Vec<ContourHole>,
}

#[derive(Default, Clone, Copy)]
struct PotentialDiagonal {
    vertex: u32,
    distance: u32,
}

/// Traces and simplifies the boundary of every region in the open heightfield.
///
/// `max_error` is the maximum deviation of a simplified edge from the raw boundary in
/// voxels; `max_edge_length` splits long edges of the kinds selected by `build_flags`
/// (0 disables splitting).
pub fn build_contours(
    ctx: &mut BuildContext,
    open: &OpenHeightfield,
    max_error: f32,
    max_edge_length: u16,
    build_flags: ContourBuildFlags,
) -> ContourSet {
    let border = open.border_size as i32;
    let pad = open.border_size as f32 * open.cell_size;

    let mut contour_set = ContourSet {
        contours: Vec::with_capacity(open.max_regions.max(8) as usize),
        min_bounds: open.min_bounds + Vec3::new(pad, 0.0, pad),
        max_bounds: open.max_bounds - Vec3::new(pad, 0.0, pad),
        cell_size: open.cell_size,
        cell_height: open.cell_height,
        width: open.width - border * 2,
        height: open.height - border * 2,
        border_size: open.border_size,
        max_error,
    };

    // Mark boundaries: bit per direction where the neighbour belongs to another region.
    let mut boundary_flags = vec![0u8; open.span_count()];
    for (cell_index, cell) in open.cells.iter().enumerate() {
        for i in cell.span_range() {
            let span = &open.spans[i];
            if span.region == 0 || span.region & BORDER_REG != 0 {
                continue;
            }

            let mut connected = 0u8;
            for dir in 0..4 {
                let mut other_region = 0;
                if let Some(layer) = span.con(dir) {
                    other_region =
                        open.spans[open.neighbour_span_index(cell_index, dir, layer)].region;
                }

                if span.region == other_region {
                    connected |= 1 << dir;
                }
            }

            boundary_flags[i] = connected ^ 0b1111; // Flip so we mark unconnected sides.
        }
    }

    let mut raw_vertices = Vec::with_capacity(256);
    let mut simplified_vertices = Vec::with_capacity(64);

    for (cell_index, cell) in open.cells.iter().enumerate() {
        for i in cell.span_range() {
            if boundary_flags[i] == 0 || boundary_flags[i] == 0b1111 {
                boundary_flags[i] = 0;
                continue;
            }
            let span = &open.spans[i];
            if span.region == 0 || span.region & BORDER_REG != 0 {
                continue;
            }
            let Some(area) = open.areas[i] else {
                continue;
            };

            raw_vertices.clear();
            simplified_vertices.clear();

            walk_contour(cell_index, i, open, &mut boundary_flags, &mut raw_vertices);

            simplify_contour(
                &raw_vertices,
                &mut simplified_vertices,
                max_error,
                max_edge_length,
                build_flags,
            );
            remove_degenerate_segments(&mut simplified_vertices);

            if simplified_vertices.len() >= 3 {
                if border > 0 {
                    // Bring the vertices back into mesh space.
                    for vertex in simplified_vertices
                        .iter_mut()
                        .chain(raw_vertices.iter_mut())
                    {
                        vertex.x -= border as u32;
                        vertex.z -= border as u32;
                    }
                }

                contour_set.contours.push(Contour {
                    vertices: simplified_vertices.clone(),
                    raw_vertices: raw_vertices.clone(),
                    region: span.region,
                    area,
                });
            }
        }
    }

    // Merge holes into their region outlines.
    if !contour_set.contours.is_empty() {
        let mut num_holes = 0;
        let winding: Vec<i8> = contour_set
            .contours
            .iter()
            .map(|contour| {
                if calc_area_of_polygon_2d(&contour.vertices) < 0 {
                    num_holes += 1;
                    -1
                } else {
                    1
                }
            })
            .collect();

        if num_holes > 0 {
            let num_regions = contour_set
                .contours
                .iter()
                .map(|contour| contour.region)
                .max()
                .unwrap_or(0) as usize
                + 1;
            let mut regions = vec![ContourRegion::default(); num_regions];

            for (i, contour) in contour_set.contours.iter().enumerate() {
                let region = &mut regions[contour.region as usize];
                if winding[i] > 0 {
                    if region.outline.is_some() {
                        ctx.warn(format!(
                            "Region {} has more than one outline; keeping the first",
                            contour.region
                        ));
                    } else {
                        region.outline = Some(i);
                    }
                } else {
                    region.holes.push(ContourHole {
                        contour: i,
                        min_x: contour.vertices[0].x,
                        min_z: contour.vertices[0].z,
                        leftmost_vertex: 0,
                    });
                }
            }

            for region in regions.into_iter().filter(|region| !region.holes.is_empty()) {
                match region.outline {
                    Some(outline) => {
                        merge_region_holes(ctx, &mut contour_set.contours, region, outline)
                    }
                    None => {
                        let contour = region.holes[0].contour;
                        ctx.warn(format!(
                            "Region {} has holes but no outline; dropping its holes",
                            contour_set.contours[contour].region
                        ));
                    }
                }
            }
        }
    }

    contour_set
}

fn merge_region_holes(
    ctx: &mut BuildContext,
    contours: &mut [Contour],
    mut region: ContourRegion,
    outline_index: usize,
) {
    // Find the left-most vertex of every hole; that's the merge start.
    for hole in region.holes.iter_mut() {
        for (i, vertex) in contours[hole.contour].vertices.iter().enumerate() {
            if vertex.x < hole.min_x || (vertex.x == hole.min_x && vertex.z < hole.min_z) {
                hole.min_x = vertex.x;
                hole.min_z = vertex.z;
                hole.leftmost_vertex = i as u32;
            }
        }
    }

    region.holes.sort_by(|a, b| match a.min_x.cmp(&b.min_x) {
        Ordering::Equal => a.min_z.cmp(&b.min_z),
        ordering => ordering,
    });

    let max_vertices = contours[outline_index].vertices.len()
        + region
            .holes
            .iter()
            .map(|hole| contours[hole.contour].vertices.len())
            .sum::<usize>();
    let mut diagonals = Vec::with_capacity(max_vertices);

    let mut outline = std::mem::take(&mut contours[outline_index].vertices);

    for hole_index in 0..region.holes.len() {
        let hole = region.holes[hole_index];
        let hole_vertex_count = contours[hole.contour].vertices.len();

        let mut chosen = None;
        let mut best_vertex = hole.leftmost_vertex;

        for _ in 0..hole_vertex_count {
            // Find potential diagonals: outline vertices whose cone contains the hole
            // vertex, nearest first.
            diagonals.clear();
            let corner_vertex = contours[hole.contour].vertices[best_vertex as usize];
            for i in 0..outline.len() {
                if in_cone(i, &outline, corner_vertex) {
                    let delta_x = outline[i].x.abs_diff(corner_vertex.x);
                    let delta_z = outline[i].z.abs_diff(corner_vertex.z);
                    diagonals.push(PotentialDiagonal {
                        vertex: i as u32,
                        distance: delta_x * delta_x + delta_z * delta_z,
                    });
                }
            }
            diagonals.sort_by(|a, b| a.distance.cmp(&b.distance));

            // Take the shortest one that does not cross the outline or a hole.
            chosen = None;
            for potential in diagonals.iter() {
                let vertex = outline[potential.vertex as usize];
                let mut intersects = intersect_segment_contour(
                    vertex,
                    corner_vertex,
                    potential.vertex as usize,
                    &outline,
                );

                for other_hole in region.holes.iter().skip(hole_index) {
                    intersects |= intersect_segment_contour_no_vertex(
                        vertex,
                        corner_vertex,
                        &contours[other_hole.contour].vertices,
                    );

                    if intersects {
                        break;
                    }
                }

                if !intersects {
                    chosen = Some(potential.vertex);
                    break;
                }
            }

            if chosen.is_some() {
                break;
            }

            // All the potential diagonals for the current vertex were intersecting;
            // try the next vertex of the hole.
            best_vertex = (best_vertex + 1) % hole_vertex_count as u32;
        }

        let Some(chosen) = chosen else {
            ctx.warn(format!(
                "Failed to find a non-intersecting diagonal for a hole in region {}; \
                 skipping the hole",
                contours[outline_index].region
            ));
            continue;
        };

        outline = merge_contours(
            outline,
            &contours[hole.contour].vertices,
            chosen as usize,
            best_vertex as usize,
        );
        // The hole now lives inside the outline; retire its own contour.
        contours[hole.contour].vertices.clear();
    }

    contours[outline_index].vertices = outline;
}

/// Splices `source` into `target` through the diagonal `(index_a, index_b)`. Both
/// junction vertices are intentionally duplicated, forming the two new edges.
fn merge_contours(
    target: Vec<UVec4>,
    source: &[UVec4],
    index_a: usize,
    index_b: usize,
) -> Vec<UVec4> {
    let mut vertices = Vec::with_capacity(target.len() + source.len() + 2);

    for i in 0..=target.len() {
        vertices.push(target[(index_a + i) % target.len()]);
    }
    for i in 0..=source.len() {
        vertices.push(source[(index_b + i) % source.len()]);
    }

    vertices
}

fn calc_area_of_polygon_2d(vertices: &[UVec4]) -> i32 {
    let mut area = 0;
    for i in 0..vertices.len() {
        let previous = vertices[i].as_ivec4();
        let next = vertices[(i + 1) % vertices.len()].as_ivec4();

        area += next.x * previous.z - previous.x * next.z;
    }

    (area + 1) / 2
}

fn intersect_segment_contour(
    point: UVec4,
    corner: UVec4,
    diagonal_vertex: usize,
    outline_vertices: &[UVec4],
) -> bool {
    for i in 0..outline_vertices.len() {
        let next = (i + 1) % outline_vertices.len();

        if i == diagonal_vertex || next == diagonal_vertex {
            continue;
        }

        let point_i = outline_vertices[i];
        let point_next = outline_vertices[next];

        if (point.x == point_i.x && point.z == point_i.z)
            || (point_next.x == point_i.x && point_next.z == point_i.z)
            || (point_next.x == point.x && point_next.z == point.z)
        {
            continue;
        }

        if intersect(
            point.as_ivec4(),
            corner.as_ivec4(),
            point_i.as_ivec4(),
            point_next.as_ivec4(),
        ) {
            return true;
        }
    }

    false
}

fn intersect_segment_contour_no_vertex(
    point: UVec4,
    corner: UVec4,
    outline_vertices: &[UVec4],
) -> bool {
    for i in 0..outline_vertices.len() {
        let next = (i + 1) % outline_vertices.len();

        let point_i = outline_vertices[i];
        let point_next = outline_vertices[next];

        if (point.x == point_i.x && point.z == point_i.z)
            || (point_next.x == point_i.x && point_next.z == point_i.z)
            || (point_next.x == point.x && point_next.z == point.z)
        {
            continue;
        }

        if intersect(
            point.as_ivec4(),
            corner.as_ivec4(),
            point_i.as_ivec4(),
            point_next.as_ivec4(),
        ) {
            return true;
        }
    }

    false
}

fn walk_contour(
    mut cell_index: usize,
    mut span_index: usize,
    open: &OpenHeightfield,
    boundary_flags: &mut [u8],
    contour: &mut Vec<UVec4>,
) {
    let mut dir = 0usize;
    while boundary_flags[span_index] & (1 << dir) == 0 {
        dir += 1;
    }
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;
    let width = open.width as usize;

    let mut iterations = 0;
    while iterations < 40000 {
        iterations += 1;

        let span = &open.spans[span_index];
        if boundary_flags[span_index] & (1 << dir) != 0 {
            // Solid edge: emit a corner vertex.
            let column = cell_index % width;
            let row = cell_index / width;

            let (height, is_border_vertex) = get_corner_height(cell_index, span_index, dir, open);

            let mut region_info = 0u32;
            if let Some(layer) = span.con(dir) {
                let neighbour = open.neighbour_span_index(cell_index, dir, layer);
                region_info = open.spans[neighbour].region as u32;
                if open.areas[span_index] != open.areas[neighbour] {
                    region_info |= FLAG_AREA_BORDER;
                }
            }
            if is_border_vertex {
                region_info |= FLAG_BORDER_VERTEX;
            }

            let px = match dir {
                1 | 2 => column + 1,
                _ => column,
            } as u32;
            let py = height as u32;
            let pz = match dir {
                0 | 1 => row + 1,
                _ => row,
            } as u32;
            contour.push(UVec4::new(px, py, pz, region_info));

            boundary_flags[span_index] &= !(1 << dir);
            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            let Some(layer) = span.con(dir) else {
                panic!("Incorrectly flagged contour boundary! This should not happen.");
            };

            let neighbour_cell = get_neighbour_index(width, cell_index, dir);
            span_index = open.cells[neighbour_cell].index as usize + layer as usize;
            cell_index = neighbour_cell;
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_cell == cell_index && start_span == span_index && start_direction == dir {
            break;
        }
    }
}

/// Height of the corner between `dir` and `dir + 1`, plus whether the corner sits where
/// exactly two border regions meet two interior cells of one area (a border vertex).
fn get_corner_height(
    cell_index: usize,
    span_index: usize,
    dir: usize,
    open: &OpenHeightfield,
) -> (u16, bool) {
    let width = open.width as usize;
    let next_dir = (dir + 1) & 0x3;

    let area_key = |area: Option<Area>| area.map_or(0, |area| area.0 as u32) << 16;
    let span = &open.spans[span_index];
    let mut height = span.min;

    // Combined region + area keys of the four cells meeting at the corner.
    let mut regions = [0u32; 4];
    regions[0] = span.region as u32 | area_key(open.areas[span_index]);

    if let Some(layer) = span.con(dir) {
        let other_cell = get_neighbour_index(width, cell_index, dir);
        let other = open.cells[other_cell].index as usize + layer as usize;

        height = height.max(open.spans[other].min);
        regions[1] = open.spans[other].region as u32 | area_key(open.areas[other]);

        if let Some(layer) = open.spans[other].con(next_dir) {
            let diagonal_cell = get_neighbour_index(width, other_cell, next_dir);
            let diagonal = open.cells[diagonal_cell].index as usize + layer as usize;

            height = height.max(open.spans[diagonal].min);
            regions[2] = open.spans[diagonal].region as u32 | area_key(open.areas[diagonal]);
        }
    }

    if let Some(layer) = span.con(next_dir) {
        let other_cell = get_neighbour_index(width, cell_index, next_dir);
        let other = open.cells[other_cell].index as usize + layer as usize;

        height = height.max(open.spans[other].min);
        regions[3] = open.spans[other].region as u32 | area_key(open.areas[other]);

        if let Some(layer) = open.spans[other].con(dir) {
            let diagonal_cell = get_neighbour_index(width, other_cell, dir);
            let diagonal = open.cells[diagonal_cell].index as usize + layer as usize;

            height = height.max(open.spans[diagonal].min);
            regions[2] = open.spans[diagonal].region as u32 | area_key(open.areas[diagonal]);
        }
    }

    let border = BORDER_REG as u32;
    let mut is_border_vertex = false;
    for j in 0..4 {
        let a = j;
        let b = (j + 1) & 0x3;
        let c = (j + 2) & 0x3;
        let d = (j + 3) & 0x3;

        // The vertex is a border vertex when two consecutive cells are the same
        // exterior region and the opposite two are interior cells sharing an area.
        let two_same_exteriors = regions[a] & regions[b] & border != 0 && regions[a] == regions[b];
        let two_interiors = (regions[c] | regions[d]) & border == 0;
        let same_interior_areas = regions[c] >> 16 == regions[d] >> 16;
        let no_nulls =
            regions[a] != 0 && regions[b] != 0 && regions[c] != 0 && regions[d] != 0;
        if two_same_exteriors && two_interiors && same_interior_areas && no_nulls {
            is_border_vertex = true;
            break;
        }
    }

    (height, is_border_vertex)
}

fn simplify_contour(
    points: &[UVec4],
    simplified: &mut Vec<UVec4>,
    max_error: f32,
    max_edge_length: u16,
    build_flags: ContourBuildFlags,
) {
    let point_count = points.len() as u32;
    // A raw vertex pinned into the simplified loop, remembering its raw index in `w`.
    let pin = |index: u32| {
        let point = points[index as usize];
        UVec4::new(point.x, point.y, point.z, index)
    };

    // Portal edges must survive simplification exactly, so every vertex where the
    // neighbour region or the area side changes gets pinned. A contour without any
    // portals is pinned at its two lexicographic extremes instead.
    let has_portals = points.iter().any(|point| point.w & MASK_CONTOUR_REGION != 0);
    if has_portals {
        for (i, point) in points.iter().enumerate() {
            let next = points[(i + 1) % points.len()];
            let difference = point.w ^ next.w;
            if difference & (MASK_CONTOUR_REGION | FLAG_AREA_BORDER) != 0 {
                simplified.push(pin(i as u32));
            }
        }
    } else {
        let mut first = 0usize;
        let mut last = 0usize;
        for (i, point) in points.iter().enumerate() {
            if (point.x, point.z) < (points[first].x, points[first].z) {
                first = i;
            }
            if (point.x, point.z) > (points[last].x, points[last].z) {
                last = i;
            }
        }
        simplified.push(pin(first as u32));
        simplified.push(pin(last as u32));
    }

    // Refine: pull in the worst-offending raw vertex of each segment until every raw
    // vertex lies within the error tolerance. Only wall and area-transition edges are
    // refined; portal edges keep exactly their pinned endpoints.
    let mut i = 0;
    while i < simplified.len() {
        let from = simplified[i];
        let to = simplified[(i + 1) % simplified.len()];

        let first_raw = (from.w + 1) % point_count;
        let eligible = points[first_raw as usize].w & MASK_CONTOUR_REGION == 0
            || points[first_raw as usize].w & FLAG_AREA_BORDER != 0;

        let mut worst: Option<(f32, u32)> = None;
        if eligible {
            // Both regions sharing an edge walk it, each from its own end. Normalizing
            // the tie-break to the segment's lexicographic direction makes the two
            // walks pull in the same vertex.
            let keep_later_ties = !lexicographically_forward(from, to);
            let segment_from = IVec2::new(from.x as i32, from.z as i32);
            let segment_to = IVec2::new(to.x as i32, to.z as i32);

            let mut raw = first_raw;
            while raw != to.w {
                let point = points[raw as usize];
                let deviation = point_distance_from_segment(
                    IVec2::new(point.x as i32, point.z as i32),
                    segment_from,
                    segment_to,
                );
                let improves = match worst {
                    None => deviation > 0.0,
                    Some((worst_deviation, _)) => {
                        deviation > worst_deviation
                            || (keep_later_ties && deviation == worst_deviation)
                    }
                };
                if improves {
                    worst = Some((deviation, raw));
                }
                raw = (raw + 1) % point_count;
            }
        }

        match worst {
            Some((deviation, raw)) if deviation > max_error * max_error => {
                simplified.insert(i + 1, pin(raw));
            }
            _ => i += 1,
        }
    }

    // Subdivide edges that exceed the configured maximum length, where asked to.
    if max_edge_length > 0
        && build_flags
            .intersects(ContourBuildFlags::TESS_WALL_EDGES | ContourBuildFlags::TESS_AREA_EDGES)
    {
        let max_length_squared = max_edge_length as u32 * max_edge_length as u32;

        let mut i = 0;
        while i < simplified.len() {
            let from = simplified[i];
            let to = simplified[(i + 1) % simplified.len()];

            let first_raw = ((from.w + 1) % point_count) as usize;
            let eligible = (build_flags.contains(ContourBuildFlags::TESS_WALL_EDGES)
                && points[first_raw].w & MASK_CONTOUR_REGION == 0)
                || (build_flags.contains(ContourBuildFlags::TESS_AREA_EDGES)
                    && points[first_raw].w & FLAG_AREA_BORDER != 0);

            let mut split_at = None;
            if eligible {
                let delta_x = to.x.abs_diff(from.x);
                let delta_z = to.z.abs_diff(from.z);
                if delta_x * delta_x + delta_z * delta_z > max_length_squared {
                    // Number of raw vertices the edge spans.
                    let raw_span = if to.w < from.w {
                        to.w + point_count - from.w
                    } else {
                        to.w - from.w
                    };
                    if raw_span > 1 {
                        // The cut lands on the same raw vertex from either side of a
                        // shared edge: round towards the lexicographic start.
                        let half = if lexicographically_forward(from, to) {
                            raw_span / 2
                        } else {
                            raw_span.div_ceil(2)
                        };
                        split_at = Some((from.w + half) % point_count);
                    }
                }
            }

            match split_at {
                Some(raw) => simplified.insert(i + 1, pin(raw)),
                None => i += 1,
            }
        }
    }

    for vertex in simplified.iter_mut() {
        // Neighbour info travels with the edge leaving a vertex, which in raw terms is
        // the next raw point; the border-vertex flag belongs to the vertex itself.
        let leaving = (vertex.w + 1) % point_count;
        let own = vertex.w;
        vertex.w = (points[leaving as usize].w & (MASK_CONTOUR_REGION | FLAG_AREA_BORDER))
            | (points[own as usize].w & FLAG_BORDER_VERTEX);
    }
}

/// Whether `from -> to` runs in ascending lexicographic (x, then z) order.
fn lexicographically_forward(from: UVec4, to: UVec4) -> bool {
    (to.x, to.z) > (from.x, from.z)
}

pub(crate) fn point_distance_from_segment(point: IVec2, seg_a: IVec2, seg_b: IVec2) -> f32 {
    let segment_delta = (seg_b - seg_a).as_vec2();
    let point_delta = (point - seg_a).as_vec2();

    let d = segment_delta.x * segment_delta.x + segment_delta.y * segment_delta.y;
    let mut t = segment_delta.x * point_delta.x + segment_delta.y * point_delta.y;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let delta_x = seg_a.x as f32 + t * segment_delta.x - point.x as f32;
    let delta_y = seg_a.y as f32 + t * segment_delta.y - point.y as f32;

    delta_x * delta_x + delta_y * delta_y
}

fn remove_degenerate_segments(simplified: &mut Vec<UVec4>) {
    // Remove adjacent vertices which are equal on the xz-plane.
    let mut i = 0;
    while i < simplified.len() {
        let next = (i + 1) % simplified.len();

        let a = simplified[i];
        let b = simplified[next];

        if a.x == b.x && a.z == b.z {
            simplified.remove(i);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heightfields::{calculate_distance_field, rasterize_triangles, Heightfield},
        regions::build_regions_monotone,
    };
    use glam::uvec3;

    fn open_plane(size: f32, hole: bool) -> OpenHeightfield {
        let mut heightfield =
            Heightfield::new(Vec3::ZERO, Vec3::new(size, 5.0, size), 1.0, 1.0).unwrap();
        let vertices = [
            Vec3::new(0.0, 0.4, 0.0),
            Vec3::new(size, 0.4, 0.0),
            Vec3::new(size, 0.4, size),
            Vec3::new(0.0, 0.4, size),
        ];
        let triangles = [uvec3(0, 2, 1), uvec3(0, 3, 2)];
        rasterize_triangles(
            &mut heightfield,
            &vertices,
            &triangles,
            &[Some(Area::WALKABLE); 2],
            1,
        );

        let mut ctx = BuildContext::new();
        let mut open = OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1);

        if hole {
            // Punch a 2x2 unwalkable hole into the middle.
            let mid = size as i32 / 2;
            for z in mid - 1..=mid {
                for x in mid - 1..=mid {
                    let cell = open.cells[(x + z * open.width) as usize];
                    for i in cell.span_range() {
                        open.areas[i] = None;
                    }
                }
            }
        }

        calculate_distance_field(&mut open);
        open
    }

    fn closed_and_positive(contour: &Contour) {
        assert!(contour.vertices.len() >= 3);
        assert!(
            calc_area_of_polygon_2d(&contour.vertices) > 0,
            "contour winding is not counter-clockwise"
        );
    }

    #[test]
    fn plane_produces_one_square_contour() {
        let mut ctx = BuildContext::new();
        let mut open = open_plane(8.0, false);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();

        let contour_set = build_contours(
            &mut ctx,
            &open,
            1.3,
            0,
            ContourBuildFlags::TESS_WALL_EDGES,
        );

        assert_eq!(contour_set.contours.len(), 1);
        let contour = &contour_set.contours[0];
        closed_and_positive(contour);
        // A flat square simplifies to its four corners.
        assert_eq!(contour.vertices.len(), 4);
        assert_eq!(contour.area, Area::WALKABLE);
        assert_ne!(contour.region, 0);
        // The raw boundary walks every cell edge of the 8x8 square.
        assert_eq!(contour.raw_vertices.len(), 32);
    }

    #[test]
    fn long_edges_are_subdivided() {
        let mut ctx = BuildContext::new();
        let mut open = open_plane(8.0, false);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();

        let contour_set = build_contours(
            &mut ctx,
            &open,
            1.3,
            4,
            ContourBuildFlags::TESS_WALL_EDGES,
        );

        // Each 8-voxel edge splits once.
        assert_eq!(contour_set.contours[0].vertices.len(), 8);

        // With tessellation flags cleared the corners are all that remains.
        let contour_set = build_contours(&mut ctx, &open, 1.3, 4, ContourBuildFlags::empty());
        assert_eq!(contour_set.contours[0].vertices.len(), 4);
    }

    #[test]
    fn hole_is_merged_into_the_outline() {
        let mut ctx = BuildContext::new();
        let mut open = open_plane(10.0, true);

        // One region wrapped around the hole, assigned by hand so the test does not
        // depend on how a partitioning strategy happens to slice the ring.
        for i in 0..open.span_count() {
            if open.areas[i].is_some() {
                open.spans[i].region = 1;
            }
        }
        open.max_regions = 1;

        let contour_set = build_contours(
            &mut ctx,
            &open,
            1.3,
            0,
            ContourBuildFlags::TESS_WALL_EDGES,
        );

        let live: Vec<&Contour> = contour_set
            .contours
            .iter()
            .filter(|contour| contour.vertices.len() >= 3)
            .collect();
        assert_eq!(live.len(), 1, "hole contour should be merged away");

        let merged = live[0];
        closed_and_positive(merged);
        // Outline corners plus the spliced-in hole plus the two duplicated junction
        // vertices.
        assert!(merged.vertices.len() > 8);
    }

    #[test]
    fn area_transitions_are_flagged_on_contour_vertices() {
        let mut ctx = BuildContext::new();
        let mut open = open_plane(8.0, false);

        // Split the plane into two area types down the middle.
        for (cell_index, cell) in open.cells.clone().iter().enumerate() {
            let x = cell_index as i32 % open.width;
            for i in cell.span_range() {
                open.areas[i] = Some(if x < 4 { Area(7) } else { Area(21) });
            }
        }
        calculate_distance_field(&mut open);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();

        let contour_set =
            build_contours(&mut ctx, &open, 1.3, 0, ContourBuildFlags::TESS_WALL_EDGES);

        // One contour per area, joined along a flagged area border.
        assert_eq!(contour_set.contours.len(), 2);
        let mut areas: Vec<Area> = contour_set
            .contours
            .iter()
            .map(|contour| contour.area)
            .collect();
        areas.sort();
        assert_eq!(areas, vec![Area(7), Area(21)]);

        for contour in &contour_set.contours {
            assert!(
                contour
                    .raw_vertices
                    .iter()
                    .any(|vertex| vertex.w & FLAG_AREA_BORDER != 0),
                "region {} lost its area border flags",
                contour.region
            );
        }
    }

    #[test]
    fn contour_heights_follow_the_floor() {
        let mut ctx = BuildContext::new();
        let mut open = open_plane(8.0, false);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();

        let contour_set =
            build_contours(&mut ctx, &open, 1.3, 0, ContourBuildFlags::TESS_WALL_EDGES);

        // The plane floor sits at voxel 1 everywhere.
        for vertex in &contour_set.contours[0].vertices {
            assert_eq!(vertex.y, 1);
        }
    }
}
