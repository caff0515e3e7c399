//! Detail mesh construction: per polygon, samples the true ground height out of the
//! open heightfield and triangulates a height-accurate patch over the polygon.
//!
//! The polygon mesh is exact on the xz-plane but flattens each polygon to one plane;
//! on bumpy ground that can float or bury the surface. The detail mesh fixes that by
//! sampling the height-field along polygon edges and across their interiors, inserting
//! vertices wherever the vertical error exceeds the configured tolerance.

use glam::{U16Vec3, Vec3, Vec3Swizzles};

use crate::{
    heightfields::OpenHeightfield,
    math::{dir_offset_x, dir_offset_z},
    mesher::PolyMesh,
    BuildContext, MESH_NULL_IDX, MULTIPLE_REGS,
};

const MAX_VERTS: usize = 127;
const MAX_VERTS_PER_EDGE: usize = 32;
const RETRACT_SIZE: usize = 256;
const UNSET_HEIGHT: u16 = 0xffff;

const EV_UNDEF: u32 = u32::MAX;
const EV_HULL: u32 = u32::MAX - 1;

/// One polygon's slice of a [`PolyMeshDetail`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMesh {
    pub vertex_base: usize,
    pub vertex_count: usize,
    pub triangle_base: usize,
    pub triangle_count: usize,
}

/// A triangle of a detail sub-mesh, indexing the sub-mesh's local vertex range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailTriangle {
    pub vertices: [u8; 3],
    /// Two bits per edge; bit set when edge `n` (vertices `n` to `n + 1`) lies on the
    /// parent polygon's boundary.
    pub edge_flags: u8,
}

impl DetailTriangle {
    /// Whether edge `edge` (0..=2) of the triangle lies on the parent polygon boundary.
    #[inline]
    pub fn edge_on_polygon_boundary(&self, edge: usize) -> bool {
        (self.edge_flags >> (edge * 2)) & 0x1 == 1
    }
}

/// Height-accurate triangulations of every polygon of a [`PolyMesh`], in world space.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct PolyMeshDetail {
    /// One sub-mesh per polygon, indexing into `vertices` and `triangles`.
    pub meshes: Vec<SubMesh>,
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<DetailTriangle>,
}

/// Rectangular window of ground heights copied out of the open heightfield.
#[derive(Default, Debug)]
struct HeightPatch {
    data: Vec<u16>,
    xmin: i32,
    zmin: i32,
    width: i32,
    height: i32,
}

impl HeightPatch {
    #[inline]
    fn len(&self) -> usize {
        (self.width * self.height) as usize
    }

    #[inline]
    fn height_at(&self, x: i32, z: i32) -> u16 {
        self.data[(x + z * self.width) as usize]
    }

    #[inline]
    fn set_height(&mut self, x: i32, z: i32, height: u16) {
        self.data[(x + z * self.width) as usize] = height;
    }
}

/// Builds the detail mesh for `mesh`, sampling heights from `open`.
///
/// `sample_distance` is the sampling step in world units; `sample_max_error` the
/// maximum tolerated vertical distance between the detail surface and the
/// height-field.
pub fn build_poly_mesh_detail(
    ctx: &mut BuildContext,
    mesh: &PolyMesh,
    open: &OpenHeightfield,
    sample_distance: f32,
    sample_max_error: f32,
) -> PolyMeshDetail {
    let mut detail = PolyMeshDetail::default();
    if mesh.vertices.is_empty() || mesh.polygon_count() == 0 {
        return detail;
    }

    let cell_size = mesh.cell_size;
    let cell_height = mesh.cell_height;
    let origin = mesh.min_bounds;
    let border_size = mesh.border_size as i32;
    let height_search_radius = 1.max(mesh.max_edge_error.ceil() as i32);

    let mut queue: Vec<(i32, i32, usize)> = Vec::with_capacity(512);
    let mut edges: Vec<u32> = Vec::with_capacity(64);
    let mut tris: Vec<[u32; 3]> = Vec::with_capacity(256);
    let mut samples: Vec<[i32; 4]> = Vec::with_capacity(256);
    let mut verts: Vec<Vec3> = Vec::with_capacity(256);
    let mut poly: Vec<Vec3> = Vec::with_capacity(mesh.vertices_per_polygon);

    // Find the bounds of each polygon and the largest patch any of them needs.
    let mut bounds = Vec::with_capacity(mesh.polygon_count());
    let mut max_patch_width = 0;
    let mut max_patch_height = 0;
    for i in 0..mesh.polygon_count() {
        let mut xmin = open.width;
        let mut xmax = 0;
        let mut zmin = open.height;
        let mut zmax = 0;
        for &vertex in mesh.polygon_vertices(i) {
            if vertex == MESH_NULL_IDX {
                break;
            }
            let v = mesh.vertices[vertex as usize];
            xmin = xmin.min(v.x as i32);
            xmax = xmax.max(v.x as i32);
            zmin = zmin.min(v.z as i32);
            zmax = zmax.max(v.z as i32);
        }
        xmin = 0.max(xmin - 1);
        xmax = open.width.min(xmax + 1);
        zmin = 0.max(zmin - 1);
        zmax = open.height.min(zmax + 1);
        bounds.push((xmin, xmax, zmin, zmax));
        if xmin >= xmax || zmin >= zmax {
            continue;
        }
        max_patch_width = max_patch_width.max(xmax - xmin);
        max_patch_height = max_patch_height.max(zmax - zmin);
    }

    let mut patch = HeightPatch {
        data: vec![0; (max_patch_width * max_patch_height) as usize],
        ..Default::default()
    };

    detail.meshes.reserve(mesh.polygon_count());

    for i in 0..mesh.polygon_count() {
        // Store polygon vertices for processing.
        poly.clear();
        for &vertex in mesh.polygon_vertices(i) {
            if vertex == MESH_NULL_IDX {
                break;
            }
            let v = mesh.vertices[vertex as usize];
            poly.push(Vec3::new(
                v.x as f32 * cell_size,
                v.y as f32 * cell_height,
                v.z as f32 * cell_size,
            ));
        }

        // Get the height data from the area of the polygon.
        let (xmin, xmax, zmin, zmax) = bounds[i];
        patch.xmin = xmin;
        patch.zmin = zmin;
        patch.width = xmax - xmin;
        patch.height = zmax - zmin;
        get_height_data(
            open,
            mesh.polygon_vertices(i),
            &mesh.vertices,
            border_size,
            &mut patch,
            &mut queue,
            mesh.regions[i],
        );

        // Build detail mesh.
        build_poly_detail(
            ctx,
            &poly,
            sample_distance,
            sample_max_error,
            height_search_radius,
            open,
            &patch,
            &mut verts,
            &mut tris,
            &mut edges,
            &mut samples,
        );

        // Move detail verts to world space.
        for vertex in verts.iter_mut() {
            *vertex += origin;
        }
        // Offset poly too, for the edge flag checks below.
        for vertex in poly.iter_mut() {
            *vertex += origin;
        }

        // Store the sub-mesh.
        detail.meshes.push(SubMesh {
            vertex_base: detail.vertices.len(),
            vertex_count: verts.len(),
            triangle_base: detail.triangles.len(),
            triangle_count: tris.len(),
        });
        detail.vertices.extend_from_slice(&verts);
        for triangle in &tris {
            let (a, b, c) = (
                triangle[0] as usize,
                triangle[1] as usize,
                triangle[2] as usize,
            );
            detail.triangles.push(DetailTriangle {
                vertices: [a as u8, b as u8, c as u8],
                edge_flags: get_tri_flags(verts[a], verts[b], verts[c], &poly),
            });
        }
    }

    detail
}

/// Fills `patch` with ground heights for one polygon.
///
/// Spans belonging to the polygon's region are copied directly, with region-boundary
/// spans queued as seeds; a breadth-first flood then fills the rest of the patch
/// without crossing into other regions' floors.
fn get_height_data(
    open: &OpenHeightfield,
    poly: &[u16],
    mesh_vertices: &[U16Vec3],
    border_size: i32,
    patch: &mut HeightPatch,
    queue: &mut Vec<(i32, i32, usize)>,
    region: u16,
) {
    // Note: reads to the open heightfield are offset by the border size, since the
    // border was already cropped from the polymesh vertices.
    queue.clear();
    let patch_len = patch.len();
    patch.data[..patch_len].fill(UNSET_HEIGHT);

    let mut empty = true;

    // We cannot sample from this poly if it was created from polys of different
    // regions. If it was then it could potentially be overlapping with polys of that
    // region and the heights sampled here could be wrong.
    if region != MULTIPLE_REGS {
        // Copy the height from the same region, and mark region borders as seed points
        // to fill in the rest.
        for hz in 0..patch.height {
            let z = patch.zmin + hz + border_size;
            for hx in 0..patch.width {
                let x = patch.xmin + hx + border_size;
                let cell_index = (x + z * open.width) as usize;
                for i in open.cells[cell_index].span_range() {
                    if open.spans[i].region != region {
                        continue;
                    }

                    patch.set_height(hx, hz, open.spans[i].min);
                    empty = false;

                    // If any of the neighbours is not in same region, add the current
                    // location as a flood fill start.
                    let border = (0..4).any(|dir| {
                        open.spans[i].con(dir).is_some_and(|layer| {
                            let neighbour = open.neighbour_span_index(cell_index, dir, layer);
                            open.spans[neighbour].region != region
                        })
                    });
                    if border {
                        queue.push((x, z, i));
                    }
                    break;
                }
            }
        }
    }

    // If the polygon does not contain any points from the current region (rare, but
    // happens), or if it could potentially be overlapping polygons of the same region,
    // then seed from the polygon center instead.
    if empty {
        seed_array_with_poly_center(open, poly, mesh_vertices, border_size, patch, queue);
    }

    // Flood the patch breadth-first from the seeds. The queue retracts in blocks so
    // long floods don't keep every visited entry alive.
    let mut head = 0;
    while head < queue.len() {
        let (x, z, i) = queue[head];
        head += 1;
        if head >= RETRACT_SIZE {
            queue.drain(..RETRACT_SIZE);
            head = 0;
        }

        let span = open.spans[i];
        let cell_index = (x + z * open.width) as usize;
        for dir in 0..4 {
            let Some(layer) = span.con(dir) else {
                continue;
            };

            let neighbour_x = x + dir_offset_x(dir);
            let neighbour_z = z + dir_offset_z(dir);
            let hx = neighbour_x - patch.xmin - border_size;
            let hz = neighbour_z - patch.zmin - border_size;

            if hx < 0 || hz < 0 || hx >= patch.width || hz >= patch.height {
                continue;
            }
            if patch.height_at(hx, hz) != UNSET_HEIGHT {
                continue;
            }

            let neighbour = open.neighbour_span_index(cell_index, dir, layer);
            patch.set_height(hx, hz, open.spans[neighbour].min);
            queue.push((neighbour_x, neighbour_z, neighbour));
        }
    }
}

#[inline]
fn get_dir_for_offset(x: i32, z: i32) -> usize {
    const DIRS: [usize; 5] = [3, 0, 0, 2, 1];
    DIRS[(((z + 1) << 1) + x) as usize]
}

/// Walks from the cell nearest a polygon vertex towards the polygon centroid along the
/// span graph; the cell the walk ends on seeds the height patch.
fn seed_array_with_poly_center(
    open: &OpenHeightfield,
    poly: &[u16],
    mesh_vertices: &[U16Vec3],
    border_size: i32,
    patch: &mut HeightPatch,
    queue: &mut Vec<(i32, i32, usize)>,
) {
    const OFFSET: [(i32, i32); 9] = [
        (0, 0),
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let npoly = poly
        .iter()
        .take_while(|vertex| **vertex != MESH_NULL_IDX)
        .count();

    // Find the cell closest to a polygon vertex.
    let mut start = None;
    let mut min_height_diff = i32::MAX;
    'vertices: for &vertex in poly[..npoly].iter() {
        let v = mesh_vertices[vertex as usize];
        for (offset_x, offset_z) in OFFSET {
            let ax = v.x as i32 + offset_x;
            let ay = v.y as i32;
            let az = v.z as i32 + offset_z;

            if ax < patch.xmin
                || ax >= patch.xmin + patch.width
                || az < patch.zmin
                || az >= patch.zmin + patch.height
            {
                continue;
            }

            let cell_index = ((ax + border_size) + (az + border_size) * open.width) as usize;
            for i in open.cells[cell_index].span_range() {
                let height_diff = (ay - open.spans[i].min as i32).abs();
                if height_diff < min_height_diff {
                    start = Some((ax, az, i));
                    min_height_diff = height_diff;

                    if min_height_diff == 0 {
                        break 'vertices;
                    }
                }
            }
        }
    }

    let Some((mut cx, mut cz, mut ci)) = start else {
        return;
    };

    // Find the center of the polygon.
    let pcx = poly[..npoly]
        .iter()
        .map(|vertex| mesh_vertices[*vertex as usize].x as i32)
        .sum::<i32>()
        / npoly as i32;
    let pcz = poly[..npoly]
        .iter()
        .map(|vertex| mesh_vertices[*vertex as usize].z as i32)
        .sum::<i32>()
        / npoly as i32;

    // Use the seed queue as a stack for a DFS towards the center, reusing the patch
    // data as the visited set. We cannot just move in a straight line towards the
    // center: contour simplification can pinch the walkable strip so that only a walk
    // along the span graph gets there.
    queue.clear();
    queue.push((cx, cz, ci));

    let mut dirs = [0usize, 1, 2, 3];
    let patch_len = patch.len();
    patch.data[..patch_len].fill(0);

    loop {
        let Some((x, z, i)) = queue.pop() else {
            tracing::warn!("Walk towards polygon center failed to reach the center");
            break;
        };
        cx = x;
        cz = z;
        ci = i;

        if cx == pcx && cz == pcz {
            break;
        }

        // If we are already at the correct x position, prefer the direction straight
        // towards the center; otherwise close the x gap first.
        let direct_dir = if cx == pcx {
            get_dir_for_offset(0, if pcz > cz { 1 } else { -1 })
        } else {
            get_dir_for_offset(if pcx > cx { 1 } else { -1 }, 0)
        };

        // Push the direct dir last so we start with this on the next iteration.
        dirs.swap(direct_dir, 3);

        let span = open.spans[ci];
        for &dir in dirs.iter() {
            let Some(layer) = span.con(dir) else {
                continue;
            };

            let new_x = cx + dir_offset_x(dir);
            let new_z = cz + dir_offset_z(dir);
            let hx = new_x - patch.xmin;
            let hz = new_z - patch.zmin;
            if hx < 0 || hz < 0 || hx >= patch.width || hz >= patch.height {
                continue;
            }
            if patch.height_at(hx, hz) != 0 {
                continue;
            }

            patch.set_height(hx, hz, 1);
            let cell_index = ((new_x + border_size) + (new_z + border_size) * open.width) as usize;
            queue.push((
                new_x,
                new_z,
                open.cells[cell_index].index as usize + layer as usize,
            ));
        }

        dirs.swap(direct_dir, 3);
    }

    // The walk's endpoint becomes the sole seed. The flood queue works in
    // border-inclusive coordinates.
    queue.clear();
    queue.push((cx + border_size, cz + border_size, ci));

    patch.data[..patch_len].fill(UNSET_HEIGHT);
    patch.set_height(cx - patch.xmin, cz - patch.zmin, open.spans[ci].min);
}

/// Tessellates one polygon against the height patch.
///
/// `verts` receives the polygon corners plus any edge and interior samples; `tris` the
/// triangulation over them, as indices into `verts`.
#[allow(clippy::too_many_arguments)]
fn build_poly_detail(
    ctx: &mut BuildContext,
    poly_in: &[Vec3],
    sample_distance: f32,
    sample_max_error: f32,
    height_search_radius: i32,
    open: &OpenHeightfield,
    patch: &HeightPatch,
    verts: &mut Vec<Vec3>,
    tris: &mut Vec<[u32; 3]>,
    edges: &mut Vec<u32>,
    samples: &mut Vec<[i32; 4]>,
) {
    let mut edge_buf = [Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];
    let mut hull: Vec<usize> = Vec::with_capacity(MAX_VERTS);

    verts.clear();
    verts.extend_from_slice(poly_in);
    edges.clear();
    tris.clear();

    let cell_size = open.cell_size;
    let inverse_cell_size = 1.0 / cell_size;
    let cell_height = open.cell_height;
    let nin = poly_in.len();

    let min_extent = poly_min_extent(verts);

    // Tessellate the outlines. This is done in a separate pass to ensure seamless
    // height values across polygon boundaries.
    if sample_distance > 0.0 {
        for i in 0..nin {
            let j = (i + nin - 1) % nin;
            let mut vj = poly_in[j];
            let mut vi = poly_in[i];
            let mut swapped = false;

            // Make sure the segments are always handled in same order using
            // lexicographic sort or else there will be seams.
            if (vj.x - vi.x).abs() < 1e-6 {
                if vj.z > vi.z {
                    std::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }
            } else if vj.x > vi.x {
                std::mem::swap(&mut vj, &mut vi);
                swapped = true;
            }

            // Create samples along the edge.
            let delta = vi - vj;
            let d = (delta.x * delta.x + delta.z * delta.z).sqrt();
            let mut nn = 1 + (d / sample_distance).floor() as usize;
            if nn >= MAX_VERTS_PER_EDGE {
                nn = MAX_VERTS_PER_EDGE - 1;
            }
            if verts.len() + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len());
            }
            if nn == 0 {
                hull.push(j);
                continue;
            }

            for (k, slot) in edge_buf.iter_mut().enumerate().take(nn + 1) {
                let t = k as f32 / nn as f32;
                let mut pos = vj + delta * t;
                pos.y = get_height(
                    pos.x,
                    pos.y,
                    pos.z,
                    inverse_cell_size,
                    cell_height,
                    height_search_radius,
                    patch,
                ) as f32
                    * cell_height;
                *slot = pos;
            }

            // Simplify samples.
            let mut idx = vec![0usize, nn];
            let mut k = 0;
            while k < idx.len() - 1 {
                let a = idx[k];
                let b = idx[k + 1];

                // Find maximum deviation along the segment.
                let mut max_deviation = 0.0;
                let mut max_i = None;
                for m in a + 1..b {
                    let deviation =
                        distance_point_segment(edge_buf[m], edge_buf[a], edge_buf[b]);
                    if deviation > max_deviation {
                        max_deviation = deviation;
                        max_i = Some(m);
                    }
                }

                // If the max deviation is larger than accepted error, add a new point,
                // else continue to next segment.
                match max_i {
                    Some(max_i) if max_deviation > sample_max_error * sample_max_error => {
                        idx.insert(k + 1, max_i);
                    }
                    _ => k += 1,
                }
            }

            hull.push(j);

            // Add new vertices in the direction the edge is walked by this polygon.
            if swapped {
                for &ki in idx.iter().rev().skip(1).take(idx.len().saturating_sub(2)) {
                    verts.push(edge_buf[ki]);
                    hull.push(verts.len() - 1);
                }
            } else {
                for &ki in idx.iter().skip(1).take(idx.len().saturating_sub(2)) {
                    verts.push(edge_buf[ki]);
                    hull.push(verts.len() - 1);
                }
            }
        }
    } else {
        for i in 0..nin {
            hull.push((i + nin - 1) % nin);
        }
    }

    // If the polygon minimum extent is small (sliver or small triangle), do not try to
    // add internal points.
    if min_extent < sample_distance * 2.0 {
        triangulate_hull(verts, &hull, nin, tris);
        return;
    }

    // Tessellate the base mesh. Hull triangulation handles long thin triangles better
    // than the Delaunay pass when there are no internal points yet.
    triangulate_hull(verts, &hull, nin, tris);
    if tris.is_empty() {
        // Could not triangulate the poly, make sure there is some valid data there.
        ctx.warn(format!(
            "Could not triangulate a polygon of {} vertices; its detail mesh stays flat",
            verts.len()
        ));
        return;
    }

    if sample_distance > 0.0 {
        // Create sample locations in a grid.
        let (bmin, bmax) = poly_in
            .iter()
            .fold((poly_in[0], poly_in[0]), |(min, max), v| {
                (min.min(*v), max.max(*v))
            });
        let x0 = (bmin.x / sample_distance).floor() as i32;
        let x1 = (bmax.x / sample_distance).ceil() as i32;
        let z0 = (bmin.z / sample_distance).floor() as i32;
        let z1 = (bmax.z / sample_distance).ceil() as i32;

        samples.clear();
        for z in z0..z1 {
            for x in x0..x1 {
                let point = Vec3::new(
                    x as f32 * sample_distance,
                    (bmax.y + bmin.y) * 0.5,
                    z as f32 * sample_distance,
                );

                // Make sure the samples are not too close to the edges.
                if dist_to_poly(poly_in, point) > -sample_distance / 2.0 {
                    continue;
                }

                let y = get_height(
                    point.x,
                    point.y,
                    point.z,
                    inverse_cell_size,
                    cell_height,
                    height_search_radius,
                    patch,
                );
                samples.push([x, y as i32, z, 0]);
            }
        }

        // Add the samples starting from the one that has the most error. The procedure
        // stops when all samples are added or when the max error is within the
        // threshold.
        let sample_count = samples.len();
        for _ in 0..sample_count {
            if verts.len() >= MAX_VERTS {
                break;
            }

            // Find the sample with the most error.
            let mut best_point = Vec3::ZERO;
            let mut best_distance = 0.0;
            let mut best_index = None;
            for (i, sample) in samples.iter().enumerate() {
                if sample[3] != 0 {
                    continue; // skip added
                }

                // The sample location is jittered to get rid of some bad triangulations
                // which are caused by symmetrical data from the grid structure.
                let point = Vec3::new(
                    sample[0] as f32 * sample_distance + jitter_x(i) * cell_size * 0.1,
                    sample[1] as f32 * cell_height,
                    sample[2] as f32 * sample_distance + jitter_z(i) * cell_size * 0.1,
                );
                let Some(distance) = dist_to_tri_mesh(point, verts, tris) else {
                    continue; // did not hit the mesh
                };
                if distance > best_distance {
                    best_distance = distance;
                    best_index = Some(i);
                    best_point = point;
                }
            }

            let Some(best_index) = best_index else {
                break;
            };
            if best_distance <= sample_max_error {
                break;
            }

            // Mark sample as added.
            samples[best_index][3] = 1;
            verts.push(best_point);

            // Create new triangulation. Full rebuild.
            edges.clear();
            tris.clear();
            delaunay_hull(verts, &hull, tris, edges);
        }
    }

    if tris.is_empty() {
        // The Delaunay pass ate every face; fall back to the plain hull triangulation.
        triangulate_hull(verts, &hull, nin, tris);
    }
}

fn jitter_x(i: usize) -> f32 {
    (((i as u32).wrapping_mul(0x8da6b343) & 0xffff) as f32 / 65535.0) * 2.0 - 1.0
}

fn jitter_z(i: usize) -> f32 {
    (((i as u32).wrapping_mul(0xd8163841) & 0xffff) as f32 / 65535.0) * 2.0 - 1.0
}

/// Ground height at a world-space position, in voxels.
///
/// When the addressed patch cell has no height, the adjacent cells are walked in a
/// spiral up to `radius`, keeping the ring-closest height nearest to `fy`.
fn get_height(
    fx: f32,
    fy: f32,
    fz: f32,
    inverse_cell_size: f32,
    cell_height: f32,
    radius: i32,
    patch: &HeightPatch,
) -> u16 {
    let ix = ((fx * inverse_cell_size + 0.01).floor() as i32 - patch.xmin)
        .clamp(0, patch.width - 1);
    let iz = ((fz * inverse_cell_size + 0.01).floor() as i32 - patch.zmin)
        .clamp(0, patch.height - 1);
    let mut height = patch.height_at(ix, iz);

    if height == UNSET_HEIGHT {
        // Special case when data might be bad: walk adjacent cells in a spiral up to
        // `radius`, looking for a cell with valid height data.
        let (mut x, mut z, mut dx, mut dz) = (1i32, 0i32, 1i32, 0i32);
        let max_size = radius * 2 + 1;
        let max_iterations = max_size * max_size - 1;

        let mut next_ring_iter_start = 8;
        let mut next_ring_iters = 16;

        let mut min_distance = f32::MAX;
        for i in 0..max_iterations {
            let nx = ix + x;
            let nz = iz + z;

            if nx >= 0 && nz >= 0 && nx < patch.width && nz < patch.height {
                let nh = patch.height_at(nx, nz);
                if nh != UNSET_HEIGHT {
                    let d = (nh as f32 * cell_height - fy).abs();
                    if d < min_distance {
                        height = nh;
                        min_distance = d;
                    }
                }
            }

            // We are searching in a grid which looks approximately like this:
            //  __________
            // |2 ______ 2|
            // | |1 __ 1| |
            // | | |__| | |
            // | |______| |
            // |__________|
            // We want the height as close to the center cell as possible: once a ring
            // yielded a height, the search stops at that ring's end.
            if i + 1 == next_ring_iter_start {
                if height != UNSET_HEIGHT {
                    break;
                }
                next_ring_iter_start += next_ring_iters;
                next_ring_iters += 8;
            }

            if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
                let tmp = dx;
                dx = -dz;
                dz = tmp;
            }
            x += dx;
            z += dz;
        }
    }

    height
}

fn distance_point_segment(point: Vec3, seg_a: Vec3, seg_b: Vec3) -> f32 {
    let ab = seg_b - seg_a;
    let ap = point - seg_a;

    let d = ab.length_squared();
    let mut t = ap.dot(ab);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let closest = seg_a + ab * t;
    (point - closest).length_squared()
}

fn distance_point_segment_2d(point: Vec3, seg_a: Vec3, seg_b: Vec3) -> f32 {
    let pqx = seg_b.x - seg_a.x;
    let pqz = seg_b.z - seg_a.z;

    let dx = point.x - seg_a.x;
    let dz = point.z - seg_a.z;

    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let dx = seg_a.x + t * pqx - point.x;
    let dz = seg_a.z + t * pqz - point.z;

    dx * dx + dz * dz
}

/// Signed squared distance from `point` to the polygon boundary on the xz-plane:
/// negative inside (even-odd rule), positive outside.
fn dist_to_poly(poly: &[Vec3], point: Vec3) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let nvert = poly.len();

    for i in 0..nvert {
        let vi = poly[i];
        let vj = poly[(i + nvert - 1) % nvert];

        if ((vi.z > point.z) != (vj.z > point.z))
            && (point.x < (vj.x - vi.x) * (point.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }

        dmin = dmin.min(distance_point_segment_2d(point, vj, vi));
    }

    if inside {
        -dmin
    } else {
        dmin
    }
}

/// Vertical distance from `point` to the triangle mesh, `None` when the point projects
/// outside every triangle.
fn dist_to_tri_mesh(point: Vec3, verts: &[Vec3], tris: &[[u32; 3]]) -> Option<f32> {
    let mut minimum_distance = None;

    for [a, b, c] in tris.iter() {
        let va = verts[*a as usize];
        let vb = verts[*b as usize];
        let vc = verts[*c as usize];

        let distance = dist_point_to_triangle(point, va, vb, vc);
        if minimum_distance.is_none_or(|minimum| distance.is_some_and(|d| d < minimum)) {
            minimum_distance = distance;
        }
    }

    minimum_distance
}

/// Vertical distance from `p` to triangle `(a, b, c)`, `None` when `p` projects outside
/// the triangle on the xz-plane.
fn dist_point_to_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = v0.x * v0.x + v0.z * v0.z;
    let dot01 = v0.x * v1.x + v0.z * v1.z;
    let dot02 = v0.x * v2.x + v0.z * v2.z;
    let dot11 = v1.x * v1.x + v1.z * v1.z;
    let dot12 = v1.x * v2.x + v1.z * v2.z;

    // Compute barycentric coordinates.
    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    // If the point lies inside the triangle, return the interpolated y-distance.
    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + u * v0.y + v * v1.y;
        Some((y - p.y).abs())
    } else {
        None
    }
}

fn prev(i: usize, len: usize) -> usize {
    (i + len - 1) % len
}

fn next(i: usize, len: usize) -> usize {
    (i + 1) % len
}

/// Fan-triangulates the hull, starting from the ear with the shortest perimeter and
/// advancing along whichever side stays shortest.
fn triangulate_hull(verts: &[Vec3], hull: &[usize], nin: usize, tris: &mut Vec<[u32; 3]>) {
    tris.clear();

    let mut start = 0;
    let mut left = 1;
    let mut right = hull.len() - 1;

    // Start from an ear with the shortest perimeter. Only original polygon corners may
    // be the middle of an ear; everything else is a point on an edge.
    let mut min_perimeter = f32::MAX;
    for i in 0..hull.len() {
        if hull[i] >= nin {
            continue;
        }

        let pi = prev(i, hull.len());
        let ni = next(i, hull.len());

        let pv = verts[hull[pi]];
        let cv = verts[hull[i]];
        let nv = verts[hull[ni]];

        let perimeter =
            pv.xz().distance(cv.xz()) + cv.xz().distance(nv.xz()) + nv.xz().distance(pv.xz());

        if perimeter < min_perimeter {
            start = i;
            left = ni;
            right = pi;
            min_perimeter = perimeter;
        }
    }

    tris.push([hull[start] as u32, hull[left] as u32, hull[right] as u32]);

    // Triangulate the polygon by moving left or right, depending on which triangle has
    // the shorter perimeter.
    while next(left, hull.len()) != right {
        let nleft = next(left, hull.len());
        let nright = prev(right, hull.len());

        let cv_left = verts[hull[left]];
        let nv_left = verts[hull[nleft]];
        let cv_right = verts[hull[right]];
        let nv_right = verts[hull[nright]];

        let dleft = cv_left.xz().distance(nv_left.xz()) + nv_left.xz().distance(cv_right.xz());
        let dright = cv_right.xz().distance(nv_right.xz()) + cv_left.xz().distance(nv_right.xz());

        if dleft < dright {
            tris.push([hull[left] as u32, hull[nleft] as u32, hull[right] as u32]);
            left = nleft;
        } else {
            tris.push([hull[left] as u32, hull[nright] as u32, hull[right] as u32]);
            right = nright;
        }
    }
}

/// Incremental Delaunay triangulation constrained to the hull.
fn delaunay_hull(vertices: &[Vec3], hull: &[usize], tris: &mut Vec<[u32; 3]>, edges: &mut Vec<u32>) {
    let mut num_faces = 0;
    let mut num_edges = 0;
    let max_edges = vertices.len() * 10;
    edges.clear();
    edges.resize(max_edges * 4, EV_UNDEF);

    // The hull edges bound the triangulation; only their interior side is completed.
    for i in 0..hull.len() {
        let j = if i == 0 { hull.len() - 1 } else { i - 1 };
        add_edge(
            edges,
            &mut num_edges,
            max_edges,
            hull[j] as u32,
            hull[i] as u32,
            EV_HULL,
            EV_UNDEF,
        );
    }

    let mut current_edge = 0;
    while current_edge < num_edges {
        if edges[current_edge * 4 + 2] == EV_UNDEF {
            complete_facet(
                vertices,
                edges,
                &mut num_edges,
                max_edges,
                &mut num_faces,
                current_edge,
            );
        }
        if edges[current_edge * 4 + 3] == EV_UNDEF {
            complete_facet(
                vertices,
                edges,
                &mut num_edges,
                max_edges,
                &mut num_faces,
                current_edge,
            );
        }
        current_edge += 1;
    }

    // Populate triangles from the edge face labels.
    tris.clear();
    tris.resize(num_faces, [EV_UNDEF; 3]);

    for i in 0..num_edges {
        let e = &edges[i * 4..(i + 1) * 4];
        if e[3] < EV_HULL {
            // Left face.
            let t = &mut tris[e[3] as usize];
            if t[0] == EV_UNDEF {
                t[0] = e[0];
                t[1] = e[1];
            } else if t[0] == e[1] {
                t[2] = e[0];
            } else if t[1] == e[0] {
                t[2] = e[1];
            }
        }
        if e[2] < EV_HULL {
            // Right face.
            let t = &mut tris[e[2] as usize];
            if t[0] == EV_UNDEF {
                t[0] = e[1];
                t[1] = e[0];
            } else if t[0] == e[0] {
                t[2] = e[1];
            } else if t[1] == e[1] {
                t[2] = e[0];
            }
        }
    }

    let before = tris.len();
    tris.retain(|triangle| {
        triangle[0] != EV_UNDEF && triangle[1] != EV_UNDEF && triangle[2] != EV_UNDEF
    });
    if tris.len() != before {
        tracing::warn!("Removed {} dangling faces from a detail patch", before - tris.len());
    }
}

/// Finds the best vertex left of edge `e` and records the face it closes.
fn complete_facet(
    vertices: &[Vec3],
    edges: &mut [u32],
    num_edges: &mut usize,
    max_edges: usize,
    num_faces: &mut usize,
    e: usize,
) {
    const EPS: f32 = 1e-5;

    // Cache `s` and `t`: the edge oriented so its undefined side is on the left.
    let (s, t) = if edges[e * 4 + 2] == EV_UNDEF {
        (edges[e * 4], edges[e * 4 + 1])
    } else if edges[e * 4 + 3] == EV_UNDEF {
        (edges[e * 4 + 1], edges[e * 4])
    } else {
        // Edge already completed.
        return;
    };

    // Find best point on left of edge.
    let mut pt = vertices.len();
    let mut c = Vec3::ZERO;
    let mut r = -1.0;
    for u in 0..vertices.len() {
        if u as u32 == s || u as u32 == t {
            continue;
        }
        if vcross2(vertices[s as usize], vertices[t as usize], vertices[u]) > EPS {
            if r < 0.0 {
                // The circle is not updated yet, do it now.
                pt = u;
                circum_circle(
                    vertices[s as usize],
                    vertices[t as usize],
                    vertices[u],
                    &mut c,
                    &mut r,
                );
                continue;
            }
            let d = c.xz().distance(vertices[u].xz());
            let tolerance = 0.001;
            if d > r * (1.0 + tolerance) {
                // Outside current circumcircle, skip.
                continue;
            } else if d < r * (1.0 - tolerance) {
                // Inside safe circumcircle, update circle.
                pt = u;
                circum_circle(
                    vertices[s as usize],
                    vertices[t as usize],
                    vertices[u],
                    &mut c,
                    &mut r,
                );
            } else {
                // Inside epsilon circumcircle, do extra tests to make sure the edge is
                // valid.
                if overlap_edges(vertices, edges, *num_edges, s, u as u32) {
                    continue;
                }
                if overlap_edges(vertices, edges, *num_edges, t, u as u32) {
                    continue;
                }
                // Edge is valid.
                pt = u;
                circum_circle(
                    vertices[s as usize],
                    vertices[t as usize],
                    vertices[u],
                    &mut c,
                    &mut r,
                );
            }
        }
    }

    // Add new triangle or update edge info if s-t is on hull.
    if pt < vertices.len() {
        // Update face information of the edge being completed.
        update_left_face(&mut edges[e * 4..(e + 1) * 4], s, t, *num_faces as u32);

        // Add new edge or update face info of old edge.
        match find_edge(edges, *num_edges, pt as u32, s) {
            Some(existing) => update_left_face(
                &mut edges[existing * 4..(existing + 1) * 4],
                pt as u32,
                s,
                *num_faces as u32,
            ),
            None => {
                add_edge(
                    edges,
                    num_edges,
                    max_edges,
                    pt as u32,
                    s,
                    *num_faces as u32,
                    EV_UNDEF,
                );
            }
        }

        match find_edge(edges, *num_edges, t, pt as u32) {
            Some(existing) => update_left_face(
                &mut edges[existing * 4..(existing + 1) * 4],
                t,
                pt as u32,
                *num_faces as u32,
            ),
            None => {
                add_edge(
                    edges,
                    num_edges,
                    max_edges,
                    t,
                    pt as u32,
                    *num_faces as u32,
                    EV_UNDEF,
                );
            }
        }

        *num_faces += 1;
    } else {
        update_left_face(&mut edges[e * 4..(e + 1) * 4], s, t, EV_HULL);
    }
}

fn circum_circle(p1: Vec3, p2: Vec3, p3: Vec3, center: &mut Vec3, radius: &mut f32) -> bool {
    const EPS: f32 = 1e-6;

    // Calculate the circle relative to p1, to avoid some precision issues.
    let v1 = Vec3::ZERO;
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = vcross2(v1, v2, v3);
    if cp.abs() > EPS {
        let v1_sq = v1.xz().length_squared();
        let v2_sq = v2.xz().length_squared();
        let v3_sq = v3.xz().length_squared();

        center.x = (v1_sq * (v2.z - v3.z) + v2_sq * (v3.z - v1.z) + v3_sq * (v1.z - v2.z))
            / (2.0 * cp);
        center.y = 0.0;
        center.z = (v1_sq * (v3.x - v2.x) + v2_sq * (v1.x - v3.x) + v3_sq * (v2.x - v1.x))
            / (2.0 * cp);

        *radius = center.xz().distance(v1.xz());
        *center += p1;

        true
    } else {
        *center = p1;
        *radius = 0.0;
        false
    }
}

fn overlap_seg_seg_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let a1 = vcross2(a, b, d);
    let a2 = vcross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = vcross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

fn overlap_edges(vertices: &[Vec3], edges: &[u32], num_edges: usize, s1: u32, t1: u32) -> bool {
    for i in 0..num_edges {
        let s0 = edges[i * 4];
        let t0 = edges[i * 4 + 1];

        // Same or connected edges do not overlap.
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            continue;
        }

        if overlap_seg_seg_2d(
            vertices[s0 as usize],
            vertices[t0 as usize],
            vertices[s1 as usize],
            vertices[t1 as usize],
        ) {
            return true;
        }
    }
    false
}

// Cross product of (p2 - p1) and (p3 - p1) on the xz-plane.
fn vcross2(p1: Vec3, p2: Vec3, p3: Vec3) -> f32 {
    let u1 = p2.x - p1.x;
    let v1 = p2.z - p1.z;
    let u2 = p3.x - p1.x;
    let v2 = p3.z - p1.z;
    u1 * v2 - v1 * u2
}

fn update_left_face(edge: &mut [u32], s: u32, t: u32, face: u32) {
    if edge[0] == s && edge[1] == t && edge[2] == EV_UNDEF {
        edge[2] = face;
    } else if edge[1] == s && edge[0] == t && edge[3] == EV_UNDEF {
        edge[3] = face;
    }
}

fn find_edge(edges: &[u32], num_edges: usize, s: u32, t: u32) -> Option<usize> {
    for i in 0..num_edges {
        let e = &edges[i * 4..(i + 1) * 4];
        if (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s) {
            return Some(i);
        }
    }
    None
}

fn add_edge(
    edges: &mut [u32],
    num_edges: &mut usize,
    max_edges: usize,
    s: u32,
    t: u32,
    left: u32,
    right: u32,
) -> Option<usize> {
    if *num_edges >= max_edges {
        tracing::warn!("add_edge: too many edges ({}/{})", *num_edges, max_edges);
        return None;
    }

    // Add the edge if not already in the triangulation.
    if find_edge(edges, *num_edges, s, t).is_none() {
        let edge = &mut edges[*num_edges * 4..(*num_edges + 1) * 4];
        edge[0] = s;
        edge[1] = t;
        edge[2] = left;
        edge[3] = right;
        *num_edges += 1;

        Some(*num_edges - 1)
    } else {
        None
    }
}

/// Smallest width of the polygon: the minimum over edges of the maximum distance of
/// any vertex to that edge.
fn poly_min_extent(vertices: &[Vec3]) -> f32 {
    let mut min_distance = f32::MAX;
    for i in 0..vertices.len() {
        let next_i = (i + 1) % vertices.len();
        let vertex = vertices[i];
        let next_vertex = vertices[next_i];

        let mut max_edge_distance = 0.0_f32;
        for (j, other) in vertices.iter().enumerate() {
            if j == i || j == next_i {
                continue;
            }

            let distance = distance_point_segment_2d(*other, vertex, next_vertex);
            max_edge_distance = max_edge_distance.max(distance);
        }

        min_distance = min_distance.min(max_edge_distance);
    }

    min_distance.sqrt()
}

fn get_edge_flags(va: Vec3, vb: Vec3, poly: &[Vec3]) -> u8 {
    // The flag means the edge lies along a polygon boundary.
    let threshold_squared = 0.001f32 * 0.001;

    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        if distance_point_segment_2d(va, poly[j], poly[i]) < threshold_squared
            && distance_point_segment_2d(vb, poly[j], poly[i]) < threshold_squared
        {
            return 1;
        }
        j = i;
    }
    0
}

fn get_tri_flags(va: Vec3, vb: Vec3, vc: Vec3, poly: &[Vec3]) -> u8 {
    get_edge_flags(va, vb, poly)
        | get_edge_flags(vb, vc, poly) << 2
        | get_edge_flags(vc, va, poly) << 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        build_contours, build_poly_mesh,
        contour::ContourBuildFlags,
        heightfields::{calculate_distance_field, rasterize_triangles, Heightfield},
        regions::build_regions_monotone,
        Area,
    };
    use glam::uvec3;

    fn plane_mesh(size: f32) -> (PolyMesh, OpenHeightfield) {
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
        calculate_distance_field(&mut open);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();
        let contour_set =
            build_contours(&mut ctx, &open, 1.3, 0, ContourBuildFlags::TESS_WALL_EDGES);
        let mesh = build_poly_mesh(&mut ctx, &contour_set, 6).unwrap();
        (mesh, open)
    }

    #[test]
    fn flat_plane_detail_stays_flat() {
        let (mesh, open) = plane_mesh(8.0);
        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &mesh, &open, 2.0, 1.0);

        assert_eq!(detail.meshes.len(), mesh.polygon_count());

        // A flat quad needs no extra vertices: four corners, two triangles.
        let sub = detail.meshes[0];
        assert_eq!(sub.vertex_count, 4);
        assert_eq!(sub.triangle_count, 2);

        // Every detail vertex sits on the plane floor (voxel 1 at one unit per voxel).
        for vertex in &detail.vertices {
            assert_eq!(vertex.y, 1.0);
        }
    }

    #[test]
    fn detail_triangles_index_their_sub_mesh() {
        let (mesh, open) = plane_mesh(8.0);
        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &mesh, &open, 2.0, 1.0);

        for sub in &detail.meshes {
            for triangle in
                &detail.triangles[sub.triangle_base..sub.triangle_base + sub.triangle_count]
            {
                for index in triangle.vertices {
                    assert!((index as usize) < sub.vertex_count);
                }
            }
        }
    }

    #[test]
    fn boundary_edges_are_flagged() {
        let (mesh, open) = plane_mesh(8.0);
        let mut ctx = BuildContext::new();
        let detail = build_poly_mesh_detail(&mut ctx, &mesh, &open, 2.0, 1.0);

        // The quad splits into two triangles: four outer edges flagged, the shared
        // diagonal unflagged on both sides.
        let flagged: usize = detail
            .triangles
            .iter()
            .map(|triangle| {
                (0..3)
                    .filter(|edge| triangle.edge_on_polygon_boundary(*edge))
                    .count()
            })
            .sum();
        assert_eq!(flagged, 4);
    }

    #[test]
    fn spiral_search_recovers_missing_heights() {
        let patch = HeightPatch {
            data: vec![
                UNSET_HEIGHT,
                UNSET_HEIGHT,
                UNSET_HEIGHT,
                UNSET_HEIGHT,
                UNSET_HEIGHT,
                7,
                UNSET_HEIGHT,
                UNSET_HEIGHT,
                UNSET_HEIGHT,
            ],
            xmin: 0,
            zmin: 0,
            width: 3,
            height: 3,
        };

        // The centre cell is addressed directly.
        assert_eq!(get_height(1.5, 0.0, 1.5, 1.0, 1.0, 2, &patch), 7);
        // A corner cell has no data; the spiral finds the centre.
        assert_eq!(get_height(0.0, 0.0, 0.0, 1.0, 1.0, 2, &patch), 7);
    }

    #[test]
    fn point_in_polygon_distance_is_signed() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
        ];
        assert!(dist_to_poly(&square, Vec3::new(2.0, 0.0, 2.0)) < 0.0);
        assert!(dist_to_poly(&square, Vec3::new(5.0, 0.0, 2.0)) > 0.0);
    }
}
