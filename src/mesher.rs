//! Polygon mesh construction: triangulates every contour, welds vertices, merges
//! triangles into convex polygons of up to `nvp` vertices, removes the extra vertices
//! introduced along tile borders, and wires up polygon adjacency and portal edges.
//!
//! Polygon storage is flat: each polygon occupies `2 * nvp` consecutive `u16`s. The
//! first half is vertex indices padded with [`MESH_NULL_IDX`], the second half is
//! neighbour data per edge (a polygon index, `0x8000 | side` for a tile-border portal,
//! or [`MESH_NULL_IDX`] for a plain wall).

use glam::{U16Vec3, UVec4, Vec3};

use crate::{
    contour::ContourSet,
    math::{intersect, intersect_prop, left, left_on},
    Area, BuildContext, BuildError, FLAG_BORDER_VERTEX, MESH_NULL_IDX, MULTIPLE_REGS,
};

const VERTEX_BUCKET_COUNT: usize = 1 << 12; // 4 096

/// A navigation mesh of convex polygons in cell coordinates.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct PolyMesh {
    /// The mesh vertices.
    pub vertices: Vec<U16Vec3>,
    /// Flat polygon data, `2 * vertices_per_polygon` entries per polygon.
    pub polygons: Vec<u16>,
    /// The region id each polygon was built from ([`MULTIPLE_REGS`] when stitched
    /// together from several).
    pub regions: Vec<u16>,
    /// Per-polygon user flags, zeroed; yours to fill before handing the mesh on.
    pub flags: Vec<u16>,
    /// The walkable area of each polygon.
    pub areas: Vec<Area>,
    /// Maximum vertices per polygon the mesh was built with.
    pub vertices_per_polygon: usize,
    pub min_bounds: Vec3,
    pub max_bounds: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    /// Border strip width the source data carried; already cropped from the vertices.
    pub border_size: u16,
    /// The contour simplification error the mesh inherited.
    pub max_edge_error: f32,
}

impl PolyMesh {
    /// Number of polygons in the mesh.
    #[inline]
    pub fn polygon_count(&self) -> usize {
        self.regions.len()
    }

    /// The vertex-index half of polygon `i`, padded with [`MESH_NULL_IDX`].
    #[inline]
    pub fn polygon_vertices(&self, i: usize) -> &[u16] {
        let nvp = self.vertices_per_polygon;
        &self.polygons[i * nvp * 2..][..nvp]
    }

    /// The neighbour half of polygon `i`: per edge a polygon index, a portal code, or
    /// [`MESH_NULL_IDX`].
    #[inline]
    pub fn polygon_neighbours(&self, i: usize) -> &[u16] {
        let nvp = self.vertices_per_polygon;
        &self.polygons[i * nvp * 2 + nvp..][..nvp]
    }
}

/// Builds the polygon mesh from a contour set.
///
/// `vertices_per_polygon` caps the polygon size; 3 keeps the raw triangulation.
pub fn build_poly_mesh(
    ctx: &mut BuildContext,
    contour_set: &ContourSet,
    vertices_per_polygon: usize,
) -> Result<PolyMesh, BuildError> {
    let nvp = vertices_per_polygon;

    let mut max_vertices = 0;
    let mut max_tris = 0;
    let mut max_verts_per_contour = 0;
    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }
        max_vertices += contour.vertices.len();
        max_tris += contour.vertices.len() - 2;
        max_verts_per_contour = contour.vertices.len().max(max_verts_per_contour);
    }

    if max_vertices >= 0xfffe {
        return Err(BuildError::TooManyVertices(max_vertices));
    }

    let mut mesh = PolyMesh {
        vertices: Vec::with_capacity(max_vertices),
        polygons: Vec::with_capacity(max_tris * nvp * 2),
        regions: Vec::with_capacity(max_tris),
        flags: Vec::with_capacity(max_tris),
        areas: Vec::with_capacity(max_tris),
        vertices_per_polygon: nvp,
        min_bounds: contour_set.min_bounds,
        max_bounds: contour_set.max_bounds,
        cell_size: contour_set.cell_size,
        cell_height: contour_set.cell_height,
        border_size: contour_set.border_size,
        max_edge_error: contour_set.max_error,
    };

    // Marks vertices that sit on border-region seams and should be removed once the
    // polygons are formed.
    let mut vertex_flags = vec![false; max_vertices];
    let mut first_vertex = vec![-1i32; VERTEX_BUCKET_COUNT];
    let mut next_vertex = vec![0i32; max_vertices];

    let mut ring: Vec<u32> = Vec::with_capacity(max_verts_per_contour);
    let mut triangles: Vec<u32> = Vec::with_capacity(max_verts_per_contour * 3);
    let mut vertex_indices: Vec<u16> = Vec::with_capacity(max_verts_per_contour);
    let mut polys: Vec<u16> = Vec::with_capacity((max_verts_per_contour + 1) * nvp);
    let mut merge_scratch: Vec<u16> = vec![MESH_NULL_IDX; nvp];

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        // Triangulate the contour.
        ring.clear();
        triangles.clear();
        ring.extend(0..contour.vertices.len() as u32);

        if !triangulate(&contour.vertices, &mut ring, &mut triangles) {
            // Bad triangulation, should not happen.
            ctx.warn(format!(
                "Failed to fully triangulate the contour of region {}; \
                 dropping its degenerate triangles",
                contour.region
            ));
        }

        // Add and merge vertices.
        vertex_indices.clear();
        for vertex in contour.vertices.iter() {
            let index = add_vertex(
                U16Vec3::new(vertex.x as u16, vertex.y as u16, vertex.z as u16),
                &mut mesh.vertices,
                &mut first_vertex,
                &mut next_vertex,
            );
            if vertex.w & FLAG_BORDER_VERTEX != 0 {
                // This vertex should be removed.
                vertex_flags[index as usize] = true;
            }
            vertex_indices.push(index);
        }

        // Build initial polygons.
        polys.clear();
        let mut npolys = 0;
        for triangle in triangles.chunks_exact(3) {
            let (a, b, c) = (
                triangle[0] as usize,
                triangle[1] as usize,
                triangle[2] as usize,
            );
            if a != b && a != c && b != c {
                let base = polys.len();
                polys.resize(base + nvp, MESH_NULL_IDX);
                polys[base] = vertex_indices[a];
                polys[base + 1] = vertex_indices[b];
                polys[base + 2] = vertex_indices[c];
                npolys += 1;
            }
        }
        if npolys == 0 {
            continue;
        }

        // Merge polygons.
        if nvp > 3 {
            loop {
                // Find the pair with the longest shared edge that still merges into a
                // convex polygon.
                let mut best_merge_value = 0;
                let mut best = None;
                for j in 0..npolys - 1 {
                    for k in j + 1..npolys {
                        if let Some((value, ea, eb)) =
                            get_poly_merge_value(&polys, j, k, &mesh.vertices, nvp)
                        {
                            if value > best_merge_value {
                                best_merge_value = value;
                                best = Some((j, k, ea, eb));
                            }
                        }
                    }
                }

                let Some((best_a, best_b, ea, eb)) = best else {
                    // Could not merge any polygons, stop.
                    break;
                };

                merge_poly_verts(&mut polys, best_a, best_b, ea, eb, &mut merge_scratch, nvp);
                let last = npolys - 1;
                if best_b != last {
                    let (head, tail) = polys.split_at_mut(last * nvp);
                    head[best_b * nvp..(best_b + 1) * nvp].copy_from_slice(tail);
                }
                polys.truncate(last * nvp);
                npolys -= 1;
            }
        }

        // Store polygons.
        for j in 0..npolys {
            if mesh.polygon_count() >= max_tris {
                return Err(BuildError::TooManyPolygons {
                    count: mesh.polygon_count() + 1,
                    max: max_tris,
                });
            }
            let base = mesh.polygons.len();
            mesh.polygons.resize(base + nvp * 2, MESH_NULL_IDX);
            mesh.polygons[base..base + nvp].copy_from_slice(&polys[j * nvp..(j + 1) * nvp]);
            mesh.regions.push(contour.region);
            mesh.areas.push(contour.area);
            mesh.flags.push(0);
        }
    }

    // Remove edge vertices.
    let mut i = 0;
    while i < mesh.vertices.len() {
        if vertex_flags[i] {
            if !can_remove_vertex(&mesh, i as u16) {
                i += 1;
                continue;
            }
            remove_vertex(ctx, &mut mesh, i as u16, max_tris)?;
            // The vertices were shifted down; shift the flags the same way and retry
            // the same index.
            vertex_flags.remove(i);
        } else {
            i += 1;
        }
    }

    // Calculate adjacency.
    build_mesh_adjacency(&mut mesh.polygons, mesh.vertices.len(), nvp);

    // Find portal edges: open edges whose both endpoints lie on the grid border.
    let width = contour_set.width as u16;
    let height = contour_set.height as u16;
    for i in 0..mesh.regions.len() {
        let base = i * nvp * 2;
        for j in 0..nvp {
            if mesh.polygons[base + j] == MESH_NULL_IDX {
                break;
            }
            // Skip connected edges.
            if mesh.polygons[base + nvp + j] != MESH_NULL_IDX {
                continue;
            }

            let next = if j + 1 >= nvp || mesh.polygons[base + j + 1] == MESH_NULL_IDX {
                0
            } else {
                j + 1
            };
            let va = mesh.vertices[mesh.polygons[base + j] as usize];
            let vb = mesh.vertices[mesh.polygons[base + next] as usize];

            if va.x == 0 && vb.x == 0 {
                mesh.polygons[base + nvp + j] = 0x8000;
            } else if va.z == height && vb.z == height {
                mesh.polygons[base + nvp + j] = 0x8000 | 1;
            } else if va.x == width && vb.x == width {
                mesh.polygons[base + nvp + j] = 0x8000 | 2;
            } else if va.z == 0 && vb.z == 0 {
                mesh.polygons[base + nvp + j] = 0x8000 | 3;
            }
        }
    }

    Ok(mesh)
}

/// Number of vertices actually used by a polygon's vertex half.
fn count_poly_verts(poly: &[u16], nvp: usize) -> usize {
    poly[..nvp]
        .iter()
        .take_while(|vertex| **vertex != MESH_NULL_IDX)
        .count()
}

/// `c` strictly left of the edge `a -> b` on the xz-plane, u16 vertex flavour.
#[inline]
fn uleft(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    (b.x as i32 - a.x as i32) * (c.z as i32 - a.z as i32)
        - (c.x as i32 - a.x as i32) * (b.z as i32 - a.z as i32)
        < 0
}

/// Scores merging polygons `pa` and `pb`: the squared length of their shared edge, or
/// `None` when they share none or the merge would go non-convex or overflow `nvp`.
fn get_poly_merge_value(
    polys: &[u16],
    pa: usize,
    pb: usize,
    vertices: &[U16Vec3],
    nvp: usize,
) -> Option<(u32, usize, usize)> {
    let poly_a = &polys[pa * nvp..(pa + 1) * nvp];
    let poly_b = &polys[pb * nvp..(pb + 1) * nvp];
    let na = count_poly_verts(poly_a, nvp);
    let nb = count_poly_verts(poly_b, nvp);

    // If the merged polygon would be too big, do not merge.
    if na + nb - 2 > nvp {
        return None;
    }

    // Check if the polygons share an edge.
    let mut shared = None;
    for i in 0..na {
        let mut va0 = poly_a[i];
        let mut va1 = poly_a[(i + 1) % na];
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let mut vb0 = poly_b[j];
            let mut vb1 = poly_b[(j + 1) % nb];
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
            }
        }
    }
    let (ea, eb) = shared?;

    // Check that the merged polygon stays convex at the two joining corners.
    let va = poly_a[(ea + na - 1) % na];
    let vb = poly_a[ea];
    let vc = poly_b[(eb + 2) % nb];
    if !uleft(
        vertices[va as usize],
        vertices[vb as usize],
        vertices[vc as usize],
    ) {
        return None;
    }

    let va = poly_b[(eb + nb - 1) % nb];
    let vb = poly_b[eb];
    let vc = poly_a[(ea + 2) % na];
    if !uleft(
        vertices[va as usize],
        vertices[vb as usize],
        vertices[vc as usize],
    ) {
        return None;
    }

    let va = poly_a[ea];
    let vb = poly_a[(ea + 1) % na];
    let dx = vertices[va as usize].x as i32 - vertices[vb as usize].x as i32;
    let dz = vertices[va as usize].z as i32 - vertices[vb as usize].z as i32;
    Some(((dx * dx + dz * dz) as u32, ea, eb))
}

/// Merges polygon `pb` into `pa` across the shared edge `(ea, eb)`.
fn merge_poly_verts(
    polys: &mut [u16],
    pa: usize,
    pb: usize,
    ea: usize,
    eb: usize,
    scratch: &mut [u16],
    nvp: usize,
) {
    let na = count_poly_verts(&polys[pa * nvp..(pa + 1) * nvp], nvp);
    let nb = count_poly_verts(&polys[pb * nvp..(pb + 1) * nvp], nvp);

    scratch.fill(MESH_NULL_IDX);
    let mut n = 0;
    // Add pa.
    for i in 0..na - 1 {
        scratch[n] = polys[pa * nvp + (ea + 1 + i) % na];
        n += 1;
    }
    // Add pb.
    for i in 0..nb - 1 {
        scratch[n] = polys[pb * nvp + (eb + 1 + i) % nb];
        n += 1;
    }

    polys[pa * nvp..(pa + 1) * nvp].copy_from_slice(scratch);
}

/// Whether removing `vertex` keeps the surrounding polygons stitchable: at least three
/// edges remain and no more than two of the edges fanning out of the vertex are open.
fn can_remove_vertex(mesh: &PolyMesh, vertex: u16) -> bool {
    let nvp = mesh.vertices_per_polygon;

    // Count the number of edges remaining after removal.
    let mut num_touched_verts = 0;
    let mut num_remaining_edges = 0i32;
    for i in 0..mesh.polygon_count() {
        let poly = mesh.polygon_vertices(i);
        let nv = count_poly_verts(poly, nvp);
        let num_removed = poly[..nv].iter().filter(|v| **v == vertex).count();
        if num_removed > 0 {
            num_touched_verts += num_removed;
            num_remaining_edges += nv as i32 - (num_removed as i32 + 1);
        }
    }
    if num_remaining_edges <= 2 {
        // There would be too few edges remaining to create a polygon. This can happen
        // for example when a tip of a triangle is marked as a deletion candidate, but
        // there are no other polys that share the vertex.
        return false;
    }

    // Find edges which share the removed vertex.
    let mut edges: Vec<(u16, usize)> = Vec::with_capacity(num_touched_verts * 2);
    for i in 0..mesh.polygon_count() {
        let poly = mesh.polygon_vertices(i);
        let nv = count_poly_verts(poly, nvp);

        let mut k = nv - 1;
        for j in 0..nv {
            if poly[j] == vertex || poly[k] == vertex {
                // Arrange the edge so the other end identifies it.
                let other = if poly[j] == vertex { poly[k] } else { poly[j] };
                if other != vertex {
                    if let Some(edge) = edges.iter_mut().find(|(b, _)| *b == other) {
                        edge.1 += 1;
                    } else {
                        edges.push((other, 1));
                    }
                }
            }
            k = j;
        }
    }

    // There should be no more than 2 open edges. This catches the case that two
    // polygons share a vertex but not an edge: removing the vertex there would tear
    // the mesh open.
    let num_open_edges = edges.iter().filter(|(_, count)| *count < 2).count();
    num_open_edges <= 2
}

#[derive(Clone, Copy)]
struct HoleEdge {
    a: u16,
    b: u16,
    region: u16,
    area: Area,
}

/// Removes `vertex` from the mesh, re-triangulating and re-merging the hole left by
/// the polygons that used it.
fn remove_vertex(
    ctx: &mut BuildContext,
    mesh: &mut PolyMesh,
    vertex: u16,
    max_tris: usize,
) -> Result<(), BuildError> {
    let nvp = mesh.vertices_per_polygon;

    // Collect the boundary edges of the polygons that touch the vertex, removing the
    // polygons as we go.
    let mut edges: Vec<HoleEdge> = Vec::new();
    let mut i = 0;
    while i < mesh.polygon_count() {
        let base = i * nvp * 2;
        let nv = count_poly_verts(&mesh.polygons[base..base + nvp], nvp);
        let touches = mesh.polygons[base..base + nv].contains(&vertex);
        if !touches {
            i += 1;
            continue;
        }

        // Collect edges which do not touch the removed vertex.
        let mut k = nv - 1;
        for j in 0..nv {
            let vj = mesh.polygons[base + j];
            let vk = mesh.polygons[base + k];
            if vj != vertex && vk != vertex {
                edges.push(HoleEdge {
                    a: vk,
                    b: vj,
                    region: mesh.regions[i],
                    area: mesh.areas[i],
                });
            }
            k = j;
        }

        remove_polygon(mesh, i);
    }

    // Remove the vertex and shift every higher index down.
    mesh.vertices.remove(vertex as usize);
    for i in 0..mesh.polygon_count() {
        let base = i * nvp * 2;
        for j in 0..nvp {
            let v = &mut mesh.polygons[base + j];
            if *v != MESH_NULL_IDX && *v > vertex {
                *v -= 1;
            }
        }
    }
    for edge in edges.iter_mut() {
        if edge.a > vertex {
            edge.a -= 1;
        }
        if edge.b > vertex {
            edge.b -= 1;
        }
    }

    if edges.is_empty() {
        return Ok(());
    }

    // Chain the loose edges into the closed hole boundary.
    let mut hole: Vec<u16> = vec![edges[0].a];
    let mut hole_regions: Vec<u16> = vec![edges[0].region];
    let mut hole_areas: Vec<Area> = vec![edges[0].area];

    while !edges.is_empty() {
        let mut matched = false;

        let mut i = 0;
        while i < edges.len() {
            let HoleEdge { a, b, region, area } = edges[i];
            let mut add = false;
            if hole[0] == b {
                // The segment matches the beginning of the hole boundary.
                hole.insert(0, a);
                hole_regions.insert(0, region);
                hole_areas.insert(0, area);
                add = true;
            } else if *hole.last().unwrap() == a {
                // The segment matches the end of the hole boundary.
                hole.push(b);
                hole_regions.push(region);
                hole_areas.push(area);
                add = true;
            }

            if add {
                edges.swap_remove(i);
                matched = true;
            } else {
                i += 1;
            }
        }

        if !matched {
            break;
        }
    }

    // Triangulate the hole.
    let mut tris: Vec<u32> = Vec::with_capacity(hole.len() * 3);
    let mut tverts: Vec<UVec4> = Vec::with_capacity(hole.len());
    let mut thole: Vec<u32> = Vec::with_capacity(hole.len());
    for (i, hole_vertex) in hole.iter().enumerate() {
        let v = mesh.vertices[*hole_vertex as usize];
        tverts.push(UVec4::new(v.x as u32, v.y as u32, v.z as u32, 0));
        thole.push(i as u32);
    }

    if !triangulate(&tverts, &mut thole, &mut tris) {
        ctx.warn("Hole triangulation produced degenerate triangles while removing a vertex");
    }

    // Merge the hole triangles back to polygons.
    let mut polys: Vec<u16> = Vec::with_capacity((tris.len() / 3 + 1) * nvp);
    let mut poly_regions: Vec<u16> = Vec::new();
    let mut poly_areas: Vec<Area> = Vec::new();

    let mut npolys = 0;
    for triangle in tris.chunks_exact(3) {
        let (a, b, c) = (
            triangle[0] as usize,
            triangle[1] as usize,
            triangle[2] as usize,
        );
        if a != b && a != c && b != c {
            let base = polys.len();
            polys.resize(base + nvp, MESH_NULL_IDX);
            polys[base] = hole[a];
            polys[base + 1] = hole[b];
            polys[base + 2] = hole[c];

            // If this polygon covers multiple regions, mark it as such.
            if hole_regions[a] != hole_regions[b] || hole_regions[b] != hole_regions[c] {
                poly_regions.push(MULTIPLE_REGS);
            } else {
                poly_regions.push(hole_regions[a]);
            }
            poly_areas.push(hole_areas[a]);
            npolys += 1;
        }
    }
    if npolys == 0 {
        return Ok(());
    }

    // Merge polygons.
    if nvp > 3 {
        let mut merge_scratch: Vec<u16> = vec![MESH_NULL_IDX; nvp];
        loop {
            let mut best_merge_value = 0;
            let mut best = None;
            for j in 0..npolys - 1 {
                for k in j + 1..npolys {
                    if let Some((value, ea, eb)) =
                        get_poly_merge_value(&polys, j, k, &mesh.vertices, nvp)
                    {
                        if value > best_merge_value {
                            best_merge_value = value;
                            best = Some((j, k, ea, eb));
                        }
                    }
                }
            }

            let Some((best_a, best_b, ea, eb)) = best else {
                break;
            };

            merge_poly_verts(&mut polys, best_a, best_b, ea, eb, &mut merge_scratch, nvp);
            if poly_regions[best_a] != poly_regions[best_b] {
                poly_regions[best_a] = MULTIPLE_REGS;
            }

            let last = npolys - 1;
            if best_b != last {
                let (head, tail) = polys.split_at_mut(last * nvp);
                head[best_b * nvp..(best_b + 1) * nvp].copy_from_slice(tail);
            }
            polys.truncate(last * nvp);
            poly_regions.swap_remove(best_b);
            poly_areas.swap_remove(best_b);
            npolys -= 1;
        }
    }

    // Store polygons.
    for j in 0..npolys {
        if mesh.polygon_count() >= max_tris {
            return Err(BuildError::TooManyPolygons {
                count: mesh.polygon_count() + 1,
                max: max_tris,
            });
        }
        let base = mesh.polygons.len();
        mesh.polygons.resize(base + nvp * 2, MESH_NULL_IDX);
        mesh.polygons[base..base + nvp].copy_from_slice(&polys[j * nvp..(j + 1) * nvp]);
        mesh.regions.push(poly_regions[j]);
        mesh.areas.push(poly_areas[j]);
        mesh.flags.push(0);
    }

    Ok(())
}

/// Drops polygon `index` by moving the last polygon into its slot.
fn remove_polygon(mesh: &mut PolyMesh, index: usize) {
    let nvp = mesh.vertices_per_polygon;
    let last = mesh.polygon_count() - 1;
    if index != last {
        let (head, tail) = mesh.polygons.split_at_mut(last * nvp * 2);
        head[index * nvp * 2..(index + 1) * nvp * 2].copy_from_slice(tail);
    }
    mesh.polygons.truncate(last * nvp * 2);
    mesh.regions.swap_remove(index);
    mesh.areas.swap_remove(index);
    mesh.flags.swap_remove(index);
}

#[derive(Debug)]
struct Edge {
    // The vertices that make up this edge.
    vertices: [u16; 2],
    // The index of the edge in the respective polygon.
    edge_in_polygon: [usize; 2],
    // The polygons that share this edge.
    polygon: [usize; 2],
}

/// Writes each internal edge's opposing polygon index into the neighbour halves.
fn build_mesh_adjacency(polygons: &mut [u16], vertex_count: usize, nvp: usize) {
    let polygon_count = polygons.len() / (nvp * 2);
    let max_edge_count = polygon_count * nvp;

    let mut first_edge: Vec<Option<usize>> = vec![None; vertex_count];
    let mut next_edge: Vec<Option<usize>> = vec![None; max_edge_count];
    let mut edges: Vec<Edge> = Vec::with_capacity(max_edge_count);

    for i in 0..polygon_count {
        let poly = &polygons[i * nvp * 2..i * nvp * 2 + nvp];
        for j in 0..nvp {
            if poly[j] == MESH_NULL_IDX {
                break;
            }
            let v0 = poly[j];
            let v1 = if j + 1 >= nvp || poly[j + 1] == MESH_NULL_IDX {
                poly[0]
            } else {
                poly[j + 1]
            };
            if v0 < v1 {
                next_edge[edges.len()] = first_edge[v0 as usize];
                first_edge[v0 as usize] = Some(edges.len());
                edges.push(Edge {
                    vertices: [v0, v1],
                    edge_in_polygon: [j, 0],
                    polygon: [i, i],
                });
            }
        }
    }

    for i in 0..polygon_count {
        let poly = &polygons[i * nvp * 2..i * nvp * 2 + nvp];
        for j in 0..nvp {
            if poly[j] == MESH_NULL_IDX {
                break;
            }
            let v0 = poly[j];
            let v1 = if j + 1 >= nvp || poly[j + 1] == MESH_NULL_IDX {
                poly[0]
            } else {
                poly[j + 1]
            };
            if v0 > v1 {
                let mut edge_iter = first_edge[v1 as usize];
                while let Some(edge_index) = edge_iter {
                    let edge = &mut edges[edge_index];
                    if edge.vertices[1] == v0 && edge.polygon[0] == edge.polygon[1] {
                        edge.polygon[1] = i;
                        edge.edge_in_polygon[1] = j;
                        break;
                    }
                    edge_iter = next_edge[edge_index];
                }
            }
        }
    }

    for edge in edges.iter() {
        if edge.polygon[0] != edge.polygon[1] {
            let (p0, p1) = (edge.polygon[0], edge.polygon[1]);
            polygons[p0 * nvp * 2 + nvp + edge.edge_in_polygon[0]] = p1 as u16;
            polygons[p1 * nvp * 2 + nvp + edge.edge_in_polygon[1]] = p0 as u16;
        }
    }
}

fn compute_vertex_hash(x: u64, z: u64) -> u64 {
    // Large multiplicative constants, here arbitrarily chosen primes.
    const HASH_X: u64 = 0x8da6b343;
    const HASH_Z: u64 = 0xcb1ab31f;

    let hash = x * HASH_X + z * HASH_Z;

    hash & (VERTEX_BUCKET_COUNT - 1) as u64
}

fn add_vertex(
    vertex: U16Vec3,
    vertices: &mut Vec<U16Vec3>,
    first_vertex: &mut [i32],
    next_vertex: &mut [i32],
) -> u16 {
    let bucket = compute_vertex_hash(vertex.x.into(), vertex.z.into());
    let mut i = first_vertex[bucket as usize];

    while i != -1 {
        let other_vertex = vertices[i as usize];
        if other_vertex.x == vertex.x
            && other_vertex.y.abs_diff(vertex.y) <= 2
            && other_vertex.z == vertex.z
        {
            return i as u16;
        }
        i = next_vertex[i as usize];
    }

    let i = vertices.len();
    vertices.push(vertex);
    next_vertex[i] = first_vertex[bucket as usize];
    first_vertex[bucket as usize] = i as i32;
    i as u16
}

/// Ear-clips the polygon held in `ring` (indices into `vertices`) into `triangles`.
///
/// Corners are clipped shortest-diagonal first. When no corner passes the strict
/// diagonal test the contour pinches into itself somewhere (two opposite stretches of
/// boundary running along the same cells), so a looser test that tolerates grazing
/// contact is tried before giving up. Returns `false` when even that finds nothing;
/// the triangles produced up to that point stay in the output.
fn triangulate(vertices: &[UVec4], ring: &mut Vec<u32>, triangles: &mut Vec<u32>) -> bool {
    if ring.len() < 3 {
        return false;
    }

    // Which corners can currently be clipped off.
    let mut removable = vec![false; ring.len()];
    for corner in 0..ring.len() {
        removable[corner] = corner_is_clippable(ring, vertices, corner, true);
    }

    while ring.len() > 3 {
        let mut corner = shortest_removable_corner(ring, vertices, Some(&removable));
        if corner.is_none() {
            corner = shortest_removable_corner(ring, vertices, None);
        }
        let Some(corner) = corner else {
            // The contour is messed up. This sometimes happens when the contour
            // simplification is too aggressive.
            return false;
        };

        // Clip the corner off.
        let before = (corner + ring.len() - 1) % ring.len();
        let after = (corner + 1) % ring.len();
        triangles.push(ring[before]);
        triangles.push(ring[corner]);
        triangles.push(ring[after]);

        ring.remove(corner);
        removable.remove(corner);

        // Only the two corners that just became neighbours change clippability.
        let after = if corner == ring.len() { 0 } else { corner };
        let before = (after + ring.len() - 1) % ring.len();
        removable[before] = corner_is_clippable(ring, vertices, before, true);
        removable[after] = corner_is_clippable(ring, vertices, after, true);
    }

    triangles.extend_from_slice(&[ring[0], ring[1], ring[2]]);

    true
}

/// Whether clipping `corner` leaves a valid polygon: the diagonal between its two
/// neighbours must run through the interior.
fn corner_is_clippable(ring: &[u32], vertices: &[UVec4], corner: usize, strict: bool) -> bool {
    let before = (corner + ring.len() - 1) % ring.len();
    let after = (corner + 1) % ring.len();
    is_valid_diagonal(ring, vertices, before, after, strict)
}

/// The clippable corner whose closing diagonal is shortest on the xz-plane.
///
/// With `removable` given its flags decide clippability (the strict test, maintained
/// incrementally by the caller); without it every corner is re-examined with the
/// loose test.
fn shortest_removable_corner(
    ring: &[u32],
    vertices: &[UVec4],
    removable: Option<&[bool]>,
) -> Option<usize> {
    let mut best = None;
    let mut best_length = u32::MAX;

    for corner in 0..ring.len() {
        let clippable = match removable {
            Some(flags) => flags[corner],
            None => corner_is_clippable(ring, vertices, corner, false),
        };
        if !clippable {
            continue;
        }

        let before = vertices[ring[(corner + ring.len() - 1) % ring.len()] as usize];
        let after = vertices[ring[(corner + 1) % ring.len()] as usize];
        let delta_x = after.x.abs_diff(before.x);
        let delta_z = after.z.abs_diff(before.z);
        let length = delta_x * delta_x + delta_z * delta_z;

        if length < best_length {
            best_length = length;
            best = Some(corner);
        }
    }

    best
}

/// Both halves of the diagonal test: it must leave corner `i` through the polygon's
/// interior and reach `j` without hitting the boundary in between.
fn is_valid_diagonal(ring: &[u32], vertices: &[UVec4], i: usize, j: usize, strict: bool) -> bool {
    diagonal_in_cone(ring, vertices, i, j, strict)
        && diagonal_unblocked(ring, vertices, i, j, strict)
}

/// Whether the segment from ring corner `i` towards corner `j` starts into the
/// polygon's interior. Strictly the segment must leave the corner properly inside;
/// loosely it may also run along the boundary.
fn diagonal_in_cone(ring: &[u32], vertices: &[UVec4], i: usize, j: usize, strict: bool) -> bool {
    let corner = vertices[ring[i] as usize].as_ivec4();
    let target = vertices[ring[j] as usize].as_ivec4();
    let after = vertices[ring[(i + 1) % ring.len()] as usize].as_ivec4();
    let before = vertices[ring[(ring.len() + i - 1) % ring.len()] as usize].as_ivec4();

    if left_on(before, corner, after) {
        // Convex corner.
        return if strict {
            left(corner, target, before) && left(target, corner, after)
        } else {
            left_on(corner, target, before) && left_on(target, corner, after)
        };
    }

    // Reflex corner: everything except the outside wedge counts as interior.
    !(left_on(corner, target, after) && left_on(target, corner, before))
}

/// Whether no boundary edge blocks the diagonal between ring corners `i` and `j`.
/// Strictly any touch blocks; loosely only a proper crossing does.
fn diagonal_unblocked(ring: &[u32], vertices: &[UVec4], i: usize, j: usize, strict: bool) -> bool {
    let from = vertices[ring[i] as usize];
    let to = vertices[ring[j] as usize];

    for edge in 0..ring.len() {
        let edge_end = (edge + 1) % ring.len();
        if edge == i || edge == j || edge_end == i || edge_end == j {
            continue;
        }

        let p = vertices[ring[edge] as usize];
        let q = vertices[ring[edge_end] as usize];

        // Edges that share a cell with either endpoint never block.
        if same_column(p, from) || same_column(p, to) || same_column(q, from) || same_column(q, to)
        {
            continue;
        }

        let blocked = if strict {
            intersect(from.as_ivec4(), to.as_ivec4(), p.as_ivec4(), q.as_ivec4())
        } else {
            intersect_prop(from.as_ivec4(), to.as_ivec4(), p.as_ivec4(), q.as_ivec4())
        };
        if blocked {
            return false;
        }
    }

    true
}

/// Two contour vertices occupying the same xz cell.
fn same_column(a: UVec4, b: UVec4) -> bool {
    a.x == b.x && a.z == b.z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::Contour;
    use glam::uvec4;

    fn contour_set(contours: Vec<Contour>, width: i32, height: i32) -> ContourSet {
        ContourSet {
            contours,
            min_bounds: Vec3::ZERO,
            max_bounds: Vec3::new(width as f32, 5.0, height as f32),
            cell_size: 1.0,
            cell_height: 1.0,
            width,
            height,
            border_size: 0,
            max_error: 1.3,
        }
    }

    fn square_contour(size: u32, region: u16) -> Contour {
        Contour {
            vertices: vec![
                uvec4(0, 1, 0, 0),
                uvec4(0, 1, size, 0),
                uvec4(size, 1, size, 0),
                uvec4(size, 1, 0, 0),
            ],
            raw_vertices: Vec::new(),
            region,
            area: Area::WALKABLE,
        }
    }

    fn polygon_is_ccw(mesh: &PolyMesh, i: usize) -> bool {
        // Same sign convention as the contour winding classification.
        let poly = mesh.polygon_vertices(i);
        let nv = count_poly_verts(poly, mesh.vertices_per_polygon);
        let mut area = 0i32;
        for j in 0..nv {
            let a = mesh.vertices[poly[j] as usize];
            let b = mesh.vertices[poly[(j + 1) % nv] as usize];
            area += b.x as i32 * a.z as i32 - a.x as i32 * b.z as i32;
        }
        area > 0
    }

    #[test]
    fn square_becomes_one_quad_with_portals_on_all_sides() {
        let mut ctx = BuildContext::new();
        let contour_set = contour_set(vec![square_contour(4, 1)], 4, 4);
        let mesh = build_poly_mesh(&mut ctx, &contour_set, 6).unwrap();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(count_poly_verts(mesh.polygon_vertices(0), 6), 4);
        assert!(polygon_is_ccw(&mesh, 0));
        assert_eq!(mesh.regions, vec![1]);

        // Every edge lies on the grid border and carries its side in the low bits.
        let mut sides = [false; 4];
        for j in 0..4 {
            let neighbour = mesh.polygon_neighbours(0)[j];
            assert_ne!(neighbour & 0x8000, 0, "edge {j} should be a portal");
            sides[(neighbour & 0xf) as usize] = true;
        }
        assert_eq!(sides, [true; 4]);
    }

    #[test]
    fn triangulation_without_merging_keeps_triangles_adjacent() {
        let mut ctx = BuildContext::new();
        let contour_set = contour_set(vec![square_contour(4, 1)], 4, 4);
        let mesh = build_poly_mesh(&mut ctx, &contour_set, 3).unwrap();

        assert_eq!(mesh.polygon_count(), 2);
        for i in 0..2 {
            assert!(polygon_is_ccw(&mesh, i));
        }

        // Exactly one edge of each triangle points at the other.
        let mutual: Vec<Vec<usize>> = (0..2)
            .map(|i| {
                mesh.polygon_neighbours(i)
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| **n != MESH_NULL_IDX && **n & 0x8000 == 0)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();
        assert_eq!(mutual[0].len(), 1);
        assert_eq!(mutual[1].len(), 1);
        assert_eq!(mesh.polygon_neighbours(0)[mutual[0][0]], 1);
        assert_eq!(mesh.polygon_neighbours(1)[mutual[1][0]], 0);
    }

    #[test]
    fn touching_contours_share_welded_vertices() {
        // Two 4x4 squares side by side share the x = 4 edge.
        let left = square_contour(4, 1);
        let right = Contour {
            vertices: vec![
                uvec4(4, 1, 0, 0),
                uvec4(4, 1, 4, 0),
                uvec4(8, 1, 4, 0),
                uvec4(8, 1, 0, 0),
            ],
            raw_vertices: Vec::new(),
            region: 2,
            area: Area::WALKABLE,
        };

        let mut ctx = BuildContext::new();
        let contour_set = contour_set(vec![left, right], 8, 4);
        let mesh = build_poly_mesh(&mut ctx, &contour_set, 6).unwrap();

        // 4 + 4 corners with the two shared ones welded.
        assert_eq!(mesh.vertices.len(), 6);
        assert_eq!(mesh.polygon_count(), 2);

        // The shared edge connects the two quads in both directions.
        let internal_of = |i: usize| {
            mesh.polygon_neighbours(i)
                .iter()
                .filter(|n| **n != MESH_NULL_IDX && **n & 0x8000 == 0)
                .count()
        };
        assert_eq!(internal_of(0), 1);
        assert_eq!(internal_of(1), 1);
    }

    #[test]
    fn degenerate_contours_are_skipped() {
        let mut ctx = BuildContext::new();
        let degenerate = Contour {
            vertices: vec![uvec4(0, 0, 0, 0), uvec4(1, 0, 0, 0)],
            raw_vertices: Vec::new(),
            region: 1,
            area: Area::WALKABLE,
        };
        let contour_set = contour_set(vec![degenerate, square_contour(4, 2)], 4, 4);
        let mesh = build_poly_mesh(&mut ctx, &contour_set, 6).unwrap();

        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.regions, vec![2]);
    }

    #[test]
    fn vertex_budget_is_enforced() {
        // A single contour with 0xfffe vertices overflows the u16 index space.
        let vertices = (0..0xfffeu32)
            .map(|i| uvec4(i % 256, 0, i / 256, 0))
            .collect();
        let huge = Contour {
            vertices,
            raw_vertices: Vec::new(),
            region: 1,
            area: Area::WALKABLE,
        };
        let mut ctx = BuildContext::new();
        let contour_set = contour_set(vec![huge], 256, 256);

        assert!(matches!(
            build_poly_mesh(&mut ctx, &contour_set, 6),
            Err(BuildError::TooManyVertices(_))
        ));
    }
}
