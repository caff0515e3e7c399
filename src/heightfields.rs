//! The two height-field representations the pipeline is built on.
//!
//! [`Heightfield`] is the *solid* view: every triangle rasterized into vertical spans of
//! occupied voxels, one linked list per grid column. [`OpenHeightfield`] is the inverse:
//! the standable open space above the solid spans, flattened into one array with packed
//! neighbour links so the later stages can treat it as a graph.

use glam::{UVec3, Vec3, Vec3A};

use crate::{
    get_neighbour_index,
    math::{calc_grid_size, dir_offset_x, dir_offset_z},
    Area, BuildContext, ConfigError, MAX_LAYERS, NOT_CONNECTED, SPANS_PER_POOL, SPAN_MAX_HEIGHT,
};

/// A vertical run of solid voxels in one column of a [`Heightfield`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightSpan {
    pub(crate) min: u16,
    pub(crate) max: u16,
    pub(crate) area: Option<Area>,
    pub(crate) next: Option<u32>,
}

impl HeightSpan {
    /// Lowest solid voxel of the span.
    #[inline]
    pub fn min(&self) -> u16 {
        self.min
    }

    /// One above the highest solid voxel of the span; the floor surface.
    #[inline]
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Walkable area of the span's top surface, `None` when unwalkable.
    #[inline]
    pub fn area(&self) -> Option<Area> {
        self.area
    }

    /// Index of the next-higher span in the column.
    #[inline]
    pub fn next(&self) -> Option<u32> {
        self.next
    }
}

/// Arena the spans of a heightfield are drawn from.
///
/// Grows in whole chunks of [`SPANS_PER_POOL`] slots. Freed spans are threaded into an
/// intrusive free list through their `next` field and reused before the arena grows
/// again, so heavy merge churn during rasterization does not balloon memory.
#[derive(Debug, Clone, Default)]
struct SpanPool {
    spans: Vec<HeightSpan>,
    free_head: Option<u32>,
}

impl SpanPool {
    fn alloc(&mut self, span: HeightSpan) -> u32 {
        if let Some(index) = self.free_head {
            self.free_head = self.spans[index as usize].next;
            self.spans[index as usize] = span;
            return index;
        }

        if self.spans.len() == self.spans.capacity() {
            self.spans.reserve_exact(SPANS_PER_POOL);
        }
        self.spans.push(span);
        (self.spans.len() - 1) as u32
    }

    fn free(&mut self, index: u32) {
        self.spans[index as usize].next = self.free_head;
        self.free_head = Some(index);
    }
}

/// A solid height-field: the rasterized world, one span list per (x, z) column.
#[derive(Debug, Clone)]
pub struct Heightfield {
    width: i32,
    height: i32,
    min_bounds: Vec3,
    max_bounds: Vec3,
    cell_size: f32,
    cell_height: f32,
    /// Index of the lowest span per column, laid out x to z.
    columns: Vec<Option<u32>>,
    pool: SpanPool,
}

impl Heightfield {
    /// Creates an empty height-field covering `[min_bounds, max_bounds]`.
    pub fn new(
        min_bounds: Vec3,
        max_bounds: Vec3,
        cell_size: f32,
        cell_height: f32,
    ) -> Result<Self, ConfigError> {
        let (width, height) = calc_grid_size(min_bounds, max_bounds, cell_size);
        let columns = width as i64 * height as i64;
        if width <= 0 || height <= 0 || columns > i32::MAX as i64 {
            return Err(ConfigError::GridTooLarge {
                width: width as i64,
                height: height as i64,
            });
        }

        Ok(Self {
            width,
            height,
            min_bounds,
            max_bounds,
            cell_size,
            cell_height,
            columns: vec![None; columns as usize],
            pool: SpanPool::default(),
        })
    }

    /// Grid width in cells along the x-axis.
    #[inline]
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Grid height in cells along the z-axis.
    #[inline]
    pub fn height(&self) -> i32 {
        self.height
    }

    #[inline]
    pub(crate) fn column_index(&self, x: i32, z: i32) -> usize {
        (x + z * self.width) as usize
    }

    /// Index of the lowest span in the column, if any.
    #[inline]
    pub(crate) fn column_head(&self, x: i32, z: i32) -> Option<u32> {
        self.columns[self.column_index(x, z)]
    }

    #[inline]
    pub(crate) fn span(&self, index: u32) -> &HeightSpan {
        &self.pool.spans[index as usize]
    }

    #[inline]
    pub(crate) fn span_mut(&mut self, index: u32) -> &mut HeightSpan {
        &mut self.pool.spans[index as usize]
    }

    /// The lowest span in the column at `(x, z)`, if any.
    pub fn span_at(&self, x: i32, z: i32) -> Option<&HeightSpan> {
        self.column_head(x, z).map(|index| self.span(index))
    }

    /// Inserts a solid span into column `(x, z)`, merging it with any spans it overlaps.
    ///
    /// The merged span covers the union of the overlapped ranges. Where the merged
    /// ceilings lie within `flag_merge_threshold` voxels of each other the higher area
    /// id wins; otherwise the incoming span's area stands.
    pub(crate) fn add_span(
        &mut self,
        x: i32,
        z: i32,
        min: u16,
        max: u16,
        area: Option<Area>,
        flag_merge_threshold: u16,
    ) {
        let column_index = self.column_index(x, z);
        let mut new_span = HeightSpan {
            min,
            max,
            area,
            next: None,
        };

        let mut previous: Option<u32> = None;
        let mut current = self.columns[column_index];

        // Merge every overlapping span into new_span, unlinking it from the column.
        while let Some(current_index) = current {
            let current_span = self.span(current_index);
            if current_span.min > new_span.max {
                // Current span is completely above the new span; insertion point found.
                break;
            }
            if current_span.max < new_span.min {
                // Current span is completely below the new span, keep walking up.
                previous = Some(current_index);
                current = current_span.next;
                continue;
            }

            let (current_min, current_max, current_area, next) = (
                current_span.min,
                current_span.max,
                current_span.area,
                current_span.next,
            );
            if current_min < new_span.min {
                new_span.min = current_min;
            }
            if current_max > new_span.max {
                new_span.max = current_max;
            }
            if (new_span.max as i32 - current_max as i32).unsigned_abs()
                <= flag_merge_threshold as u32
            {
                // Higher area ids take priority over lower ones.
                new_span.area = new_span.area.max(current_area);
            }

            self.pool.free(current_index);
            if let Some(previous) = previous {
                self.pool.spans[previous as usize].next = next;
            } else {
                self.columns[column_index] = next;
            }
            current = next;
        }

        match previous {
            Some(previous) => {
                new_span.next = self.span(previous).next;
                let new_index = self.pool.alloc(new_span);
                self.pool.spans[previous as usize].next = Some(new_index);
            }
            None => {
                new_span.next = self.columns[column_index];
                let new_index = self.pool.alloc(new_span);
                self.columns[column_index] = Some(new_index);
            }
        }
    }
}

/// Marks triangles whose surface the agent can stand on.
///
/// A triangle is walkable when its upward normal is steeper than
/// `walkable_slope_degrees`; those get [`Area::WALKABLE`], the rest are left untouched.
/// A slope exactly at the limit is unwalkable.
pub fn mark_walkable_triangles(
    walkable_slope_degrees: f32,
    vertices: &[Vec3],
    triangles: &[UVec3],
    areas: &mut [Option<Area>],
) {
    let walkable_threshold = walkable_slope_degrees.to_radians().cos();

    for (triangle, area) in triangles.iter().zip(areas.iter_mut()) {
        let a = vertices[triangle[0] as usize];
        let b = vertices[triangle[1] as usize];
        let c = vertices[triangle[2] as usize];
        let normal = (b - a).cross(c - a).normalize_or_zero();

        if normal.y > walkable_threshold {
            *area = Some(Area::WALKABLE);
        }
    }
}

/// Rasterizes a triangle soup into the height-field.
///
/// `areas` assigns the walkable area per triangle and must be the same length as
/// `triangles`. Triangles outside the grid are silently dropped.
pub fn rasterize_triangles(
    heightfield: &mut Heightfield,
    vertices: &[Vec3],
    triangles: &[UVec3],
    areas: &[Option<Area>],
    flag_merge_threshold: u16,
) {
    let origin = heightfield.min_bounds;

    for (triangle, area) in triangles.iter().zip(areas.iter()) {
        let a = Vec3A::from(vertices[triangle[0] as usize] - origin);
        let b = Vec3A::from(vertices[triangle[1] as usize] - origin);
        let c = Vec3A::from(vertices[triangle[2] as usize] - origin);

        process_triangle(a, b, c, *area, heightfield, flag_merge_threshold);
    }
}

fn process_triangle(
    a: Vec3A,
    b: Vec3A,
    c: Vec3A,
    area: Option<Area>,
    heightfield: &mut Heightfield,
    flag_merge_threshold: u16,
) {
    let cell_size = heightfield.cell_size;
    let cell_height = heightfield.cell_height;
    let bounds_height = heightfield.max_bounds.y - heightfield.min_bounds.y;

    let min_bound = a.min(b).min(c);
    let max_bound = a.max(b).max(c);

    // Check if the triangle is completely outside the grid.
    let min_cell = (min_bound / cell_size).floor().as_ivec3();
    let max_cell = (max_bound / cell_size).floor().as_ivec3();
    if max_cell.x < 0
        || max_cell.z < 0
        || min_cell.x > heightfield.width - 1
        || min_cell.z > heightfield.height - 1
        || max_bound.y < 0.0
        || min_bound.y > bounds_height
    {
        return;
    }

    // Sweep the triangle in ascending z, slicing one cell-sized strip off the
    // remainder per row, then sweep each strip in ascending x the same way. A
    // triangle cut twice along each axis has at most 7 vertices, so fixed buffers
    // suffice.
    let mut remainder = [Vec3A::ZERO; 7];
    remainder[..3].copy_from_slice(&[a, b, c]);
    let mut remainder_count = 3;

    let mut strip = [Vec3A::ZERO; 7];
    let mut sweep_scratch = [Vec3A::ZERO; 7];

    // Starting one row early discards the part of the triangle under the grid.
    let z_begin = min_cell.z.max(-1);
    let z_end = max_cell.z.min(heightfield.height - 1);

    for z in z_begin..=z_end {
        if remainder_count < 3 {
            break;
        }

        let row_ceiling = (z + 1) as f32 * cell_size;
        let (strip_count, carried) = split_convex_polygon(
            &remainder[..remainder_count],
            &mut strip,
            &mut sweep_scratch,
            row_ceiling,
            2,
        );
        std::mem::swap(&mut remainder, &mut sweep_scratch);
        remainder_count = carried;

        if strip_count < 3 || z < 0 {
            continue;
        }

        // Columns this strip touches.
        let mut strip_min_x = strip[0].x;
        let mut strip_max_x = strip[0].x;
        for vertex in strip.iter().take(strip_count).skip(1) {
            strip_min_x = strip_min_x.min(vertex.x);
            strip_max_x = strip_max_x.max(vertex.x);
        }
        let x_begin = ((strip_min_x / cell_size).floor() as i32).max(-1);
        let x_end = ((strip_max_x / cell_size).floor() as i32).min(heightfield.width - 1);

        let mut strip_remainder = strip;
        let mut strip_remainder_count = strip_count;
        let mut cell_piece = [Vec3A::ZERO; 7];
        let mut strip_scratch = [Vec3A::ZERO; 7];

        for x in x_begin..=x_end {
            if strip_remainder_count < 3 {
                break;
            }

            let column_ceiling = (x + 1) as f32 * cell_size;
            let (cell_count, carried) = split_convex_polygon(
                &strip_remainder[..strip_remainder_count],
                &mut cell_piece,
                &mut strip_scratch,
                column_ceiling,
                0,
            );
            std::mem::swap(&mut strip_remainder, &mut strip_scratch);
            strip_remainder_count = carried;

            if cell_count < 3 || x < 0 {
                continue;
            }

            // Quantize the piece's vertical extent into a span.
            let mut floor = cell_piece[0].y;
            let mut ceiling = cell_piece[0].y;
            for vertex in cell_piece.iter().take(cell_count).skip(1) {
                floor = floor.min(vertex.y);
                ceiling = ceiling.max(vertex.y);
            }

            if ceiling < 0.0 || floor > bounds_height {
                continue;
            }
            let floor = floor.max(0.0);
            let ceiling = ceiling.min(bounds_height);

            let span_min = ((floor / cell_height).floor() as i32)
                .clamp(0, SPAN_MAX_HEIGHT as i32 - 1) as u16;
            let span_max = ((ceiling / cell_height).ceil() as i32)
                .clamp(span_min as i32 + 1, SPAN_MAX_HEIGHT as i32)
                as u16;

            heightfield.add_span(x, z, span_min, span_max, area, flag_merge_threshold);
        }
    }
}

/// Splits a convex polygon along the axis-aligned plane `vertex[axis] == offset`.
///
/// The part at or under the plane lands in `below`, the rest in `above`; a vertex
/// exactly on the plane belongs to both, as does the crossing point of any edge the
/// plane cuts. Returns `(below_count, above_count)`.
fn split_convex_polygon(
    input: &[Vec3A],
    below: &mut [Vec3A; 7],
    above: &mut [Vec3A; 7],
    offset: f32,
    axis: usize,
) -> (usize, usize) {
    let mut below_count = 0;
    let mut above_count = 0;

    let mut previous = input[input.len() - 1];
    // Positive while the vertex sits under the plane.
    let mut previous_margin = offset - previous[axis];

    for &vertex in input {
        let margin = offset - vertex[axis];
        let edge_crosses = (margin >= 0.0) != (previous_margin >= 0.0);

        if edge_crosses {
            // The crossing point terminates one part and starts the other.
            let t = previous_margin / (previous_margin - margin);
            let crossing = previous + (vertex - previous) * t;
            below[below_count] = crossing;
            above[above_count] = crossing;
            below_count += 1;
            above_count += 1;

            if margin > 0.0 {
                below[below_count] = vertex;
                below_count += 1;
            } else if margin < 0.0 {
                above[above_count] = vertex;
                above_count += 1;
            }
        } else if margin > 0.0 {
            below[below_count] = vertex;
            below_count += 1;
        } else if margin < 0.0 {
            above[above_count] = vertex;
            above_count += 1;
        } else {
            below[below_count] = vertex;
            below_count += 1;
            above[above_count] = vertex;
            above_count += 1;
        }

        previous = vertex;
        previous_margin = margin;
    }

    (below_count, above_count)
}

/// Column header in an [`OpenHeightfield`]: a run of `count` spans starting at `index`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCell {
    pub index: u32,
    pub count: u8,
}

impl OpenCell {
    /// Range of this cell's spans in [`OpenHeightfield::spans`].
    #[inline]
    pub fn span_range(&self) -> std::ops::Range<usize> {
        self.index as usize..self.index as usize + self.count as usize
    }
}

/// Open walkable space above a solid span: empty voxels with a floor under them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSpan {
    /// Floor voxel.
    pub min: u16,
    /// Open clearance above the floor, clamped to 255; `0xffff` when nothing is above.
    pub height: u16,
    /// Region the span was assigned to; 0 until region building, top bit =
    /// [`crate::BORDER_REG`].
    pub region: u16,
    /// Packed 4x6-bit neighbour layer indices.
    con: u32,
}

impl Default for OpenSpan {
    fn default() -> Self {
        Self {
            min: 0,
            height: 0xffff,
            region: 0,
            con: pack_all_unconnected(),
        }
    }
}

#[inline]
const fn pack_all_unconnected() -> u32 {
    let not_connected = NOT_CONNECTED as u32;
    not_connected | not_connected << 6 | not_connected << 12 | not_connected << 18
}

#[inline]
fn pack_con(word: u32, dir: usize, layer: u8) -> u32 {
    let shift = dir as u32 * 6;
    (word & !(0x3f << shift)) | ((layer as u32 & 0x3f) << shift)
}

impl OpenSpan {
    /// Layer index of the connected span in the neighbour column for `dir`, or `None`.
    ///
    /// The actual span index is the neighbour cell's `index` plus the returned layer.
    #[inline]
    pub fn con(&self, dir: usize) -> Option<u8> {
        let layer = ((self.con >> (dir as u32 * 6)) & 0x3f) as u8;
        (layer != NOT_CONNECTED).then_some(layer)
    }

    #[inline]
    pub(crate) fn set_con(&mut self, dir: usize, layer: Option<u8>) {
        self.con = pack_con(self.con, dir, layer.unwrap_or(NOT_CONNECTED));
    }
}

/// The standable open space of a [`Heightfield`], flattened for graph traversal.
///
/// `cells` holds one `(index, count)` header per column; `spans`, `areas` and
/// `distances` are parallel arrays over all open spans in column-major emission order.
#[derive(Debug, Clone)]
pub struct OpenHeightfield {
    pub width: i32,
    pub height: i32,
    pub min_bounds: Vec3,
    pub max_bounds: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    /// Width of the border strip painted by region building; 0 until then.
    pub border_size: u16,
    /// Highest value in `distances` after the distance field pass.
    pub max_distance: u16,
    /// Number of regions after region building.
    pub max_regions: u16,
    pub cells: Vec<OpenCell>,
    pub spans: Vec<OpenSpan>,
    pub distances: Vec<u16>,
    pub areas: Vec<Option<Area>>,
}

impl OpenHeightfield {
    /// Builds the open height-field from the solid one, consuming it.
    ///
    /// A standable span needs `walkable_height` voxels of clearance; two spans in
    /// neighbouring columns are linked when their shared gap is at least
    /// `walkable_height` and the floor step between them at most `walkable_climb`.
    pub fn from_heightfield(
        ctx: &mut BuildContext,
        heightfield: Heightfield,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Self {
        let width = heightfield.width;
        let height = heightfield.height;

        let mut open = Self {
            width,
            height,
            min_bounds: heightfield.min_bounds,
            max_bounds: heightfield.max_bounds
                + Vec3::new(0.0, walkable_height as f32 * heightfield.cell_height, 0.0),
            cell_size: heightfield.cell_size,
            cell_height: heightfield.cell_height,
            border_size: 0,
            max_distance: 0,
            max_regions: 0,
            cells: vec![OpenCell::default(); (width * height) as usize],
            spans: Vec::new(),
            distances: Vec::new(),
            areas: Vec::new(),
        };

        // First pass: emit the open space above every walkable solid span.
        for z in 0..height {
            for x in 0..width {
                let column_index = (x + z * width) as usize;
                let cell = &mut open.cells[column_index];
                cell.index = open.spans.len() as u32;

                let mut span_iter = heightfield.columns[column_index];
                while let Some(span_index) = span_iter {
                    let span = &heightfield.pool.spans[span_index as usize];
                    span_iter = span.next;

                    if span.area.is_none() {
                        continue;
                    }

                    let floor = span.max;
                    let ceiling = span
                        .next
                        .map(|next| heightfield.pool.spans[next as usize].min);
                    let clearance = match ceiling {
                        Some(ceiling) => (ceiling as i32 - floor as i32).clamp(0, 0xff) as u16,
                        None => 0xffff,
                    };

                    open.spans.push(OpenSpan {
                        min: floor,
                        height: clearance,
                        ..Default::default()
                    });
                    open.areas.push(span.area);
                    cell.count += 1;
                }
            }
        }
        open.distances = vec![0; open.spans.len()];

        link_neighbours(ctx, &mut open, walkable_height, walkable_climb);

        open
    }

    /// Total number of open spans.
    #[inline]
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Resolves a packed connection to a span index.
    #[inline]
    pub(crate) fn neighbour_span_index(&self, cell_index: usize, dir: usize, layer: u8) -> usize {
        let neighbour_cell = get_neighbour_index(self.width as usize, cell_index, dir);
        self.cells[neighbour_cell].index as usize + layer as usize
    }
}

fn link_neighbours(
    ctx: &mut BuildContext,
    open: &mut OpenHeightfield,
    walkable_height: u16,
    walkable_climb: u16,
) {
    let width = open.width;
    let height = open.height;
    let mut max_layer_index = 0usize;

    for z in 0..height {
        for x in 0..width {
            let cell = open.cells[(x + z * width) as usize];

            for i in cell.span_range() {
                let span = open.spans[i];
                let bottom = span.min as i32;
                let top = bottom + span.height as i32;
                let mut con = span.con;

                for dir in 0..4 {
                    let neighbour_x = x + dir_offset_x(dir);
                    let neighbour_z = z + dir_offset_z(dir);
                    if neighbour_x < 0
                        || neighbour_z < 0
                        || neighbour_x >= width
                        || neighbour_z >= height
                    {
                        continue;
                    }

                    let neighbour_cell = open.cells[(neighbour_x + neighbour_z * width) as usize];
                    for (layer, neighbour) in open.spans[neighbour_cell.span_range()]
                        .iter()
                        .enumerate()
                    {
                        let neighbour_bottom = neighbour.min as i32;
                        let neighbour_top = neighbour_bottom + neighbour.height as i32;

                        let gap = top.min(neighbour_top) - bottom.max(neighbour_bottom);
                        if gap >= walkable_height as i32
                            && (neighbour_bottom - bottom).unsigned_abs() <= walkable_climb as u32
                        {
                            if layer > MAX_LAYERS as usize {
                                max_layer_index = max_layer_index.max(layer);
                                continue;
                            }
                            con = pack_con(con, dir, layer as u8);
                            break;
                        }
                    }
                }

                open.spans[i].con = con;
            }
        }
    }

    if max_layer_index > 0 {
        ctx.warn(format!(
            "Open heightfield has a column with more than {MAX_LAYERS} walkable layers \
             (found layer index {max_layer_index}); connections above the limit were dropped"
        ));
    }
}

/// Pulls the walkable area back from every wall by the agent radius.
///
/// Spans strictly closer than `walkable_radius` to an unwalkable span (chamfer metric,
/// 2 per orthogonal step) are demoted to unwalkable, so the polygon mesh can be
/// navigated by the agent's center point.
pub fn erode_walkable_area(open: &mut OpenHeightfield, walkable_radius: u16) {
    let mut distances = vec![0u16; open.span_count()];

    // Mark boundary spans: unwalkable, or missing/unwalkable neighbours.
    for cell_index in 0..open.cells.len() {
        let cell = open.cells[cell_index];
        for i in cell.span_range() {
            if open.areas[i].is_none() {
                distances[i] = 0;
                continue;
            }

            let span = &open.spans[i];
            let all_neighbours = (0..4).all(|dir| {
                span.con(dir).is_some_and(|layer| {
                    open.areas[open.neighbour_span_index(cell_index, dir, layer)].is_some()
                })
            });

            distances[i] = if all_neighbours { u16::MAX } else { 0 };
        }
    }

    propagate_chamfer(open, &mut distances);

    // Any span within 2*walkable_radius is considered unwalkable. This ensures
    // characters won't clip into walls.
    let threshold = walkable_radius.saturating_mul(2);
    for (area, distance) in open.areas.iter_mut().zip(distances.iter()) {
        if *distance < threshold {
            *area = None;
        }
    }
}

/// Builds the distance-to-boundary field used by watershed partitioning.
///
/// A boundary is any area transition. The raw chamfer field is box-blurred once;
/// `max_distance` is recorded from the unblurred field.
pub fn calculate_distance_field(open: &mut OpenHeightfield) {
    let mut distances = vec![u16::MAX; open.span_count()];

    // Mark boundary spans.
    for cell_index in 0..open.cells.len() {
        let cell = open.cells[cell_index];
        for i in cell.span_range() {
            let area = open.areas[i];
            let span = &open.spans[i];

            let all_neighbours = (0..4).all(|dir| {
                span.con(dir).is_some_and(|layer| {
                    open.areas[open.neighbour_span_index(cell_index, dir, layer)] == area
                })
            });

            if !all_neighbours {
                distances[i] = 0;
            }
        }
    }

    propagate_chamfer(open, &mut distances);

    open.max_distance = distances.iter().max().copied().unwrap_or(0);

    // Box blur.
    let threshold = 2;
    let mut blurred = vec![0u16; distances.len()];

    for cell_index in 0..open.cells.len() {
        let cell = open.cells[cell_index];
        for i in cell.span_range() {
            let span = &open.spans[i];
            let distance = distances[i];
            if distance <= threshold {
                blurred[i] = distance;
                continue;
            }

            let mut d = distance as u32;
            for dir in 0..4 {
                let Some(layer) = span.con(dir) else {
                    d += distance as u32 * 2;
                    continue;
                };

                let other_cell_index = get_neighbour_index(open.width as usize, cell_index, dir);
                let other_span_index = open.cells[other_cell_index].index as usize + layer as usize;
                d += distances[other_span_index] as u32;

                let next_dir = (dir + 1) & 0x3;
                let Some(layer) = open.spans[other_span_index].con(next_dir) else {
                    d += distance as u32;
                    continue;
                };

                let diagonal_span_index =
                    open.neighbour_span_index(other_cell_index, next_dir, layer);
                d += distances[diagonal_span_index] as u32;
            }

            // Apply distance change.
            blurred[i] = ((d + 5) / 9) as u16;
        }
    }

    open.distances = blurred;
}

/// Two-pass chamfer 2-3 distance transform over the span graph.
fn propagate_chamfer(open: &OpenHeightfield, distances: &mut [u16]) {
    let width = open.width as usize;

    // Pass 1.
    for cell_index in 0..open.cells.len() {
        let cell = open.cells[cell_index];
        for i in cell.span_range() {
            let span = &open.spans[i];
            let mut distance = distances[i];

            if let Some(layer) = span.con(0) {
                // (-1, 0)
                let other_cell_index = cell_index - 1;
                let other_span_index = open.cells[other_cell_index].index as usize + layer as usize;
                distance = distance.min(distances[other_span_index].saturating_add(2));

                // (-1, -1)
                if let Some(layer) = open.spans[other_span_index].con(3) {
                    let diagonal_span_index =
                        open.cells[other_cell_index - width].index as usize + layer as usize;
                    distance = distance.min(distances[diagonal_span_index].saturating_add(3));
                }
            }

            if let Some(layer) = span.con(3) {
                // (0, -1)
                let other_cell_index = cell_index - width;
                let other_span_index = open.cells[other_cell_index].index as usize + layer as usize;
                distance = distance.min(distances[other_span_index].saturating_add(2));

                // (1, -1)
                if let Some(layer) = open.spans[other_span_index].con(2) {
                    let diagonal_span_index =
                        open.cells[other_cell_index + 1].index as usize + layer as usize;
                    distance = distance.min(distances[diagonal_span_index].saturating_add(3));
                }
            }

            distances[i] = distance;
        }
    }

    // Pass 2.
    for cell_index in (0..open.cells.len()).rev() {
        let cell = open.cells[cell_index];
        for i in cell.span_range() {
            let span = &open.spans[i];
            let mut distance = distances[i];

            if let Some(layer) = span.con(2) {
                // (1, 0)
                let other_cell_index = cell_index + 1;
                let other_span_index = open.cells[other_cell_index].index as usize + layer as usize;
                distance = distance.min(distances[other_span_index].saturating_add(2));

                // (1, 1)
                if let Some(layer) = open.spans[other_span_index].con(1) {
                    let diagonal_span_index =
                        open.cells[other_cell_index + width].index as usize + layer as usize;
                    distance = distance.min(distances[diagonal_span_index].saturating_add(3));
                }
            }

            if let Some(layer) = span.con(1) {
                // (0, 1)
                let other_cell_index = cell_index + width;
                let other_span_index = open.cells[other_cell_index].index as usize + layer as usize;
                distance = distance.min(distances[other_span_index].saturating_add(2));

                // (-1, 1)
                if let Some(layer) = open.spans[other_span_index].con(0) {
                    let diagonal_span_index =
                        open.cells[other_cell_index - 1].index as usize + layer as usize;
                    distance = distance.min(distances[diagonal_span_index].saturating_add(3));
                }
            }

            distances[i] = distance;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::uvec3;

    fn heightfield() -> Heightfield {
        Heightfield::new(Vec3::ZERO, Vec3::new(5.0, 5.0, 5.0), 1.0, 1.0).unwrap()
    }

    fn collect_column(heightfield: &Heightfield, x: i32, z: i32) -> Vec<(u16, u16, Option<Area>)> {
        let mut spans = Vec::new();
        let mut iter = heightfield.column_head(x, z);
        while let Some(index) = iter {
            let span = heightfield.span(index);
            spans.push((span.min, span.max, span.area));
            iter = span.next;
        }
        spans
    }

    fn assert_column_sorted(heightfield: &Heightfield, x: i32, z: i32) {
        let spans = collect_column(heightfield, x, z);
        for pair in spans.windows(2) {
            assert!(
                pair[0].1 < pair[1].0,
                "spans overlap or touch out of order: {pair:?}"
            );
        }
    }

    #[test]
    fn adding_touching_spans_merges_them() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 1, Some(Area(42)), 1);
        heightfield.add_span(0, 0, 1, 2, Some(Area(42)), 1);

        assert_eq!(
            collect_column(&heightfield, 0, 0),
            vec![(0, 2, Some(Area(42)))]
        );
    }

    #[test]
    fn bridging_span_merges_the_whole_column() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 1, Some(Area(42)), 1);
        heightfield.add_span(0, 0, 2, 3, Some(Area(42)), 1);
        assert_eq!(collect_column(&heightfield, 0, 0).len(), 2);

        heightfield.add_span(0, 0, 1, 2, Some(Area(42)), 1);
        assert_eq!(
            collect_column(&heightfield, 0, 0),
            vec![(0, 3, Some(Area(42)))]
        );
    }

    #[test]
    fn disjoint_spans_stay_sorted() {
        let mut heightfield = heightfield();
        heightfield.add_span(1, 3, 7, 10, None, 0);
        heightfield.add_span(1, 3, 2, 4, Some(Area(5)), 0);
        heightfield.add_span(1, 3, 12, 14, Some(Area(1)), 0);

        assert_eq!(
            collect_column(&heightfield, 1, 3),
            vec![
                (2, 4, Some(Area(5))),
                (7, 10, None),
                (12, 14, Some(Area(1))),
            ]
        );
        assert_column_sorted(&heightfield, 1, 3);
    }

    #[test]
    fn area_merge_respects_threshold() {
        // Ceilings one voxel apart with threshold 1: higher area id wins.
        {
            let mut heightfield = heightfield();
            heightfield.add_span(0, 0, 0, 3, Some(Area(7)), 1);
            heightfield.add_span(0, 0, 0, 4, Some(Area(2)), 1);
            assert_eq!(
                collect_column(&heightfield, 0, 0),
                vec![(0, 4, Some(Area(7)))]
            );
        }

        // Ceilings far apart: the incoming area stands.
        let mut heightfield2 = heightfield();
        heightfield2.add_span(1, 0, 0, 1, Some(Area(7)), 1);
        heightfield2.add_span(1, 0, 0, 4, Some(Area(2)), 1);
        assert_eq!(
            collect_column(&heightfield2, 1, 0),
            vec![(0, 4, Some(Area(2)))]
        );
    }

    #[test]
    fn freed_spans_are_reused() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 1, None, 0);
        heightfield.add_span(0, 0, 2, 3, None, 0);
        heightfield.add_span(0, 0, 4, 5, None, 0);
        let allocated = heightfield.pool.spans.len();

        // Merging the column frees two spans; the next adds must not grow the pool.
        heightfield.add_span(0, 0, 1, 4, None, 0);
        heightfield.add_span(0, 0, 6, 7, None, 0);
        heightfield.add_span(0, 0, 8, 9, None, 0);
        assert_eq!(heightfield.pool.spans.len(), allocated);
    }

    #[test]
    fn marks_triangles_by_slope() {
        let vertices = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, -1.0),
        ];
        let up = [uvec3(0, 1, 2)];
        let down = [uvec3(2, 1, 0)];

        let mut areas = [None];
        mark_walkable_triangles(45.0, &vertices, &up, &mut areas);
        assert_eq!(areas, [Some(Area::WALKABLE)]);

        let mut areas = [None];
        mark_walkable_triangles(45.0, &vertices, &down, &mut areas);
        assert_eq!(areas, [None]);

        // A slope limit of zero walks nothing; the slope equal to the limit is out.
        let mut areas = [None];
        mark_walkable_triangles(0.0, &vertices, &up, &mut areas);
        assert_eq!(areas, [None]);
    }

    #[test]
    fn rasterization_is_idempotent() {
        let vertices = [
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(4.5, 0.5, 0.5),
            Vec3::new(0.5, 0.5, 4.5),
        ];
        let triangles = [uvec3(0, 1, 2)];
        let areas = [Some(Area::WALKABLE)];

        let mut once = heightfield();
        rasterize_triangles(&mut once, &vertices, &triangles, &areas, 1);

        let mut twice = heightfield();
        rasterize_triangles(&mut twice, &vertices, &triangles, &areas, 1);
        rasterize_triangles(&mut twice, &vertices, &triangles, &areas, 1);

        for z in 0..5 {
            for x in 0..5 {
                assert_eq!(
                    collect_column(&once, x, z),
                    collect_column(&twice, x, z),
                    "column ({x}, {z}) changed on re-rasterization"
                );
                assert_column_sorted(&twice, x, z);
            }
        }
    }

    #[test]
    fn triangles_outside_the_grid_are_dropped() {
        let mut heightfield = heightfield();
        let vertices = [
            Vec3::new(10.0, 0.5, 10.0),
            Vec3::new(12.0, 0.5, 10.0),
            Vec3::new(10.0, 0.5, 12.0),
        ];
        rasterize_triangles(
            &mut heightfield,
            &vertices,
            &[uvec3(0, 1, 2)],
            &[Some(Area::WALKABLE)],
            1,
        );
        assert!(heightfield.pool.spans.is_empty());
    }

    fn flat_plane_open() -> OpenHeightfield {
        let mut heightfield = heightfield();
        let vertices = [
            Vec3::new(0.0, 0.4, 0.0),
            Vec3::new(5.0, 0.4, 0.0),
            Vec3::new(5.0, 0.4, 5.0),
            Vec3::new(0.0, 0.4, 5.0),
        ];
        let triangles = [uvec3(0, 2, 1), uvec3(0, 3, 2)];
        let areas = [Some(Area::WALKABLE); 2];
        rasterize_triangles(&mut heightfield, &vertices, &triangles, &areas, 1);

        let mut ctx = BuildContext::new();
        OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1)
    }

    #[test]
    fn open_heightfield_covers_the_plane() {
        let open = flat_plane_open();
        assert_eq!(open.span_count(), 25);
        for cell in &open.cells {
            assert_eq!(cell.count, 1);
        }
        // Topmost spans have unbounded clearance.
        assert!(open.spans.iter().all(|span| span.height == 0xffff));
    }

    #[test]
    fn connections_are_symmetric() {
        let open = flat_plane_open();
        for cell_index in 0..open.cells.len() {
            let cell = open.cells[cell_index];
            for i in cell.span_range() {
                for dir in 0..4 {
                    let Some(layer) = open.spans[i].con(dir) else {
                        continue;
                    };
                    let neighbour = open.neighbour_span_index(cell_index, dir, layer);
                    let opposite = (dir + 2) & 0x3;
                    let neighbour_cell =
                        get_neighbour_index(open.width as usize, cell_index, dir);
                    let back = open.spans[neighbour].con(opposite).map(|layer| {
                        open.neighbour_span_index(neighbour_cell, opposite, layer)
                    });
                    assert_eq!(back, Some(i), "asymmetric link at span {i} dir {dir}");
                }
            }
        }
    }

    #[test]
    fn packed_connections_round_trip() {
        let mut span = OpenSpan::default();
        for dir in 0..4 {
            assert_eq!(span.con(dir), None);
        }
        span.set_con(1, Some(5));
        span.set_con(3, Some(MAX_LAYERS));
        assert_eq!(span.con(0), None);
        assert_eq!(span.con(1), Some(5));
        assert_eq!(span.con(2), None);
        assert_eq!(span.con(3), Some(MAX_LAYERS));
        span.set_con(1, None);
        assert_eq!(span.con(1), None);
        assert_eq!(span.con(3), Some(MAX_LAYERS));
    }

    #[test]
    fn clearance_is_clamped_to_a_byte() {
        let mut heightfield =
            Heightfield::new(Vec3::ZERO, Vec3::new(5.0, 400.0, 5.0), 1.0, 1.0).unwrap();
        heightfield.add_span(0, 0, 0, 1, Some(Area::WALKABLE), 0);
        heightfield.add_span(0, 0, 300, 310, Some(Area::WALKABLE), 0);

        let mut ctx = BuildContext::new();
        let open = OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1);

        let cell = open.cells[0];
        assert_eq!(cell.count, 2);
        // 299 voxels of air above the lower floor store as the 255 cap; the top span
        // is unbounded.
        assert_eq!(open.spans[cell.index as usize].height, 0xff);
        assert_eq!(open.spans[cell.index as usize + 1].height, 0xffff);
    }

    #[test]
    fn rebuilding_the_open_heightfield_changes_nothing() {
        let mut heightfield = heightfield();
        let vertices = [
            Vec3::new(0.0, 0.4, 0.0),
            Vec3::new(5.0, 0.4, 0.0),
            Vec3::new(5.0, 2.4, 5.0),
            Vec3::new(0.0, 2.4, 5.0),
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
        let first = OpenHeightfield::from_heightfield(&mut ctx, heightfield.clone(), 3, 1);
        let second = OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1);

        assert_eq!(first.cells, second.cells);
        assert_eq!(first.spans, second.spans);
        assert_eq!(first.areas, second.areas);
    }

    #[test]
    fn erosion_shrinks_the_walkable_area() {
        let mut open = flat_plane_open();
        erode_walkable_area(&mut open, 1);

        // A 5x5 plane eroded by one voxel keeps only the 3x3 interior.
        let walkable = open.areas.iter().filter(|area| area.is_some()).count();
        assert_eq!(walkable, 9);
    }

    #[test]
    fn distance_field_peaks_in_the_middle() {
        let mut open = flat_plane_open();
        calculate_distance_field(&mut open);

        // The centre span of a 5x5 plane is two steps from the boundary.
        let centre = open.cells[(2 + 2 * open.width) as usize].index as usize;
        assert_eq!(open.max_distance, 4);
        assert!(open.distances[centre] >= open.distances[open.cells[0].index as usize]);
    }
}
