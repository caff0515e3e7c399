//! Region partitioning: groups walkable spans into contiguous regions whose contours
//! can later be traced without self-intersecting.
//!
//! Two strategies are available. [`build_regions_monotone`] sweeps the grid row by row
//! and merges runs against the previous row; it is cheap and cannot produce overlapping
//! regions. [`build_regions`] floods regions out from the distance-field maxima
//! (watershed), which gives rounder regions on open ground. Both paint a
//! [`BORDER_REG`]-flagged strip around the grid first when a border size is set, and
//! both finish with the same small-region filter and merge pass.

use smallvec::SmallVec;

use crate::{
    get_neighbour_index,
    heightfields::OpenHeightfield,
    Area, BuildContext, BuildError, BORDER_REG,
};

const EXPAND_ITERS: i32 = 8;
const LOG_NB_STACKS: i32 = 3;
const NB_STACKS: i32 = 1 << LOG_NB_STACKS; // 8.

/// A span queued for region expansion; `index` is flipped negative once consumed.
#[derive(Default, Clone, Copy)]
struct LevelStackEntry {
    cell_index: u32,
    index: i32,
}

/// Allocates the next region id. 0xffff is reserved; reaching it aborts the build.
#[inline]
fn next_region_id(region_id: u16) -> Result<u16, BuildError> {
    if region_id >= 0xfffe {
        return Err(BuildError::RegionIdOverflow);
    }
    Ok(region_id + 1)
}

/// Partitions the walkable surface with a distance-field watershed.
///
/// Fails only when the region id space overflows. On success every walkable span has a
/// region id in [`crate::heightfields::OpenSpan::region`] and
/// [`OpenHeightfield::max_regions`] is set.
pub fn build_regions(
    ctx: &mut BuildContext,
    open: &mut OpenHeightfield,
    border_size: u16,
    min_region_area: u32,
    merge_region_area: u32,
) -> Result<(), BuildError> {
    let mut regions = vec![0u16; open.span_count()];
    let mut distances = vec![0u16; open.span_count()];
    let mut dirty_entries = Vec::with_capacity(512);

    let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS as usize] = Default::default();
    for stack in level_stacks.iter_mut() {
        stack.reserve(256);
    }
    let mut stack = Vec::with_capacity(256);

    let mut region_id: u16 = 1;
    region_id = paint_borders(open, &mut regions, border_size, region_id)?;

    let mut level = (open.max_distance + 1) & !1u16;
    let mut stack_id: i32 = -1;

    while level > 0 {
        level = level.saturating_sub(2);
        stack_id = (stack_id + 1) & (NB_STACKS - 1);

        if stack_id == 0 {
            sort_cells_by_level(level, open, &mut level_stacks, &regions);
        } else {
            // Append unhandled spans from the previous level band.
            let (processed, pending) = level_stacks.split_at_mut(stack_id as usize);
            let previous_stack = &processed[stack_id as usize - 1];
            let next_stack = &mut pending[0];
            for entry in previous_stack {
                if entry.index < 0 || regions[entry.index as usize] != 0 {
                    continue;
                }
                next_stack.push(*entry);
            }
        }

        // Expand current regions until no new spans join at this level.
        expand_regions(
            EXPAND_ITERS,
            level,
            open,
            &mut regions,
            &mut distances,
            &mut level_stacks[stack_id as usize],
            &mut dirty_entries,
            false,
        );

        // Flood fresh regions from spans no existing region reached.
        for entry_index in 0..level_stacks[stack_id as usize].len() {
            let entry = level_stacks[stack_id as usize][entry_index];
            if entry.index >= 0
                && regions[entry.index as usize] == 0
                && flood_region(
                    entry,
                    level,
                    region_id,
                    open,
                    &mut regions,
                    &mut distances,
                    &mut stack,
                )
            {
                region_id = next_region_id(region_id)?;
            }
        }
    }

    // Expand current regions until no empty connected cells are found.
    expand_regions(
        EXPAND_ITERS * 8,
        0,
        open,
        &mut regions,
        &mut distances,
        &mut stack,
        &mut dirty_entries,
        true,
    );

    // Merge regions and filter out small ones.
    let overlaps = merge_and_filter_regions(
        min_region_area,
        merge_region_area,
        &mut region_id,
        open,
        &mut regions,
    );
    if !overlaps.is_empty() {
        ctx.warn(format!(
            "{} overlapping regions found during watershed partitioning; \
             the resulting mesh may have overlapping polygons",
            overlaps.len()
        ));
    }

    open.border_size = border_size;
    open.max_regions = region_id;

    // Write results into spans.
    for (span, region) in open.spans.iter_mut().zip(regions.iter()) {
        span.region = *region;
    }

    Ok(())
}

/// Partitions the walkable surface with a monotone row sweep.
///
/// Runs of connected spans get row-local ids which are merged with the previous row's
/// region exactly when that region is the run's only predecessor. Regions produced this
/// way never overlap, at the cost of sometimes being long and thin.
pub fn build_regions_monotone(
    _ctx: &mut BuildContext,
    open: &mut OpenHeightfield,
    border_size: u16,
    min_region_area: u32,
    merge_region_area: u32,
) -> Result<(), BuildError> {
    const NULL_NEI: u16 = 0xffff;

    #[derive(Default, Clone, Copy)]
    struct SweepSpan {
        /// Number of samples merged into the run's neighbour.
        samples: u32,
        /// Candidate region id in the previous row, `NULL_NEI` when ambiguous.
        neighbour: u16,
        /// Final region id assigned to the run.
        id: u16,
    }

    let width = open.width;
    let height = open.height;

    let mut source_regions = vec![0u16; open.span_count()];
    let mut region_id: u16 = 1;
    region_id = paint_borders(open, &mut source_regions, border_size, region_id)?;

    let border = (border_size as i32).min(width / 2).min(height / 2);
    let mut sweeps: Vec<SweepSpan> = Vec::with_capacity(width.max(8) as usize);
    let mut previous_counts: Vec<u32> = Vec::new();

    for z in border..height - border {
        // Collect spans from this row.
        previous_counts.clear();
        previous_counts.resize(region_id as usize + 1, 0);
        sweeps.clear();
        sweeps.push(SweepSpan::default()); // Row-local ids are 1-based.

        for x in border..width - border {
            let cell_index = (x + z * width) as usize;
            let cell = open.cells[cell_index];

            for i in cell.span_range() {
                if open.areas[i].is_none() {
                    continue;
                }
                let span = open.spans[i];

                // -x neighbour: continue its run when it belongs to this row.
                let mut run_id: u16 = 0;
                if let Some(layer) = span.con(0) {
                    let neighbour = open.neighbour_span_index(cell_index, 0, layer);
                    let neighbour_region = source_regions[neighbour];
                    if neighbour_region & BORDER_REG == 0
                        && open.areas[i] == open.areas[neighbour]
                    {
                        run_id = neighbour_region;
                    }
                }

                if run_id == 0 {
                    sweeps.push(SweepSpan::default());
                    run_id = (sweeps.len() - 1) as u16;
                }

                // -z neighbour: vote for a previous-row region to merge with.
                if let Some(layer) = span.con(3) {
                    let neighbour = open.neighbour_span_index(cell_index, 3, layer);
                    let neighbour_region = source_regions[neighbour];
                    if neighbour_region != 0
                        && neighbour_region & BORDER_REG == 0
                        && open.areas[i] == open.areas[neighbour]
                    {
                        let sweep = &mut sweeps[run_id as usize];
                        // Set neighbour when the first valid one is encountered.
                        if sweep.samples == 0 {
                            sweep.neighbour = neighbour_region;
                        }
                        if sweep.neighbour == neighbour_region {
                            sweep.samples += 1;
                            previous_counts[neighbour_region as usize] += 1;
                        } else {
                            sweep.neighbour = NULL_NEI;
                        }
                    }
                }

                source_regions[i] = run_id;
            }
        }

        // Create unique ids: a run joins its previous-row neighbour only when it was
        // that region's sole successor (the histogram agrees with the sample count).
        for sweep in sweeps.iter_mut().skip(1) {
            if sweep.neighbour != NULL_NEI
                && sweep.neighbour != 0
                && previous_counts[sweep.neighbour as usize] == sweep.samples
            {
                sweep.id = sweep.neighbour;
            } else {
                sweep.id = region_id;
                region_id = next_region_id(region_id)?;
            }
        }

        // Remap row-local ids to region ids.
        for x in border..width - border {
            let cell = open.cells[(x + z * width) as usize];
            for i in cell.span_range() {
                if source_regions[i] > 0 && source_regions[i] & BORDER_REG == 0 {
                    source_regions[i] = sweeps[source_regions[i] as usize].id;
                }
            }
        }
    }

    // Merge regions and filter out small ones. Monotone regions cannot overlap.
    merge_and_filter_regions(
        min_region_area,
        merge_region_area,
        &mut region_id,
        open,
        &mut source_regions,
    );

    open.border_size = border_size;
    open.max_regions = region_id;

    for (span, region) in open.spans.iter_mut().zip(source_regions.iter()) {
        span.region = *region;
    }

    Ok(())
}

/// Paints the four border strips with fresh `BORDER_REG`-flagged ids.
fn paint_borders(
    open: &OpenHeightfield,
    regions: &mut [u16],
    border_size: u16,
    mut region_id: u16,
) -> Result<u16, BuildError> {
    if border_size == 0 {
        return Ok(region_id);
    }

    let width = open.width;
    let height = open.height;
    let border_width = (border_size as i32).min(width);
    let border_height = (border_size as i32).min(height);

    let strips = [
        (0, border_width, 0, height),
        (width - border_width, width, 0, height),
        (0, width, 0, border_height),
        (0, width, height - border_height, height),
    ];

    for (min_x, max_x, min_z, max_z) in strips {
        paint_rect_region(open, regions, min_x, max_x, min_z, max_z, BORDER_REG | region_id);
        region_id = next_region_id(region_id)?;
    }

    Ok(region_id)
}

fn paint_rect_region(
    open: &OpenHeightfield,
    regions: &mut [u16],
    min_x: i32,
    max_x: i32,
    min_z: i32,
    max_z: i32,
    region_id: u16,
) {
    for z in min_z..max_z {
        for x in min_x..max_x {
            let cell = open.cells[(x + z * open.width) as usize];
            for i in cell.span_range() {
                if open.areas[i].is_some() {
                    regions[i] = region_id;
                }
            }
        }
    }
}

fn sort_cells_by_level(
    start_level: u16,
    open: &OpenHeightfield,
    stacks: &mut [Vec<LevelStackEntry>; NB_STACKS as usize],
    regions: &[u16],
) {
    let start_level = (start_level >> 1) as i32;

    for stack in stacks.iter_mut() {
        stack.clear();
    }

    for (cell_index, cell) in open.cells.iter().enumerate() {
        for i in cell.span_range() {
            if open.areas[i].is_none() || regions[i] != 0 {
                continue;
            }

            let level = (open.distances[i] >> 1) as i32;
            let stack_id = (start_level - level).max(0);
            if stack_id >= NB_STACKS {
                continue;
            }

            stacks[stack_id as usize].push(LevelStackEntry {
                cell_index: cell_index as u32,
                index: i as i32,
            });
        }
    }
}

struct DirtyEntry {
    index: i32,
    region: u16,
    distance: u16,
}

#[allow(clippy::too_many_arguments)]
fn expand_regions(
    max_iterations: i32,
    level: u16,
    open: &OpenHeightfield,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
    dirty_entries: &mut Vec<DirtyEntry>,
    fill_stack: bool,
) {
    if fill_stack {
        // Find cells revealed by the raised water level.
        stack.clear();
        for (cell_index, cell) in open.cells.iter().enumerate() {
            for i in cell.span_range() {
                if open.distances[i] >= level && regions[i] == 0 && open.areas[i].is_some() {
                    stack.push(LevelStackEntry {
                        cell_index: cell_index as u32,
                        index: i as i32,
                    });
                }
            }
        }
    } else {
        // Use the current stack; skip spans that already got a region.
        for entry in stack.iter_mut() {
            if entry.index >= 0 && regions[entry.index as usize] != 0 {
                entry.index = -1;
            }
        }
    }

    let mut iteration = 0;
    loop {
        let mut failed = 0;
        dirty_entries.clear();

        for entry in stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }
            let i = entry.index as usize;

            let mut new_region = regions[i];
            let mut new_distance = u16::MAX;
            let area = open.areas[i];
            let span = &open.spans[i];

            for dir in 0..4 {
                let Some(layer) = span.con(dir) else {
                    continue;
                };

                let neighbour = open.neighbour_span_index(entry.cell_index as usize, dir, layer);
                if open.areas[neighbour] != area {
                    continue;
                }

                let neighbour_region = regions[neighbour];
                if neighbour_region > 0 && neighbour_region & BORDER_REG == 0 {
                    let candidate = distances[neighbour].saturating_add(2);
                    if candidate < new_distance {
                        new_region = neighbour_region;
                        new_distance = candidate;
                    }
                }
            }

            if new_region != 0 {
                entry.index = -1;
                dirty_entries.push(DirtyEntry {
                    index: i as i32,
                    region: new_region,
                    distance: new_distance,
                });
            } else {
                failed += 1;
            }
        }

        // Apply after the sweep so in-flight reads stay consistent.
        for entry in dirty_entries.iter() {
            regions[entry.index as usize] = entry.region;
            distances[entry.index as usize] = entry.distance;
        }

        if failed == stack.len() {
            break;
        }
        if level > 0 {
            iteration += 1;
            if iteration >= max_iterations {
                break;
            }
        }
    }
}

fn flood_region(
    entry: LevelStackEntry,
    level: u16,
    region_id: u16,
    open: &OpenHeightfield,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    stack.clear();
    stack.push(entry);

    let area = open.areas[entry.index as usize];
    regions[entry.index as usize] = region_id;
    distances[entry.index as usize] = 0;

    let level = level.saturating_sub(2);
    let mut expanded_any = false;

    while let Some(entry) = stack.pop() {
        let i = entry.index as usize;
        let cell_index = entry.cell_index as usize;
        let span = &open.spans[i];

        // A neighbour carrying a different region vetoes the assignment.
        let mut has_adjacent_region = false;
        for dir in 0..4 {
            let Some(layer) = span.con(dir) else {
                continue;
            };
            let neighbour_cell = get_neighbour_index(open.width as usize, cell_index, dir);
            let neighbour = open.cells[neighbour_cell].index as usize + layer as usize;
            if open.areas[neighbour] != area {
                continue;
            }

            let neighbour_region = regions[neighbour];
            if neighbour_region & BORDER_REG != 0 {
                // Do not take borders into account.
                continue;
            }
            if neighbour_region != 0 && neighbour_region != region_id {
                has_adjacent_region = true;
                break;
            }

            let next_dir = (dir + 1) & 0x3;
            if let Some(layer) = open.spans[neighbour].con(next_dir) {
                let diagonal = open.neighbour_span_index(neighbour_cell, next_dir, layer);
                if open.areas[diagonal] != area {
                    continue;
                }
                let diagonal_region = regions[diagonal];
                if diagonal_region & BORDER_REG != 0 {
                    continue;
                }
                if diagonal_region != 0 && diagonal_region != region_id {
                    has_adjacent_region = true;
                    break;
                }
            }
        }

        if has_adjacent_region {
            regions[i] = 0;
            continue;
        }
        expanded_any = true;

        // Expand neighbours.
        for dir in 0..4 {
            let Some(layer) = span.con(dir) else {
                continue;
            };

            let neighbour_cell = get_neighbour_index(open.width as usize, cell_index, dir);
            let neighbour = open.cells[neighbour_cell].index as usize + layer as usize;
            if open.areas[neighbour] != area {
                continue;
            }

            if open.distances[neighbour] >= level && regions[neighbour] == 0 {
                regions[neighbour] = region_id;
                distances[neighbour] = 0;
                stack.push(LevelStackEntry {
                    cell_index: neighbour_cell as u32,
                    index: neighbour as i32,
                });
            }
        }
    }

    expanded_any
}

struct Region {
    id: u16,
    span_count: usize,
    area: Option<Area>,
    remap: bool,
    visited: bool,
    overlap: bool,
    floors: SmallVec<[u16; 4]>,
    connections: SmallVec<[u16; 8]>,
}

impl Region {
    fn new(id: u16) -> Self {
        Self {
            id,
            span_count: 0,
            area: None,
            remap: false,
            visited: false,
            overlap: false,
            floors: SmallVec::new(),
            connections: SmallVec::new(),
        }
    }
}

/// Removes small isolated regions, merges small ones into neighbours, and compacts the
/// surviving ids into a dense range. Returns the ids of overlapping regions.
fn merge_and_filter_regions(
    min_region_area: u32,
    merge_region_area: u32,
    max_region_id: &mut u16,
    open: &OpenHeightfield,
    source_regions: &mut [u16],
) -> Vec<u16> {
    let region_count = *max_region_id as usize;
    let mut regions: Vec<Region> = (0..region_count).map(|i| Region::new(i as u16)).collect();

    // Gather region sizes, floor stacks, and boundary connection loops.
    for (cell_index, cell) in open.cells.iter().enumerate() {
        for i in cell.span_range() {
            let region_id = source_regions[i];
            if region_id == 0 || region_id as usize >= region_count {
                continue;
            }

            let region = &mut regions[region_id as usize];
            region.span_count += 1;

            // Update floors: other spans stacked in the same column.
            for other in cell.span_range() {
                if other == i {
                    continue;
                }
                let floor_id = source_regions[other];
                if floor_id == 0 || floor_id as usize >= region_count {
                    continue;
                }
                if floor_id == region_id {
                    region.overlap = true;
                }
                add_unique_floor_region(region, floor_id);
            }

            // Contour already exists.
            if !region.connections.is_empty() {
                continue;
            }

            region.area = open.areas[i];

            // The span is on a region boundary if it has a solid edge; walk the whole
            // boundary to list the neighbouring regions in order.
            let edge_dir =
                (0..4).find(|&dir| is_solid_edge(open, i, cell_index, dir, source_regions));
            if let Some(dir) = edge_dir {
                let mut connections = SmallVec::new();
                walk_region_boundary(cell_index, i, dir, open, source_regions, &mut connections);
                regions[region_id as usize].connections = connections;
            }
        }
    }

    // Remove too small regions: trace connected components and drop those below
    // min_region_area that never touch the grid border.
    let mut stack: Vec<u16> = Vec::with_capacity(32);
    let mut trace: Vec<u16> = Vec::with_capacity(32);
    let mut connections: Vec<u16> = Vec::with_capacity(16);

    for i in 0..region_count {
        {
            let region = &mut regions[i];
            if region.id == 0 || region.span_count == 0 || region.visited {
                continue;
            }
            region.visited = true;
        }

        stack.clear();
        trace.clear();
        stack.push(i as u16);

        let mut span_count = 0;
        let mut connects_to_border = false;

        while let Some(region_index) = stack.pop() {
            connections.clear();
            trace.push(region_index);

            {
                let region = &regions[region_index as usize];
                connections.extend(region.connections.iter().copied());
                span_count += region.span_count;
            }

            for connected in &connections {
                if connected & BORDER_REG != 0 {
                    connects_to_border = true;
                    continue;
                }
                if *connected == 0 {
                    continue;
                }
                let connected_region = &mut regions[*connected as usize];
                if connected_region.visited || connected_region.id == 0 {
                    continue;
                }

                stack.push(connected_region.id);
                connected_region.visited = true;
            }
        }

        if span_count < min_region_area as usize && !connects_to_border {
            for traced in &trace {
                let region = &mut regions[*traced as usize];
                region.span_count = 0;
                region.id = 0;
            }
        }
    }

    // Merge small regions into their smallest compatible neighbour.
    loop {
        let mut merged = false;

        for region_index in 0..regions.len() {
            let merge_id = {
                let region = &regions[region_index];
                if region.id == 0 || region.overlap || region.span_count == 0 {
                    continue;
                }

                // Keep large regions that reach open boundary; everything else is a
                // merge candidate.
                if region.span_count > merge_region_area as usize
                    && region.connections.contains(&0)
                {
                    continue;
                }

                let mut merge_id = None;
                let mut smallest_region_size = usize::MAX;

                for connected in &region.connections {
                    if connected & BORDER_REG != 0 || *connected == 0 {
                        continue;
                    }
                    let other_region = &regions[*connected as usize];
                    if other_region.id == 0 || other_region.overlap {
                        continue;
                    }

                    if other_region.span_count < smallest_region_size
                        && can_merge_with_region(region, other_region)
                        && can_merge_with_region(other_region, region)
                    {
                        smallest_region_size = other_region.span_count;
                        merge_id = Some(other_region.id);
                    }
                }

                merge_id
            };

            if let Some(merge_id) = merge_id {
                let old_id = regions[region_index].id;

                if merge_region_pair(&mut regions, region_index, merge_id as usize) {
                    // Fix up regions pointing to this region.
                    for region in regions.iter_mut() {
                        if region.id == 0 {
                            continue;
                        }

                        if region.id == old_id {
                            region.id = merge_id;
                        }

                        replace_neighbour(region, old_id, merge_id);
                    }

                    merged = true;
                }
            }
        }

        if !merged {
            break;
        }
    }

    // Compress region ids.
    for region in regions.iter_mut() {
        region.remap = region.id != 0;
    }

    let mut region_id_gen = 0;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        region_id_gen += 1;

        let old_id = regions[i].id;
        let new_id = region_id_gen;

        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = new_id;
                region.remap = false;
            }
        }
    }
    *max_region_id = region_id_gen;

    // Remap span regions; border spans keep their painted ids.
    for region in source_regions.iter_mut() {
        if *region & BORDER_REG == 0 {
            *region = regions[*region as usize].id;
        }
    }

    regions
        .iter()
        .filter(|region| region.overlap)
        .map(|region| region.id)
        .collect()
}

fn replace_neighbour(region: &mut Region, old_id: u16, new_id: u16) {
    let mut connection_changed = false;
    for connection in region.connections.iter_mut() {
        if *connection == old_id {
            *connection = new_id;
            connection_changed = true;
        }
    }
    for floor in region.floors.iter_mut() {
        if *floor == old_id {
            *floor = new_id;
        }
    }
    if connection_changed {
        remove_adjacent_connection_duplicates(region);
    }
}

fn merge_region_pair(regions: &mut [Region], a: usize, b: usize) -> bool {
    let merged_connections = {
        let region_a = &regions[a];
        let region_b = &regions[b];

        let Some(insert_point_a) = region_a
            .connections
            .iter()
            .position(|id| *id == region_b.id)
        else {
            return false;
        };
        let Some(insert_point_b) = region_b
            .connections
            .iter()
            .position(|id| *id == region_a.id)
        else {
            return false;
        };

        // Splice the two connection loops, skipping the shared edge on both sides.
        let mut merged: SmallVec<[u16; 8]> =
            SmallVec::with_capacity(region_a.connections.len() + region_b.connections.len() - 2);
        for i in 0..region_a.connections.len() - 1 {
            merged.push(
                region_a.connections[(insert_point_a + 1 + i) % region_a.connections.len()],
            );
        }
        for i in 0..region_b.connections.len() - 1 {
            merged.push(
                region_b.connections[(insert_point_b + 1 + i) % region_b.connections.len()],
            );
        }

        merged
    };

    let (b_span_count, floors) = {
        let region_b = &mut regions[b];
        region_b.connections.clear();

        let count = region_b.span_count;
        region_b.span_count = 0;

        (count, std::mem::take(&mut region_b.floors))
    };

    {
        let region_a = &mut regions[a];
        region_a.span_count += b_span_count;
        region_a.connections = merged_connections;

        remove_adjacent_connection_duplicates(region_a);

        for floor in floors {
            add_unique_floor_region(region_a, floor);
        }
    }

    true
}

fn remove_adjacent_connection_duplicates(region: &mut Region) {
    if region.connections.len() > 1 {
        let mut i = 0;
        while i < region.connections.len() {
            let next_index = (i + 1) % region.connections.len();
            let current = region.connections[i];
            let next = region.connections[next_index];

            if current == next {
                region.connections.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}

fn can_merge_with_region(a: &Region, b: &Region) -> bool {
    if a.area != b.area {
        return false;
    }

    // The regions must share exactly one boundary segment.
    let shared = a
        .connections
        .iter()
        .filter(|region| **region == b.id)
        .count();
    if shared != 1 {
        return false;
    }

    // And neither may sit on top of the other.
    !a.floors.contains(&b.id)
}

fn add_unique_floor_region(region: &mut Region, region_id: u16) {
    if region.floors.contains(&region_id) {
        return;
    }

    region.floors.push(region_id);
}

/// Walks a region's boundary clockwise, recording the neighbouring region of every
/// solid edge in order.
fn walk_region_boundary(
    mut cell_index: usize,
    mut span_index: usize,
    mut dir: usize,
    open: &OpenHeightfield,
    source_regions: &[u16],
    contour: &mut SmallVec<[u16; 8]>,
) {
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;
    let width = open.width as usize;

    let mut current_region = 0;
    if let Some(layer) = open.spans[span_index].con(dir) {
        let neighbour = open.neighbour_span_index(cell_index, dir, layer);
        current_region = source_regions[neighbour];
    }
    contour.push(current_region);

    let mut iterations = 0;
    while iterations < 40000 {
        iterations += 1;
        let span = &open.spans[span_index];

        if is_solid_edge(open, span_index, cell_index, dir, source_regions) {
            let mut region = 0;
            if let Some(layer) = span.con(dir) {
                let neighbour = open.neighbour_span_index(cell_index, dir, layer);
                region = source_regions[neighbour];
            }
            if region != current_region {
                current_region = region;
                contour.push(region);
            }

            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            let Some(layer) = span.con(dir) else {
                unreachable!("a non-solid edge always has a connection");
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

    // Remove adjacent duplicates.
    if contour.len() > 1 {
        let mut i = 0;
        while i < contour.len() {
            let next_index = (i + 1) % contour.len();

            if contour[i] == contour[next_index] {
                contour.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}

fn is_solid_edge(
    open: &OpenHeightfield,
    span_index: usize,
    cell_index: usize,
    dir: usize,
    source_regions: &[u16],
) -> bool {
    let mut region = 0;
    if let Some(layer) = open.spans[span_index].con(dir) {
        let neighbour = open.neighbour_span_index(cell_index, dir, layer);
        region = source_regions[neighbour];
    }

    region != source_regions[span_index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heightfields::{calculate_distance_field, rasterize_triangles, Heightfield},
        Area,
    };
    use glam::{uvec3, Vec3};

    fn plane_open(size: f32) -> OpenHeightfield {
        let mut heightfield = Heightfield::new(
            Vec3::ZERO,
            Vec3::new(size, 5.0, size),
            1.0,
            1.0,
        )
        .unwrap();
        let vertices = [
            Vec3::new(0.0, 0.4, 0.0),
            Vec3::new(size, 0.4, 0.0),
            Vec3::new(size, 0.4, size),
            Vec3::new(0.0, 0.4, size),
        ];
        let triangles = [uvec3(0, 2, 1), uvec3(0, 3, 2)];
        let areas = [Some(Area::WALKABLE); 2];
        rasterize_triangles(&mut heightfield, &vertices, &triangles, &areas, 1);

        let mut ctx = BuildContext::new();
        let mut open = OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1);
        calculate_distance_field(&mut open);
        open
    }

    fn assert_regions_are_connected(open: &OpenHeightfield) {
        // Every non-border region must be 4-connected: flood from any of its spans
        // reaches all of them.
        let span_count = open.span_count();
        let mut seen = vec![false; span_count];

        for region in 1..=open.max_regions {
            let members: Vec<usize> = (0..span_count)
                .filter(|i| open.spans[*i].region == region)
                .collect();
            if members.is_empty() {
                continue;
            }

            // Breadth-first flood constrained to the region.
            seen.iter_mut().for_each(|v| *v = false);
            let mut queue = vec![members[0]];
            seen[members[0]] = true;
            let mut reached = 1;

            while let Some(i) = queue.pop() {
                let cell_index = open
                    .cells
                    .iter()
                    .position(|cell| cell.span_range().contains(&i))
                    .unwrap();
                for dir in 0..4 {
                    let Some(layer) = open.spans[i].con(dir) else {
                        continue;
                    };
                    let neighbour = open.neighbour_span_index(cell_index, dir, layer);
                    if !seen[neighbour] && open.spans[neighbour].region == region {
                        seen[neighbour] = true;
                        reached += 1;
                        queue.push(neighbour);
                    }
                }
            }

            assert_eq!(
                reached,
                members.len(),
                "region {region} is not 4-connected"
            );
        }
    }

    #[test]
    fn watershed_covers_a_plane_with_one_region() {
        let mut ctx = BuildContext::new();
        let mut open = plane_open(8.0);
        build_regions(&mut ctx, &mut open, 0, 1, 100).unwrap();

        assert_eq!(open.max_regions, 1);
        assert!(open
            .spans
            .iter()
            .all(|span| span.region == open.spans[0].region && span.region != 0));
        assert_regions_are_connected(&open);
    }

    #[test]
    fn monotone_covers_a_plane_with_one_region() {
        let mut ctx = BuildContext::new();
        let mut open = plane_open(8.0);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();

        assert_eq!(open.max_regions, 1);
        assert!(open.spans.iter().all(|span| span.region != 0));
        assert_regions_are_connected(&open);
    }

    #[test]
    fn border_strips_are_painted_with_flagged_ids() {
        let mut ctx = BuildContext::new();
        let mut open = plane_open(8.0);
        build_regions_monotone(&mut ctx, &mut open, 2, 1, 100).unwrap();
        assert_eq!(open.border_size, 2);

        let width = open.width;
        for (cell_index, cell) in open.cells.iter().enumerate() {
            let x = cell_index as i32 % width;
            let z = cell_index as i32 / width;
            let in_border = x < 2 || z < 2 || x >= width - 2 || z >= open.height - 2;

            for i in cell.span_range() {
                let region = open.spans[i].region;
                if in_border {
                    assert_ne!(region & BORDER_REG, 0, "({x}, {z}) should be border");
                } else {
                    assert_eq!(region & BORDER_REG, 0, "({x}, {z}) should be interior");
                    assert_ne!(region, 0);
                }
            }
        }
        assert_regions_are_connected(&open);
    }

    #[test]
    fn stacked_floors_get_separate_regions() {
        // A full floor with a platform hovering over its middle: columns under the
        // platform carry two walkable spans.
        let mut heightfield =
            Heightfield::new(Vec3::ZERO, Vec3::new(8.0, 40.0, 8.0), 1.0, 1.0).unwrap();
        let quad = |heightfield: &mut Heightfield, x0: f32, z0: f32, x1: f32, z1: f32, y: f32| {
            let vertices = [
                Vec3::new(x0, y, z0),
                Vec3::new(x1, y, z0),
                Vec3::new(x1, y, z1),
                Vec3::new(x0, y, z1),
            ];
            let triangles = [uvec3(0, 2, 1), uvec3(0, 3, 2)];
            rasterize_triangles(
                heightfield,
                &vertices,
                &triangles,
                &[Some(Area::WALKABLE); 2],
                1,
            );
        };
        quad(&mut heightfield, 0.0, 0.0, 8.0, 8.0, 0.4);
        quad(&mut heightfield, 2.0, 2.0, 6.0, 6.0, 30.4);

        let mut ctx = BuildContext::new();
        let mut open = OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1);
        calculate_distance_field(&mut open);
        build_regions_monotone(&mut ctx, &mut open, 0, 1, 100).unwrap();

        // Every region stays on one level: the floors of its spans agree.
        for region in 1..=open.max_regions {
            let floors: Vec<u16> = open
                .spans
                .iter()
                .filter(|span| span.region == region)
                .map(|span| span.min)
                .collect();
            if floors.is_empty() {
                continue;
            }
            assert!(
                floors.iter().all(|floor| *floor == floors[0]),
                "region {region} spans several floors: {floors:?}"
            );
        }
        assert_regions_are_connected(&open);
    }

    #[test]
    fn tiny_isolated_islands_are_filtered_out() {
        // Two disconnected platforms; the small one dies to min_region_area.
        let mut heightfield =
            Heightfield::new(Vec3::ZERO, Vec3::new(12.0, 5.0, 12.0), 1.0, 1.0).unwrap();
        let quad = |heightfield: &mut Heightfield, x0: f32, z0: f32, x1: f32, z1: f32| {
            let vertices = [
                Vec3::new(x0, 0.4, z0),
                Vec3::new(x1, 0.4, z0),
                Vec3::new(x1, 0.4, z1),
                Vec3::new(x0, 0.4, z1),
            ];
            let triangles = [uvec3(0, 2, 1), uvec3(0, 3, 2)];
            rasterize_triangles(
                heightfield,
                &vertices,
                &triangles,
                &[Some(Area::WALKABLE); 2],
                1,
            );
        };
        quad(&mut heightfield, 0.0, 0.0, 8.0, 8.0);
        quad(&mut heightfield, 10.0, 10.0, 12.0, 12.0);

        let mut ctx = BuildContext::new();
        let mut open = OpenHeightfield::from_heightfield(&mut ctx, heightfield, 3, 1);
        calculate_distance_field(&mut open);
        build_regions_monotone(&mut ctx, &mut open, 0, 6, 100).unwrap();

        // The 2x2 island is below the six-span minimum.
        for (cell_index, cell) in open.cells.iter().enumerate() {
            let x = cell_index as i32 % open.width;
            let z = cell_index as i32 / open.width;
            for i in cell.span_range() {
                if x >= 10 && z >= 10 {
                    assert_eq!(open.spans[i].region, 0, "island span at ({x}, {z}) kept");
                } else {
                    assert_ne!(open.spans[i].region, 0, "main floor span at ({x}, {z}) lost");
                }
            }
        }
    }
}
