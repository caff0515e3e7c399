//! Walkability filters applied to the solid height-field before compaction.
//!
//! Order matters and is fixed: low-hanging obstacles are reclaimed first, ledges are
//! demoted second, and spans without standing room go last.

use crate::{
    heightfields::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    SPAN_MAX_HEIGHT,
};

/// Marks non-walkable spans as walkable where the agent would simply step over them.
///
/// A span that rasterized as unwalkable (a curb, a cable, a doorstep) inherits the area
/// of the walkable span directly below it when the surface difference is within
/// `walkable_climb`.
pub fn filter_low_hanging_walkable_obstacles(heightfield: &mut Heightfield, walkable_climb: u16) {
    for z in 0..heightfield.height() {
        for x in 0..heightfield.width() {
            let mut previous_was_walkable = false;
            let mut previous_area = None;
            let mut previous_max = 0u16;

            let mut iter = heightfield.column_head(x, z);
            while let Some(index) = iter {
                let span = heightfield.span(index);
                let walkable = span.area().is_some();
                let (span_max, span_area, next) = (span.max(), span.area(), span.next());

                // If current span is not walkable, but there is a walkable span just
                // below it and the height difference is small enough for the agent to
                // walk over, mark the current span as walkable too.
                if !walkable
                    && previous_was_walkable
                    && (span_max as i32 - previous_max as i32).unsigned_abs()
                        <= walkable_climb as u32
                {
                    heightfield.span_mut(index).area = previous_area;
                }

                // Track the original walkability, so several stacked non-walkable spans
                // don't get promoted in a chain.
                previous_was_walkable = walkable;
                previous_area = span_area;
                previous_max = span_max;
                iter = next;
            }
        }
    }
}

/// Demotes spans sitting on ledges the agent would fall off.
///
/// A walkable span turns unwalkable when the drop to any reachable neighbour exceeds
/// `walkable_climb` below its floor, or when the reachable neighbour floors span more
/// than `walkable_climb` between them (a steep slope crossing the span). A neighbour is
/// reachable when the shared gap clears `walkable_height`.
pub fn filter_ledge_spans(heightfield: &mut Heightfield, walkable_height: u16, walkable_climb: u16) {
    const MAX_HEIGHT: i32 = SPAN_MAX_HEIGHT as i32;

    let width = heightfield.width();
    let height = heightfield.height();
    let walkable_height = walkable_height as i32;
    let walkable_climb = walkable_climb as i32;

    for z in 0..height {
        for x in 0..width {
            let mut iter = heightfield.column_head(x, z);
            while let Some(index) = iter {
                let (area, span_max, next) = {
                    let span = heightfield.span(index);
                    (span.area(), span.max(), span.next())
                };
                if area.is_none() {
                    iter = next;
                    continue;
                }

                let bot = span_max as i32;
                let top = next.map_or(MAX_HEIGHT, |n| heightfield.span(n).min() as i32);

                // Lowest neighbour floor relative to this span.
                let mut min_neighbour_height = MAX_HEIGHT;
                // Range of floors the agent can actually step between.
                let mut accessible_min = bot;
                let mut accessible_max = bot;

                for dir in 0..4 {
                    let neighbour_x = x + dir_offset_x(dir);
                    let neighbour_z = z + dir_offset_z(dir);

                    // The edge of the grid counts as a drop into the void.
                    if neighbour_x < 0
                        || neighbour_z < 0
                        || neighbour_x >= width
                        || neighbour_z >= height
                    {
                        min_neighbour_height = min_neighbour_height.min(-walkable_climb - bot);
                        continue;
                    }

                    // From minus infinity up to the first neighbour span.
                    let mut neighbour_iter = heightfield.column_head(neighbour_x, neighbour_z);
                    let neighbour_bot = -walkable_climb;
                    let neighbour_top =
                        neighbour_iter.map_or(MAX_HEIGHT, |n| heightfield.span(n).min() as i32);
                    if top.min(neighbour_top) - bot.max(neighbour_bot) >= walkable_height {
                        min_neighbour_height = min_neighbour_height.min(neighbour_bot - bot);
                    }

                    // The rest of the neighbour column.
                    while let Some(neighbour_index) = neighbour_iter {
                        let neighbour = heightfield.span(neighbour_index);
                        let neighbour_bot = neighbour.max() as i32;
                        let neighbour_top = neighbour
                            .next()
                            .map_or(MAX_HEIGHT, |n| heightfield.span(n).min() as i32);

                        if top.min(neighbour_top) - bot.max(neighbour_bot) >= walkable_height {
                            min_neighbour_height = min_neighbour_height.min(neighbour_bot - bot);

                            if (neighbour_bot - bot).abs() <= walkable_climb {
                                accessible_min = accessible_min.min(neighbour_bot);
                                accessible_max = accessible_max.max(neighbour_bot);
                            }
                        }
                        neighbour_iter = neighbour.next();
                    }
                }

                if min_neighbour_height < -walkable_climb
                    || accessible_max - accessible_min > walkable_climb
                {
                    heightfield.span_mut(index).area = None;
                }

                iter = next;
            }
        }
    }
}

/// Demotes spans without room to stand: open clearance below `walkable_height`.
pub fn filter_walkable_low_height_spans(heightfield: &mut Heightfield, walkable_height: u16) {
    const MAX_HEIGHT: i32 = SPAN_MAX_HEIGHT as i32;

    for z in 0..heightfield.height() {
        for x in 0..heightfield.width() {
            let mut iter = heightfield.column_head(x, z);
            while let Some(index) = iter {
                let (area, span_max, next) = {
                    let span = heightfield.span(index);
                    (span.area(), span.max(), span.next())
                };

                if area.is_some() {
                    let bot = span_max as i32;
                    let top = next.map_or(MAX_HEIGHT, |n| heightfield.span(n).min() as i32);
                    if top - bot < walkable_height as i32 {
                        heightfield.span_mut(index).area = None;
                    }
                }

                iter = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Area;
    use glam::Vec3;

    fn heightfield() -> Heightfield {
        Heightfield::new(Vec3::ZERO, Vec3::new(5.0, 20.0, 5.0), 1.0, 1.0).unwrap()
    }

    fn area_at(heightfield: &Heightfield, x: i32, z: i32, nth: usize) -> Option<Area> {
        let mut iter = heightfield.column_head(x, z);
        for _ in 0..nth {
            iter = heightfield.span(iter.unwrap()).next();
        }
        heightfield.span(iter.unwrap()).area()
    }

    #[test]
    fn low_hanging_obstacle_becomes_walkable() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 2, Some(Area(5)), 0);
        heightfield.add_span(0, 0, 2, 3, None, 0);

        filter_low_hanging_walkable_obstacles(&mut heightfield, 1);
        assert_eq!(area_at(&heightfield, 0, 0, 1), Some(Area(5)));
    }

    #[test]
    fn tall_obstacle_stays_unwalkable() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 2, Some(Area(5)), 0);
        heightfield.add_span(0, 0, 2, 6, None, 0);

        filter_low_hanging_walkable_obstacles(&mut heightfield, 1);
        assert_eq!(area_at(&heightfield, 0, 0, 1), None);
    }

    #[test]
    fn stacked_obstacles_are_not_promoted_in_a_chain() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 2, Some(Area(5)), 0);
        heightfield.add_span(0, 0, 2, 3, None, 0);
        heightfield.add_span(0, 0, 4, 5, None, 0);

        filter_low_hanging_walkable_obstacles(&mut heightfield, 2);
        assert_eq!(area_at(&heightfield, 0, 0, 1), Some(Area(5)));
        // The second obstacle only had a *promoted* span below it, not a walkable one.
        assert_eq!(area_at(&heightfield, 0, 0, 2), None);
    }

    fn ground_with_pillar() -> Heightfield {
        let mut heightfield = heightfield();
        for z in 0..5 {
            for x in 0..5 {
                if (x, z) == (2, 2) {
                    heightfield.add_span(x, z, 0, 10, Some(Area::WALKABLE), 0);
                } else {
                    heightfield.add_span(x, z, 0, 1, Some(Area::WALKABLE), 0);
                }
            }
        }
        heightfield
    }

    fn walkable_count(heightfield: &Heightfield) -> usize {
        let mut count = 0;
        for z in 0..heightfield.height() {
            for x in 0..heightfield.width() {
                let mut iter = heightfield.column_head(x, z);
                while let Some(index) = iter {
                    let span = heightfield.span(index);
                    count += span.area().is_some() as usize;
                    iter = span.next();
                }
            }
        }
        count
    }

    #[test]
    fn pillar_top_is_a_ledge() {
        let mut heightfield = ground_with_pillar();
        filter_ledge_spans(&mut heightfield, 3, 1);

        // The pillar drops 9 voxels to the surrounding ground.
        assert_eq!(area_at(&heightfield, 2, 2, 0), None);
        // Ground right next to the pillar can't climb it, but isn't a ledge itself.
        assert_eq!(area_at(&heightfield, 2, 1, 0), Some(Area::WALKABLE));
        // Ground at the grid edge drops into the void.
        assert_eq!(area_at(&heightfield, 0, 0, 0), None);
    }

    #[test]
    fn ledge_filter_is_idempotent() {
        let mut once = ground_with_pillar();
        filter_ledge_spans(&mut once, 3, 1);
        let after_once = walkable_count(&once);

        filter_ledge_spans(&mut once, 3, 1);
        assert_eq!(walkable_count(&once), after_once);
        assert_eq!(after_once, 8);
    }

    #[test]
    fn cramped_spans_are_demoted() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 1, Some(Area::WALKABLE), 0);
        heightfield.add_span(0, 0, 3, 10, Some(Area::WALKABLE), 0);

        filter_walkable_low_height_spans(&mut heightfield, 3);
        // Two voxels of headroom under the upper span is not enough for three.
        assert_eq!(area_at(&heightfield, 0, 0, 0), None);
        assert_eq!(area_at(&heightfield, 0, 0, 1), Some(Area::WALKABLE));
    }

    #[test]
    fn exactly_walkable_height_clearance_is_kept() {
        let mut heightfield = heightfield();
        heightfield.add_span(0, 0, 0, 1, Some(Area::WALKABLE), 0);
        heightfield.add_span(0, 0, 4, 10, Some(Area::WALKABLE), 0);

        filter_walkable_low_height_spans(&mut heightfield, 3);
        assert_eq!(area_at(&heightfield, 0, 0, 0), Some(Area::WALKABLE));
    }
}
