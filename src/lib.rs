//! Batch nav-mesh generation for 3D worlds.
//!
//! Takes in a triangle soup describing a static environment plus a description of the
//! navigating agent (height, radius, climb, slope limit) and produces a convex-polygon
//! navigation mesh ([`PolyMesh`]) along with an optional height-corrected detail
//! triangulation ([`PolyMeshDetail`]). The output is intended to be fed to a runtime
//! path-query layer; none of that lives here.
//!
//! ## Quick-start
//!
//! 1. Gather your world geometry as `&[Vec3]` vertices and `&[UVec3]` triangle indices.
//!    How you get those (physics colliders, OBJ files, your own editor) is up to you.
//! 2. Fill out a [`NavMeshConfig`], either field by field or starting from
//!    [`NavMeshConfig::from_agent`].
//! 3. Call [`build_nav_mesh`]. The returned [`PolyMesh`] polygons are guaranteed
//!    walkable, convex, and counter-clockwise on the xz-plane.
//!
//! The build is synchronous and single-threaded: one call, one mesh. Feed it to a task
//! pool yourself if you want it off the main thread.
//!
//! ## Pipeline
//!
//! The build is a fixed sequence of passes over dense grids; each stage consumes the
//! previous stage's output and no stage calls backward:
//!
//! 1. Rasterize triangles into a height-field of vertical spans ([`Heightfield`]).
//! 2. Filter out spans the agent cannot stand on.
//! 3. Compact walkable space into an open height-field with packed neighbour links
//!    ([`OpenHeightfield`]).
//! 4. Erode by agent radius, then build a distance field.
//! 5. Partition walkable spans into regions (monotone sweep or watershed).
//! 6. Trace and simplify region contours ([`ContourSet`]).
//! 7. Triangulate and merge contours into convex polygons ([`PolyMesh`]).
//! 8. Sample true ground height per polygon ([`PolyMeshDetail`]).
//!
//! Identical inputs produce byte-identical outputs; every tie-break in the pipeline is
//! lexicographic over cell coordinates for exactly that reason.

use std::time::{Duration, Instant};

use glam::{UVec3, Vec3};
use thiserror::Error;

mod contour;
mod detail_mesh;
mod filters;
mod heightfields;
mod math;
mod mesher;
mod regions;

pub use contour::{build_contours, Contour, ContourBuildFlags, ContourSet};
pub use detail_mesh::{build_poly_mesh_detail, DetailTriangle, PolyMeshDetail, SubMesh};
pub use filters::{
    filter_ledge_spans, filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
};
pub use heightfields::{
    calculate_distance_field, erode_walkable_area, mark_walkable_triangles, rasterize_triangles,
    HeightSpan, Heightfield, OpenCell, OpenHeightfield, OpenSpan,
};
pub use mesher::{build_poly_mesh, PolyMesh};
pub use regions::{build_regions, build_regions_monotone};

/// Number of bits used to quantize span heights.
pub const SPAN_HEIGHT_BITS: u32 = 16;
/// The highest voxel a span may reach.
pub const SPAN_MAX_HEIGHT: u16 = 0xffff;
/// Spans are allocated in arena chunks of this many slots.
pub const SPANS_PER_POOL: usize = 2048;

/// Sentinel for an absent neighbour link in a packed connection word.
pub const NOT_CONNECTED: u8 = 0x3f;
/// Highest neighbour layer index that fits a 6-bit connection field.
pub const MAX_LAYERS: u8 = 0x3e;

/// High bit of a region id, marking regions painted along the tile border.
pub const BORDER_REG: u16 = 0x8000;
/// Reserved region id for polygons stitched together from several regions.
pub const MULTIPLE_REGS: u16 = 0;

/// Contour vertex flag: the vertex sits where two border regions meet.
pub const FLAG_BORDER_VERTEX: u32 = 0x10000;
/// Contour vertex flag: the following edge separates two different area types.
pub const FLAG_AREA_BORDER: u32 = 0x20000;
/// Masks the neighbour region id out of a contour vertex's flag word.
pub const MASK_CONTOUR_REGION: u32 = 0xffff;

/// Sentinel index used to pad polygon vertex and neighbour slots.
pub const MESH_NULL_IDX: u16 = 0xffff;

/*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/

/// A walkable area type.
///
/// Spans and polygons either carry `Some(Area)` with a value in `1..=63` or `None`
/// (unwalkable). Where two spans merge, the higher area wins. [`Area::WALKABLE`] is the
/// default assigned by [`mark_walkable_triangles`]; lower values are free for callers
/// that want to tag surfaces (mud, water, road) for the query layer.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Area(pub u8);

impl Area {
    /// Default walkable area, the highest valid value.
    pub const WALKABLE: Area = Area(63);
    /// Largest representable area id.
    pub const MAX: u8 = 63;
}

/// Strategy used to partition the walkable surface into regions.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Sweep rows in increasing z, merging runs with the previous row.
    ///
    /// Fast and robust; can produce long thin regions on winding geometry.
    #[default]
    Monotone,
    /// Distance-field watershed: flood regions outward from local maxima.
    ///
    /// Produces rounder regions at a higher cost per tile.
    Watershed,
}

/// Settings for nav-mesh generation.
///
/// Distances suffixed `_size`/`_height`/`_distance`/`_error` in world units are `f32`;
/// everything else is measured in voxels of `cell_size` × `cell_height`.
#[derive(Clone, Debug)]
pub struct NavMeshConfig {
    /// The horizontal resolution of the voxel grid.
    ///
    /// **Suggested value**: 1/2 of agent radius.
    pub cell_size: f32,
    /// The vertical resolution of the voxel grid.
    ///
    /// **Suggested value**: 1/2 of `cell_size`.
    pub cell_height: f32,

    /// Minimum corner of the world-space box the mesh is built inside.
    pub min_bounds: Vec3,
    /// Maximum corner of the world-space box the mesh is built inside.
    pub max_bounds: Vec3,

    /// Maximum incline a triangle may have and still count as floor, in degrees `[0, 90)`.
    pub walkable_slope_degrees: f32,
    /// Minimum open height for a span to be standable, in `cell_height` voxels. At least 3.
    pub walkable_height: u16,
    /// Maximum ledge height the agent steps over, in `cell_height` voxels.
    pub walkable_climb: u16,
    /// Agent radius, in `cell_size` voxels. The walkable area is pulled back this far
    /// from every wall.
    pub walkable_radius: u16,

    /// Maximum length of a contour edge before it is split, in voxels. 0 disables
    /// edge tessellation.
    pub max_edge_length: u16,
    /// Maximum distance a simplified contour may deviate from the raw boundary, in voxels.
    ///
    /// **Suggested value range**: `[1.1, 1.5]`
    pub max_simplification_error: f32,

    /// Minimum region size in spans; smaller isolated regions are dropped.
    pub min_region_area: u32,
    /// Regions up to this many spans are merged into a neighbour where possible.
    pub merge_region_area: u32,

    /// Maximum number of vertices per polygon, `3..=12`.
    pub max_vertices_per_polygon: usize,

    /// Detail-mesh sampling step in world units. 0 disables the detail mesh;
    /// otherwise must be at least 0.9.
    pub detail_sample_distance: f32,
    /// Maximum height error between the detail mesh and the height-field, in world units.
    pub detail_sample_max_error: f32,

    /// Width of the border strip padded around the grid, in voxels. Used by tiled
    /// builders to give each tile context beyond its edge; 0 for solo meshes.
    pub border_size: u16,

    /// How to partition the walkable surface into regions.
    pub partition: PartitionStrategy,
    /// Which contour edges get split to `max_edge_length`.
    pub contour_flags: ContourBuildFlags,
}

impl NavMeshConfig {
    /// Helper for creating a config with reasonable defaults from the measurements of
    /// the navigating agent and the bounds of the world.
    pub fn from_agent(
        agent_radius: f32,
        agent_height: f32,
        agent_climb: f32,
        min_bounds: Vec3,
        max_bounds: Vec3,
    ) -> Self {
        let cell_size = agent_radius / 2.0;
        let cell_height = cell_size / 2.0;

        Self {
            cell_size,
            cell_height,
            min_bounds,
            max_bounds,
            walkable_slope_degrees: 45.0,
            walkable_height: ((agent_height / cell_height).ceil() as u16).max(3),
            walkable_climb: (agent_climb / cell_height).floor() as u16,
            walkable_radius: (agent_radius / cell_size).ceil() as u16,
            max_edge_length: (12.0 / cell_size) as u16,
            max_simplification_error: 1.3,
            min_region_area: 64,
            merge_region_area: 400,
            max_vertices_per_polygon: 6,
            detail_sample_distance: (cell_size * 6.0).max(0.9),
            detail_sample_max_error: cell_height,
            border_size: 0,
            partition: PartitionStrategy::default(),
            contour_flags: ContourBuildFlags::TESS_WALL_EDGES,
        }
    }

    /// Setter for [`NavMeshConfig::walkable_radius`]
    pub fn with_walkable_radius(mut self, walkable_radius: u16) -> Self {
        self.walkable_radius = walkable_radius;

        self
    }
    /// Setter for [`NavMeshConfig::walkable_slope_degrees`]
    pub fn with_walkable_slope(mut self, walkable_slope_degrees: f32) -> Self {
        self.walkable_slope_degrees = walkable_slope_degrees;

        self
    }
    /// Setter for [`NavMeshConfig::walkable_climb`]
    pub fn with_walkable_climb(mut self, walkable_climb: u16) -> Self {
        self.walkable_climb = walkable_climb;

        self
    }
    /// Setter for [`NavMeshConfig::min_region_area`] & [`NavMeshConfig::merge_region_area`]
    pub fn with_region_area(mut self, min_region_area: u32, merge_region_area: u32) -> Self {
        self.min_region_area = min_region_area;
        self.merge_region_area = merge_region_area;

        self
    }
    /// Setter for [`NavMeshConfig::max_simplification_error`]
    pub fn with_max_simplification_error(mut self, max_simplification_error: f32) -> Self {
        self.max_simplification_error = max_simplification_error;

        self
    }
    /// Setter for [`NavMeshConfig::max_edge_length`]
    pub fn with_max_edge_length(mut self, max_edge_length: u16) -> Self {
        self.max_edge_length = max_edge_length;

        self
    }
    /// Setter for [`NavMeshConfig::partition`]
    pub fn with_partition(mut self, partition: PartitionStrategy) -> Self {
        self.partition = partition;

        self
    }
    /// Setter for [`NavMeshConfig::detail_sample_distance`] &
    /// [`NavMeshConfig::detail_sample_max_error`]
    pub fn with_detail_sampling(mut self, sample_distance: f32, sample_max_error: f32) -> Self {
        self.detail_sample_distance = sample_distance;
        self.detail_sample_max_error = sample_max_error;

        self
    }
    /// Setter for [`NavMeshConfig::border_size`]
    pub fn with_border_size(mut self, border_size: u16) -> Self {
        self.border_size = border_size;

        self
    }

    /// Checks every field against its documented range.
    ///
    /// Called by [`build_nav_mesh`] before any voxel is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_size > 0.0 && self.cell_size.is_finite()) {
            return Err(ConfigError::CellSize(self.cell_size));
        }
        if !(self.cell_height > 0.0 && self.cell_height.is_finite()) {
            return Err(ConfigError::CellHeight(self.cell_height));
        }
        if !(0.0..90.0).contains(&self.walkable_slope_degrees) {
            return Err(ConfigError::WalkableSlope(self.walkable_slope_degrees));
        }
        if self.walkable_height < 3 {
            return Err(ConfigError::WalkableHeight(self.walkable_height));
        }
        if !(self.max_simplification_error >= 0.0 && self.max_simplification_error.is_finite()) {
            return Err(ConfigError::MaxSimplificationError(
                self.max_simplification_error,
            ));
        }
        if !(3..=12).contains(&self.max_vertices_per_polygon) {
            return Err(ConfigError::MaxVerticesPerPolygon(
                self.max_vertices_per_polygon,
            ));
        }
        if self.detail_sample_distance != 0.0
            && !(self.detail_sample_distance >= 0.9 && self.detail_sample_distance.is_finite())
        {
            return Err(ConfigError::DetailSampleDistance(
                self.detail_sample_distance,
            ));
        }
        if !(self.detail_sample_max_error >= 0.0 && self.detail_sample_max_error.is_finite()) {
            return Err(ConfigError::DetailSampleMaxError(
                self.detail_sample_max_error,
            ));
        }
        if !(self.max_bounds.x > self.min_bounds.x
            && self.max_bounds.z > self.min_bounds.z
            && self.max_bounds.y >= self.min_bounds.y)
        {
            return Err(ConfigError::Bounds {
                min: self.min_bounds,
                max: self.max_bounds,
            });
        }
        Ok(())
    }
}

/// Errors raised by [`NavMeshConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("cell_size must be a positive finite number, got {0}")]
    CellSize(f32),
    #[error("cell_height must be a positive finite number, got {0}")]
    CellHeight(f32),
    #[error("walkable_slope_degrees must be in [0, 90), got {0}")]
    WalkableSlope(f32),
    #[error("walkable_height must be at least 3 voxels, got {0}")]
    WalkableHeight(u16),
    #[error("max_simplification_error must be non-negative, got {0}")]
    MaxSimplificationError(f32),
    #[error("max_vertices_per_polygon must be in [3, 12], got {0}")]
    MaxVerticesPerPolygon(usize),
    #[error("detail_sample_distance must be 0 (disabled) or at least 0.9, got {0}")]
    DetailSampleDistance(f32),
    #[error("detail_sample_max_error must be non-negative, got {0}")]
    DetailSampleMaxError(f32),
    #[error("max_bounds ({max}) must lie above min_bounds ({min}) on the xz-plane")]
    Bounds { min: Vec3, max: Vec3 },
    #[error("grid of {width}x{height} cells is too large")]
    GridTooLarge { width: i64, height: i64 },
}

/// Errors that abort a build.
///
/// Anything recoverable is a warning on the [`BuildContext`] instead; anything that
/// indicates a bug in the pipeline itself panics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("triangle area count ({areas}) does not match triangle count ({triangles})")]
    TriangleAreaCount { areas: usize, triangles: usize },
    #[error("mesh has too many vertices ({0}, at most 0xfffe)")]
    TooManyVertices(usize),
    #[error("mesh has too many polygons ({count}, budget {max})")]
    TooManyPolygons { count: usize, max: usize },
    #[error("region id space exhausted (0xffff regions)")]
    RegionIdOverflow,
}

/// One stage of the build pipeline, used to key [`BuildContext`] timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Rasterization,
    Filtering,
    OpenHeightfield,
    Erosion,
    DistanceField,
    Regions,
    Contours,
    PolyMesh,
    DetailMesh,
}

impl BuildStep {
    const COUNT: usize = 9;

    /// Every step, in pipeline order.
    pub const ALL: [BuildStep; Self::COUNT] = [
        BuildStep::Rasterization,
        BuildStep::Filtering,
        BuildStep::OpenHeightfield,
        BuildStep::Erosion,
        BuildStep::DistanceField,
        BuildStep::Regions,
        BuildStep::Contours,
        BuildStep::PolyMesh,
        BuildStep::DetailMesh,
    ];
}

/// Collects per-stage timings and warnings across one build.
///
/// A failed build carries its context up to the caller untouched, so the warnings
/// leading up to the failure can be attached to whatever error report the application
/// shows. Warnings are also forwarded to [`tracing`] as they happen.
#[derive(Default, Debug)]
pub struct BuildContext {
    timers: [Option<Duration>; BuildStep::COUNT],
    warnings: Vec<String>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f`, adding its wall-clock duration to the timer for `step`.
    pub fn time<T>(&mut self, step: BuildStep, f: impl FnOnce(&mut BuildContext) -> T) -> T {
        let started = Instant::now();
        let out = f(self);
        let elapsed = started.elapsed();
        let slot = &mut self.timers[step as usize];
        *slot = Some(slot.unwrap_or_default() + elapsed);
        out
    }

    /// Records a warning and forwards it to `tracing::warn!`.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    /// Total time recorded against `step`, if the step ran.
    pub fn duration(&self, step: BuildStep) -> Option<Duration> {
        self.timers[step as usize]
    }

    /// All warnings recorded so far, in order.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Builds a navigation mesh from a triangle soup.
///
/// `triangle_areas`, when given, assigns an area per triangle (`None` = unwalkable) and
/// must match `triangles` in length; otherwise areas are derived from triangle slope
/// against [`NavMeshConfig::walkable_slope_degrees`].
///
/// Returns the polygon mesh plus, when [`NavMeshConfig::detail_sample_distance`] is
/// non-zero, the height-sampled detail mesh.
pub fn build_nav_mesh(
    ctx: &mut BuildContext,
    config: &NavMeshConfig,
    vertices: &[Vec3],
    triangles: &[UVec3],
    triangle_areas: Option<&[Option<Area>]>,
) -> Result<(PolyMesh, Option<PolyMeshDetail>), BuildError> {
    config.validate()?;
    if let Some(areas) = triangle_areas {
        if areas.len() != triangles.len() {
            return Err(BuildError::TriangleAreaCount {
                areas: areas.len(),
                triangles: triangles.len(),
            });
        }
    }

    let mut heightfield = Heightfield::new(
        config.min_bounds,
        config.max_bounds,
        config.cell_size,
        config.cell_height,
    )?;

    ctx.time(BuildStep::Rasterization, |_| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Rasterize triangles").entered();

        match triangle_areas {
            Some(areas) => rasterize_triangles(
                &mut heightfield,
                vertices,
                triangles,
                areas,
                config.walkable_climb,
            ),
            None => {
                let mut areas = vec![None; triangles.len()];
                mark_walkable_triangles(
                    config.walkable_slope_degrees,
                    vertices,
                    triangles,
                    &mut areas,
                );
                rasterize_triangles(
                    &mut heightfield,
                    vertices,
                    triangles,
                    &areas,
                    config.walkable_climb,
                )
            }
        }
    });

    ctx.time(BuildStep::Filtering, |_| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Filter walkable surfaces").entered();

        filter_low_hanging_walkable_obstacles(&mut heightfield, config.walkable_climb);
        filter_ledge_spans(
            &mut heightfield,
            config.walkable_height,
            config.walkable_climb,
        );
        filter_walkable_low_height_spans(&mut heightfield, config.walkable_height);
    });

    // The solid heightfield is released here; everything downstream works on open space.
    let mut open = ctx.time(BuildStep::OpenHeightfield, |ctx| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Build open heightfield").entered();

        OpenHeightfield::from_heightfield(
            ctx,
            heightfield,
            config.walkable_height,
            config.walkable_climb,
        )
    });

    ctx.time(BuildStep::Erosion, |_| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Erode walkable area").entered();

        erode_walkable_area(&mut open, config.walkable_radius);
    });

    ctx.time(BuildStep::DistanceField, |_| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Calculate distance field").entered();

        calculate_distance_field(&mut open);
    });

    ctx.time(BuildStep::Regions, |ctx| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Build regions").entered();

        match config.partition {
            PartitionStrategy::Monotone => build_regions_monotone(
                ctx,
                &mut open,
                config.border_size,
                config.min_region_area,
                config.merge_region_area,
            ),
            PartitionStrategy::Watershed => build_regions(
                ctx,
                &mut open,
                config.border_size,
                config.min_region_area,
                config.merge_region_area,
            ),
        }
    })?;

    let contour_set = ctx.time(BuildStep::Contours, |ctx| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Build contours").entered();

        build_contours(
            ctx,
            &open,
            config.max_simplification_error,
            config.max_edge_length,
            config.contour_flags,
        )
    });

    let poly_mesh = ctx.time(BuildStep::PolyMesh, |ctx| {
        #[cfg(feature = "trace")]
        let _span = tracing::info_span!("Build poly mesh").entered();

        build_poly_mesh(ctx, &contour_set, config.max_vertices_per_polygon)
    })?;

    let detail_mesh = if config.detail_sample_distance > 0.0 {
        Some(ctx.time(BuildStep::DetailMesh, |ctx| {
            #[cfg(feature = "trace")]
            let _span = tracing::info_span!("Build detail mesh").entered();

            build_poly_mesh_detail(
                ctx,
                &poly_mesh,
                &open,
                config.detail_sample_distance,
                config.detail_sample_max_error,
            )
        }))
    } else {
        None
    };

    Ok((poly_mesh, detail_mesh))
}

#[inline]
pub(crate) fn get_neighbour_index(width: usize, index: usize, dir: usize) -> usize {
    match dir {
        0 => index - 1,
        1 => index + width,
        2 => index + 1,
        3 => index - width,
        _ => panic!("Not a valid direction"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NavMeshConfig {
        NavMeshConfig::from_agent(0.5, 1.8, 0.4, Vec3::new(-10.0, -1.0, -10.0), Vec3::splat(10.0))
    }

    #[test]
    fn default_agent_config_is_valid() {
        config().validate().unwrap();
    }

    #[test]
    fn rejects_flat_slope_limit_of_ninety() {
        let config = config().with_walkable_slope(90.0);
        assert_eq!(config.validate(), Err(ConfigError::WalkableSlope(90.0)));
    }

    #[test]
    fn rejects_negative_cell_size() {
        let mut config = config();
        config.cell_size = -0.1;
        assert_eq!(config.validate(), Err(ConfigError::CellSize(-0.1)));
    }

    #[test]
    fn rejects_too_small_walkable_height() {
        let mut config = config();
        config.walkable_height = 2;
        assert_eq!(config.validate(), Err(ConfigError::WalkableHeight(2)));
    }

    #[test]
    fn rejects_oversized_polygons() {
        let mut config = config();
        config.max_vertices_per_polygon = 13;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxVerticesPerPolygon(13))
        );
    }

    #[test]
    fn rejects_sub_limit_detail_sampling() {
        let mut config = config();
        config.detail_sample_distance = 0.5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DetailSampleDistance(0.5))
        );
        config.detail_sample_distance = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut config = config();
        config.max_bounds = config.min_bounds - Vec3::ONE;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Bounds { .. })
        ));
    }

    #[test]
    fn neighbour_index_follows_direction_order() {
        let width = 10;
        let index = 45;
        assert_eq!(get_neighbour_index(width, index, 0), 44);
        assert_eq!(get_neighbour_index(width, index, 1), 55);
        assert_eq!(get_neighbour_index(width, index, 2), 46);
        assert_eq!(get_neighbour_index(width, index, 3), 35);
    }

    #[test]
    fn build_context_accumulates_timings_and_warnings() {
        let mut ctx = BuildContext::new();
        assert_eq!(ctx.duration(BuildStep::Regions), None);

        ctx.time(BuildStep::Regions, |ctx| ctx.warn("first"));
        ctx.time(BuildStep::Regions, |ctx| ctx.warn("second"));

        assert!(ctx.duration(BuildStep::Regions).is_some());
        assert_eq!(ctx.warnings(), &["first".to_string(), "second".to_string()]);
    }
}
