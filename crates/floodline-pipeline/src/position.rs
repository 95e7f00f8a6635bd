//! Hydrographic position: squared vertical deviation of every cell from
//! the nearest flowline cell.
//!
//! The computation runs on a working grid covering the area raster at the
//! context cell size. Flowline cells seed a nearest-neighbour fill
//! ("nibble") of the surface value, the deviation is squared, scaled,
//! rounded and clamped to a ceiling, and cells beyond the search distance
//! of every flowline are forced to the ceiling.

use geo::line_measures::Distance;
use geo::{Euclidean, Line, Point};
use ndarray::Array2;
use rstar::RTree;
use rstar::primitives::GeomWithData;
use tracing::{debug, warn};

use crate::raster::{CellValue, GridSpec, Raster};
use crate::rasterize::rasterize_flowlines;
use crate::types::{
    Flowline, NetworkConfig, PipelineError, PositionConfig, PositionSurface, ProcessingContext,
};

/// No-data sentinel of position rasters.
pub const POSITION_NODATA: i32 = i32::MIN;

/// A flowline cell center tagged with its surface value.
type Seed = GeomWithData<Point<f64>, f64>;

/// Compute the hydrographic position of `area` relative to `flowlines`.
///
/// The result covers the area raster's extent on the working grid. Every
/// cell inside the area footprint holds a value in `0..=ceiling`; cells
/// outside hold [`POSITION_NODATA`]. Area cells without elevation, and all
/// area cells when no flowline cell has elevation, get the ceiling.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for invalid parameters or a working
/// cell size that cannot form a grid.
pub fn compute_hydrographic_position<A: CellValue>(
    ctx: &ProcessingContext,
    area: &Raster<A>,
    elevation: &Raster<f64>,
    flowlines: &[Flowline],
    network: &NetworkConfig,
    config: &PositionConfig,
) -> Result<Raster<i32>, PipelineError> {
    ctx.validate()?;
    network.validate()?;
    config.validate()?;

    let cell_size = ctx.working_cell_size(elevation.cell_size());
    let grid = GridSpec::covering(
        area.grid().bounds(),
        cell_size,
        &ctx.snap_or(area.transform()),
    )?;
    let footprint = area_footprint(area, &grid);
    let elevation = elevation
        .resample_to(&grid, f64::NAN)
        .extract_by_mask(&footprint)?;
    let surface = match config.surface {
        PositionSurface::Elevation => elevation,
        PositionSurface::TopographicPosition { window } => topographic_position(&elevation, window),
    };

    let flowline_cells = rasterize_flowlines(flowlines, &grid, 0);
    let seeds: Vec<Seed> = flowline_cells
        .iter_data()
        .filter_map(|(row, col, _)| {
            let z = surface.get(row, col)?;
            Some(GeomWithData::new(Point::from(grid.transform.cell_center(row, col)), z))
        })
        .collect();
    debug!(
        network = network.kind.as_str(),
        flowlines = flowlines.len(),
        seeds = seeds.len(),
        rows = grid.rows,
        cols = grid.cols,
        "computing hydrographic position"
    );
    if seeds.is_empty() {
        warn!(
            network = network.kind.as_str(),
            "no flowline cell has elevation; every area cell is set to the ceiling"
        );
    }
    let seeds = RTree::bulk_load(seeds);
    let segments = RTree::bulk_load(
        flowlines
            .iter()
            .flat_map(|f| f.geometry.lines())
            .collect::<Vec<Line<f64>>>(),
    );

    let ceiling = config.ceiling;
    let mut out = Raster::empty(grid, POSITION_NODATA);
    for (row, col, _) in footprint.iter_data() {
        let center = Point::from(grid.transform.cell_center(row, col));
        let within_search = segments
            .nearest_neighbor(&center)
            .is_some_and(|line| Euclidean.distance(&center, line) <= network.search_distance);
        let value = match (surface.get(row, col), seeds.nearest_neighbor(&center)) {
            (Some(z), Some(seed)) if within_search => {
                squared_deviation(z, seed.data, config.scale, ceiling)
            }
            _ => ceiling,
        };
        out.set(row, col, value);
    }
    Ok(out)
}

/// `round((z - nearest)^2 * scale)`, clamped to `ceiling`.
///
/// The clamp happens before the integer cast, so large deviations map to
/// exactly `ceiling` instead of wrapping.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn squared_deviation(z: f64, nearest: f64, scale: f64, ceiling: i32) -> i32 {
    let diff = z - nearest;
    let value = (diff * diff).mul_add(scale, 0.5).floor();
    if value.is_nan() || value > f64::from(ceiling) {
        ceiling
    } else {
        value as i32
    }
}

/// Footprint of the area raster on the working grid (1 = inside).
fn area_footprint<A: CellValue>(area: &Raster<A>, grid: &GridSpec) -> Raster<u8> {
    let mut footprint = Raster::empty(*grid, 0_u8);
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            if area.value_at(grid.transform.cell_center(row, col)).is_some() {
                footprint.set(row, col, 1);
            }
        }
    }
    footprint
}

/// Surface minus its focal mean over a square window `window` map units
/// wide. The window is centered on the cell and averages data cells only.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn topographic_position(surface: &Raster<f64>, window: f64) -> Raster<f64> {
    let axis = (window / surface.cell_size()).floor().max(1.0) as usize;
    let mean = focal_mean(surface, axis / 2);
    let mut out = surface.clone();
    for (row, col, z) in surface.iter_data() {
        if let Some(m) = mean.get(row, col) {
            out.set(row, col, z - m);
        }
    }
    out
}

/// Mean of the data cells within `radius` cells (square window), via a
/// summed-area table.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn focal_mean(surface: &Raster<f64>, radius: usize) -> Raster<f64> {
    let (rows, cols) = (surface.rows(), surface.cols());
    let mut sum = Array2::<f64>::zeros((rows + 1, cols + 1));
    let mut count = Array2::<u64>::zeros((rows + 1, cols + 1));
    for row in 0..rows {
        for col in 0..cols {
            let (v, n) = surface.get(row, col).map_or((0.0, 0), |z| (z, 1));
            sum[[row + 1, col + 1]] = v + sum[[row, col + 1]] + sum[[row + 1, col]] - sum[[row, col]];
            count[[row + 1, col + 1]] =
                n + count[[row, col + 1]] + count[[row + 1, col]] - count[[row, col]];
        }
    }

    let mut out = surface.map(f64::NAN, |_| Some(0.0));
    for (row, col, _) in surface.iter_data() {
        let (r0, c0) = (row.saturating_sub(radius), col.saturating_sub(radius));
        let (r1, c1) = ((row + radius + 1).min(rows), (col + radius + 1).min(cols));
        let s = sum[[r1, c1]] - sum[[r0, c1]] - sum[[r1, c0]] + sum[[r0, c0]];
        let n = count[[r1, c1]] + count[[r0, c0]] - count[[r0, c1]] - count[[r1, c0]];
        if n > 0 {
            out.set(row, col, s / n as f64);
        }
    }
    out
}
