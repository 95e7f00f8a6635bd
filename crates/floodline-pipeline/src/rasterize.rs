//! Vector to raster conversion.

use std::collections::HashMap;

use geo::{BoundingRect, Coord, Intersects, Polygon};
use ndarray::Array2;

use crate::raster::{CellValue, GridSpec, Raster};
use crate::types::Flowline;

/// Sub-steps per cell used to measure line length inside cells.
const LENGTH_SAMPLES_PER_CELL: f64 = 8.0;

/// Burn polygons into a new raster on `grid`.
///
/// A cell takes a polygon's value when its center lies inside or on the
/// boundary of the polygon; later polygons overwrite earlier ones.
#[must_use]
pub fn rasterize_polygons<'a, T: CellValue>(
    polygons: impl IntoIterator<Item = (&'a Polygon<f64>, T)>,
    grid: &GridSpec,
    nodata: T,
) -> Raster<T> {
    let mut out = Raster::empty(*grid, nodata);
    for (polygon, value) in polygons {
        let Some(bounds) = polygon.bounding_rect() else {
            continue;
        };
        let Some((row0, row1, col0, col1)) = grid.window(bounds) else {
            continue;
        };
        for row in row0..=row1 {
            for col in col0..=col1 {
                if polygon.intersects(&grid.transform.cell_center(row, col)) {
                    out.set(row, col, value);
                }
            }
        }
    }
    out
}

/// Burn flowlines into a new raster on `grid`, value `grid_code`.
///
/// A cell crossed by several lines takes the value of the line with the
/// longest length inside the cell; on equal length the earlier line
/// wins.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn rasterize_flowlines(flowlines: &[Flowline], grid: &GridSpec, nodata: u32) -> Raster<u32> {
    let mut out = Raster::empty(*grid, nodata);
    let mut best = Array2::<f64>::zeros((grid.rows, grid.cols));
    let step = grid.transform.cell_size() / LENGTH_SAMPLES_PER_CELL;

    for line in flowlines {
        let mut lengths: HashMap<(usize, usize), f64> = HashMap::new();
        for segment in line.geometry.lines() {
            let length = segment.dx().hypot(segment.dy());
            if length == 0.0 {
                if let Some(cell) = grid.cell_of(segment.start) {
                    lengths.entry(cell).or_insert(0.0);
                }
                continue;
            }
            let n = (length / step).ceil().max(1.0) as usize;
            let piece = length / n as f64;
            for k in 0..n {
                let t = (k as f64 + 0.5) / n as f64;
                let at = Coord {
                    x: t.mul_add(segment.dx(), segment.start.x),
                    y: t.mul_add(segment.dy(), segment.start.y),
                };
                if let Some(cell) = grid.cell_of(at) {
                    *lengths.entry(cell).or_insert(0.0) += piece;
                }
            }
        }
        for ((row, col), length) in lengths {
            let claimed = out.is_data(row, col);
            if !claimed || length > best[[row, col]] {
                best[[row, col]] = length;
                out.set(row, col, line.grid_code);
            }
        }
    }
    out
}
