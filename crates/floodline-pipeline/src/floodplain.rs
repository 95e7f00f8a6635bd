//! Floodplain-boundary merge.
//!
//! Position rasters are thresholded per network and OR-ed together. The
//! resulting mask is corrected in raster space (small interior exclusions
//! become floodplain), polygonized, filtered to polygons touching a
//! flowline, smoothed, and burned back onto the fine area grid.

use geo::{BoundingRect, ChaikinSmoothing, Intersects, Line, Point};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::raster::{CellValue, Raster, ensure_same_grid};
use crate::rasterize::rasterize_polygons;
use crate::types::{FloodplainConfig, FloodplainPolygon, Flowline, PipelineError, ProcessingContext};
use crate::vectorize::{label_regions, polygonize_labeled};

/// No-data sentinel of intermediate binary masks (0 and 1 are data).
pub const MASK_NODATA: u8 = 255;

/// Floodplain cell value in masks and in the final raster.
pub const FLOODPLAIN: u8 = 1;

/// Excluded cell value in intermediate masks. The final raster never
/// holds it: excluded cells there are no-data.
pub const EXCLUDED: u8 = 0;

/// No-data sentinel of the final floodplain raster. Shares its value with
/// [`EXCLUDED`], which only appears in the intermediate masks.
pub const FLOODPLAIN_NODATA: u8 = 0;

/// Counts recorded while merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FloodplainMetrics {
    /// Floodplain cells in the combined mask before correction.
    pub mask_cells: usize,
    /// Excluded regions reclassified as floodplain.
    pub reclassified: usize,
    /// Excluded regions left out of the floodplain.
    pub excluded: usize,
    /// Floodplain polygons dropped for not touching any flowline.
    pub disconnected: usize,
    /// Polygons in the result.
    pub polygons: usize,
}

/// Output of [`merge_floodplains`].
#[derive(Debug, Clone, PartialEq)]
pub struct FloodplainMerge {
    /// Floodplain on the area grid: [`FLOODPLAIN`] inside, no-data
    /// ([`FLOODPLAIN_NODATA`]) elsewhere.
    pub raster: Raster<u8>,
    /// Smoothed floodplain polygons, all with `grid_code` 1.
    pub polygons: Vec<FloodplainPolygon>,
    /// What happened along the way.
    pub metrics: FloodplainMetrics,
}

/// `1` where `position <= threshold`, `0` elsewhere, no-data preserved.
#[must_use]
pub fn binarize(position: &Raster<i32>, threshold: i32) -> Raster<u8> {
    position.map(MASK_NODATA, |v| Some(if v <= threshold { FLOODPLAIN } else { EXCLUDED }))
}

/// Cellwise OR of binary masks on a shared grid, computed as `sum > 0`
/// over data cells. A cell is no-data only where every mask is.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for an empty slice or mismatched
/// grids.
pub fn union_masks(masks: &[Raster<u8>]) -> Result<Raster<u8>, PipelineError> {
    let Some(first) = masks.first() else {
        return Err(PipelineError::Config("no masks to merge".to_string()));
    };
    let grid = first.grid();
    for mask in &masks[1..] {
        ensure_same_grid(&grid, &mask.grid(), "position")?;
    }
    let mut out = Raster::empty(grid, MASK_NODATA);
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let mut sum: Option<u32> = None;
            for mask in masks {
                if let Some(v) = mask.get(row, col) {
                    *sum.get_or_insert(0) += u32::from(v);
                }
            }
            if let Some(sum) = sum {
                out.set(row, col, if sum > 0 { FLOODPLAIN } else { EXCLUDED });
            }
        }
    }
    Ok(out)
}

/// Merge per-network position rasters into one floodplain.
///
/// `positions[i]` is thresholded at `thresholds[i]`; `flowlines[i]` is
/// the network it was computed from. Every position raster must share
/// one grid. The output raster lies on the `area` grid.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] when the three slices differ in
/// length or are empty, when the position grids differ, or for an
/// invalid configuration.
pub fn merge_floodplains<A: CellValue>(
    ctx: &ProcessingContext,
    area: &Raster<A>,
    positions: &[Raster<i32>],
    flowlines: &[&[Flowline]],
    thresholds: &[i32],
    config: &FloodplainConfig,
) -> Result<FloodplainMerge, PipelineError> {
    ctx.validate()?;
    config.validate()?;
    if positions.len() != flowlines.len() || positions.len() != thresholds.len() {
        return Err(PipelineError::Config(format!(
            "{} position rasters, {} flowline sets and {} thresholds must match",
            positions.len(),
            flowlines.len(),
            thresholds.len()
        )));
    }
    if positions.is_empty() {
        return Err(PipelineError::Config(
            "at least one position raster is required".to_string(),
        ));
    }

    let masks: Vec<Raster<u8>> = positions
        .iter()
        .zip(thresholds)
        .map(|(position, &threshold)| binarize(position, threshold))
        .collect();
    let mut mask = union_masks(&masks)?;
    let mut metrics = FloodplainMetrics {
        mask_cells: mask.iter_data().filter(|&(_, _, v)| v == FLOODPLAIN).count(),
        ..FloodplainMetrics::default()
    };

    // Small interior exclusions become floodplain before polygonizing, so
    // the dissolve happens in raster space.
    let cell_area = mask.transform().cell_area();
    let labeled = label_regions(&mask)?;
    for region in labeled.regions.iter().filter(|r| r.value == EXCLUDED) {
        #[allow(clippy::cast_precision_loss)]
        let region_area = region.cells.len() as f64 * cell_area;
        if !region.touches_border && region_area < config.area_limit {
            metrics.reclassified += 1;
            for &(row, col) in &region.cells {
                mask.set(row, col, FLOODPLAIN);
            }
        } else {
            metrics.excluded += 1;
        }
    }

    let labeled = label_regions(&mask)?;
    let candidates = polygonize_labeled(&mask, &labeled, |r| r.value == FLOODPLAIN);

    let segments: RTree<Line<f64>> = RTree::bulk_load(
        flowlines
            .iter()
            .flat_map(|set| set.iter())
            .flat_map(|f| f.geometry.lines())
            .collect(),
    );
    if segments.size() == 0 {
        warn!("no flowlines to anchor the floodplain; every polygon is dropped");
    }

    let mut polygons = Vec::new();
    for candidate in candidates {
        let touches_flowline = candidate.polygon.bounding_rect().is_some_and(|bounds| {
            let envelope = AABB::from_corners(Point::from(bounds.min()), Point::from(bounds.max()));
            segments
                .locate_in_envelope_intersecting(&envelope)
                .any(|line| candidate.polygon.intersects(line))
        });
        if !touches_flowline {
            metrics.disconnected += 1;
            continue;
        }
        polygons.push(FloodplainPolygon {
            polygon: candidate.polygon.chaikin_smoothing(config.smoothing_iterations),
            grid_code: FLOODPLAIN,
        });
    }
    metrics.polygons = polygons.len();

    let mut raster = rasterize_polygons(
        polygons.iter().map(|p| (&p.polygon, FLOODPLAIN)),
        &area.grid(),
        FLOODPLAIN_NODATA,
    );
    for row in 0..raster.rows() {
        for col in 0..raster.cols() {
            if !area.is_data(row, col) {
                raster.clear(row, col);
            }
        }
    }

    debug!(
        parallel_factor = ctx.parallel_factor,
        mask_cells = metrics.mask_cells,
        reclassified = metrics.reclassified,
        excluded = metrics.excluded,
        disconnected = metrics.disconnected,
        polygons = metrics.polygons,
        "merged floodplains"
    );
    Ok(FloodplainMerge {
        raster,
        polygons,
        metrics,
    })
}
