//! Generalization of a categorical raster to a minimum mapping unit.
//!
//! Small 4-connected regions are dropped and refilled from the nearest
//! retained cell, then river cells are burned in as water.

use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::raster::{CellValue, Raster};
use crate::types::{GeneralizeConfig, PipelineError};
use crate::vectorize::label_regions;

/// Counts recorded while generalizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeneralizeMetrics {
    /// 4-connected regions in the input.
    pub regions: usize,
    /// Regions at or below the minimum count.
    pub removed: usize,
    /// Cells refilled from a retained neighbour.
    pub refilled: usize,
    /// Cells set to water from the river raster.
    pub river_cells: usize,
}

/// Output of [`generalize_categories`].
#[derive(Debug, Clone, PartialEq)]
pub struct Generalized {
    /// Generalized raster on the input grid.
    pub raster: Raster<i32>,
    /// What happened along the way.
    pub metrics: GeneralizeMetrics,
}

/// Generalize `raster` so no region has `config.minimum_count` cells or
/// fewer, except water.
///
/// Removed cells take the value of the nearest retained cell (by cell
/// center distance). River cells (value above zero, sampled at cell
/// centers) are then set to the water class. No-data cells stay no-data.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if a river raster is given without a
/// water class, and [`PipelineError::Engine`] if the grid cannot be
/// labeled.
pub fn generalize_categories<R: CellValue>(
    raster: &Raster<i32>,
    rivers: Option<&Raster<R>>,
    config: &GeneralizeConfig,
) -> Result<Generalized, PipelineError> {
    if rivers.is_some() && config.water_code.is_none() {
        return Err(PipelineError::Config(
            "a river raster needs a water_code to burn in".to_string(),
        ));
    }

    let labeled = label_regions(raster)?;
    let mut metrics = GeneralizeMetrics {
        regions: labeled.regions.len(),
        ..GeneralizeMetrics::default()
    };

    let mut retained = Vec::new();
    let mut removed = Vec::new();
    for region in &labeled.regions {
        let keep = region.cells.len() > config.minimum_count
            || config.water_code == Some(region.value);
        if keep {
            retained.extend(
                region
                    .cells
                    .iter()
                    .map(|&(row, col)| GeomWithData::new(cell_point(row, col), region.value)),
            );
        } else {
            metrics.removed += 1;
            removed.extend(region.cells.iter().copied());
        }
    }

    let mut out = raster.clone();
    if retained.is_empty() {
        if !removed.is_empty() {
            warn!(
                minimum_count = config.minimum_count,
                "no region is large enough to keep, leaving raster unchanged"
            );
        }
    } else {
        let tree = RTree::bulk_load(retained);
        for (row, col) in removed {
            if let Some(nearest) = tree.nearest_neighbor(&cell_point(row, col)) {
                out.set(row, col, nearest.data);
                metrics.refilled += 1;
            }
        }
    }

    if let (Some(rivers), Some(water)) = (rivers, config.water_code) {
        for row in 0..out.rows() {
            for col in 0..out.cols() {
                if !out.is_data(row, col) {
                    continue;
                }
                let on_river = rivers
                    .value_at(out.cell_center(row, col))
                    .is_some_and(|v| v.to_f64() > 0.0);
                if on_river {
                    out.set(row, col, water);
                    metrics.river_cells += 1;
                }
            }
        }
    }

    debug!(
        regions = metrics.regions,
        removed = metrics.removed,
        refilled = metrics.refilled,
        river_cells = metrics.river_cells,
        "generalized categories"
    );
    Ok(Generalized {
        raster: out,
        metrics,
    })
}

#[allow(clippy::cast_precision_loss)]
fn cell_point(row: usize, col: usize) -> [f64; 2] {
    [row as f64, col as f64]
}
