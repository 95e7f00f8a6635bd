//! Flow-network derivation: elevation in, stream and river flowlines out.
//!
//! The study area is buffered by the calculation buffer and the elevation
//! raster is clipped to it. The clipped surface is filled, routed (D8),
//! accumulated and thresholded into a channel mask whose Strahler order is
//! split at the order cutoff into the stream and river sets.

use geo::{Buffer, MultiPolygon};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hydrology::{
    channel_mask, fill_depressions, flow_accumulation, flow_direction, stream_order,
};
use crate::raster::Raster;
use crate::rasterize::rasterize_polygons;
use crate::types::{FlowNetworkConfig, Flowline, NetworkKind, PipelineError, ProcessingContext};
use crate::vectorize::trace_flowlines;

/// No-data sentinel of the study-area mask.
const STUDY_AREA_NODATA: u8 = 0;

/// No-data sentinel of a resampled extraction mask.
const MASK_NODATA: u8 = u8::MAX;

/// Counts recorded while deriving the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowNetworkMetrics {
    /// Elevation cells inside the buffered study area.
    pub cells: usize,
    /// Cells at or above the accumulation threshold.
    pub channel_cells: usize,
    /// Highest Strahler order.
    pub max_order: u32,
    /// Stream flowlines.
    pub streams: usize,
    /// River flowlines.
    pub rivers: usize,
}

/// Intermediate rasters and both flowline sets.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowNetwork {
    /// Depression-filled elevation, cropped to the buffered study area.
    pub filled: Raster<f64>,
    /// D8 direction codes.
    pub direction: Raster<u8>,
    /// Upstream cell counts.
    pub accumulation: Raster<f64>,
    /// Strahler order of channel cells.
    pub order: Raster<u32>,
    /// Links with order at or below the cutoff.
    pub streams: Vec<Flowline>,
    /// Links with order above the cutoff.
    pub rivers: Vec<Flowline>,
    /// What happened along the way.
    pub metrics: FlowNetworkMetrics,
}

impl FlowNetwork {
    /// Flowlines of one network.
    #[must_use]
    pub fn flowlines(&self, kind: NetworkKind) -> &[Flowline] {
        match kind {
            NetworkKind::Stream => &self.streams,
            NetworkKind::River => &self.rivers,
        }
    }
}

/// Derive the stream and river flowlines of `study_area` from `elevation`.
///
/// When `mask` is given the order raster is sampled against it and cells
/// where the mask has no data drop out before tracing. A threshold that
/// excludes every cell gives empty flowline sets, not an error.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for an invalid configuration or a
/// study area that does not overlap the elevation data, and
/// [`PipelineError::Engine`] if stream ordering fails.
pub fn derive_flow_network(
    ctx: &ProcessingContext,
    elevation: &Raster<f64>,
    study_area: &MultiPolygon<f64>,
    mask: Option<&Raster<u8>>,
    config: &FlowNetworkConfig,
) -> Result<FlowNetwork, PipelineError> {
    ctx.validate()?;
    config.validate()?;
    debug!(parallel_factor = ctx.parallel_factor, "deriving flow network");

    let extent = if config.calculation_buffer > 0.0 {
        study_area.buffer(config.calculation_buffer)
    } else {
        study_area.clone()
    };
    let area_mask = rasterize_polygons(
        extent.iter().map(|polygon| (polygon, 1_u8)),
        &elevation.grid(),
        STUDY_AREA_NODATA,
    );

    let mut surface = elevation.clone();
    if surface.nodata().is_none() {
        surface.replace_nodata(f64::NAN);
    }
    let clipped = surface
        .extract_by_mask(&area_mask)?
        .crop_to_data()
        .ok_or_else(|| {
            PipelineError::Config(
                "study area does not overlap the elevation raster".to_string(),
            )
        })?;

    let filled = fill_depressions(&clipped, config.fill_tolerance);
    let direction = flow_direction(&filled);
    let accumulation = flow_accumulation(&direction);
    let channels = channel_mask(&accumulation, config.accumulation_threshold);
    let mut order = stream_order(&direction, &channels)?;
    if let Some(mask) = mask {
        let resampled = mask.resample_to(&order.grid(), MASK_NODATA);
        order = order.extract_by_mask(&resampled)?;
    }

    let cutoff = config.order_cutoff;
    let streams = trace_flowlines(&order, &direction, |o| o <= cutoff);
    let rivers = trace_flowlines(&order, &direction, |o| o > cutoff);

    let metrics = FlowNetworkMetrics {
        cells: clipped.data_count(),
        channel_cells: channels.data_count(),
        max_order: order.iter_data().map(|(_, _, o)| o).max().unwrap_or(0),
        streams: streams.len(),
        rivers: rivers.len(),
    };
    if streams.is_empty() && rivers.is_empty() {
        warn!(
            threshold = config.accumulation_threshold,
            "no cell reaches the accumulation threshold, flowline sets are empty"
        );
    }
    info!(
        streams = metrics.streams,
        rivers = metrics.rivers,
        max_order = metrics.max_order,
        "derived flow network"
    );

    Ok(FlowNetwork {
        filled,
        direction,
        accumulation,
        order,
        streams,
        rivers,
        metrics,
    })
}
