//! floodline-pipeline: flow-network, hydrographic position, floodplain and
//! segment splicing algorithms (sans-IO).
//!
//! Turns an elevation raster into floodplain boundaries and refined
//! segments through:
//! flow network -> hydrographic position -> floodplain merge -> splice.
//!
//! This crate has **no I/O dependencies**: it operates on in-memory
//! [`Raster`]s and `geo` geometries and returns structured data. GeoTIFF
//! and GeoJSON files, stage memoization and the project layout live in
//! `floodline-io`.

pub mod category;
pub mod diagnostics;
pub mod floodplain;
pub mod flow_network;
pub mod generalize;
pub mod hydrology;
pub mod pipeline;
pub mod position;
pub mod raster;
pub mod rasterize;
pub mod simplify;
pub mod splice;
pub mod types;
pub mod vectorize;
pub mod zonal;

pub use category::{Category, CategoryMap, PartitionClass, RuleTable};
pub use diagnostics::{Clock, PipelineDiagnostics, process_staged_with_diagnostics};
pub use floodplain::{FloodplainMerge, merge_floodplains};
pub use flow_network::{FlowNetwork, derive_flow_network};
pub use generalize::{Generalized, generalize_categories};
pub use pipeline::{Pipeline, PipelineInputs, PipelineResult};
pub use position::{POSITION_NODATA, compute_hydrographic_position};
pub use raster::{CellValue, GeoTransform, GridSpec, Raster, ValueKind};
pub use splice::{SplicedSegments, splice_segments};
pub use types::{
    FloodlineConfig, FloodplainConfig, FloodplainPolygon, FlowNetworkConfig, Flowline,
    GeneralizeConfig, NetworkConfig, NetworkKind, PipelineError, PositionConfig, PositionSurface,
    ProcessingContext, RiverChannelConfig, SegmentPoint, SegmentPolygon, SpliceConfig,
    SplicedSegment,
};
pub use zonal::{ZonalResult, ZonalStatistic, zonal_statistics};

/// Run the full pipeline in memory.
///
/// # Pipeline steps
///
/// 1. Buffer the study area, clip, fill, route and order the elevation
/// 2. Split the order raster into stream and river flowlines
/// 3. Hydrographic position per configured network
/// 4. Threshold, union and correct the positions into a floodplain
/// 5. Optional river-only merge for the river channel
/// 6. Splice the segments along the floodplain and river channel
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for invalid configuration or
/// mismatched inputs and [`PipelineError::Engine`] when a raster or
/// geometry operation fails.
pub fn process(
    inputs: PipelineInputs,
    config: &FloodlineConfig,
) -> Result<PipelineResult, PipelineError> {
    Ok(Pipeline::new(inputs, config.clone())
        .derive_flow_network()?
        .compute_positions()?
        .merge_floodplains()?
        .splice()?
        .into_result())
}
