//! Shared types for the floodline pipeline: features, configuration,
//! processing context and errors.

use geo::{LineString, Point, Polygon};
use serde::{Deserialize, Serialize};

use crate::raster::GeoTransform;

/// A flowline link traced from the stream-order raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flowline {
    /// Line through the centers of the link's cells.
    pub geometry: LineString<f64>,
    /// Strahler order of the link.
    pub grid_code: u32,
}

/// A polygon produced by polygonizing the floodplain mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodplainPolygon {
    /// Polygon geometry (one outer ring, zero or more holes).
    pub polygon: Polygon<f64>,
    /// `1` for floodplain, `0` for excluded.
    pub grid_code: u8,
}

/// An image-segmentation polygon supplied as splicing input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPolygon {
    /// Identifier carried from the segmentation source.
    pub id: u32,
    /// Segment geometry.
    pub polygon: Polygon<f64>,
}

/// A refined segment produced by splicing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplicedSegment {
    /// New identifier, shared with the raster and point outputs.
    pub id: u32,
    /// Identifier of the segment this part was cut from.
    pub source_id: u32,
    /// Partition class code (see [`crate::category::PartitionClass`]).
    pub class: i32,
    /// Single-part geometry.
    pub polygon: Polygon<f64>,
}

/// Representative interior point of a [`SplicedSegment`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentPoint {
    /// Identifier of the segment the point represents.
    pub id: u32,
    /// Location strictly inside the segment polygon.
    pub point: Point<f64>,
}

/// Which flowline class a network represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// Links with order at or below the cutoff.
    Stream,
    /// Links with order above the cutoff.
    River,
}

impl NetworkKind {
    /// Lowercase name used in file names and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::River => "river",
        }
    }
}

/// Explicit processing environment passed into every stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingContext {
    /// Working cell size for the hydrographic-position grid. `None` uses
    /// the elevation cell size.
    pub cell_size: Option<f64>,
    /// Lattice that derived grids align to. `None` uses the area raster.
    pub snap: Option<GeoTransform>,
    /// Engine core-usage factor (0.0-1.0). Recorded, not orchestrated.
    pub parallel_factor: f32,
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self {
            cell_size: None,
            snap: None,
            parallel_factor: Self::DEFAULT_PARALLEL_FACTOR,
        }
    }
}

impl ProcessingContext {
    /// Default parallel factor.
    pub const DEFAULT_PARALLEL_FACTOR: f32 = 0.75;

    /// Working cell size, falling back to `native`.
    #[must_use]
    pub fn working_cell_size(&self, native: f64) -> f64 {
        self.cell_size.unwrap_or(native)
    }

    /// Snap transform, falling back to `native`.
    #[must_use]
    pub fn snap_or(&self, native: &GeoTransform) -> GeoTransform {
        self.snap.unwrap_or(*native)
    }

    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for a non-positive cell size or a
    /// parallel factor outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(cs) = self.cell_size {
            positive("cell_size", cs)?;
        }
        if !(0.0..=1.0).contains(&self.parallel_factor) {
            return Err(PipelineError::Config(format!(
                "parallel_factor must be within 0..=1, got {}",
                self.parallel_factor
            )));
        }
        Ok(())
    }
}

/// Parameters of flow-network derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowNetworkConfig {
    /// Minimum upstream cell count for a cell to be a channel.
    pub accumulation_threshold: f64,
    /// Maximum depression depth that is filled. `None` fills everything.
    pub fill_tolerance: Option<f64>,
    /// Buffer around the study area that bounds the routing extent.
    pub calculation_buffer: f64,
    /// Highest order still classified as stream.
    pub order_cutoff: u32,
}

impl FlowNetworkConfig {
    /// Default accumulation threshold (cells).
    pub const DEFAULT_ACCUMULATION_THRESHOLD: f64 = 50_000.0;
    /// Default fill tolerance (elevation units).
    pub const DEFAULT_FILL_TOLERANCE: f64 = 5.0;
    /// Default calculation buffer (map units).
    pub const DEFAULT_CALCULATION_BUFFER: f64 = 10_000.0;
    /// Default stream/river order cutoff.
    pub const DEFAULT_ORDER_CUTOFF: u32 = 3;

    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        non_negative("accumulation_threshold", self.accumulation_threshold)?;
        if let Some(tol) = self.fill_tolerance {
            non_negative("fill_tolerance", tol)?;
        }
        non_negative("calculation_buffer", self.calculation_buffer)?;
        if self.order_cutoff == 0 {
            return Err(PipelineError::Config(
                "order_cutoff must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FlowNetworkConfig {
    fn default() -> Self {
        Self {
            accumulation_threshold: Self::DEFAULT_ACCUMULATION_THRESHOLD,
            fill_tolerance: Some(Self::DEFAULT_FILL_TOLERANCE),
            calculation_buffer: Self::DEFAULT_CALCULATION_BUFFER,
            order_cutoff: Self::DEFAULT_ORDER_CUTOFF,
        }
    }
}

/// Surface whose nearest-flowline deviation is measured.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PositionSurface {
    /// Raw elevation.
    #[default]
    Elevation,
    /// Elevation minus its focal mean over a square window.
    TopographicPosition {
        /// Window width in map units.
        window: f64,
    },
}

/// Parameters of hydrographic-position calculation shared by networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Sentinel for cells too far from a channel.
    pub ceiling: i32,
    /// Multiplier applied to the squared deviation before rounding.
    pub scale: f64,
    /// Surface the deviation is computed on.
    pub surface: PositionSurface,
}

impl PositionConfig {
    /// Default ceiling sentinel.
    pub const DEFAULT_CEILING: i32 = 32_000;
    /// Default squared-deviation scale.
    pub const DEFAULT_SCALE: f64 = 100.0;

    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for a negative ceiling, a
    /// non-positive scale or a non-positive window.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.ceiling < 0 {
            return Err(PipelineError::Config(format!(
                "ceiling must be non-negative, got {}",
                self.ceiling
            )));
        }
        positive("scale", self.scale)?;
        if let PositionSurface::TopographicPosition { window } = self.surface {
            positive("window", window)?;
        }
        Ok(())
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            ceiling: Self::DEFAULT_CEILING,
            scale: Self::DEFAULT_SCALE,
            surface: PositionSurface::default(),
        }
    }
}

/// Per-network search distance and floodplain threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Which flowline class this network uses.
    pub kind: NetworkKind,
    /// Radius around the flowlines within which position is computed.
    pub search_distance: f64,
    /// Maximum position value classified as floodplain.
    pub threshold: i32,
}

impl NetworkConfig {
    /// Default river search distance.
    pub const DEFAULT_RIVER_SEARCH_DISTANCE: f64 = 2_500.0;
    /// Default stream search distance.
    pub const DEFAULT_STREAM_SEARCH_DISTANCE: f64 = 250.0;
    /// Default river floodplain threshold.
    pub const DEFAULT_RIVER_THRESHOLD: i32 = 400;
    /// Default stream floodplain threshold.
    pub const DEFAULT_STREAM_THRESHOLD: i32 = 9;

    /// River network with default parameters.
    #[must_use]
    pub const fn river() -> Self {
        Self {
            kind: NetworkKind::River,
            search_distance: Self::DEFAULT_RIVER_SEARCH_DISTANCE,
            threshold: Self::DEFAULT_RIVER_THRESHOLD,
        }
    }

    /// Stream network with default parameters.
    #[must_use]
    pub const fn stream() -> Self {
        Self {
            kind: NetworkKind::Stream,
            search_distance: Self::DEFAULT_STREAM_SEARCH_DISTANCE,
            threshold: Self::DEFAULT_STREAM_THRESHOLD,
        }
    }

    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for a negative distance or
    /// threshold.
    pub fn validate(&self) -> Result<(), PipelineError> {
        non_negative("search_distance", self.search_distance)?;
        if self.threshold < 0 {
            return Err(PipelineError::Config(format!(
                "{} threshold must be non-negative, got {}",
                self.kind.as_str(),
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Parameters of the floodplain merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodplainConfig {
    /// Excluded polygons smaller than this area become floodplain.
    pub area_limit: f64,
    /// Chaikin smoothing passes applied to the final boundaries.
    pub smoothing_iterations: usize,
}

impl FloodplainConfig {
    /// Default area limit (square map units).
    pub const DEFAULT_AREA_LIMIT: f64 = 2_000_000.0;
    /// Default smoothing passes.
    pub const DEFAULT_SMOOTHING_ITERATIONS: usize = 2;

    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for a negative area limit.
    pub fn validate(&self) -> Result<(), PipelineError> {
        non_negative("area_limit", self.area_limit)
    }
}

impl Default for FloodplainConfig {
    fn default() -> Self {
        Self {
            area_limit: Self::DEFAULT_AREA_LIMIT,
            smoothing_iterations: Self::DEFAULT_SMOOTHING_ITERATIONS,
        }
    }
}

/// River-only merge that produces the river channel raster used by the
/// two-network splice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiverChannelConfig {
    /// Position threshold on the river position raster.
    pub threshold: i32,
    /// Merge parameters.
    pub floodplain: FloodplainConfig,
}

impl RiverChannelConfig {
    /// Default river channel threshold.
    pub const DEFAULT_THRESHOLD: i32 = 0;
    /// Default river channel area limit.
    pub const DEFAULT_AREA_LIMIT: f64 = 100.0;
}

impl Default for RiverChannelConfig {
    fn default() -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
            floodplain: FloodplainConfig {
                area_limit: Self::DEFAULT_AREA_LIMIT,
                ..FloodplainConfig::default()
            },
        }
    }
}

/// Parameters of segment splicing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpliceConfig {
    /// Spliced parts with a smaller area are dropped.
    pub sliver_area: f64,
}

/// Parameters of categorical raster generalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralizeConfig {
    /// Regions with at most this many cells are replaced by their
    /// nearest retained neighbour.
    pub minimum_count: usize,
    /// Class that is never removed and is burned in where rivers run.
    pub water_code: Option<i32>,
}

impl GeneralizeConfig {
    /// Default minimum mapping unit in cells.
    pub const DEFAULT_MINIMUM_COUNT: usize = 8;
}

impl Default for GeneralizeConfig {
    fn default() -> Self {
        Self {
            minimum_count: Self::DEFAULT_MINIMUM_COUNT,
            water_code: None,
        }
    }
}

/// Every tunable of the pipeline in one serializable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodlineConfig {
    /// Free-text note on where the numbers come from (study area, date,
    /// calibration source).
    pub provenance: Option<String>,
    /// Flow-network derivation.
    pub flow: FlowNetworkConfig,
    /// Networks whose positions are merged into the floodplain, in merge
    /// order.
    pub networks: Vec<NetworkConfig>,
    /// Hydrographic position.
    pub position: PositionConfig,
    /// Floodplain merge.
    pub floodplain: FloodplainConfig,
    /// Optional river channel merge for the two-network splice.
    pub river_channel: Option<RiverChannelConfig>,
    /// Segment splicing.
    pub splice: SpliceConfig,
    /// Categorical generalization.
    pub generalize: GeneralizeConfig,
}

impl Default for FloodlineConfig {
    fn default() -> Self {
        Self {
            provenance: None,
            flow: FlowNetworkConfig::default(),
            networks: vec![NetworkConfig::river(), NetworkConfig::stream()],
            position: PositionConfig::default(),
            floodplain: FloodplainConfig::default(),
            river_channel: None,
            splice: SpliceConfig::default(),
            generalize: GeneralizeConfig::default(),
        }
    }
}

impl FloodlineConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`PipelineError::Config`] found. An empty network
    /// list, or a river channel merge without a river network, is invalid.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.flow.validate()?;
        self.position.validate()?;
        self.floodplain.validate()?;
        if self.networks.is_empty() {
            return Err(PipelineError::Config(
                "at least one network is required".to_string(),
            ));
        }
        for network in &self.networks {
            network.validate()?;
        }
        if let Some(river) = &self.river_channel {
            river.floodplain.validate()?;
            if self.network(NetworkKind::River).is_none() {
                return Err(PipelineError::Config(
                    "river_channel needs a river network".to_string(),
                ));
            }
        }
        non_negative("sliver_area", self.splice.sliver_area)
    }

    /// The network of the given kind, if configured.
    #[must_use]
    pub fn network(&self, kind: NetworkKind) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.kind == kind)
    }
}

/// Errors that can occur during pipeline processing.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// Invalid parameters or mismatched inputs.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A raster or geometry operation could not be carried out.
    #[error("engine error: {0}")]
    Engine(String),
}

impl PipelineError {
    /// Whether this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), PipelineError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{name} must be a non-negative number, got {value}"
        )))
    }
}

fn positive(name: &str, value: f64) -> Result<(), PipelineError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_reference_values() {
        let config = FloodlineConfig::default();
        assert!((config.flow.calculation_buffer - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(config.flow.order_cutoff, 3);
        assert_eq!(config.position.ceiling, 32_000);
        assert!((config.floodplain.area_limit - 2_000_000.0).abs() < f64::EPSILON);
        assert_eq!(config.network(NetworkKind::Stream).unwrap().threshold, 9);
        assert_eq!(config.network(NetworkKind::River).unwrap().threshold, 400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = FloodlineConfig {
            provenance: Some("test basin".to_string()),
            river_channel: Some(RiverChannelConfig::default()),
            ..FloodlineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: FloodlineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: FloodlineConfig =
            serde_json::from_str(r#"{"flow": {"order_cutoff": 4}}"#).unwrap();
        assert_eq!(config.flow.order_cutoff, 4);
        assert!((config.flow.accumulation_threshold - 50_000.0).abs() < f64::EPSILON);
        assert_eq!(config.networks.len(), 2);
    }

    #[test]
    fn surface_is_tagged() {
        let surface: PositionSurface =
            serde_json::from_str(r#"{"kind": "topographic_position", "window": 150.0}"#).unwrap();
        assert_eq!(surface, PositionSurface::TopographicPosition { window: 150.0 });
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = FloodlineConfig::default();
        config.flow.order_cutoff = 0;
        assert!(config.validate().unwrap_err().is_config());

        let mut config = FloodlineConfig::default();
        config.networks.clear();
        assert!(config.validate().is_err());

        let mut config = FloodlineConfig::default();
        config.position.scale = f64::NAN;
        assert!(config.validate().is_err());

        let config = FloodlineConfig {
            networks: vec![NetworkConfig::stream()],
            river_channel: Some(RiverChannelConfig::default()),
            ..FloodlineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn context_falls_back_to_native() {
        let ctx = ProcessingContext::default();
        assert!((ctx.working_cell_size(10.0) - 10.0).abs() < f64::EPSILON);
        let ctx = ProcessingContext {
            cell_size: Some(30.0),
            ..ProcessingContext::default()
        };
        assert!((ctx.working_cell_size(10.0) - 30.0).abs() < f64::EPSILON);
        assert!(ctx.validate().is_ok());
        let bad = ProcessingContext {
            parallel_factor: 2.0,
            ..ProcessingContext::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn error_display() {
        let err = PipelineError::Config("3 positions, 2 flowline sets".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: 3 positions, 2 flowline sets"
        );
        assert!(!PipelineError::Engine("x".to_string()).is_config());
    }
}
