//! Incremental pipeline: advance stage by stage, inspecting each
//! intermediate result before continuing.
//!
//! ```rust
//! # use floodline_pipeline::{FloodlineConfig, Pipeline, PipelineError, PipelineInputs};
//! # fn run(inputs: PipelineInputs) -> Result<(), PipelineError> {
//! let result = Pipeline::new(inputs, FloodlineConfig::default())
//!     .derive_flow_network()?
//!     .compute_positions()?
//!     .merge_floodplains()?
//!     .splice()?
//!     .into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state, carrying
//! every earlier intermediate. The stages are the in-memory counterpart of
//! the on-disk stages in `floodline-io`; both call the same stage
//! functions.

use geo::MultiPolygon;

use crate::diagnostics::{PositionSummary, StageMetrics};
use crate::flow_network::{FlowNetwork, derive_flow_network};
use crate::floodplain::{FloodplainMerge, merge_floodplains};
use crate::position::compute_hydrographic_position;
use crate::raster::{GridSpec, Raster};
use crate::splice::{SplicedSegments, splice_segments};
use crate::types::{
    FloodlineConfig, Flowline, NetworkKind, PipelineError, ProcessingContext, SegmentPolygon,
};

/// Everything the pipeline reads.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    /// Processing environment.
    pub context: ProcessingContext,
    /// Elevation surface.
    pub elevation: Raster<f64>,
    /// Area raster; its data cells are the footprint of every output.
    pub area: Raster<u8>,
    /// Study-area boundary for flow routing.
    pub study_area: MultiPolygon<f64>,
    /// Optional mask the stream-order raster is extracted to.
    pub mask: Option<Raster<u8>>,
    /// Image-segmentation polygons to splice.
    pub segments: Vec<SegmentPolygon>,
}

/// Position raster of one network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPosition {
    /// Network the raster was computed for.
    pub kind: NetworkKind,
    /// Hydrographic position.
    pub raster: Raster<i32>,
}

/// Everything the pipeline produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Grid of the area raster.
    pub area_grid: GridSpec,
    /// Flow network and flowlines.
    pub network: FlowNetwork,
    /// Position rasters in network order.
    pub positions: Vec<NetworkPosition>,
    /// Merged floodplain.
    pub floodplain: FloodplainMerge,
    /// River-only merge, when configured.
    pub river_channel: Option<FloodplainMerge>,
    /// Spliced segments.
    pub spliced: SplicedSegments,
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
#[must_use = "pipeline stages are consumed by advancing, call .derive_flow_network() to continue"]
pub struct Pending {
    config: FloodlineConfig,
    inputs: PipelineInputs,
}

impl Pending {
    /// The inputs the pipeline will read.
    #[must_use]
    pub const fn inputs(&self) -> &PipelineInputs {
        &self.inputs
    }

    /// Validate the configuration and derive the flow network.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an invalid configuration and
    /// propagates [`derive_flow_network`] errors.
    pub fn derive_flow_network(self) -> Result<FlowNetworkDerived, PipelineError> {
        self.config.validate()?;
        let network = derive_flow_network(
            &self.inputs.context,
            &self.inputs.elevation,
            &self.inputs.study_area,
            self.inputs.mask.as_ref(),
            &self.config.flow,
        )?;
        Ok(FlowNetworkDerived {
            config: self.config,
            inputs: self.inputs,
            network,
        })
    }
}

// ──────────────────── Stage 1: FlowNetworkDerived ────────────────────

/// Pipeline state after flow-network derivation.
#[must_use = "pipeline stages are consumed by advancing, call .compute_positions() to continue"]
pub struct FlowNetworkDerived {
    config: FloodlineConfig,
    inputs: PipelineInputs,
    network: FlowNetwork,
}

impl FlowNetworkDerived {
    /// The derived network.
    #[must_use]
    pub const fn network(&self) -> &FlowNetwork {
        &self.network
    }

    /// Compute one position raster per configured network.
    ///
    /// # Errors
    ///
    /// Propagates [`compute_hydrographic_position`] errors.
    pub fn compute_positions(self) -> Result<PositionsComputed, PipelineError> {
        let positions = self
            .config
            .networks
            .iter()
            .map(|net| {
                compute_hydrographic_position(
                    &self.inputs.context,
                    &self.inputs.area,
                    &self.inputs.elevation,
                    self.network.flowlines(net.kind),
                    net,
                    &self.config.position,
                )
                .map(|raster| NetworkPosition {
                    kind: net.kind,
                    raster,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PositionsComputed {
            config: self.config,
            inputs: self.inputs,
            network: self.network,
            positions,
        })
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::FlowNetwork(self.network.metrics)
    }
}

// ──────────────────── Stage 2: PositionsComputed ─────────────────────

/// Pipeline state after hydrographic position.
#[must_use = "pipeline stages are consumed by advancing, call .merge_floodplains() to continue"]
pub struct PositionsComputed {
    config: FloodlineConfig,
    inputs: PipelineInputs,
    network: FlowNetwork,
    positions: Vec<NetworkPosition>,
}

impl PositionsComputed {
    /// Position rasters in network order.
    #[must_use]
    pub fn positions(&self) -> &[NetworkPosition] {
        &self.positions
    }

    /// Merge the positions into the floodplain, plus the river channel
    /// when configured.
    ///
    /// # Errors
    ///
    /// Propagates [`merge_floodplains`] errors.
    pub fn merge_floodplains(self) -> Result<FloodplainsMerged, PipelineError> {
        let ctx = &self.inputs.context;
        let rasters: Vec<Raster<i32>> = self.positions.iter().map(|p| p.raster.clone()).collect();
        let flowlines: Vec<&[Flowline]> = self
            .positions
            .iter()
            .map(|p| self.network.flowlines(p.kind))
            .collect();
        let thresholds: Vec<i32> = self.config.networks.iter().map(|n| n.threshold).collect();
        let floodplain = merge_floodplains(
            ctx,
            &self.inputs.area,
            &rasters,
            &flowlines,
            &thresholds,
            &self.config.floodplain,
        )?;

        let river_channel = match (
            &self.config.river_channel,
            self.positions.iter().find(|p| p.kind == NetworkKind::River),
        ) {
            (Some(channel), Some(river)) => Some(merge_floodplains(
                ctx,
                &self.inputs.area,
                std::slice::from_ref(&river.raster),
                &[self.network.rivers.as_slice()],
                &[channel.threshold],
                &channel.floodplain,
            )?),
            _ => None,
        };

        Ok(FloodplainsMerged {
            config: self.config,
            inputs: self.inputs,
            network: self.network,
            positions: self.positions,
            floodplain,
            river_channel,
        })
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        let ceiling = self.config.position.ceiling;
        StageMetrics::Positions(
            self.positions
                .iter()
                .map(|p| PositionSummary {
                    network: p.kind,
                    cells: p.raster.data_count(),
                    at_ceiling: p.raster.iter_data().filter(|&(_, _, v)| v == ceiling).count(),
                })
                .collect(),
        )
    }
}

// ──────────────────── Stage 3: FloodplainsMerged ─────────────────────

/// Pipeline state after the floodplain merge.
#[must_use = "pipeline stages are consumed by advancing, call .splice() to continue"]
pub struct FloodplainsMerged {
    config: FloodlineConfig,
    inputs: PipelineInputs,
    network: FlowNetwork,
    positions: Vec<NetworkPosition>,
    floodplain: FloodplainMerge,
    river_channel: Option<FloodplainMerge>,
}

impl FloodplainsMerged {
    /// The merged floodplain.
    #[must_use]
    pub const fn floodplain(&self) -> &FloodplainMerge {
        &self.floodplain
    }

    /// Splice the input segments along the floodplain (and river channel).
    ///
    /// # Errors
    ///
    /// Propagates [`splice_segments`] errors.
    pub fn splice(self) -> Result<Spliced, PipelineError> {
        let spliced = splice_segments(
            &self.inputs.context,
            &self.inputs.area,
            &self.inputs.segments,
            &self.floodplain.raster,
            self.river_channel.as_ref().map(|m| &m.raster),
            &self.config.splice,
        )?;
        Ok(Spliced {
            area_grid: self.inputs.area.grid(),
            network: self.network,
            positions: self.positions,
            floodplain: self.floodplain,
            river_channel: self.river_channel,
            spliced,
        })
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Floodplain {
            floodplain: self.floodplain.metrics,
            river_channel: self.river_channel.as_ref().map(|m| m.metrics),
        }
    }
}

// ───────────────────────── Stage 4: Spliced ──────────────────────────

/// Final pipeline state.
#[must_use = "call .into_result() to extract the PipelineResult"]
pub struct Spliced {
    area_grid: GridSpec,
    network: FlowNetwork,
    positions: Vec<NetworkPosition>,
    floodplain: FloodplainMerge,
    river_channel: Option<FloodplainMerge>,
    spliced: SplicedSegments,
}

impl Spliced {
    /// The spliced segments.
    #[must_use]
    pub const fn spliced(&self) -> &SplicedSegments {
        &self.spliced
    }

    /// Every intermediate and the final segments.
    #[must_use]
    pub fn into_result(self) -> PipelineResult {
        PipelineResult {
            area_grid: self.area_grid,
            network: self.network,
            positions: self.positions,
            floodplain: self.floodplain,
            river_channel: self.river_channel,
            spliced: self.spliced,
        }
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Splice(self.spliced.metrics)
    }
}

// ──────────────────────── PipelineStage trait ────────────────────────

/// Total number of stages, counting [`Pending`].
pub const STAGE_COUNT: usize = 5;

/// Implemented by every pipeline state for uniform inspection.
pub trait PipelineStage: Sized {
    /// Short name of the stage (e.g. `"flow_network"`).
    const NAME: &str;

    /// Zero-based index (`0` for [`Pending`] through `4` for [`Spliced`]).
    const INDEX: usize;

    /// Metrics of the work done to reach this state; `None` for
    /// [`Pending`].
    fn metrics(&self) -> Option<StageMetrics>;

    /// Advance to the next stage, `Ok(None)` at the final stage.
    ///
    /// # Errors
    ///
    /// Propagates the stage function's [`PipelineError`].
    fn next(self) -> Result<Option<Stage>, PipelineError>;

    /// Run all remaining stages.
    ///
    /// # Errors
    ///
    /// Propagates the first [`PipelineError`] of a remaining stage.
    fn complete(self) -> Result<PipelineResult, PipelineError>;
}

impl PipelineStage for Pending {
    const NAME: &str = "pending";
    const INDEX: usize = 0;

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::FlowNetworkDerived(self.derive_flow_network()?)))
    }

    fn complete(self) -> Result<PipelineResult, PipelineError> {
        self.derive_flow_network()?.complete()
    }
}

impl PipelineStage for FlowNetworkDerived {
    const NAME: &str = "flow_network";
    const INDEX: usize = 1;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::PositionsComputed(self.compute_positions()?)))
    }

    fn complete(self) -> Result<PipelineResult, PipelineError> {
        self.compute_positions()?.complete()
    }
}

impl PipelineStage for PositionsComputed {
    const NAME: &str = "position";
    const INDEX: usize = 2;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::FloodplainsMerged(self.merge_floodplains()?)))
    }

    fn complete(self) -> Result<PipelineResult, PipelineError> {
        self.merge_floodplains()?.complete()
    }
}

impl PipelineStage for FloodplainsMerged {
    const NAME: &str = "floodplain";
    const INDEX: usize = 3;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::Spliced(self.splice()?)))
    }

    fn complete(self) -> Result<PipelineResult, PipelineError> {
        self.splice()?.complete()
    }
}

impl PipelineStage for Spliced {
    const NAME: &str = "splice";
    const INDEX: usize = 4;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(None)
    }

    fn complete(self) -> Result<PipelineResult, PipelineError> {
        Ok(self.into_result())
    }
}

/// Enum wrapping all pipeline states for loop-driven advancing.
#[must_use]
pub enum Stage {
    /// See [`Pending`].
    Pending(Pending),
    /// See [`FlowNetworkDerived`].
    FlowNetworkDerived(FlowNetworkDerived),
    /// See [`PositionsComputed`].
    PositionsComputed(PositionsComputed),
    /// See [`FloodplainsMerged`].
    FloodplainsMerged(FloodplainsMerged),
    /// See [`Spliced`].
    Spliced(Spliced),
}

/// Result of [`Stage::advance`].
#[must_use]
pub enum Advance {
    /// The pipeline advanced to this stage.
    Next(Stage),
    /// The pipeline was already at the final stage.
    Complete(Stage),
}

macro_rules! delegate {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            Self::Pending(s) => s.$method($($arg),*),
            Self::FlowNetworkDerived(s) => s.$method($($arg),*),
            Self::PositionsComputed(s) => s.$method($($arg),*),
            Self::FloodplainsMerged(s) => s.$method($($arg),*),
            Self::Spliced(s) => s.$method($($arg),*),
        }
    };
}

impl Stage {
    /// Name of the current stage.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending(_) => Pending::NAME,
            Self::FlowNetworkDerived(_) => FlowNetworkDerived::NAME,
            Self::PositionsComputed(_) => PositionsComputed::NAME,
            Self::FloodplainsMerged(_) => FloodplainsMerged::NAME,
            Self::Spliced(_) => Spliced::NAME,
        }
    }

    /// Zero-based index of the current stage.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Pending(_) => Pending::INDEX,
            Self::FlowNetworkDerived(_) => FlowNetworkDerived::INDEX,
            Self::PositionsComputed(_) => PositionsComputed::INDEX,
            Self::FloodplainsMerged(_) => FloodplainsMerged::INDEX,
            Self::Spliced(_) => Spliced::INDEX,
        }
    }

    /// Metrics of the current stage.
    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        delegate!(self, metrics)
    }

    /// Whether the pipeline is at the final stage.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Spliced(_))
    }

    /// Advance one stage, returning the final stage unchanged.
    ///
    /// # Errors
    ///
    /// Propagates the stage function's [`PipelineError`].
    pub fn advance(self) -> Result<Advance, PipelineError> {
        if self.is_complete() {
            return Ok(Advance::Complete(self));
        }
        match delegate!(self, next)? {
            Some(next) => Ok(Advance::Next(next)),
            None => Err(PipelineError::Engine(
                "pipeline stopped before the final stage".to_string(),
            )),
        }
    }

    /// Run all remaining stages.
    ///
    /// # Errors
    ///
    /// Propagates the first [`PipelineError`] of a remaining stage.
    pub fn complete(self) -> Result<PipelineResult, PipelineError> {
        delegate!(self, complete)
    }
}

impl From<Pending> for Stage {
    fn from(s: Pending) -> Self {
        Self::Pending(s)
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Entry point of the incremental pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Store the inputs and configuration without doing any work.
    pub const fn new(inputs: PipelineInputs, config: FloodlineConfig) -> Pending {
        Pending { config, inputs }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::{Rect, coord};

    use super::*;
    use crate::raster::GeoTransform;
    use crate::types::{FlowNetworkConfig, NetworkConfig};

    /// A 20x20 valley along the main diagonal at 5 m.
    #[allow(clippy::cast_precision_loss)]
    fn inputs() -> PipelineInputs {
        let n = 20;
        let grid = GridSpec {
            transform: GeoTransform::new(0.0, 100.0, 5.0),
            rows: n,
            cols: n,
        };
        let mut elevation = Raster::filled(grid, 0.0, Some(-9999.0));
        for row in 0..n {
            for col in 0..n {
                let (r, c) = (row as f64, col as f64);
                elevation.set(row, col, 0.1f64.mul_add((r - c).abs(), 0.02 * (40.0 - r - c)));
            }
        }
        PipelineInputs {
            context: ProcessingContext::default(),
            elevation,
            area: Raster::filled(grid, 1, Some(0)),
            study_area: MultiPolygon::new(vec![
                Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 100.0, y: 100.0 }).to_polygon(),
            ]),
            mask: None,
            segments: vec![SegmentPolygon {
                id: 1,
                polygon: Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 100.0, y: 100.0 })
                    .to_polygon(),
            }],
        }
    }

    fn config() -> FloodlineConfig {
        FloodlineConfig {
            flow: FlowNetworkConfig {
                accumulation_threshold: 15.0,
                calculation_buffer: 0.0,
                ..FlowNetworkConfig::default()
            },
            networks: vec![NetworkConfig::stream()],
            ..FloodlineConfig::default()
        }
    }

    #[test]
    fn typed_stages_chain() {
        let result = Pipeline::new(inputs(), config())
            .derive_flow_network()
            .unwrap()
            .compute_positions()
            .unwrap()
            .merge_floodplains()
            .unwrap()
            .splice()
            .unwrap()
            .into_result();
        assert_eq!(result.network.streams.len(), 1);
        assert_eq!(result.positions.len(), 1);
        assert!(result.floodplain.raster.data_count() > 0);
        assert!(result.river_channel.is_none());
        // The one segment is split into floodplain and upland parts.
        assert!(result.spliced.polygons.len() >= 2);
    }

    #[test]
    fn dynamic_loop_visits_every_stage() {
        let mut stage: Stage = Pipeline::new(inputs(), config()).into();
        let mut names = vec![stage.name()];
        loop {
            match stage.advance().unwrap() {
                Advance::Next(next) => {
                    assert!(next.metrics().is_some());
                    names.push(next.name());
                    stage = next;
                }
                Advance::Complete(done) => {
                    stage = done;
                    break;
                }
            }
        }
        assert_eq!(names.len(), STAGE_COUNT);
        assert_eq!(stage.index(), STAGE_COUNT - 1);
        assert_eq!(
            names,
            vec!["pending", "flow_network", "position", "floodplain", "splice"]
        );
        assert!(stage.complete().is_ok());
    }

    #[test]
    fn invalid_config_fails_first_stage() {
        let mut cfg = config();
        cfg.networks.clear();
        let err = Pipeline::new(inputs(), cfg).derive_flow_network().err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn river_channel_without_river_network_is_rejected() {
        let mut cfg = config();
        cfg.river_channel = Some(crate::types::RiverChannelConfig::default());
        assert!(Pipeline::new(inputs(), cfg).complete().unwrap_err().is_config());
    }
}
