//! Pipeline diagnostics: timing and counts for each stage.
//!
//! Every call to [`process_staged_with_diagnostics`] collects
//! diagnostics alongside the pipeline results. Time comes from an
//! injected [`Clock`] so the pipeline crate stays free of platform time
//! sources and tests can use a fake clock.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flow_network::FlowNetworkMetrics;
use crate::floodplain::FloodplainMetrics;
use crate::pipeline::{Pipeline, PipelineInputs, PipelineResult};
use crate::splice::SpliceMetrics;
use crate::types::{FloodlineConfig, NetworkKind, PipelineError};

/// Source of time for stage measurements.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: flow-network derivation.
    pub flow_network: StageDiagnostics,
    /// Stage 2: hydrographic position, all networks.
    pub positions: StageDiagnostics,
    /// Stage 3: floodplain merge.
    pub floodplain: StageDiagnostics,
    /// Stage 4: segment splicing.
    pub splice: StageDiagnostics,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Position raster counts for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSummary {
    /// Network the raster belongs to.
    pub network: NetworkKind,
    /// Cells with a position value.
    pub cells: usize,
    /// Cells at the ceiling.
    pub at_ceiling: usize,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Flow-network derivation.
    FlowNetwork(FlowNetworkMetrics),
    /// Hydrographic position, one entry per network.
    Positions(Vec<PositionSummary>),
    /// Floodplain merge, plus the river channel merge when configured.
    Floodplain {
        /// Merge over all networks.
        floodplain: FloodplainMetrics,
        /// River-only merge.
        river_channel: Option<FloodplainMetrics>,
    },
    /// Segment splicing.
    Splice(SpliceMetrics),
}

/// High-level summary counts for the entire pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Area raster rows.
    pub rows: usize,
    /// Area raster columns.
    pub cols: usize,
    /// Area raster cell size.
    pub cell_size: f64,
    /// Stream plus river flowlines.
    pub flowlines: usize,
    /// Floodplain cells on the area grid.
    pub floodplain_cells: usize,
    /// Spliced segments.
    pub segments: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Floodline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Area: {}x{} cells at {} map units",
            self.summary.rows, self.summary.cols, self.summary.cell_size,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Flow Network", &self.flow_network),
            ("Position", &self.positions),
            ("Floodplain", &self.floodplain),
            ("Splice", &self.splice),
        ];
        for (name, diag) in stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Flowlines: {}  |  Floodplain cells: {}  |  Segments: {}",
            self.summary.flowlines, self.summary.floodplain_cells, self.summary.segments,
        ));

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::FlowNetwork(m) => format!(
            "{} cells, {} channel, order<={} -> {} streams {} rivers",
            m.cells, m.channel_cells, m.max_order, m.streams, m.rivers,
        ),
        StageMetrics::Positions(networks) => networks
            .iter()
            .map(|p| {
                format!(
                    "{}: {} cells ({} at ceiling)",
                    p.network.as_str(),
                    p.cells,
                    p.at_ceiling
                )
            })
            .collect::<Vec<_>>()
            .join("; "),
        StageMetrics::Floodplain {
            floodplain,
            river_channel,
        } => {
            let mut s = format!(
                "{} polygons, {} reclassified, {} disconnected",
                floodplain.polygons, floodplain.reclassified, floodplain.disconnected,
            );
            if let Some(river) = river_channel {
                s.push_str(&format!("; river channel {} polygons", river.polygons));
            }
            s
        }
        StageMetrics::Splice(m) => format!(
            "{} segments x {} partitions -> {} parts ({} dropped)",
            m.segments, m.partitions, m.parts, m.dropped,
        ),
    }
}

/// Run the full pipeline, timing each stage with `clock`.
///
/// # Errors
///
/// Propagates the first [`PipelineError`] raised by a stage.
pub fn process_staged_with_diagnostics<C: Clock>(
    inputs: PipelineInputs,
    config: &FloodlineConfig,
    clock: &C,
) -> Result<(PipelineResult, PipelineDiagnostics), PipelineError> {
    let start = clock.now();
    let pending = Pipeline::new(inputs, config.clone());

    let t = clock.now();
    let derived = pending.derive_flow_network()?;
    let flow_network = timed(clock, &t, derived.stage_metrics());

    let t = clock.now();
    let positioned = derived.compute_positions()?;
    let positions = timed(clock, &t, positioned.stage_metrics());

    let t = clock.now();
    let merged = positioned.merge_floodplains()?;
    let floodplain = timed(clock, &t, merged.stage_metrics());

    let t = clock.now();
    let spliced = merged.splice()?;
    let splice = timed(clock, &t, spliced.stage_metrics());

    let result = spliced.into_result();
    let total_duration = clock.elapsed(&start);

    let summary = PipelineSummary {
        rows: result.area_grid.rows,
        cols: result.area_grid.cols,
        cell_size: result.area_grid.transform.cell_size(),
        flowlines: result.network.streams.len() + result.network.rivers.len(),
        floodplain_cells: result.floodplain.raster.data_count(),
        segments: result.spliced.polygons.len(),
    };
    Ok((
        result,
        PipelineDiagnostics {
            flow_network,
            positions,
            floodplain,
            splice,
            total_duration,
            summary,
        },
    ))
}

fn timed<C: Clock>(clock: &C, since: &C::Instant, metrics: StageMetrics) -> StageDiagnostics {
    StageDiagnostics {
        duration: clock.elapsed(since),
        metrics,
    }
}
