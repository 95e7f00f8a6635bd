//! Zonal statistics of a value raster over integer zones.
//!
//! Zones come from an id raster such as the spliced segment raster. Zone
//! `0` and no-data zones are ignored, as are no-data values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::raster::{CellValue, Raster, ensure_same_grid};
use crate::types::PipelineError;

/// No-data sentinel of zonal statistic rasters.
pub const ZONAL_NODATA: f64 = f64::NAN;

/// Statistic mapped back onto the zone raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZonalStatistic {
    /// Arithmetic mean.
    #[default]
    Mean,
    /// Population standard deviation.
    Std,
    /// Most frequent value; ties resolve to the smallest.
    Majority,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// Number of value cells.
    Count,
}

impl ZonalStatistic {
    /// Every statistic.
    pub const ALL: [Self; 6] = [
        Self::Mean,
        Self::Std,
        Self::Majority,
        Self::Min,
        Self::Max,
        Self::Count,
    ];

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Majority => "majority",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
        }
    }
}

impl std::str::FromStr for ZonalStatistic {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stat| stat.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PipelineError::Config(format!("unknown zonal statistic {s:?}")))
    }
}

/// Summary of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneSummary {
    /// Zone id.
    pub zone: u32,
    /// Value cells in the zone.
    pub count: usize,
    /// Mean value.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Most frequent value, ties to the smallest.
    pub majority: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
}

impl ZoneSummary {
    /// The requested statistic.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get(&self, statistic: ZonalStatistic) -> f64 {
        match statistic {
            ZonalStatistic::Mean => self.mean,
            ZonalStatistic::Std => self.std,
            ZonalStatistic::Majority => self.majority,
            ZonalStatistic::Min => self.min,
            ZonalStatistic::Max => self.max,
            ZonalStatistic::Count => self.count as f64,
        }
    }
}

/// Per-zone summaries plus the chosen statistic on the zone grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalResult {
    /// Summaries in ascending zone order.
    pub table: Vec<ZoneSummary>,
    /// Every zone cell holds its zone's statistic; no-data elsewhere.
    pub raster: Raster<f64>,
}

/// Summarize `values` over `zones`.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if the two rasters are not on the
/// same grid.
pub fn zonal_summaries<V: CellValue>(
    values: &Raster<V>,
    zones: &Raster<u32>,
) -> Result<Vec<ZoneSummary>, PipelineError> {
    ensure_same_grid(&zones.grid(), &values.grid(), "value raster")?;

    let mut per_zone: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (row, col, zone) in zones.iter_data() {
        if zone == 0 {
            continue;
        }
        if let Some(v) = values.get(row, col) {
            per_zone.entry(zone).or_default().push(v.to_f64());
        }
    }

    Ok(per_zone
        .into_iter()
        .filter(|(_, vals)| !vals.is_empty())
        .map(|(zone, mut vals)| summarize(zone, &mut vals))
        .collect())
}

/// Summaries plus a raster of `statistic`.
///
/// # Errors
///
/// Propagates [`zonal_summaries`] errors.
pub fn zonal_statistics<V: CellValue>(
    values: &Raster<V>,
    zones: &Raster<u32>,
    statistic: ZonalStatistic,
) -> Result<ZonalResult, PipelineError> {
    let table = zonal_summaries(values, zones)?;
    let lookup: BTreeMap<u32, f64> = table.iter().map(|s| (s.zone, s.get(statistic))).collect();
    let raster = zones.map(ZONAL_NODATA, |zone| lookup.get(&zone).copied());
    Ok(ZonalResult { table, raster })
}

#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
fn summarize(zone: u32, vals: &mut [f64]) -> ZoneSummary {
    let count = vals.len();
    let mean = vals.iter().sum::<f64>() / count as f64;
    let var = vals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
    vals.sort_by(f64::total_cmp);

    // Sorted, so the first longest run is the smallest modal value.
    let mut majority = vals[0];
    let (mut best_run, mut run) = (1, 1);
    for pair in vals.windows(2) {
        run = if pair[1] == pair[0] { run + 1 } else { 1 };
        if run > best_run {
            best_run = run;
            majority = pair[1];
        }
    }

    ZoneSummary {
        zone,
        count,
        mean,
        std: var.sqrt(),
        majority,
        min: vals[0],
        max: vals[count - 1],
    }
}
