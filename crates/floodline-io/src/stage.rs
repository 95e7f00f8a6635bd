//! On-disk stage identifiers.
//!
//! Each [`StageId`] names one memoized step of a workspace run. The first
//! four mirror the in-memory pipeline stages; zonal statistics and
//! categorical generalization are stand-alone steps that consume the
//! spliced segments or a supplied category raster.

use std::fmt;
use std::str::FromStr;

/// Identifier for an on-disk stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    /// Flow-network derivation: order raster plus stream and river
    /// flowlines.
    Flowlines,
    /// Hydrographic position, one raster per configured network.
    Position,
    /// Floodplain merge, plus the river channel when configured.
    Floodplain,
    /// Segment splicing.
    Splice,
    /// Zonal statistics over the spliced segments.
    Zonal,
    /// Categorical raster generalization.
    Generalize,
}

impl StageId {
    /// All stages in dependency order.
    pub const ALL: [Self; 6] = [
        Self::Flowlines,
        Self::Position,
        Self::Floodplain,
        Self::Splice,
        Self::Zonal,
        Self::Generalize,
    ];

    /// The stages `run` executes, in order.
    pub const CORE: [Self; 4] = [
        Self::Flowlines,
        Self::Position,
        Self::Floodplain,
        Self::Splice,
    ];

    /// Display label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Flowlines => "Flowlines",
            Self::Position => "Hydrographic position",
            Self::Floodplain => "Floodplain",
            Self::Splice => "Splice",
            Self::Zonal => "Zonal statistics",
            Self::Generalize => "Generalize",
        }
    }

    /// Lowercase key used for manifests and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flowlines => "flowlines",
            Self::Position => "position",
            Self::Floodplain => "floodplain",
            Self::Splice => "splice",
            Self::Zonal => "zonal",
            Self::Generalize => "generalize",
        }
    }

    /// The on-disk stage matching an in-memory pipeline stage index
    /// (`floodline_pipeline::pipeline::PipelineStage::INDEX`). Index 0 is
    /// the pending state and has no stage.
    #[must_use]
    pub const fn from_pipeline_index(index: usize) -> Option<Self> {
        match index {
            1 => Some(Self::Flowlines),
            2 => Some(Self::Position),
            3 => Some(Self::Floodplain),
            4 => Some(Self::Splice),
            _ => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stage {s:?}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use floodline_pipeline::pipeline::{
        FloodplainsMerged, FlowNetworkDerived, PipelineStage, PositionsComputed, Spliced,
    };

    use super::*;

    #[test]
    fn all_contains_every_variant_once() {
        let mut seen = std::collections::HashSet::new();
        for stage in StageId::ALL {
            assert!(seen.insert(stage), "duplicate stage in ALL: {stage}");
        }
        assert_eq!(seen.len(), 6);
        assert!(StageId::CORE.iter().all(|s| seen.contains(s)));
    }

    #[test]
    fn keys_parse_back() {
        for stage in StageId::ALL {
            assert_eq!(stage.as_str().parse::<StageId>().unwrap(), stage);
        }
        assert_eq!("SPLICE".parse::<StageId>().unwrap(), StageId::Splice);
        assert!("nibble".parse::<StageId>().is_err());
    }

    #[test]
    fn pipeline_indices_map_to_core_stages() {
        assert_eq!(
            StageId::from_pipeline_index(FlowNetworkDerived::INDEX),
            Some(StageId::Flowlines)
        );
        assert_eq!(
            StageId::from_pipeline_index(PositionsComputed::INDEX),
            Some(StageId::Position)
        );
        assert_eq!(
            StageId::from_pipeline_index(FloodplainsMerged::INDEX),
            Some(StageId::Floodplain)
        );
        assert_eq!(StageId::from_pipeline_index(Spliced::INDEX), Some(StageId::Splice));
        assert_eq!(StageId::from_pipeline_index(0), None);
        assert_eq!(StageId::from_pipeline_index(5), None);
    }
}
