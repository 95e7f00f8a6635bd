//! Project file and workspace layout.
//!
//! A project is a JSON document naming the input files, the workspace
//! directory that receives every derived dataset, and the pipeline
//! parameters. Relative paths resolve against the directory containing
//! the project file.

use std::fs;
use std::path::{Path, PathBuf};

use floodline_pipeline::zonal::ZonalStatistic;
use floodline_pipeline::{FloodlineConfig, NetworkKind, ProcessingContext};
use serde::{Deserialize, Serialize};

use crate::StageError;
use crate::runner::{ExistingOutputs, StageRunner, write_atomic};

/// Input datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInputs {
    /// Elevation GeoTIFF.
    pub elevation: PathBuf,
    /// Area GeoTIFF defining the output footprint and fine cell size.
    pub area: PathBuf,
    /// Study-area boundary, GeoJSON polygons.
    pub study_area: PathBuf,
    /// Optional mask GeoTIFF restricting the order raster.
    pub mask: Option<PathBuf>,
    /// Image-segmentation polygons, GeoJSON.
    pub segments: Option<PathBuf>,
    /// Property holding the segment id.
    pub segment_id_property: String,
    /// Zonal statistics input.
    pub zonal: Option<ZonalInputs>,
    /// Categorical generalization input.
    pub generalize: Option<GeneralizeInputs>,
}

impl ProjectInputs {
    /// Default segment id property.
    pub const DEFAULT_SEGMENT_ID_PROPERTY: &str = "id";
}

impl Default for ProjectInputs {
    fn default() -> Self {
        Self {
            elevation: PathBuf::from("inputs/elevation.tif"),
            area: PathBuf::from("inputs/area.tif"),
            study_area: PathBuf::from("inputs/study_area.geojson"),
            mask: None,
            segments: Some(PathBuf::from("inputs/segments.geojson")),
            segment_id_property: Self::DEFAULT_SEGMENT_ID_PROPERTY.to_string(),
            zonal: None,
            generalize: None,
        }
    }
}

/// Values summarized over the spliced segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonalInputs {
    /// Value GeoTIFF on the area grid.
    pub values: PathBuf,
    /// Statistic burned into the output raster.
    #[serde(default)]
    pub statistic: ZonalStatistic,
}

/// Categorical raster to generalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralizeInputs {
    /// Integer class GeoTIFF.
    pub categories: PathBuf,
    /// Burn the river channel raster in as water.
    #[serde(default)]
    pub burn_river_channel: bool,
}

/// File names of derived datasets inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputNames {
    /// Strahler order raster.
    pub order: String,
    /// Stream flowlines.
    pub streams: String,
    /// River flowlines.
    pub rivers: String,
    /// Position raster prefix; the network kind is appended.
    pub position_prefix: String,
    /// Floodplain raster and polygons (extension added).
    pub floodplain: String,
    /// River channel raster and polygons (extension added).
    pub river_channel: String,
    /// Spliced segment raster and polygons (extension added).
    pub segments: String,
    /// Spliced segment interior points.
    pub segment_points: String,
    /// Zonal statistics raster and table prefix; the statistic is appended.
    pub zonal_prefix: String,
    /// Generalized category raster.
    pub generalized: String,
}

impl Default for OutputNames {
    fn default() -> Self {
        Self {
            order: "stream_order".to_string(),
            streams: "streams".to_string(),
            rivers: "rivers".to_string(),
            position_prefix: "position".to_string(),
            floodplain: "floodplain".to_string(),
            river_channel: "river_channel".to_string(),
            segments: "segments".to_string(),
            segment_points: "segment_points".to_string(),
            zonal_prefix: "zonal".to_string(),
            generalized: "generalized".to_string(),
        }
    }
}

/// A project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory receiving all derived datasets.
    pub workspace: PathBuf,
    /// Input datasets.
    pub inputs: ProjectInputs,
    /// Derived dataset names.
    pub outputs: OutputNames,
    /// Who set the project up and for what.
    pub provenance: Option<String>,
    /// Working cell size, snap grid and parallel factor.
    pub context: ProcessingContext,
    /// EPSG code written to outputs. `None` uses the elevation raster's.
    pub epsg: Option<u32>,
    /// Algorithm parameters.
    pub parameters: FloodlineConfig,
    /// What to do when outputs already exist.
    pub existing_outputs: ExistingOutputs,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("workspace"),
            inputs: ProjectInputs::default(),
            outputs: OutputNames::default(),
            provenance: None,
            context: ProcessingContext::default(),
            epsg: None,
            parameters: FloodlineConfig::default(),
            existing_outputs: ExistingOutputs::default(),
        }
    }
}

impl ProjectConfig {
    /// Read a project file, resolving relative paths against its
    /// directory, and validate its parameters.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Io`] or [`StageError::Json`] when the file
    /// cannot be read or parsed and [`StageError::Pipeline`] when the
    /// parameters are invalid.
    pub fn load(path: &Path) -> Result<Self, StageError> {
        let text = fs::read_to_string(path).map_err(|e| StageError::io(path, e))?;
        let mut config: Self = serde_json::from_str(&text).map_err(|source| StageError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.parameters.validate()?;
        config.context.validate()?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.resolve(base);
        tracing::debug!(project = %path.display(), workspace = %config.workspace.display(), "project loaded");
        Ok(config)
    }

    /// Write this project as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::AlreadyExists`] if `path` exists and
    /// [`StageError::Io`] if it cannot be written.
    pub fn save_new(&self, path: &Path) -> Result<(), StageError> {
        if path.exists() {
            return Err(StageError::AlreadyExists(path.to_path_buf()));
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| StageError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, text.as_bytes())
    }

    /// Make every relative path absolute with respect to `base`.
    pub fn resolve(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.workspace);
        let inputs = &mut self.inputs;
        join(&mut inputs.elevation);
        join(&mut inputs.area);
        join(&mut inputs.study_area);
        inputs.mask.iter_mut().for_each(join);
        inputs.segments.iter_mut().for_each(join);
        if let Some(z) = &mut inputs.zonal {
            join(&mut z.values);
        }
        if let Some(g) = &mut inputs.generalize {
            join(&mut g.categories);
        }
    }

    /// The workspace described by this project.
    #[must_use]
    pub fn workspace(&self) -> Workspace {
        Workspace {
            root: self.workspace.clone(),
            names: self.outputs.clone(),
        }
    }

    /// A runner applying this project's existing-output policy, or
    /// `policy` when given.
    #[must_use]
    pub fn runner(&self, policy: Option<ExistingOutputs>) -> StageRunner {
        StageRunner::new(
            self.workspace().manifest_dir(),
            policy.unwrap_or(self.existing_outputs),
        )
    }
}

/// Paths of derived datasets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    names: OutputNames,
}

impl Workspace {
    /// A workspace at `root` with default names.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            names: OutputNames::default(),
        }
    }

    /// Workspace directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of stage manifests.
    #[must_use]
    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join(".floodline")
    }

    fn file(&self, name: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{name}.{extension}"))
    }

    /// Strahler order raster.
    #[must_use]
    pub fn order(&self) -> PathBuf {
        self.file(&self.names.order, "tif")
    }

    /// Flowlines of one network kind.
    #[must_use]
    pub fn flowlines(&self, kind: NetworkKind) -> PathBuf {
        match kind {
            NetworkKind::Stream => self.file(&self.names.streams, "geojson"),
            NetworkKind::River => self.file(&self.names.rivers, "geojson"),
        }
    }

    /// Position raster of one network kind.
    #[must_use]
    pub fn position(&self, kind: NetworkKind) -> PathBuf {
        self.file(
            &format!("{}_{}", self.names.position_prefix, kind.as_str()),
            "tif",
        )
    }

    /// Floodplain raster.
    #[must_use]
    pub fn floodplain_raster(&self) -> PathBuf {
        self.file(&self.names.floodplain, "tif")
    }

    /// Floodplain polygons.
    #[must_use]
    pub fn floodplain_polygons(&self) -> PathBuf {
        self.file(&self.names.floodplain, "geojson")
    }

    /// River channel raster.
    #[must_use]
    pub fn river_channel_raster(&self) -> PathBuf {
        self.file(&self.names.river_channel, "tif")
    }

    /// River channel polygons.
    #[must_use]
    pub fn river_channel_polygons(&self) -> PathBuf {
        self.file(&self.names.river_channel, "geojson")
    }

    /// Spliced segment raster.
    #[must_use]
    pub fn segment_raster(&self) -> PathBuf {
        self.file(&self.names.segments, "tif")
    }

    /// Spliced segment polygons.
    #[must_use]
    pub fn segment_polygons(&self) -> PathBuf {
        self.file(&self.names.segments, "geojson")
    }

    /// Spliced segment interior points.
    #[must_use]
    pub fn segment_points(&self) -> PathBuf {
        self.file(&self.names.segment_points, "geojson")
    }

    /// Zonal statistic raster.
    #[must_use]
    pub fn zonal_raster(&self, statistic: ZonalStatistic) -> PathBuf {
        self.file(
            &format!("{}_{}", self.names.zonal_prefix, statistic.as_str()),
            "tif",
        )
    }

    /// Zonal summary table.
    #[must_use]
    pub fn zonal_table(&self, statistic: ZonalStatistic) -> PathBuf {
        self.file(
            &format!("{}_{}", self.names.zonal_prefix, statistic.as_str()),
            "csv",
        )
    }

    /// Generalized category raster.
    #[must_use]
    pub fn generalized(&self) -> PathBuf {
        self.file(&self.names.generalized, "tif")
    }

    /// Quicklook PNG next to a raster output.
    #[must_use]
    pub fn preview_of(raster: &Path) -> PathBuf {
        raster.with_extension("png")
    }
}
