//! Workspace-level stage functions.
//!
//! Each stage reads its inputs from the project's input files or from
//! earlier stages' outputs in the workspace, runs the matching pipeline
//! function and writes its outputs through the [`StageRunner`], so a
//! stage whose outputs exist is skipped.

use std::fs;
use std::path::{Path, PathBuf};

use floodline_export::{
    GeoJsonMetadata, floodplain_to_geojson, flowlines_to_geojson, parse_flowlines,
    parse_polygons, parse_segments, points_to_geojson, spliced_to_geojson, zonal_table_to_csv,
};
use floodline_pipeline::{
    CellValue, FloodplainMerge, Flowline, NetworkKind, PipelineInputs, Raster,
    compute_hydrographic_position, derive_flow_network, generalize_categories, merge_floodplains,
    splice_segments, zonal_statistics,
};
use geo::MultiPolygon;
use serde_json::json;

use crate::StageError;
use crate::geotiff::{GeoTiffMetadata, read_geotiff, write_geotiff};
use crate::preview::write_preview;
use crate::project::{ProjectConfig, Workspace};
use crate::runner::{ExistingOutputs, StageOutcome, StageRunner, write_atomic};
use crate::stage::StageId;

/// No-data of the `u8` area footprint handed to the pipeline.
const AREA_NODATA: u8 = 0;

/// Runs stages of one project.
#[derive(Debug, Clone)]
pub struct Workflow<'a> {
    project: &'a ProjectConfig,
    workspace: Workspace,
    runner: StageRunner,
    previews: bool,
}

impl<'a> Workflow<'a> {
    /// A workflow over `project`. `policy` overrides the project's
    /// existing-output policy.
    #[must_use]
    pub fn new(project: &'a ProjectConfig, policy: Option<ExistingOutputs>) -> Self {
        Self {
            project,
            workspace: project.workspace(),
            runner: project.runner(policy),
            previews: false,
        }
    }

    /// Also write a PNG quicklook next to every raster output.
    #[must_use]
    pub const fn with_previews(mut self, previews: bool) -> Self {
        self.previews = previews;
        self
    }

    /// The workspace outputs go to.
    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run one stage.
    ///
    /// # Errors
    ///
    /// Propagates the stage's error.
    pub fn run_stage(&self, stage: StageId) -> Result<StageOutcome, StageError> {
        match stage {
            StageId::Flowlines => self.flowlines(),
            StageId::Position => self.position(),
            StageId::Floodplain => self.floodplain(),
            StageId::Splice => self.splice(),
            StageId::Zonal => self.zonal(),
            StageId::Generalize => self.generalize(),
        }
    }

    /// Run the core stages in dependency order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Propagates the first stage error.
    pub fn run(&self) -> Result<Vec<(StageId, StageOutcome)>, StageError> {
        StageId::CORE
            .into_iter()
            .map(|stage| Ok((stage, self.run_stage(stage)?)))
            .collect()
    }

    /// Derive the flow network: order raster, stream and river flowlines.
    ///
    /// # Errors
    ///
    /// Returns read, pipeline and write errors.
    pub fn flowlines(&self) -> Result<StageOutcome, StageError> {
        let inputs = &self.project.inputs;
        let ws = &self.workspace;
        let outputs = self.with_preview_paths(vec![
            ws.order(),
            ws.flowlines(NetworkKind::Stream),
            ws.flowlines(NetworkKind::River),
        ]);
        let params = json!({
            "context": self.project.context,
            "flow": self.project.parameters.flow,
            "elevation": inputs.elevation,
            "study_area": inputs.study_area,
            "mask": inputs.mask,
        });
        self.runner.run_stage(StageId::Flowlines, &outputs, &params, |temps| {
            let (elevation, meta) = read_geotiff::<f64>(&inputs.elevation)?;
            let study_area = read_polygons(&inputs.study_area)?;
            let mask = inputs
                .mask
                .as_deref()
                .map(|p| read_geotiff::<u8>(p).map(|(r, _)| r))
                .transpose()?;
            let network = derive_flow_network(
                &self.project.context,
                &elevation,
                &study_area,
                mask.as_ref(),
                &self.project.parameters.flow,
            )?;
            let meta = self.metadata(meta);
            write_geotiff(&temps[0], &network.order, &meta)?;
            write_flowlines(&temps[1], &network.streams, &meta, "streams")?;
            write_flowlines(&temps[2], &network.rivers, &meta, "rivers")?;
            self.maybe_preview(temps.get(3), &network.order)
        })
    }

    /// Hydrographic position for every configured network.
    ///
    /// # Errors
    ///
    /// Returns read, pipeline and write errors.
    pub fn position(&self) -> Result<StageOutcome, StageError> {
        let inputs = &self.project.inputs;
        let ws = &self.workspace;
        let networks = &self.project.parameters.networks;
        let rasters: Vec<PathBuf> = networks.iter().map(|n| ws.position(n.kind)).collect();
        let outputs = self.with_preview_paths(rasters);
        let params = json!({
            "context": self.project.context,
            "networks": networks,
            "position": self.project.parameters.position,
            "flow": self.project.parameters.flow,
            "area": inputs.area,
            "elevation": inputs.elevation,
        });
        self.runner.run_stage(StageId::Position, &outputs, &params, |temps| {
            let (area, _) = read_geotiff::<f64>(&inputs.area)?;
            let (elevation, meta) = read_geotiff::<f64>(&inputs.elevation)?;
            let meta = self.metadata(meta);
            for (i, network) in networks.iter().enumerate() {
                let flowlines = read_flowlines(&ws.flowlines(network.kind))?;
                let position = compute_hydrographic_position(
                    &self.project.context,
                    &area,
                    &elevation,
                    &flowlines,
                    network,
                    &self.project.parameters.position,
                )?;
                tracing::debug!(
                    network = network.kind.as_str(),
                    cells = position.data_count(),
                    "position computed"
                );
                write_geotiff(&temps[i], &position, &meta)?;
                self.maybe_preview(temps.get(networks.len() + i), &position)?;
            }
            Ok(())
        })
    }

    /// Merge the position rasters into the floodplain, plus the river
    /// channel when configured.
    ///
    /// # Errors
    ///
    /// Returns read, pipeline and write errors.
    pub fn floodplain(&self) -> Result<StageOutcome, StageError> {
        let inputs = &self.project.inputs;
        let ws = &self.workspace;
        let parameters = &self.project.parameters;
        let mut rasters = vec![ws.floodplain_raster()];
        let mut polygons = vec![ws.floodplain_polygons()];
        if parameters.river_channel.is_some() {
            rasters.push(ws.river_channel_raster());
            polygons.push(ws.river_channel_polygons());
        }
        let raster_count = rasters.len();
        let mut outputs = self.with_preview_paths(rasters);
        outputs.extend(polygons);
        let params = json!({
            "context": self.project.context,
            "networks": parameters.networks,
            "floodplain": parameters.floodplain,
            "river_channel": parameters.river_channel,
            "area": inputs.area,
        });
        self.runner.run_stage(StageId::Floodplain, &outputs, &params, |temps| {
            let (area, _) = read_geotiff::<f64>(&inputs.area)?;
            let mut positions = Vec::new();
            let mut flowlines = Vec::new();
            let mut meta = GeoTiffMetadata::default();
            for network in &parameters.networks {
                let (position, m) = read_geotiff::<i32>(&ws.position(network.kind))?;
                meta = m;
                positions.push(position);
                flowlines.push(read_flowlines(&ws.flowlines(network.kind))?);
            }
            let meta = self.metadata(meta);
            let flowline_sets: Vec<&[Flowline]> = flowlines.iter().map(Vec::as_slice).collect();
            let thresholds: Vec<i32> = parameters.networks.iter().map(|n| n.threshold).collect();
            let floodplain = merge_floodplains(
                &self.project.context,
                &area,
                &positions,
                &flowline_sets,
                &thresholds,
                &parameters.floodplain,
            )?;

            let polygon_temps = &temps[temps.len() - raster_count..];
            let preview_temps = &temps[raster_count..temps.len() - raster_count];
            write_merge(&temps[0], &polygon_temps[0], &floodplain, &meta, "floodplain")?;
            self.maybe_preview(preview_temps.first(), &floodplain.raster)?;

            if let Some(channel) = &parameters.river_channel {
                let river = parameters
                    .networks
                    .iter()
                    .position(|n| n.kind == NetworkKind::River)
                    .ok_or(StageError::MissingInput("river network"))?;
                let merged = merge_floodplains(
                    &self.project.context,
                    &area,
                    std::slice::from_ref(&positions[river]),
                    &[flowline_sets[river]],
                    &[channel.threshold],
                    &channel.floodplain,
                )?;
                write_merge(&temps[1], &polygon_temps[1], &merged, &meta, "river_channel")?;
                self.maybe_preview(preview_temps.get(1), &merged.raster)?;
            }
            Ok(())
        })
    }

    /// Splice the segmentation polygons along the floodplain and river
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::MissingInput`] when no segments are
    /// configured, plus read, pipeline and write errors.
    pub fn splice(&self) -> Result<StageOutcome, StageError> {
        let inputs = &self.project.inputs;
        let ws = &self.workspace;
        let parameters = &self.project.parameters;
        let segments_path = inputs
            .segments
            .as_deref()
            .ok_or(StageError::MissingInput("segments"))?;
        let outputs = self.with_preview_paths(vec![
            ws.segment_raster(),
            ws.segment_polygons(),
            ws.segment_points(),
        ]);
        let params = json!({
            "context": self.project.context,
            "splice": parameters.splice,
            "river_channel": parameters.river_channel.is_some(),
            "area": inputs.area,
            "segments": segments_path,
            "segment_id_property": inputs.segment_id_property,
        });
        self.runner.run_stage(StageId::Splice, &outputs, &params, |temps| {
            let (area, meta) = read_geotiff::<f64>(&inputs.area)?;
            let meta = self.metadata(meta);
            let text = read_text(segments_path)?;
            let segments = parse_segments(&text, &inputs.segment_id_property)?;
            let (floodplain, _) = read_geotiff::<u8>(&ws.floodplain_raster())?;
            let river = if parameters.river_channel.is_some() {
                Some(read_geotiff::<u8>(&ws.river_channel_raster())?.0)
            } else {
                None
            };
            let spliced = splice_segments(
                &self.project.context,
                &area,
                &segments,
                &floodplain,
                river.as_ref(),
                &parameters.splice,
            )?;
            write_geotiff(&temps[0], &spliced.raster, &meta)?;
            let geojson = geojson_metadata(&meta, "segments");
            write_atomic(&temps[1], spliced_to_geojson(&spliced.polygons, &geojson).as_bytes())?;
            let geojson = geojson_metadata(&meta, "segment_points");
            write_atomic(&temps[2], points_to_geojson(&spliced.points, &geojson).as_bytes())?;
            self.maybe_preview(temps.get(3), &spliced.raster)
        })
    }

    /// Summarize the configured value raster over the spliced segments.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::MissingInput`] when no zonal input is
    /// configured, plus read, pipeline and write errors.
    pub fn zonal(&self) -> Result<StageOutcome, StageError> {
        let zonal = self
            .project
            .inputs
            .zonal
            .as_ref()
            .ok_or(StageError::MissingInput("zonal"))?;
        let ws = &self.workspace;
        let outputs = self.with_preview_paths(vec![
            ws.zonal_raster(zonal.statistic),
            ws.zonal_table(zonal.statistic),
        ]);
        let params = json!({ "values": zonal.values, "statistic": zonal.statistic });
        self.runner.run_stage(StageId::Zonal, &outputs, &params, |temps| {
            let (values, _) = read_geotiff::<f64>(&zonal.values)?;
            let (zones, meta) = read_geotiff::<u32>(&ws.segment_raster())?;
            let result = zonal_statistics(&values, &zones, zonal.statistic)?;
            tracing::debug!(zones = result.table.len(), "zonal statistics computed");
            write_geotiff(&temps[0], &result.raster, &self.metadata(meta))?;
            write_atomic(&temps[1], zonal_table_to_csv(&result.table)?.as_bytes())?;
            self.maybe_preview(temps.get(2), &result.raster)
        })
    }

    /// Generalize the configured category raster.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::MissingInput`] when no generalization input
    /// is configured, plus read, pipeline and write errors.
    pub fn generalize(&self) -> Result<StageOutcome, StageError> {
        let input = self
            .project
            .inputs
            .generalize
            .as_ref()
            .ok_or(StageError::MissingInput("generalize"))?;
        let ws = &self.workspace;
        let config = &self.project.parameters.generalize;
        let outputs = self.with_preview_paths(vec![ws.generalized()]);
        let params = json!({
            "categories": input.categories,
            "burn_river_channel": input.burn_river_channel,
            "generalize": config,
        });
        self.runner.run_stage(StageId::Generalize, &outputs, &params, |temps| {
            let (categories, meta) = read_geotiff::<i32>(&input.categories)?;
            let rivers = if input.burn_river_channel {
                Some(read_geotiff::<u8>(&ws.river_channel_raster())?.0)
            } else {
                None
            };
            let generalized = generalize_categories(&categories, rivers.as_ref(), config)?;
            tracing::debug!(
                regions = generalized.metrics.regions,
                removed = generalized.metrics.removed,
                "categories generalized"
            );
            write_geotiff(&temps[0], &generalized.raster, &self.metadata(meta))?;
            self.maybe_preview(temps.get(1), &generalized.raster)
        })
    }

    /// Load every input of the in-memory pipeline.
    ///
    /// # Errors
    ///
    /// Returns read and parse errors.
    pub fn load_inputs(&self) -> Result<PipelineInputs, StageError> {
        let inputs = &self.project.inputs;
        let (elevation, _) = read_geotiff::<f64>(&inputs.elevation)?;
        let (area, _) = read_geotiff::<f64>(&inputs.area)?;
        let mask = inputs
            .mask
            .as_deref()
            .map(|p| read_geotiff::<u8>(p).map(|(r, _)| r))
            .transpose()?;
        let segments = match &inputs.segments {
            Some(path) => parse_segments(&read_text(path)?, &inputs.segment_id_property)?,
            None => Vec::new(),
        };
        Ok(PipelineInputs {
            context: self.project.context,
            elevation,
            area: area.map(AREA_NODATA, |_| Some(1)),
            study_area: read_polygons(&inputs.study_area)?,
            mask,
            segments,
        })
    }

    fn metadata(&self, read: GeoTiffMetadata) -> GeoTiffMetadata {
        GeoTiffMetadata {
            epsg: self.project.epsg.or(read.epsg),
        }
    }

    /// `rasters` followed by one preview path per raster when previews
    /// are on.
    fn with_preview_paths(&self, rasters: Vec<PathBuf>) -> Vec<PathBuf> {
        if !self.previews {
            return rasters;
        }
        let previews: Vec<PathBuf> = rasters
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == "tif"))
            .map(|p| Workspace::preview_of(p))
            .collect();
        rasters.into_iter().chain(previews).collect()
    }

    fn maybe_preview<T: CellValue>(
        &self,
        path: Option<&PathBuf>,
        raster: &Raster<T>,
    ) -> Result<(), StageError> {
        match path {
            Some(path) if self.previews => write_preview(path, raster),
            _ => Ok(()),
        }
    }
}

fn read_text(path: &Path) -> Result<String, StageError> {
    fs::read_to_string(path).map_err(|e| StageError::io(path, e))
}

fn read_polygons(path: &Path) -> Result<MultiPolygon<f64>, StageError> {
    Ok(parse_polygons(&read_text(path)?)?)
}

fn read_flowlines(path: &Path) -> Result<Vec<Flowline>, StageError> {
    Ok(parse_flowlines(&read_text(path)?)?)
}

fn geojson_metadata<'n>(meta: &GeoTiffMetadata, name: &'n str) -> GeoJsonMetadata<'n> {
    GeoJsonMetadata {
        name: Some(name),
        epsg: meta.epsg,
    }
}

fn write_flowlines(
    path: &Path,
    flowlines: &[Flowline],
    meta: &GeoTiffMetadata,
    name: &str,
) -> Result<(), StageError> {
    let geojson = flowlines_to_geojson(flowlines, &geojson_metadata(meta, name));
    write_atomic(path, geojson.as_bytes())
}

fn write_merge(
    raster: &Path,
    polygons: &Path,
    merge: &FloodplainMerge,
    meta: &GeoTiffMetadata,
    name: &str,
) -> Result<(), StageError> {
    write_geotiff(raster, &merge.raster, meta)?;
    let geojson = floodplain_to_geojson(&merge.polygons, &geojson_metadata(meta, name));
    write_atomic(polygons, geojson.as_bytes())
}
