//! Full on-disk run over a synthetic valley: 40x40 cells at 10 m with a
//! channel along the main diagonal.

#![allow(clippy::unwrap_used, clippy::cast_precision_loss)]

use std::fs;
use std::path::Path;

use floodline_io::{
    GeoTiffMetadata, ProjectConfig, StageId, StageOutcome, Workflow, read_geotiff, write_geotiff,
};
use floodline_pipeline::zonal::ZonalStatistic;
use floodline_pipeline::{GeoTransform, GridSpec, NetworkKind, Raster};

const N: usize = 40;
const CELL: f64 = 10.0;
const SIDE: f64 = N as f64 * CELL;

fn grid() -> GridSpec {
    GridSpec {
        transform: GeoTransform::new(0.0, SIDE, CELL),
        rows: N,
        cols: N,
    }
}

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> String {
    format!("[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]")
}

fn write_inputs(dir: &Path) {
    let inputs = dir.join("inputs");
    fs::create_dir_all(&inputs).unwrap();
    let meta = GeoTiffMetadata { epsg: Some(32610) };

    let mut dem = Raster::filled(grid(), 0.0, Some(-9999.0));
    for row in 0..N {
        for col in 0..N {
            let (r, c) = (row as f64, col as f64);
            dem.set(row, col, 0.1f64.mul_add((r - c).abs(), 0.02 * (80.0 - r - c)));
        }
    }
    write_geotiff(&inputs.join("elevation.tif"), &dem, &meta).unwrap();
    write_geotiff(&inputs.join("area.tif"), &Raster::filled(grid(), 1_u8, Some(0)), &meta).unwrap();

    let mut categories = Raster::filled(grid(), 3_i32, Some(-1));
    categories.set(5, 30, 7);
    write_geotiff(&inputs.join("landcover.tif"), &categories, &meta).unwrap();

    fs::write(
        inputs.join("study_area.geojson"),
        format!(
            r#"{{"type": "Polygon", "coordinates": {}}}"#,
            square(0.0, 0.0, SIDE, SIDE)
        ),
    )
    .unwrap();
    let half = SIDE / 2.0;
    fs::write(
        inputs.join("segments.geojson"),
        format!(
            r#"{{"type": "FeatureCollection", "features": [
                {{"type": "Feature", "properties": {{"id": 1}},
                  "geometry": {{"type": "Polygon", "coordinates": {}}}}},
                {{"type": "Feature", "properties": {{"id": 2}},
                  "geometry": {{"type": "Polygon", "coordinates": {}}}}}
            ]}}"#,
            square(0.0, 0.0, half, SIDE),
            square(half, 0.0, SIDE, SIDE)
        ),
    )
    .unwrap();

    fs::write(
        dir.join("project.json"),
        r#"{
            "workspace": "ws",
            "provenance": "synthetic valley",
            "inputs": {
                "elevation": "inputs/elevation.tif",
                "area": "inputs/area.tif",
                "study_area": "inputs/study_area.geojson",
                "segments": "inputs/segments.geojson",
                "zonal": {"values": "inputs/elevation.tif", "statistic": "max"},
                "generalize": {"categories": "inputs/landcover.tif"}
            },
            "parameters": {
                "flow": {"accumulation_threshold": 20.0, "calculation_buffer": 0.0},
                "networks": [{"kind": "stream", "search_distance": 250.0, "threshold": 9}]
            }
        }"#,
    )
    .unwrap();
}

#[test]
fn stages_run_once_and_then_skip() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let project = ProjectConfig::load(&dir.path().join("project.json")).unwrap();
    let workflow = Workflow::new(&project, None).with_previews(true);
    let ws = workflow.workspace();

    let first = workflow.run().unwrap();
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|(_, o)| *o == StageOutcome::Ran), "{first:?}");
    assert_eq!(workflow.run_stage(StageId::Zonal).unwrap(), StageOutcome::Ran);
    assert_eq!(workflow.run_stage(StageId::Generalize).unwrap(), StageOutcome::Ran);

    for path in [
        ws.order(),
        ws.flowlines(NetworkKind::Stream),
        ws.flowlines(NetworkKind::River),
        ws.position(NetworkKind::Stream),
        ws.floodplain_raster(),
        ws.floodplain_polygons(),
        ws.segment_raster(),
        ws.segment_polygons(),
        ws.segment_points(),
        ws.zonal_raster(ZonalStatistic::Max),
        ws.zonal_table(ZonalStatistic::Max),
        ws.generalized(),
        floodline_io::Workspace::preview_of(&ws.floodplain_raster()),
    ] {
        assert!(path.exists(), "missing {}", path.display());
    }

    let segments_before = fs::read(ws.segment_raster()).unwrap();
    let second = workflow.run().unwrap();
    assert!(second.iter().all(|(_, o)| *o == StageOutcome::Skipped), "{second:?}");
    assert_eq!(fs::read(ws.segment_raster()).unwrap(), segments_before);
}

#[test]
fn outputs_carry_the_input_crs_and_grid() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let project = ProjectConfig::load(&dir.path().join("project.json")).unwrap();
    let workflow = Workflow::new(&project, None);
    workflow.run().unwrap();
    let ws = workflow.workspace();

    let (segments, meta) = read_geotiff::<u32>(&ws.segment_raster()).unwrap();
    assert_eq!(meta.epsg, Some(32610));
    assert!(segments.grid().approx_eq(&grid()));
    assert_eq!(segments.data_count(), N * N);

    let polygons = fs::read_to_string(ws.segment_polygons()).unwrap();
    assert!(polygons.contains("EPSG::32610"));
    let parts = floodline_export::parse_segments(&polygons, "id").unwrap();
    let max_id = segments.iter_data().map(|(_, _, id)| id).max().unwrap();
    assert_eq!(max_id as usize, parts.len());

    let (floodplain, _) = read_geotiff::<u8>(&ws.floodplain_raster()).unwrap();
    for k in 10..30 {
        assert!(floodplain.is_data(k, k), "channel cell ({k}, {k}) not floodplain");
    }
}

#[test]
fn zonal_without_segments_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let project = ProjectConfig::load(&dir.path().join("project.json")).unwrap();
    let workflow = Workflow::new(&project, None);
    let err = workflow.run_stage(StageId::Zonal).unwrap_err();
    assert!(matches!(err, floodline_io::StageError::Io { .. }), "{err}");
    assert!(!workflow.workspace().zonal_table(ZonalStatistic::Max).exists());
}

#[test]
fn rerun_after_removing_outputs_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let project = ProjectConfig::load(&dir.path().join("project.json")).unwrap();
    let workflow = Workflow::new(&project, None);
    let ws = workflow.workspace();
    workflow.run().unwrap();

    let outputs = [
        ws.order(),
        ws.flowlines(NetworkKind::Stream),
        ws.flowlines(NetworkKind::River),
        ws.position(NetworkKind::Stream),
        ws.floodplain_raster(),
        ws.floodplain_polygons(),
        ws.segment_raster(),
        ws.segment_polygons(),
        ws.segment_points(),
    ];
    let before: Vec<Vec<u8>> = outputs.iter().map(|p| fs::read(p).unwrap()).collect();
    for path in &outputs {
        fs::remove_file(path).unwrap();
    }

    let again = workflow.run().unwrap();
    assert!(again.iter().all(|(_, o)| *o == StageOutcome::Ran), "{again:?}");
    for (path, bytes) in outputs.iter().zip(&before) {
        assert_eq!(&fs::read(path).unwrap(), bytes, "{} changed", path.display());
    }
}
