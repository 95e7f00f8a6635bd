//! Full pipeline on a synthetic valley: 100x100 cells at 5 m with one
//! straight channel along the main diagonal.

#![allow(clippy::unwrap_used, clippy::cast_precision_loss)]

use std::cell::Cell;
use std::time::Duration;

use floodline_pipeline::diagnostics::Clock;
use floodline_pipeline::{
    FloodlineConfig, FlowNetworkConfig, GeoTransform, GridSpec, NetworkConfig, PartitionClass,
    PipelineInputs, ProcessingContext, Raster, SegmentPolygon, process,
    process_staged_with_diagnostics,
};
use geo::{Contains, Intersects, MultiPolygon, Point, Rect, coord};

const N: usize = 100;
const CELL: f64 = 5.0;
const SIDE: f64 = N as f64 * CELL;

fn grid() -> GridSpec {
    GridSpec {
        transform: GeoTransform::new(0.0, SIDE, CELL),
        rows: N,
        cols: N,
    }
}

fn elevation() -> Raster<f64> {
    let mut dem = Raster::filled(grid(), 0.0, Some(-9999.0));
    for row in 0..N {
        for col in 0..N {
            let (r, c) = (row as f64, col as f64);
            dem.set(row, col, 0.1f64.mul_add((r - c).abs(), 0.02 * (200.0 - r - c)));
        }
    }
    dem
}

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> geo::Polygon<f64> {
    Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }).to_polygon()
}

fn inputs() -> PipelineInputs {
    let half = SIDE / 2.0;
    PipelineInputs {
        context: ProcessingContext::default(),
        elevation: elevation(),
        area: Raster::filled(grid(), 1, Some(0)),
        study_area: MultiPolygon::new(vec![square(0.0, 0.0, SIDE, SIDE)]),
        mask: None,
        segments: vec![
            SegmentPolygon {
                id: 1,
                polygon: square(0.0, half, half, SIDE),
            },
            SegmentPolygon {
                id: 2,
                polygon: square(half, half, SIDE, SIDE),
            },
            SegmentPolygon {
                id: 3,
                polygon: square(0.0, 0.0, half, half),
            },
            SegmentPolygon {
                id: 4,
                polygon: square(half, 0.0, SIDE, half),
            },
        ],
    }
}

fn config() -> FloodlineConfig {
    FloodlineConfig {
        flow: FlowNetworkConfig {
            accumulation_threshold: 50.0,
            fill_tolerance: Some(5.0),
            calculation_buffer: 0.0,
            ..FlowNetworkConfig::default()
        },
        networks: vec![NetworkConfig {
            threshold: 9,
            ..NetworkConfig::stream()
        }],
        ..FloodlineConfig::default()
    }
}

#[test]
fn valley_produces_one_stream_and_no_rivers() {
    let result = process(inputs(), &config()).unwrap();
    assert_eq!(result.network.streams.len(), 1);
    assert_eq!(result.network.streams[0].grid_code, 1);
    assert!(result.network.rivers.is_empty());
}

#[test]
fn position_is_small_near_channel_and_ceiling_far_away() {
    let result = process(inputs(), &config()).unwrap();
    let position = &result.positions[0].raster;
    assert_eq!(position.data_count(), N * N);
    for k in 20..80 {
        let v = position.get(k, k).unwrap();
        assert!(v <= 1, "channel cell ({k}, {k}) has position {v}");
    }
    assert_eq!(position.get(0, N - 1), Some(32_000));
    assert_eq!(position.get(N - 1, 0), Some(32_000));
    assert!(position.iter_data().all(|(_, _, v)| (0..=32_000).contains(&v)));
}

#[test]
fn floodplain_follows_the_channel() {
    let result = process(inputs(), &config()).unwrap();
    let floodplain = &result.floodplain.raster;
    for row in 20..80_usize {
        for col in 0..N {
            let distance = row.abs_diff(col);
            if distance <= 2 {
                assert!(floodplain.is_data(row, col), "({row}, {col}) should be floodplain");
            } else if distance >= 6 {
                assert!(!floodplain.is_data(row, col), "({row}, {col}) should not be floodplain");
            }
        }
    }
    for polygon in &result.floodplain.polygons {
        assert_eq!(polygon.grid_code, 1);
        assert!(
            result
                .network
                .streams
                .iter()
                .any(|f| f.geometry.intersects(&polygon.polygon))
        );
    }
}

#[test]
fn spliced_views_agree() {
    let result = process(inputs(), &config()).unwrap();
    let spliced = &result.spliced;
    assert!(spliced.polygons.len() > 4);
    assert_eq!(spliced.points.len(), spliced.polygons.len());

    for (i, part) in spliced.polygons.iter().enumerate() {
        assert_eq!(part.id as usize, i + 1);
        let point = spliced.points[i];
        assert_eq!(point.id, part.id);
        assert!(part.polygon.contains(&point.point) || part.polygon.intersects(&point.point));

        let on_floodplain = result.floodplain.raster.value_at(point.point.0).is_some();
        let expected = if on_floodplain {
            PartitionClass::Floodplain
        } else {
            PartitionClass::Upland
        };
        assert_eq!(part.class, i32::from(expected.code()), "part {}", part.id);
    }

    for (row, col, id) in spliced.raster.iter_data() {
        let part = &spliced.polygons[id as usize - 1];
        let center = Point::from(spliced.raster.cell_center(row, col));
        assert!(part.polygon.intersects(&center), "cell ({row}, {col}) outside part {id}");
    }
    assert_eq!(spliced.raster.data_count(), N * N);
}

/// Advances one millisecond per reading.
struct TickClock(Cell<u64>);

impl Clock for TickClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        let t = self.0.get();
        self.0.set(t + 1);
        t
    }

    fn elapsed(&self, since: &u64) -> Duration {
        Duration::from_millis(self.0.get() - since)
    }
}

#[test]
fn diagnostics_cover_every_stage() {
    let clock = TickClock(Cell::new(0));
    let (result, diagnostics) =
        process_staged_with_diagnostics(inputs(), &config(), &clock).unwrap();
    assert_eq!(diagnostics.summary.flowlines, 1);
    assert_eq!(diagnostics.summary.segments, result.spliced.polygons.len());
    assert_eq!(diagnostics.summary.rows, N);
    assert!(diagnostics.total_duration >= diagnostics.splice.duration);
    assert!(diagnostics.flow_network.duration > Duration::ZERO);
    let report = diagnostics.report();
    assert!(report.contains("1 streams 0 rivers"), "{report}");
}
