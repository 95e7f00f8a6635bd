//! Segment splicing: cut image-segmentation polygons along floodplain and
//! river boundaries.
//!
//! The floodplain (and optional river) rasters become a partition of the
//! area into upland, floodplain and river polygons. Every segment is
//! intersected with the partition polygons it overlaps, multi-part
//! results are exploded, and the parts are renumbered. Polygons, interior
//! points and an id raster are produced together so they share ids.

use geo::{Area, BooleanOps, BoundingRect, InteriorPoint, Point, Polygon, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::category::{PartitionCell, PartitionClass};
use crate::raster::{CellValue, Raster};
use crate::rasterize::rasterize_polygons;
use crate::types::{
    PipelineError, ProcessingContext, SegmentPoint, SegmentPolygon, SpliceConfig, SplicedSegment,
};
use crate::vectorize::polygonize;

/// No-data sentinel of the segment id raster.
pub const SEGMENT_NODATA: u32 = 0;

/// No-data sentinel of the partition raster.
pub const PARTITION_NODATA: u8 = u8::MAX;

/// Counts recorded while splicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpliceMetrics {
    /// Input segments.
    pub segments: usize,
    /// Partition polygons.
    pub partitions: usize,
    /// Output parts.
    pub parts: usize,
    /// Parts dropped as slivers or for lacking an interior point.
    pub dropped: usize,
}

/// Output of [`splice_segments`]: three views of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SplicedSegments {
    /// Segment ids burned on the area grid, no-data [`SEGMENT_NODATA`].
    pub raster: Raster<u32>,
    /// Single-part polygons, ids `1..=n`.
    pub polygons: Vec<SplicedSegment>,
    /// One interior point per polygon, same ids.
    pub points: Vec<SegmentPoint>,
    /// What happened along the way.
    pub metrics: SpliceMetrics,
}

/// Partition class raster on the area grid.
///
/// Area cells are classified by [`PartitionClass::rules`]; the floodplain
/// and river rasters are sampled at cell centers. Cells outside the area
/// hold [`PARTITION_NODATA`].
#[must_use]
pub fn partition_raster<A: CellValue>(
    area: &Raster<A>,
    floodplain: &Raster<u8>,
    river: Option<&Raster<u8>>,
) -> Raster<u8> {
    let rules = PartitionClass::rules();
    let mut out = Raster::empty(area.grid(), PARTITION_NODATA);
    for (row, col, _) in area.iter_data() {
        let center = area.cell_center(row, col);
        let cell = PartitionCell {
            floodplain: floodplain.value_at(center).is_some(),
            river: river.is_some_and(|r| r.value_at(center).is_some()),
        };
        out.set(row, col, rules.classify(&cell).code());
    }
    out
}

/// Splice `segments` with the floodplain (and optional river) partition.
///
/// Parts are numbered `1..=n` in segment-id order, then partition order,
/// then part order. Ids are stable within one run only.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for an invalid configuration and
/// [`PipelineError::Engine`] if the partition cannot be polygonized or
/// more than `u32::MAX` parts are produced.
pub fn splice_segments<A: CellValue>(
    ctx: &ProcessingContext,
    area: &Raster<A>,
    segments: &[SegmentPolygon],
    floodplain: &Raster<u8>,
    river: Option<&Raster<u8>>,
    config: &SpliceConfig,
) -> Result<SplicedSegments, PipelineError> {
    ctx.validate()?;
    if !(config.sliver_area.is_finite() && config.sliver_area >= 0.0) {
        return Err(PipelineError::Config(format!(
            "sliver_area must be a non-negative number, got {}",
            config.sliver_area
        )));
    }

    let partition = partition_raster(area, floodplain, river);
    let partition_polygons = polygonize(&partition)?;
    let index: RTree<GeomWithData<Rectangle<Point<f64>>, usize>> = RTree::bulk_load(
        partition_polygons
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let b = p.polygon.bounding_rect()?;
                Some(GeomWithData::new(
                    Rectangle::from_corners(Point::from(b.min()), Point::from(b.max())),
                    i,
                ))
            })
            .collect(),
    );

    let mut order: Vec<&SegmentPolygon> = segments.iter().collect();
    order.sort_by_key(|s| s.id);

    let mut metrics = SpliceMetrics {
        segments: segments.len(),
        partitions: partition_polygons.len(),
        ..SpliceMetrics::default()
    };
    let mut polygons = Vec::new();
    let mut points = Vec::new();
    for segment in order {
        let Some(bounds) = segment.polygon.bounding_rect() else {
            continue;
        };
        let mut hits: Vec<usize> = index
            .locate_in_envelope_intersecting(&envelope(bounds))
            .map(|entry| entry.data)
            .collect();
        hits.sort_unstable();

        for hit in hits {
            let piece = &partition_polygons[hit];
            let class = PartitionClass::from_code(piece.value).unwrap_or(PartitionClass::Upland);
            for part in segment.polygon.intersection(&piece.polygon) {
                let part_area = part.unsigned_area();
                let Some(point) = part
                    .interior_point()
                    .filter(|_| part_area > 0.0 && part_area >= config.sliver_area)
                else {
                    metrics.dropped += 1;
                    continue;
                };
                let id = u32::try_from(polygons.len() + 1).map_err(|_| {
                    PipelineError::Engine("more spliced segments than u32 ids".to_string())
                })?;
                points.push(SegmentPoint { id, point });
                polygons.push(SplicedSegment {
                    id,
                    source_id: segment.id,
                    class: i32::from(class.code()),
                    polygon: part,
                });
            }
        }
    }
    metrics.parts = polygons.len();

    let mut raster = rasterize_polygons(
        polygons.iter().map(|s| (&s.polygon, s.id)),
        &area.grid(),
        SEGMENT_NODATA,
    );
    for row in 0..raster.rows() {
        for col in 0..raster.cols() {
            if !area.is_data(row, col) {
                raster.clear(row, col);
            }
        }
    }

    debug!(
        segments = metrics.segments,
        partitions = metrics.partitions,
        parts = metrics.parts,
        dropped = metrics.dropped,
        "spliced segments"
    );
    Ok(SplicedSegments {
        raster,
        polygons,
        points,
        metrics,
    })
}

fn envelope(bounds: Rect<f64>) -> AABB<Point<f64>> {
    AABB::from_corners(Point::from(bounds.min()), Point::from(bounds.max()))
}

/// Polygon of a spliced segment by id.
#[must_use]
pub fn segment_by_id(polygons: &[SplicedSegment], id: u32) -> Option<&Polygon<f64>> {
    polygons
        .get(usize::try_from(id).ok()?.checked_sub(1)?)
        .filter(|s| s.id == id)
        .map(|s| &s.polygon)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::{Contains, Intersects, polygon};

    use super::*;
    use crate::raster::{GeoTransform, GridSpec};

    fn grid() -> GridSpec {
        GridSpec {
            transform: GeoTransform::new(0.0, 40.0, 10.0),
            rows: 4,
            cols: 4,
        }
    }

    fn area() -> Raster<u8> {
        Raster::filled(grid(), 1, Some(0))
    }

    /// Floodplain in the left half.
    fn floodplain() -> Raster<u8> {
        let mut r = Raster::empty(grid(), 0_u8);
        for row in 0..4 {
            for col in 0..2 {
                r.set(row, col, 1);
            }
        }
        r
    }

    /// Two segments: top half and bottom half.
    fn segments() -> Vec<SegmentPolygon> {
        vec![
            SegmentPolygon {
                id: 20,
                polygon: polygon![(x: 0.0, y: 0.0), (x: 40.0, y: 0.0), (x: 40.0, y: 20.0), (x: 0.0, y: 20.0)],
            },
            SegmentPolygon {
                id: 10,
                polygon: polygon![(x: 0.0, y: 20.0), (x: 40.0, y: 20.0), (x: 40.0, y: 40.0), (x: 0.0, y: 40.0)],
            },
        ]
    }

    fn splice(river: Option<&Raster<u8>>) -> SplicedSegments {
        splice_segments(
            &ProcessingContext::default(),
            &area(),
            &segments(),
            &floodplain(),
            river,
            &SpliceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn segments_are_cut_at_floodplain_edge() {
        let out = splice(None);
        assert_eq!(out.polygons.len(), 4);
        let ids: Vec<u32> = out.polygons.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        // Segment 10 (top) comes first.
        assert_eq!(out.polygons[0].source_id, 10);
        assert_eq!(out.polygons[2].source_id, 20);
        for part in &out.polygons {
            assert!((part.polygon.unsigned_area() - 400.0).abs() < 1e-6);
        }
        let classes: Vec<i32> = out.polygons.iter().map(|s| s.class).collect();
        assert!(classes.contains(&0) && classes.contains(&1));
    }

    #[test]
    fn raster_points_and_polygons_agree() {
        let out = splice(None);
        assert_eq!(out.points.len(), out.polygons.len());
        for (row, col, id) in out.raster.iter_data() {
            let polygon = segment_by_id(&out.polygons, id).unwrap();
            let point = out.points.iter().find(|p| p.id == id).unwrap();
            assert!(polygon.contains(&point.point) || polygon.intersects(&point.point));
            let center = Point::from(out.raster.cell_center(row, col));
            assert!(polygon.intersects(&center), "cell ({row}, {col}) not in segment {id}");
        }
        assert_eq!(out.raster.data_count(), 16);
    }

    #[test]
    fn river_adds_third_class() {
        let mut river = Raster::empty(grid(), 0_u8);
        for row in 0..4 {
            river.set(row, 0, 1);
        }
        let out = splice(Some(&river));
        let classes: Vec<i32> = out.polygons.iter().map(|s| s.class).collect();
        assert!(classes.contains(&2));
        assert_eq!(out.polygons.len(), 6);
    }

    #[test]
    fn slivers_are_dropped() {
        let out = splice_segments(
            &ProcessingContext::default(),
            &area(),
            &segments(),
            &floodplain(),
            None,
            &SpliceConfig { sliver_area: 500.0 },
        )
        .unwrap();
        assert!(out.polygons.is_empty());
        assert_eq!(out.metrics.dropped, 4);
        assert_eq!(out.raster.data_count(), 0);
    }

    #[test]
    fn multipart_results_are_exploded() {
        // Floodplain fills columns 1-2 of the top three rows, leaving a
        // U-shaped upland. The top segment cuts the U into two arms.
        let mut fp = Raster::empty(grid(), 0_u8);
        for row in 0..3 {
            fp.set(row, 1, 1);
            fp.set(row, 2, 1);
        }
        let out = splice_segments(
            &ProcessingContext::default(),
            &area(),
            &segments(),
            &fp,
            None,
            &SpliceConfig::default(),
        )
        .unwrap();
        assert_eq!(out.polygons.len(), 5);
        let top_upland = out
            .polygons
            .iter()
            .filter(|s| s.source_id == 10 && s.class == 0)
            .count();
        assert_eq!(top_upland, 2);
        assert!(out.polygons.iter().all(|s| s.polygon.interiors().is_empty()));
    }
}
