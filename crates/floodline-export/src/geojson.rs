//! GeoJSON serializers and parsers for floodline features.
//!
//! Every writer emits one `FeatureCollection`; attributes become feature
//! properties (`grid_code` on flowlines, `gridcode` on floodplain
//! polygons, `id`/`source_id`/`class` on spliced segments). A coordinate
//! reference system is attached as the legacy `crs` foreign member when
//! an EPSG code is known, which GDAL and QGIS both read.
//!
//! Parsers accept a `FeatureCollection`, a single `Feature` or a bare
//! geometry.

use geo::{Geometry as GeoGeometry, LineString, MultiPolygon, Polygon};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, JsonValue, Value};
use serde_json::json;

use floodline_pipeline::{
    FloodplainPolygon, Flowline, SegmentPoint, SegmentPolygon, SplicedSegment,
};

use crate::ExportError;

/// Property holding a flowline's stream order.
pub const GRID_CODE: &str = "grid_code";

/// Property holding a floodplain polygon's class.
pub const FLOODPLAIN_CODE: &str = "gridcode";

/// Collection-level metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoJsonMetadata<'a> {
    /// Layer name, emitted as the `name` member.
    pub name: Option<&'a str>,
    /// EPSG code of the coordinates, emitted as a `crs` member.
    pub epsg: Option<u32>,
}

/// Serialize flowlines, one `LineString` feature each.
#[must_use]
pub fn flowlines_to_geojson(flowlines: &[Flowline], metadata: &GeoJsonMetadata<'_>) -> String {
    let features = flowlines
        .iter()
        .map(|f| {
            feature(
                Value::from(&f.geometry),
                [(GRID_CODE, json!(f.grid_code))],
            )
        })
        .collect();
    collection(features, metadata)
}

/// Serialize floodplain polygons.
#[must_use]
pub fn floodplain_to_geojson(
    polygons: &[FloodplainPolygon],
    metadata: &GeoJsonMetadata<'_>,
) -> String {
    let features = polygons
        .iter()
        .map(|p| {
            feature(
                Value::from(&p.polygon),
                [(FLOODPLAIN_CODE, json!(p.grid_code))],
            )
        })
        .collect();
    collection(features, metadata)
}

/// Serialize spliced segment polygons.
#[must_use]
pub fn spliced_to_geojson(segments: &[SplicedSegment], metadata: &GeoJsonMetadata<'_>) -> String {
    let features = segments
        .iter()
        .map(|s| {
            feature(
                Value::from(&s.polygon),
                [
                    ("id", json!(s.id)),
                    ("source_id", json!(s.source_id)),
                    ("class", json!(s.class)),
                ],
            )
        })
        .collect();
    collection(features, metadata)
}

/// Serialize segment interior points.
#[must_use]
pub fn points_to_geojson(points: &[SegmentPoint], metadata: &GeoJsonMetadata<'_>) -> String {
    let features = points
        .iter()
        .map(|p| feature(Value::from(&p.point), [("id", json!(p.id))]))
        .collect();
    collection(features, metadata)
}

/// Parse flowlines. Multi-line features contribute one flowline per
/// part; a missing `grid_code` property reads as order 1.
///
/// # Errors
///
/// Returns [`ExportError::GeoJson`] for malformed input and
/// [`ExportError::Feature`] for non-line geometries or an invalid
/// `grid_code`.
pub fn parse_flowlines(input: &str) -> Result<Vec<Flowline>, ExportError> {
    let mut out = Vec::new();
    for (index, feature) in parse_features(input)?.into_iter().enumerate() {
        let grid_code = match feature.property(GRID_CODE) {
            None | Some(JsonValue::Null) => 1,
            Some(v) => unsigned(v).ok_or_else(|| ExportError::Feature {
                index,
                message: format!("{GRID_CODE} must be a non-negative integer, got {v}"),
            })?,
        };
        let lines: Vec<LineString<f64>> = match geometry(index, feature)? {
            GeoGeometry::LineString(line) => vec![line],
            GeoGeometry::MultiLineString(lines) => lines.0,
            other => return Err(unsupported(index, &other, "line")),
        };
        out.extend(lines.into_iter().map(|geometry| Flowline {
            geometry,
            grid_code,
        }));
    }
    Ok(out)
}

/// Parse segmentation polygons, taking the id from `id_property` or,
/// when absent, from the feature id. Multi-polygon features contribute
/// one segment per part, all with the feature's id.
///
/// # Errors
///
/// Returns [`ExportError::GeoJson`] for malformed input and
/// [`ExportError::Feature`] for non-polygon geometries or a missing or
/// invalid id.
pub fn parse_segments(input: &str, id_property: &str) -> Result<Vec<SegmentPolygon>, ExportError> {
    let mut out = Vec::new();
    for (index, feature) in parse_features(input)?.into_iter().enumerate() {
        let id = segment_id(&feature, id_property).ok_or_else(|| ExportError::Feature {
            index,
            message: format!("no integer {id_property:?} property or feature id"),
        })?;
        for polygon in polygons(index, feature)? {
            out.push(SegmentPolygon { id, polygon });
        }
    }
    Ok(out)
}

/// Parse every polygon in `input` into one multi-polygon, as used for a
/// study-area boundary.
///
/// # Errors
///
/// Returns [`ExportError::GeoJson`] for malformed input and
/// [`ExportError::Feature`] for non-polygon geometries.
pub fn parse_polygons(input: &str) -> Result<MultiPolygon<f64>, ExportError> {
    let mut out = Vec::new();
    for (index, feature) in parse_features(input)?.into_iter().enumerate() {
        out.extend(polygons(index, feature)?);
    }
    Ok(MultiPolygon::new(out))
}

fn feature<const N: usize>(value: Value, properties: [(&str, JsonValue); N]) -> Feature {
    let properties: JsonObject = properties
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn collection(features: Vec<Feature>, metadata: &GeoJsonMetadata<'_>) -> String {
    let mut members = JsonObject::new();
    if let Some(name) = metadata.name {
        members.insert("name".to_string(), json!(name));
    }
    if let Some(epsg) = metadata.epsg {
        members.insert(
            "crs".to_string(),
            json!({
                "type": "name",
                "properties": { "name": format!("urn:ogc:def:crs:EPSG::{epsg}") },
            }),
        );
    }
    GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features,
        foreign_members: (!members.is_empty()).then_some(members),
    })
    .to_string()
}

fn parse_features(input: &str) -> Result<Vec<Feature>, ExportError> {
    Ok(match input.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(g) => vec![Feature {
            bbox: None,
            geometry: Some(g),
            id: None,
            properties: None,
            foreign_members: None,
        }],
    })
}

fn geometry(index: usize, feature: Feature) -> Result<GeoGeometry<f64>, ExportError> {
    let value = feature.geometry.ok_or_else(|| ExportError::Feature {
        index,
        message: "feature has no geometry".to_string(),
    })?;
    Ok(GeoGeometry::try_from(value.value)?)
}

fn polygons(index: usize, feature: Feature) -> Result<Vec<Polygon<f64>>, ExportError> {
    match geometry(index, feature)? {
        GeoGeometry::Polygon(p) => Ok(vec![p]),
        GeoGeometry::MultiPolygon(mp) => Ok(mp.0),
        other => Err(unsupported(index, &other, "polygon")),
    }
}

fn unsupported(index: usize, found: &GeoGeometry<f64>, expected: &str) -> ExportError {
    let kind = match found {
        GeoGeometry::Point(_) => "Point",
        GeoGeometry::Line(_) => "Line",
        GeoGeometry::LineString(_) => "LineString",
        GeoGeometry::Polygon(_) => "Polygon",
        GeoGeometry::MultiPoint(_) => "MultiPoint",
        GeoGeometry::MultiLineString(_) => "MultiLineString",
        GeoGeometry::MultiPolygon(_) => "MultiPolygon",
        GeoGeometry::GeometryCollection(_) => "GeometryCollection",
        GeoGeometry::Rect(_) => "Rect",
        GeoGeometry::Triangle(_) => "Triangle",
    };
    ExportError::Feature {
        index,
        message: format!("expected {expected} geometry, found {kind}"),
    }
}

fn unsigned(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn segment_id(feature: &Feature, id_property: &str) -> Option<u32> {
    if let Some(v) = feature.property(id_property) {
        return unsigned(v);
    }
    match feature.id.as_ref()? {
        geojson::feature::Id::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        geojson::feature::Id::String(s) => s.trim().parse().ok(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::{Point, line_string, polygon};

    use super::*;

    fn square() -> Polygon<f64> {
        polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0)]
    }

    #[test]
    fn flowlines_carry_grid_code() {
        let flowlines = vec![Flowline {
            geometry: line_string![(x: 0.0, y: 0.0), (x: 5.0, y: 5.0)],
            grid_code: 4,
        }];
        let json = flowlines_to_geojson(&flowlines, &GeoJsonMetadata::default());
        let value: JsonValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"][0]["properties"]["grid_code"], 4);
        assert_eq!(value["features"][0]["geometry"]["type"], "LineString");
        assert!(value.get("crs").is_none());

        let back = parse_flowlines(&json).unwrap();
        assert_eq!(back, flowlines);
    }

    #[test]
    fn crs_and_name_are_emitted() {
        let json = floodplain_to_geojson(
            &[FloodplainPolygon {
                polygon: square(),
                grid_code: 1,
            }],
            &GeoJsonMetadata {
                name: Some("floodplain"),
                epsg: Some(3338),
            },
        );
        let value: JsonValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "floodplain");
        assert_eq!(
            value["crs"]["properties"]["name"],
            "urn:ogc:def:crs:EPSG::3338"
        );
        assert_eq!(value["features"][0]["properties"]["gridcode"], 1);
    }

    #[test]
    fn spliced_segments_and_points_share_ids() {
        let segments = vec![SplicedSegment {
            id: 7,
            source_id: 3,
            class: 1,
            polygon: square(),
        }];
        let points = vec![SegmentPoint {
            id: 7,
            point: Point::new(5.0, 5.0),
        }];
        let meta = GeoJsonMetadata::default();
        let polys: JsonValue = serde_json::from_str(&spliced_to_geojson(&segments, &meta)).unwrap();
        let pts: JsonValue = serde_json::from_str(&points_to_geojson(&points, &meta)).unwrap();
        assert_eq!(polys["features"][0]["properties"]["id"], 7);
        assert_eq!(polys["features"][0]["properties"]["source_id"], 3);
        assert_eq!(polys["features"][0]["properties"]["class"], 1);
        assert_eq!(pts["features"][0]["properties"]["id"], 7);
        assert_eq!(pts["features"][0]["geometry"]["type"], "Point");
    }

    #[test]
    fn segments_read_id_property_or_feature_id() {
        let input = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"segment": 12},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}},
                {"type": "Feature", "id": 13, "properties": {},
                 "geometry": {"type": "MultiPolygon", "coordinates": [
                    [[[2,0],[3,0],[3,1],[2,0]]],
                    [[[4,0],[5,0],[5,1],[4,0]]]
                 ]}}
            ]
        }"#;
        let segments = parse_segments(input, "segment").unwrap();
        let ids: Vec<u32> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![12, 13, 13]);
    }

    #[test]
    fn segment_without_id_is_an_error() {
        let input = r#"{"type": "Feature", "properties": null,
            "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}"#;
        let err = parse_segments(input, "id").unwrap_err();
        assert!(matches!(err, ExportError::Feature { index: 0, .. }), "{err}");
    }

    #[test]
    fn wrong_geometry_kind_is_reported() {
        let input = r#"{"type": "Point", "coordinates": [1, 2]}"#;
        let err = parse_polygons(input).unwrap_err();
        assert!(err.to_string().contains("found Point"), "{err}");
    }

    #[test]
    fn study_area_collects_all_polygons() {
        let input = r#"{"type": "MultiPolygon", "coordinates": [
            [[[0,0],[1,0],[1,1],[0,0]]],
            [[[4,0],[5,0],[5,1],[4,0]]]
        ]}"#;
        assert_eq!(parse_polygons(input).unwrap().0.len(), 2);
    }

    #[test]
    fn malformed_input_is_geojson_error() {
        assert!(matches!(
            parse_polygons("{not json").unwrap_err(),
            ExportError::GeoJson(_)
        ));
    }
}
