//! floodline-export: pure format serializers (sans-IO).
//!
//! Converts pipeline features into interchange formats: GeoJSON for
//! flowlines, floodplain boundaries and spliced segments, and CSV for
//! zonal statistics tables. Parsing of GeoJSON inputs (study areas,
//! segmentation polygons, flowlines) lives here too so the IO crate only
//! moves bytes.

pub mod csv;
pub mod geojson;

pub use crate::csv::{write_zonal_table, zonal_table_to_csv};
pub use crate::geojson::{
    GeoJsonMetadata, floodplain_to_geojson, flowlines_to_geojson, parse_flowlines,
    parse_polygons, parse_segments, points_to_geojson, spliced_to_geojson,
};

/// Errors raised while serializing or parsing features.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Input is not valid GeoJSON or a geometry cannot be converted.
    #[error("GeoJSON error: {0}")]
    GeoJson(Box<::geojson::Error>),

    /// A feature is structurally valid but unusable.
    #[error("feature {index}: {message}")]
    Feature {
        /// Position of the feature in its collection.
        index: usize,
        /// What is wrong with it.
        message: String,
    },

    /// A CSV record could not be written.
    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    /// Flushing a writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialized output was not UTF-8.
    #[error("output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl From<::geojson::Error> for ExportError {
    fn from(e: ::geojson::Error) -> Self {
        Self::GeoJson(Box::new(e))
    }
}
