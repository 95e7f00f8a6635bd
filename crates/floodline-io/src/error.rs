//! Errors raised by on-disk stages.

use std::path::PathBuf;

use floodline_export::ExportError;
use floodline_pipeline::PipelineError;

/// Everything that can go wrong while running a stage against a
/// workspace.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// An algorithm rejected its inputs or failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A feature file could not be parsed or serialized.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// A file could not be read, written or renamed.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A GeoTIFF could not be decoded or encoded.
    #[error("{path}: {source}")]
    Tiff {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: tiff::TiffError,
    },

    /// A GeoTIFF decoded but lacks what a raster needs.
    #[error("{path}: {message}")]
    Format {
        /// File involved.
        path: PathBuf,
        /// What is missing or malformed.
        message: String,
    },

    /// A project or manifest file is not valid JSON.
    #[error("{path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// An output exists and the existing-output policy is `fail`.
    #[error("output already exists: {0}")]
    AlreadyExists(PathBuf),

    /// A stage finished without writing one of its declared outputs.
    #[error("stage did not produce {0}")]
    MissingOutput(PathBuf),

    /// A stage needs a project input that is not configured.
    #[error("project input {0:?} is not configured")]
    MissingInput(&'static str),

    /// A quicklook image could not be encoded.
    #[error("preview encoding failed: {0}")]
    Preview(#[from] image::ImageError),
}

impl StageError {
    /// Whether this error stems from invalid configuration rather than
    /// from data or the filesystem.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        match self {
            Self::Pipeline(e) => e.is_config(),
            Self::MissingInput(_) | Self::AlreadyExists(_) => true,
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
