//! floodline-io: files, stage memoization and project workspaces.
//!
//! Reads and writes single-band GeoTIFFs and GeoJSON feature files,
//! runs the pipeline stages against an on-disk workspace with
//! skip-if-exists memoization and atomic output commits, and loads the
//! JSON project file that ties inputs, outputs and parameters together.

pub mod error;
pub mod geotiff;
pub mod preview;
pub mod project;
pub mod runner;
pub mod stage;
pub mod workflow;

pub use error::StageError;
pub use geotiff::{GeoTiffMetadata, read_geotiff, write_geotiff};
pub use project::{ProjectConfig, Workspace};
pub use runner::{ExistingOutputs, StageOutcome, StageRunner};
pub use stage::StageId;
pub use workflow::Workflow;
