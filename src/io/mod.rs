//! Input/output helpers.
//!
//! - numeric tables: n(z), mask spectra, COSEBI and band-power windows (`tables`)
//! - point catalogs for the survey-geometry term (`catalog`)
//! - covariance, spectra and run-summary exports (`export`)

pub mod catalog;
pub mod export;
pub mod tables;

pub use catalog::{CatalogColumns, CatalogPoint, PointCatalog, read_catalog, write_catalog};
pub use export::{ExportOptions, RunSummary, SegmentSummary, write_outputs};
pub use tables::{read_columns, read_nz, read_table};
