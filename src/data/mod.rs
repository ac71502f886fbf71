//! Synthetic data for experiments and tests.

pub mod synthetic;

pub use synthetic::{MockCatalogSpec, mock_catalog, mock_nz};
