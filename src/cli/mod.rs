//! Command-line parsing for the covariance engine.
//!
//! Parsing lives here; dispatch lives in [`crate::app`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::mixing::Geometry;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "lsscov", version, about = "Covariance matrices for tomographic large-scale-structure observables")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compute the covariance described by a config file and write it out.
    Run(RunArgs),
    /// Validate a config file and print the covariance layout without computing it.
    Check(CheckArgs),
    /// Write a synthetic point catalog for the survey-geometry correction.
    MockCatalog(MockCatalogArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct RunArgs {
    /// JSON run configuration.
    #[arg(short, long, value_name = "JSON")]
    pub config: PathBuf,

    /// Worker threads (overrides the config and LSSCOV_NUM_CORES).
    #[arg(long)]
    pub cores: Option<usize>,

    /// Output directory (overrides the config and LSSCOV_OUTPUT_DIR).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Compute eigenvalues and report negative ones.
    #[arg(long)]
    pub check_psd: bool,

    /// Also write the angular spectra.
    #[arg(long)]
    pub cells: bool,
}

#[derive(Debug, Parser, Clone)]
pub struct CheckArgs {
    /// JSON run configuration.
    #[arg(short, long, value_name = "JSON")]
    pub config: PathBuf,
}

#[derive(Debug, Parser, Clone)]
pub struct MockCatalogArgs {
    /// CSV file to write.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of points.
    #[arg(short = 'n', long, default_value_t = 20_000)]
    pub points: usize,

    /// Tomographic bins.
    #[arg(long, default_value_t = 2)]
    pub bins: usize,

    /// Sky model of the coordinates.
    #[arg(long, value_enum, default_value_t = Geometry::Spherical)]
    pub geometry: Geometry,

    /// Longitude (x) range, degrees.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], default_values_t = [0.0, 10.0])]
    pub x_range: Vec<f64>,

    /// Latitude (y) range, degrees.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], default_values_t = [-5.0, 5.0])]
    pub y_range: Vec<f64>,

    /// Circular holes cut out of the footprint.
    #[arg(long, default_value_t = 0)]
    pub holes: usize,

    /// Hole radius, degrees.
    #[arg(long, default_value_t = 0.5)]
    pub hole_radius: f64,

    /// Relative scatter of the weights.
    #[arg(long, default_value_t = 0.0)]
    pub weight_scatter: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::parse_from(["lsscov", "run", "-c", "cov.json", "--cores", "4", "--check-psd"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from("cov.json"));
        assert_eq!(args.cores, Some(4));
        assert!(args.check_psd);
        assert!(args.output.is_none());
    }

    #[test]
    fn mock_catalog_ranges_take_two_values() {
        let cli = Cli::parse_from(["lsscov", "mock-catalog", "-o", "cat.csv", "--x-range", "1", "3", "--geometry", "flat"]);
        let Command::MockCatalog(args) = cli.command else {
            panic!("expected mock-catalog");
        };
        assert_eq!(args.x_range, vec![1.0, 3.0]);
        assert_eq!(args.y_range, vec![-5.0, 5.0]);
        assert_eq!(args.geometry, Geometry::Flat);
    }
}
